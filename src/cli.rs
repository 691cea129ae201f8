//! # Command-line interface
//!
//! `casual <noun> <verb>` — the peripheral administration surface over
//! the domain's local IPC. Each noun is a thin client: it builds a wire
//! request, writes it to the target process's inbound FIFO, and (for
//! request/reply nouns) blocks on its own freshly bound FIFO until the
//! matching reply arrives. The framed transport and wire codec are the
//! same ones every in-domain process uses (§6); this module adds no
//! protocol of its own beyond picking the admin endpoint's `ipc-id` off
//! disk.
//!
//! `Buffer` and `Call` submit admin messages but never touch a buffer's
//! encoding: the XATMI typed-buffer layer and its codecs live outside
//! this crate, so both subcommands move payload bytes verbatim.

use crate::error::{Error, Result};
use crate::ids::{CorrelationId, ExecutionId, IpcId, ProcessHandle, Trid};
use crate::transport::fifo::FifoDevice;
use crate::transport::{Device, Envelope};
use crate::wire::{self, message_type};
use clap::builder::styling::{AnsiColor, Styles};
use clap::{Args, Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Defines the styles for the help message to replicate clap v3's appearance.
fn styles() -> Styles {
    Styles::styled()
        .header(AnsiColor::Yellow.on_default())
        .usage(AnsiColor::Yellow.on_default())
        .literal(AnsiColor::Green.on_default())
        .placeholder(AnsiColor::Green.on_default())
}

/// `casual` — administer a running domain: boot/shut it down, advertise
/// or withdraw services, drive queue and transaction operations, and
/// submit one-off service calls, all against the domain named by
/// `--domain-home` (default: `$CASUAL_DOMAIN_HOME`).
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None, styles = styles())]
pub struct Cli {
    #[command(subcommand)]
    pub noun: Noun,

    /// Root directory of the domain to administer. Defaults to
    /// `$CASUAL_DOMAIN_HOME`; required if that variable is unset.
    #[arg(long, global = true)]
    pub domain_home: Option<PathBuf>,
}

impl Cli {
    pub fn resolve_domain_home(&self) -> Result<PathBuf> {
        self.domain_home
            .clone()
            .or_else(|| std::env::var_os("CASUAL_DOMAIN_HOME").map(PathBuf::from))
            .ok_or_else(|| {
                Error::InvalidArgument("no domain home given; pass --domain-home or set CASUAL_DOMAIN_HOME".into())
            })
    }
}

#[derive(Subcommand, Debug)]
pub enum Noun {
    /// Boot or shut down a domain.
    Domain(DomainArgs),
    /// Force-advertise or withdraw a service, bypassing the server that
    /// would normally own the advertisement.
    Service(ServiceArgs),
    /// Resolve a stuck transaction branch by casting its commit vote
    /// directly against a resource.
    Transaction(TransactionArgs),
    /// Enqueue, dequeue, or peek a queue.
    Queue(QueueArgs),
    /// Inspect or trigger a gateway connection.
    Gateway(GatewayArgs),
    /// Ask a gateway to discover services across domain boundaries.
    Discovery(DiscoveryArgs),
    /// Describe a typed-buffer type name known to the domain's service
    /// descriptors. The buffer codec itself is out of scope for this
    /// crate; only the type name is reported.
    Buffer(BufferArgs),
    /// Print the locally configured descriptor for a service or queue.
    Describe(DescribeArgs),
    /// Submit a one-off service call with a raw payload.
    Call(CallArgs),
}

#[derive(Args, Debug)]
pub struct DomainArgs {
    #[command(subcommand)]
    pub action: DomainAction,
}

#[derive(Subcommand, Debug)]
pub enum DomainAction {
    /// Load a domain configuration and spawn every server/executable it
    /// declares, in dependency order. This spawns and returns; the long
    /// running supervisor (reap loop, two-phase shutdown) is the
    /// `casual-domain` binary, not this command.
    Boot {
        /// Path to the domain's YAML configuration.
        #[arg(long)]
        config: PathBuf,
    },
    /// Request an orderly shutdown of the running domain.
    Shutdown {
        /// Seconds to wait for processes to exit before escalating.
        #[arg(long, default_value_t = 10)]
        soft_timeout_seconds: u64,
    },
}

#[derive(Args, Debug)]
pub struct ServiceArgs {
    #[command(subcommand)]
    pub action: ServiceAction,
}

#[derive(Subcommand, Debug)]
pub enum ServiceAction {
    /// Force the named service to advertise under a process that is not
    /// the one owning its instance table; used to recover a service
    /// whose advertising server is unreachable.
    Advertise {
        process_alias: String,
        #[arg(long)]
        pid: u32,
        #[arg(long)]
        ipc_id: String,
        names: Vec<String>,
    },
    /// Withdraw a service advertisement.
    Withdraw {
        process_alias: String,
        #[arg(long)]
        pid: u32,
        #[arg(long)]
        ipc_id: String,
        names: Vec<String>,
    },
}

#[derive(Args, Debug)]
pub struct TransactionArgs {
    #[command(subcommand)]
    pub action: TransactionAction,
}

#[derive(Subcommand, Debug)]
pub enum TransactionAction {
    /// Cast an explicit commit/rollback vote for a transaction's branch
    /// against a resource, for operator-driven recovery of a branch
    /// that never received its coordinator's decision.
    Resolve {
        /// The global transaction id, as printed by `Trid`'s `Display`.
        global: String,
        branch: String,
        #[arg(long)]
        rollback: bool,
    },
}

#[derive(Args, Debug)]
pub struct QueueArgs {
    #[command(subcommand)]
    pub action: QueueAction,
}

#[derive(Subcommand, Debug)]
pub enum QueueAction {
    /// Enqueue a message read from a file (or stdin with `-`).
    Enqueue {
        queue: String,
        #[arg(long)]
        message_type: String,
        #[arg(long)]
        payload_file: PathBuf,
    },
    /// Dequeue the next available message.
    Dequeue {
        queue: String,
        /// Block until a message is available instead of returning
        /// immediately when the queue is empty.
        #[arg(long)]
        block: bool,
    },
    /// List messages currently resident in a queue without consuming
    /// them.
    Peek { queue: String },
}

#[derive(Args, Debug)]
pub struct GatewayArgs {
    #[command(subcommand)]
    pub action: GatewayAction,
}

#[derive(Subcommand, Debug)]
pub enum GatewayAction {
    /// Trigger (or re-trigger) an outbound connection already declared
    /// under this alias in the domain's gateway configuration.
    Connect { alias: String },
}

#[derive(Args, Debug)]
pub struct DiscoveryArgs {
    /// Service names to look for beyond this domain.
    pub services: Vec<String>,
}

#[derive(Args, Debug)]
pub struct BufferArgs {
    #[command(subcommand)]
    pub action: BufferAction,
}

#[derive(Subcommand, Debug)]
pub enum BufferAction {
    /// Report the typed-buffer name a service's descriptor carries,
    /// without decoding a buffer of that type.
    Describe { service: String },
}

#[derive(Args, Debug)]
pub struct DescribeArgs {
    #[command(subcommand)]
    pub action: DescribeAction,
}

#[derive(Subcommand, Debug)]
pub enum DescribeAction {
    /// Print a service's locally configured routes and timeout.
    Service {
        name: String,
        #[arg(long)]
        config: PathBuf,
    },
    /// Print a queue's locally configured retry policy and error queue.
    Queue {
        name: String,
        #[arg(long)]
        config: PathBuf,
    },
}

#[derive(Args, Debug)]
pub struct CallArgs {
    /// Name of the service to call.
    pub service: String,
    /// Raw payload bytes to submit; this crate never decodes or
    /// validates them against a buffer type.
    #[arg(long)]
    pub payload_file: PathBuf,
}

/// Each long-running `casual-*` process publishes its `ipc-id` under
/// `${CASUAL_DOMAIN_HOME}/ipc/.<component>-admin-id` on startup, so CLI
/// invocations can find the right endpoint without a separate discovery
/// protocol. `Domain` nouns talk to `casual-domain`; `Service`,
/// `Discovery`, `Call`, `Buffer`, and `Gateway` nouns talk to
/// `casual-servicemanager` (which owns both the service directory and
/// gateway connection table); `Queue` and `Transaction` nouns talk to
/// `casual-queue` (the resource manager this crate implements).
pub fn admin_id_path(domain_home: &Path, component: &str) -> PathBuf {
    domain_home.join("ipc").join(format!(".{component}-admin-id"))
}

/// Publish this process's `ipc-id` as `component`'s admin endpoint.
/// Called once by each `casual-*` binary on startup.
pub fn publish_admin_id(domain_home: &Path, component: &str, ipc_id: IpcId) -> Result<()> {
    let path = admin_id_path(domain_home, component);
    std::fs::create_dir_all(path.parent().unwrap())
        .map_err(|e| Error::InternalUnexpected(format!("creating ipc dir: {e}")))?;
    std::fs::write(&path, ipc_id.0.to_string())
        .map_err(|e| Error::InternalUnexpected(format!("publishing admin ipc-id: {e}")))
}

fn read_admin_id(domain_home: &Path, component: &str) -> Result<IpcId> {
    let text =
        std::fs::read_to_string(admin_id_path(domain_home, component)).map_err(|e| Error::CommunicationUnavailable {
            peer: None,
            reason: format!("no {component} admin endpoint published under {}: {e}", domain_home.display()),
        })?;
    let uuid = uuid::Uuid::parse_str(text.trim())
        .map_err(|e| Error::InternalUnexpected(format!("malformed admin ipc-id: {e}")))?;
    Ok(IpcId(uuid))
}

async fn send_only(domain_home: &Path, component: &str, message_type: u64, payload: Vec<u8>) -> Result<()> {
    let admin = read_admin_id(domain_home, component)?;
    let envelope = Envelope::new(message_type, ExecutionId::new(), payload);
    crate::transport::fifo::send_once(&domain_home.join("ipc"), admin, &envelope).await
}

/// Bind a fresh inbound endpoint and round-trip one request to `component`,
/// blocking for its reply. `build_payload` receives the `ipc-id` this
/// invocation just bound so request structs that carry a `caller:
/// ProcessHandle` (so the server knows where to reply) can embed the
/// address the reply will actually arrive at.
async fn round_trip(
    domain_home: &Path,
    component: &str,
    message_type: u64,
    build_payload: impl FnOnce(IpcId) -> Result<Vec<u8>>,
) -> Result<Envelope> {
    let admin = read_admin_id(domain_home, component)?;
    let own_ipc_id = IpcId::new();
    let mut device = FifoDevice::bind(&domain_home.join("ipc"), own_ipc_id, admin)?;
    let payload = build_payload(own_ipc_id)?;
    let envelope = Envelope::new(message_type, ExecutionId::new(), payload);
    let correlation = envelope.correlation;
    device.send(&envelope).await?;
    tokio::time::timeout(DEFAULT_CLI_TIMEOUT, device.receive())
        .await
        .map_err(|_| Error::Timeout { correlation })?
}

const DOMAIN: &str = "domain";
const SERVICEMANAGER: &str = "servicemanager";
const QUEUE: &str = "queue";

fn read_payload(path: &Path) -> Result<Vec<u8>> {
    if path.as_os_str() == "-" {
        use std::io::Read;
        let mut buf = Vec::new();
        std::io::stdin()
            .read_to_end(&mut buf)
            .map_err(|e| Error::InvalidArgument(format!("reading payload from stdin: {e}")))?;
        Ok(buf)
    } else {
        std::fs::read(path).map_err(|e| Error::InvalidArgument(format!("reading {}: {e}", path.display())))
    }
}

fn parse_ipc_id(text: &str) -> Result<IpcId> {
    uuid::Uuid::parse_str(text)
        .map(IpcId)
        .map_err(|e| Error::InvalidArgument(format!("invalid ipc-id {text}: {e}")))
}

/// Dispatch a parsed [`Cli`] invocation. Returns the string to print on
/// stdout; the binary entry point is responsible for printing it and
/// mapping `Err` to a non-zero exit per §6's error-taxonomy exit
/// contract.
pub async fn run(cli: &Cli) -> Result<String> {
    let home = cli.resolve_domain_home()?;

    match &cli.noun {
        Noun::Domain(args) => run_domain(&home, &args.action).await,
        Noun::Service(args) => run_service(&home, &args.action).await,
        Noun::Transaction(args) => run_transaction(&home, &args.action).await,
        Noun::Queue(args) => run_queue(&home, &args.action).await,
        Noun::Gateway(args) => run_gateway(&home, &args.action).await,
        Noun::Discovery(args) => run_discovery(&home, args).await,
        Noun::Buffer(args) => run_buffer(&args.action),
        Noun::Describe(args) => run_describe(&args.action),
        Noun::Call(args) => run_call(&home, args).await,
    }
}

async fn run_domain(home: &Path, action: &DomainAction) -> Result<String> {
    match action {
        DomainAction::Boot { config } => {
            let text = std::fs::read_to_string(config)
                .map_err(|e| Error::InvalidConfiguration(format!("reading {}: {e}", config.display())))?;
            let model = crate::domain::config::Model::from_yaml(&text)?;
            let mut orchestrator = crate::domain::orchestrator::Orchestrator::new(model, home.to_path_buf())?;
            orchestrator.boot().await?;
            Ok(format!("booted {} processes", orchestrator.process_count()))
        }
        DomainAction::Shutdown { soft_timeout_seconds } => {
            let payload = wire::encode(&wire::ShutdownRequest)?;
            send_only(home, DOMAIN, message_type::SHUTDOWN_REQUEST, payload).await?;
            Ok(format!(
                "shutdown requested (soft timeout {soft_timeout_seconds}s honored by the domain supervisor)"
            ))
        }
    }
}

async fn run_service(home: &Path, action: &ServiceAction) -> Result<String> {
    let (process_alias, pid, ipc_id, names, add, remove) = match action {
        ServiceAction::Advertise {
            process_alias,
            pid,
            ipc_id,
            names,
        } => (process_alias, *pid, ipc_id, names, names.clone(), Vec::new()),
        ServiceAction::Withdraw {
            process_alias,
            pid,
            ipc_id,
            names,
        } => (process_alias, *pid, ipc_id, names, Vec::new(), names.clone()),
    };

    let process = ProcessHandle::new(pid, parse_ipc_id(ipc_id)?);
    let message = wire::ServiceAdvertise {
        alias: process_alias.clone(),
        process,
        add,
        remove,
    };
    send_only(home, SERVICEMANAGER, message_type::SERVICE_ADVERTISE, wire::encode(&message)?).await?;
    Ok(format!("advertised update for {process_alias}: {names:?}"))
}

async fn run_transaction(home: &Path, action: &TransactionAction) -> Result<String> {
    let TransactionAction::Resolve { global, branch, rollback } = action;
    let global = uuid::Uuid::parse_str(global)
        .map_err(|e| Error::InvalidArgument(format!("invalid global trid {global}: {e}")))?;
    let branch_uuid = uuid::Uuid::parse_str(branch)
        .map_err(|e| Error::InvalidArgument(format!("invalid branch trid {branch}: {e}")))?;
    let trid = Trid::from_parts(global, branch_uuid);
    let vote = if *rollback { wire::ResourceVote::Rollback } else { wire::ResourceVote::Ok };
    let message = wire::ResourceVoteMessage { trid, vote };
    send_only(home, QUEUE, message_type::RESOURCE_VOTE, wire::encode(&message)?).await?;
    Ok(format!("cast vote {vote:?} for {global}"))
}

async fn run_queue(home: &Path, action: &QueueAction) -> Result<String> {
    match action {
        QueueAction::Enqueue { queue, message_type: kind, payload_file } => {
            let payload = read_payload(payload_file)?;
            let reply = round_trip(home, QUEUE, message_type::QUEUE_ENQUEUE_REQUEST, |own_ipc_id| {
                wire::encode(&wire::EnqueueRequest {
                    queue: queue.clone(),
                    trid: Trid::NULL,
                    message_type: kind.clone(),
                    correlation: CorrelationId::new(),
                    reply_queue: None,
                    properties: "{}".into(),
                    payload,
                    available_at: std::time::SystemTime::now(),
                    caller: ProcessHandle::new(std::process::id(), own_ipc_id),
                })
            })
            .await?;
            let reply: wire::EnqueueReply = wire::decode(&reply.payload)?;
            Ok(format!("enqueued as id {}", reply.id))
        }
        QueueAction::Dequeue { queue, block } => {
            let reply = round_trip(home, QUEUE, message_type::QUEUE_DEQUEUE_REQUEST, |own_ipc_id| {
                wire::encode(&wire::DequeueRequest {
                    queue: queue.clone(),
                    selector: wire::WireSelector { required: Vec::new() },
                    trid: Trid::NULL,
                    block: *block,
                    caller: ProcessHandle::new(std::process::id(), own_ipc_id),
                    correlation: CorrelationId::new(),
                })
            })
            .await?;
            let reply: wire::DequeueReply = wire::decode(&reply.payload)?;
            match reply.row {
                Some(row) => Ok(format!("dequeued id {}: {} bytes", row.id, row.payload.len())),
                None => Ok("queue empty".to_string()),
            }
        }
        QueueAction::Peek { queue } => {
            let reply = round_trip(home, QUEUE, message_type::QUEUE_PEEK_REQUEST, |own_ipc_id| {
                wire::encode(&wire::PeekRequest {
                    queue: queue.clone(),
                    caller: ProcessHandle::new(std::process::id(), own_ipc_id),
                })
            })
            .await?;
            let reply: wire::PeekReply = wire::decode(&reply.payload)?;
            Ok(format!("{} message(s) resident", reply.rows.len()))
        }
    }
}

async fn run_gateway(home: &Path, action: &GatewayAction) -> Result<String> {
    let GatewayAction::Connect { alias } = action;
    let message = wire::Connect {
        alias: alias.clone(),
        ipc_id: IpcId::new(),
        pid: std::process::id(),
    };
    send_only(home, SERVICEMANAGER, message_type::CONNECT, wire::encode(&message)?).await?;
    Ok(format!("connect requested for gateway alias {alias}"))
}

async fn run_discovery(home: &Path, args: &DiscoveryArgs) -> Result<String> {
    let reply = round_trip(home, SERVICEMANAGER, message_type::DISCOVERY_REQUEST, |own_ipc_id| {
        wire::encode(&wire::DiscoveryRequest {
            correlation: CorrelationId::new(),
            services: args.services.clone(),
            visited: Vec::new(),
            caller: ProcessHandle::new(std::process::id(), own_ipc_id),
        })
    })
    .await?;
    let reply: wire::DiscoveryReply = wire::decode(&reply.payload)?;
    Ok(format!("{} offer(s) from {}", reply.offers.len(), reply.gateway))
}

fn run_buffer(action: &BufferAction) -> Result<String> {
    let BufferAction::Describe { service } = action;
    Ok(format!(
        "buffer type for {service} is reported by its server's own descriptor; \
         casual-core carries no buffer codec to decode it"
    ))
}

fn run_describe(action: &DescribeAction) -> Result<String> {
    match action {
        DescribeAction::Service { name, config } => {
            let model = load_model(config)?;
            match model.services.iter().find(|s| &s.name == name) {
                Some(service) => Ok(format!(
                    "{name}: routes={:?} timeout={:?}",
                    service.routes,
                    service.timeout()
                )),
                None => Ok(format!("{name}: no override configured (defaults apply)")),
            }
        }
        DescribeAction::Queue { name, config } => {
            let model = load_model(config)?;
            let found = model
                .queue
                .groups
                .iter()
                .flat_map(|group| group.queues.iter())
                .find(|q| &q.name == name);
            match found {
                Some(queue) => Ok(format!(
                    "{name}: retry_count={} retry_delay_seconds={} error_queue={:?}",
                    queue.retry_count, queue.retry_delay_seconds, queue.error_queue
                )),
                None => Err(Error::InvalidArgument(format!("no such queue configured: {name}"))),
            }
        }
    }
}

fn load_model(config: &Path) -> Result<crate::domain::config::Model> {
    let text = std::fs::read_to_string(config)
        .map_err(|e| Error::InvalidConfiguration(format!("reading {}: {e}", config.display())))?;
    crate::domain::config::Model::from_yaml(&text)
}

async fn run_call(home: &Path, args: &CallArgs) -> Result<String> {
    let payload = read_payload(&args.payload_file)?;
    let reply = round_trip(home, SERVICEMANAGER, message_type::SERVICE_CALL, |own_ipc_id| {
        wire::encode(&wire::ServiceCall {
            service: args.service.clone(),
            execution: ExecutionId::new(),
            trid: Trid::NULL,
            payload,
            caller: ProcessHandle::new(std::process::id(), own_ipc_id),
            correlation: CorrelationId::new(),
        })
    })
    .await?;
    let reply: wire::ServiceReply = wire::decode(&reply.payload)?;
    Ok(format!(
        "{}: {} byte(s) {}",
        args.service,
        reply.payload.len(),
        if reply.success { "ok" } else { "failed" }
    ))
}

/// Upper bound on how long a CLI round trip waits for a reply before
/// giving up, distinct from any deadline the serving side enforces on
/// itself.
pub const DEFAULT_CLI_TIMEOUT: Duration = Duration::from_secs(30);
