//! `casual-queue` — the resource-manager process for one domain's
//! queue groups (§4.5): opens every `queuebase` the domain declares,
//! serves `enqueue`/`dequeue`/`peek`/`forget` over the admin FIFO, and
//! answers the two-phase `resource.*` protocol a transaction
//! coordinator drives. One process owns every configured group, since
//! `casual`'s `queue`/`transaction` nouns address a single `queue`
//! admin endpoint (§6).
//!
//! Configured queue/service forwards run on a dedicated OS thread with
//! its own small Tokio runtime: a service forward's call to
//! `casual-servicemanager` is a blocking round trip by design (§4.5),
//! and this process's admin loop must keep answering requests while a
//! forward waits on one.

use anyhow::{Context, Result};
use casual_core::dispatch::HandlerTable;
use casual_core::domain::config::{Model, QueueGroupConfig};
use casual_core::error::Error as CoreError;
use casual_core::ids::{CorrelationId, ExecutionId, IpcId, ProcessHandle, Trid};
use casual_core::queue::{DequeueOutcome, MessageRow, QueueForward, QueueGroup, Selector, ServiceCaller, ServiceForward};
use casual_core::transport::fifo::{send_once, FifoDevice};
use casual_core::transport::pump::Pump;
use casual_core::transport::{Device, Envelope};
use casual_core::wire::{self, message_type};
use clap::Parser;
use serde::Serialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{info, warn};

type CoreResult<T> = std::result::Result<T, CoreError>;

#[derive(Parser, Debug)]
#[command(author, version, about = "Serve a domain's queue groups as XA resources")]
struct Args {
    /// Root directory of the domain. Defaults to `$CASUAL_DOMAIN_HOME`.
    #[arg(long)]
    domain_home: Option<PathBuf>,

    /// Path to the domain's YAML configuration.
    #[arg(long)]
    config: PathBuf,
}

/// Every queue group this process owns, plus the index from queue name
/// to owning group name — wire requests carry only a queue name, never
/// a group name, since a domain's queues are addressed by a single flat
/// namespace (§4.5).
struct Groups {
    by_name: HashMap<String, QueueGroup>,
    owner: HashMap<String, String>,
}

impl Groups {
    fn open(model: &Model, home: &Path) -> Result<Self> {
        let mut by_name = HashMap::new();
        let mut owner = HashMap::new();
        for group_cfg in &model.queue.groups {
            let queuebase = if group_cfg.queuebase.is_absolute() {
                group_cfg.queuebase.clone()
            } else {
                home.join(&group_cfg.queuebase)
            };
            let group = QueueGroup::open(&queuebase)
                .with_context(|| format!("opening queuebase for group {}", group_cfg.name))?;
            for queue_cfg in &group_cfg.queues {
                group
                    .declare_queue(
                        &queue_cfg.name,
                        queue_cfg.retry_count,
                        Duration::from_secs(queue_cfg.retry_delay_seconds),
                        queue_cfg.error_queue.as_deref(),
                    )
                    .with_context(|| format!("declaring queue {}", queue_cfg.name))?;
                if let Some(existing) = owner.insert(queue_cfg.name.clone(), group_cfg.name.clone()) {
                    anyhow::bail!(
                        "queue {} declared in both group {existing} and group {}",
                        queue_cfg.name,
                        group_cfg.name
                    );
                }
            }
            by_name.insert(group_cfg.name.clone(), group);
        }
        Ok(Self { by_name, owner })
    }

    fn group_for_queue(&mut self, queue: &str) -> Option<&mut QueueGroup> {
        let name = self.owner.get(queue)?.clone();
        self.by_name.get_mut(&name)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let home = args
        .domain_home
        .or_else(|| std::env::var_os("CASUAL_DOMAIN_HOME").map(PathBuf::from))
        .context("no domain home given; pass --domain-home or set CASUAL_DOMAIN_HOME")?;

    let _log_guard = casual_core::logging::init("queue", &home.join("log"))?;

    let text = std::fs::read_to_string(&args.config)
        .with_context(|| format!("reading domain configuration {}", args.config.display()))?;
    let model = Model::from_yaml(&text).context("parsing domain configuration")?;

    let groups = Arc::new(Mutex::new(Groups::open(&model, &home)?));
    info!(groups = model.queue.groups.len(), "queue groups opened");

    let own_ipc_id = IpcId::new();
    casual_core::cli::publish_admin_id(&home, "queue", own_ipc_id)?;
    let device = FifoDevice::bind(&home.join("ipc"), own_ipc_id, IpcId::nil())?;
    let ipc_dir = home.join("ipc");

    spawn_forwards(model.queue.groups.clone(), groups.clone(), home.clone());

    let mut table = HandlerTable::new();

    {
        let groups = groups.clone();
        let ipc_dir = ipc_dir.clone();
        table.on(
            message_type::QUEUE_ENQUEUE_REQUEST,
            Box::new(move |envelope| {
                let request: wire::EnqueueRequest = wire::decode(&envelope.payload)?;
                let mut locked = groups.lock().unwrap();
                let id = match locked.group_for_queue(&request.queue) {
                    Some(group) => {
                        let (id, woken) = group.enqueue(
                            &request.queue,
                            &request.trid,
                            &request.message_type,
                            request.correlation,
                            request.reply_queue.as_deref(),
                            &request.properties,
                            &request.payload,
                            request.available_at,
                        )?;
                        drop(locked);
                        deliver_woken(&ipc_dir, woken);
                        id
                    }
                    None => {
                        drop(locked);
                        warn!(queue = %request.queue, "enqueue to undeclared queue");
                        -1
                    }
                };
                reply(&ipc_dir, request.caller.ipc_id, message_type::QUEUE_ENQUEUE_REPLY, &wire::EnqueueReply { id })
            }),
        );
    }

    {
        let groups = groups.clone();
        let ipc_dir = ipc_dir.clone();
        table.on(
            message_type::QUEUE_DEQUEUE_REQUEST,
            Box::new(move |envelope| {
                let request: wire::DequeueRequest = wire::decode(&envelope.payload)?;
                let wire::DequeueRequest { queue, selector, trid, block, caller, correlation } = request;
                let mut locked = groups.lock().unwrap();
                match locked.group_for_queue(&queue) {
                    Some(group) => {
                        let outcome = group.dequeue(&queue, Selector::from(selector), trid, block, caller, correlation)?;
                        drop(locked);
                        match outcome {
                            DequeueOutcome::Immediate(row) => {
                                let message = wire::DequeueReply { correlation, row: row.as_ref().map(Into::into) };
                                reply(&ipc_dir, caller.ipc_id, message_type::QUEUE_DEQUEUE_REPLY, &message)?;
                            }
                            DequeueOutcome::Pending => {
                                info!(%queue, "dequeue registered, waiting for a matching message");
                            }
                        }
                    }
                    None => {
                        drop(locked);
                        warn!(%queue, "dequeue from undeclared queue");
                        let message = wire::DequeueReply { correlation, row: None };
                        reply(&ipc_dir, caller.ipc_id, message_type::QUEUE_DEQUEUE_REPLY, &message)?;
                    }
                }
                Ok(())
            }),
        );
    }

    {
        let groups = groups.clone();
        table.on(
            message_type::QUEUE_FORGET,
            Box::new(move |envelope| {
                let request: wire::Forget = wire::decode(&envelope.payload)?;
                if let Some(group) = groups.lock().unwrap().group_for_queue(&request.queue) {
                    group.forget(&request.queue, request.correlation);
                }
                Ok(())
            }),
        );
    }

    {
        let groups = groups.clone();
        let ipc_dir = ipc_dir.clone();
        table.on(
            message_type::QUEUE_PEEK_REQUEST,
            Box::new(move |envelope| {
                let request: wire::PeekRequest = wire::decode(&envelope.payload)?;
                let rows = match groups.lock().unwrap().group_for_queue(&request.queue) {
                    Some(group) => group.peek(&request.queue)?,
                    None => {
                        warn!(queue = %request.queue, "peek at undeclared queue");
                        Vec::new()
                    }
                };
                let message = wire::PeekReply { rows: rows.iter().map(Into::into).collect() };
                reply(&ipc_dir, request.caller.ipc_id, message_type::QUEUE_PEEK_REPLY, &message)
            }),
        );
    }

    {
        let groups = groups.clone();
        let ipc_dir = ipc_dir.clone();
        table.on(
            message_type::RESOURCE_PREPARE,
            Box::new(move |envelope| {
                let request: wire::ResourceRequest = wire::decode(&envelope.payload)?;
                let locked = groups.lock().unwrap();
                let mut vote = wire::ResourceVote::Ok;
                for (name, group) in locked.by_name.iter() {
                    if let Err(e) = group.prepare(&request.trid) {
                        warn!(group = %name, trid = %request.trid, error = %e, "prepare failed, voting rollback");
                        vote = wire::ResourceVote::Rollback;
                    }
                }
                drop(locked);
                let message = wire::ResourceVoteMessage { trid: request.trid, vote };
                reply(&ipc_dir, request.caller.ipc_id, message_type::RESOURCE_VOTE, &message)
            }),
        );
    }

    {
        let groups = groups.clone();
        let ipc_dir = ipc_dir.clone();
        table.on(
            message_type::RESOURCE_COMMIT,
            Box::new(move |envelope| {
                let request: wire::ResourceRequest = wire::decode(&envelope.payload)?;
                let mut locked = groups.lock().unwrap();
                commit_across_groups(&mut locked, &request.trid, &request.affected_queues, &ipc_dir);
                Ok(())
            }),
        );
    }

    {
        let groups = groups.clone();
        let ipc_dir = ipc_dir.clone();
        table.on(
            message_type::RESOURCE_ROLLBACK,
            Box::new(move |envelope| {
                let request: wire::ResourceRequest = wire::decode(&envelope.payload)?;
                let mut locked = groups.lock().unwrap();
                rollback_across_groups(&mut locked, &request.trid, &ipc_dir);
                Ok(())
            }),
        );
    }

    {
        let groups = groups.clone();
        let ipc_dir = ipc_dir.clone();
        table.on(
            message_type::RESOURCE_VOTE,
            Box::new(move |envelope| {
                let request: wire::ResourceVoteMessage = wire::decode(&envelope.payload)?;
                let mut locked = groups.lock().unwrap();
                match request.vote {
                    wire::ResourceVote::Ok => {
                        let all_queues: Vec<String> = locked.owner.keys().cloned().collect();
                        commit_across_groups(&mut locked, &request.trid, &all_queues, &ipc_dir);
                    }
                    wire::ResourceVote::Rollback => rollback_across_groups(&mut locked, &request.trid, &ipc_dir),
                }
                Ok(())
            }),
        );
    }

    let mut pump = Pump::new();
    pump.register("queue-admin", Box::new(device), Box::new(move |_name, envelope| table.dispatch(envelope)));

    loop {
        pump.run_once().await?;
    }
}

fn reply<T: Serialize>(ipc_dir: &Path, peer: IpcId, message_type: u64, payload: &T) -> CoreResult<()> {
    let bytes = wire::encode(payload)?;
    let envelope = Envelope::new(message_type, ExecutionId::new(), bytes);
    let ipc_dir = ipc_dir.to_path_buf();
    tokio::spawn(async move {
        if let Err(e) = send_once(&ipc_dir, peer, &envelope).await {
            warn!(error = %e, "failed to deliver queue reply");
        }
    });
    Ok(())
}

fn deliver_woken(ipc_dir: &Path, woken: Vec<(ProcessHandle, CorrelationId, MessageRow)>) {
    for (caller, correlation, row) in woken {
        let message = wire::DequeueReply { correlation, row: Some((&row).into()) };
        let _ = reply(ipc_dir, caller.ipc_id, message_type::QUEUE_DEQUEUE_REPLY, &message);
    }
}

/// Commit `trid` on every owned group, scoping each group's wake-up
/// hint to the subset of `affected_queues` it actually owns. Safe to
/// call on a group the transaction never touched — `QueueGroup::commit`
/// only affects rows tagged with a matching `trid`.
fn commit_across_groups(groups: &mut Groups, trid: &Trid, affected_queues: &[String], ipc_dir: &Path) {
    let mut by_group: HashMap<String, Vec<String>> = HashMap::new();
    for queue in affected_queues {
        if let Some(owner) = groups.owner.get(queue) {
            by_group.entry(owner.clone()).or_default().push(queue.clone());
        }
    }
    for (name, group) in groups.by_name.iter_mut() {
        let relevant = by_group.remove(name).unwrap_or_default();
        match group.commit(trid, &relevant) {
            Ok(woken) => deliver_woken(ipc_dir, woken),
            Err(e) => warn!(group = %name, error = %e, "commit failed"),
        }
    }
}

fn rollback_across_groups(groups: &mut Groups, trid: &Trid, ipc_dir: &Path) {
    for (name, group) in groups.by_name.iter_mut() {
        match group.rollback(trid) {
            Ok(woken) => deliver_woken(ipc_dir, woken),
            Err(e) => warn!(group = %name, error = %e, "rollback failed"),
        }
    }
}

/// Drives a `service.call`/`service.reply` round trip over this
/// process's own transport, for [`ServiceForward::step`]. Blocks the
/// calling thread on `rt`, which is never the Tokio runtime driving the
/// admin loop — see [`spawn_forwards`].
struct LiveServiceCaller<'a> {
    rt: &'a tokio::runtime::Runtime,
    ipc_dir: &'a Path,
    servicemanager: IpcId,
}

impl ServiceCaller for LiveServiceCaller<'_> {
    fn call(&mut self, service: &str, payload: &[u8]) -> CoreResult<Vec<u8>> {
        self.rt.block_on(async {
            let own_ipc_id = IpcId::new();
            let mut device = FifoDevice::bind(self.ipc_dir, own_ipc_id, self.servicemanager)?;
            let call = wire::ServiceCall {
                service: service.to_string(),
                execution: ExecutionId::new(),
                trid: Trid::NULL,
                payload: payload.to_vec(),
                caller: ProcessHandle::new(std::process::id(), own_ipc_id),
                correlation: CorrelationId::new(),
            };
            let correlation = call.correlation;
            let envelope = Envelope::new(message_type::SERVICE_CALL, ExecutionId::new(), wire::encode(&call)?);
            device.send(&envelope).await?;
            let reply_envelope = tokio::time::timeout(Duration::from_secs(30), device.receive())
                .await
                .map_err(|_| CoreError::Timeout { correlation })??;
            let reply: wire::ServiceReply = wire::decode(&reply_envelope.payload)?;
            if reply.success {
                Ok(reply.payload)
            } else {
                Err(CoreError::ServiceFail { service: service.to_string(), reason: "callee reported failure".into() })
            }
        })
    }
}

fn read_admin_id(domain_home: &Path, component: &str) -> Result<IpcId> {
    let path = casual_core::cli::admin_id_path(domain_home, component);
    let text = std::fs::read_to_string(&path).with_context(|| format!("reading {} admin endpoint", component))?;
    let uuid = uuid::Uuid::parse_str(text.trim()).context("malformed admin ipc-id")?;
    Ok(IpcId(uuid))
}

/// Runs every configured queue and service forward on its own OS
/// thread with a fresh single-threaded Tokio runtime, round-robining
/// between forwards with a short backoff when none make progress.
/// Grounded on `queue::forward`'s own doc note that a live service
/// caller "sends ... frames over the process's own transport device";
/// a dedicated thread is what lets that blocking round trip coexist
/// with the admin loop's regular request handling.
fn spawn_forwards(config: Vec<QueueGroupConfig>, groups: Arc<Mutex<Groups>>, home: PathBuf) {
    let has_forwards = config.iter().any(|g| !g.forward.queues.is_empty() || !g.forward.services.is_empty());
    if !has_forwards {
        return;
    }

    std::thread::Builder::new()
        .name("queue-forwards".into())
        .spawn(move || {
            let rt = match tokio::runtime::Builder::new_current_thread().enable_all().build() {
                Ok(rt) => rt,
                Err(e) => {
                    warn!(error = %e, "failed to start forward runtime, forwards disabled");
                    return;
                }
            };
            let ipc_dir = home.join("ipc");
            let servicemanager = match read_admin_id(&home, "servicemanager") {
                Ok(id) => id,
                Err(e) => {
                    warn!(error = %e, "servicemanager admin endpoint not yet published, service forwards disabled");
                    IpcId::nil()
                }
            };

            let mut queue_forwards = Vec::new();
            let mut service_forwards = Vec::new();
            for group_cfg in &config {
                for qf in &group_cfg.forward.queues {
                    for _ in 0..qf.instances.max(1) {
                        queue_forwards.push((
                            group_cfg.name.clone(),
                            QueueForward::new(qf.source.clone(), qf.target_queue.clone(), Duration::from_secs(qf.target_delay_seconds)),
                        ));
                    }
                }
                for sf in &group_cfg.forward.services {
                    for _ in 0..sf.instances.max(1) {
                        service_forwards.push((
                            group_cfg.name.clone(),
                            ServiceForward::new(sf.source.clone(), sf.target_service.clone(), sf.reply_queue.clone()),
                        ));
                    }
                }
            }

            let mut caller = LiveServiceCaller { rt: &rt, ipc_dir: &ipc_dir, servicemanager };

            loop {
                let mut did_work = false;
                for (group_name, forward) in &queue_forwards {
                    let mut locked = groups.lock().unwrap();
                    if let Some(group) = locked.by_name.get_mut(group_name) {
                        match forward.step(group) {
                            Ok(moved) => did_work |= moved,
                            Err(e) => warn!(group = %group_name, error = %e, "queue forward step failed"),
                        }
                    }
                }
                for (group_name, forward) in &service_forwards {
                    let mut locked = groups.lock().unwrap();
                    if let Some(group) = locked.by_name.get_mut(group_name) {
                        match forward.step(group, &mut caller) {
                            Ok(moved) => did_work |= moved,
                            Err(e) => warn!(group = %group_name, error = %e, "service forward step failed"),
                        }
                    }
                }
                if !did_work {
                    std::thread::sleep(Duration::from_millis(50));
                }
            }
        })
        .expect("spawning forward thread");
}
