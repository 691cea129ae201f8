//! `casual-gateway` — connects this domain to peer domains over TCP
//! (§4.6): advertises the services a configured peer grants us as
//! concurrent instances routed through this process, relays individual
//! `service.call`/`service.reply` exchanges and `discovery.request` fan-
//! out across the wire, and accepts inbound connections for the
//! services/queues this domain exposes outward.
//!
//! Every cross-domain exchange is a fresh, one-shot TCP connection —
//! connect (or accept), exchange exactly one request/reply pair, drop —
//! mirroring the FIFO transport's own `send_once`/round-trip idiom
//! (§6) rather than holding a pool of long-lived peer sockets. This
//! keeps the gateway's local admin surface to a single registered
//! device (its own FIFO); every TCP socket is scoped to one exchange's
//! `tokio::spawn`ed task.

use anyhow::{Context, Result};
use casual_core::dispatch::HandlerTable;
use casual_core::domain::config::{ConnectDirection, Model};
use casual_core::error::Error as CoreError;
use casual_core::ids::{CorrelationId, ExecutionId, IpcId, ProcessHandle};
use casual_core::transport::fifo::{send_once, FifoDevice};
use casual_core::transport::pump::Pump;
use casual_core::transport::tcp::{PeerIdentity, TcpDevice};
use casual_core::transport::{Device, Envelope};
use casual_core::wire::{self, message_type};
use casual_core::DomainId;
use clap::Parser;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{info, warn};

type CoreResult<T> = std::result::Result<T, CoreError>;

#[derive(Parser, Debug)]
#[command(author, version, about = "Connect this domain to peer domains over TCP")]
struct Args {
    /// Root directory of the domain. Defaults to `$CASUAL_DOMAIN_HOME`.
    #[arg(long)]
    domain_home: Option<PathBuf>,

    /// Path to the domain's YAML configuration.
    #[arg(long)]
    config: PathBuf,

    /// Name this domain announces in the TCP handshake. Purely
    /// descriptive; carries no routing meaning.
    #[arg(long, default_value = "casual-domain")]
    domain_name: String,
}

/// What an outbound connection to one peer address grants us: the
/// services it advertises we may call.
#[derive(Clone)]
struct OutboundPeer {
    address: SocketAddr,
    services: Vec<String>,
}

/// Everything learned from configuration at startup: which peer to
/// dial for a given service name, and the full outbound peer list for
/// discovery fan-out.
struct Routing {
    service_to_peer: HashMap<String, SocketAddr>,
    outbound_peers: Vec<OutboundPeer>,
}

impl Routing {
    fn from_model(model: &Model) -> Self {
        let mut service_to_peer = HashMap::new();
        let mut outbound_peers = Vec::new();
        for group in &model.gateway.outbound {
            for connection in &group.connections {
                if connection.direction == ConnectDirection::Reversed {
                    warn!(address = %connection.address, "reversed outbound connections are not supported, skipping");
                    continue;
                }
                let Ok(address) = connection.address.parse::<SocketAddr>() else {
                    warn!(address = %connection.address, "unparseable outbound peer address, skipping");
                    continue;
                };
                for service in &connection.services {
                    service_to_peer.insert(service.clone(), address);
                }
                outbound_peers.push(OutboundPeer { address, services: connection.services.clone() });
            }
        }
        Self { service_to_peer, outbound_peers }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let home = args
        .domain_home
        .or_else(|| std::env::var_os("CASUAL_DOMAIN_HOME").map(PathBuf::from))
        .context("no domain home given; pass --domain-home or set CASUAL_DOMAIN_HOME")?;

    let _log_guard = casual_core::logging::init("gateway", &home.join("log"))?;

    let text = std::fs::read_to_string(&args.config)
        .with_context(|| format!("reading domain configuration {}", args.config.display()))?;
    let model = Model::from_yaml(&text).context("parsing domain configuration")?;

    let own_identity = Arc::new(PeerIdentity::this_domain(DomainId::new(), args.domain_name.clone()));
    let routing = Arc::new(Routing::from_model(&model));

    let own_ipc_id = IpcId::new();
    casual_core::cli::publish_admin_id(&home, "gateway", own_ipc_id)?;
    let device = FifoDevice::bind(&home.join("ipc"), own_ipc_id, IpcId::nil())?;
    let ipc_dir = home.join("ipc");
    let self_handle = ProcessHandle::new(std::process::id(), own_ipc_id);

    advertise_outbound_services(&ipc_dir, &home, self_handle, &routing)?;
    spawn_inbound_listeners(model, own_identity.clone(), home.clone(), own_ipc_id);

    let mut table = HandlerTable::new();

    {
        let routing = routing.clone();
        let own_identity = own_identity.clone();
        let ipc_dir = ipc_dir.clone();
        table.on(
            message_type::SERVICE_CALL,
            Box::new(move |envelope| {
                let call: wire::ServiceCall = wire::decode(&envelope.payload)?;
                match routing.service_to_peer.get(&call.service) {
                    Some(&peer) => {
                        let routing_identity = own_identity.clone();
                        let ipc_dir = ipc_dir.clone();
                        let self_handle = self_handle;
                        tokio::spawn(async move {
                            if let Err(e) = forward_call_to_peer(peer, &routing_identity, self_handle, &ipc_dir, call).await {
                                warn!(error = %e, "relaying service call to peer failed");
                            }
                        });
                    }
                    None => warn!(service = %call.service, "no peer advertises this service"),
                }
                Ok(())
            }),
        );
    }

    {
        let routing = routing.clone();
        let own_identity = own_identity.clone();
        let ipc_dir = ipc_dir.clone();
        table.on(
            message_type::DISCOVERY_REQUEST,
            Box::new(move |envelope| {
                let request: wire::DiscoveryRequest = wire::decode(&envelope.payload)?;
                let routing = routing.clone();
                let own_identity = own_identity.clone();
                let ipc_dir = ipc_dir.clone();
                tokio::spawn(async move {
                    let offers = fan_out_discovery(&routing, &own_identity, &request).await;
                    let message = wire::DiscoveryReply { correlation: request.correlation, gateway: self_handle, offers };
                    if let Err(e) = reply(&ipc_dir, request.caller.ipc_id, message_type::DISCOVERY_REPLY, &message).await {
                        warn!(error = %e, "replying to local discovery request failed");
                    }
                });
                Ok(())
            }),
        );
    }

    let mut pump = Pump::new();
    pump.register("gateway-admin", Box::new(device), Box::new(move |_name, envelope| table.dispatch(envelope)));

    loop {
        pump.run_once().await?;
    }
}

/// Announce every service an outbound peer grants us to the local
/// service directory, so a lookup for one of them resolves to a
/// [`casual_core::service::directory::Provider::Concurrent`] pointing
/// at this gateway's own `ipc-id` (§4.4's "gateway advertises concurrent
/// instances" path).
fn advertise_outbound_services(ipc_dir: &Path, home: &Path, self_handle: ProcessHandle, routing: &Routing) -> Result<()> {
    let add: Vec<wire::ConcurrentAdvertiseEntry> = routing
        .outbound_peers
        .iter()
        .flat_map(|peer| peer.services.iter())
        .map(|service| wire::ConcurrentAdvertiseEntry {
            name: service.clone(),
            order: 0,
            hops: 1,
            property: wire::WireOrderProperty::Configured,
        })
        .collect();
    if add.is_empty() {
        return Ok(());
    }
    let servicemanager = read_admin_id(home, "servicemanager")?;
    let message = wire::ServiceConcurrentAdvertise { gateway: self_handle, add, remove: Vec::new(), reset: false };
    let envelope = Envelope::new(message_type::SERVICE_CONCURRENT_ADVERTISE, ExecutionId::new(), wire::encode(&message)?);
    let ipc_dir = ipc_dir.to_path_buf();
    tokio::spawn(async move {
        if let Err(e) = send_once(&ipc_dir, servicemanager, &envelope).await {
            warn!(error = %e, "advertising outbound services to servicemanager failed");
        }
    });
    Ok(())
}

/// Relay one `service.call` bound for a remote peer: dial the peer
/// fresh, send the request, wait for its `service.reply`, then deliver
/// that reply to the original caller's own FIFO — the gateway never
/// needs to see the call again once this completes.
async fn forward_call_to_peer(
    peer: SocketAddr,
    own_identity: &PeerIdentity,
    self_handle: ProcessHandle,
    ipc_dir: &Path,
    call: wire::ServiceCall,
) -> CoreResult<()> {
    let original_caller = call.caller;
    let outbound = wire::ServiceCall { caller: self_handle, ..call };
    let correlation = outbound.correlation;
    let request_envelope = Envelope::new(message_type::SERVICE_CALL, ExecutionId::new(), wire::encode(&outbound)?);
    let reply_envelope = tcp_round_trip(peer, own_identity, request_envelope).await?;
    let service_reply: wire::ServiceReply = wire::decode(&reply_envelope.payload)?;
    if service_reply.correlation != correlation {
        warn!(%correlation, "peer replied with a mismatched correlation, relaying anyway");
    }
    reply(ipc_dir, original_caller.ipc_id, message_type::SERVICE_REPLY, &service_reply).await
}

/// Fan a `discovery.request` out to every configured outbound peer,
/// merging whatever offers come back. A peer that is down, refuses the
/// connection, or has already been visited (loop avoidance, §4.4)
/// silently contributes nothing rather than failing the whole round.
async fn fan_out_discovery(routing: &Routing, own_identity: &PeerIdentity, request: &wire::DiscoveryRequest) -> Vec<(String, u32)> {
    let mut offers: HashMap<String, u32> = HashMap::new();
    for peer in &routing.outbound_peers {
        let outbound = wire::DiscoveryRequest {
            correlation: request.correlation,
            services: request.services.clone(),
            visited: request.visited.clone(),
            caller: request.caller,
        };
        let Ok(bytes) = wire::encode(&outbound) else { continue };
        let envelope = Envelope::new(message_type::DISCOVERY_REQUEST, ExecutionId::new(), bytes);
        match tcp_round_trip(peer.address, own_identity, envelope).await {
            Ok(reply_envelope) => match wire::decode::<wire::DiscoveryReply>(&reply_envelope.payload) {
                Ok(reply) => {
                    for (service, hops) in reply.offers {
                        offers
                            .entry(service)
                            .and_modify(|best| *best = (*best).min(hops))
                            .or_insert(hops);
                    }
                }
                Err(e) => warn!(peer = %peer.address, error = %e, "malformed discovery reply"),
            },
            Err(e) => warn!(peer = %peer.address, error = %e, "discovery fan-out to peer failed"),
        }
    }
    offers.into_iter().collect()
}

async fn tcp_round_trip(addr: SocketAddr, own_identity: &PeerIdentity, envelope: Envelope) -> CoreResult<Envelope> {
    let mut device = TcpDevice::connect(addr, own_identity).await?;
    device.send(&envelope).await?;
    device.receive().await
}

async fn reply<T: serde::Serialize>(ipc_dir: &Path, peer: IpcId, message_type: u64, payload: &T) -> CoreResult<()> {
    let envelope = Envelope::new(message_type, ExecutionId::new(), wire::encode(payload)?);
    send_once(ipc_dir, peer, &envelope).await
}

fn read_admin_id(domain_home: &Path, component: &str) -> Result<IpcId> {
    let path = casual_core::cli::admin_id_path(domain_home, component);
    let text = std::fs::read_to_string(&path).with_context(|| format!("reading {component} admin endpoint"))?;
    let uuid = uuid::Uuid::parse_str(text.trim()).context("malformed admin ipc-id")?;
    Ok(IpcId(uuid))
}

/// One accepted inbound connection: read exactly one request, answer
/// it by round-tripping once against the local `servicemanager`
/// (reusing its own FIFO admin endpoint the same way `casual`'s CLI
/// does), then reply over the same TCP socket and drop it.
async fn handle_inbound_connection(
    stream: tokio::net::TcpStream,
    own_identity: Arc<PeerIdentity>,
    home: PathBuf,
    self_handle: ProcessHandle,
) -> CoreResult<()> {
    let ipc_dir = home.join("ipc");
    let mut device = TcpDevice::accept(stream, &own_identity).await?;
    let envelope = device.receive().await?;
    match envelope.message_type {
        message_type::SERVICE_CALL => {
            let call: wire::ServiceCall = wire::decode(&envelope.payload)?;
            let servicemanager = read_admin_id(&home, "servicemanager")
                .map_err(|e| CoreError::CommunicationUnavailable { peer: None, reason: e.to_string() })?;
            let own_ipc_id = IpcId::new();
            let mut local = FifoDevice::bind(&ipc_dir, own_ipc_id, servicemanager)?;
            let local_call = wire::ServiceCall { caller: ProcessHandle::new(std::process::id(), own_ipc_id), ..call };
            let local_envelope = Envelope::new(message_type::SERVICE_CALL, ExecutionId::new(), wire::encode(&local_call)?);
            local.send(&local_envelope).await?;
            let local_reply_envelope = local.receive().await?;
            let local_reply: wire::ServiceReply = wire::decode(&local_reply_envelope.payload)?;
            let outbound_reply = wire::ServiceReply { correlation: call.correlation, success: local_reply.success, payload: local_reply.payload };
            let out_envelope = Envelope::new(message_type::SERVICE_REPLY, ExecutionId::new(), wire::encode(&outbound_reply)?);
            device.send(&out_envelope).await?;
        }
        message_type::DISCOVERY_REQUEST => {
            let request: wire::DiscoveryRequest = wire::decode(&envelope.payload)?;
            let servicemanager = read_admin_id(&home, "servicemanager")
                .map_err(|e| CoreError::CommunicationUnavailable { peer: None, reason: e.to_string() })?;
            let own_ipc_id = IpcId::new();
            let mut local = FifoDevice::bind(&ipc_dir, own_ipc_id, servicemanager)?;
            let local_request = wire::DiscoveryRequest {
                correlation: CorrelationId::new(),
                services: request.services.clone(),
                visited: request.visited.clone(),
                caller: ProcessHandle::new(std::process::id(), own_ipc_id),
            };
            let local_envelope = Envelope::new(message_type::DISCOVERY_REQUEST, ExecutionId::new(), wire::encode(&local_request)?);
            local.send(&local_envelope).await?;
            let local_reply_envelope = local.receive().await?;
            let local_reply: wire::DiscoveryReply = wire::decode(&local_reply_envelope.payload)?;
            let outbound_reply = wire::DiscoveryReply { correlation: request.correlation, gateway: self_handle, offers: local_reply.offers };
            let out_envelope = Envelope::new(message_type::DISCOVERY_REPLY, ExecutionId::new(), wire::encode(&outbound_reply)?);
            device.send(&out_envelope).await?;
        }
        other => warn!(message_type = other, "unexpected inbound message type, dropping connection"),
    }
    Ok(())
}

/// Bind a `TcpListener` for every inbound group connection and hand
/// each accepted socket to its own short-lived task. Runs for the
/// process lifetime as a background task alongside the admin `Pump`.
fn spawn_inbound_listeners(model: Model, own_identity: Arc<PeerIdentity>, home: PathBuf, own_ipc_id: IpcId) {
    let self_handle = ProcessHandle::new(std::process::id(), own_ipc_id);
    for group in &model.gateway.inbound {
        for connection in &group.connections {
            if connection.direction == ConnectDirection::Reversed {
                warn!(address = %connection.address, "reversed inbound connections are not supported, skipping");
                continue;
            }
            let address = connection.address.clone();
            let own_identity = own_identity.clone();
            let home = home.clone();
            tokio::spawn(async move {
                let listener = match TcpListener::bind(&address).await {
                    Ok(listener) => listener,
                    Err(e) => {
                        warn!(%address, error = %e, "failed to bind inbound gateway listener");
                        return;
                    }
                };
                info!(%address, "listening for inbound gateway connections");
                loop {
                    match listener.accept().await {
                        Ok((stream, peer_addr)) => {
                            let own_identity = own_identity.clone();
                            let home = home.clone();
                            tokio::spawn(async move {
                                if let Err(e) = handle_inbound_connection(stream, own_identity, home, self_handle).await {
                                    warn!(%peer_addr, error = %e, "inbound gateway connection failed");
                                }
                            });
                        }
                        Err(e) => warn!(%address, error = %e, "accept failed"),
                    }
                }
            });
        }
    }
}
