//! `casual-servicemanager` — the per-domain service directory process:
//! advertise/withdraw, lookup/reserve/acknowledge, local service calls,
//! and cross-domain discovery fan-out to configured gateways. Every
//! other process in the domain (servers, the CLI, gateways) talks to
//! exactly one of these per domain, found via its published admin
//! `ipc-id` the same way `casual-domain` publishes its own.

use anyhow::{Context, Result};
use casual_core::dispatch::{DeadlineWheel, HandlerTable};
use casual_core::domain::config::Model;
use casual_core::ids::{CorrelationId, IpcId, ProcessHandle};
use casual_core::service::directory::{LookupOutcome, LookupReply, Provider};
use casual_core::service::discovery::{DiscoveryReply as RoundReply, DiscoveryRound};
use casual_core::service::{ConcurrentInstance, ServiceDirectory};
use casual_core::transport::fifo::{send_once, FifoDevice};
use casual_core::transport::pump::Pump;
use casual_core::transport::{Device, Envelope};
use casual_core::wire::{self, message_type};
use casual_core::{DomainId, ExecutionId};
use clap::Parser;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(author, version, about = "Own the service directory for one domain")]
struct Args {
    /// Root directory of the domain. Defaults to `$CASUAL_DOMAIN_HOME`.
    #[arg(long)]
    domain_home: Option<PathBuf>,

    /// Path to the domain's YAML configuration, read once at startup to
    /// learn each server alias's advertise restrictions.
    #[arg(long)]
    config: PathBuf,

    /// How long a fanned-out `discovery.request` waits for each gateway
    /// before treating it as unreachable.
    #[arg(long, default_value_t = 3000)]
    discovery_timeout_ms: u64,
}

/// One discovery request in flight, waiting on replies from the
/// gateways it was fanned out to.
struct InFlightDiscovery {
    round: DiscoveryRound,
    caller: ProcessHandle,
}

struct DiscoveryState {
    /// Keyed by the original request's own correlation.
    rounds: HashMap<CorrelationId, InFlightDiscovery>,
    /// Maps each per-gateway correlation back to the round it belongs
    /// to, so a `discovery.reply` (or its deadline firing) can find its
    /// round without scanning every one in flight.
    gateway_index: HashMap<CorrelationId, (CorrelationId, ProcessHandle)>,
    gateways: Vec<ProcessHandle>,
}

impl DiscoveryState {
    fn new() -> Self {
        Self {
            rounds: HashMap::new(),
            gateway_index: HashMap::new(),
            gateways: Vec::new(),
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let home = args
        .domain_home
        .or_else(|| std::env::var_os("CASUAL_DOMAIN_HOME").map(PathBuf::from))
        .context("no domain home given; pass --domain-home or set CASUAL_DOMAIN_HOME")?;

    let _log_guard = casual_core::logging::init("servicemanager", &home.join("log"))?;

    let text = std::fs::read_to_string(&args.config)
        .with_context(|| format!("reading domain configuration {}", args.config.display()))?;
    let model = Model::from_yaml(&text).context("parsing domain configuration")?;
    let restrictions_by_alias: HashMap<String, Vec<String>> = model
        .servers
        .iter()
        .filter(|server| !server.restrictions.is_empty())
        .map(|server| (server.alias.clone(), server.restrictions.clone()))
        .collect();

    let this_domain = DomainId::new();
    info!(domain = %this_domain, "servicemanager starting");

    let directory = Arc::new(Mutex::new(ServiceDirectory::new()));
    let deadlines = Arc::new(Mutex::new(DeadlineWheel::new()));
    let discovery = Arc::new(Mutex::new(DiscoveryState::new()));
    let restricted: HashMap<ProcessHandle, ()> = HashMap::new();
    let restricted_seen = Arc::new(Mutex::new(restricted));

    let own_ipc_id = IpcId::new();
    casual_core::cli::publish_admin_id(&home, "servicemanager", own_ipc_id)?;
    let device = FifoDevice::bind(&home.join("ipc"), own_ipc_id, IpcId::nil())?;
    let ipc_dir = home.join("ipc");

    let mut table = HandlerTable::new();

    {
        let directory = directory.clone();
        let restrictions_by_alias = restrictions_by_alias.clone();
        let restricted_seen = restricted_seen.clone();
        let ipc_dir = ipc_dir.clone();
        table.on(
            message_type::SERVICE_ADVERTISE,
            Box::new(move |envelope| {
                let message: wire::ServiceAdvertise = wire::decode(&envelope.payload)?;
                let mut directory = directory.lock().unwrap();
                if let Some(allowed) = restrictions_by_alias.get(&message.alias) {
                    let mut seen = restricted_seen.lock().unwrap();
                    if seen.insert(message.process, ()).is_none() {
                        directory.set_restriction(message.process, allowed.clone());
                    }
                }
                let (dropped, woken) = directory.advertise(message.process, &message.alias, &message.add, &message.remove);
                if !dropped.is_empty() {
                    warn!(alias = %message.alias, ?dropped, "advertise rejected by restriction");
                }
                drop(directory);
                deliver_woken(&ipc_dir, woken);
                Ok(())
            }),
        );
    }

    {
        let directory = directory.clone();
        let discovery = discovery.clone();
        let ipc_dir = ipc_dir.clone();
        table.on(
            message_type::SERVICE_CONCURRENT_ADVERTISE,
            Box::new(move |envelope| {
                let message: wire::ServiceConcurrentAdvertise = wire::decode(&envelope.payload)?;
                {
                    let mut known = discovery.lock().unwrap();
                    if !known.gateways.contains(&message.gateway) {
                        known.gateways.push(message.gateway);
                    }
                }
                let add: Vec<(String, ConcurrentInstance)> = message
                    .add
                    .iter()
                    .map(|entry| {
                        (
                            entry.name.clone(),
                            ConcurrentInstance {
                                gateway: message.gateway,
                                property: entry.property.into(),
                                order: entry.order,
                                hops: entry.hops,
                            },
                        )
                    })
                    .collect();
                let woken = directory
                    .lock()
                    .unwrap()
                    .concurrent_advertise(message.gateway, &add, &message.remove, message.reset);
                deliver_woken(&ipc_dir, woken);
                Ok(())
            }),
        );
    }

    {
        let directory = directory.clone();
        let deadlines = deadlines.clone();
        let ipc_dir = ipc_dir.clone();
        table.on(
            message_type::SERVICE_LOOKUP_REQUEST,
            Box::new(move |envelope| {
                let request: wire::LookupRequest = wire::decode(&envelope.payload)?;
                let outcome = directory.lock().unwrap().lookup(
                    &request.requested,
                    request.caller,
                    request.correlation,
                    request.context.into(),
                );
                match outcome {
                    LookupOutcome::Immediate(reply) => {
                        reply_lookup(&ipc_dir, request.caller, request.correlation, reply);
                    }
                    LookupOutcome::Pending => {
                        if !casual_core::error::is_no_timeout(request.deadline_after) {
                            deadlines.lock().unwrap().add(request.correlation, request.deadline_after);
                        }
                    }
                }
                Ok(())
            }),
        );
    }

    {
        let directory = directory.clone();
        let ipc_dir = ipc_dir.clone();
        table.on(
            message_type::SERVICE_ACKNOWLEDGE,
            Box::new(move |envelope| {
                let message: wire::ServiceAcknowledge = wire::decode(&envelope.payload)?;
                let outcome = directory.lock().unwrap().acknowledge(message.process, message.pending_wait);
                if let Some((caller, correlation, reply)) = outcome.woken {
                    reply_lookup(&ipc_dir, caller, correlation, reply);
                }
                if let Some(process) = outcome.shutdown_ready {
                    info!(%process, "sequential instance released for shutdown after its call acknowledged");
                }
                Ok(())
            }),
        );
    }

    {
        let directory = directory.clone();
        let ipc_dir = ipc_dir.clone();
        table.on(
            message_type::SERVICE_CALL,
            Box::new(move |envelope| {
                let call: wire::ServiceCall = wire::decode(&envelope.payload)?;
                let outcome =
                    directory
                        .lock()
                        .unwrap()
                        .lookup(&call.service, call.caller, call.correlation, casual_core::service::LookupContext::Regular);
                match outcome {
                    LookupOutcome::Immediate(LookupReply::Idle(provider)) => {
                        let target = match provider {
                            Provider::Sequential(handle) => handle,
                            Provider::Concurrent(handle) => handle,
                        };
                        let forwarded = Envelope::new(message_type::SERVICE_CALL, ExecutionId::new(), wire::encode(&call)?);
                        let ipc_dir = ipc_dir.clone();
                        tokio::spawn(async move {
                            if let Err(e) = send_once(&ipc_dir, target.ipc_id, &forwarded).await {
                                warn!(error = %e, "failed forwarding service call to provider");
                            }
                        });
                    }
                    LookupOutcome::Immediate(LookupReply::Busy) | LookupOutcome::Immediate(LookupReply::Absent) => {
                        let reply = wire::ServiceReply {
                            correlation: call.correlation,
                            success: false,
                            payload: Vec::new(),
                        };
                        let envelope = Envelope::new(message_type::SERVICE_REPLY, ExecutionId::new(), wire::encode(&reply)?);
                        let ipc_dir = ipc_dir.clone();
                        let caller = call.caller;
                        tokio::spawn(async move {
                            if let Err(e) = send_once(&ipc_dir, caller.ipc_id, &envelope).await {
                                warn!(error = %e, "failed replying to rejected service call");
                            }
                        });
                    }
                    LookupOutcome::Immediate(LookupReply::Timeout) | LookupOutcome::Pending => {
                        // `service.call` never waits: a busy/absent service is
                        // reported immediately rather than queued (§4.4's
                        // `Regular` context never pends).
                    }
                }
                Ok(())
            }),
        );
    }

    {
        let directory = directory.clone();
        let ipc_dir = ipc_dir.clone();
        table.on(
            message_type::SERVICE_PREPARE_SHUTDOWN,
            Box::new(move |envelope| {
                let message: wire::PrepareShutdown = wire::decode(&envelope.payload)?;
                let result = directory.lock().unwrap().prepare_shutdown(&message.processes);
                let reply = wire::PrepareShutdownReply {
                    services_gone_empty: result.services_gone_empty,
                    extracted_sequential: result.extracted_sequential,
                    deferred_sequential: result.deferred_sequential,
                    unknown: result.unknown,
                };
                let envelope = Envelope::new(message_type::SERVICE_PREPARE_SHUTDOWN, ExecutionId::new(), wire::encode(&reply)?);
                let ipc_dir = ipc_dir.clone();
                let caller = message.caller;
                tokio::spawn(async move {
                    if let Err(e) = send_once(&ipc_dir, caller.ipc_id, &envelope).await {
                        warn!(error = %e, "failed replying to prepare-shutdown");
                    }
                });
                Ok(())
            }),
        );
    }

    {
        let discovery = discovery.clone();
        let deadlines = deadlines.clone();
        let ipc_dir = ipc_dir.clone();
        let timeout = Duration::from_millis(args.discovery_timeout_ms);
        let self_handle = ProcessHandle::new(std::process::id(), own_ipc_id);
        table.on(
            message_type::DISCOVERY_REQUEST,
            Box::new(move |envelope| {
                let request: wire::DiscoveryRequest = wire::decode(&envelope.payload)?;
                let gateways = discovery.lock().unwrap().gateways.clone();
                if gateways.is_empty() {
                    let reply = wire::DiscoveryReply {
                        correlation: request.correlation,
                        gateway: ProcessHandle::new(std::process::id(), IpcId::nil()),
                        offers: Vec::new(),
                    };
                    let envelope = Envelope::new(message_type::DISCOVERY_REPLY, ExecutionId::new(), wire::encode(&reply)?);
                    let ipc_dir = ipc_dir.clone();
                    let caller = request.caller;
                    tokio::spawn(async move {
                        if let Err(e) = send_once(&ipc_dir, caller.ipc_id, &envelope).await {
                            warn!(error = %e, "failed replying to discovery with no known gateways");
                        }
                    });
                    return Ok(());
                }

                let participants: Vec<(ProcessHandle, CorrelationId)> =
                    gateways.iter().map(|gateway| (*gateway, CorrelationId::new())).collect();
                let round = DiscoveryRound::new(participants.clone());

                {
                    let mut state = discovery.lock().unwrap();
                    for (gateway, gateway_correlation) in &participants {
                        state.gateway_index.insert(*gateway_correlation, (request.correlation, *gateway));
                    }
                    state.rounds.insert(
                        request.correlation,
                        InFlightDiscovery { round, caller: request.caller },
                    );
                }

                let forwarded_request = casual_core::service::DiscoveryRequest {
                    correlation: request.correlation,
                    services: request.services.clone(),
                    visited: request.visited.clone(),
                }
                .advance(this_domain);

                for (gateway, gateway_correlation) in participants {
                    deadlines.lock().unwrap().add(gateway_correlation, timeout);
                    let wire_request = wire::DiscoveryRequest {
                        correlation: gateway_correlation,
                        services: forwarded_request.services.clone(),
                        visited: forwarded_request.visited.clone(),
                        caller: self_handle,
                    };
                    let ipc_dir = ipc_dir.clone();
                    tokio::spawn(async move {
                        if let Ok(payload) = wire::encode(&wire_request) {
                            let envelope = Envelope::new(message_type::DISCOVERY_REQUEST, ExecutionId::new(), payload);
                            if let Err(e) = send_once(&ipc_dir, gateway.ipc_id, &envelope).await {
                                warn!(error = %e, "failed forwarding discovery request to gateway");
                            }
                        }
                    });
                }

                Ok(())
            }),
        );
    }

    {
        let discovery = discovery.clone();
        let deadlines = deadlines.clone();
        let directory = directory.clone();
        let ipc_dir = ipc_dir.clone();
        table.on(
            message_type::DISCOVERY_REPLY,
            Box::new(move |envelope| {
                let reply: wire::DiscoveryReply = wire::decode(&envelope.payload)?;
                let gateway_correlation = reply.correlation;
                let routed = discovery.lock().unwrap().gateway_index.remove(&gateway_correlation);
                let Some((original, _gateway)) = routed else { return Ok(()) };
                deadlines.lock().unwrap().cancel(gateway_correlation);

                let mut state = discovery.lock().unwrap();
                let Some(in_flight) = state.rounds.get_mut(&original) else { return Ok(()) };
                in_flight.round.reply(
                    gateway_correlation,
                    RoundReply { gateway: reply.gateway, offers: reply.offers },
                );
                if in_flight.round.is_complete() {
                    let in_flight = state.rounds.remove(&original).unwrap();
                    drop(state);
                    finalize_discovery(&directory, &ipc_dir, original, in_flight);
                }
                Ok(())
            }),
        );
    }

    let mut pump = Pump::new();
    pump.register(
        "servicemanager-admin",
        Box::new(device),
        Box::new(move |_name, envelope| table.dispatch(envelope)),
    );

    loop {
        let expired = deadlines.lock().unwrap().drain_expired(std::time::Instant::now());
        for correlation in expired {
            if let Some(caller) = directory.lock().unwrap().expire(correlation) {
                reply_lookup(&ipc_dir, caller, correlation, LookupReply::Timeout);
                continue;
            }
            // Not a lookup deadline; check whether it belongs to an
            // in-flight discovery round instead.
            let routed = discovery.lock().unwrap().gateway_index.remove(&correlation);
            if let Some((original, gateway)) = routed {
                let mut state = discovery.lock().unwrap();
                if let Some(in_flight) = state.rounds.get_mut(&original) {
                    in_flight.round.gateway_unreachable(&gateway);
                    if in_flight.round.is_complete() {
                        let in_flight = state.rounds.remove(&original).unwrap();
                        drop(state);
                        finalize_discovery(&directory, &ipc_dir, original, in_flight);
                    }
                }
            }
        }
        pump.run_once().await?;
    }
}

fn reply_lookup(ipc_dir: &std::path::Path, caller: ProcessHandle, correlation: CorrelationId, reply: LookupReply) {
    let message = wire::LookupReplyMessage { correlation, reply: reply.into() };
    let ipc_dir = ipc_dir.to_path_buf();
    tokio::spawn(async move {
        match wire::encode(&message) {
            Ok(payload) => {
                let envelope = Envelope::new(message_type::SERVICE_LOOKUP_REPLY, ExecutionId::new(), payload);
                if let Err(e) = send_once(&ipc_dir, caller.ipc_id, &envelope).await {
                    warn!(error = %e, "failed delivering lookup reply");
                }
            }
            Err(e) => warn!(error = %e, "failed encoding lookup reply"),
        }
    });
}

fn deliver_woken(ipc_dir: &std::path::Path, woken: Vec<(ProcessHandle, CorrelationId, LookupReply)>) {
    for (caller, correlation, reply) in woken {
        reply_lookup(ipc_dir, caller, correlation, reply);
    }
}

fn finalize_discovery(
    directory: &Arc<Mutex<ServiceDirectory>>,
    ipc_dir: &std::path::Path,
    original: CorrelationId,
    in_flight: InFlightDiscovery,
) {
    let merged = in_flight.round.into_instances(1);
    let offers: Vec<(String, u32)> = merged.iter().map(|(name, instance)| (name.clone(), instance.order)).collect();

    let mut by_gateway: HashMap<ProcessHandle, Vec<(String, ConcurrentInstance)>> = HashMap::new();
    for (name, instance) in merged {
        by_gateway.entry(instance.gateway).or_default().push((name, instance));
    }
    {
        let mut directory = directory.lock().unwrap();
        for (gateway, add) in by_gateway {
            directory.concurrent_advertise(gateway, &add, &[], false);
        }
    }

    let reply = wire::DiscoveryReply {
        correlation: original,
        gateway: ProcessHandle::new(std::process::id(), IpcId::nil()),
        offers,
    };
    let ipc_dir = ipc_dir.to_path_buf();
    let caller = in_flight.caller;
    tokio::spawn(async move {
        match wire::encode(&reply) {
            Ok(payload) => {
                let envelope = Envelope::new(message_type::DISCOVERY_REPLY, ExecutionId::new(), payload);
                if let Err(e) = send_once(&ipc_dir, caller.ipc_id, &envelope).await {
                    warn!(error = %e, "failed delivering discovery reply");
                }
            }
            Err(e) => warn!(error = %e, "failed encoding discovery reply"),
        }
    });
}
