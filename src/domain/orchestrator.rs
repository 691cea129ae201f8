//! Process lifecycle: spawn domain processes in boot order, supervise
//! them via SIGCHLD, and run the two-phase shutdown protocol.
//!
//! Grounded on the teacher crate's `coordination::HostCoordinator`
//! (`spawn_server_process` in `src/coordination.rs`, which builds a
//! `tokio::process::Command` with piped stdio and waits on the spawned
//! `Child`), generalized from "spawn N benchmark server processes" to
//! "spawn every server/executable in a booted group, in its configured
//! group order, with the domain's environment". Supervision and
//! shutdown have no teacher analogue and are grounded on §4.3 directly.

use super::config::Model;
use super::event::{Event, EventBus, ProcessEvent};
use crate::error::{Error, Result};
use crate::ids::{IpcId, ProcessHandle};
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::{Child, Command};
use tracing::{info, warn};

/// One spawned process: its `tokio::process::Child` handle plus the
/// domain-level identity it announces once connected. `handle` is
/// `None` between spawn and the process's first `connect` message
/// reaching the service manager; callers route that message to
/// [`Orchestrator::record_connect`].
pub struct ProcessRecord {
    pub alias: String,
    pub group: String,
    pub restart: bool,
    pub child: Child,
    pub handle: Option<ProcessHandle>,
}

/// Boots, supervises, and tears down every process declared in a
/// [`Model`]. One orchestrator per domain, per §4.3.
pub struct Orchestrator {
    home: PathBuf,
    model: Model,
    boot_order: Vec<String>,
    processes: HashMap<String, ProcessRecord>,
    pub events: EventBus,
}

impl Orchestrator {
    pub fn new(model: Model, home: PathBuf) -> Result<Self> {
        model.validate()?;
        let boot_order = model.boot_order()?;
        Ok(Self {
            home,
            model,
            boot_order,
            processes: HashMap::new(),
            events: EventBus::new(),
        })
    }

    fn spawn_one(&self, alias: &str, path: &PathBuf, arguments: &[String], environment: &HashMap<String, String>) -> Result<Child> {
        let mut command = Command::new(path);
        command
            .args(arguments)
            .env("CASUAL_DOMAIN_HOME", &self.home)
            .env("CASUAL_EXECUTION_ID", crate::ids::ExecutionId::new().to_string())
            .envs(environment)
            .stdin(Stdio::null())
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit());

        command.spawn().map_err(|e| {
            Error::InvalidConfiguration(format!("spawning process {alias} ({}): {e}", path.display()))
        })
    }

    /// Boot every group in dependency order; within a group, every
    /// process instance is spawned before moving to the next group so
    /// a later group's dependents never race an earlier group's boot.
    pub async fn boot(&mut self) -> Result<()> {
        self.events.publish(Event::Domain(super::event::DomainEvent::BootBegin));

        for group in self.boot_order.clone() {
            for server in self.model.servers.clone() {
                if !server.memberships.iter().any(|m| m == &group) {
                    continue;
                }
                for instance in 0..server.instances {
                    let key = format!("{}#{instance}", server.alias);
                    let child = self.spawn_one(&server.alias, &server.path, &server.arguments, &server.environment)?;
                    info!(alias = %server.alias, instance, pid = child.id(), "spawned server");
                    self.processes.insert(
                        key,
                        ProcessRecord {
                            alias: server.alias.clone(),
                            group: group.clone(),
                            restart: server.restart,
                            child,
                            handle: None,
                        },
                    );
                }
            }
            for executable in self.model.executables.clone() {
                if !executable.memberships.iter().any(|m| m == &group) {
                    continue;
                }
                for instance in 0..executable.instances {
                    let key = format!("{}#{instance}", executable.alias);
                    let child = self.spawn_one(
                        &executable.alias,
                        &executable.path,
                        &executable.arguments,
                        &executable.environment,
                    )?;
                    info!(alias = %executable.alias, instance, pid = child.id(), "spawned executable");
                    self.processes.insert(
                        key,
                        ProcessRecord {
                            alias: executable.alias.clone(),
                            group: group.clone(),
                            restart: executable.restart,
                            child,
                            handle: None,
                        },
                    );
                }
            }
        }

        self.events.publish(Event::Domain(super::event::DomainEvent::BootComplete));
        Ok(())
    }

    /// Called by the service manager when a freshly spawned process's
    /// `connect` message arrives, identifying it by `ipc-id`.
    pub fn record_connect(&mut self, key: &str, ipc_id: IpcId) -> Result<()> {
        let record = self
            .processes
            .get_mut(key)
            .ok_or_else(|| Error::InternalUnexpected(format!("connect from unknown process {key}")))?;
        let handle = ProcessHandle::new(record.child.id().unwrap_or(0), ipc_id);
        record.handle = Some(handle);
        self.events.publish(Event::Process(ProcessEvent::Spawn {
            alias: record.alias.clone(),
            handle,
        }));
        Ok(())
    }

    /// Poll every tracked child for exit without blocking; call this
    /// from the domain process's `on_prelude` pump hook, the async
    /// equivalent of handling `SIGCHLD` inline rather than in a signal
    /// handler. Respawns restart-configured processes and emits
    /// `process.exit` otherwise.
    pub async fn reap(&mut self) -> Result<()> {
        let keys: Vec<String> = self.processes.keys().cloned().collect();
        for key in keys {
            let exited = {
                let record = self.processes.get_mut(&key).unwrap();
                match record.child.try_wait() {
                    Ok(Some(status)) => Some(status.code()),
                    Ok(None) => None,
                    Err(e) => {
                        warn!(alias = %record.alias, error = %e, "error polling child");
                        None
                    }
                }
            };

            let Some(exit_code) = exited else { continue };

            let record = self.processes.remove(&key).unwrap();
            self.events.publish(Event::Process(ProcessEvent::Exit {
                alias: record.alias.clone(),
                handle: record.handle.unwrap_or(ProcessHandle::new(0, IpcId::nil())),
                exit_code,
            }));

            if record.restart {
                info!(alias = %record.alias, "restarting exited process");
                tokio::time::sleep(Duration::from_millis(200)).await;
                if let Some(server) = self.model.servers.iter().find(|s| s.alias == record.alias) {
                    let child = self.spawn_one(&server.alias, &server.path, &server.arguments, &server.environment)?;
                    self.processes.insert(
                        key,
                        ProcessRecord {
                            alias: record.alias,
                            group: record.group,
                            restart: record.restart,
                            child,
                            handle: None,
                        },
                    );
                } else if let Some(executable) = self.model.executables.iter().find(|e| e.alias == record.alias) {
                    let child =
                        self.spawn_one(&executable.alias, &executable.path, &executable.arguments, &executable.environment)?;
                    self.processes.insert(
                        key,
                        ProcessRecord {
                            alias: record.alias,
                            group: record.group,
                            restart: record.restart,
                            child,
                            handle: None,
                        },
                    );
                }
            }
        }
        Ok(())
    }

    /// Two-phase shutdown (§4.3): soft phase gives every process
    /// `soft_timeout` to exit on its own after a `SIGTERM`; stragglers
    /// are escalated to `SIGKILL`. A conformant process is expected to
    /// treat `SIGTERM` as `shutdown.request` and drain before exiting;
    /// this orchestrator-level signal is the transport-independent
    /// fallback for processes that never got the framed message (e.g.
    /// one that died mid-boot before its inbound FIFO existed).
    pub async fn shutdown(&mut self, soft_timeout: Duration) -> Result<()> {
        self.events.publish(Event::Domain(super::event::DomainEvent::ShutdownBegin));

        let mut reverse_order = self.boot_order.clone();
        reverse_order.reverse();

        for group in &reverse_order {
            let keys: Vec<String> = self
                .processes
                .iter()
                .filter(|(_, record)| &record.group == group)
                .map(|(key, _)| key.clone())
                .collect();

            for key in &keys {
                if let Some(record) = self.processes.get(key) {
                    if let Some(pid) = record.child.id() {
                        let _ = kill(Pid::from_raw(pid as i32), Signal::SIGTERM);
                    }
                }
            }

            let deadline = tokio::time::Instant::now() + soft_timeout;
            loop {
                self.reap_group(&keys).await?;
                if keys.iter().all(|key| !self.processes.contains_key(key)) {
                    break;
                }
                if tokio::time::Instant::now() >= deadline {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(50)).await;
            }

            for key in &keys {
                if let Some(record) = self.processes.get(key) {
                    if let Some(pid) = record.child.id() {
                        warn!(alias = %record.alias, "escalating to SIGKILL after soft shutdown timeout");
                        let _ = kill(Pid::from_raw(pid as i32), Signal::SIGKILL);
                    }
                }
            }
            self.reap_group(&keys).await?;
        }

        self.events.publish(Event::Domain(super::event::DomainEvent::ShutdownComplete));
        Ok(())
    }

    async fn reap_group(&mut self, keys: &[String]) -> Result<()> {
        for key in keys {
            if let Some(record) = self.processes.get_mut(key) {
                if let Ok(Some(status)) = record.child.try_wait() {
                    let record = self.processes.remove(key).unwrap();
                    self.events.publish(Event::Process(ProcessEvent::Exit {
                        alias: record.alias,
                        handle: record.handle.unwrap_or(ProcessHandle::new(0, IpcId::nil())),
                        exit_code: status.code(),
                    }));
                }
            }
        }
        Ok(())
    }

    pub fn process_count(&self) -> usize {
        self.processes.len()
    }

    /// Resolve an incoming `connect` message's pid back to the
    /// `{alias}#{instance}` key [`Orchestrator::record_connect`] expects:
    /// a freshly spawned process knows its own pid but not the instance
    /// index the orchestrator assigned it.
    pub fn key_for_pid(&self, pid: u32) -> Option<String> {
        self.processes
            .iter()
            .find(|(_, record)| record.child.id() == Some(pid))
            .map(|(key, _)| key.clone())
    }

    /// Every process that has completed its `connect` handshake so far,
    /// for handing to the service manager ahead of a shutdown so it can
    /// extract idle instances before `SIGTERM` lands.
    pub fn connected_handles(&self) -> Vec<ProcessHandle> {
        self.processes.values().filter_map(|record| record.handle).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::config::Model;

    fn sleepy_model() -> Model {
        Model::from_yaml(
            r#"
groups:
  - name: g
servers:
  - alias: sleeper
    path: /bin/sleep
    arguments: ["5"]
    instances: 1
    memberships: [g]
"#,
        )
        .unwrap()
    }

    #[tokio::test]
    async fn boot_spawns_configured_instances() {
        let model = sleepy_model();
        let home = tempfile::tempdir().unwrap();
        let mut orchestrator = Orchestrator::new(model, home.path().to_path_buf()).unwrap();
        orchestrator.boot().await.unwrap();
        assert_eq!(orchestrator.process_count(), 1);
        orchestrator.shutdown(Duration::from_millis(200)).await.unwrap();
        assert_eq!(orchestrator.process_count(), 0);
    }
}
