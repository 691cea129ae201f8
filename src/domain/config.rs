//! Declarative domain configuration: the `Model` loaded from YAML,
//! validation, and boot-order computation.
//!
//! Grounded on `serde_yaml`-based configuration loading as used across
//! the example pack (knhk, adamtc007 manifests), generalized into the
//! casual domain's `groups/servers/executables/services/transaction/
//! gateway/queue` hierarchy from §4.3. Boot order is Kahn's algorithm
//! over the group dependency DAG; no crate in the pack provides a graph
//! library suited to this, so it is implemented directly against
//! `HashMap`/`VecDeque`, matching the teacher's general preference for
//! explicit, small, hand-rolled algorithms over a dependency when the
//! algorithm is this contained.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet, VecDeque};
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Model {
    #[serde(default)]
    pub groups: Vec<Group>,
    #[serde(default)]
    pub servers: Vec<Server>,
    #[serde(default)]
    pub executables: Vec<Executable>,
    #[serde(default)]
    pub services: Vec<ServiceOverride>,
    #[serde(default)]
    pub transaction: Transaction,
    #[serde(default)]
    pub gateway: Gateway,
    #[serde(default)]
    pub queue: Queue,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Transaction {
    #[serde(default)]
    pub resources: Vec<ResourceConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceConfig {
    pub key: String,
    pub name: String,
    #[serde(default = "default_instances")]
    pub instances: u32,
    #[serde(default)]
    pub openinfo: Option<String>,
    #[serde(default)]
    pub closeinfo: Option<String>,
}

fn default_instances() -> u32 {
    1
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Group {
    pub name: String,
    #[serde(default)]
    pub dependencies: Vec<String>,
    #[serde(default)]
    pub resources: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Server {
    pub alias: String,
    pub path: PathBuf,
    #[serde(default)]
    pub arguments: Vec<String>,
    #[serde(default = "default_instances")]
    pub instances: u32,
    #[serde(default)]
    pub memberships: Vec<String>,
    #[serde(default)]
    pub environment: HashMap<String, String>,
    #[serde(default)]
    pub restart: bool,
    #[serde(default)]
    pub restrictions: Vec<String>,
    #[serde(default)]
    pub resources: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Executable {
    pub alias: String,
    pub path: PathBuf,
    #[serde(default)]
    pub arguments: Vec<String>,
    #[serde(default = "default_instances")]
    pub instances: u32,
    #[serde(default)]
    pub memberships: Vec<String>,
    #[serde(default)]
    pub environment: HashMap<String, String>,
    #[serde(default)]
    pub restart: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceOverride {
    pub name: String,
    #[serde(default)]
    pub routes: Vec<String>,
    #[serde(default)]
    pub timeout_seconds: Option<u64>,
}

impl ServiceOverride {
    pub fn timeout(&self) -> Duration {
        self.timeout_seconds.map(Duration::from_secs).unwrap_or(Duration::ZERO)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Gateway {
    #[serde(default)]
    pub inbound: Vec<GatewayGroup>,
    #[serde(default)]
    pub outbound: Vec<GatewayGroup>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayGroup {
    pub alias: String,
    #[serde(default)]
    pub connections: Vec<GatewayConnection>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConnection {
    pub address: String,
    #[serde(default)]
    pub services: Vec<String>,
    #[serde(default)]
    pub queues: Vec<String>,
    #[serde(default = "default_direction")]
    pub direction: ConnectDirection,
}

fn default_direction() -> ConnectDirection {
    ConnectDirection::Regular
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectDirection {
    Regular,
    Reversed,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Queue {
    #[serde(default)]
    pub groups: Vec<QueueGroupConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueGroupConfig {
    pub name: String,
    pub queuebase: PathBuf,
    #[serde(default)]
    pub queues: Vec<QueueConfig>,
    #[serde(default)]
    pub forward: ForwardConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    pub name: String,
    #[serde(default)]
    pub retry_count: u32,
    #[serde(default)]
    pub retry_delay_seconds: u64,
    #[serde(default)]
    pub error_queue: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ForwardConfig {
    #[serde(default)]
    pub queues: Vec<QueueForwardConfig>,
    #[serde(default)]
    pub services: Vec<ServiceForwardConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueForwardConfig {
    pub source: String,
    pub target_queue: String,
    #[serde(default)]
    pub target_delay_seconds: u64,
    #[serde(default = "default_instances")]
    pub instances: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceForwardConfig {
    pub source: String,
    pub target_service: String,
    #[serde(default)]
    pub reply_queue: Option<String>,
    #[serde(default = "default_instances")]
    pub instances: u32,
}

impl Model {
    pub fn from_yaml(text: &str) -> Result<Self> {
        serde_yaml::from_str(text)
            .map_err(|e| Error::InvalidConfiguration(format!("parsing domain configuration: {e}")))
    }

    /// Validate aliases, group references, and dependency membership.
    /// Fatal per §4.3: duplicate aliases, unknown group references, and
    /// unresolvable membership dependencies abort boot.
    pub fn validate(&self) -> Result<()> {
        let group_names: HashSet<&str> = self.groups.iter().map(|g| g.name.as_str()).collect();

        let mut aliases = HashSet::new();
        for server in &self.servers {
            if !aliases.insert(server.alias.as_str()) {
                return Err(Error::InvalidConfiguration(format!(
                    "duplicate alias: {}",
                    server.alias
                )));
            }
            for membership in &server.memberships {
                if !group_names.contains(membership.as_str()) {
                    return Err(Error::InvalidConfiguration(format!(
                        "server {} references unknown group {}",
                        server.alias, membership
                    )));
                }
            }
        }
        for executable in &self.executables {
            if !aliases.insert(executable.alias.as_str()) {
                return Err(Error::InvalidConfiguration(format!(
                    "duplicate alias: {}",
                    executable.alias
                )));
            }
            for membership in &executable.memberships {
                if !group_names.contains(membership.as_str()) {
                    return Err(Error::InvalidConfiguration(format!(
                        "executable {} references unknown group {}",
                        executable.alias, membership
                    )));
                }
            }
        }
        for group in &self.groups {
            for dependency in &group.dependencies {
                if !group_names.contains(dependency.as_str()) {
                    return Err(Error::InvalidConfiguration(format!(
                        "group {} depends on unknown group {}",
                        group.name, dependency
                    )));
                }
            }
        }
        Ok(())
    }

    /// Topologically sort groups by `dependencies` (Kahn's algorithm). A
    /// cycle is a configuration error, not an internal one: it means the
    /// declared dependency graph is unbootable.
    pub fn boot_order(&self) -> Result<Vec<String>> {
        let mut indegree: HashMap<&str, usize> =
            self.groups.iter().map(|g| (g.name.as_str(), 0)).collect();
        let mut dependents: HashMap<&str, Vec<&str>> = HashMap::new();

        for group in &self.groups {
            for dependency in &group.dependencies {
                *indegree.get_mut(group.name.as_str()).unwrap() += 1;
                dependents
                    .entry(dependency.as_str())
                    .or_default()
                    .push(group.name.as_str());
            }
        }

        let mut ready: VecDeque<&str> = indegree
            .iter()
            .filter(|(_, &degree)| degree == 0)
            .map(|(&name, _)| name)
            .collect();
        // Deterministic order among equally-ready groups.
        let mut ready_vec: Vec<&str> = ready.drain(..).collect();
        ready_vec.sort_unstable();
        let mut ready: VecDeque<&str> = ready_vec.into();

        let mut order = Vec::with_capacity(self.groups.len());
        while let Some(name) = ready.pop_front() {
            order.push(name.to_string());
            if let Some(next) = dependents.get(name) {
                let mut newly_ready = Vec::new();
                for &dependent in next {
                    let degree = indegree.get_mut(dependent).unwrap();
                    *degree -= 1;
                    if *degree == 0 {
                        newly_ready.push(dependent);
                    }
                }
                newly_ready.sort_unstable();
                for dependent in newly_ready {
                    ready.push_back(dependent);
                }
            }
        }

        if order.len() != self.groups.len() {
            return Err(Error::InvalidConfiguration(
                "cyclic group dependency".to_string(),
            ));
        }
        Ok(order)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_yaml() -> &'static str {
        r#"
groups:
  - name: transaction
  - name: queue
    dependencies: [transaction]
  - name: server
    dependencies: [queue]
servers:
  - alias: ECHO
    path: /bin/echo-server
    instances: 2
    memberships: [server]
"#
    }

    #[test]
    fn parses_and_validates_a_sample_model() {
        let model = Model::from_yaml(sample_yaml()).unwrap();
        model.validate().unwrap();
        assert_eq!(model.servers[0].instances, 2);
    }

    #[test]
    fn boot_order_respects_dependencies() {
        let model = Model::from_yaml(sample_yaml()).unwrap();
        let order = model.boot_order().unwrap();
        assert_eq!(order, vec!["transaction", "queue", "server"]);
    }

    #[test]
    fn unknown_group_reference_is_invalid_configuration() {
        let yaml = r#"
groups:
  - name: a
servers:
  - alias: S
    path: /bin/s
    memberships: [nonexistent]
"#;
        let model = Model::from_yaml(yaml).unwrap();
        let err = model.validate().unwrap_err();
        assert!(matches!(err, Error::InvalidConfiguration(_)));
    }

    #[test]
    fn duplicate_alias_is_invalid_configuration() {
        let yaml = r#"
groups:
  - name: a
servers:
  - alias: S
    path: /bin/s
    memberships: [a]
  - alias: S
    path: /bin/s2
    memberships: [a]
"#;
        let model = Model::from_yaml(yaml).unwrap();
        let err = model.validate().unwrap_err();
        assert!(matches!(err, Error::InvalidConfiguration(_)));
    }

    #[test]
    fn cyclic_dependency_is_rejected() {
        let yaml = r#"
groups:
  - name: a
    dependencies: [b]
  - name: b
    dependencies: [a]
"#;
        let model = Model::from_yaml(yaml).unwrap();
        let err = model.boot_order().unwrap_err();
        assert!(matches!(err, Error::InvalidConfiguration(_)));
    }
}
