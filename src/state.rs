//! The deployment record kept on the operator's machine.
//!
//! The record holds the fleet's shape and whether it has been deployed. Operations check it
//! before running: a full deployment only runs against a fresh record, and everything that
//! touches running services only runs against a deployed one.

use crate::core::topology::{Address, Node, Tier, Topology};
use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt::{self, Display};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// The name of the record file in the system directory.
pub const RECORD_FILE: &str = "deployment.json";

#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum DeploymentState {
    NotDeployed,
    Deployed,
}

impl Display for DeploymentState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            DeploymentState::NotDeployed => "not-deployed",
            DeploymentState::Deployed => "deployed",
        })
    }
}

/// The persisted shape of the fleet.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct DeploymentRecord {
    pub state: DeploymentState,

    #[serde(rename = "sbo")]
    pub coordinator: HostRecord,

    #[serde(rename = "las", default)]
    pub regionals: Vec<RegionalRecord>,
}

/// A node's name and SSH address. Unnamed nodes are named after their position when the
/// topology is rebuilt.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct HostRecord {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub name: String,
    pub address: String,
    pub port: u16,
}

#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct RegionalRecord {
    #[serde(flatten)]
    pub host: HostRecord,

    #[serde(rename = "hal", default)]
    pub edges: Vec<EdgeRecord>,
}

#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct EdgeRecord {
    #[serde(flatten)]
    pub host: HostRecord,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub sensors: Vec<HostRecord>,
}

impl HostRecord {
    fn of(node: &Node) -> Self {
        Self {
            name: node.name.clone(),
            address: node.address.host.clone(),
            port: node.address.port,
        }
    }

    fn name_or(&self, fallback: String) -> String {
        match self.name.is_empty() {
            true => fallback,
            false => self.name.clone(),
        }
    }

    fn address(&self) -> Address {
        Address::new(self.address.clone(), self.port)
    }
}

impl DeploymentRecord {
    /// A fresh, undeployed record of `topology`.
    pub fn new(topology: &Topology) -> Self {
        fn hosts<'t>(topology: &'t Topology, node: &'t Node, tier: Tier) -> Vec<&'t Node> {
            topology.children(node).filter(|c| c.tier == tier).collect()
        }
        let root = topology.root();
        let regionals = hosts(topology, root, Tier::Regional)
            .into_iter()
            .map(|regional| RegionalRecord {
                host: HostRecord::of(regional),
                edges: hosts(topology, regional, Tier::Edge)
                    .into_iter()
                    .map(|edge| EdgeRecord {
                        host: HostRecord::of(edge),
                        sensors: hosts(topology, edge, Tier::Sensor)
                            .into_iter()
                            .map(HostRecord::of)
                            .collect(),
                    })
                    .collect(),
            })
            .collect();

        Self {
            state: DeploymentState::NotDeployed,
            coordinator: HostRecord::of(root),
            regionals,
        }
    }

    /// Rebuilds the topology the record describes.
    pub fn topology(&self) -> Result<Topology> {
        let mut topology = Topology::new(
            self.coordinator.name_or("coordinator".to_string()),
            self.coordinator.address(),
        )?;
        let root = topology.root().id;
        for (r, regional) in self.regionals.iter().enumerate() {
            let regional_id = topology.attach(
                root,
                regional.host.name_or(format!("regional-{}", r + 1)),
                regional.host.address(),
            )?;
            for (e, edge) in regional.edges.iter().enumerate() {
                let edge_id = topology.attach(
                    regional_id,
                    edge.host.name_or(format!("edge-{}", e + 1)),
                    edge.host.address(),
                )?;
                for (s, sensor) in edge.sensors.iter().enumerate() {
                    topology.attach(
                        edge_id,
                        sensor.name_or(format!("sensor-{}", s + 1)),
                        sensor.address(),
                    )?;
                }
            }
        }
        Ok(topology)
    }
}

/// Where the record lives on disk.
#[derive(Clone, Debug)]
pub struct RecordStore {
    path: PathBuf,
}

impl RecordStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// The store for the record in `system_dir`.
    pub fn in_dir(system_dir: impl AsRef<Path>) -> Self {
        Self::new(system_dir.as_ref().join(RECORD_FILE))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn exists(&self) -> bool {
        self.path.is_file()
    }

    pub fn load(&self) -> Result<DeploymentRecord> {
        let json = fs::read_to_string(&self.path)?;
        Ok(serde_json::from_str(&json)?)
    }

    /// Loads the record, or creates and saves a fresh one for `topology` if there is none yet.
    pub fn load_or_create(&self, topology: impl FnOnce() -> Result<Topology>) -> Result<DeploymentRecord> {
        if self.exists() {
            return self.load();
        }
        let record = DeploymentRecord::new(&topology()?);
        self.save(&record)?;
        info!(path = %self.path.display(), "created deployment record");
        Ok(record)
    }

    /// Writes the record. Readers never see a partial file.
    pub fn save(&self, record: &DeploymentRecord) -> Result<()> {
        let json = serde_json::to_string_pretty(record)?;
        let mut staging = self.path.clone().into_os_string();
        staging.push(".tmp");
        let staging = PathBuf::from(staging);

        fs::write(&staging, json + "\n")?;
        fs::rename(&staging, &self.path)?;
        debug!(path = %self.path.display(), state = %record.state, "saved deployment record");
        Ok(())
    }
}

/// Marks the fleet deployed and persists the change before returning.
pub fn mark_deployed(record: &mut DeploymentRecord, store: &RecordStore) -> Result<()> {
    Operation::MarkDeployed.check(record)?;

    let mut updated = record.clone();
    updated.state = DeploymentState::Deployed;
    store.save(&updated)?;
    *record = updated;
    Ok(())
}

pub fn is_deployed(record: &DeploymentRecord) -> bool {
    record.state == DeploymentState::Deployed
}

/// Everything the operator can ask for, as far as the record is concerned.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Operation {
    Bootstrap,
    Deploy,
    MarkDeployed,
    UpdateVersion,
    CheckVersions,
    SaveConfiguration,
    RestoreConfiguration,
    RotateCredentials,
    SshPassthrough,
    Plan,
}

impl Operation {
    /// The state the record must be in, if any.
    pub fn required_state(self) -> Option<DeploymentState> {
        use Operation::*;
        match self {
            Bootstrap | Plan => None,
            Deploy | MarkDeployed => Some(DeploymentState::NotDeployed),
            UpdateVersion | CheckVersions | SaveConfiguration | RestoreConfiguration
            | RotateCredentials | SshPassthrough => Some(DeploymentState::Deployed),
        }
    }

    pub fn check(self, record: &DeploymentRecord) -> Result<()> {
        match self.required_state() {
            Some(required) if required != record.state => Err(Error::StateViolation {
                operation: self.to_string(),
                required: required.to_string(),
                actual: record.state.to_string(),
            }),
            _ => Ok(()),
        }
    }
}

impl Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        use Operation::*;
        f.write_str(match self {
            Bootstrap => "bootstrap",
            Deploy => "deploy",
            MarkDeployed => "mark deployed",
            UpdateVersion => "update",
            CheckVersions => "check",
            SaveConfiguration => "save configuration",
            RestoreConfiguration => "restore configuration",
            RotateCredentials => "rotate credentials",
            SshPassthrough => "ssh",
            Plan => "plan",
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::fixtures::*;

    fn topology() -> Topology {
        let path = concat!(env!("CARGO_MANIFEST_DIR"), "/resources/test/topology.yaml");
        Topology::from_file(path).unwrap()
    }

    mod record {
        use super::*;

        #[test]
        fn uses_short_tier_keys() {
            let record = DeploymentRecord::new(&scenario_b());
            let json: serde_json::Value = serde_json::to_value(&record).unwrap();
            assert_eq!("not-deployed", json["state"]);
            assert_eq!("10.0.0.1", json["sbo"]["address"]);
            assert_eq!(22, json["sbo"]["port"]);
            assert_eq!("10.0.0.2", json["las"][0]["address"]);
            assert_eq!("gate", json["las"][0]["hal"][0]["name"]);
        }

        #[test]
        fn rebuilds_topology() {
            let original = topology();
            let rebuilt = DeploymentRecord::new(&original).topology().unwrap();
            let names = |t: &Topology| -> Vec<(String, String)> {
                t.iter()
                    .map(|n| (n.name.clone(), n.address.to_string()))
                    .collect()
            };
            assert_eq!(names(&original), names(&rebuilt));
        }

        #[test]
        fn names_unnamed_nodes_by_position() {
            let json = r#"{
                "state": "deployed",
                "sbo": { "address": "10.0.0.1", "port": 22 },
                "las": [
                    { "address": "10.0.1.1", "port": 22, "hal": [ { "address": "10.0.1.2", "port": 22 } ] }
                ]
            }"#;
            let record: DeploymentRecord = serde_json::from_str(json).unwrap();
            let t = record.topology().unwrap();
            let names: Vec<&str> = t.iter().map(|n| n.name.as_str()).collect();
            assert_eq!(vec!["coordinator", "regional-1", "edge-1"], names);
            assert!(is_deployed(&record));
        }
    }

    mod store {
        use super::*;

        #[test]
        fn round_trips_through_disk() {
            let dir = tempfile::tempdir().unwrap();
            let store = RecordStore::in_dir(dir.path());
            assert!(!store.exists());

            let record = store.load_or_create(|| Ok(scenario_c())).unwrap();
            assert!(store.exists());
            assert_eq!(record, store.load().unwrap());

            // A second call must not overwrite the saved record.
            let again = store.load_or_create(|| panic!("should not rebuild")).unwrap();
            assert_eq!(record, again);
        }

        #[test]
        fn mark_deployed_persists_immediately() {
            let dir = tempfile::tempdir().unwrap();
            let store = RecordStore::in_dir(dir.path());
            let mut record = DeploymentRecord::new(&scenario_a());

            mark_deployed(&mut record, &store).unwrap();
            assert!(is_deployed(&record));
            assert!(is_deployed(&store.load().unwrap()));
        }

        #[test]
        fn second_mark_deployed_is_a_state_violation() {
            let dir = tempfile::tempdir().unwrap();
            let store = RecordStore::in_dir(dir.path());
            let mut record = DeploymentRecord::new(&scenario_a());

            mark_deployed(&mut record, &store).unwrap();
            let err = mark_deployed(&mut record, &store).unwrap_err();
            assert!(matches!(err, Error::StateViolation { .. }), "{err}");
            assert!(is_deployed(&record));
        }

        #[test]
        fn failed_save_leaves_record_unchanged() {
            let dir = tempfile::tempdir().unwrap();
            let store = RecordStore::new(dir.path().join("missing").join(RECORD_FILE));
            let mut record = DeploymentRecord::new(&scenario_a());

            assert!(mark_deployed(&mut record, &store).is_err());
            assert!(!is_deployed(&record));
        }
    }

    mod operation {
        use super::*;

        #[test]
        fn deploy_requires_fresh_record() {
            let mut record = DeploymentRecord::new(&scenario_a());
            Operation::Deploy.check(&record).unwrap();
            assert!(Operation::CheckVersions.check(&record).is_err());

            record.state = DeploymentState::Deployed;
            assert!(Operation::Deploy.check(&record).is_err());
            Operation::UpdateVersion.check(&record).unwrap();
            Operation::SshPassthrough.check(&record).unwrap();
        }

        #[test]
        fn bootstrap_and_plan_run_in_any_state() {
            let mut record = DeploymentRecord::new(&scenario_a());
            for state in [DeploymentState::NotDeployed, DeploymentState::Deployed] {
                record.state = state;
                Operation::Bootstrap.check(&record).unwrap();
                Operation::Plan.check(&record).unwrap();
            }
        }
    }
}
