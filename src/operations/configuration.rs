//! Saving and restoring each service's `config.json`.
//!
//! On the operator's machine, configurations live in a directory tree that mirrors the
//! topology: the coordinator's at the top, each regional's in a directory named after it, each
//! edge's below its regional's.

use super::{each_tier, Fleet};
use crate::core::artifact::{
    collect, distribute, Artifact, ArtifactKind, CollectItem, Content, Destination,
};
use crate::core::plan::{Fragment, Layered, Plan};
use crate::core::script::quote;
use crate::core::topology::{Node, Topology};
use crate::error::{Error, Result};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

pub const CONFIG_FILE: &str = "config.json";

/// Supplies the configuration payload for a node.
pub trait PayloadSource {
    fn payload(&self, topology: &Topology, node: &Node) -> Result<Vec<u8>>;
}

/// Reads payloads from a directory laid out like the topology.
#[derive(Clone, Debug)]
pub struct DirectoryPayloadSource {
    root: PathBuf,
}

impl DirectoryPayloadSource {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn path_for(&self, topology: &Topology, node: &Node) -> PathBuf {
        self.root.join(topology.local_dir(node)).join(CONFIG_FILE)
    }
}

impl PayloadSource for DirectoryPayloadSource {
    fn payload(&self, topology: &Topology, node: &Node) -> Result<Vec<u8>> {
        let path = self.path_for(topology, node);
        let missing = |reason: String| Error::MissingPayload {
            node: node.name.clone(),
            reason,
        };

        let bytes = fs::read(&path).map_err(|err| match err.kind() {
            io::ErrorKind::NotFound => missing(format!("{} does not exist", path.display())),
            _ => missing(format!("{}: {err}", path.display())),
        })?;
        serde_json::from_slice::<serde_json::Value>(&bytes)
            .map_err(|err| missing(format!("{} is not valid JSON: {err}", path.display())))?;
        Ok(bytes)
    }
}

impl Fleet<'_> {
    /// Every node's configuration payload, written into its service directory.
    pub(super) fn payload_artifact(&self, payloads: &dyn PayloadSource) -> Result<Artifact> {
        let mut artifact = Artifact::new(ArtifactKind::ConfigPayload, "config");
        for node in self.executing() {
            artifact = artifact.place(
                node.id,
                CONFIG_FILE,
                Content::Inline(payloads.payload(self.topology, node)?),
                Destination::File {
                    path: format!("{}/{CONFIG_FILE}", self.service_dir(node)?),
                    mode: 0o600,
                },
            );
        }
        Ok(artifact)
    }

    /// Fetches every node's configuration into `local_dir`.
    pub fn save_configuration(&self, local_dir: &Path) -> Result<Plan> {
        let mut items = Vec::new();
        for node in self.executing() {
            items.push(CollectItem {
                node: node.id,
                remote_path: format!("{}/{CONFIG_FILE}", self.service_dir(node)?),
                local_path: self.topology.local_dir(node).join(CONFIG_FILE),
            });
        }
        let collection = collect("config", items, self.topology, local_dir)?;
        self.plan(&collection)
    }

    /// Pushes every node's configuration and restarts its service.
    pub fn restore_configuration(&self, payloads: &dyn PayloadSource) -> Result<Plan> {
        let configs = self.payload_artifact(payloads)?;
        let configs = distribute(&configs, self.topology)?;

        let restart = |node: &Node| -> Result<Fragment> {
            let service = quote(&self.service(node)?.name);
            Ok(Fragment::new(node, format!("{}: restart {service}", node.name))
                .line(format!("systemctl restart {service}")))
        };
        let restart = each_tier(&restart);
        self.plan(&Layered::new().with(&configs).with(&restart))
    }
}
