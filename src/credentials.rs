//! Login password rotation.
//!
//! Each rotation draws fresh random tokens: one for the coordinator, one for each regional node
//! with its own host, and one shared by every edge node with its own host. Nodes that share their
//! parent's host share its account, so they get nothing. The tokens travel inside the script and
//! are fed to `chpasswd` on each node; they are written to a local record only after the
//! rotation ran everywhere.

use crate::core::artifact::{Artifact, ArtifactKind, Content, Destination};
use crate::core::topology::{Node, NodeId, Tier, Topology};
use crate::error::Result;
use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use rand::distributions::Alphanumeric;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::os::unix::fs::OpenOptionsExt;
use std::path::Path;
use tracing::info;

/// The name of the record file in the system directory.
pub const CREDENTIALS_FILE: &str = "credentials.json";

const TOKEN_LENGTH: usize = 24;

pub fn generate_token() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(TOKEN_LENGTH)
        .map(char::from)
        .collect()
}

#[derive(Clone, Debug, PartialEq)]
pub struct RotationTokens {
    pub coordinator: String,
    pub regionals: IndexMap<NodeId, String>,

    /// Shared by every edge node with its own host. `None` if there is no such node.
    pub edge: Option<String>,
}

impl RotationTokens {
    pub fn generate(topology: &Topology) -> Self {
        let remote = |tier: Tier| {
            topology
                .iter()
                .filter(move |n| n.tier == tier && !n.is_local_to_parent())
        };
        Self {
            coordinator: generate_token(),
            regionals: remote(Tier::Regional)
                .map(|n| (n.id, generate_token()))
                .collect(),
            edge: remote(Tier::Edge).next().map(|_| generate_token()),
        }
    }

    /// The token `node` receives, if any.
    pub fn token_for(&self, node: &Node) -> Option<&str> {
        if node.is_local_to_parent() {
            return None;
        }
        match node.tier {
            Tier::Coordinator => Some(self.coordinator.as_str()),
            Tier::Regional => self.regionals.get(&node.id).map(String::as_str),
            Tier::Edge => self.edge.as_deref(),
            Tier::Sensor => None,
        }
    }

    /// The artifact that sets `user`'s password on every node with a token.
    pub fn artifact(&self, topology: &Topology, user: &str) -> Artifact {
        let mut artifact = Artifact::new(ArtifactKind::CredentialRotation, "credentials");
        for node in topology.iter() {
            if let Some(token) = self.token_for(node) {
                artifact = artifact.place(
                    node.id,
                    "password",
                    Content::Inline(format!("{user}:{token}\n").into_bytes()),
                    Destination::Pipe("chpasswd".to_string()),
                );
            }
        }
        artifact
    }

    pub fn record(&self, topology: &Topology, user: &str) -> CredentialRecord {
        let entry = |node: &Node, password: &str| NodeCredential {
            name: node.name.clone(),
            address: node.address.to_string(),
            password: password.to_string(),
        };
        let root = topology.root();
        CredentialRecord {
            generated_at: Utc::now(),
            user: user.to_string(),
            coordinator: entry(root, &self.coordinator),
            regionals: topology
                .iter()
                .filter_map(|n| self.regionals.get(&n.id).map(|token| entry(n, token)))
                .collect(),
            edge: self.edge.clone(),
        }
    }
}

#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct NodeCredential {
    pub name: String,
    pub address: String,
    pub password: String,
}

/// The passwords in force after the last successful rotation.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct CredentialRecord {
    pub generated_at: DateTime<Utc>,
    pub user: String,
    pub coordinator: NodeCredential,
    pub regionals: Vec<NodeCredential>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub edge: Option<String>,
}

impl CredentialRecord {
    /// Writes the record readable by the owner only.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let json = serde_json::to_string_pretty(self)?;
        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(0o600)
            .open(path)?;
        file.write_all(json.as_bytes())?;
        file.write_all(b"\n")?;
        info!(path = %path.display(), "saved rotated credentials");
        Ok(())
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        Ok(serde_json::from_str(&fs::read_to_string(path)?)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::artifact::distribute;
    use crate::core::fixtures::*;

    #[test]
    fn tokens_are_random_alphanumerics() {
        let a = generate_token();
        let b = generate_token();
        assert_eq!(TOKEN_LENGTH, a.len());
        assert!(a.chars().all(|c| c.is_ascii_alphanumeric()));
        assert_ne!(a, b);
    }

    #[test]
    fn local_nodes_get_no_token() {
        let t = scenario_a();
        let tokens = RotationTokens::generate(&t);
        let north = t.find(&["north"]).unwrap();
        let gate = t.find(&["north", "gate"]).unwrap();

        assert!(tokens.regionals.is_empty());
        assert_eq!(None, tokens.token_for(north));
        assert_eq!(tokens.edge.as_deref(), tokens.token_for(gate));
        assert!(tokens.edge.is_some());
    }

    #[test]
    fn edges_share_one_token() {
        let t = scenario_c();
        let tokens = RotationTokens::generate(&t);
        assert_eq!(2, tokens.regionals.len());

        let edge_tokens: Vec<&str> = t
            .iter()
            .filter(|n| n.tier == Tier::Edge)
            .filter_map(|n| tokens.token_for(n))
            .collect();
        assert_eq!(4, edge_tokens.len());
        assert!(edge_tokens.iter().all(|token| Some(*token) == tokens.edge.as_deref()));
    }

    #[test]
    fn artifact_pipes_into_chpasswd() {
        let t = scenario_b();
        let tokens = RotationTokens::generate(&t);
        let artifact = tokens.artifact(&t, "fleet");

        // gate shares north's host and account.
        assert_eq!(2, artifact.placements().len());
        let first = &artifact.placements()[0];
        assert_eq!(Destination::Pipe("chpasswd".into()), first.destination);
        assert_eq!(
            Content::Inline(format!("fleet:{}\n", tokens.coordinator).into_bytes()),
            first.content,
        );

        // Inline content needs no copies.
        let distribution = distribute(&artifact, &t).unwrap();
        assert_eq!(0, distribution.hops(&t, t.find(&["north", "gate"]).unwrap().id));
    }

    #[test]
    fn record_saves_owner_only() {
        use std::os::unix::fs::PermissionsExt;

        let t = scenario_c();
        let tokens = RotationTokens::generate(&t);
        let record = tokens.record(&t, "fleet");
        assert_eq!(2, record.regionals.len());
        assert_eq!("region-1", record.regionals[0].name);

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(CREDENTIALS_FILE);
        record.save(&path).unwrap();

        let mode = fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(0o600, mode & 0o777);
        assert_eq!(record, CredentialRecord::load(&path).unwrap());
    }
}
