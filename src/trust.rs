//! One-time trust bootstrap.
//!
//! Installs the key hierarchy top-down using password-authenticated copies: the operator's key
//! on the coordinator, the coordinator's hop key on every regional node with its own host, and
//! each regional hop key on that regional's edge nodes with their own host. Hop keys are
//! generated where they will be used, once; re-running bootstrap reinstalls the same public keys,
//! which `ssh-copy-id` treats as a no-op.
//!
//! The bootstrap password is relayed to every host that has to perform a copy and removed from
//! it once its subtree is done.

use crate::config::Settings;
use crate::core::artifact::{self, distribute, Artifact, ArtifactKind, Content, Destination};
use crate::core::plan::{build_plan, ActionSet, Context, Fragment, Layered, Plan, Step};
use crate::core::script::{quote, shell_path};
use crate::core::topology::{Node, Tier, Topology};
use crate::error::{Error, Result};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::debug;

/// The artifact name the password is staged under.
const SECRET: &str = "bootstrap";

/// The file name the password is staged under.
const PASSWORD: &str = "password";

/// The local file holding the one-time bootstrap password.
#[derive(Clone, Debug, PartialEq)]
pub struct PasswordFile {
    path: PathBuf,
}

impl PasswordFile {
    /// Opens and checks the password file. The password itself is never kept in memory.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let store_error = |reason: String| Error::PasswordStore {
            path: path.clone(),
            reason,
        };

        let contents = fs::read_to_string(&path).map_err(|err| store_error(err.to_string()))?;
        let first_line = contents.lines().next().unwrap_or_default();
        if first_line.trim().is_empty() {
            return Err(store_error("the first line is empty".to_string()));
        }
        debug!(path = %path.display(), "bootstrap password file found");
        Ok(Self { path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Whether `node` has to install keys on any of its children.
fn installs_keys(topology: &Topology, node: &Node) -> bool {
    topology
        .children(node)
        .any(|child| child.tier.executes() && !child.is_local_to_parent())
}

/// The key-installation half of bootstrap.
struct KeyInstall<'a> {
    settings: &'a Settings,
    password: &'a PasswordFile,
}

impl KeyInstall<'_> {
    fn keygen(node: &Node, key: &str) -> Fragment {
        let mut fragment = Fragment::new(node, format!("{}: generate {key}", node.name));
        if let Some(dir) = Path::new(key).parent().filter(|p| !p.as_os_str().is_empty()) {
            fragment = fragment.line(format!(
                "mkdir -p -m 700 {}",
                shell_path(&dir.display().to_string()),
            ));
        }
        let key = shell_path(key);
        fragment.line(format!(
            "test -f {key} || ssh-keygen -t ed25519 -f {key} -q -N ''",
        ))
    }
}

impl ActionSet for KeyInstall<'_> {
    fn before(&self, cx: &Context<'_>, node: &Node) -> Result<Vec<Step>> {
        if node.is_local_to_parent() {
            return Ok(Vec::new());
        }

        let credential = cx.hop_credential(node)?;
        let password = match node.parent {
            None => self.password.path().display().to_string(),
            Some(_) => artifact::staged_name(SECRET, PASSWORD),
        };
        let copy = Fragment::new(node, format!("{}: install {} key", node.name, credential.boundary))
            .line(format!(
                "sshpass -f {} ssh-copy-id -i {} -p {} -o StrictHostKeyChecking=accept-new {} </dev/null",
                shell_path(&password),
                shell_path(&format!("{}.pub", credential.key)),
                node.address.port,
                quote(&format!("{}@{}", self.settings.remote_user, node.address.host)),
            ));
        Ok(vec![copy.into()])
    }

    fn action(&self, cx: &Context<'_>, node: &Node) -> Result<Vec<Step>> {
        let key = match node.tier {
            Tier::Coordinator => &cx.credentials.coordinator,
            Tier::Regional if !node.is_local_to_parent() || installs_keys(cx.topology, node) => {
                &cx.credentials.regional
            }
            _ => return Ok(Vec::new()),
        };
        Ok(vec![Self::keygen(node, key).into()])
    }
}

/// Builds the bootstrap plan for `topology`.
///
/// Any failed copy aborts the whole plan. Bootstrap can simply be run again from the start.
pub fn bootstrap(topology: &Topology, settings: &Settings, password: &PasswordFile) -> Result<Plan> {
    let mut secret = Artifact::new(ArtifactKind::BootstrapSecret, SECRET);
    for node in topology.iter().filter(|n| installs_keys(topology, n)) {
        secret = secret.place(
            node.id,
            PASSWORD,
            Content::LocalFile(password.path().to_path_buf()),
            Destination::Staged,
        );
    }
    let distribution = distribute(&secret, topology)?;
    let keys = KeyInstall { settings, password };

    // Keys go in before the password is copied over them.
    let actions = Layered::new().with(&keys).with(&distribution);
    build_plan(topology, &actions, &settings.hop_credentials())
}
