//! Moves files down the tree, and back up it, one hop at a time.
//!
//! An [Artifact] says which node receives which file and where the file ends up. [distribute]
//! turns it into a [Distribution], an [ActionSet] that relays file contents through the staging
//! area of every session owner between the operator and the receiving node. No copy ever skips a
//! tier: a file bound for an edge node goes operator → coordinator → regional → edge, minus any
//! hop the edge or regional shares with its parent.
//!
//! The staging area is the remote user's home directory. Staged files are named
//! `.tierdeploy-<artifact>-<file>` and removed once the owner's subtree is done with them.
//!
//! [Collection] is the reverse: it gathers one file per node and relays the copies upward to
//! the operator's machine.

use crate::core::locality;
use crate::core::plan::{ActionSet, Context, Fragment, Step};
use crate::core::script::{quote, shell_path};
use crate::core::topology::{Node, NodeId, Tier, Topology};
use crate::error::{Error, Result};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use indexmap::{IndexMap, IndexSet};
use std::collections::BTreeSet;
use std::fmt::{self, Display};
use std::path::{Path, PathBuf};

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ArtifactKind {
    CertificateBundle,
    CredentialRotation,
    ConfigPayload,

    /// The one-time password used while keys are installed.
    BootstrapSecret,

    /// Application archives.
    Release,
}

impl Display for ArtifactKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ArtifactKind::CertificateBundle => "certificate bundle",
            ArtifactKind::CredentialRotation => "credential rotation",
            ArtifactKind::ConfigPayload => "configuration payload",
            ArtifactKind::BootstrapSecret => "bootstrap secret",
            ArtifactKind::Release => "release",
        };
        f.write_str(name)
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum Content {
    /// A file on the operator's machine. Relayed hop by hop.
    LocalFile(PathBuf),

    /// Bytes carried inside the script itself and decoded in the receiving node's context.
    Inline(Vec<u8>),
}

#[derive(Clone, Debug, PartialEq)]
pub enum Destination {
    /// Written to `path` with permissions `mode`.
    File { path: String, mode: u32 },

    /// Fed to a command's stdin.
    Pipe(String),

    /// A gzipped tarball unpacked into a directory.
    Extract(String),

    /// Left in the session owner's staging area for other steps to use.
    Staged,
}

#[derive(Clone, Debug, PartialEq)]
pub struct Placement {
    pub node: NodeId,

    /// A plain file name, unique within the artifact.
    pub file: String,

    pub content: Content,
    pub destination: Destination,
}

/// Something to place on a set of nodes. Built once, then only read.
#[derive(Clone, Debug, PartialEq)]
pub struct Artifact {
    pub kind: ArtifactKind,
    pub name: String,
    placements: Vec<Placement>,
}

impl Artifact {
    pub fn new(kind: ArtifactKind, name: impl Into<String>) -> Self {
        Self {
            kind,
            name: name.into(),
            placements: Vec::new(),
        }
    }

    pub fn place(
        mut self,
        node: NodeId,
        file: impl Into<String>,
        content: Content,
        destination: Destination,
    ) -> Self {
        self.placements.push(Placement {
            node,
            file: file.into(),
            content,
            destination,
        });
        self
    }

    pub fn placements(&self) -> &[Placement] {
        &self.placements
    }

    /// The nodes that must receive the artifact.
    pub fn target_set(&self) -> BTreeSet<NodeId> {
        self.placements.iter().map(|p| p.node).collect()
    }
}

/// The name a file from `artifact` is staged under in a remote user's home directory.
pub fn staged_name(artifact: &str, file: &str) -> String {
    format!(".tierdeploy-{artifact}-{file}")
}

fn validate_word(artifact: &str, what: &str, word: &str) -> Result<()> {
    let valid = !word.is_empty()
        && word
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'));
    match valid {
        true => Ok(()),
        false => Err(Error::InvalidArtifact {
            artifact: artifact.to_string(),
            reason: format!("{what} {word:?} may only hold letters, digits, '.', '_' and '-'"),
        }),
    }
}

/// Sensors execute nothing, so their placements happen on their edge.
fn receiving_node(topology: &Topology, id: NodeId) -> &Node {
    let node = topology.node(id);
    match (node.tier, topology.parent(node)) {
        (Tier::Sensor, Some(edge)) => edge,
        _ => node,
    }
}

/// The hop-by-hop plan for one [Artifact]. Layer it under an operation with
/// [Layered](crate::core::plan::Layered).
#[derive(Debug)]
pub struct Distribution<'a> {
    artifact: &'a Artifact,

    /// Staged names each session owner receives, for itself and its subtree.
    relays: IndexMap<NodeId, IndexSet<String>>,

    /// Where each staged name comes from on the operator's machine.
    sources: IndexMap<String, PathBuf>,

    /// Placements grouped by the node whose context performs them.
    placements: IndexMap<NodeId, Vec<&'a Placement>>,
}

/// Plans the copies that place `artifact` on every node in its target set.
pub fn distribute<'a>(artifact: &'a Artifact, topology: &Topology) -> Result<Distribution<'a>> {
    validate_word(&artifact.name, "artifact name", &artifact.name)?;

    let mut distribution = Distribution {
        artifact,
        relays: IndexMap::new(),
        sources: IndexMap::new(),
        placements: IndexMap::new(),
    };

    for placement in &artifact.placements {
        validate_word(&artifact.name, "file name", &placement.file)?;
        if topology.get(placement.node).is_none() {
            return Err(Error::InvalidArtifact {
                artifact: artifact.name.clone(),
                reason: format!("{:?} is not in the topology", placement.node),
            });
        }
        let receiver = receiving_node(topology, placement.node);

        if let Content::LocalFile(path) = &placement.content {
            let staged = staged_name(&artifact.name, &placement.file);
            match distribution.sources.get(&staged) {
                Some(existing) if existing != path => {
                    return Err(Error::InvalidArtifact {
                        artifact: artifact.name.clone(),
                        reason: format!(
                            "{} comes from both {} and {}",
                            placement.file,
                            existing.display(),
                            path.display(),
                        ),
                    })
                }
                Some(_) => {}
                None => {
                    distribution.sources.insert(staged.clone(), path.clone());
                }
            }
            for owner in locality::copy_chain(topology, receiver.id) {
                distribution
                    .relays
                    .entry(owner)
                    .or_default()
                    .insert(staged.clone());
            }
        }

        distribution
            .placements
            .entry(receiver.id)
            .or_default()
            .push(placement);
    }
    Ok(distribution)
}

impl Distribution<'_> {
    /// The number of copies that carry a file to `id`: one per session owner on the way.
    pub fn hops(&self, topology: &Topology, id: NodeId) -> usize {
        locality::copy_chain(topology, id)
            .into_iter()
            .filter(|owner| self.relays.contains_key(owner))
            .count()
    }

    /// Staged names relayed to `owner`.
    pub fn relayed_to(&self, owner: NodeId) -> Vec<&str> {
        self.relays
            .get(&owner)
            .map(|names| names.iter().map(String::as_str).collect())
            .unwrap_or_default()
    }

    fn placement_fragment(&self, node: &Node, placement: &Placement) -> Fragment {
        let staged = staged_name(&self.artifact.name, &placement.file);
        let fragment = Fragment::new(
            node,
            format!("{}: {} {}", node.name, self.artifact.name, placement.file),
        );

        // How to produce the content on stdin, for the inline case.
        let decode = |bytes: &[u8]| format!("printf '%s' {} | base64 -d", quote(&BASE64.encode(bytes)));

        match (&placement.content, &placement.destination) {
            (Content::LocalFile(_), Destination::File { path, mode }) => fragment.line(format!(
                "install -D -m {mode:04o} {} {}",
                quote(&staged),
                shell_path(path),
            )),
            (Content::Inline(bytes), Destination::File { path, mode }) => {
                let dir = Path::new(path)
                    .parent()
                    .map(|p| p.display().to_string())
                    .filter(|p| !p.is_empty());
                let fragment = match dir {
                    Some(dir) => fragment.line(format!("mkdir -p {}", shell_path(&dir))),
                    None => fragment,
                };
                fragment
                    .line(format!("{} > {}", decode(bytes), shell_path(path)))
                    .line(format!("chmod {mode:04o} {}", shell_path(path)))
            }
            (Content::LocalFile(_), Destination::Pipe(command)) => {
                fragment.line(format!("{command} < {}", quote(&staged)))
            }
            (Content::Inline(bytes), Destination::Pipe(command)) => {
                fragment.line(format!("{} | {command}", decode(bytes)))
            }
            (Content::LocalFile(_), Destination::Extract(dir)) => fragment
                .line(format!("mkdir -p {}", shell_path(dir)))
                .line(format!("tar -xzf {} -C {}", quote(&staged), shell_path(dir))),
            (Content::Inline(bytes), Destination::Extract(dir)) => fragment
                .line(format!("mkdir -p {}", shell_path(dir)))
                .line(format!("{} | tar -xz -C {}", decode(bytes), shell_path(dir))),
            (Content::LocalFile(_), Destination::Staged) => fragment,
            (Content::Inline(bytes), Destination::Staged) => {
                fragment.line(format!("{} > {}", decode(bytes), quote(&staged)))
            }
        }
    }
}

impl ActionSet for Distribution<'_> {
    fn before(&self, cx: &Context<'_>, node: &Node) -> Result<Vec<Step>> {
        if node.is_local_to_parent() {
            return Ok(Vec::new());
        }
        let Some(names) = self.relays.get(&node.id) else {
            return Ok(Vec::new());
        };

        let mut steps = Vec::with_capacity(names.len());
        for staged in names {
            // The coordinator is fed from the operator's machine, everything else from the
            // parent session owner's staging area.
            let source = match node.parent {
                None => match self.sources.get(staged) {
                    Some(path) => path.display().to_string(),
                    None => {
                        return Err(Error::InvalidArtifact {
                            artifact: self.artifact.name.clone(),
                            reason: format!("no source for {staged}"),
                        })
                    }
                },
                Some(_) => staged.clone(),
            };
            steps.push(cx.upload(node, vec![source], staged.clone())?);
        }
        Ok(steps)
    }

    fn action(&self, _cx: &Context<'_>, node: &Node) -> Result<Vec<Step>> {
        let steps = self
            .placements
            .get(&node.id)
            .into_iter()
            .flatten()
            .map(|placement| self.placement_fragment(node, placement))
            .filter(|fragment| !fragment.is_empty())
            .map(Step::from)
            .collect();
        Ok(steps)
    }

    fn after_children(&self, _cx: &Context<'_>, node: &Node) -> Result<Vec<Step>> {
        if node.is_local_to_parent() {
            return Ok(Vec::new());
        }
        let Some(names) = self.relays.get(&node.id) else {
            return Ok(Vec::new());
        };
        let quoted: Vec<String> = names.iter().map(|n| quote(n)).collect();
        let cleanup = Fragment::new(node, format!("{}: clean {}", node.name, self.artifact.name))
            .line(format!("rm -f {}", quoted.join(" ")));
        Ok(vec![cleanup.into()])
    }
}

/// One file to fetch from a node.
#[derive(Clone, Debug, PartialEq)]
pub struct CollectItem {
    pub node: NodeId,

    /// Where the file lives on the node.
    pub remote_path: String,

    /// Where it should end up, relative to the collection's local directory.
    pub local_path: PathBuf,
}

/// Gathers files from nodes into a directory on the operator's machine.
#[derive(Debug)]
pub struct Collection {
    name: String,
    local_dir: PathBuf,

    /// Items grouped by the node whose context copies them into staging.
    items: IndexMap<NodeId, Vec<(String, CollectItem)>>,

    /// Staged names each session owner passes upward.
    relays: IndexMap<NodeId, IndexSet<String>>,
}

/// Plans the copies that bring every item back to `local_dir`.
pub fn collect(
    name: impl Into<String>,
    items: Vec<CollectItem>,
    topology: &Topology,
    local_dir: impl Into<PathBuf>,
) -> Result<Collection> {
    let name = name.into();
    validate_word(&name, "collection name", &name)?;

    let mut collection = Collection {
        name,
        local_dir: local_dir.into(),
        items: IndexMap::new(),
        relays: IndexMap::new(),
    };

    for item in items {
        if topology.get(item.node).is_none() {
            return Err(Error::InvalidArtifact {
                artifact: collection.name.clone(),
                reason: format!("{:?} is not in the topology", item.node),
            });
        }
        let node = receiving_node(topology, item.node);
        let index = collection.items.get(&node.id).map_or(0, Vec::len);
        let staged = staged_name(&collection.name, &format!("{}-{index}", node.position));

        for owner in locality::copy_chain(topology, node.id) {
            collection
                .relays
                .entry(owner)
                .or_default()
                .insert(staged.clone());
        }
        collection
            .items
            .entry(node.id)
            .or_default()
            .push((staged, item));
    }
    Ok(collection)
}

impl Collection {
    /// The number of copies that carry `id`'s file back to the operator.
    pub fn hops(&self, topology: &Topology, id: NodeId) -> usize {
        locality::copy_chain(topology, id)
            .into_iter()
            .filter(|owner| self.relays.contains_key(owner))
            .count()
    }

    fn local_path(&self, relative: &Path) -> String {
        self.local_dir.join(relative).display().to_string()
    }
}

impl ActionSet for Collection {
    fn before(&self, _cx: &Context<'_>, node: &Node) -> Result<Vec<Step>> {
        if node.parent.is_some() {
            return Ok(Vec::new());
        }
        let prepare = Fragment::operator(format!("prepare {}", self.name))
            .line(format!("mkdir -p {}", shell_path(&self.local_path(Path::new("")))));
        Ok(vec![prepare.into()])
    }

    fn action(&self, _cx: &Context<'_>, node: &Node) -> Result<Vec<Step>> {
        let mut fragment = Fragment::new(node, format!("{}: stage {}", node.name, self.name));
        if !node.is_local_to_parent() && self.relays.contains_key(&node.id) {
            // Drop leftovers from an interrupted run before staging anything new.
            fragment = fragment.line(format!(
                "rm -f {}*",
                quote(&staged_name(&self.name, "")),
            ));
        }
        for (staged, item) in self.items.get(&node.id).into_iter().flatten() {
            fragment = fragment.line(format!(
                "cp {} {}",
                shell_path(&item.remote_path),
                quote(staged),
            ));
        }
        Ok(match fragment.is_empty() {
            true => Vec::new(),
            false => vec![fragment.into()],
        })
    }

    fn after(&self, cx: &Context<'_>, node: &Node) -> Result<Vec<Step>> {
        if node.is_local_to_parent() {
            return Ok(Vec::new());
        }
        let Some(names) = self.relays.get(&node.id) else {
            return Ok(Vec::new());
        };

        let sources = names.iter().cloned().collect();
        let mut steps = Vec::new();
        match node.parent {
            Some(_) => steps.push(cx.download(node, sources, ".".to_string())?),
            None => {
                steps.push(cx.download(node, sources, self.local_path(Path::new("")))?);

                let mut organize = Fragment::operator(format!("organize {}", self.name));
                for (staged, item) in self.items.values().flatten() {
                    let target = self.local_path(&item.local_path);
                    if let Some(parent) = Path::new(&target).parent() {
                        organize = organize
                            .line(format!("mkdir -p {}", shell_path(&parent.display().to_string())));
                    }
                    organize = organize.line(format!(
                        "mv {} {}",
                        shell_path(&self.local_path(Path::new(staged))),
                        shell_path(&target),
                    ));
                }
                steps.push(organize.into());
            }
        }
        Ok(steps)
    }
}

#[cfg(test)]
mod test;
