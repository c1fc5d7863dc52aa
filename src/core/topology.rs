//! The typed fleet tree: one coordinator, regional nodes beneath it, edge nodes beneath those,
//! and sensors hanging off the edges.
//!
//! Nodes live in an arena owned by [Topology] and refer to each other by [NodeId]. Ownership is
//! top-down only; a node's `parent` is an index, never an owning reference.
//!
//! Every structural edit validates the node it touches and recomputes locality for it, so a
//! [Topology] that exists is always well formed.

use crate::core::locality;
use crate::error::{Error, Result};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt::{self, Display};
use std::fs;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

/// The default SSH port.
pub const SSH_PORT: u16 = 22;

#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct NodeId(usize);

impl NodeId {
    pub fn index(self) -> usize {
        self.0
    }

    #[cfg(test)]
    pub fn from_index(index: usize) -> Self {
        NodeId(index)
    }
}

#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum Tier {
    Coordinator,
    Regional,
    Edge,
    Sensor,
}

impl Tier {
    /// The tier of this tier's children, if it may have any.
    pub fn child(self) -> Option<Tier> {
        match self {
            Tier::Coordinator => Some(Tier::Regional),
            Tier::Regional => Some(Tier::Edge),
            Tier::Edge => Some(Tier::Sensor),
            Tier::Sensor => None,
        }
    }

    /// Whether nodes of this tier host remote sessions.
    pub fn executes(self) -> bool {
        self != Tier::Sensor
    }
}

impl Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Tier::Coordinator => "coordinator",
            Tier::Regional => "regional",
            Tier::Edge => "edge",
            Tier::Sensor => "sensor",
        };
        f.write_str(name)
    }
}

#[derive(Clone, Debug, Deserialize, Eq, Hash, PartialEq, Serialize)]
pub struct Address {
    pub host: String,
    pub port: u16,
}

impl Address {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// An address on the default SSH port.
    pub fn ssh(host: impl Into<String>) -> Self {
        Self::new(host, SSH_PORT)
    }

    /// The host as `scp` expects it in a `host:path` argument.
    pub fn scp_host(&self) -> String {
        if self.host.contains(':') {
            format!("[{}]", self.host)
        } else {
            self.host.clone()
        }
    }

    fn validate(&self, node: &str) -> Result<()> {
        let invalid = |reason: &str| Error::InvalidAddress {
            node: node.to_string(),
            reason: reason.to_string(),
        };

        if self.port == 0 {
            return Err(invalid("port must not be zero"));
        }
        if self.host.parse::<IpAddr>().is_ok() {
            return Ok(());
        }
        if self.host.len() > 253 || !hostname_regex().is_match(&self.host) {
            return Err(invalid(&format!("{:?} is neither an IP address nor a host name", self.host)));
        }
        Ok(())
    }
}

impl Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

fn hostname_regex() -> &'static Regex {
    static HOSTNAME: OnceLock<Regex> = OnceLock::new();
    HOSTNAME.get_or_init(|| {
        Regex::new(r"^[A-Za-z0-9]([A-Za-z0-9-]{0,61}[A-Za-z0-9])?(\.[A-Za-z0-9]([A-Za-z0-9-]{0,61}[A-Za-z0-9])?)*$")
            .unwrap()
    })
}

fn name_regex() -> &'static Regex {
    static NAME: OnceLock<Regex> = OnceLock::new();
    NAME.get_or_init(|| Regex::new(r"^[A-Za-z0-9][A-Za-z0-9_.-]*$").unwrap())
}

/// One-based position of a node among its siblings at every tier on its path.
#[derive(Clone, Copy, Debug, Default, Eq, Hash, PartialEq)]
pub struct Position {
    pub regional: Option<usize>,
    pub edge: Option<usize>,
    pub sensor: Option<usize>,
}

impl Display for Position {
    /// Formats as `r1-e2-s3`, or `root` for the coordinator.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = [("r", self.regional), ("e", self.edge), ("s", self.sensor)]
            .into_iter()
            .filter_map(|(tag, index)| index.map(|i| format!("{tag}{i}")))
            .collect();
        match parts.is_empty() {
            true => f.write_str("root"),
            false => f.write_str(&parts.join("-")),
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct Node {
    pub id: NodeId,
    pub name: String,
    pub tier: Tier,
    pub address: Address,
    pub parent: Option<NodeId>,
    pub children: Vec<NodeId>,
    pub position: Position,
    local_to_parent: bool,
}

impl Node {
    /// Whether this node shares its parent's host, so that reaching it takes no extra hop.
    /// Always `false` for the coordinator.
    pub fn is_local_to_parent(&self) -> bool {
        self.local_to_parent
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct Topology {
    nodes: Vec<Node>,
}

impl Topology {
    /// Creates a topology holding only its coordinator.
    pub fn new(name: impl Into<String>, address: Address) -> Result<Self> {
        let name = name.into();
        validate_name(&name)?;
        address.validate(&name)?;

        let root = Node {
            id: NodeId(0),
            name,
            tier: Tier::Coordinator,
            address,
            parent: None,
            children: Vec::new(),
            position: Position::default(),
            local_to_parent: false,
        };
        Ok(Self { nodes: vec![root] })
    }

    pub fn root(&self) -> &Node {
        &self.nodes[0]
    }

    /// Returns the node for `id`.
    ///
    /// # Panics
    ///
    /// Panics if `id` came from another [Topology].
    pub fn node(&self, id: NodeId) -> &Node {
        &self.nodes[id.0]
    }

    pub fn get(&self, id: NodeId) -> Option<&Node> {
        self.nodes.get(id.0)
    }

    pub fn parent(&self, node: &Node) -> Option<&Node> {
        node.parent.map(|id| self.node(id))
    }

    pub fn children<'a>(&'a self, node: &'a Node) -> impl Iterator<Item = &'a Node> + 'a {
        node.children.iter().map(|&id| self.node(id))
    }

    /// Every node in depth-first pre-order, parents before their descendants.
    pub fn iter(&self) -> impl Iterator<Item = &Node> + '_ {
        let mut stack = vec![self.root().id];
        std::iter::from_fn(move || {
            let id = stack.pop()?;
            let node = self.node(id);
            stack.extend(node.children.iter().rev());
            Some(node)
        })
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// The node's ancestors, nearest first.
    pub fn ancestors<'a>(&'a self, node: &'a Node) -> impl Iterator<Item = &'a Node> + 'a {
        std::iter::successors(self.parent(node), move |n| self.parent(n))
    }

    pub fn depth(&self, node: &Node) -> usize {
        self.ancestors(node).count()
    }

    /// Looks a node up by the names on its path below the coordinator.
    pub fn find(&self, path: &[&str]) -> Option<&Node> {
        let mut node = self.root();
        for name in path {
            node = self.children(node).find(|child| child.name == *name)?;
        }
        Some(node)
    }

    /// The names on the node's path below the coordinator, as a relative path. Empty for the
    /// coordinator.
    pub fn local_dir(&self, node: &Node) -> PathBuf {
        let mut names: Vec<&str> = std::iter::once(node)
            .chain(self.ancestors(node))
            .filter(|n| n.parent.is_some())
            .map(|n| n.name.as_str())
            .collect();
        names.reverse();
        names.iter().collect()
    }

    /// Attaches a new child under `parent`. The child's tier follows from the parent's.
    pub fn attach(
        &mut self,
        parent: NodeId,
        name: impl Into<String>,
        address: Address,
    ) -> Result<NodeId> {
        let name = name.into();
        let parent_node = self
            .get(parent)
            .ok_or_else(|| Error::InvalidTopology(format!("no parent for {name}")))?;
        let tier = parent_node.tier.child().ok_or_else(|| {
            Error::InvalidTopology(format!(
                "{} is a {} and cannot have children",
                parent_node.name, parent_node.tier,
            ))
        })?;

        validate_name(&name)?;
        if self.children(parent_node).any(|sibling| sibling.name == name) {
            return Err(Error::InvalidTopology(format!(
                "{} already has a child named {name}",
                parent_node.name,
            )));
        }
        address.validate(&name)?;

        let index = parent_node.children.len() + 1;
        let mut position = parent_node.position;
        match tier {
            Tier::Regional => position.regional = Some(index),
            Tier::Edge => position.edge = Some(index),
            Tier::Sensor => position.sensor = Some(index),
            Tier::Coordinator => unreachable!("coordinators are never children"),
        }

        let id = NodeId(self.nodes.len());
        let mut node = Node {
            id,
            name,
            tier,
            address,
            parent: Some(parent),
            children: Vec::new(),
            position,
            local_to_parent: false,
        };
        node.local_to_parent = self.check_locality(&node)?;

        self.nodes.push(node);
        self.nodes[parent.0].children.push(id);
        Ok(id)
    }

    /// Changes a node's address and recomputes locality for it and its children.
    pub fn readdress(&mut self, id: NodeId, address: Address) -> Result<()> {
        let node = self
            .get(id)
            .ok_or_else(|| Error::InvalidTopology(format!("unknown node {id:?}")))?;
        address.validate(&node.name)?;

        let mut updated = node.clone();
        updated.address = address;
        updated.local_to_parent = self.check_locality(&updated)?;

        // Validate every child against the new address before changing anything.
        let mut child_locality = Vec::with_capacity(updated.children.len());
        for &child in &updated.children {
            let child = self.node(child);
            child_locality.push((child.id, check_pair(child, &updated)?));
        }

        self.nodes[id.0] = updated;
        for (child, local) in child_locality {
            self.nodes[child.0].local_to_parent = local;
        }
        Ok(())
    }

    fn check_locality(&self, node: &Node) -> Result<bool> {
        match self.parent(node) {
            Some(parent) => check_pair(node, parent),
            None => Ok(false),
        }
    }

    /// Reads a topology file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let yaml = fs::read_to_string(path)?;
        Self::from_yaml(&yaml)
    }

    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let file: TopologyFile = serde_yaml::from_str(yaml)?;
        file.build()
    }
}

/// Computes whether `node` is local to `parent`, rejecting hosts shared on different ports.
fn check_pair(node: &Node, parent: &Node) -> Result<bool> {
    let local = locality::same_host(&node.address, &parent.address);
    if local && node.tier.executes() && node.address.port != parent.address.port {
        return Err(Error::AddressConflict {
            node: node.name.clone(),
            host: node.address.host.clone(),
            port: node.address.port,
            parent_port: parent.address.port,
        });
    }
    Ok(local)
}

fn validate_name(name: &str) -> Result<()> {
    match name_regex().is_match(name) {
        true => Ok(()),
        false => Err(Error::InvalidTopology(format!(
            "{name:?} is not a valid node name (letters, digits, '.', '_' and '-' only)"
        ))),
    }
}

/// The on-disk topology description.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct TopologyFile {
    pub coordinator: CoordinatorEntry,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct CoordinatorEntry {
    pub name: String,
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default)]
    pub regionals: Vec<RegionalEntry>,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct RegionalEntry {
    pub name: String,
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default)]
    pub edges: Vec<EdgeEntry>,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct EdgeEntry {
    pub name: String,
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default)]
    pub sensors: Vec<SensorEntry>,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct SensorEntry {
    pub device: String,
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

fn default_port() -> u16 {
    SSH_PORT
}

impl TopologyFile {
    pub fn build(&self) -> Result<Topology> {
        let c = &self.coordinator;
        let mut topology = Topology::new(&c.name, Address::new(&c.host, c.port))?;
        let root = topology.root().id;
        for r in &c.regionals {
            let regional = topology.attach(root, &r.name, Address::new(&r.host, r.port))?;
            for e in &r.edges {
                let edge = topology.attach(regional, &e.name, Address::new(&e.host, e.port))?;
                for s in &e.sensors {
                    topology.attach(edge, &s.device, Address::new(&s.host, s.port))?;
                }
            }
        }
        Ok(topology)
    }
}
