//! Types for representing one operation as a nested sequence of steps, and the builder that walks
//! a [Topology] to produce them.
//!
//! An operation is described by an [ActionSet]: hooks that produce steps for a node before its
//! session opens, inside it, after its descendants, and after it closes. [build_plan] calls those
//! hooks in depth-first pre-order and decides where sessions open. A node that shares its parent's
//! host gets no session of its own; its steps are emitted inline in the parent's session.
//!
//! Plans are built, flattened to a [Script](crate::core::script::Script), and discarded.

use crate::core::delimiter::{Delimiter, DelimiterRegistry};
use crate::core::topology::{Address, Node, NodeId, Tier, Topology};
use crate::error::{Error, Result};
use std::fmt::{self, Display};

/// What happens when a command fails.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum FailurePolicy {
    /// Stop at the first failing command. Later siblings are not attempted and nothing already
    /// done is rolled back.
    #[default]
    AbortOnFirstFailure,

    /// Keep going, note each failing fragment, and print the notes when the session ends.
    CollectAndReport,
}

/// A few lines of shell to run in the current context.
#[derive(Clone, Debug, PartialEq)]
pub struct Fragment {
    /// The node the lines act on, if any.
    pub node: Option<NodeId>,

    /// A short name used in reports and warnings.
    pub label: String,

    pub lines: Vec<String>,
}

impl Fragment {
    pub fn new(node: &Node, label: impl Into<String>) -> Self {
        Self {
            node: Some(node.id),
            label: label.into(),
            lines: Vec::new(),
        }
    }

    /// A fragment that runs on the operator's machine and targets no particular node.
    pub fn operator(label: impl Into<String>) -> Self {
        Self {
            node: None,
            label: label.into(),
            lines: Vec::new(),
        }
    }

    pub fn line(mut self, line: impl Into<String>) -> Self {
        self.lines.push(line.into());
        self
    }

    pub fn lines<I, S>(mut self, lines: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.lines.extend(lines.into_iter().map(Into::into));
        self
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }
}

impl From<Fragment> for Step {
    fn from(fragment: Fragment) -> Self {
        Step::RunLocal(fragment)
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum Step {
    /// Run lines in whatever context is current: the operator's shell or an open session.
    RunLocal(Fragment),

    /// Open a session on another host and run the nested steps there.
    RunRemote(RemoteSession),

    /// Copy files between the current context and an adjacent host.
    Transfer(Transfer),
}

impl Step {
    /// The node this step targets, if any.
    pub fn node(&self) -> Option<NodeId> {
        match self {
            Step::RunLocal(fragment) => fragment.node,
            Step::RunRemote(session) => Some(session.node),
            Step::Transfer(transfer) => Some(transfer.node),
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct RemoteSession {
    pub node: NodeId,
    pub credential: HopCredential,
    pub user: String,
    pub address: Address,
    pub delimiter: Delimiter,
    pub steps: Vec<Step>,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Direction {
    /// From the current context to the node.
    Upload,

    /// From the node to the current context.
    Download,
}

/// A single-hop copy. Sources and destination are paths as seen by the side that holds them.
#[derive(Clone, Debug, PartialEq)]
pub struct Transfer {
    /// The node at the far end of the hop.
    pub node: NodeId,
    pub direction: Direction,
    pub credential: HopCredential,
    pub user: String,
    pub address: Address,
    pub sources: Vec<String>,
    pub destination: String,
}

/// The tier boundary a key pair authenticates.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum Boundary {
    OperatorToCoordinator,
    CoordinatorToRegional,
    RegionalToEdge,
}

impl Display for Boundary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Boundary::OperatorToCoordinator => "operator->coordinator",
            Boundary::CoordinatorToRegional => "coordinator->regional",
            Boundary::RegionalToEdge => "regional->edge",
        };
        f.write_str(name)
    }
}

/// The private key used for one hop, as a path on the host that makes the hop.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct HopCredential {
    pub boundary: Boundary,
    pub key: String,
}

/// Which key to use at each tier boundary, and the account to log in as.
///
/// The coordinator and regional keys are paths relative to the remote user's home directory on
/// the host that owns the session making the hop.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct HopCredentials {
    pub user: String,
    pub operator: String,
    pub coordinator: String,
    pub regional: String,
}

impl HopCredentials {
    /// The credential for hopping onto a node of `tier`. Sensors are never hop targets.
    pub fn for_tier(&self, tier: Tier) -> Option<HopCredential> {
        let (boundary, key) = match tier {
            Tier::Coordinator => (Boundary::OperatorToCoordinator, &self.operator),
            Tier::Regional => (Boundary::CoordinatorToRegional, &self.coordinator),
            Tier::Edge => (Boundary::RegionalToEdge, &self.regional),
            Tier::Sensor => return None,
        };
        Some(HopCredential {
            boundary,
            key: key.clone(),
        })
    }
}

/// What hooks can see while a plan is being built.
pub struct Context<'a> {
    pub topology: &'a Topology,
    pub credentials: &'a HopCredentials,
}

impl<'a> Context<'a> {
    pub fn new(topology: &'a Topology, credentials: &'a HopCredentials) -> Self {
        Self {
            topology,
            credentials,
        }
    }

    /// The credential used to reach `node`'s session.
    pub fn hop_credential(&self, node: &Node) -> Result<HopCredential> {
        self.credentials
            .for_tier(node.tier)
            .ok_or_else(|| Error::InvalidTopology(format!("{} is not a session target", node.name)))
    }

    /// Copies `sources` from the current context to `node`, which must own its session.
    pub fn upload(&self, node: &Node, sources: Vec<String>, destination: String) -> Result<Step> {
        self.transfer(node, Direction::Upload, sources, destination)
    }

    /// Copies `sources` from `node`, which must own its session, to the current context.
    pub fn download(&self, node: &Node, sources: Vec<String>, destination: String) -> Result<Step> {
        self.transfer(node, Direction::Download, sources, destination)
    }

    fn transfer(
        &self,
        node: &Node,
        direction: Direction,
        sources: Vec<String>,
        destination: String,
    ) -> Result<Step> {
        if node.is_local_to_parent() || !node.tier.executes() {
            return Err(Error::InvalidTopology(format!(
                "{} has no session of its own to copy to or from",
                node.name,
            )));
        }
        Ok(Step::Transfer(Transfer {
            node: node.id,
            direction,
            credential: self.hop_credential(node)?,
            user: self.credentials.user.clone(),
            address: node.address.clone(),
            sources,
            destination,
        }))
    }
}

/// The varying part of an operation.
///
/// Hooks run for every coordinator, regional and edge node in depth-first pre-order. For a node
/// with its own session, `before` and `after` run in the enclosing context and `action` and
/// `after_children` run inside the node's session. For a node local to its parent, all four run
/// inline in the parent's context.
pub trait ActionSet {
    fn policy(&self) -> FailurePolicy {
        FailurePolicy::AbortOnFirstFailure
    }

    fn before(&self, _cx: &Context<'_>, _node: &Node) -> Result<Vec<Step>> {
        Ok(Vec::new())
    }

    fn action(&self, _cx: &Context<'_>, _node: &Node) -> Result<Vec<Step>> {
        Ok(Vec::new())
    }

    fn after_children(&self, _cx: &Context<'_>, _node: &Node) -> Result<Vec<Step>> {
        Ok(Vec::new())
    }

    fn after(&self, _cx: &Context<'_>, _node: &Node) -> Result<Vec<Step>> {
        Ok(Vec::new())
    }
}

type TierHook<'a> = Box<dyn Fn(&Node) -> Result<Fragment> + 'a>;

/// An [ActionSet] made of one fragment-producing function per tier.
#[derive(Default)]
pub struct TierActions<'a> {
    policy: FailurePolicy,
    coordinator: Option<TierHook<'a>>,
    regional: Option<TierHook<'a>>,
    edge: Option<TierHook<'a>>,
}

impl<'a> TierActions<'a> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn policy(mut self, policy: FailurePolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn coordinator(mut self, f: impl Fn(&Node) -> Result<Fragment> + 'a) -> Self {
        self.coordinator = Some(Box::new(f));
        self
    }

    pub fn regional(mut self, f: impl Fn(&Node) -> Result<Fragment> + 'a) -> Self {
        self.regional = Some(Box::new(f));
        self
    }

    pub fn edge(mut self, f: impl Fn(&Node) -> Result<Fragment> + 'a) -> Self {
        self.edge = Some(Box::new(f));
        self
    }
}

impl ActionSet for TierActions<'_> {
    fn policy(&self) -> FailurePolicy {
        self.policy
    }

    fn action(&self, _cx: &Context<'_>, node: &Node) -> Result<Vec<Step>> {
        let hook = match node.tier {
            Tier::Coordinator => self.coordinator.as_ref(),
            Tier::Regional => self.regional.as_ref(),
            Tier::Edge => self.edge.as_ref(),
            Tier::Sensor => None,
        };
        match hook {
            Some(hook) => {
                let fragment = hook(node)?;
                Ok(match fragment.is_empty() {
                    true => Vec::new(),
                    false => vec![fragment.into()],
                })
            }
            None => Ok(Vec::new()),
        }
    }
}

/// Several [ActionSet]s applied as one.
///
/// `before` and `action` run the layers in order; `after_children` and `after` run them in
/// reverse, so each layer's teardown nests around the layers added after it. The policy is the
/// last layer's.
#[derive(Default)]
pub struct Layered<'a> {
    layers: Vec<&'a dyn ActionSet>,
}

impl<'a> Layered<'a> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, layer: &'a dyn ActionSet) -> Self {
        self.layers.push(layer);
        self
    }

    fn collect(
        &self,
        reverse: bool,
        mut hook: impl FnMut(&dyn ActionSet) -> Result<Vec<Step>>,
    ) -> Result<Vec<Step>> {
        let mut layers = self.layers.clone();
        if reverse {
            layers.reverse();
        }
        let mut steps = Vec::new();
        for layer in layers {
            steps.extend(hook(layer)?);
        }
        Ok(steps)
    }
}

impl ActionSet for Layered<'_> {
    fn policy(&self) -> FailurePolicy {
        self.layers
            .last()
            .map(|layer| layer.policy())
            .unwrap_or_default()
    }

    fn before(&self, cx: &Context<'_>, node: &Node) -> Result<Vec<Step>> {
        self.collect(false, |layer| layer.before(cx, node))
    }

    fn action(&self, cx: &Context<'_>, node: &Node) -> Result<Vec<Step>> {
        self.collect(false, |layer| layer.action(cx, node))
    }

    fn after_children(&self, cx: &Context<'_>, node: &Node) -> Result<Vec<Step>> {
        self.collect(true, |layer| layer.after_children(cx, node))
    }

    fn after(&self, cx: &Context<'_>, node: &Node) -> Result<Vec<Step>> {
        self.collect(true, |layer| layer.after(cx, node))
    }
}

/// One operation, ready to be flattened.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Plan {
    pub policy: FailurePolicy,

    /// Steps run on the operator's machine. The coordinator's session is one of them.
    pub steps: Vec<Step>,
}

impl Plan {
    /// Every session in the plan in the order they open.
    pub fn sessions(&self) -> Vec<&RemoteSession> {
        let mut sessions = Vec::new();
        self.walk(|step, _| {
            if let Step::RunRemote(session) = step {
                sessions.push(session);
            }
        });
        sessions
    }

    /// Every transfer in the plan in the order they run.
    pub fn transfers(&self) -> Vec<&Transfer> {
        let mut transfers = Vec::new();
        self.walk(|step, _| {
            if let Step::Transfer(transfer) = step {
                transfers.push(transfer);
            }
        });
        transfers
    }

    /// Calls `f` on every step in order, with the number of sessions enclosing it.
    pub fn walk<'a>(&'a self, mut f: impl FnMut(&'a Step, usize)) {
        fn visit<'a>(steps: &'a [Step], depth: usize, f: &mut impl FnMut(&'a Step, usize)) {
            for step in steps {
                f(step, depth);
                if let Step::RunRemote(session) = step {
                    visit(&session.steps, depth + 1, f);
                }
            }
        }
        visit(&self.steps, 0, &mut f);
    }
}

/// Builds the plan for running `actions` across `topology`.
pub fn build_plan(
    topology: &Topology,
    actions: &dyn ActionSet,
    credentials: &HopCredentials,
) -> Result<Plan> {
    let mut builder = PlanBuilder {
        cx: Context::new(topology, credentials),
        actions,
        delimiters: DelimiterRegistry::new(),
    };
    let mut steps = Vec::new();
    builder.visit(topology.root(), &mut steps)?;
    Ok(Plan {
        policy: actions.policy(),
        steps,
    })
}

struct PlanBuilder<'a> {
    cx: Context<'a>,
    actions: &'a dyn ActionSet,
    delimiters: DelimiterRegistry,
}

impl PlanBuilder<'_> {
    fn visit(&mut self, node: &Node, out: &mut Vec<Step>) -> Result<()> {
        if !node.tier.executes() {
            return Ok(());
        }

        out.extend(self.actions.before(&self.cx, node)?);
        if node.is_local_to_parent() {
            self.body(node, out)?;
        } else {
            let session = self.session(node)?;
            out.push(Step::RunRemote(session));
        }
        out.extend(self.actions.after(&self.cx, node)?);
        Ok(())
    }

    fn session(&mut self, node: &Node) -> Result<RemoteSession> {
        let delimiter = self.delimiters.claim(node)?;
        let mut steps = Vec::new();
        self.body(node, &mut steps)?;
        Ok(RemoteSession {
            node: node.id,
            credential: self.cx.hop_credential(node)?,
            user: self.cx.credentials.user.clone(),
            address: node.address.clone(),
            delimiter,
            steps,
        })
    }

    /// The node's own steps followed by its subtree's.
    fn body(&mut self, node: &Node, out: &mut Vec<Step>) -> Result<()> {
        out.extend(self.actions.action(&self.cx, node)?);
        let topology = self.cx.topology;
        for child in topology.children(node) {
            self.visit(child, out)?;
        }
        out.extend(self.actions.after_children(&self.cx, node)?);
        Ok(())
    }
}
