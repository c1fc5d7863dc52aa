//! The execution engine: the fleet tree, locality, plans, scripts and artifact distribution.

pub mod artifact;
pub mod delimiter;
pub mod locality;
pub mod plan;
pub mod script;
pub mod topology;

#[doc(inline)]
pub use artifact::{distribute, Artifact, ArtifactKind};

#[doc(inline)]
pub use plan::{build_plan, ActionSet, FailurePolicy, Plan, Step};

#[doc(inline)]
pub use script::Script;

#[doc(inline)]
pub use topology::{Address, Node, NodeId, Tier, Topology};
