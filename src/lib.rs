//! Hierarchical remote execution for a four-tier fleet.
//!
//! The fleet is a tree: one coordinator, regional nodes below it, edge nodes below those, and
//! sensors on the edges' networks. The operator's machine can only reach the coordinator, and
//! every node can only reach its own children, so work on a deep node happens inside a chain of
//! SSH sessions, each opened from the one above it. Nodes that share their parent's host need no
//! session of their own.
//!
//! # Program flow
//!
//! 1. The fleet is described as a [Topology](core::Topology), usually read from a YAML file, and
//!    recorded in a [DeploymentRecord](state::DeploymentRecord) that guards which operations may
//!    run.
//!
//! 2. An operation supplies an [ActionSet](core::ActionSet): what to run before, inside and after
//!    each node's context. [build_plan] walks the tree and wraps those steps in sessions and file
//!    copies. Files bound for deep nodes are relayed one hop at a time by a
//!    [Distribution](core::artifact::Distribution).
//!
//! 3. [Script](core::Script) flattens the plan into shell text with nested heredocs, and
//!    [run_plan] hands each top-level step to an executor, reporting and logging as it goes.
//!
//! Building a plan has no side effects, so every operation can be printed instead of run.

pub mod config;
pub mod core;
pub mod credentials;
pub mod error;
pub mod operations;
pub mod run_log;
pub mod run_plan;
pub mod state;
pub mod trust;

#[doc(inline)]
pub use crate::core::{build_plan, distribute};

#[doc(inline)]
pub use error::{Error, Result};

#[doc(inline)]
pub use run_plan::run_plan;

#[doc(inline)]
pub use state::{is_deployed, mark_deployed};

#[doc(inline)]
pub use trust::bootstrap;
