//! The operations an operator runs against the fleet.
//!
//! Every operation is a [Plan] built over the fleet's [Topology] from an [ActionSet], usually a
//! few of them [Layered](crate::core::plan::Layered) so that files are distributed before the
//! commands that use them. Building a plan has no side effects; running it is up to
//! [run_plan](crate::run_plan).

mod configuration;
mod inspect;
mod provision;
mod release;

pub use configuration::{DirectoryPayloadSource, PayloadSource, CONFIG_FILE};
pub use release::Release;

use crate::config::{Service, Settings};
use crate::core::artifact::distribute;
use crate::core::plan::{build_plan, ActionSet, Fragment, HopCredentials, Plan, TierActions};
use crate::core::topology::{Node, Topology};
use crate::credentials::RotationTokens;
use crate::error::{Error, Result};
use crate::trust::{self, PasswordFile};
use std::path::Path;
use tracing::debug;

/// The fleet an operation runs against.
pub struct Fleet<'a> {
    pub topology: &'a Topology,
    pub settings: &'a Settings,
    credentials: HopCredentials,
}

/// One named plan in a longer sequence.
#[derive(Clone, Debug, PartialEq)]
pub struct Stage {
    pub operation: &'static str,
    pub plan: Plan,
}

/// What a full deployment needs from the operator's machine.
pub struct DeployInputs<'a> {
    pub password: &'a PasswordFile,
    pub tokens: &'a RotationTokens,

    /// The directory holding the certificate files named in the settings.
    pub certificates: &'a Path,

    pub release: &'a Release,
    pub payloads: &'a dyn PayloadSource,
}

fn no_service(node: &Node) -> Error {
    Error::InvalidTopology(format!("{} ({}) runs no service", node.name, node.tier))
}

/// The same fragment builder for every tier that runs a service.
fn each_tier<'a>(f: impl Fn(&Node) -> Result<Fragment> + Copy + 'a) -> TierActions<'a> {
    TierActions::new().coordinator(f).regional(f).edge(f)
}

impl<'a> Fleet<'a> {
    pub fn new(topology: &'a Topology, settings: &'a Settings) -> Self {
        Self {
            topology,
            settings,
            credentials: settings.hop_credentials(),
        }
    }

    pub fn credentials(&self) -> &HopCredentials {
        &self.credentials
    }

    fn plan(&self, actions: &dyn ActionSet) -> Result<Plan> {
        let plan = build_plan(self.topology, actions, &self.credentials)?;
        debug!(
            sessions = plan.sessions().len(),
            transfers = plan.transfers().len(),
            "built plan",
        );
        Ok(plan)
    }

    fn service(&self, node: &Node) -> Result<&'a Service> {
        self.settings.service(node.tier).ok_or_else(|| no_service(node))
    }

    /// The directory `node`'s service is installed in.
    fn service_dir(&self, node: &Node) -> Result<String> {
        self.settings.service_dir(node.tier).ok_or_else(|| no_service(node))
    }

    /// Nodes that run a service, in pre-order.
    fn executing(&self) -> impl Iterator<Item = &'a Node> + 'a {
        let topology = self.topology;
        topology.iter().filter(|n| n.tier.executes())
    }

    /// Sets fresh login passwords on every node with its own account.
    pub fn rotate_credentials(&self, tokens: &RotationTokens) -> Result<Plan> {
        let artifact = tokens.artifact(self.topology, &self.settings.remote_user);
        let distribution = distribute(&artifact, self.topology)?;
        self.plan(&distribution)
    }

    /// Every stage of a first deployment, in the order they must run.
    pub fn deploy(&self, inputs: &DeployInputs<'_>) -> Result<Vec<Stage>> {
        let stage = |operation, plan| Stage { operation, plan };
        Ok(vec![
            stage(
                "bootstrap",
                trust::bootstrap(self.topology, self.settings, inputs.password)?,
            ),
            stage("rotate", self.rotate_credentials(inputs.tokens)?),
            stage("directories", self.create_directories()?),
            stage("certificates", self.distribute_certificates(inputs.certificates)?),
            stage("accessories", self.install_accessories()?),
            stage("rollout", self.rollout(inputs.release, inputs.payloads)?),
        ])
    }
}
