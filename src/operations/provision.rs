//! Preparing hosts: directories, certificates and the services the fleet's own services need.

use super::{each_tier, Fleet};
use crate::config::Accessory;
use crate::core::artifact::{distribute, Artifact, ArtifactKind, Content, Destination};
use crate::core::plan::{ActionSet, Context, FailurePolicy, Fragment, Plan, Step};
use crate::core::script::{quote, shell_path};
use crate::core::topology::{Node, Tier};
use crate::error::{Error, Result};
use std::path::Path;

impl Fleet<'_> {
    /// Creates the working directory tree under the remote root on every host.
    pub fn create_directories(&self) -> Result<Plan> {
        let root = &self.settings.remote_root;
        let certificates = self.settings.certificate_dir();
        let tree = |node: &Node| -> Result<Fragment> {
            let dirs = [
                certificates.clone(),
                format!("{root}/temp"),
                format!("{root}/update"),
                self.service_dir(node)?,
            ];
            let dirs = dirs.iter().map(|d| shell_path(d)).collect::<Vec<_>>().join(" ");
            Ok(Fragment::new(node, format!("{}: directories", node.name))
                .line(format!("mkdir -p {dirs}"))
                .line(format!("chmod 700 {dirs}")))
        };
        let actions = each_tier(&tree);
        self.plan(&actions)
    }

    /// Places the certificate bundle from `source_dir`.
    ///
    /// The coordinator and every regional host get the full bundle; edge hosts get the reduced
    /// one. Nodes that share their parent's host read the parent's copy.
    pub fn distribute_certificates(&self, source_dir: &Path) -> Result<Plan> {
        const NAME: &str = "certificates";
        let target_dir = self.settings.certificate_dir();
        let bundles = &self.settings.certificates;

        let mut artifact = Artifact::new(ArtifactKind::CertificateBundle, NAME);
        for node in self.executing() {
            let files = match node.tier {
                Tier::Coordinator => &bundles.full,
                _ if node.is_local_to_parent() => continue,
                Tier::Regional => &bundles.full,
                _ => &bundles.edge,
            };
            for file in files {
                let source = source_dir.join(file);
                if !source.is_file() {
                    return Err(Error::InvalidArtifact {
                        artifact: NAME.to_string(),
                        reason: format!("{} is missing", source.display()),
                    });
                }
                artifact = artifact.place(
                    node.id,
                    file,
                    Content::LocalFile(source),
                    Destination::File {
                        path: format!("{target_dir}/{file}"),
                        mode: 0o600,
                    },
                );
            }
        }

        let distribution = distribute(&artifact, self.topology)?;
        self.plan(&distribution)
    }

    /// Installs and checks the accessory services each tier depends on.
    ///
    /// Runs to the end even when some steps fail and reports the failures per host.
    pub fn install_accessories(&self) -> Result<Plan> {
        self.plan(&AccessoryInstall { fleet: self })
    }
}

struct AccessoryInstall<'a> {
    fleet: &'a Fleet<'a>,
}

impl AccessoryInstall<'_> {
    fn fragments(node: &Node, accessory: &Accessory) -> Vec<Fragment> {
        let package = &accessory.package;
        let mut fragments = vec![
            Fragment::new(node, format!("{}: install {package}", node.name)).line(format!(
                "DEBIAN_FRONTEND=noninteractive apt-get install -y {}",
                quote(package),
            )),
            Fragment::new(node, format!("{}: {package} version", node.name)).line(format!(
                "{} | grep -qF {}",
                accessory.version_command,
                quote(&accessory.version),
            )),
        ];
        if let Some(database) = &accessory.database {
            let exists = format!("SELECT 1 FROM pg_database WHERE datname='{database}'");
            fragments.push(
                Fragment::new(node, format!("{}: database {database}", node.name)).line(format!(
                    "sudo -u postgres psql -tAc {} | grep -q 1 || sudo -u postgres createdb {}",
                    quote(&exists),
                    quote(database),
                )),
            );
        }
        fragments
    }
}

impl ActionSet for AccessoryInstall<'_> {
    fn policy(&self) -> FailurePolicy {
        FailurePolicy::CollectAndReport
    }

    fn action(&self, _cx: &Context<'_>, node: &Node) -> Result<Vec<Step>> {
        Ok(self
            .fleet
            .settings
            .accessories(node.tier)
            .iter()
            .flat_map(|accessory| Self::fragments(node, accessory))
            .map(Step::from)
            .collect())
    }
}
