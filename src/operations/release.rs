//! Rolling out service releases.

use super::{each_tier, Fleet, PayloadSource};
use crate::core::artifact::{self, distribute, Artifact, ArtifactKind, Content, Destination};
use crate::core::plan::{Fragment, Layered, Plan};
use crate::core::script::{quote, shell_path};
use crate::core::topology::Node;
use crate::error::{Error, Result};
use std::path::{Path, PathBuf};

const ARCHIVES: &str = "release";
const UNITS: &str = "units";

/// A release on the operator's machine: one `<service>.tar.gz` per service.
#[derive(Clone, Debug, PartialEq)]
pub struct Release {
    pub version: String,
    dir: PathBuf,
}

impl Release {
    pub fn new(version: impl Into<String>, dir: impl Into<PathBuf>) -> Self {
        Self {
            version: version.into(),
            dir: dir.into(),
        }
    }

    /// The release stored as `releases/<version>` in `system_dir`.
    pub fn in_dir(system_dir: impl AsRef<Path>, version: impl Into<String>) -> Self {
        let version = version.into();
        let dir = system_dir.as_ref().join("releases").join(&version);
        Self::new(version, dir)
    }

    pub fn archive_name(service: &str) -> String {
        format!("{service}.tar.gz")
    }

    pub fn archive(&self, service: &str) -> PathBuf {
        self.dir.join(Self::archive_name(service))
    }
}

fn unit_file(fleet: &Fleet<'_>, service: &str, dir: &str) -> String {
    format!(
        "[Unit]\n\
         Description={service} service\n\
         After=network.target\n\
         \n\
         [Service]\n\
         Type=simple\n\
         User={user}\n\
         WorkingDirectory={dir}\n\
         ExecStart={dir}/{service}\n\
         Restart=on-failure\n\
         \n\
         [Install]\n\
         WantedBy=multi-user.target\n",
        user = fleet.settings.remote_user,
    )
}

impl Fleet<'_> {
    /// The release archives, one per node that runs a service.
    fn archives(
        &self,
        release: &Release,
        destination: impl Fn(String) -> Destination,
    ) -> Result<Artifact> {
        let mut artifact = Artifact::new(ArtifactKind::Release, ARCHIVES);
        for node in self.executing() {
            let service = &self.service(node)?.name;
            let archive = release.archive(service);
            if !archive.is_file() {
                return Err(Error::InvalidArtifact {
                    artifact: format!("{ARCHIVES} {}", release.version),
                    reason: format!("{} is missing", archive.display()),
                });
            }
            artifact = artifact.place(
                node.id,
                Release::archive_name(service),
                Content::LocalFile(archive),
                destination(self.service_dir(node)?),
            );
        }
        Ok(artifact)
    }

    /// The first rollout: unpacks each service, writes its configuration and systemd unit, and
    /// starts it.
    pub fn rollout(&self, release: &Release, payloads: &dyn PayloadSource) -> Result<Plan> {
        let archives = self.archives(release, Destination::Extract)?;
        let configs = self.payload_artifact(payloads)?;

        let mut units = Artifact::new(ArtifactKind::Release, UNITS);
        for node in self.executing() {
            let service = &self.service(node)?.name;
            let unit = unit_file(self, service, &self.service_dir(node)?);
            units = units.place(
                node.id,
                format!("{service}.service"),
                Content::Inline(unit.into_bytes()),
                Destination::File {
                    path: format!("/etc/systemd/system/{service}.service"),
                    mode: 0o644,
                },
            );
        }

        let start = |node: &Node| -> Result<Fragment> {
            let service = quote(&self.service(node)?.name);
            Ok(Fragment::new(node, format!("{}: start {service}", node.name))
                .line("systemctl daemon-reload")
                .line(format!("systemctl enable {service}"))
                .line(format!("systemctl restart {service}")))
        };

        let archives = distribute(&archives, self.topology)?;
        let configs = distribute(&configs, self.topology)?;
        let units = distribute(&units, self.topology)?;
        let start = each_tier(&start);
        self.plan(
            &Layered::new()
                .with(&archives)
                .with(&configs)
                .with(&units)
                .with(&start),
        )
    }

    /// Replaces every service with `release`.
    ///
    /// The previous version is kept next to the new one as `<service>_old`. The node's current
    /// configuration and the files its service is configured to preserve are carried over.
    pub fn update_version(&self, release: &Release) -> Result<Plan> {
        let archives = self.archives(release, |_| Destination::Staged)?;

        let replace = |node: &Node| -> Result<Fragment> {
            let service = self.service(node)?;
            let dir = self.service_dir(node)?;
            let old = format!("{dir}_old");
            let staged = artifact::staged_name(ARCHIVES, &Release::archive_name(&service.name));
            let (dir_q, old_q) = (shell_path(&dir), shell_path(&old));

            let label = format!("{}: update {}", node.name, service.name);
            let mut fragment = Fragment::new(node, label)
                .line(format!("systemctl stop {}", quote(&service.name)))
                .line(format!("rm -rf {old_q}"))
                .line(format!("mv {dir_q} {old_q}"))
                .line(format!("mkdir -p {dir_q}"))
                .line(format!("tar -xzf {} -C {dir_q}", quote(&staged)));

            let preserved = service.preserve.iter().map(String::as_str);
            for file in std::iter::once(super::CONFIG_FILE).chain(preserved) {
                let from = shell_path(&format!("{old}/{file}"));
                fragment = fragment.line(format!(
                    "test ! -e {from} || cp -p {from} {}",
                    shell_path(&format!("{dir}/{file}")),
                ));
            }
            Ok(fragment.line(format!("systemctl start {}", quote(&service.name))))
        };

        let archives = distribute(&archives, self.topology)?;
        let replace = each_tier(&replace);
        self.plan(&Layered::new().with(&archives).with(&replace))
    }
}
