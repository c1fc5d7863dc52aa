use super::{each_tier, Fleet};
use crate::core::locality;
use crate::core::plan::{Fragment, Plan};
use crate::core::script::{quote, shell_path};
use crate::core::topology::{Node, Tier};
use crate::error::{Error, Result};

impl Fleet<'_> {
    /// Prints the certificate expiry dates on the coordinator and the version of every service.
    pub fn check_versions(&self) -> Result<Plan> {
        let certificate_dir = self.settings.certificate_dir();
        let check = |node: &Node| -> Result<Fragment> {
            let mut fragment = Fragment::new(node, format!("{}: versions", node.name));
            if node.tier == Tier::Coordinator {
                let certificates = &self.settings.certificates.full;
                for file in certificates.iter().filter(|f| f.ends_with(".crt")) {
                    fragment = fragment.line(format!(
                        "printf '%s ' {}; openssl x509 -enddate -noout -in {}",
                        quote(file),
                        shell_path(&format!("{certificate_dir}/{file}")),
                    ));
                }
            }
            let service = &self.service(node)?.name;
            let binary = format!("{}/{service}", self.service_dir(node)?);
            Ok(fragment.line(format!(
                "printf '%s: ' {}; {} --version",
                quote(&node.name),
                shell_path(&binary),
            )))
        };
        let actions = each_tier(&check);
        self.plan(&actions)
    }

    /// The command line for an interactive shell on `target`.
    ///
    /// Each hop runs `ssh` on the previous hop's host with that tier's key. Hops to nodes that
    /// share their parent's host are skipped, and a sensor is reached through its edge.
    pub fn ssh_passthrough(&self, target: &Node) -> Result<Vec<String>> {
        let mut command: Vec<String> = Vec::new();
        for id in locality::copy_chain(self.topology, target.id).into_iter().rev() {
            let node = self.topology.node(id);
            let credential = self.credentials.for_tier(node.tier).ok_or_else(|| {
                Error::InvalidTopology(format!("{} is not a session target", node.name))
            })?;
            let mut hop = vec![
                "ssh".to_string(),
                "-tt".to_string(),
                "-i".to_string(),
                credential.key,
                "-p".to_string(),
                node.address.port.to_string(),
                "-o".to_string(),
                "StrictHostKeyChecking=accept-new".to_string(),
                format!("{}@{}", self.credentials.user, node.address.host),
            ];

            // The remote shell splits the inner command back into words.
            if !command.is_empty() {
                let inner: Vec<String> = command.iter().map(|word| quote(word)).collect();
                hop.push(inner.join(" "));
            }
            command = hop;
        }
        Ok(command)
    }
}
