//! Tool settings and where to find them.
//!
//! Settings are read from `settings.yaml` inside [config_dir]. Every field has a default, so a
//! missing file or a partial file is fine.

use crate::core::plan::HopCredentials;
use crate::core::topology::Tier;
use crate::error::Result;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tracing::debug;

/// The name of the settings file inside [config_dir].
pub const SETTINGS_FILE: &str = "settings.yaml";

/// Returns a [PathBuf] to the directory where the tool's configuration should live.
///
/// When compiled for testing, this returns `CARGO_MANIFEST_DIR` plus `resources/etc/tierdeploy`.
/// Otherwise, it returns `/etc/tierdeploy`.
pub fn config_dir() -> PathBuf {
    // Omit the leading slash so that PathBuf::push appends instead of replacing.
    const CONFIG_DIR: &str = "etc/tierdeploy";

    let mut path = PathBuf::new();

    #[cfg(test)]
    {
        path.push(env!("CARGO_MANIFEST_DIR"));
        path.push("resources");
    }
    #[cfg(not(test))]
    path.push("/");

    path.push(CONFIG_DIR);
    path
}

/// Expands a leading `~/` to the operator's home directory. Other paths are returned unchanged.
pub fn expand_home(path: &str) -> PathBuf {
    match (path.strip_prefix("~/"), home::home_dir()) {
        (Some(rest), Some(mut home)) => {
            home.push(rest);
            home
        }
        _ => PathBuf::from(path),
    }
}

#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
#[serde(default)]
pub struct Settings {
    /// The account used to log in to every node.
    pub remote_user: String,

    /// The operator's pre-provisioned private key. Its `.pub` sibling is installed on the
    /// coordinator during bootstrap.
    pub operator_key: String,

    /// Key file for coordinator-to-regional hops, relative to the remote user's home.
    pub coordinator_key: String,

    /// Key file for regional-to-edge hops, relative to the remote user's home.
    pub regional_key: String,

    /// Root of the fleet's directory tree on every node.
    pub remote_root: String,

    /// The bootstrap password file, relative to the system directory.
    pub password_file: String,

    pub services: Services,
    pub certificates: Certificates,
    pub accessories: Accessories,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            remote_user: "fleet".to_string(),
            operator_key: "~/.ssh/tierdeploy".to_string(),
            coordinator_key: ".ssh/coordinator.key".to_string(),
            regional_key: ".ssh/regional.key".to_string(),
            remote_root: "/opt/fleet".to_string(),
            password_file: "deployment_password".to_string(),
            services: Services::default(),
            certificates: Certificates::default(),
            accessories: Accessories::default(),
        }
    }
}

impl Settings {
    /// Loads settings from `path`. A missing file yields the defaults.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        match fs::read_to_string(path) {
            Ok(yaml) => Ok(serde_yaml::from_str(&yaml)?),
            Err(err) if err.kind() == ErrorKind::NotFound => {
                debug!(path = %path.display(), "no settings file, using defaults");
                Ok(Self::default())
            }
            Err(err) => Err(err.into()),
        }
    }

    /// Loads `settings.yaml` from [config_dir].
    pub fn load_default() -> Result<Self> {
        Self::load(config_dir().join(SETTINGS_FILE))
    }

    pub fn hop_credentials(&self) -> HopCredentials {
        HopCredentials {
            user: self.remote_user.clone(),
            operator: expand_home(&self.operator_key).display().to_string(),
            coordinator: self.coordinator_key.clone(),
            regional: self.regional_key.clone(),
        }
    }

    /// The service that runs on nodes of `tier`. Sensors run nothing.
    pub fn service(&self, tier: Tier) -> Option<&Service> {
        match tier {
            Tier::Coordinator => Some(&self.services.coordinator),
            Tier::Regional => Some(&self.services.regional),
            Tier::Edge => Some(&self.services.edge),
            Tier::Sensor => None,
        }
    }

    /// The directory holding `tier`'s service on the node.
    pub fn service_dir(&self, tier: Tier) -> Option<String> {
        self.service(tier)
            .map(|service| format!("{}/{}", self.remote_root, service.name))
    }

    pub fn certificate_dir(&self) -> String {
        format!("{}/certificates", self.remote_root)
    }

    pub fn accessories(&self, tier: Tier) -> &[Accessory] {
        match tier {
            Tier::Coordinator => &self.accessories.coordinator,
            Tier::Regional => &self.accessories.regional,
            Tier::Edge => &self.accessories.edge,
            Tier::Sensor => &[],
        }
    }
}

#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
#[serde(default)]
pub struct Services {
    pub coordinator: Service,
    pub regional: Service,
    pub edge: Service,
}

impl Default for Services {
    fn default() -> Self {
        Self {
            coordinator: Service::named("coordinator"),
            regional: Service::named("regional"),
            edge: Service {
                name: "edge".to_string(),
                preserve: vec!["messages.json".to_string()],
            },
        }
    }
}

#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize)]
pub struct Service {
    /// Names the systemd unit, the service directory and the binary inside it.
    pub name: String,

    /// Files carried over from the previous version during an update.
    #[serde(default)]
    pub preserve: Vec<String>,
}

impl Service {
    fn named(name: &str) -> Self {
        Self {
            name: name.to_string(),
            preserve: Vec::new(),
        }
    }
}

/// File names inside the operator's certificate directory.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
#[serde(default)]
pub struct Certificates {
    /// Sent to the coordinator and to regional nodes with their own host.
    pub full: Vec<String>,

    /// Sent to edge nodes. Leaves out coordinator-only material.
    pub edge: Vec<String>,
}

impl Default for Certificates {
    fn default() -> Self {
        let owned = |names: &[&str]| names.iter().map(|n| n.to_string()).collect();
        Self {
            full: owned(&[
                "ca.crt",
                "coordinator_client.crt",
                "coordinator_client.key",
                "regional_server.crt",
                "regional_server.key",
                "regional_client.crt",
                "regional_client.key",
                "edge_server.crt",
                "edge_server.key",
            ]),
            edge: owned(&[
                "ca.crt",
                "edge_server.crt",
                "edge_server.key",
                "regional_client.crt",
                "regional_client.key",
            ]),
        }
    }
}

#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
#[serde(default)]
pub struct Accessories {
    pub coordinator: Vec<Accessory>,
    pub regional: Vec<Accessory>,
    pub edge: Vec<Accessory>,
}

impl Default for Accessories {
    fn default() -> Self {
        let postgres = Accessory {
            package: "postgresql-12".to_string(),
            version_command: "psql --version".to_string(),
            version: "12".to_string(),
            database: None,
        };
        Self {
            coordinator: vec![Accessory {
                database: Some("coordinator".to_string()),
                ..postgres.clone()
            }],
            regional: vec![
                Accessory {
                    database: Some("regional".to_string()),
                    ..postgres
                },
                Accessory {
                    package: "elasticsearch-oss=6.4.2".to_string(),
                    version_command: "/usr/share/elasticsearch/bin/elasticsearch --version"
                        .to_string(),
                    version: "6.4.2".to_string(),
                    database: None,
                },
            ],
            edge: Vec::new(),
        }
    }
}

/// A supporting system service installed next to a tier's application.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct Accessory {
    /// Package specification handed to the package manager.
    pub package: String,

    /// Prints the installed version.
    pub version_command: String,

    /// Must appear in the output of `version_command`.
    pub version: String,

    /// A database to create for the tier's service, if any.
    #[serde(default)]
    pub database: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    mod config_dir {
        use super::*;

        #[test]
        fn works() {
            let mut expected = PathBuf::from(env!("CARGO_MANIFEST_DIR"));
            expected.push("resources");
            expected.push("etc");
            expected.push("tierdeploy");

            assert_eq!(expected, config_dir());

            let config_dir_exists = expected.try_exists();
            assert!(
                config_dir_exists.expect("could not confirm or deny whether config dir exists")
            );
        }
    }

    mod settings {
        use super::*;

        #[test]
        fn loads_bundled_file() {
            let settings = Settings::load_default().unwrap();
            assert_eq!("fleet", settings.remote_user);
            assert_eq!("/opt/fleet", settings.remote_root);
            assert_eq!(2, settings.accessories.regional.len());
        }

        #[test]
        fn partial_file_keeps_defaults() {
            let settings: Settings = serde_yaml::from_str("remote_user: admin\n").unwrap();
            assert_eq!("admin", settings.remote_user);
            assert_eq!(Settings::default().certificates, settings.certificates);
        }

        #[test]
        fn missing_file_yields_defaults() {
            let dir = tempfile::tempdir().unwrap();
            let settings = Settings::load(dir.path().join("absent.yaml")).unwrap();
            assert_eq!(Settings::default(), settings);
        }

        #[test]
        fn sensors_have_no_service() {
            let settings = Settings::default();
            assert_eq!(None, settings.service_dir(Tier::Sensor));
            assert_eq!(
                Some("/opt/fleet/edge".to_string()),
                settings.service_dir(Tier::Edge),
            );
        }
    }

    mod expand_home {
        use super::*;

        #[test]
        fn leaves_absolute_paths_alone() {
            assert_eq!(PathBuf::from("/etc/key"), expand_home("/etc/key"));
        }

        #[test]
        fn expands_tilde() {
            let expanded = expand_home("~/.ssh/id");
            assert!(expanded.ends_with(".ssh/id"));
            assert!(!expanded.starts_with("~"));
        }
    }
}
