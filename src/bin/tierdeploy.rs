//! tierdeploy: deploy and administer a coordinator/regional/edge fleet from the operator's
//! machine.
//!
//! Every command works on a system directory holding `topology.yaml`, the deployment record and
//! the files that get distributed: `certificates/`, `configs/` and `releases/<version>/`.

use anyhow::{bail, Context};
use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;
use tierdeploy::config::{self, Settings, SETTINGS_FILE};
use tierdeploy::core::plan::Plan;
use tierdeploy::core::script::Script;
use tierdeploy::core::topology::{Node, Topology};
use tierdeploy::credentials::{RotationTokens, CREDENTIALS_FILE};
use tierdeploy::operations::{DeployInputs, DirectoryPayloadSource, Fleet, Release};
use tierdeploy::run_log::RunLog;
use tierdeploy::run_plan::{Execute, Reporter, ShellExecutor};
use tierdeploy::state::{DeploymentRecord, Operation, RecordStore};
use tierdeploy::trust::PasswordFile;
use tierdeploy::{is_deployed, mark_deployed};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

const TOPOLOGY_FILE: &str = "topology.yaml";

/// Deploy and administer a tiered fleet over nested SSH sessions.
#[derive(Parser, Debug)]
#[command(name = "tierdeploy")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// The system directory holding topology.yaml and the files to distribute
    #[arg(short, long, default_value = ".")]
    system: PathBuf,

    /// Settings file path [default: /etc/tierdeploy/settings.yaml]
    #[arg(long)]
    settings: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// Enable debug logging
    #[arg(long)]
    debug: bool,

    /// Open the coordinator's session with a native OpenSSH connection
    #[arg(long)]
    native_ssh: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Print the script an operation would run, without running it
    Plan {
        operation: PlanOperation,

        /// Release version, for rollout and update
        #[arg(long)]
        version: Option<String>,
    },

    /// Install the SSH key hierarchy using the bootstrap password
    Bootstrap,

    /// Run the full initial deployment
    Deploy {
        /// Release version to roll out
        #[arg(long)]
        version: String,
    },

    /// Replace every service with another release
    Update {
        #[arg(long)]
        version: String,
    },

    /// Show certificate expiry and service versions
    Check,

    /// Copy every node's configuration into the system directory
    SaveConfig,

    /// Push the configurations in the system directory back and restart services
    RestoreConfig,

    /// Set fresh login passwords on every node
    Rotate,

    /// Open an interactive shell on one node
    Ssh {
        /// One-based position of the regional node
        #[arg(long)]
        regional: Option<usize>,

        /// One-based position of the edge node within its regional
        #[arg(long, requires = "regional")]
        edge: Option<usize>,
    },

    /// Show the deployment state and the fleet
    Status,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum PlanOperation {
    Bootstrap,
    Rotate,
    Directories,
    Certificates,
    Accessories,
    Rollout,
    Update,
    Check,
    SaveConfig,
    RestoreConfig,
}

/// What every command needs: where things are, and the fleet they describe.
struct System {
    dir: PathBuf,
    settings: Settings,
    store: RecordStore,
    record: DeploymentRecord,
    topology: Topology,
    native_ssh: bool,
}

impl System {
    fn open(cli: &Cli) -> anyhow::Result<Self> {
        let settings = match &cli.settings {
            Some(path) => Settings::load(path)
                .with_context(|| format!("Failed to load settings from {}", path.display()))?,
            None => Settings::load_default().with_context(|| {
                let path = config::config_dir().join(SETTINGS_FILE);
                format!("Failed to load settings from {}", path.display())
            })?,
        };

        let dir = cli.system.clone();
        let store = RecordStore::in_dir(&dir);
        let topology_path = dir.join(TOPOLOGY_FILE);
        let record = store
            .load_or_create(|| Topology::from_file(&topology_path))
            .with_context(|| format!("Failed to load the deployment record in {}", dir.display()))?;
        let topology = record.topology()?;

        Ok(Self {
            dir,
            settings,
            store,
            record,
            topology,
            native_ssh: cli.native_ssh,
        })
    }

    fn fleet(&self) -> Fleet<'_> {
        Fleet::new(&self.topology, &self.settings)
    }

    fn password(&self) -> anyhow::Result<PasswordFile> {
        Ok(PasswordFile::open(self.dir.join(&self.settings.password_file))?)
    }

    fn certificates(&self) -> PathBuf {
        self.dir.join("certificates")
    }

    fn configs(&self) -> PathBuf {
        self.dir.join("configs")
    }

    fn payloads(&self) -> DirectoryPayloadSource {
        DirectoryPayloadSource::new(self.configs())
    }

    fn release(&self, version: &str) -> Release {
        Release::in_dir(&self.dir, version)
    }

    fn save_credentials(&self, tokens: &RotationTokens) -> anyhow::Result<()> {
        let path = self.dir.join(CREDENTIALS_FILE);
        tokens
            .record(&self.topology, &self.settings.remote_user)
            .save(&path)
            .with_context(|| format!("Failed to save credentials to {}", path.display()))?;
        info!(path = %path.display(), "saved credentials");
        Ok(())
    }

    /// Runs `plan` with the executor selected on the command line.
    async fn run(&self, operation: &str, plan: &Plan) -> anyhow::Result<()> {
        if self.native_ssh {
            #[cfg(feature = "openssh")]
            return self
                .run_with(operation, plan, tierdeploy::run_plan::OpenSshExecutor::default())
                .await;
            #[cfg(not(feature = "openssh"))]
            warn!("built without the openssh feature, using the ssh command");
        }
        self.run_with(operation, plan, ShellExecutor).await
    }

    async fn run_with<E: Execute + Send>(
        &self,
        operation: &str,
        plan: &Plan,
        mut executor: E,
    ) -> anyhow::Result<()> {
        let mut log = RunLog::new(self.dir.join("logs"))?;
        tierdeploy::run_plan(operation, plan, &mut executor, &mut Reporter, Some(&mut log))
            .await
            .with_context(|| format!("{operation} failed"))?;
        Ok(())
    }

    fn node(&self, regional: Option<usize>, edge: Option<usize>) -> anyhow::Result<&Node> {
        fn nth<'a>(topology: &'a Topology, parent: &'a Node, position: usize) -> Option<&'a Node> {
            position
                .checked_sub(1)
                .and_then(|index| topology.children(parent).nth(index))
        }

        let mut node = self.topology.root();
        if let Some(position) = regional {
            node = match nth(&self.topology, node, position) {
                Some(node) => node,
                None => bail!("There is no regional node at position {position}"),
            };
        }
        if let Some(position) = edge {
            node = match nth(&self.topology, node, position) {
                Some(node) => node,
                None => bail!("{} has no edge node at position {position}", node.name),
            };
        }
        Ok(node)
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = if cli.debug {
        EnvFilter::new("debug")
    } else if cli.verbose {
        EnvFilter::new("info")
    } else {
        EnvFilter::new("warn")
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(cli.debug)
        .init();

    let mut system = System::open(&cli)?;

    match cli.command {
        Commands::Plan { operation, version } => print_plan(&system, operation, version),
        Commands::Bootstrap => bootstrap(&system).await,
        Commands::Deploy { version } => deploy(&mut system, &version).await,
        Commands::Update { version } => {
            Operation::UpdateVersion.check(&system.record)?;
            let plan = system.fleet().update_version(&system.release(&version))?;
            system.run("update", &plan).await
        }
        Commands::Check => {
            Operation::CheckVersions.check(&system.record)?;
            let plan = system.fleet().check_versions()?;
            system.run("check", &plan).await
        }
        Commands::SaveConfig => {
            Operation::SaveConfiguration.check(&system.record)?;
            let plan = system.fleet().save_configuration(&system.configs())?;
            system.run("save-config", &plan).await
        }
        Commands::RestoreConfig => {
            Operation::RestoreConfiguration.check(&system.record)?;
            let plan = system.fleet().restore_configuration(&system.payloads())?;
            system.run("restore-config", &plan).await
        }
        Commands::Rotate => rotate(&system).await,
        Commands::Ssh { regional, edge } => ssh(&system, regional, edge).await,
        Commands::Status => {
            status(&system);
            Ok(())
        }
    }
}

fn print_plan(
    system: &System,
    operation: PlanOperation,
    version: Option<String>,
) -> anyhow::Result<()> {
    Operation::Plan.check(&system.record)?;
    let fleet = system.fleet();
    let release = || match &version {
        Some(version) => Ok(system.release(version)),
        None => Err(anyhow::anyhow!("--version is required to plan {operation:?}")),
    };

    let plan = match operation {
        PlanOperation::Bootstrap => {
            tierdeploy::bootstrap(&system.topology, &system.settings, &system.password()?)?
        }
        PlanOperation::Rotate => {
            fleet.rotate_credentials(&RotationTokens::generate(&system.topology))?
        }
        PlanOperation::Directories => fleet.create_directories()?,
        PlanOperation::Certificates => fleet.distribute_certificates(&system.certificates())?,
        PlanOperation::Accessories => fleet.install_accessories()?,
        PlanOperation::Rollout => fleet.rollout(&release()?, &system.payloads())?,
        PlanOperation::Update => fleet.update_version(&release()?)?,
        PlanOperation::Check => fleet.check_versions()?,
        PlanOperation::SaveConfig => fleet.save_configuration(&system.configs())?,
        PlanOperation::RestoreConfig => fleet.restore_configuration(&system.payloads())?,
    };
    print!("{}", Script::compose(&plan)?);
    Ok(())
}

async fn bootstrap(system: &System) -> anyhow::Result<()> {
    Operation::Bootstrap.check(&system.record)?;
    let plan = tierdeploy::bootstrap(&system.topology, &system.settings, &system.password()?)?;
    system.run("bootstrap", &plan).await
}

async fn deploy(system: &mut System, version: &str) -> anyhow::Result<()> {
    Operation::Deploy.check(&system.record)?;

    // Build every stage before anything is recorded, so bad inputs leave the record untouched.
    let password = system.password()?;
    let tokens = RotationTokens::generate(&system.topology);
    let certificates = system.certificates();
    let release = system.release(version);
    let payloads = system.payloads();
    let stages = system.fleet().deploy(&DeployInputs {
        password: &password,
        tokens: &tokens,
        certificates: &certificates,
        release: &release,
        payloads: &payloads,
    })?;

    mark_deployed(&mut system.record, &system.store)?;
    info!(path = %system.store.path().display(), "recorded deployment");

    for stage in &stages {
        system.run(stage.operation, &stage.plan).await?;
        if stage.operation == "rotate" {
            system.save_credentials(&tokens)?;
        }
    }
    println!("Deployed {version} to {} nodes", system.topology.len());
    Ok(())
}

async fn rotate(system: &System) -> anyhow::Result<()> {
    Operation::RotateCredentials.check(&system.record)?;
    let tokens = RotationTokens::generate(&system.topology);
    let plan = system.fleet().rotate_credentials(&tokens)?;
    system.run("rotate", &plan).await?;
    system.save_credentials(&tokens)
}

async fn ssh(system: &System, regional: Option<usize>, edge: Option<usize>) -> anyhow::Result<()> {
    Operation::SshPassthrough.check(&system.record)?;
    let target = system.node(regional, edge)?;
    let argv = system.fleet().ssh_passthrough(target)?;
    let Some((program, args)) = argv.split_first() else {
        bail!("No command to reach {}", target.name);
    };

    info!(node = %target.name, "opening interactive shell");
    let status = tokio::process::Command::new(program)
        .args(args)
        .status()
        .await
        .with_context(|| format!("Failed to run {program}"))?;
    if !status.success() {
        warn!(node = %target.name, %status, "shell exited unsuccessfully");
    }
    Ok(())
}

fn status(system: &System) {
    println!("{}: {}", system.store.path().display(), system.record.state);
    if !is_deployed(&system.record) {
        println!("Run `tierdeploy deploy --version <version>` to deploy.");
    }
    print_tree(&system.topology, system.topology.root(), 0);
}

fn print_tree(topology: &Topology, node: &Node, depth: usize) {
    let indent = "  ".repeat(depth);
    let local = if node.is_local_to_parent() {
        " (same host as parent)"
    } else {
        ""
    };
    println!("{indent}{} {}: {}{local}", node.tier, node.name, node.address);
    for child in topology.children(node) {
        print_tree(topology, child, depth + 1);
    }
}

