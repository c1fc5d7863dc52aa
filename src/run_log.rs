//! Writes log files for each operation that runs.
//!
//! Every operation gets three files in the log directory: `<operation>.log` holds one event per
//! step followed by the script that ran, and `<operation>.stdout.log` and
//! `<operation>.stderr.log` collect what the steps printed. Files are only ever appended to, so
//! repeated runs of the same operation accumulate in one place.

use crate::core::plan::Step;
use crate::core::script::Script;
use crate::run_plan::{exit_status, target, title};
use anyhow::anyhow;
use chrono::{SecondsFormat, Utc};
use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::fs::{self, File, OpenOptions, Permissions};
use std::io::{self, ErrorKind, Write};
use std::os::unix::fs::{OpenOptionsExt, PermissionsExt};
use std::path::{Path, PathBuf};
use std::process::Output;

/// Opens a log file for appending, or creates it if it did not exist.
///
/// Logged scripts can carry generated passwords, so the file is readable by its owner only, even
/// if an older run left it more open.
fn open_log_file(path: impl AsRef<Path>) -> io::Result<File> {
    let file = OpenOptions::new()
        .append(true)
        .create(true)
        .mode(0o600)
        .open(path.as_ref())?;
    file.set_permissions(Permissions::from_mode(0o600))?;
    Ok(file)
}

/// Appends a record of each step to per-operation files in one directory.
#[derive(Debug)]
pub struct RunLog {
    /// Maps operation names to their log files.
    operations: HashMap<String, OperationLogs>,

    /// The directory where logs will be stored.
    directory: PathBuf,
}

impl RunLog {
    /// Creates a new [RunLog] that stores its files in `directory`, creating the directory if it
    /// does not exist.
    pub fn new(directory: impl Into<PathBuf>) -> io::Result<Self> {
        let directory = directory.into();

        match fs::metadata(&directory) {
            Ok(md) if !md.is_dir() => {
                return Err(io::Error::new(
                    ErrorKind::NotFound,
                    anyhow!("not a directory: {}", directory.display()),
                ));
            }
            Err(err) if err.kind() == ErrorKind::NotFound => {
                fs::create_dir_all(&directory)?;
            }
            Err(err) => return Err(err),
            _ => {}
        }

        Ok(Self {
            operations: HashMap::new(),
            directory,
        })
    }

    pub fn directory(&self) -> &Path {
        &self.directory
    }

    /// Records one step of `operation`: an event line, the script that ran, and its output.
    pub fn record(
        &mut self,
        operation: &str,
        step: &Step,
        script: &Script,
        output: &Output,
    ) -> io::Result<()> {
        let logs = match self.operations.entry(operation.to_string()) {
            Entry::Occupied(entry) => entry.into_mut(),
            Entry::Vacant(entry) => entry.insert(OperationLogs::new(&self.directory, operation)?),
        };

        let status = match output.status.success() {
            true => "ok".to_string(),
            false => exit_status(output),
        };
        let mut event = format!(
            "[{}] [{}] {}: {status}\n",
            Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true),
            target(step),
            title(step),
        );
        for line in script.render().lines() {
            event.push_str("    ");
            event.push_str(line);
            event.push('\n');
        }

        logs.events.write_all(event.as_bytes())?;
        logs.stdout.write_all(&output.stdout)?;
        logs.stderr.write_all(&output.stderr)?;
        Ok(())
    }
}

/// File handles for log files pertaining to a single operation.
#[derive(Debug)]
struct OperationLogs {
    events: File,
    stdout: File,
    stderr: File,
}

impl OperationLogs {
    fn new(directory: &Path, operation: &str) -> io::Result<Self> {
        Ok(Self {
            events: open_log_file(directory.join(format!("{operation}.log")))?,
            stdout: open_log_file(directory.join(format!("{operation}.stdout.log")))?,
            stderr: open_log_file(directory.join(format!("{operation}.stderr.log")))?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::plan::{FailurePolicy, Fragment};
    use std::os::unix::process::ExitStatusExt;
    use std::process::ExitStatus;

    mod fixtures {
        use super::*;
        use tempfile::TempDir;

        pub fn tempdir() -> TempDir {
            TempDir::with_prefix("tierdeploy-").unwrap()
        }

        pub fn step() -> (Step, Script) {
            let step: Step = Fragment::operator("greet").line("echo hello").into();
            let script = Script::for_step(&step, FailurePolicy::AbortOnFirstFailure).unwrap();
            (step, script)
        }

        pub fn output(code: i32, stdout: &str, stderr: &str) -> Output {
            Output {
                status: ExitStatus::from_raw(code << 8),
                stdout: stdout.as_bytes().to_vec(),
                stderr: stderr.as_bytes().to_vec(),
            }
        }
    }
    use fixtures::*;

    mod open_log_file {
        use super::*;

        #[test]
        fn appends_to_file() {
            let dir = tempdir();
            let file_path = dir.path().join("new_file.test");

            assert!(fs::metadata(&file_path).is_err());
            let mut file = open_log_file(&file_path).unwrap();
            file.write_all(b"A").unwrap();
            drop(file);

            let mut file = open_log_file(&file_path).unwrap();
            file.write_all(b"B").unwrap();
            drop(file);

            assert_eq!("AB", fs::read_to_string(&file_path).unwrap());
        }

        #[test]
        fn is_owner_only() {
            let dir = tempdir();
            let file_path = dir.path().join("secret.log");

            open_log_file(&file_path).unwrap();
            let mode = fs::metadata(&file_path).unwrap().permissions().mode();
            assert_eq!(0o600, mode & 0o777);
        }

        #[test]
        fn narrows_existing_file() {
            let dir = tempdir();
            let file_path = dir.path().join("old.log");
            fs::write(&file_path, "").unwrap();
            fs::set_permissions(&file_path, Permissions::from_mode(0o644)).unwrap();

            open_log_file(&file_path).unwrap();
            let mode = fs::metadata(&file_path).unwrap().permissions().mode();
            assert_eq!(0o600, mode & 0o777);
        }
    }

    mod new {
        use super::*;

        #[test]
        fn creates_directory_recursively() {
            let base_dir = tempdir();
            let target_dir = base_dir.path().join("a").join("b").join("c");

            RunLog::new(&target_dir).unwrap();
            assert!(fs::metadata(&target_dir).unwrap().is_dir());
        }

        #[test]
        fn fails_if_path_is_a_file() {
            let dir = tempdir();
            let file_path = dir.path().join("logs");
            fs::write(&file_path, "").unwrap();

            let err = RunLog::new(&file_path).unwrap_err();
            assert_eq!(ErrorKind::NotFound, err.kind());
        }
    }

    mod record {
        use super::*;

        #[test]
        fn writes_event_with_script() {
            let dir = tempdir();
            let mut log = RunLog::new(dir.path()).unwrap();
            let (step, script) = step();

            log.record("deploy", &step, &script, &output(0, "", ""))
                .unwrap();

            let events = fs::read_to_string(dir.path().join("deploy.log")).unwrap();
            let mut lines = events.lines();
            let event = lines.next().unwrap();
            assert!(event.starts_with('['));
            assert!(event.ends_with("] [operator] greet: ok"), "{event}");
            assert_eq!(
                vec!["    set -e", "    echo hello"],
                lines.collect::<Vec<_>>(),
            );
        }

        #[test]
        fn diverts_output_to_own_files() {
            let dir = tempdir();
            let mut log = RunLog::new(dir.path()).unwrap();
            let (step, script) = step();

            log.record("check", &step, &script, &output(2, "out\n", "err\n"))
                .unwrap();
            log.record("check", &step, &script, &output(0, "more\n", ""))
                .unwrap();

            let events = fs::read_to_string(dir.path().join("check.log")).unwrap();
            assert!(events.contains("greet: exit code 2"));
            assert_eq!(
                "out\nmore\n",
                fs::read_to_string(dir.path().join("check.stdout.log")).unwrap(),
            );
            assert_eq!(
                "err\n",
                fs::read_to_string(dir.path().join("check.stderr.log")).unwrap(),
            );
        }

        #[test]
        fn every_file_is_owner_only() {
            let dir = tempdir();
            let mut log = RunLog::new(dir.path()).unwrap();
            let (step, script) = step();

            log.record("rotate", &step, &script, &output(0, "", ""))
                .unwrap();

            for name in ["rotate.log", "rotate.stdout.log", "rotate.stderr.log"] {
                let mode = fs::metadata(dir.path().join(name))
                    .unwrap()
                    .permissions()
                    .mode();
                assert_eq!(0o600, mode & 0o777, "{name}");
            }
        }

        #[test]
        fn keeps_operations_apart() {
            let dir = tempdir();
            let mut log = RunLog::new(dir.path()).unwrap();
            let (step, script) = step();

            log.record("bootstrap", &step, &script, &output(0, "a", ""))
                .unwrap();
            log.record("rotate", &step, &script, &output(0, "b", ""))
                .unwrap();

            assert_eq!(
                "a",
                fs::read_to_string(dir.path().join("bootstrap.stdout.log")).unwrap(),
            );
            assert_eq!(
                "b",
                fs::read_to_string(dir.path().join("rotate.stdout.log")).unwrap(),
            );
        }
    }
}
