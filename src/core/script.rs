//! Flattens a [Plan] into one linear shell script.
//!
//! Every session becomes an `ssh` command whose body follows as a quoted heredoc. The remote
//! side reads the whole body before running it, with stdin pointed at `/dev/null`, so commands
//! inside a body can never swallow the lines of an enclosing body. Nested sessions therefore
//! only need one thing to stay intact: every heredoc delimiter must be closed exactly once, in
//! the reverse order of opening, and no body line may equal a delimiter that is still open. The
//! composer tracks open sessions on an explicit stack and refuses to produce a script that
//! breaks either rule.

use crate::core::delimiter::Delimiter;
use crate::core::plan::{Direction, FailurePolicy, Plan, RemoteSession, Step, Transfer};
use crate::error::{Error, Result};
use std::collections::HashSet;
use std::fmt::{self, Display};

/// Options shared by every `ssh` and `scp` invocation.
const SSH_OPTIONS: [&str; 4] = [
    "-o",
    "BatchMode=yes",
    "-o",
    "StrictHostKeyChecking=accept-new",
];

/// Reads a script from stdin into a temporary file, then runs the file without stdin.
///
/// Sessions hand it their body, and the local executor hands it each step, so no script is ever
/// passed as a single argument.
pub const STDIN_RUNNER: &str =
    r#"f=$(mktemp) || exit 1; cat >"$f"; bash "$f" </dev/null; s=$?; rm -f "$f"; exit $s"#;

/// The exit status `ssh` reports when it could not connect or authenticate.
pub const SSH_FAILURE: i32 = 255;

/// Written to stderr, followed by the delimiter, when `ssh` exits with [SSH_FAILURE] while
/// opening a session.
pub const OPEN_FAILURE: &str = "tierdeploy: could not open session ";

/// Quotes `word` for a POSIX shell.
pub fn quote(word: &str) -> String {
    // NUL bytes are the only input the quoter rejects, and no path or argument can hold one.
    let word = word.replace('\0', "");
    shlex::try_quote(&word)
        .map(|quoted| quoted.into_owned())
        .unwrap_or_default()
}

/// Quotes a path, keeping a leading `~/` expandable.
pub fn shell_path(path: &str) -> String {
    match path.strip_prefix("~/") {
        Some(rest) => format!("\"$HOME\"/{}", quote(rest)),
        None => quote(path),
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum Token {
    Line(String),

    /// Opens a session. Renders as `command <<'delimiter' trailer`.
    Open {
        delimiter: Delimiter,
        command: String,
        trailer: String,
    },

    Close(Delimiter),
}

impl Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Token::Line(line) => f.write_str(line),
            Token::Open {
                delimiter,
                command,
                trailer,
            } => write!(f, "{command} <<'{delimiter}'{trailer}"),
            Token::Close(delimiter) => f.write_str(delimiter.as_str()),
        }
    }
}

/// A flattened plan.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Script {
    tokens: Vec<Token>,
}

impl Script {
    /// The whole plan as one script for the operator's shell.
    pub fn compose(plan: &Plan) -> Result<Self> {
        let mut composer = Composer::new(plan.policy);
        composer.line("#!/usr/bin/env bash")?;
        composer.context(&plan.steps, "operator")?;
        composer.finish()
    }

    /// One top-level step of a plan as a script for the operator's shell.
    pub fn for_step(step: &Step, policy: FailurePolicy) -> Result<Self> {
        let mut composer = Composer::new(policy);
        composer.context(std::slice::from_ref(step), "operator")?;
        composer.finish()
    }

    /// What runs inside `session`, for executors that open the session themselves.
    pub fn session_body(session: &RemoteSession, policy: FailurePolicy) -> Result<Self> {
        let mut composer = Composer::new(policy);
        composer.context(&session.steps, session.delimiter.as_str())?;
        composer.finish()
    }

    pub fn tokens(&self) -> &[Token] {
        &self.tokens
    }

    /// Delimiters in the order their sessions open.
    pub fn opened(&self) -> Vec<&str> {
        self.tokens
            .iter()
            .filter_map(|token| match token {
                Token::Open { delimiter, .. } => Some(delimiter.as_str()),
                _ => None,
            })
            .collect()
    }

    /// Delimiters in the order their sessions close.
    pub fn closed(&self) -> Vec<&str> {
        self.tokens
            .iter()
            .filter_map(|token| match token {
                Token::Close(delimiter) => Some(delimiter.as_str()),
                _ => None,
            })
            .collect()
    }

    pub fn render(&self) -> String {
        let mut text = String::new();
        for token in &self.tokens {
            text.push_str(&token.to_string());
            text.push('\n');
        }
        text
    }
}

impl Display for Script {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.render())
    }
}

/// Checks that every opened delimiter is closed exactly once, in LIFO order, and that no line
/// terminates an open heredoc early.
pub fn verify_nesting(tokens: &[Token]) -> Result<()> {
    let mut stack: Vec<&Delimiter> = Vec::new();
    let mut seen: HashSet<&Delimiter> = HashSet::new();

    for token in tokens {
        match token {
            Token::Line(line) => {
                if let Some(open) = stack.iter().find(|d| d.as_str() == line.as_str()) {
                    return Err(Error::DelimiterCollision(format!(
                        "a body line would close {open} early",
                    )));
                }
            }
            Token::Open { delimiter, .. } => {
                if !seen.insert(delimiter) {
                    return Err(Error::DelimiterCollision(format!(
                        "{delimiter} opened more than once",
                    )));
                }
                stack.push(delimiter);
            }
            Token::Close(delimiter) => match stack.pop() {
                Some(top) if top == delimiter => {}
                Some(top) => {
                    return Err(Error::DelimiterCollision(format!(
                        "{delimiter} closed while {top} is still open",
                    )))
                }
                None => {
                    return Err(Error::DelimiterCollision(format!(
                        "{delimiter} closed but never opened",
                    )))
                }
            },
        }
    }

    match stack.last() {
        Some(open) => Err(Error::DelimiterCollision(format!("{open} never closed"))),
        None => Ok(()),
    }
}

struct Composer {
    policy: FailurePolicy,
    tokens: Vec<Token>,
    stack: Vec<Delimiter>,
}

impl Composer {
    fn new(policy: FailurePolicy) -> Self {
        Self {
            policy,
            tokens: Vec::new(),
            stack: Vec::new(),
        }
    }

    fn finish(self) -> Result<Script> {
        if let Some(open) = self.stack.last() {
            return Err(Error::DelimiterCollision(format!("{open} never closed")));
        }
        verify_nesting(&self.tokens)?;
        Ok(Script {
            tokens: self.tokens,
        })
    }

    /// Emits `steps` as the contents of one shell: the operator's or a session body.
    fn context(&mut self, steps: &[Step], name: &str) -> Result<()> {
        match self.policy {
            FailurePolicy::AbortOnFirstFailure => self.line("set -e")?,
            FailurePolicy::CollectAndReport => self.line("warnings=")?,
        }
        for step in steps {
            self.step(step)?;
        }
        if self.policy == FailurePolicy::CollectAndReport {
            self.line(format!(
                r#"if [ -n "$warnings" ]; then printf '%s\n' {}"$warnings"; fi"#,
                quote(&format!("warnings from {name}:")),
            ))?;
        }
        Ok(())
    }

    fn step(&mut self, step: &Step) -> Result<()> {
        match step {
            Step::RunLocal(fragment) => match self.policy {
                FailurePolicy::AbortOnFirstFailure => {
                    for line in &fragment.lines {
                        self.line(line)?;
                    }
                }
                FailurePolicy::CollectAndReport => {
                    // set -e is ignored inside conditionals, so test the status afterwards.
                    self.line("(")?;
                    self.line("set -e")?;
                    for line in &fragment.lines {
                        self.line(line)?;
                    }
                    self.line(") </dev/null")?;
                    self.line(format!(
                        "[ $? -eq 0 ] || {}",
                        note_warning(&format!("{} failed", fragment.label)),
                    ))?;
                }
            },
            Step::Transfer(transfer) => match self.policy {
                FailurePolicy::AbortOnFirstFailure => self.line(transfer_command(transfer))?,
                FailurePolicy::CollectAndReport => self.line(format!(
                    "{} || {}",
                    transfer_command(transfer),
                    note_warning(&format!("copy to or from {} failed", transfer.address)),
                ))?,
            },
            Step::RunRemote(session) => self.session(session)?,
        }
        Ok(())
    }

    fn session(&mut self, session: &RemoteSession) -> Result<()> {
        if self.stack.contains(&session.delimiter) {
            return Err(Error::DelimiterCollision(format!(
                "{} is already open",
                session.delimiter,
            )));
        }
        self.tokens.push(Token::Open {
            delimiter: session.delimiter.clone(),
            command: session_command(session),
            trailer: self.open_trailer(&session.delimiter),
        });
        self.stack.push(session.delimiter.clone());

        self.context(&session.steps, session.delimiter.as_str())?;

        match self.stack.pop() {
            Some(top) if top == session.delimiter => {
                self.tokens.push(Token::Close(top));
                Ok(())
            }
            _ => Err(Error::DelimiterCollision(format!(
                "{} is not the innermost open session",
                session.delimiter,
            ))),
        }
    }

    /// What follows a session's heredoc marker when its `ssh` fails. Every level names itself
    /// when it could not be opened, so the first marker on stderr is the innermost failure.
    fn open_trailer(&self, delimiter: &Delimiter) -> String {
        let marker = format!("echo {} >&2", quote(&format!("{OPEN_FAILURE}{delimiter}")));
        let then = match self.policy {
            FailurePolicy::AbortOnFirstFailure => "exit $opened".to_string(),
            FailurePolicy::CollectAndReport => {
                note_warning(&format!("session {delimiter} failed"))
            }
        };
        format!(" || {{ opened=$?; [ $opened -ne {SSH_FAILURE} ] || {marker}; {then}; }}")
    }

    /// Emits a body line, splitting embedded newlines.
    fn line(&mut self, line: impl AsRef<str>) -> Result<()> {
        for line in line.as_ref().split('\n') {
            if let Some(open) = self.stack.iter().find(|d| d.as_str() == line) {
                return Err(Error::DelimiterCollision(format!(
                    "a body line would close {open} early",
                )));
            }
            self.tokens.push(Token::Line(line.to_string()));
        }
        Ok(())
    }
}

fn note_warning(message: &str) -> String {
    format!(r#"warnings="$warnings"{}"#, quote(&format!(" [{message}]")))
}

/// The `ssh` invocation that opens `session`. The body is supplied on stdin.
pub fn session_command(session: &RemoteSession) -> String {
    let mut words = vec![
        "ssh".to_string(),
        "-i".to_string(),
        shell_path(&session.credential.key),
        "-p".to_string(),
        session.address.port.to_string(),
    ];
    words.extend(SSH_OPTIONS.iter().map(|o| o.to_string()));
    words.push(quote(&format!("{}@{}", session.user, session.address.host)));
    words.push(quote(STDIN_RUNNER));
    words.join(" ")
}

/// The `scp` invocation for `transfer`.
pub fn transfer_command(transfer: &Transfer) -> String {
    let mut words = vec![
        "scp".to_string(),
        "-i".to_string(),
        shell_path(&transfer.credential.key),
        "-P".to_string(),
        transfer.address.port.to_string(),
    ];
    words.extend(SSH_OPTIONS.iter().map(|o| o.to_string()));

    let remote = |path: &str| {
        quote(&format!(
            "{}@{}:{path}",
            transfer.user,
            transfer.address.scp_host(),
        ))
    };
    match transfer.direction {
        Direction::Upload => {
            words.extend(transfer.sources.iter().map(|s| shell_path(s)));
            words.push(remote(&transfer.destination));
        }
        Direction::Download => {
            words.extend(transfer.sources.iter().map(|s| remote(s)));
            words.push(shell_path(&transfer.destination));
        }
    }
    words.push("</dev/null".to_string());
    words.join(" ")
}
