/*
 * This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */

use anyhow::{anyhow, Context};
use std::{
    fmt,
    fs::{self, File, OpenOptions},
    path::{Path, PathBuf},
    process::Stdio,
    time::{Duration, Instant},
};
use tracing::debug;

/// A program and its arguments, kept as separate words so that paths never need quoting.
#[derive(Debug, Clone, PartialEq)]
pub struct CommandLine {
    program: String,
    args: Vec<String>,
    cwd: Option<PathBuf>,
}
impl CommandLine {
    /// Builds a command from a POSIX command string such as `sudo tcpdump` or `sh ./fake.sh`.
    pub fn from_prefix(prefix: &str) -> anyhow::Result<Self> {
        Self::from_template(prefix, &[])
    }

    /// Like `from_prefix`, but every `{name}` placeholder in `substitutions` is replaced after the
    /// string has been split into words.
    pub fn from_template(template: &str, substitutions: &[(&str, &str)]) -> anyhow::Result<Self> {
        // break command string into POSIX words
        let words = shlex::split(template)
            .ok_or_else(|| anyhow!("Command string is not POSIX compliant: {}", template))?;

        let mut words = words.into_iter().map(|word| {
            substitutions
                .iter()
                .fold(word, |word, (from, to)| word.replace(from, to))
        });

        match words.next() {
            Some(program) => Ok(Self {
                program,
                args: words.collect(),
                cwd: None,
            }),
            None => Err(anyhow!("Empty command")),
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn path_arg(self, path: &Path) -> Self {
        self.arg(path.to_string_lossy().to_string())
    }

    pub fn current_dir(mut self, dir: &Path) -> Self {
        self.cwd = Some(dir.to_path_buf());
        self
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    pub fn get_args(&self) -> &[String] {
        &self.args
    }

    pub fn get_current_dir(&self) -> Option<&Path> {
        self.cwd.as_deref()
    }
}
impl fmt::Display for CommandLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let words = std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(|s| s.as_str()));
        match shlex::try_join(words.clone()) {
            Ok(joined) => write!(f, "{}", joined),
            Err(_) => write!(f, "{}", words.collect::<Vec<_>>().join(" ")),
        }
    }
}

/// Where the stdout and stderr of an external command go.
#[derive(Debug, Clone, PartialEq)]
pub enum Redirect {
    Null,
    Parent,
    File(PathBuf),
}
impl Redirect {
    /// Opens the log file for appending, creating it (and its directory) if needed.
    pub(crate) fn open_log(path: &Path) -> anyhow::Result<File> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        OpenOptions::new()
            .append(true)
            .create(true)
            .open(path)
            .context(format!("Unable to open log file {}", path.display()))
    }
}

fn tokio_command(cmd: &CommandLine) -> tokio::process::Command {
    let mut command = tokio::process::Command::new(cmd.program());
    command.args(cmd.get_args()).kill_on_drop(true);
    if let Some(dir) = cmd.get_current_dir() {
        command.current_dir(dir);
    }
    command
}

/// Runs the command to completion and returns how long it took. Any failure, including a non-zero
/// exit status, is returned as an error carrying `failure_message`.
pub async fn run(
    cmd: &CommandLine,
    redirect: &Redirect,
    failure_message: &str,
) -> anyhow::Result<Duration> {
    debug!("Running command {}", cmd);

    let mut command = tokio_command(cmd);
    match redirect {
        Redirect::Null => {
            command.stdout(Stdio::null()).stderr(Stdio::null());
        }
        Redirect::Parent => {}
        Redirect::File(path) => {
            let out_file = Redirect::open_log(path)?;
            let err_file = out_file.try_clone()?;
            command
                .stdout(Stdio::from(out_file))
                .stderr(Stdio::from(err_file));
        }
    }

    let start = Instant::now();
    let status = command
        .status()
        .await
        .context(format!("{}: unable to start `{}`", failure_message, cmd))?;
    let elapsed = start.elapsed();

    if status.success() {
        debug!("Command {} finished in {:?}", cmd, elapsed);
        Ok(elapsed)
    } else {
        Err(anyhow!("{}: `{}` exited with {}", failure_message, cmd, status))
    }
}

/// Runs the command and returns its trimmed stdout, or `None` if it exited unsuccessfully.
pub async fn output(cmd: &CommandLine) -> anyhow::Result<Option<String>> {
    debug!("Querying command {}", cmd);

    let output = tokio_command(cmd)
        .stdin(Stdio::null())
        .output()
        .await
        .context(format!("Unable to start `{}`", cmd))?;

    if output.status.success() {
        Ok(Some(String::from_utf8_lossy(&output.stdout).trim().to_string()))
    } else {
        debug!(
            "Command {} exited with {}: {}",
            cmd,
            output.status,
            String::from_utf8_lossy(&output.stderr).trim()
        );
        Ok(None)
    }
}
