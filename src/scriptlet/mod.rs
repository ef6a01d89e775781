// src/scriptlet/mod.rs

//! Install-time script execution
//!
//! Assembly hands scripts to a [`ScriptRunner`]. The runner only has to
//! execute one script against the tree being assembled and report whether
//! it succeeded; how the script is isolated from the host is up to the
//! runner. [`CommandScriptRunner`] runs scripts as child processes, either
//! directly with the tree as working directory or through a launcher
//! command (for example a container tool) given in the configuration.
//!
//! Scripts get rpm-style arguments: `$1` is 1 for a fresh install and 2
//! when the package replaces an older version. stdin is `/dev/null` except
//! for file triggers, which receive the matching paths one per line.

use crate::error::{Error, Result};
use crate::model::ScriptConfig;
use crate::packages::{HeaderScript, Nevra, ScriptKind};
use std::fs::{self, File};
use std::io::Write;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::time::Duration;
use tracing::{debug, info, warn};
use wait_timeout::ChildExt;

/// Placeholder in launcher arguments replaced by the tree root
pub const ROOT_PLACEHOLDER: &str = "{root}";

/// One script to run
#[derive(Debug, Clone)]
pub struct ScriptInvocation<'a> {
    pub kind: ScriptKind,
    pub package: &'a Nevra,
    pub script: &'a HeaderScript,
    /// The package replaces an older version of itself
    pub upgrade: bool,
    /// Data for the script's stdin
    pub input: Option<String>,
}

impl ScriptInvocation<'_> {
    fn args(&self) -> Vec<String> {
        let count = if self.upgrade { "2" } else { "1" };
        vec![count.to_string()]
    }
}

/// Runs install-time scripts and commands inside a tree
pub trait ScriptRunner: Send + Sync {
    fn run_script(&self, root: &Path, invocation: &ScriptInvocation<'_>) -> Result<()>;

    /// Run a command inside the tree; used for sanity checks
    fn run_command(&self, root: &Path, argv: &[String]) -> Result<()>;
}

/// Runs scripts as child processes
pub struct CommandScriptRunner {
    launcher: Vec<String>,
    timeout: Duration,
}

impl CommandScriptRunner {
    pub fn new(config: &ScriptConfig) -> Self {
        Self {
            launcher: config.launcher.clone(),
            timeout: Duration::from_secs(config.timeout_secs),
        }
    }

    /// Set custom timeout
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Build the command for `argv`, where paths are as seen from inside the tree
    fn command(&self, root: &Path, argv: &[String]) -> Result<Command> {
        let root_str = root.to_string_lossy();
        let mut full: Vec<String> = self
            .launcher
            .iter()
            .map(|a| a.replace(ROOT_PLACEHOLDER, &root_str))
            .collect();

        if self.launcher.is_empty() {
            // Without a launcher the host resolves paths; map them into the tree
            let Some((program, rest)) = argv.split_first() else {
                return Err(Error::ScriptletError("empty command".to_string()));
            };
            let host = root.join(program.trim_start_matches('/'));
            if !host.exists() {
                return Err(Error::ScriptletError(format!(
                    "Interpreter not found: {}",
                    program
                )));
            }
            full.push(host.to_string_lossy().into_owned());
            full.extend(rest.iter().cloned());
        } else {
            full.extend(argv.iter().cloned());
        }

        let (program, args) = full
            .split_first()
            .ok_or_else(|| Error::ScriptletError("empty command".to_string()))?;
        let mut cmd = Command::new(program);
        cmd.args(args)
            .current_dir(root)
            .env("TREEFORGE_ROOT", root.as_os_str())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        Ok(cmd)
    }

    fn execute(&self, what: &str, mut cmd: Command, input: Option<&str>) -> Result<()> {
        cmd.stdin(if input.is_some() { Stdio::piped() } else { Stdio::null() });
        let mut child = cmd
            .spawn()
            .map_err(|e| Error::ScriptletError(format!("Failed to spawn {}: {}", what, e)))?;

        if let Some(input) = input
            && let Some(mut stdin) = child.stdin.take()
        {
            // A script that exits without reading stdin is not an error
            let _ = stdin.write_all(input.as_bytes());
        }

        match child.wait_timeout(self.timeout)? {
            Some(status) => {
                let output = child.wait_with_output()?;
                for line in String::from_utf8_lossy(&output.stdout).lines() {
                    info!("[{}] {}", what, line);
                }
                for line in String::from_utf8_lossy(&output.stderr).lines() {
                    warn!("[{}] {}", what, line);
                }
                if status.success() {
                    debug!("{} completed successfully", what);
                    Ok(())
                } else {
                    Err(Error::ScriptletError(format!(
                        "{} failed with exit code {}",
                        what,
                        status.code().unwrap_or(-1)
                    )))
                }
            }
            None => {
                let _ = child.kill();
                let _ = child.wait();
                Err(Error::ScriptletError(format!(
                    "{} timed out after {} seconds",
                    what,
                    self.timeout.as_secs()
                )))
            }
        }
    }
}

/// Script file placed inside the tree for the duration of one run
struct StagedScript {
    dir: tempfile::TempDir,
    inner: PathBuf,
}

fn stage_script(root: &Path, body: &str) -> Result<StagedScript> {
    let dir = tempfile::Builder::new()
        .prefix(".treeforge-script-")
        .tempdir_in(root)?;
    let path = dir.path().join("script");
    let mut file = File::create(&path)?;
    file.write_all(body.as_bytes())?;
    fs::set_permissions(&path, fs::Permissions::from_mode(0o700))?;

    let name = dir
        .path()
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    Ok(StagedScript {
        inner: PathBuf::from("/").join(name).join("script"),
        dir,
    })
}

impl ScriptRunner for CommandScriptRunner {
    fn run_script(&self, root: &Path, invocation: &ScriptInvocation<'_>) -> Result<()> {
        let what = format!("{} {}", invocation.package.name, invocation.kind);
        info!("Running {}", what);

        let staged = stage_script(root, &invocation.script.body)?;
        let script_arg = if self.launcher.is_empty() {
            staged.dir.path().join("script").to_string_lossy().into_owned()
        } else {
            staged.inner.to_string_lossy().into_owned()
        };

        let mut argv = vec![invocation.script.interpreter.clone(), script_arg];
        argv.extend(invocation.args());
        let mut cmd = self.command(root, &argv)?;
        cmd.env("TREEFORGE_PACKAGE", invocation.package.to_string())
            .env("TREEFORGE_SCRIPT", invocation.kind.as_str());

        self.execute(&what, cmd, invocation.input.as_deref())
    }

    fn run_command(&self, root: &Path, argv: &[String]) -> Result<()> {
        let what = argv.join(" ");
        let cmd = self.command(root, argv)?;
        self.execute(&what, cmd, None)
    }
}
