/// Process Launcher
///
/// Spawns one child per job: `<command> <args..> <script>`, with stdout and
/// stderr captured as two separate pipes and stdin closed. On unix the child
/// leads its own process group so the whole tree can be signalled at once.
///
/// No privilege dropping or confinement is applied; the child runs with the
/// service account's rights.

use crate::error::LaunchError;
use coderun_common::config::InterpreterConfig;
use std::collections::BTreeMap;
use std::path::Path;
use std::process::Stdio;
use tokio::process::{Child, ChildStderr, ChildStdout, Command};
use tracing::debug;

#[derive(Debug, Clone)]
pub struct Launcher {
    program: String,
    args: Vec<String>,
    env: BTreeMap<String, String>,
}

/// A freshly spawned child with its output pipes already detached.
#[derive(Debug)]
pub struct LaunchedProcess {
    pub child: Child,
    pub stdout: ChildStdout,
    pub stderr: ChildStderr,
    pub pid: Option<u32>,
}

impl Launcher {
    pub fn new(interpreter: &InterpreterConfig) -> Self {
        Self {
            program: interpreter.command.clone(),
            args: interpreter.args.clone(),
            env: interpreter.env.clone(),
        }
    }

    pub fn launch(&self, script_path: &Path) -> Result<LaunchedProcess, LaunchError> {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args)
            .arg(script_path)
            .envs(&self.env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        #[cfg(unix)]
        cmd.process_group(0);

        let mut child = cmd.spawn().map_err(|source| LaunchError::Spawn {
            program: self.program.clone(),
            source,
        })?;

        let pid = child.id();
        let stdout = child.stdout.take().ok_or(LaunchError::MissingPipe("stdout"))?;
        let stderr = child.stderr.take().ok_or(LaunchError::MissingPipe("stderr"))?;

        debug!(pid = ?pid, program = %self.program, script = %script_path.display(), "Spawned child process");

        Ok(LaunchedProcess {
            child,
            stdout,
            stderr,
            pid,
        })
    }
}
