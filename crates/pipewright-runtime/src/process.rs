//! External program invocation.

use std::path::Path;
use std::process::Stdio;

use pipewright_secrets::SecretSet;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tracing::{info, warn};

use crate::error::RuntimeError;

/// What to run and how.
pub(crate) struct ProcessSpec<'a> {
  /// Stage or hook name, for logs and errors.
  pub name: &'a str,
  pub program: &'a str,
  pub args: Vec<String>,
  /// Applied in order; later entries win.
  pub env: Vec<(String, String)>,
  pub inherit_env: bool,
  /// Inherited variables that must not reach the child.
  pub scrub_env: &'a [String],
  pub cwd: Option<&'a Path>,
}

/// Run a program to completion, logging its output line by line with every
/// secret value masked.
///
/// `secrets` are exported after `spec.env`, so a template can never shadow a
/// credential.
///
/// The child runs in its own process group. Dropping the returned future,
/// which is how timeouts and cancellation stop it, kills the whole group,
/// including anything the program forked.
pub(crate) async fn run(spec: ProcessSpec<'_>, secrets: &SecretSet) -> Result<i32, RuntimeError> {
  let mut command = Command::new(spec.program);
  command
    .args(&spec.args)
    .stdin(Stdio::null())
    .stdout(Stdio::piped())
    .stderr(Stdio::piped())
    .kill_on_drop(true);
  #[cfg(unix)]
  command.process_group(0);

  if spec.inherit_env {
    for name in spec.scrub_env {
      command.env_remove(name);
    }
  } else {
    command.env_clear();
    if let Some(path) = std::env::var_os("PATH") {
      command.env("PATH", path);
    }
  }
  for (name, value) in &spec.env {
    command.env(name, value);
  }
  for (name, value) in secrets.env_vars() {
    command.env(name, value);
  }
  if let Some(cwd) = spec.cwd {
    command.current_dir(cwd);
  }

  let mut child = command.spawn().map_err(|e| RuntimeError::StageExecution {
    stage: spec.name.to_string(),
    message: format!("failed to start '{}': {}", spec.program, e),
  })?;

  info!(stage = %spec.name, program = %spec.program, pid = child.id(), "process_started");
  let mut group = ProcessGroup::new(spec.name, child.id());

  let stdout = child.stdout.take();
  let stderr = child.stderr.take();
  let (status, _, _) = tokio::join!(
    child.wait(),
    log_lines(spec.name, "stdout", stdout, secrets),
    log_lines(spec.name, "stderr", stderr, secrets),
  );
  group.release();

  let status = status.map_err(|e| RuntimeError::StageExecution {
    stage: spec.name.to_string(),
    message: format!("failed to wait for '{}': {}", spec.program, e),
  })?;

  if status.success() {
    Ok(status.code().unwrap_or(0))
  } else {
    Err(RuntimeError::ExitStatus {
      stage: spec.name.to_string(),
      code: status.code(),
    })
  }
}

/// Kills the process group led by a child when dropped before release.
///
/// Declared after the child, so it drops first: the group is signalled while
/// the unreaped leader still holds its id, then `kill_on_drop` reaps the
/// leader.
struct ProcessGroup<'a> {
  name: &'a str,
  pgid: Option<u32>,
}

impl<'a> ProcessGroup<'a> {
  fn new(name: &'a str, pgid: Option<u32>) -> Self {
    Self { name, pgid }
  }

  fn release(&mut self) {
    self.pgid = None;
  }
}

impl Drop for ProcessGroup<'_> {
  #[cfg(unix)]
  fn drop(&mut self) {
    use nix::errno::Errno;
    use nix::sys::signal::{Signal, killpg};
    use nix::unistd::Pid;

    let Some(pgid) = self.pgid.take() else {
      return;
    };
    match killpg(Pid::from_raw(pgid as i32), Signal::SIGKILL) {
      Ok(()) => warn!(stage = %self.name, pgid, "process_group_killed"),
      Err(Errno::ESRCH) => {}
      Err(e) => warn!(stage = %self.name, pgid, error = %e, "failed to kill process group"),
    }
  }

  #[cfg(not(unix))]
  fn drop(&mut self) {}
}

async fn log_lines<R: AsyncRead + Unpin>(
  name: &str,
  stream: &'static str,
  reader: Option<R>,
  secrets: &SecretSet,
) {
  let Some(reader) = reader else {
    return;
  };

  let mut lines = BufReader::new(reader).lines();
  loop {
    match lines.next_line().await {
      Ok(Some(line)) => {
        info!(stage = %name, stream, line = %secrets.redact(&line), "stage_output");
      }
      Ok(None) => break,
      Err(e) => {
        warn!(stage = %name, stream, error = %e, "stopped reading process output");
        break;
      }
    }
  }
}
