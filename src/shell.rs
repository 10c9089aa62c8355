//! Job shell collaborator seam.
//!
//! The engine does not spawn or signal processes itself; it talks to a
//! [`Spawner`] that launches the per-rank job shell and reports
//! [`ShellEvent`]s back. [`ProcessSpawner`] is the real implementation over
//! `tokio::process`; tests substitute scripted shells.
//!
//! The barrier protocol rides on the shell's stdio: the shell writes
//! `enter\n` on stdout when it reaches a barrier and reads `exit=0\n` on
//! stdin when the barrier releases.

use std::io;
use std::path::PathBuf;
use std::process::Stdio;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdout, Command};
use tokio::sync::mpsc;

/// Event reported by a local job shell.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShellEvent {
    /// The shell process is up.
    Running,
    /// The shell entered the current barrier.
    BarrierEnter,
    /// The shell finished with the given wait status.
    Exited { status: i32 },
}

/// Control accepted by a running shell.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShellControl {
    /// Deliver a signal to the shell process.
    Signal(i32),
    /// Release the barrier the shell is waiting in.
    Release,
}

/// Where shells report their events, tagged with the owning job id.
pub type ShellSink = mpsc::UnboundedSender<(u64, ShellEvent)>;

/// What to launch on a rank that participates in a job.
#[derive(Debug, Clone)]
pub struct ShellSpec {
    pub id: u64,
    pub userid: u32,
    pub rank: u32,
    pub shell_path: PathBuf,
    /// Job-scoped namespace exported to the shell environment.
    pub namespace: String,
    /// Whether to wire up the barrier channel. Single-rank jobs skip it.
    pub barrier: bool,
}

/// Handle to a spawned shell. Controls are best-effort: a shell that has
/// already exited drops them.
#[derive(Debug, Clone)]
pub struct ShellHandle {
    control: mpsc::UnboundedSender<ShellControl>,
}

impl ShellHandle {
    pub fn new(control: mpsc::UnboundedSender<ShellControl>) -> Self {
        Self { control }
    }

    pub fn signal(&self, signum: i32) {
        let _ = self.control.send(ShellControl::Signal(signum));
    }

    pub fn release(&self) {
        let _ = self.control.send(ShellControl::Release);
    }
}

/// Launches job shells on behalf of the engine.
pub trait Spawner: Send + Sync + 'static {
    fn spawn(&self, spec: &ShellSpec, events: ShellSink) -> io::Result<ShellHandle>;
}

/// Spawner backed by real subprocesses.
#[derive(Debug, Default, Clone)]
pub struct ProcessSpawner;

impl Spawner for ProcessSpawner {
    fn spawn(&self, spec: &ShellSpec, events: ShellSink) -> io::Result<ShellHandle> {
        let mut cmd = Command::new(&spec.shell_path);
        cmd.arg(spec.id.to_string())
            .env("CANOPY_NS", &spec.namespace)
            .env("CANOPY_USERID", spec.userid.to_string())
            .env("CANOPY_RANK", spec.rank.to_string())
            .current_dir("/tmp")
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true);
        if spec.barrier {
            cmd.stdin(Stdio::piped());
        }
        let child = cmd.spawn()?;
        let (control_tx, control_rx) = mpsc::unbounded_channel();
        tokio::spawn(shell_task(child, spec.id, spec.barrier, events, control_rx));
        Ok(ShellHandle::new(control_tx))
    }
}

/// Wait-status encoding of a normal exit code.
pub fn exit_status(code: i32) -> i32 {
    code << 8
}

/// Map a spawn error to the wait status folded into the job status.
pub fn spawn_failure_status(err: &io::Error) -> i32 {
    let code = if err.raw_os_error() == Some(libc::EACCES)
        || err.raw_os_error() == Some(libc::EPERM)
    {
        126
    } else if err.raw_os_error() == Some(libc::ENOENT) {
        127
    } else if err.raw_os_error() == Some(libc::EHOSTUNREACH) {
        68
    } else {
        match err.kind() {
            io::ErrorKind::PermissionDenied => 126,
            io::ErrorKind::NotFound => 127,
            _ => 1,
        }
    };
    exit_status(code)
}

fn wait_status(status: std::process::ExitStatus) -> i32 {
    use std::os::unix::process::ExitStatusExt;
    match status.code() {
        Some(code) => exit_status(code),
        None => status.signal().unwrap_or(0),
    }
}

async fn shell_task(
    mut child: Child,
    id: u64,
    barrier: bool,
    events: ShellSink,
    mut control: mpsc::UnboundedReceiver<ShellControl>,
) {
    let _ = events.send((id, ShellEvent::Running));
    let mut stdin = child.stdin.take();
    let mut lines = child.stdout.take().map(|out| BufReader::new(out).lines());

    loop {
        tokio::select! {
            status = child.wait() => {
                let status = status.map(wait_status).unwrap_or_else(|_| exit_status(1));
                let _ = events.send((id, ShellEvent::Exited { status }));
                return;
            }
            line = next_line(&mut lines) => {
                match line {
                    Some(line) if barrier && line == "enter" => {
                        let _ = events.send((id, ShellEvent::BarrierEnter));
                    }
                    Some(line) => tracing::info!(id, line = %line, "shell output"),
                    None => lines = None,
                }
            }
            Some(ctl) = control.recv() => match ctl {
                ShellControl::Signal(signum) => {
                    if let Some(pid) = child.id() {
                        // SAFETY: pid names the child we spawned and still own.
                        unsafe { libc::kill(pid as libc::pid_t, signum) };
                    }
                }
                ShellControl::Release => {
                    if let Some(stdin) = stdin.as_mut() {
                        if let Err(err) = stdin.write_all(b"exit=0\n").await {
                            tracing::warn!(id, error = %err, "barrier release write failed");
                        }
                    }
                }
            },
        }
    }
}

async fn next_line(lines: &mut Option<tokio::io::Lines<BufReader<ChildStdout>>>) -> Option<String> {
    match lines {
        Some(lines) => lines.next_line().await.ok().flatten(),
        // Stdout is gone; wait for child.wait() to settle the select.
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::process::ExitStatusExt;

    /// Test spawn failures map to the documented exit codes.
    #[test]
    fn test_spawn_failure_status() {
        let err = io::Error::from_raw_os_error(libc::EACCES);
        assert_eq!(spawn_failure_status(&err), exit_status(126));
        let err = io::Error::from_raw_os_error(libc::ENOENT);
        assert_eq!(spawn_failure_status(&err), exit_status(127));
        let err = io::Error::from_raw_os_error(libc::EHOSTUNREACH);
        assert_eq!(spawn_failure_status(&err), exit_status(68));
        let err = io::Error::from_raw_os_error(libc::EIO);
        assert_eq!(spawn_failure_status(&err), exit_status(1));
    }

    /// Test wait-status decoding of normal exits and signal deaths.
    #[test]
    fn test_wait_status() {
        let exited = std::process::ExitStatus::from_raw(3 << 8);
        assert_eq!(wait_status(exited), exit_status(3));
        let signalled = std::process::ExitStatus::from_raw(15);
        assert_eq!(wait_status(signalled), 15);
    }
}
