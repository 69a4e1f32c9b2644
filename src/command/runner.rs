use super::error::CommandError;
use super::executable_data::ExecutableData;
use super::logging::spawn_stderr_drain;
use super::shutdown::ProcessTerminator;
use crate::fleet::ServerId;
use crate::utils::threads::spawn_named_thread;
use std::process::{ChildStdin, ChildStdout, Command, ExitStatus, Stdio};
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;
use tracing::{debug, warn};

/// How long to wait for the kernel to confirm an exit after SIGKILL.
const KILL_CONFIRM_TIMEOUT: Duration = Duration::from_secs(5);

/// The stdio pair of a spawned subordinate, handed to the session transport.
/// The runner keeps no reference to these streams.
pub struct StdioPipes {
    pub stdin: ChildStdin,
    pub stdout: ChildStdout,
}

/// How a subordinate process terminated. `code` is `None` for signal
/// terminations; `signal` is `None` for normal exits.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ProcessExit {
    pub code: Option<i32>,
    pub signal: Option<String>,
}

impl ProcessExit {
    pub fn describe(&self) -> String {
        match (&self.code, &self.signal) {
            (Some(code), _) => format!("process exited with code {code}"),
            (None, Some(signal)) => format!("process terminated by signal {signal}"),
            (None, None) => "process exited".to_string(),
        }
    }
}

impl From<ExitStatus> for ProcessExit {
    fn from(status: ExitStatus) -> Self {
        ProcessExit {
            code: status.code(),
            signal: exit_signal_name(&status),
        }
    }
}

#[cfg(target_family = "unix")]
fn exit_signal_name(status: &ExitStatus) -> Option<String> {
    use std::os::unix::process::ExitStatusExt;
    status.signal().map(|raw| {
        nix::sys::signal::Signal::try_from(raw)
            .map(|signal| signal.as_str().to_string())
            .unwrap_or_else(|_| raw.to_string())
    })
}

#[cfg(not(target_family = "unix"))]
fn exit_signal_name(_status: &ExitStatus) -> Option<String> {
    None
}

/// Invoked exactly once per successful spawn, when the process terminates.
pub type ExitCallback = Box<dyn FnOnce(ProcessExit) + Send + 'static>;

/// Owns one spawned subordinate process.
///
/// Spawning pipes all three stdio streams: stdin/stdout are returned to the
/// caller for the session transport, stderr is drained into the log stream.
/// A watcher thread reaps the child and reports the termination through the
/// registered [`ExitCallback`], so a crash surfaces even when nobody is
/// blocked on the process.
pub struct ProcessRunner {
    pid: u32,
    shutdown_timeout: Duration,
    exit_slot: Arc<ExitSlot>,
}

#[derive(Default)]
struct ExitSlot {
    exit: Mutex<Option<ProcessExit>>,
    cvar: Condvar,
}

impl ExitSlot {
    fn record(&self, exit: ProcessExit) {
        *self.exit.lock().expect("exit slot lock poisoned") = Some(exit);
        self.cvar.notify_all();
    }

    fn get(&self) -> Option<ProcessExit> {
        self.exit.lock().expect("exit slot lock poisoned").clone()
    }

    /// Waits up to `timeout` for the exit to be recorded.
    fn wait(&self, timeout: Duration) -> bool {
        let guard = self.exit.lock().expect("exit slot lock poisoned");
        let (guard, _) = self
            .cvar
            .wait_timeout_while(guard, timeout, |exit| exit.is_none())
            .expect("exit slot lock poisoned");
        guard.is_some()
    }
}

impl ProcessRunner {
    /// Spawns the configured executable. Fails synchronously when the binary
    /// cannot be launched; nothing is left behind on failure.
    pub fn spawn(
        server: &ServerId,
        exec: &ExecutableData,
        shutdown_timeout: Duration,
        on_exit: ExitCallback,
    ) -> Result<(Self, StdioPipes), CommandError> {
        let mut cmd = Command::new(&exec.bin);
        cmd.args(&exec.args)
            .envs(&exec.env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        if let Some(cwd) = &exec.cwd {
            cmd.current_dir(cwd);
        }

        let mut child = cmd.spawn()?;
        let pid = child.id();

        let stdin = child.stdin.take().ok_or(CommandError::StreamPipe("stdin"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or(CommandError::StreamPipe("stdout"))?;
        let stderr = child
            .stderr
            .take()
            .ok_or(CommandError::StreamPipe("stderr"))?;
        spawn_stderr_drain(stderr, server.clone());

        let exit_slot = Arc::new(ExitSlot::default());
        let watcher_slot = exit_slot.clone();
        let watcher_server = server.clone();
        spawn_named_thread(format!("{server} exit watcher"), move || {
            let exit = match child.wait() {
                Ok(status) => ProcessExit::from(status),
                Err(err) => {
                    warn!(server = %watcher_server, %err, "failed waiting on subordinate process");
                    ProcessExit::default()
                }
            };
            debug!(server = %watcher_server, pid, exit = exit.describe(), "subordinate process exited");
            watcher_slot.record(exit.clone());
            on_exit(exit);
        });

        Ok((
            Self {
                pid,
                shutdown_timeout,
                exit_slot,
            },
            StdioPipes { stdin, stdout },
        ))
    }

    /// The spawned pid, or `None` once the exit has been confirmed.
    pub fn pid(&self) -> Option<u32> {
        (!self.has_exited()).then_some(self.pid)
    }

    /// The pid assigned at spawn time, regardless of whether the process has
    /// exited since.
    pub fn spawned_pid(&self) -> u32 {
        self.pid
    }

    pub fn has_exited(&self) -> bool {
        self.exit_slot.get().is_some()
    }

    pub fn last_exit(&self) -> Option<ProcessExit> {
        self.exit_slot.get()
    }

    /// Graceful stop: polite termination request, a bounded wait, then a
    /// forced kill. Resolves once the exit watcher has reaped the child.
    pub fn stop(&self) -> Result<(), CommandError> {
        if self.has_exited() {
            return Ok(());
        }

        let slot = self.exit_slot.clone();
        let deadline = self.shutdown_timeout;
        if let Err(err) = ProcessTerminator::new(self.pid).shutdown(move || slot.wait(deadline)) {
            // The process can beat the signal to the grave; that is a
            // successful stop, not an error.
            if self.has_exited() {
                return Ok(());
            }
            return Err(err);
        }

        if !self.exit_slot.wait(KILL_CONFIRM_TIMEOUT) {
            return Err(CommandError::Signal(format!(
                "process {} still running after forced kill",
                self.pid
            )));
        }
        Ok(())
    }
}
