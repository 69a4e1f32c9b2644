use super::error::CommandError;

/// Gracefully shuts down the process with the given pid, force-killing it
/// when the caller-provided wait reports that the deadline expired.
pub struct ProcessTerminator {
    pid: u32,
}

impl ProcessTerminator {
    pub fn new(pid: u32) -> Self {
        Self { pid }
    }

    /// Sends SIGTERM, then runs `wait_exited`; when it returns `false` the
    /// process is still alive and gets a SIGKILL.
    #[cfg(target_family = "unix")]
    pub fn shutdown<F>(self, wait_exited: F) -> Result<(), CommandError>
    where
        F: FnOnce() -> bool,
    {
        use nix::{sys::signal, unistd::Pid};
        signal::kill(Pid::from_raw(self.pid as i32), signal::SIGTERM)
            .map_err(|err| CommandError::Signal(err.to_string()))?;

        if !wait_exited() {
            signal::kill(Pid::from_raw(self.pid as i32), signal::SIGKILL)
                .map_err(|err| CommandError::Signal(err.to_string()))?;
        }
        Ok(())
    }

    #[cfg(target_family = "windows")]
    pub fn shutdown<F>(self, _wait_exited: F) -> Result<(), CommandError>
    where
        F: FnOnce() -> bool,
    {
        unimplemented!("graceful shutdown by pid is not supported on windows")
    }
}

#[cfg(all(test, target_family = "unix"))]
mod tests {
    use super::*;
    use rstest::rstest;
    use std::process::Command;
    use std::thread::{self, sleep};
    use std::time::Duration;

    #[rstest]
    #[case::deadline_expired(35, || false, "signal: 9 (SIGKILL)")]
    #[case::exited_on_time(1, || true, "exit status: 0")]
    fn shutdown_respects_wait_outcome(
        #[case] trap_sleep: u64,
        #[case] wait_exited: fn() -> bool,
        #[case] expected: &str,
    ) {
        let mut trap_cmd = Command::new("sh")
            .arg("-c")
            .arg(format!(
                "trap \"sleep {trap_sleep};exit 0\" TERM;while true; do sleep 1; done"
            ))
            .spawn()
            .unwrap();

        // Warm-up time so the shell installs the trap before the signal.
        sleep(Duration::from_secs(1));

        let pid = trap_cmd.id();
        thread::spawn(move || {
            _ = ProcessTerminator::new(pid).shutdown(wait_exited);
        });

        let result = trap_cmd.wait();
        assert_eq!(expected, result.unwrap().to_string());
    }
}
