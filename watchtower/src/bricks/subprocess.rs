//! Supervises a child process across the observation engine's event stream.
//!
//! The CLI front-end that drives `auto-restart` behavior lives outside this crate (see
//! `SPEC_FULL.md` §1/§6); this type exists here because the engine's own handler-dispatch
//! test suite exercises process supervision through the [`crate::Handler`] interface.

use std::io;
use std::sync::Mutex;

use duct::Handle;
use watchtower_types::Event;

use crate::Handler;

/// When a supervised process should be restarted.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RestartPolicy {
    /// Never restart automatically; a dispatched event only starts the process if it isn't
    /// already running.
    Never,
    /// Restart whenever a dispatched event arrives, killing any still-running instance first.
    OnEveryEvent,
}

/// Spawns and supervises a single child process, restarting it according to a
/// [`RestartPolicy`] as events are dispatched to it.
pub struct SubprocessSupervisor {
    command: Vec<String>,
    policy: RestartPolicy,
    current: Mutex<Option<Handle>>,
}

impl SubprocessSupervisor {
    /// Builds a supervisor for the given shell command (argv form, no shell interpolation).
    pub fn new(command: Vec<String>, policy: RestartPolicy) -> Self {
        Self {
            command,
            policy,
            current: Mutex::new(None),
        }
    }

    /// Starts the process if it is not already running.
    pub fn ensure_started(&self) -> io::Result<()> {
        let mut guard = self.current.lock().unwrap();
        if guard.is_some() {
            return Ok(());
        }
        *guard = Some(self.spawn()?);
        Ok(())
    }

    /// Kills the current process (if running) and starts a fresh one.
    pub fn restart(&self) -> io::Result<()> {
        self.stop();
        let mut guard = self.current.lock().unwrap();
        *guard = Some(self.spawn()?);
        Ok(())
    }

    /// Kills the current process, if any, and forgets it.
    pub fn stop(&self) {
        if let Some(handle) = self.current.lock().unwrap().take() {
            let _ = handle.kill();
        }
    }

    /// Whether a process is currently believed to be running.
    pub fn is_running(&self) -> bool {
        self.current.lock().unwrap().is_some()
    }

    fn spawn(&self) -> io::Result<Handle> {
        let (program, args) = self
            .command
            .split_first()
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "empty command"))?;
        duct::cmd(program, args).start()
    }
}

impl Handler for SubprocessSupervisor {
    fn on_any_event(&mut self, _event: &Event) {
        let result = match self.policy {
            RestartPolicy::Never => self.ensure_started(),
            RestartPolicy::OnEveryEvent => self.restart(),
        };
        if let Err(err) = result {
            log::warn!("subprocess supervisor failed to (re)start command: {err}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[cfg(unix)]
    #[test]
    fn never_policy_starts_once_and_stays() {
        let mut sup = SubprocessSupervisor::new(
            vec!["sh".into(), "-c".into(), "sleep 1".into()],
            RestartPolicy::Never,
        );
        sup.dispatch(&Event::file_modified(PathBuf::from("/tmp/x/a")));
        assert!(sup.is_running());
        sup.stop();
        assert!(!sup.is_running());
    }

    #[cfg(unix)]
    #[test]
    fn on_every_event_policy_restarts() {
        let mut sup = SubprocessSupervisor::new(
            vec!["sh".into(), "-c".into(), "sleep 1".into()],
            RestartPolicy::OnEveryEvent,
        );
        sup.dispatch(&Event::file_modified(PathBuf::from("/tmp/x/a")));
        assert!(sup.is_running());
        sup.dispatch(&Event::file_modified(PathBuf::from("/tmp/x/a")));
        assert!(sup.is_running());
        sup.stop();
    }
}
