//! Ordered setup/teardown of system configuration.
//!
//! A [`Configurator`] owns a list of [`Step`]s. `configure` runs each step's
//! setup commands in order and counts the steps that completed; `deconfigure`
//! walks the completed steps backwards running their teardown commands, so a
//! partially applied configuration is undone exactly as far as it got.

use std::fmt;
use std::process::Command;
use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::error::NetError;

/// Executes a single shell command line.
pub trait CommandRunner: Send + Sync + fmt::Debug {
    fn run(&self, command: &str) -> Result<(), NetError>;
}

/// Runs commands through `sh -c` in their own process group.
#[derive(Debug, Default, Clone, Copy)]
pub struct ShellRunner;

impl CommandRunner for ShellRunner {
    fn run(&self, command: &str) -> Result<(), NetError> {
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg(command);
        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            cmd.process_group(0);
        }
        let status = cmd.status()?;
        if status.success() {
            Ok(())
        } else {
            Err(NetError::CommandFailed {
                command: command.to_string(),
                status: status.to_string(),
            })
        }
    }
}

/// Setup commands paired with the commands that undo them.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Step {
    pub setup: Vec<String>,
    pub teardown: Vec<String>,
}

impl Step {
    pub fn new<S, T>(setup: S, teardown: T) -> Self
    where
        S: IntoIterator,
        S::Item: Into<String>,
        T: IntoIterator,
        T::Item: Into<String>,
    {
        Self {
            setup: setup.into_iter().map(Into::into).collect(),
            teardown: teardown.into_iter().map(Into::into).collect(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Configurator {
    name: String,
    steps: Vec<Step>,
    applied: usize,
    runner: Arc<dyn CommandRunner>,
}

impl Configurator {
    pub fn new(name: impl Into<String>) -> Self {
        Self::with_runner(name, Arc::new(ShellRunner))
    }

    pub fn with_runner(name: impl Into<String>, runner: Arc<dyn CommandRunner>) -> Self {
        Self {
            name: name.into(),
            steps: Vec::new(),
            applied: 0,
            runner,
        }
    }

    pub fn push(&mut self, step: Step) -> &mut Self {
        self.steps.push(step);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn steps(&self) -> &[Step] {
        &self.steps
    }

    /// Number of steps whose setup completed.
    pub fn applied(&self) -> usize {
        self.applied
    }

    /// Treat every step as applied, for tearing down a configuration left
    /// behind by an earlier run.
    pub fn assume_applied(&mut self) {
        self.applied = self.steps.len();
    }

    /// Run the setup of every step not yet applied.
    ///
    /// Without `force` the first failing command stops the run and its step is
    /// not counted as applied. With `force` failures are logged and skipped.
    pub fn configure(&mut self, force: bool) -> Result<(), NetError> {
        info!(configurator = %self.name, steps = self.steps.len(), "applying network configuration");
        let _guard = InterruptGuard::new();
        while self.applied < self.steps.len() {
            let step = &self.steps[self.applied];
            run_group(self.runner.as_ref(), &step.setup, force)?;
            self.applied += 1;
        }
        Ok(())
    }

    /// Undo applied steps in reverse order.
    pub fn deconfigure(&mut self, force: bool) -> Result<(), NetError> {
        info!(configurator = %self.name, applied = self.applied, "reverting network configuration");
        let _guard = InterruptGuard::new();
        while self.applied > 0 {
            let step = &self.steps[self.applied - 1];
            run_group(self.runner.as_ref(), &step.teardown, force)?;
            self.applied -= 1;
        }
        Ok(())
    }
}

fn run_group(runner: &dyn CommandRunner, commands: &[String], force: bool) -> Result<(), NetError> {
    for command in commands {
        debug!(%command, "running");
        match runner.run(command) {
            Ok(()) => {}
            Err(e) if force => warn!(%command, error = %e, "command failed, continuing"),
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

/// Ignores SIGINT for its lifetime so an interrupt lands between steps,
/// restoring the previous disposition on drop.
struct InterruptGuard {
    #[cfg(unix)]
    previous: Option<libc::sigaction>,
}

impl InterruptGuard {
    #[cfg(unix)]
    fn new() -> Self {
        // SAFETY: both sigaction structs are fully initialized (zeroed is a
        // valid empty mask) and live for the duration of the call.
        let previous = unsafe {
            let mut ignore: libc::sigaction = std::mem::zeroed();
            ignore.sa_sigaction = libc::SIG_IGN;
            let mut previous: libc::sigaction = std::mem::zeroed();
            (libc::sigaction(libc::SIGINT, &ignore, &mut previous) == 0).then_some(previous)
        };
        Self { previous }
    }

    #[cfg(not(unix))]
    fn new() -> Self {
        Self {}
    }
}

#[cfg(unix)]
impl Drop for InterruptGuard {
    fn drop(&mut self) {
        if let Some(previous) = &self.previous {
            // SAFETY: restores the disposition captured in `new`.
            unsafe {
                libc::sigaction(libc::SIGINT, previous, std::ptr::null_mut());
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::sync::Mutex;

    /// Records commands and fails the ones containing `fail_on`.
    #[derive(Debug, Default)]
    pub(crate) struct RecordingRunner {
        pub commands: Mutex<Vec<String>>,
        pub fail_on: Option<String>,
    }

    impl CommandRunner for RecordingRunner {
        fn run(&self, command: &str) -> Result<(), NetError> {
            self.commands.lock().unwrap().push(command.to_string());
            match &self.fail_on {
                Some(pattern) if command.contains(pattern.as_str()) => Err(NetError::CommandFailed {
                    command: command.to_string(),
                    status: "exit status: 1".to_string(),
                }),
                _ => Ok(()),
            }
        }
    }

    fn three_steps(runner: Arc<RecordingRunner>) -> Configurator {
        let mut c = Configurator::with_runner("test", runner);
        c.push(Step::new(["a1", "a2"], ["undo-a"]))
            .push(Step::new(["b1"], ["undo-b1", "undo-b2"]))
            .push(Step::new(["c1"], ["undo-c"]));
        c
    }

    #[test]
    fn test_teardown_runs_in_reverse() {
        let runner = Arc::new(RecordingRunner::default());
        let mut c = three_steps(runner.clone());
        c.configure(false).unwrap();
        assert_eq!(c.applied(), 3);
        c.deconfigure(false).unwrap();
        assert_eq!(c.applied(), 0);
        assert_eq!(
            *runner.commands.lock().unwrap(),
            ["a1", "a2", "b1", "c1", "undo-c", "undo-b1", "undo-b2", "undo-a"]
        );
    }

    #[test]
    fn test_failed_step_is_not_undone() {
        let runner = Arc::new(RecordingRunner {
            fail_on: Some("b1".into()),
            ..Default::default()
        });
        let mut c = three_steps(runner.clone());
        assert!(c.configure(false).is_err());
        assert_eq!(c.applied(), 1);
        c.deconfigure(false).unwrap();
        assert_eq!(*runner.commands.lock().unwrap(), ["a1", "a2", "b1", "undo-a"]);
    }

    #[test]
    fn test_force_continues_past_failures() {
        let runner = Arc::new(RecordingRunner {
            fail_on: Some("undo".into()),
            ..Default::default()
        });
        let mut c = three_steps(runner.clone());
        c.configure(true).unwrap();
        assert!(c.deconfigure(false).is_err());
        assert_eq!(c.applied(), 3);
        c.deconfigure(true).unwrap();
        assert_eq!(c.applied(), 0);
    }

    #[test]
    fn test_assume_applied_enables_teardown() {
        let runner = Arc::new(RecordingRunner::default());
        let mut c = three_steps(runner.clone());
        c.assume_applied();
        c.deconfigure(false).unwrap();
        assert_eq!(runner.commands.lock().unwrap().len(), 4);
    }

    #[test]
    fn test_configure_is_incremental() {
        let runner = Arc::new(RecordingRunner::default());
        let mut c = three_steps(runner.clone());
        c.configure(false).unwrap();
        c.configure(false).unwrap();
        assert_eq!(runner.commands.lock().unwrap().len(), 4);
    }

    #[test]
    fn test_shell_runner_reports_status() {
        assert!(ShellRunner.run("true").is_ok());
        assert!(matches!(ShellRunner.run("exit 3"), Err(NetError::CommandFailed { .. })));
    }
}
