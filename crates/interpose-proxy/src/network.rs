//! Host network configuration owned by a proxy run.
//!
//! Configurators spawn blocking commands, so they run on the blocking pool.
//! Setup is all or nothing: if a configurator fails, the ones already applied
//! are reverted before the error is returned.

use interpose_net::{Configurator, NetError};
use tracing::warn;

use crate::error::ProxyError;

#[derive(Debug, Clone, Default)]
pub struct NetworkSetup {
    configurators: Vec<Configurator>,
    force: bool,
}

impl NetworkSetup {
    pub fn new() -> Self {
        Self::default()
    }

    /// Continue past failing commands instead of stopping at the first one.
    pub fn force(mut self, force: bool) -> Self {
        self.force = force;
        self
    }

    pub fn push(&mut self, configurator: Configurator) -> &mut Self {
        self.configurators.push(configurator);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.configurators.is_empty()
    }

    pub fn names(&self) -> Vec<&str> {
        self.configurators.iter().map(Configurator::name).collect()
    }

    pub async fn apply(&mut self) -> Result<(), ProxyError> {
        if self.configurators.is_empty() {
            return Ok(());
        }
        let force = self.force;
        self.blocking(move |configurators| apply_all(configurators, force))
            .await
    }

    pub async fn revert(&mut self) -> Result<(), ProxyError> {
        if self.configurators.is_empty() {
            return Ok(());
        }
        let force = self.force;
        self.blocking(move |configurators| revert_all(configurators, force))
            .await
    }

    async fn blocking<F>(&mut self, f: F) -> Result<(), ProxyError>
    where
        F: FnOnce(&mut [Configurator]) -> Result<(), NetError> + Send + 'static,
    {
        let mut configurators = std::mem::take(&mut self.configurators);
        let (configurators, result) = tokio::task::spawn_blocking(move || {
            let result = f(&mut configurators);
            (configurators, result)
        })
        .await
        .map_err(|e| NetError::Io(std::io::Error::other(e)))?;
        self.configurators = configurators;
        result.map_err(Into::into)
    }
}

fn apply_all(configurators: &mut [Configurator], force: bool) -> Result<(), NetError> {
    for i in 0..configurators.len() {
        if let Err(e) = configurators[i].configure(force) {
            // The failing configurator may have applied some of its steps.
            for done in configurators[..=i].iter_mut().rev() {
                if let Err(undo) = done.deconfigure(true) {
                    warn!(configurator = %done.name(), error = %undo, "rollback failed");
                }
            }
            return Err(e);
        }
    }
    Ok(())
}

fn revert_all(configurators: &mut [Configurator], force: bool) -> Result<(), NetError> {
    let mut first = None;
    for configurator in configurators.iter_mut().rev() {
        if let Err(e) = configurator.deconfigure(force) {
            warn!(configurator = %configurator.name(), error = %e, "revert failed");
            first.get_or_insert(e);
        }
    }
    first.map_or(Ok(()), Err)
}

#[cfg(test)]
mod tests {
    use super::*;
    use interpose_net::{CommandRunner, Step};
    use std::sync::{Arc, Mutex};

    #[derive(Debug, Default)]
    struct Recorder {
        commands: Mutex<Vec<String>>,
        fail_on: Option<&'static str>,
    }

    impl CommandRunner for Recorder {
        fn run(&self, command: &str) -> Result<(), NetError> {
            self.commands.lock().unwrap().push(command.to_string());
            match self.fail_on {
                Some(pattern) if command.contains(pattern) => Err(NetError::CommandFailed {
                    command: command.to_string(),
                    status: "exit status: 1".to_string(),
                }),
                _ => Ok(()),
            }
        }
    }

    fn configurator(name: &str, runner: Arc<Recorder>) -> Configurator {
        let mut c = Configurator::with_runner(name, runner);
        c.push(Step::new([format!("{name}-up")], [format!("{name}-down")]));
        c
    }

    #[tokio::test]
    async fn test_revert_runs_in_reverse_order() {
        let runner = Arc::new(Recorder::default());
        let mut setup = NetworkSetup::new();
        setup
            .push(configurator("bridge", runner.clone()))
            .push(configurator("tproxy", runner.clone()));
        setup.apply().await.unwrap();
        setup.revert().await.unwrap();
        assert_eq!(
            *runner.commands.lock().unwrap(),
            ["bridge-up", "tproxy-up", "tproxy-down", "bridge-down"]
        );
    }

    #[tokio::test]
    async fn test_failed_apply_rolls_back() {
        let runner = Arc::new(Recorder {
            fail_on: Some("tproxy-up"),
            ..Default::default()
        });
        let mut setup = NetworkSetup::new();
        setup
            .push(configurator("bridge", runner.clone()))
            .push(configurator("tproxy", runner.clone()));
        assert!(setup.apply().await.is_err());
        assert_eq!(
            *runner.commands.lock().unwrap(),
            ["bridge-up", "tproxy-up", "bridge-down"]
        );
        assert_eq!(setup.names(), ["bridge", "tproxy"]);
    }
}
