use rand::Rng;
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;

use crate::notify::{Notifier, PipelineEvent, StageStatus};
use crate::Result;

/// Lifecycle of one supervised stage task
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageState {
    Running,
    Backoff,
    /// Restart budget exhausted; the stage stays down while the rest of the
    /// pipeline keeps running
    Degraded,
    Stopped,
}

impl StageState {
    fn as_str(self) -> &'static str {
        match self {
            StageState::Running => "running",
            StageState::Backoff => "backoff",
            StageState::Degraded => "degraded",
            StageState::Stopped => "stopped",
        }
    }
}

/// Shared view of stage health, read by the dashboard publisher
#[derive(Default)]
pub struct HealthRegistry {
    stages: Mutex<HashMap<String, (StageState, u32)>>,
}

impl HealthRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, stage: &str, state: StageState, restarts: u32) {
        self.stages
            .lock()
            .unwrap()
            .insert(stage.to_string(), (state, restarts));
    }

    pub fn state_of(&self, stage: &str) -> Option<StageState> {
        self.stages.lock().unwrap().get(stage).map(|(s, _)| *s)
    }

    pub fn statuses(&self) -> Vec<StageStatus> {
        let mut statuses: Vec<StageStatus> = self
            .stages
            .lock()
            .unwrap()
            .iter()
            .map(|(name, (state, restarts))| StageStatus {
                name: name.clone(),
                state: state.as_str().to_string(),
                restarts: *restarts,
            })
            .collect();
        statuses.sort_by(|a, b| a.name.cmp(&b.name));
        statuses
    }
}

#[derive(Debug, Clone)]
pub struct RestartPolicy {
    pub max_restarts: u32,
    pub backoff_base: Duration,
    pub backoff_cap: Duration,
}

impl RestartPolicy {
    /// Exponential backoff with jitter, capped
    fn delay(&self, restart: u32) -> Duration {
        let exp = self
            .backoff_base
            .saturating_mul(2u32.saturating_pow(restart.saturating_sub(1)))
            .min(self.backoff_cap);
        let jitter_ms = rand::thread_rng().gen_range(0..=exp.as_millis() as u64 / 4 + 1);
        exp + Duration::from_millis(jitter_ms)
    }
}

/// Run a stage body under supervision: restart on fault with exponential
/// backoff, mark the stage degraded once the restart budget is spent, and
/// leave the rest of the pipeline running either way.
///
/// The factory is invoked once per (re)start so each incarnation gets a
/// fresh future; a clean `Ok(())` return (cooperative shutdown) ends
/// supervision.
pub fn spawn_supervised<F, Fut>(
    name: &'static str,
    factory: F,
    mut shutdown: watch::Receiver<bool>,
    policy: RestartPolicy,
    health: Arc<HealthRegistry>,
    notifier: Arc<dyn Notifier>,
) -> tokio::task::JoinHandle<()>
where
    F: Fn() -> Fut + Send + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    tokio::spawn(async move {
        let mut restarts = 0u32;

        loop {
            health.set(name, StageState::Running, restarts);
            tracing::info!("Stage {} running (restarts: {})", name, restarts);

            match factory().await {
                Ok(()) => {
                    tracing::info!("Stage {} stopped cleanly", name);
                    health.set(name, StageState::Stopped, restarts);
                    return;
                }
                Err(e) => {
                    restarts += 1;

                    if restarts > policy.max_restarts {
                        tracing::error!(
                            "Stage {} exhausted its restart budget ({}): {}",
                            name,
                            policy.max_restarts,
                            e
                        );
                        health.set(name, StageState::Degraded, restarts);
                        notifier
                            .notify(&PipelineEvent::StageDegraded {
                                stage: name.to_string(),
                                error: e.to_string(),
                            })
                            .await;
                        return;
                    }

                    let delay = policy.delay(restarts);
                    tracing::warn!(
                        "Stage {} failed ({}), restarting in {:?} ({}/{})",
                        name,
                        e,
                        delay,
                        restarts,
                        policy.max_restarts
                    );
                    health.set(name, StageState::Backoff, restarts);

                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = shutdown.changed() => {
                            if *shutdown.borrow() {
                                health.set(name, StageState::Stopped, restarts);
                                return;
                            }
                        }
                    }
                }
            }
        }
    })
}
