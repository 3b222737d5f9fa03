use crate::{config::SupervisorConfig, telemetry::Metrics};
use std::{
    any::Any,
    future::Future,
    sync::Arc,
    time::{Duration, Instant},
};
use tokio::{
    sync::broadcast,
    task::{JoinError, JoinHandle},
    time::sleep,
};

#[derive(Debug, Clone, Copy)]
pub struct RestartPolicy {
    pub initial_delay: Duration,
    pub max_delay: Duration,
}

impl From<&SupervisorConfig> for RestartPolicy {
    fn from(config: &SupervisorConfig) -> Self {
        Self {
            initial_delay: Duration::from_millis(config.restart_delay_ms),
            max_delay: Duration::from_millis(
                config.max_restart_delay_ms.max(config.restart_delay_ms),
            ),
        }
    }
}

enum Exit {
    Stopped,
    Failed(String),
}

#[derive(Clone)]
pub struct Supervisor {
    policy: RestartPolicy,
    metrics: Arc<Metrics>,
    shutdown: broadcast::Sender<()>,
}

impl Supervisor {
    pub fn new(
        policy: RestartPolicy,
        metrics: Arc<Metrics>,
        shutdown: broadcast::Sender<()>,
    ) -> Self {
        Self {
            policy,
            metrics,
            shutdown,
        }
    }

    /// Runs `task` on its own tokio task until it stops deliberately or shutdown is signalled.
    pub fn supervise<F, Fut>(&self, name: &str, mut task: F) -> JoinHandle<()>
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let name = name.to_string();
        let policy = self.policy;
        let metrics = self.metrics.clone();
        let mut shutdown_rx = self.shutdown.subscribe();

        tokio::spawn(async move {
            let mut delay = policy.initial_delay;
            loop {
                let started = Instant::now();
                let mut handle = tokio::spawn(task());

                let exit = tokio::select! {
                    result = &mut handle => classify(result),
                    _ = shutdown_rx.recv() => {
                        handle.abort();
                        tracing::info!(task = %name, "Supervised task received shutdown signal");
                        break;
                    }
                };

                match exit {
                    Exit::Stopped => {
                        tracing::info!(task = %name, "Supervised task stopped");
                        break;
                    }
                    Exit::Failed(reason) => {
                        tracing::error!(
                            task = %name,
                            "Supervised task failed, restarting: {}",
                            reason
                        );
                        metrics.record_task_restart(&name);
                    }
                }

                if started.elapsed() > policy.max_delay {
                    delay = policy.initial_delay;
                }
                let jitter = rand::random::<f32>() * 0.2 + 0.9;
                tokio::select! {
                    _ = sleep(delay.mul_f32(jitter)) => {}
                    _ = shutdown_rx.recv() => break,
                }
                delay = (delay * 2).min(policy.max_delay);
            }
        })
    }

    /// Same policy as [`Supervisor::supervise`] for work that blocks a thread.
    ///
    /// Blocking work cannot be aborted, so `task` must watch for shutdown on its own.
    pub fn supervise_blocking<F>(&self, name: &str, task: F) -> JoinHandle<()>
    where
        F: Fn() -> anyhow::Result<()> + Send + Sync + 'static,
    {
        let task = Arc::new(task);
        self.supervise(name, move || {
            let task = task.clone();
            async move {
                match tokio::task::spawn_blocking(move || task()).await {
                    Ok(result) => result,
                    Err(e) if e.is_panic() => {
                        Err(anyhow::anyhow!("panicked: {}", panic_message(&*e.into_panic())))
                    }
                    Err(e) => Err(anyhow::anyhow!("blocking task cancelled: {}", e)),
                }
            }
        })
    }
}

fn classify(result: Result<anyhow::Result<()>, JoinError>) -> Exit {
    match result {
        Ok(Ok(())) => Exit::Stopped,
        Ok(Err(e)) => Exit::Failed(format!("{:#}", e)),
        Err(e) if e.is_panic() => {
            Exit::Failed(format!("panicked: {}", panic_message(&*e.into_panic())))
        }
        Err(_) => Exit::Stopped,
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::time::timeout;

    pub(crate) fn supervisor() -> (Supervisor, broadcast::Sender<()>) {
        let (shutdown_tx, _) = broadcast::channel(1);
        let policy = RestartPolicy {
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(5),
        };
        let metrics = Arc::new(Metrics::new().unwrap());
        (Supervisor::new(policy, metrics, shutdown_tx.clone()), shutdown_tx)
    }

    #[tokio::test]
    async fn test_deliberate_stop_is_not_restarted() {
        let (supervisor, _shutdown) = supervisor();
        let runs = Arc::new(AtomicUsize::new(0));

        let counter = runs.clone();
        let handle = supervisor.supervise("once", move || {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        });

        timeout(Duration::from_secs(2), handle).await.unwrap().unwrap();
        assert_eq!(runs.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_panicking_task_is_restarted() {
        let (supervisor, _shutdown) = supervisor();
        let runs = Arc::new(AtomicUsize::new(0));

        let counter = runs.clone();
        let handle = supervisor.supervise("flaky", move || {
            let counter = counter.clone();
            async move {
                if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                    panic!("remote call blew up");
                }
                Ok(())
            }
        });

        timeout(Duration::from_secs(2), handle).await.unwrap().unwrap();
        assert_eq!(runs.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_failed_task_is_restarted() {
        let (supervisor, _shutdown) = supervisor();
        let runs = Arc::new(AtomicUsize::new(0));

        let counter = runs.clone();
        let handle = supervisor.supervise("erroring", move || {
            let counter = counter.clone();
            async move {
                if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                    anyhow::bail!("connection reset");
                }
                Ok(())
            }
        });

        timeout(Duration::from_secs(2), handle).await.unwrap().unwrap();
        assert_eq!(runs.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_shutdown_stops_running_task() {
        let (supervisor, shutdown) = supervisor();

        let handle = supervisor.supervise("forever", || async {
            std::future::pending::<()>().await;
            Ok(())
        });

        tokio::time::sleep(Duration::from_millis(20)).await;
        shutdown.send(()).unwrap();
        timeout(Duration::from_secs(2), handle).await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_blocking_task_is_restarted_after_panic() {
        let (supervisor, _shutdown) = supervisor();
        let runs = Arc::new(AtomicUsize::new(0));

        let counter = runs.clone();
        let handle = supervisor.supervise_blocking("blocking", move || {
            if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                panic!("poll loop crashed");
            }
            Ok(())
        });

        timeout(Duration::from_secs(2), handle).await.unwrap().unwrap();
        assert_eq!(runs.load(Ordering::SeqCst), 2);
    }
}
