//! Periodic task scheduling
//!
//! Each recurring loop (health checks, sweeps, probes) runs as one spawned task
//! driven by an interval and a stop channel. Stopping only prevents future
//! ticks; a tick that is already executing runs to completion.

use futures::future::BoxFuture;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::debug;

/// Handle to a running periodic loop
pub struct PeriodicTask {
    name: String,
    stop_tx: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

impl PeriodicTask {
    /// Spawn a loop that calls `tick` every `period`.
    ///
    /// With `run_immediately` the first tick fires right away, otherwise after
    /// one full period.
    pub fn spawn<F>(name: impl Into<String>, period: Duration, run_immediately: bool, tick: F) -> Self
    where
        F: Fn() -> BoxFuture<'static, ()> + Send + Sync + 'static,
    {
        let name = name.into();
        let (stop_tx, mut stop_rx) = watch::channel(false);
        let tick = Arc::new(tick);
        let task_name = name.clone();

        let handle = tokio::spawn(async move {
            let start = if run_immediately {
                tokio::time::Instant::now()
            } else {
                tokio::time::Instant::now() + period
            };
            let mut interval = tokio::time::interval_at(start, period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = interval.tick() => {}
                    changed = stop_rx.changed() => {
                        if changed.is_err() || *stop_rx.borrow() {
                            break;
                        }
                        continue;
                    }
                }

                if *stop_rx.borrow() {
                    break;
                }
                (tick)().await;
            }

            debug!("Periodic task {} stopped", task_name);
        });

        Self {
            name,
            stop_tx,
            handle,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Request the loop to stop before its next tick
    pub fn stop(&self) {
        let _ = self.stop_tx.send(true);
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Stop and wait for the current tick (if any) to finish
    pub async fn shutdown(self) {
        self.stop();
        let _ = self.handle.await;
    }
}
