use std::{future::Future, str::FromStr, sync::Arc, time::Duration};

use chrono::Utc;
use cron::Schedule;
use tokio::{
    sync::{Mutex, watch},
    task::JoinHandle,
};

/// How often to look at the cadence again while a task is disabled
const DISABLED_POLL_INTERVAL: Duration = Duration::from_secs(5);

/// When a periodic task fires next
#[derive(Debug, Clone)]
pub enum Cadence {
    Every(Duration),
    Cron(Schedule),
    Disabled,
}

impl Cadence {
    /// Cadence for an optional cron expression. Missing, blank, and
    /// unparsable expressions disable the task.
    pub fn from_cron(expression: Option<&str>) -> Self {
        let Some(expression) = expression.map(str::trim).filter(|e| !e.is_empty()) else {
            return Cadence::Disabled;
        };

        match Schedule::from_str(expression) {
            Ok(schedule) => Cadence::Cron(schedule),
            Err(e) => {
                tracing::error!(expression = expression, error = %e, "Invalid cron schedule");
                Cadence::Disabled
            }
        }
    }

    /// Delay until the next firing, `None` when disabled
    pub fn next_delay(&self) -> Option<Duration> {
        match self {
            Cadence::Every(interval) => Some(*interval),
            Cadence::Cron(schedule) => {
                let now = Utc::now();
                let next = schedule.upcoming(Utc).next()?;
                Some((next - now).to_std().unwrap_or_default())
            }
            Cadence::Disabled => None,
        }
    }
}

type CadenceFn = Arc<dyn Fn() -> Cadence + Send + Sync>;

/// Drives one periodic task.
///
/// The cadence is read again before every tick so configuration changes apply
/// on the next tick. Runs never overlap: a tick that fires while the previous
/// run is still going is skipped.
pub struct TaskRunner<F> {
    name: &'static str,
    cadence: CadenceFn,
    task: Arc<F>,
    in_flight: Arc<Mutex<()>>,
}

impl<F> Clone for TaskRunner<F> {
    fn clone(&self) -> Self {
        Self {
            name: self.name,
            cadence: self.cadence.clone(),
            task: self.task.clone(),
            in_flight: self.in_flight.clone(),
        }
    }
}

impl<F, Fut> TaskRunner<F>
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    pub fn new(
        name: &'static str,
        cadence: impl Fn() -> Cadence + Send + Sync + 'static,
        task: F,
    ) -> Self {
        Self {
            name,
            cadence: Arc::new(cadence),
            task: Arc::new(task),
            in_flight: Arc::new(Mutex::new(())),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Starts a run unless one is already in flight
    pub fn fire(&self) -> Option<JoinHandle<()>> {
        let Ok(guard) = self.in_flight.clone().try_lock_owned() else {
            tracing::debug!(task = self.name, "Previous run still in flight, skipping tick");
            return None;
        };

        let task = self.task.clone();
        Some(tokio::spawn(async move {
            task().await;
            drop(guard);
        }))
    }

    /// Ticks until `shutdown` flips, then waits for the in-flight run
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        tracing::info!(task = self.name, "Scheduler started");

        while !*shutdown.borrow() {
            let cadence = (self.cadence)();
            let (delay, enabled) = match cadence.next_delay() {
                Some(delay) => (delay, true),
                None => (DISABLED_POLL_INTERVAL, false),
            };

            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = shutdown.changed() => break,
            }

            if enabled {
                self.fire();
            }
        }

        let _drained = self.in_flight.lock().await;
        tracing::info!(task = self.name, "Scheduler stopped");
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;

    #[test]
    fn blank_and_missing_cron_disable() {
        assert!(matches!(Cadence::from_cron(None), Cadence::Disabled));
        assert!(matches!(Cadence::from_cron(Some("  ")), Cadence::Disabled));
        assert!(matches!(Cadence::from_cron(Some("not cron")), Cadence::Disabled));
        assert!(Cadence::Disabled.next_delay().is_none());
    }

    #[test]
    fn cron_delay_is_bounded_by_period() {
        let cadence = Cadence::from_cron(Some("*/5 * * * * *"));
        let delay = cadence.next_delay().unwrap();
        assert!(delay <= Duration::from_secs(5));
    }

    #[tokio::test]
    async fn overlapping_ticks_are_skipped() {
        let runs = Arc::new(AtomicU32::new(0));
        let (release_tx, release_rx) = watch::channel(false);

        let counter = runs.clone();
        let runner = TaskRunner::new(
            "test",
            || Cadence::Disabled,
            move || {
                let counter = counter.clone();
                let mut release = release_rx.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    let _ = release.wait_for(|released| *released).await;
                }
            },
        );

        let first = runner.fire().expect("first run starts");
        assert!(runner.fire().is_none());

        release_tx.send(true).unwrap();
        first.await.unwrap();

        let second = runner.fire().expect("runs again once idle");
        second.await.unwrap();
        assert_eq!(runs.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_waits_for_in_flight_run() {
        let finished = Arc::new(AtomicU32::new(0));
        let done = finished.clone();

        let runner = TaskRunner::new(
            "test",
            || Cadence::Every(Duration::from_millis(10)),
            move || {
                let done = done.clone();
                async move {
                    tokio::time::sleep(Duration::from_millis(50)).await;
                    done.fetch_add(1, Ordering::SeqCst);
                }
            },
        );

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = tokio::spawn(runner.run(shutdown_rx));

        tokio::time::sleep(Duration::from_millis(15)).await;
        shutdown_tx.send(true).unwrap();
        handle.await.unwrap();

        assert_eq!(finished.load(Ordering::SeqCst), 1);
    }
}
