//! Periodic job scheduler.
//!
//! Each job runs on its own tokio task and timer, independent of block
//! ingestion. A failing job is logged and retried at its next tick; it never
//! takes the process down.

use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::error::ViewError;

/// Body of a periodic job.
#[async_trait]
pub trait PeriodicJob: Send + Sync {
    async fn run(&self) -> Result<(), ViewError>;
}

struct FnJob<F>(F);

#[async_trait]
impl<F, Fut> PeriodicJob for FnJob<F>
where
    F: Fn() -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), ViewError>> + Send,
{
    async fn run(&self) -> Result<(), ViewError> {
        (self.0)().await
    }
}

/// `(interval, callback, run_immediately)` plus a name for logs.
#[derive(Clone)]
pub struct Job {
    pub name: String,
    pub interval: Duration,
    pub run_immediately: bool,
    pub callback: Arc<dyn PeriodicJob>,
}

impl Job {
    pub fn new(name: impl Into<String>, interval: Duration, callback: Arc<dyn PeriodicJob>) -> Self {
        Self {
            name: name.into(),
            interval,
            run_immediately: false,
            callback,
        }
    }

    /// Build a job from an async closure.
    pub fn from_fn<F, Fut>(name: impl Into<String>, interval: Duration, f: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), ViewError>> + Send + 'static,
    {
        Self::new(name, interval, Arc::new(FnJob(f)))
    }

    /// Run once at registration, before the first interval elapses.
    pub fn run_immediately(mut self) -> Self {
        self.run_immediately = true;
        self
    }
}

impl std::fmt::Debug for Job {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Job")
            .field("name", &self.name)
            .field("interval", &self.interval)
            .field("run_immediately", &self.run_immediately)
            .finish()
    }
}

/// Owns the background task of every scheduled job.
///
/// Dropping the scheduler aborts its jobs.
#[derive(Default)]
pub struct Scheduler {
    jobs: Vec<(String, JoinHandle<()>)>,
}

impl Scheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register and start `job`.
    ///
    /// With `run_immediately` set, the first run completes before this returns.
    pub async fn schedule(&mut self, job: Job) -> Result<(), ViewError> {
        if job.interval.is_zero() {
            return Err(ViewError::Config(format!(
                "job '{}' has a zero interval",
                job.name
            )));
        }

        info!(job = %job.name, interval_ms = job.interval.as_millis() as u64, "scheduling job");

        if job.run_immediately {
            run_once(&job).await;
        }

        let name = job.name.clone();
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(job.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker.tick().await; // first tick completes immediately

            loop {
                ticker.tick().await;
                run_once(&job).await;
            }
        });
        self.jobs.push((name, handle));
        Ok(())
    }

    pub fn job_names(&self) -> Vec<&str> {
        self.jobs.iter().map(|(name, _)| name.as_str()).collect()
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }

    /// Abort every job task.
    pub fn shutdown(&mut self) {
        for (name, handle) in self.jobs.drain(..) {
            debug!(job = %name, "stopping job");
            handle.abort();
        }
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        self.shutdown();
    }
}

async fn run_once(job: &Job) {
    let started = Instant::now();
    match job.callback.run().await {
        Ok(()) => debug!(
            job = %job.name,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "job finished"
        ),
        Err(e) => warn!(job = %job.name, error = %e, "job failed, retrying at next tick"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn counting_job(name: &str, interval: Duration, count: Arc<AtomicU32>, fail: bool) -> Job {
        Job::from_fn(name, interval, move || {
            let count = count.clone();
            async move {
                count.fetch_add(1, Ordering::SeqCst);
                if fail {
                    Err(ViewError::Rpc("provider down".into()))
                } else {
                    Ok(())
                }
            }
        })
    }

    #[tokio::test(start_paused = true)]
    async fn run_immediately_fires_before_first_interval() {
        let count = Arc::new(AtomicU32::new(0));
        let mut scheduler = Scheduler::new();
        scheduler
            .schedule(counting_job("params", Duration::from_secs(10), count.clone(), false).run_immediately())
            .await
            .unwrap();

        assert_eq!(count.load(Ordering::SeqCst), 1);

        tokio::time::sleep(Duration::from_secs(25)).await;
        assert_eq!(count.load(Ordering::SeqCst), 3); // immediate + ticks at 10s and 20s
    }

    #[tokio::test(start_paused = true)]
    async fn failing_job_is_retried_each_tick() {
        let count = Arc::new(AtomicU32::new(0));
        let mut scheduler = Scheduler::new();
        scheduler
            .schedule(counting_job("expiry", Duration::from_secs(5), count.clone(), true))
            .await
            .unwrap();

        assert_eq!(count.load(Ordering::SeqCst), 0);
        tokio::time::sleep(Duration::from_secs(16)).await;
        assert_eq!(count.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn zero_interval_is_rejected() {
        let mut scheduler = Scheduler::new();
        let job = counting_job("bad", Duration::ZERO, Arc::new(AtomicU32::new(0)), false);
        assert!(matches!(scheduler.schedule(job).await, Err(ViewError::Config(_))));
        assert!(scheduler.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_stops_jobs() {
        let count = Arc::new(AtomicU32::new(0));
        let mut scheduler = Scheduler::new();
        scheduler
            .schedule(counting_job("scores", Duration::from_secs(1), count.clone(), false))
            .await
            .unwrap();
        assert_eq!(scheduler.job_names(), vec!["scores"]);

        scheduler.shutdown();
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }
}
