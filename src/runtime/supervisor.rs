/// Per-job background loops with explicit cancellation
///
/// Provider polling and pipelined streaming both run as fixed-interval loops
/// owned by the job they serve. Each loop listens on a watch channel; completing
/// the job or aborting its run flips the channel and the loop exits after its
/// current tick.

use crate::error::Result;
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};

/// What a loop tick wants next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopControl {
    Continue,
    Stop,
}

struct Supervised {
    run_id: i64,
    name: &'static str,
    cancel: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

#[derive(Default)]
pub struct JobSupervisor {
    /// Key: job_id
    loops: Mutex<HashMap<i64, Vec<Supervised>>>,
}

impl std::fmt::Debug for JobSupervisor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobSupervisor")
            .field("jobs", &self.jobs())
            .finish()
    }
}

impl JobSupervisor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `tick` every `period` (first tick after one period) until it
    /// returns `Stop` or the job is cancelled. Tick errors are logged and the
    /// loop carries on, except fatal ones.
    pub fn spawn<F, Fut>(&self, job_id: i64, run_id: i64, name: &'static str, period: Duration, tick: F)
    where
        F: Fn() -> Fut + Send + 'static,
        Fut: Future<Output = Result<LoopControl>> + Send + 'static,
    {
        let (cancel, mut cancelled) = watch::channel(false);
        let handle = tokio::spawn(async move {
            let mut interval = interval_at(Instant::now() + period, period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    changed = cancelled.changed() => {
                        if changed.is_err() || *cancelled.borrow() {
                            break;
                        }
                    }
                    _ = interval.tick() => {
                        match tick().await {
                            Ok(LoopControl::Continue) => {}
                            Ok(LoopControl::Stop) => break,
                            Err(e) if e.is_fatal() => {
                                tracing::error!(job_id, "❌ {} loop stopped: {}", name, e);
                                break;
                            }
                            Err(e) => tracing::warn!(job_id, "⚠️ {} tick failed: {}", name, e),
                        }
                    }
                }
            }
            tracing::debug!(job_id, "{} loop exited", name);
        });

        tracing::debug!(job_id, run_id, "🔁 Supervising {} loop every {:?}", name, period);
        self.lock().entry(job_id).or_default().push(Supervised {
            run_id,
            name,
            cancel,
            handle,
        });
    }

    /// Signal every loop of a job. Returns how many were signalled.
    pub fn cancel(&self, job_id: i64) -> usize {
        let removed = self.lock().remove(&job_id).unwrap_or_default();
        let count = removed.len();
        for supervised in removed {
            let _ = supervised.cancel.send(true);
            tracing::debug!(job_id, "🛑 Cancelled {} loop", supervised.name);
        }
        count
    }

    /// Signal every loop of every job in a run.
    pub fn cancel_run(&self, run_id: i64) -> usize {
        let jobs: Vec<i64> = self
            .lock()
            .iter()
            .filter(|(_, loops)| loops.iter().any(|l| l.run_id == run_id))
            .map(|(job_id, _)| *job_id)
            .collect();
        jobs.into_iter().map(|job_id| self.cancel(job_id)).sum()
    }

    /// Live loops of a job. Finished loops are pruned.
    pub fn active(&self, job_id: i64) -> usize {
        let mut loops = self.lock();
        let Some(entries) = loops.get_mut(&job_id) else {
            return 0;
        };
        entries.retain(|l| !l.handle.is_finished());
        let n = entries.len();
        if n == 0 {
            loops.remove(&job_id);
        }
        n
    }

    pub fn jobs(&self) -> Vec<i64> {
        let mut jobs: Vec<i64> = self.lock().keys().copied().collect();
        jobs.sort_unstable();
        jobs
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<i64, Vec<Supervised>>> {
        self.loops.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
