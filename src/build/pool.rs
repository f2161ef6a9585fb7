//! Fixed-width worker pool for independent build units.
//!
//! Each task usually blocks on an external process, so plain OS threads are
//! enough. Every task produces a `Result`; failures are collected and
//! reported together once the pool drains.

use anyhow::{anyhow, Result};
use std::any::Any;
use std::collections::VecDeque;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::thread;
use tracing::{error, info};

use crate::error::BuildError;

/// What happens to queued tasks after one fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FailurePolicy {
    /// Keep going; report every failure at the end.
    #[default]
    RunToCompletion,
    /// Stop handing out new tasks after the first failure. Tasks already
    /// running are still waited for.
    FailFast,
}

/// A named unit of work.
pub struct Task<'a> {
    pub name: String,
    job: Box<dyn FnOnce() -> Result<()> + Send + 'a>,
}

impl<'a> Task<'a> {
    pub fn new(name: impl Into<String>, job: impl FnOnce() -> Result<()> + Send + 'a) -> Self {
        Self {
            name: name.into(),
            job: Box::new(job),
        }
    }
}

/// Outcome of [`WorkerPool::run`] when nothing failed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolReport {
    pub completed: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct WorkerPool {
    width: usize,
    policy: FailurePolicy,
}

impl WorkerPool {
    pub fn new(width: usize, policy: FailurePolicy) -> Self {
        Self {
            width: width.max(1),
            policy,
        }
    }

    pub fn width(&self) -> usize {
        self.width
    }

    /// Run every task and wait for all workers.
    ///
    /// Fails with [`BuildError::UnitFailures`] naming each failed task; with
    /// [`FailurePolicy::FailFast`] tasks never started are not counted.
    pub fn run(&self, tasks: Vec<Task<'_>>) -> Result<PoolReport> {
        let total = tasks.len();
        if total == 0 {
            return Ok(PoolReport {
                completed: Vec::new(),
            });
        }

        let queue = Mutex::new(tasks.into_iter().collect::<VecDeque<_>>());
        let completed = Mutex::new(Vec::new());
        let failures = Mutex::new(Vec::new());
        let stop = AtomicBool::new(false);

        thread::scope(|scope| {
            for _ in 0..self.width.min(total) {
                scope.spawn(|| loop {
                    if stop.load(Ordering::SeqCst) {
                        break;
                    }
                    let next = match queue.lock() {
                        Ok(mut queue) => queue.pop_front(),
                        Err(_) => None,
                    };
                    let Some(task) = next else { break };

                    let Task { name, job } = task;
                    let outcome = match panic::catch_unwind(AssertUnwindSafe(job)) {
                        Ok(result) => result,
                        Err(payload) => Err(anyhow!("panicked: {}", panic_message(&*payload))),
                    };
                    match outcome {
                        Ok(()) => {
                            info!("{name}: done");
                            if let Ok(mut done) = completed.lock() {
                                done.push(name);
                            }
                        }
                        Err(err) => {
                            error!("{name}: {err:#}");
                            if let Ok(mut failed) = failures.lock() {
                                failed.push((name, format!("{err:#}")));
                            }
                            if self.policy == FailurePolicy::FailFast {
                                stop.store(true, Ordering::SeqCst);
                            }
                        }
                    }
                });
            }
        });

        let failures = failures.into_inner().unwrap_or_else(|p| p.into_inner());
        let completed = completed.into_inner().unwrap_or_else(|p| p.into_inner());
        if failures.is_empty() {
            Ok(PoolReport { completed })
        } else {
            Err(BuildError::UnitFailures { total, failures }.into())
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message
    } else {
        "unknown panic"
    }
}
