use std::any::Any;
use std::panic::{catch_unwind, AssertUnwindSafe};

use anyhow::{anyhow, ensure, Result};
use crossbeam::channel::Receiver;
use log::error;

type Job<'env> = Box<dyn FnOnce() -> Result<()> + Send + 'env>;

/// Jobs collected for one scheduler run, started in submission order.
///
/// A job may block waiting on output of jobs submitted before it, never after it: workers
/// take jobs first come first served, so every job a running job waits on has already started.
#[derive(Default)]
pub struct JobSet<'env> {
    jobs: Vec<(String, Job<'env>)>,
}

impl<'env> JobSet<'env> {
    pub fn new() -> Self {
        JobSet { jobs: Vec::new() }
    }

    pub fn submit<F>(&mut self, name: impl Into<String>, job: F)
    where
        F: FnOnce() -> Result<()> + Send + 'env,
    {
        self.jobs.push((name.into(), Box::new(job)));
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }
}

/// Runs job sets on at most `max_workers` threads at a time.
#[derive(Clone, Debug)]
pub struct Scheduler {
    max_workers: usize,
}

impl Scheduler {
    pub fn new(max_workers: usize) -> Result<Self> {
        ensure!(max_workers > 0, "scheduler needs at least one worker");
        Ok(Scheduler { max_workers })
    }

    pub fn max_workers(&self) -> usize {
        self.max_workers
    }

    /// Runs every job to completion, even after another job has failed. Returns the first
    /// failure; all of them are logged.
    pub fn run(&self, jobs: JobSet<'_>) -> Result<()> {
        if jobs.is_empty() {
            return Ok(());
        }
        let num_workers = self.max_workers.min(jobs.len());
        let (job_tx, job_rx) = crossbeam::channel::unbounded();
        for job in jobs.jobs {
            job_tx
                .send(job)
                .map_err(|_| anyhow!("scheduler job queue closed"))?;
        }
        drop(job_tx);

        let mut errors: Vec<anyhow::Error> = std::thread::scope(|s| {
            let handles: Vec<_> = (0..num_workers)
                .map(|_| {
                    let job_rx = job_rx.clone();
                    s.spawn(move || run_worker(job_rx))
                })
                .collect();
            handles
                .into_iter()
                .flat_map(|handle| match handle.join() {
                    Ok(errors) => errors,
                    Err(_) => vec![anyhow!("scheduler worker panicked")],
                })
                .collect()
        });

        for e in &errors {
            error!("{e:#}");
        }
        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors.swap_remove(0))
        }
    }
}

fn run_worker(job_rx: Receiver<(String, Job<'_>)>) -> Vec<anyhow::Error> {
    let mut errors: Vec<anyhow::Error> = Vec::new();
    for (name, job) in job_rx.iter() {
        // Unwinding drops whatever the job captured, which closes its queues, so jobs
        // downstream of a panicked one still terminate.
        match catch_unwind(AssertUnwindSafe(job)) {
            Ok(Ok(())) => {}
            Ok(Err(e)) => errors.push(e.context(format!("job '{name}' failed"))),
            Err(payload) => errors.push(anyhow!(
                "job '{name}' panicked: {}",
                panic_message(payload.as_ref())
            )),
        }
    }
    errors
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::bail;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_runs_all_jobs() -> Result<()> {
        let counter = AtomicUsize::new(0);
        let mut jobs = JobSet::new();
        for i in 0..10 {
            let counter = &counter;
            jobs.submit(format!("job {i}"), move || {
                counter.fetch_add(i, Ordering::SeqCst);
                Ok(())
            });
        }
        assert_eq!(jobs.len(), 10);
        Scheduler::new(3)?.run(jobs)?;
        assert_eq!(counter.load(Ordering::SeqCst), 45);
        Ok(())
    }

    #[test]
    fn test_concurrency_bounded() -> Result<()> {
        let running = AtomicUsize::new(0);
        let peak = AtomicUsize::new(0);
        let mut jobs = JobSet::new();
        for i in 0..8 {
            let (running, peak) = (&running, &peak);
            jobs.submit(format!("job {i}"), move || {
                let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                std::thread::sleep(std::time::Duration::from_millis(10));
                running.fetch_sub(1, Ordering::SeqCst);
                Ok(())
            });
        }
        Scheduler::new(2)?.run(jobs)?;
        assert!(peak.load(Ordering::SeqCst) <= 2);
        Ok(())
    }

    #[test]
    fn test_chained_jobs_single_worker() -> Result<()> {
        // Each job waits on a queue filled by the job before it.
        let (tx0, rx0) = crossbeam::channel::unbounded::<usize>();
        let (tx1, rx1) = crossbeam::channel::unbounded::<usize>();
        let (out_tx, out_rx) = crossbeam::channel::unbounded::<usize>();
        tx0.send(1)?;
        drop(tx0);
        let mut jobs = JobSet::new();
        jobs.submit("first", move || {
            for x in rx0.iter() {
                tx1.send(x + 1)?;
            }
            Ok(())
        });
        jobs.submit("second", move || {
            for x in rx1.iter() {
                out_tx.send(x * 10)?;
            }
            Ok(())
        });
        Scheduler::new(1)?.run(jobs)?;
        assert_eq!(out_rx.try_iter().collect::<Vec<_>>(), vec![20]);
        Ok(())
    }

    #[test]
    fn test_errors_and_panics_reported() -> Result<()> {
        let finished = AtomicUsize::new(0);
        let mut jobs = JobSet::new();
        jobs.submit("fails", || bail!("bad state"));
        jobs.submit("panics", || panic!("boom"));
        let finished_ref = &finished;
        jobs.submit("succeeds", move || {
            finished_ref.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });
        let err = Scheduler::new(1)?.run(jobs).unwrap_err();
        assert!(format!("{err:#}").contains("bad state"));
        assert_eq!(finished.load(Ordering::SeqCst), 1);

        let mut jobs = JobSet::new();
        jobs.submit("panics", || panic!("boom"));
        let err = Scheduler::new(2)?.run(jobs).unwrap_err();
        assert!(err.to_string().contains("boom"));
        Ok(())
    }

    #[test]
    fn test_zero_workers_rejected() {
        assert!(Scheduler::new(0).is_err());
    }
}
