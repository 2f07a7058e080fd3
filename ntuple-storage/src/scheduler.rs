use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::thread::JoinHandle;

use log::{debug, warn};
use ntuple_error::{NTupleResult, ntuple_bail};
use parking_lot::{Condvar, Mutex};

/// A unit of work handed to a [`TaskScheduler`].
pub type Task = Box<dyn FnOnce() + Send + 'static>;

/// A fork-join barrier used by page sources to decompress the pages of a cluster in parallel.
///
/// Callers [`reset`](Self::reset) the scheduler, [`add_task`](Self::add_task) any number of
/// independent tasks and then block in [`wait`](Self::wait) until all of them have run.
pub trait TaskScheduler: Send + Sync {
    fn reset(&self);

    fn add_task(&self, task: Task);

    fn wait(&self);
}

/// Runs every task on the calling thread as soon as it is added.
#[derive(Debug, Default, Clone, Copy)]
pub struct InlineTaskScheduler;

impl TaskScheduler for InlineTaskScheduler {
    fn reset(&self) {}

    fn add_task(&self, task: Task) {
        task()
    }

    fn wait(&self) {}
}

/// Runs tasks on a fixed set of worker threads fed through a channel.
///
/// A panicking task is logged and counted as done; it does not take its worker down.
#[derive(Debug)]
pub struct ThreadPoolTaskScheduler {
    submitter: Option<flume::Sender<Task>>,
    threads: Vec<JoinHandle<()>>,
    pending: Arc<Pending>,
}

#[derive(Debug, Default)]
struct Pending {
    count: Mutex<usize>,
    done: Condvar,
}

impl Pending {
    fn start(&self) {
        *self.count.lock() += 1;
    }

    fn finish(&self) {
        let mut count = self.count.lock();
        *count = count.saturating_sub(1);
        if *count == 0 {
            self.done.notify_all();
        }
    }
}

/// Marks a task as done even if it unwinds.
struct Finish<'a>(&'a Pending);

impl Drop for Finish<'_> {
    fn drop(&mut self) {
        self.0.finish();
    }
}

fn run(pending: &Pending, task: Task) {
    let _finish = Finish(pending);
    if catch_unwind(AssertUnwindSafe(task)).is_err() {
        warn!("task panicked on {}", std::thread::current().name().unwrap_or("unnamed thread"));
    }
}

impl ThreadPoolTaskScheduler {
    pub fn new(n_threads: usize) -> NTupleResult<Self> {
        if n_threads == 0 {
            ntuple_bail!("a thread pool needs at least one thread");
        }
        let (submitter, rx) = flume::unbounded::<Task>();
        let pending = Arc::new(Pending::default());
        let threads = (0..n_threads)
            .map(|tid| {
                let rx = rx.clone();
                let pending = Arc::clone(&pending);
                std::thread::Builder::new()
                    .name(format!("ntuple-unzip-{tid}"))
                    .spawn(move || {
                        while let Ok(task) = rx.recv() {
                            run(&pending, task);
                        }
                    })
            })
            .collect::<Result<Vec<_>, _>>()?;
        debug!("started task scheduler with {n_threads} threads");

        Ok(Self {
            submitter: Some(submitter),
            threads,
            pending,
        })
    }

    pub fn n_threads(&self) -> usize {
        self.threads.len()
    }
}

impl TaskScheduler for ThreadPoolTaskScheduler {
    fn reset(&self) {
        self.wait();
    }

    fn add_task(&self, task: Task) {
        self.pending.start();
        let Some(submitter) = &self.submitter else {
            return run(&self.pending, task);
        };
        if let Err(flume::SendError(task)) = submitter.send(task) {
            run(&self.pending, task);
        }
    }

    fn wait(&self) {
        let mut count = self.pending.count.lock();
        while *count > 0 {
            self.pending.done.wait(&mut count);
        }
    }
}

impl Drop for ThreadPoolTaskScheduler {
    fn drop(&mut self) {
        // workers exit once the channel is closed and drained
        drop(self.submitter.take());
        for thread in self.threads.drain(..) {
            if thread.join().is_err() {
                warn!("task scheduler worker exited with a panic");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use rstest::rstest;

    use super::*;

    fn pools() -> Vec<Box<dyn TaskScheduler>> {
        vec![
            Box::new(InlineTaskScheduler),
            Box::new(ThreadPoolTaskScheduler::new(3).unwrap()),
        ]
    }

    #[test]
    fn wait_joins_all_tasks() {
        for scheduler in pools() {
            let counter = Arc::new(AtomicUsize::new(0));
            scheduler.reset();
            for _ in 0..64 {
                let counter = Arc::clone(&counter);
                scheduler.add_task(Box::new(move || {
                    counter.fetch_add(1, Ordering::SeqCst);
                }));
            }
            scheduler.wait();
            assert_eq!(counter.load(Ordering::SeqCst), 64);
        }
    }

    #[test]
    fn panicking_task_does_not_block_wait() {
        let scheduler = ThreadPoolTaskScheduler::new(1).unwrap();
        let counter = Arc::new(AtomicUsize::new(0));
        scheduler.add_task(Box::new(|| panic!("boom")));
        let inner = Arc::clone(&counter);
        scheduler.add_task(Box::new(move || {
            inner.fetch_add(1, Ordering::SeqCst);
        }));
        scheduler.wait();
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[rstest]
    #[case(1)]
    #[case(4)]
    fn thread_count(#[case] n: usize) {
        assert_eq!(ThreadPoolTaskScheduler::new(n).unwrap().n_threads(), n);
    }

    #[test]
    fn zero_threads_is_rejected() {
        assert!(ThreadPoolTaskScheduler::new(0).is_err());
    }
}
