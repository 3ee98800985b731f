use std::{
    collections::VecDeque,
    io,
    panic::{self, AssertUnwindSafe},
    sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError, mpsc},
    thread,
};

use log::{debug, error};
use thiserror::Error;

pub type Job = Box<dyn FnOnce() + Send + 'static>;

#[derive(Debug, Error)]
pub enum PoolError {
    #[error("a pool needs at least one worker")]
    NoWorkers,
    #[error("failed to spawn worker: {0}")]
    Spawn(#[source] io::Error),
    #[error("pool is stopping, no new tasks are accepted")]
    Stopped,
    #[error("task panicked or was dropped before producing a result")]
    TaskLost,
}

#[derive(Default)]
struct State {
    queue: VecDeque<Job>,
    busy: usize,
    stopping: bool,
}

struct Shared {
    state: Mutex<State>,
    available: Condvar,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, State> {
        // jobs never run under the lock, so a poisoned state is still consistent
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Fixed set of worker threads consuming a FIFO task queue.
///
/// Stopping drains the queue: workers keep taking tasks until it is empty
/// and only then exit.
pub struct ThreadPool {
    workers: Vec<Worker>,
    shared: Arc<Shared>,
}

impl ThreadPool {
    pub fn start(size: usize) -> Result<Self, PoolError> {
        if size == 0 {
            return Err(PoolError::NoWorkers);
        }

        let shared = Arc::new(Shared {
            state: Mutex::new(State::default()),
            available: Condvar::new(),
        });

        let mut pool = Self {
            workers: Vec::with_capacity(size),
            shared,
        };
        for id in 0..size {
            match Worker::new(id, Arc::clone(&pool.shared)) {
                Ok(worker) => pool.workers.push(worker),
                Err(e) => {
                    pool.stop();
                    return Err(PoolError::Spawn(e));
                }
            }
        }

        Ok(pool)
    }

    /// Queue `f` and wake one idle worker.
    ///
    /// The returned handle may be dropped if the result is not needed.
    pub fn submit<F, T>(&self, f: F) -> Result<TaskHandle<T>, PoolError>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        let (sender, receiver) = mpsc::channel();
        let job: Job = Box::new(move || {
            let _ = sender.send(f());
        });

        {
            let mut state = self.shared.lock();
            if state.stopping {
                return Err(PoolError::Stopped);
            }
            state.queue.push_back(job);
        }
        self.shared.available.notify_one();

        Ok(TaskHandle { receiver })
    }

    pub fn busy_count(&self) -> usize {
        self.shared.lock().busy
    }

    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }

    /// A detached view of the busy counter, usable after the pool moves.
    pub fn monitor(&self) -> PoolMonitor {
        PoolMonitor {
            shared: Arc::clone(&self.shared),
        }
    }

    /// Request a stop and block until every queued task has run.
    pub fn stop(&mut self) {
        self.shared.lock().stopping = true;
        self.shared.available.notify_all();

        for worker in self.workers.drain(..) {
            debug!("shutting down worker {}", worker.id);
            if worker.thread.join().is_err() {
                error!("worker {} exited abnormally", worker.id);
            }
        }
    }
}

impl Drop for ThreadPool {
    fn drop(&mut self) {
        self.stop();
    }
}

#[derive(Clone)]
pub struct PoolMonitor {
    shared: Arc<Shared>,
}

impl PoolMonitor {
    pub fn busy_count(&self) -> usize {
        self.shared.lock().busy
    }
}

/// Outcome of a submitted task.
pub struct TaskHandle<T> {
    receiver: mpsc::Receiver<T>,
}

impl<T> TaskHandle<T> {
    /// Block until the task has run.
    pub fn join(self) -> Result<T, PoolError> {
        self.receiver.recv().map_err(|_| PoolError::TaskLost)
    }

    /// `Ok(None)` while the task is still queued or running.
    pub fn try_join(&self) -> Result<Option<T>, PoolError> {
        match self.receiver.try_recv() {
            Ok(value) => Ok(Some(value)),
            Err(mpsc::TryRecvError::Empty) => Ok(None),
            Err(mpsc::TryRecvError::Disconnected) => Err(PoolError::TaskLost),
        }
    }
}

struct Worker {
    id: usize,
    thread: thread::JoinHandle<()>,
}

impl Worker {
    fn new(id: usize, shared: Arc<Shared>) -> io::Result<Self> {
        let thread = thread::Builder::new()
            .name(format!("worker-{id}"))
            .spawn(move || {
                while let Some(job) = next_job(&shared) {
                    debug!("worker {id} running a task");
                    if panic::catch_unwind(AssertUnwindSafe(job)).is_err() {
                        error!("worker {id}: task panicked");
                    }
                    shared.lock().busy -= 1;
                }
                debug!("worker {id} exiting");
            })?;

        Ok(Self { id, thread })
    }
}

/// Blocks until a task is available, or returns `None` once stopping with an empty queue.
fn next_job(shared: &Shared) -> Option<Job> {
    let mut state = shared.lock();
    loop {
        if let Some(job) = state.queue.pop_front() {
            state.busy += 1;
            return Some(job);
        }
        if state.stopping {
            return None;
        }
        state = shared
            .available
            .wait(state)
            .unwrap_or_else(PoisonError::into_inner);
    }
}
