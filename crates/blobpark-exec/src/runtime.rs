//! Production runtime: an owner thread and a blocking pool on tokio.
//!
//! - `OwnerThread` runs posted tasks one at a time, in order, on a dedicated
//!   thread driving a current-thread runtime. Delayed tasks are timers on that
//!   same runtime.
//! - `TokioWorkers` is a multi-thread runtime used only for `spawn_blocking`.
//! - `ParkingService` builds both, opens the backing file and owns the manager.

use std::path::Path;
use std::sync::Arc;
use std::thread::{self, JoinHandle, ThreadId};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::runtime::{Builder, Runtime};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use blobpark_core::config::ParkingConfig;
use blobpark_io::{open_temp_file, DiskAllocator};

use crate::blob::ParkableBlob;
use crate::error::{Error, Result};
use crate::manager::ParkingManager;
use crate::task::{BlockingPool, OwnerSequence, Task, TaskRunners};

enum OwnerMessage {
    Run(Task),
    RunAfter(Duration, Task),
    Shutdown,
}

pub struct OwnerThread {
    tx: mpsc::UnboundedSender<OwnerMessage>,
    thread_id: ThreadId,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl OwnerThread {
    pub fn spawn(name: &str) -> Result<Self> {
        let runtime = Builder::new_current_thread().enable_time().build()?;
        let (tx, mut rx) = mpsc::unbounded_channel::<OwnerMessage>();
        let handle = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || {
                runtime.block_on(async move {
                    while let Some(msg) = rx.recv().await {
                        match msg {
                            OwnerMessage::Run(task) => task(),
                            OwnerMessage::RunAfter(delay, task) => {
                                tokio::spawn(async move {
                                    tokio::time::sleep(delay).await;
                                    task();
                                });
                            }
                            OwnerMessage::Shutdown => break,
                        }
                    }
                });
                // Pending timers are dropped here, still on the owner thread.
                drop(runtime);
            })?;
        let thread_id = handle.thread().id();
        Ok(Self {
            tx,
            thread_id,
            handle: Mutex::new(Some(handle)),
        })
    }

    /// Stop after the tasks already queued and wait for the thread, unless
    /// called from the owner thread itself.
    pub fn shutdown(&self) {
        let _ = self.tx.send(OwnerMessage::Shutdown);
        if self.is_current() {
            return;
        }
        if let Some(handle) = self.handle.lock().take() {
            if handle.join().is_err() {
                warn!("owner thread panicked");
            }
        }
    }

    fn send(&self, msg: OwnerMessage) {
        if self.tx.send(msg).is_err() {
            warn!("owner thread stopped; task dropped");
        }
    }
}

impl OwnerSequence for OwnerThread {
    fn post(&self, task: Task) {
        self.send(OwnerMessage::Run(task));
    }

    fn post_delayed(&self, delay: Duration, task: Task) {
        self.send(OwnerMessage::RunAfter(delay, task));
    }

    fn is_current(&self) -> bool {
        thread::current().id() == self.thread_id
    }

    fn now(&self) -> Instant {
        Instant::now()
    }
}

pub struct TokioWorkers {
    runtime: Option<Runtime>,
}

impl TokioWorkers {
    pub fn new(threads: usize) -> Result<Self> {
        let runtime = Builder::new_multi_thread()
            .worker_threads(1)
            .max_blocking_threads(threads.max(1))
            .thread_name("blobpark-io")
            .build()?;
        Ok(Self {
            runtime: Some(runtime),
        })
    }
}

impl BlockingPool for TokioWorkers {
    fn spawn_blocking(&self, task: Task) {
        match &self.runtime {
            Some(rt) => {
                rt.spawn_blocking(task);
            }
            None => warn!("blocking pool stopped; task dropped"),
        }
    }
}

impl Drop for TokioWorkers {
    fn drop(&mut self) {
        // Dropping a runtime blocks on its tasks, which is not allowed from
        // inside another runtime (the owner thread may hold the last handle).
        if let Some(rt) = self.runtime.take() {
            rt.shutdown_background();
        }
    }
}

/// Owner thread, blocking pool, allocator and manager wired together.
pub struct ParkingService {
    manager: ParkingManager,
    owner: Arc<OwnerThread>,
}

impl ParkingService {
    pub fn start(config: ParkingConfig) -> Result<Self> {
        config.validate()?;
        let owner = Arc::new(OwnerThread::spawn("blobpark-owner")?);
        let workers = Arc::new(TokioWorkers::new(config.io_threads)?);
        let runners = TaskRunners {
            owner: Arc::clone(&owner) as Arc<dyn OwnerSequence>,
            workers: workers as Arc<dyn BlockingPool>,
        };
        let allocator = DiskAllocator::from_config(&config);
        let manager = ParkingManager::new(config.clone(), allocator.clone(), runners);
        let service = Self { manager, owner };

        if config.disk_enabled {
            let file = open_temp_file(config.spill_dir.as_deref().map(Path::new))?;
            service.run_on_owner(move || allocator.provide_file(Arc::new(file)))??;
        } else {
            debug!("disk disabled; blobs stay resident");
        }
        info!(
            policy = ?config.policy,
            min_parking_size = config.min_parking_size,
            max_disk_bytes = ?config.max_disk_bytes,
            "parking service started"
        );
        Ok(service)
    }

    pub fn manager(&self) -> &ParkingManager {
        &self.manager
    }

    pub fn create_blob(&self) -> ParkableBlob {
        self.manager.create_blob()
    }

    /// Run `f` on the owner thread and wait for its result.
    ///
    /// Must not be called from inside an async context.
    pub fn run_on_owner<F, R>(&self, f: F) -> Result<R>
    where
        F: FnOnce() -> R + Send + 'static,
        R: Send + 'static,
    {
        if self.owner.is_current() {
            return Ok(f());
        }
        let (tx, rx) = oneshot::channel();
        self.owner.post(Box::new(move || {
            let _ = tx.send(f());
        }));
        rx.blocking_recv()
            .map_err(|_| Error::Runtime("owner thread stopped before replying".into()))
    }

    /// Stop the owner thread after the tasks already queued. Blobs still
    /// alive afterwards can no longer be parked.
    pub fn shutdown(self) {
        drop(self)
    }
}

impl Drop for ParkingService {
    fn drop(&mut self) {
        self.owner.shutdown();
        debug!("parking service stopped");
    }
}
