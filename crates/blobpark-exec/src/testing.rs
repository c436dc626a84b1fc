//! Deterministic runner for tests.
//!
//! `ManualRunner` is both the owner sequence and the blocking pool. Nothing
//! runs until the test says so, and time only moves through `advance`. The
//! thread that creates the runner counts as the owning sequence.

use std::collections::VecDeque;
use std::sync::Arc;
use std::thread::{self, ThreadId};
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::task::{BlockingPool, OwnerSequence, Task, TaskRunners};

struct Delayed {
    due: Duration,
    seq: u64,
    task: Task,
}

#[derive(Default)]
struct ManualState {
    elapsed: Duration,
    seq: u64,
    ready: VecDeque<Task>,
    delayed: Vec<Delayed>,
    blocking: VecDeque<Task>,
}

impl ManualState {
    /// Move delayed tasks that are due onto the ready queue, oldest first.
    fn promote_due(&mut self) {
        let now = self.elapsed;
        let (mut due, later): (Vec<_>, Vec<_>) =
            self.delayed.drain(..).partition(|d| d.due <= now);
        self.delayed = later;
        due.sort_by_key(|d| (d.due, d.seq));
        self.ready.extend(due.into_iter().map(|d| d.task));
    }
}

pub struct ManualRunner {
    owner: ThreadId,
    start: Instant,
    state: Mutex<ManualState>,
}

impl ManualRunner {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            owner: thread::current().id(),
            start: Instant::now(),
            state: Mutex::new(ManualState::default()),
        })
    }

    pub fn runners(self: &Arc<Self>) -> TaskRunners {
        TaskRunners {
            owner: Arc::clone(self) as Arc<dyn OwnerSequence>,
            workers: Arc::clone(self) as Arc<dyn BlockingPool>,
        }
    }

    /// Run owner tasks (including ones they post) until the queue is empty.
    pub fn run_owner_tasks(&self) -> usize {
        let mut ran = 0;
        loop {
            let task = {
                let mut st = self.state.lock();
                st.promote_due();
                st.ready.pop_front()
            };
            match task {
                Some(task) => {
                    task();
                    ran += 1;
                }
                None => return ran,
            }
        }
    }

    /// Run queued blocking tasks on the calling thread.
    pub fn run_blocking_tasks(&self) -> usize {
        let mut ran = 0;
        while let Some(task) = self.state.lock().blocking.pop_front() {
            task();
            ran += 1;
        }
        ran
    }

    /// Drop the ready owner tasks unrun, the way a stopped owner would.
    /// Tasks posted while dropping are dropped too; timers are left alone.
    pub fn drop_owner_tasks(&self) -> usize {
        let mut dropped = 0;
        loop {
            let tasks: Vec<Task> = self.state.lock().ready.drain(..).collect();
            if tasks.is_empty() {
                return dropped;
            }
            dropped += tasks.len();
            // Outside the lock: dropping a task may post another.
            drop(tasks);
        }
    }

    /// Alternate between both queues until neither has work.
    pub fn run_until_idle(&self) -> usize {
        let mut total = 0;
        loop {
            let ran = self.run_owner_tasks() + self.run_blocking_tasks();
            if ran == 0 {
                return total;
            }
            total += ran;
        }
    }

    /// Move virtual time forward, then run everything that became due.
    pub fn advance(&self, by: Duration) -> usize {
        self.state.lock().elapsed += by;
        self.run_until_idle()
    }

    pub fn elapsed(&self) -> Duration {
        self.state.lock().elapsed
    }

    pub fn pending_owner_tasks(&self) -> usize {
        self.state.lock().ready.len()
    }

    pub fn pending_delayed_tasks(&self) -> usize {
        self.state.lock().delayed.len()
    }

    pub fn pending_blocking_tasks(&self) -> usize {
        self.state.lock().blocking.len()
    }
}

impl OwnerSequence for ManualRunner {
    fn post(&self, task: Task) {
        self.state.lock().ready.push_back(task);
    }

    fn post_delayed(&self, delay: Duration, task: Task) {
        let mut st = self.state.lock();
        st.seq += 1;
        let entry = Delayed {
            due: st.elapsed + delay,
            seq: st.seq,
            task,
        };
        st.delayed.push(entry);
    }

    fn is_current(&self) -> bool {
        thread::current().id() == self.owner
    }

    fn now(&self) -> Instant {
        self.start + self.state.lock().elapsed
    }
}

impl BlockingPool for ManualRunner {
    fn spawn_blocking(&self, task: Task) {
        self.state.lock().blocking.push_back(task);
    }
}
