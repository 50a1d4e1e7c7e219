//! Alarm scheduling.
//!
//! [`AlarmScheduler`] owns one thread that sleeps until the nearest alarm and
//! runs callbacks in `(fire_at, sequence)` order. [`SteppedAlarms`] keeps the
//! same ordering rules on a clock that only moves when told to, which makes
//! period arbitration reproducible in tests and offline replays.

use parking_lot::{Condvar, Mutex};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::io;
use std::sync::Arc;
use std::thread::{self, JoinHandle, ThreadId};
use std::time::{Duration, Instant};
use tracing::{debug, error, warn};

/// Allowed distance between the scheduled and the actual fire time.
pub const ALARM_ERROR_THRESHOLD: Duration = Duration::from_millis(100);

/// Receives the instant the alarm fired at.
pub type AlarmCallback = Box<dyn FnOnce(Instant) + Send + 'static>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct AlarmId(u64);

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct SchedulerStats {
    pub total_scheduled: u64,
    pub total_fired: u64,
    pub total_cancelled: u64,
    pub total_discarded: u64,
    pub scheduled_in_past: u64,
    pub late_alarms: u64,
}

/// Something that can run a callback at an absolute time.
pub trait AlarmService: Send + Sync {
    fn schedule(&self, at: Instant, label: &str, callback: AlarmCallback) -> AlarmId;

    /// Removes a pending alarm. Returns `false` if it already fired.
    fn cancel(&self, id: AlarmId) -> bool;

    fn pending(&self) -> usize;

    fn stats(&self) -> SchedulerStats;
}

impl dyn AlarmService {
    pub fn schedule_fn<F>(&self, at: Instant, label: &str, callback: F) -> AlarmId
    where
        F: FnOnce(Instant) + Send + 'static,
    {
        self.schedule(at, label, Box::new(callback))
    }
}

struct Alarm {
    fire_at: Instant,
    sequence: u64,
    label: String,
    callback: AlarmCallback,
}

impl Alarm {
    fn id(&self) -> AlarmId {
        AlarmId(self.sequence)
    }
}

impl PartialEq for Alarm {
    fn eq(&self, other: &Self) -> bool {
        self.fire_at == other.fire_at && self.sequence == other.sequence
    }
}

impl Eq for Alarm {}

impl PartialOrd for Alarm {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Alarm {
    // Reversed so the BinaryHeap root is the earliest alarm.
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .fire_at
            .cmp(&self.fire_at)
            .then_with(|| other.sequence.cmp(&self.sequence))
    }
}

/// Min-heap of alarms with the insertion counter used as tiebreaker.
#[derive(Default)]
struct AlarmQueue {
    heap: BinaryHeap<Alarm>,
    next_sequence: u64,
    stats: SchedulerStats,
}

impl AlarmQueue {
    fn push(&mut self, fire_at: Instant, label: &str, callback: AlarmCallback) -> AlarmId {
        let sequence = self.next_sequence;
        self.next_sequence += 1;
        self.heap.push(Alarm {
            fire_at,
            sequence,
            label: label.to_owned(),
            callback,
        });
        self.stats.total_scheduled += 1;
        AlarmId(sequence)
    }

    fn next_fire_time(&self) -> Option<Instant> {
        self.heap.peek().map(|alarm| alarm.fire_at)
    }

    fn is_root(&self, id: AlarmId) -> bool {
        self.heap.peek().map(Alarm::id) == Some(id)
    }

    fn pop_due(&mut self, now: Instant) -> Option<Alarm> {
        if self.next_fire_time()? <= now {
            self.heap.pop()
        } else {
            None
        }
    }

    fn cancel(&mut self, id: AlarmId) -> bool {
        let before = self.heap.len();
        self.heap.retain(|alarm| alarm.id() != id);
        let removed = self.heap.len() != before;
        if removed {
            self.stats.total_cancelled += 1;
        }
        removed
    }

    fn discard_all(&mut self) {
        for alarm in self.heap.drain() {
            warn!(
                "An alarm of {} is being discarded because the alarm scheduler has finished",
                alarm.label
            );
            self.stats.total_discarded += 1;
        }
    }
}

struct State {
    queue: AlarmQueue,
    running: bool,
}

struct Shared {
    state: Mutex<State>,
    wake: Condvar,
}

/// Real-time alarm service backed by one dedicated thread.
///
/// Construct once at process start and hand out `Arc` clones; dropping the
/// last clone or calling [`AlarmScheduler::shutdown`] stops the thread.
pub struct AlarmScheduler {
    shared: Arc<Shared>,
    worker: Mutex<Option<JoinHandle<()>>>,
    worker_id: ThreadId,
}

impl AlarmScheduler {
    pub fn start() -> io::Result<Arc<Self>> {
        let shared = Arc::new(Shared {
            state: Mutex::new(State {
                queue: AlarmQueue::default(),
                running: true,
            }),
            wake: Condvar::new(),
        });

        let worker_shared = Arc::clone(&shared);
        let handle = thread::Builder::new()
            .name("alarm-scheduler".into())
            .spawn(move || run_worker(&worker_shared))?;

        Ok(Arc::new(Self {
            shared,
            worker_id: handle.thread().id(),
            worker: Mutex::new(Some(handle)),
        }))
    }

    pub fn is_running(&self) -> bool {
        self.shared.state.lock().running
    }

    /// Stops the thread and discards every pending alarm.
    ///
    /// Safe to call from inside an alarm callback; the worker is then left to
    /// exit on its own instead of being joined.
    pub fn shutdown(&self) {
        {
            let mut state = self.shared.state.lock();
            if state.running {
                debug!("Alarm scheduler is shutting down");
            }
            state.running = false;
            state.queue.discard_all();
        }
        self.shared.wake.notify_all();

        if thread::current().id() == self.worker_id {
            return;
        }
        if let Some(handle) = self.worker.lock().take() {
            if handle.join().is_err() {
                error!("Alarm scheduler thread panicked");
            }
        }
    }
}

impl AlarmService for AlarmScheduler {
    fn schedule(&self, at: Instant, label: &str, callback: AlarmCallback) -> AlarmId {
        let mut state = self.shared.state.lock();
        let now = Instant::now();
        if at < now {
            warn!(
                alarm = label,
                "Alarm scheduled {:.3}s in the past",
                now.duration_since(at).as_secs_f64()
            );
            state.queue.stats.scheduled_in_past += 1;
        }

        let id = state.queue.push(at, label, callback);
        if !state.running {
            warn!(alarm = label, "Alarm scheduler has finished, the alarm will never fire");
            state.queue.discard_all();
            return id;
        }
        if state.queue.is_root(id) {
            // New nearest alarm; shorten the worker's sleep.
            self.shared.wake.notify_one();
        }
        id
    }

    fn cancel(&self, id: AlarmId) -> bool {
        let removed = self.shared.state.lock().queue.cancel(id);
        if removed {
            self.shared.wake.notify_one();
        }
        removed
    }

    fn pending(&self) -> usize {
        self.shared.state.lock().queue.heap.len()
    }

    fn stats(&self) -> SchedulerStats {
        self.shared.state.lock().queue.stats.clone()
    }
}

impl Drop for AlarmScheduler {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn run_worker(shared: &Shared) {
    debug!("Alarm scheduler thread has begun");
    let mut state = shared.state.lock();
    while state.running {
        let now = Instant::now();
        if let Some(alarm) = state.queue.pop_due(now) {
            let lateness = now.saturating_duration_since(alarm.fire_at);
            if lateness > ALARM_ERROR_THRESHOLD {
                state.queue.stats.late_alarms += 1;
            }
            state.queue.stats.total_fired += 1;

            // Callbacks may schedule or cancel alarms.
            drop(state);
            fire(alarm, now);
            state = shared.state.lock();
            continue;
        }

        match state.queue.next_fire_time() {
            Some(deadline) => {
                shared.wake.wait_until(&mut state, deadline);
            }
            None => shared.wake.wait(&mut state),
        }
    }
    debug!("Alarm scheduler thread is exiting");
}

fn fire(alarm: Alarm, now: Instant) {
    let lateness = now.saturating_duration_since(alarm.fire_at);
    if lateness > ALARM_ERROR_THRESHOLD {
        error!(
            alarm = %alarm.label,
            "Alarm was delivered at an erroneous time, {:.3}s late",
            lateness.as_secs_f64()
        );
    } else {
        debug!(alarm = %alarm.label, "Alarm fired");
    }
    (alarm.callback)(now);
}

/// Alarm service driven by an explicit clock.
///
/// Alarms fire only inside [`SteppedAlarms::advance_to`], on the calling
/// thread, and each callback sees its own scheduled fire time as "now".
pub struct SteppedAlarms {
    state: Mutex<SteppedState>,
}

struct SteppedState {
    queue: AlarmQueue,
    now: Instant,
}

impl SteppedAlarms {
    pub fn new(origin: Instant) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(SteppedState {
                queue: AlarmQueue::default(),
                now: origin,
            }),
        })
    }

    pub fn now(&self) -> Instant {
        self.state.lock().now
    }

    /// Fires every alarm due at or before `until`, including alarms that
    /// callbacks schedule along the way. Returns how many fired.
    pub fn advance_to(&self, until: Instant) -> usize {
        let mut fired = 0;
        loop {
            let alarm = {
                let mut state = self.state.lock();
                match state.queue.pop_due(until) {
                    Some(alarm) => {
                        if alarm.fire_at > state.now {
                            state.now = alarm.fire_at;
                        }
                        state.queue.stats.total_fired += 1;
                        alarm
                    }
                    None => {
                        if until > state.now {
                            state.now = until;
                        }
                        return fired;
                    }
                }
            };
            debug!(alarm = %alarm.label, "Stepped alarm fired");
            let fire_at = alarm.fire_at;
            (alarm.callback)(fire_at);
            fired += 1;
        }
    }

    pub fn advance_by(&self, step: Duration) -> usize {
        let until = self.now() + step;
        self.advance_to(until)
    }
}

impl AlarmService for SteppedAlarms {
    fn schedule(&self, at: Instant, label: &str, callback: AlarmCallback) -> AlarmId {
        let mut state = self.state.lock();
        if at < state.now {
            warn!(alarm = label, "Alarm scheduled in the past of the stepped clock");
            state.queue.stats.scheduled_in_past += 1;
        }
        state.queue.push(at, label, callback)
    }

    fn cancel(&self, id: AlarmId) -> bool {
        self.state.lock().queue.cancel(id)
    }

    fn pending(&self) -> usize {
        self.state.lock().queue.heap.len()
    }

    fn stats(&self) -> SchedulerStats {
        self.state.lock().queue.stats.clone()
    }
}
