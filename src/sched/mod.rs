// src/sched/mod.rs
//
// Periodic timer list. Timers live in a binary heap keyed by next fire
// time; a background task sleeps until the earliest deadline, invokes the
// callback, and re-enqueues the timer one period later. Out-of-band
// insertion and removal go through the shared state under a mutex and nudge
// the task via a Notify.
//
// Each timer can carry a sync gate: while the gate is held (a publication
// group is still in flight), due fires are skipped and counted as missed
// rather than stacking up behind a slow device.

use std::cmp::Ordering as CmpOrdering;
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::Notify;
use tokio::time::{sleep_until, Duration, Instant};

use crate::io::now_s;

// ============================================================================
// Sync gate
// ============================================================================

/// Handshake between a timer and the collator: the timer holds the gate
/// while its work group is in flight, and skips fires until the collator
/// releases it on group completion.
#[derive(Debug, Default)]
pub struct SyncGate {
    in_flight: AtomicBool,
    missed: AtomicU64,
}

impl SyncGate {
    /// Try to take the gate. Returns false when the previous cycle is still
    /// in flight.
    pub fn acquire(&self) -> bool {
        !self.in_flight.swap(true, Ordering::AcqRel)
    }

    /// Release the gate (group complete).
    pub fn release(&self) {
        self.in_flight.store(false, Ordering::Release);
    }

    pub fn note_missed(&self) {
        self.missed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn missed(&self) -> u64 {
        self.missed.load(Ordering::Relaxed)
    }
}

// ============================================================================
// Timers
// ============================================================================

/// Fired callback: receives the timer name and the fire time (monotonic
/// seconds). Callbacks must be quick — they run on the scheduler task.
pub type TimerCallback = Box<dyn Fn(&str, f64) + Send + Sync>;

pub struct Timer {
    pub name: String,
    /// First fire delay from registration, seconds.
    pub offset_s: f64,
    /// Re-fire period, seconds. 0 = one-shot.
    pub period_s: f64,
    pub callback: TimerCallback,
    /// Optional overlap gate shared with the collator.
    pub sync: Option<Arc<SyncGate>>,
}

struct TimerEntry {
    fire_at: Instant,
    timer: Timer,
}

impl PartialEq for TimerEntry {
    fn eq(&self, other: &Self) -> bool {
        self.fire_at == other.fire_at
    }
}
impl Eq for TimerEntry {}
impl PartialOrd for TimerEntry {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}
impl Ord for TimerEntry {
    // Reverse ordering: BinaryHeap is a max-heap, we want earliest first.
    fn cmp(&self, other: &Self) -> CmpOrdering {
        other.fire_at.cmp(&self.fire_at)
    }
}

// ============================================================================
// Scheduler
// ============================================================================

struct SchedState {
    heap: BinaryHeap<TimerEntry>,
    /// Names marked for removal; dropped when they next surface.
    removed: Vec<String>,
}

/// The timer list. Cloneable handle; the background task is spawned once.
#[derive(Clone)]
pub struct Scheduler {
    state: Arc<Mutex<SchedState>>,
    notify: Arc<Notify>,
    stop: Arc<AtomicBool>,
}

impl Scheduler {
    pub fn new(stop: Arc<AtomicBool>) -> Self {
        Self {
            state: Arc::new(Mutex::new(SchedState {
                heap: BinaryHeap::new(),
                removed: Vec::new(),
            })),
            notify: Arc::new(Notify::new()),
            stop,
        }
    }

    /// Register a timer. First fire is `offset_s` from now.
    pub fn add(&self, timer: Timer) {
        let fire_at = Instant::now() + Duration::from_secs_f64(timer.offset_s.max(0.0));
        if let Ok(mut state) = self.state.lock() {
            state.heap.push(TimerEntry { fire_at, timer });
        }
        self.notify.notify_one();
    }

    /// Remove a timer by name. Takes effect before its next fire.
    pub fn remove(&self, name: &str) {
        if let Ok(mut state) = self.state.lock() {
            state.removed.push(name.to_string());
        }
        self.notify.notify_one();
    }

    /// Nudge the task (e.g. after a sync gate release).
    pub fn kick(&self) {
        self.notify.notify_one();
    }

    /// Run the timer loop until the stop flag is set. In-flight callbacks
    /// run to completion; no new ones start after stop.
    pub async fn run(self) {
        tlog!("[Sched] Timer task started");
        loop {
            if self.stop.load(Ordering::Relaxed) {
                break;
            }

            // Pop everything due under the lock, fire outside it.
            let mut due: Vec<TimerEntry> = Vec::new();
            let next_deadline = {
                let mut state = match self.state.lock() {
                    Ok(s) => s,
                    Err(_) => break,
                };
                let now = Instant::now();
                loop {
                    let ready = match state.heap.peek() {
                        Some(entry) => entry.fire_at <= now,
                        None => false,
                    };
                    if !ready {
                        break;
                    }
                    let entry = state.heap.pop().expect("peeked entry");
                    if let Some(pos) = state.removed.iter().position(|n| n == &entry.timer.name) {
                        state.removed.swap_remove(pos);
                        continue;
                    }
                    due.push(entry);
                }
                state.heap.peek().map(|e| e.fire_at)
            };

            for entry in due {
                self.fire(entry);
            }

            let deadline =
                next_deadline.unwrap_or_else(|| Instant::now() + Duration::from_millis(100));
            tokio::select! {
                _ = sleep_until(deadline) => {}
                _ = self.notify.notified() => {}
            }
        }
        tlog!("[Sched] Timer task stopped");
    }

    fn fire(&self, entry: TimerEntry) {
        let TimerEntry { fire_at, timer } = entry;
        let t_fire = now_s();
        match &timer.sync {
            Some(gate) => {
                if gate.acquire() {
                    (timer.callback)(&timer.name, t_fire);
                } else {
                    gate.note_missed();
                }
            }
            None => (timer.callback)(&timer.name, t_fire),
        }
        if timer.period_s > 0.0 {
            // Re-enqueue relative to the scheduled time so cadence does not
            // drift; a long stall re-anchors to now instead of bursting.
            let period = Duration::from_secs_f64(timer.period_s);
            let now = Instant::now();
            let mut next = fire_at + period;
            if next <= now {
                next = now + period;
            }
            if let Ok(mut state) = self.state.lock() {
                state.heap.push(TimerEntry {
                    fire_at: next,
                    timer,
                });
            }
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;

    fn counter_timer(name: &str, offset_s: f64, period_s: f64, count: Arc<AtomicU32>) -> Timer {
        Timer {
            name: name.to_string(),
            offset_s,
            period_s,
            callback: Box::new(move |_, _| {
                count.fetch_add(1, Ordering::SeqCst);
            }),
            sync: None,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_periodic_timer_fires() {
        let stop = Arc::new(AtomicBool::new(false));
        let sched = Scheduler::new(stop.clone());
        let count = Arc::new(AtomicU32::new(0));
        sched.add(counter_timer("t1", 0.0, 0.05, count.clone()));

        let task = tokio::spawn(sched.clone().run());
        tokio::time::sleep(Duration::from_millis(260)).await;
        stop.store(true, Ordering::Relaxed);
        sched.kick();
        let _ = task.await;

        // first fire at 0 then every 50 ms
        assert!(count.load(Ordering::SeqCst) >= 5);
    }

    #[tokio::test(start_paused = true)]
    async fn test_one_shot_fires_once() {
        let stop = Arc::new(AtomicBool::new(false));
        let sched = Scheduler::new(stop.clone());
        let count = Arc::new(AtomicU32::new(0));
        sched.add(counter_timer("once", 0.01, 0.0, count.clone()));

        let task = tokio::spawn(sched.clone().run());
        tokio::time::sleep(Duration::from_millis(100)).await;
        stop.store(true, Ordering::Relaxed);
        sched.kick();
        let _ = task.await;

        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_remove_cancels_timer() {
        let stop = Arc::new(AtomicBool::new(false));
        let sched = Scheduler::new(stop.clone());
        let count = Arc::new(AtomicU32::new(0));
        sched.add(counter_timer("victim", 0.05, 0.05, count.clone()));
        sched.remove("victim");

        let task = tokio::spawn(sched.clone().run());
        tokio::time::sleep(Duration::from_millis(200)).await;
        stop.store(true, Ordering::Relaxed);
        sched.kick();
        let _ = task.await;

        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sync_gate_skips_overlapping_fires() {
        let stop = Arc::new(AtomicBool::new(false));
        let sched = Scheduler::new(stop.clone());
        let count = Arc::new(AtomicU32::new(0));
        let gate = Arc::new(SyncGate::default());

        let c = count.clone();
        sched.add(Timer {
            name: "gated".to_string(),
            offset_s: 0.0,
            period_s: 0.05,
            callback: Box::new(move |_, _| {
                c.fetch_add(1, Ordering::SeqCst);
            }),
            sync: Some(gate.clone()),
        });

        let task = tokio::spawn(sched.clone().run());
        // Gate is never released, so only the first fire runs.
        tokio::time::sleep(Duration::from_millis(300)).await;
        stop.store(true, Ordering::Relaxed);
        sched.kick();
        let _ = task.await;

        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert!(gate.missed() >= 3);

        // Release resumes firing from the next cycle.
        gate.release();
        assert!(gate.acquire());
    }
}
