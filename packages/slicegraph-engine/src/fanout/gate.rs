//! Priority-ordered admission for fanout runs
//!
//! At most `capacity` runs hold a permit at once. When the gate is full,
//! waiters are admitted most urgent priority first, FIFO within a priority.
//! A released permit is handed straight to the next waiter, so a late
//! arrival never overtakes a parked one.

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::oneshot;

use super::config::FanoutPriority;

struct Waiter {
    priority: FanoutPriority,
    seq: u64,
    wake: oneshot::Sender<()>,
}

impl PartialEq for Waiter {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.seq == other.seq
    }
}

impl Eq for Waiter {}

impl PartialOrd for Waiter {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

// Max-heap: Critical sorts lowest in FanoutPriority, so both keys are reversed.
impl Ord for Waiter {
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .priority
            .cmp(&self.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

struct GateState {
    available: usize,
    waiters: BinaryHeap<Waiter>,
    next_seq: u64,
}

impl GateState {
    /// Hand a freed slot to the most urgent waiter still listening.
    fn release(&mut self) {
        while let Some(waiter) = self.waiters.pop() {
            if waiter.wake.send(()).is_ok() {
                return;
            }
        }
        self.available += 1;
    }
}

#[derive(Clone)]
pub struct PriorityGate {
    state: Arc<Mutex<GateState>>,
}

impl PriorityGate {
    pub fn new(capacity: usize) -> Self {
        Self {
            state: Arc::new(Mutex::new(GateState {
                available: capacity.max(1),
                waiters: BinaryHeap::new(),
                next_seq: 0,
            })),
        }
    }

    pub async fn acquire(&self, priority: FanoutPriority) -> GatePermit {
        let rx = {
            let mut state = self.state.lock();
            if state.available > 0 && state.waiters.is_empty() {
                state.available -= 1;
                return GatePermit {
                    state: self.state.clone(),
                };
            }
            let (wake, rx) = oneshot::channel();
            let seq = state.next_seq;
            state.next_seq += 1;
            state.waiters.push(Waiter {
                priority,
                seq,
                wake,
            });
            rx
        };

        let mut parked = Parked {
            rx: Some(rx),
            state: self.state.clone(),
        };
        if let Some(rx) = parked.rx.as_mut() {
            // Senders are only dropped after a send attempt, so Err is unreachable
            // while this gate is alive.
            let _ = rx.await;
        }
        parked.rx = None;
        GatePermit {
            state: self.state.clone(),
        }
    }

    pub fn available(&self) -> usize {
        self.state.lock().available
    }

    pub fn waiting(&self) -> usize {
        self.state.lock().waiters.len()
    }
}

/// A waiter dropped between being woken and resuming still owns the slot.
struct Parked {
    rx: Option<oneshot::Receiver<()>>,
    state: Arc<Mutex<GateState>>,
}

impl Drop for Parked {
    fn drop(&mut self) {
        if let Some(mut rx) = self.rx.take() {
            rx.close();
            if rx.try_recv().is_ok() {
                self.state.lock().release();
            }
        }
    }
}

pub struct GatePermit {
    state: Arc<Mutex<GateState>>,
}

impl Drop for GatePermit {
    fn drop(&mut self) {
        self.state.lock().release();
    }
}
