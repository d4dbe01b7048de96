//! Per-operation request counters backing the RpcStat RPC
//!
//! Each operation keeps a ring of one-second buckets. `current` is the
//! count of the most recent full second, `average` the mean over the
//! whole ring. A coarse modulo sampler drives the access-log trace line.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

/// Operation ids as exposed on the wire (RpcStatRequest.op)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatOp {
    Put = 1,
    Get = 2,
    Delete = 3,
    Scan = 4,
    KeepAlive = 5,
    Lock = 6,
    Unlock = 7,
    Watch = 8,
}

impl StatOp {
    pub const ALL: [StatOp; 8] = [
        StatOp::Put,
        StatOp::Get,
        StatOp::Delete,
        StatOp::Scan,
        StatOp::KeepAlive,
        StatOp::Lock,
        StatOp::Unlock,
        StatOp::Watch,
    ];

    pub fn from_wire(id: i32) -> Option<StatOp> {
        StatOp::ALL.get((id - 1).max(0) as usize).copied().filter(|op| *op as i32 == id)
    }

    pub fn name(&self) -> &'static str {
        match self {
            StatOp::Put => "Put",
            StatOp::Get => "Get",
            StatOp::Delete => "Delete",
            StatOp::Scan => "Scan",
            StatOp::KeepAlive => "KeepAlive",
            StatOp::Lock => "Lock",
            StatOp::Unlock => "Unlock",
            StatOp::Watch => "Watch",
        }
    }
}

struct Ring {
    buckets: Vec<i64>,
    head_sec: i64,
    head_pos: usize,
}

impl Ring {
    fn new(size: usize) -> Ring {
        Ring {
            buckets: vec![0; size.max(1)],
            head_sec: 0,
            head_pos: 0,
        }
    }

    fn advance_to(&mut self, now_sec: i64) {
        if self.head_sec == 0 {
            self.head_sec = now_sec;
            return;
        }
        let steps = (now_sec - self.head_sec).clamp(0, self.buckets.len() as i64);
        for _ in 0..steps {
            self.head_pos = (self.head_pos + 1) % self.buckets.len();
            self.buckets[self.head_pos] = 0;
        }
        self.head_sec = self.head_sec.max(now_sec);
    }

    fn count(&mut self, now_sec: i64) {
        self.advance_to(now_sec);
        self.buckets[self.head_pos] += 1;
    }

    fn report(&mut self, now_sec: i64) -> (i64, i64) {
        self.advance_to(now_sec);
        let previous_pos =
            (self.head_pos + self.buckets.len() - 1) % self.buckets.len();
        let current = self.buckets[previous_pos];
        let average = self.buckets.iter().sum::<i64>() / self.buckets.len() as i64;
        (current, average)
    }
}

pub struct Stats {
    rings: Vec<Mutex<Ring>>,
    calls: Vec<AtomicU64>,
    trace_ratio: u64,
}

impl Stats {
    pub fn new(buffer_size: usize, trace_ratio: u64) -> Stats {
        Stats {
            rings: StatOp::ALL
                .iter()
                .map(|_| Mutex::new(Ring::new(buffer_size)))
                .collect(),
            calls: StatOp::ALL.iter().map(|_| AtomicU64::new(0)).collect(),
            trace_ratio: trace_ratio.max(1),
        }
    }

    /// Record one call; emit the sampled access-log line when due
    pub fn count(&self, op: StatOp) {
        let slot = op as usize - 1;
        let now_sec = crate::common::timestamp_micros() / 1_000_000;
        self.rings[slot].lock().unwrap().count(now_sec);
        let calls = self.calls[slot].fetch_add(1, Ordering::Relaxed) + 1;
        if calls % self.trace_ratio == 0 {
            tracing::debug!(op = op.name(), calls, "[trace] sampled access");
        }
    }

    /// `(current, average)` calls per second for one operation
    pub fn report(&self, op: StatOp) -> (i64, i64) {
        let now_sec = crate::common::timestamp_micros() / 1_000_000;
        self.rings[op as usize - 1].lock().unwrap().report(now_sec)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_wire() {
        assert_eq!(StatOp::from_wire(1), Some(StatOp::Put));
        assert_eq!(StatOp::from_wire(8), Some(StatOp::Watch));
        assert_eq!(StatOp::from_wire(0), None);
        assert_eq!(StatOp::from_wire(9), None);
    }

    #[test]
    fn test_count_lands_in_ring() {
        let stats = Stats::new(4, 1000);
        for _ in 0..5 {
            stats.count(StatOp::Get);
        }
        let (_, average) = stats.report(StatOp::Get);
        // five calls spread over a 4-bucket window
        assert!(average >= 1);
        let (untouched, _) = stats.report(StatOp::Put);
        assert_eq!(untouched, 0);
    }
}
