use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::SystemTime;

/// Statistics is a point-in-time snapshot of a server's connection counters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Statistics {
    /// When the server last started accepting, if it ever did
    pub start_time: Option<SystemTime>,
    /// Connections currently being served
    pub live_connections: usize,
    /// Connections admitted since the server was created
    pub total_connections: u64,
    /// Connections dropped because the ceiling was reached
    pub rejected_connections: u64,
}

/// ConnectionStats holds the counters shared between the accept loop and
/// connection tasks
#[derive(Debug, Default)]
pub(crate) struct ConnectionStats {
    live: AtomicUsize,
    total: AtomicU64,
    rejected: AtomicU64,
    start_time: Mutex<Option<SystemTime>>,
}

impl ConnectionStats {
    pub(crate) fn mark_started(&self) {
        if let Ok(mut start_time) = self.start_time.lock() {
            *start_time = Some(SystemTime::now());
        }
    }

    /// try_admit takes a live-connection slot if fewer than `ceiling` are in
    /// use. The slot is released when the returned permit is dropped.
    pub(crate) fn try_admit(self: &Arc<Self>, ceiling: usize) -> Option<ConnectionPermit> {
        let admitted = self
            .live
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |live| {
                (live < ceiling).then_some(live + 1)
            })
            .is_ok();

        if !admitted {
            self.rejected.fetch_add(1, Ordering::Relaxed);
            return None;
        }

        self.total.fetch_add(1, Ordering::Relaxed);
        Some(ConnectionPermit {
            stats: Arc::clone(self),
        })
    }

    pub(crate) fn snapshot(&self) -> Statistics {
        let start_time = self.start_time.lock().map(|t| *t).unwrap_or(None);

        Statistics {
            start_time,
            live_connections: self.live.load(Ordering::Acquire),
            total_connections: self.total.load(Ordering::Relaxed),
            rejected_connections: self.rejected.load(Ordering::Relaxed),
        }
    }
}

/// ConnectionPermit is one occupied live-connection slot
#[derive(Debug)]
pub(crate) struct ConnectionPermit {
    stats: Arc<ConnectionStats>,
}

impl Drop for ConnectionPermit {
    fn drop(&mut self) {
        self.stats.live.fetch_sub(1, Ordering::AcqRel);
    }
}
