//! audit.rs: bounded in-memory log of per-attempt fetch results from recent passes.
//! Incidents pull their context from here.

use parking_lot::Mutex;
use std::collections::VecDeque;

use super::types::FetchResult;

#[derive(Debug)]
pub struct AuditLog {
    inner: Mutex<VecDeque<FetchResult>>,
    cap: usize,
}

impl AuditLog {
    pub fn with_capacity(cap: usize) -> Self {
        let cap = cap.clamp(1, 100_000);
        Self {
            inner: Mutex::new(VecDeque::with_capacity(cap.min(10_000))),
            cap,
        }
    }

    pub fn push(&self, r: FetchResult) {
        let mut v = self.inner.lock();
        v.push_back(r);
        while v.len() > self.cap {
            v.pop_front();
        }
    }

    pub fn extend<I: IntoIterator<Item = FetchResult>>(&self, rs: I) {
        for r in rs {
            self.push(r);
        }
    }

    pub fn snapshot_last_n(&self, n: usize) -> Vec<FetchResult> {
        let v = self.inner.lock();
        let start = v.len().saturating_sub(n);
        v.iter().skip(start).cloned().collect()
    }

    /// Latest `n` results matching `pred`, oldest first.
    pub fn recent_matching<F>(&self, n: usize, pred: F) -> Vec<FetchResult>
    where
        F: Fn(&FetchResult) -> bool,
    {
        let v = self.inner.lock();
        let mut out: Vec<FetchResult> = v.iter().rev().filter(|r| pred(r)).take(n).cloned().collect();
        out.reverse();
        out
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ingest::types::FetchOutcome;
    use chrono::Utc;

    fn res(id: &str, attempt: u32) -> FetchResult {
        FetchResult {
            source_id: id.into(),
            pass_id: 1,
            attempt,
            outcome: FetchOutcome::Failure,
            value: None,
            fetched_at: Utc::now(),
            latency_ms: 3,
            provider_used: Some("p".into()),
            error: None,
        }
    }

    #[test]
    fn drops_oldest_past_capacity() {
        let log = AuditLog::with_capacity(3);
        for i in 1..=5 {
            log.push(res("A", i));
        }
        let snap = log.snapshot_last_n(10);
        assert_eq!(snap.iter().map(|r| r.attempt).collect::<Vec<_>>(), vec![3, 4, 5]);
    }

    #[test]
    fn recent_matching_keeps_order() {
        let log = AuditLog::with_capacity(10);
        log.push(res("A", 1));
        log.push(res("B", 1));
        log.push(res("A", 2));
        log.push(res("A", 3));
        let a = log.recent_matching(2, |r| r.source_id == "A");
        assert_eq!(a.iter().map(|r| r.attempt).collect::<Vec<_>>(), vec![2, 3]);
    }
}
