//! Completion queue shared by every stage worker of a run.
//!
//! Workers push from plain threads; the orchestrator awaits with a bounded
//! wait so a wedged engine cannot hang a run forever.

use std::time::Duration;

use tokio::sync::mpsc;

use crate::error::{PipelineError, Result};

/// Producer half handed to stage workers.
#[derive(Debug)]
pub struct ResponseSender<T> {
    tx: mpsc::UnboundedSender<T>,
}

impl<T> Clone for ResponseSender<T> {
    fn clone(&self) -> Self {
        Self { tx: self.tx.clone() }
    }
}

impl<T> ResponseSender<T> {
    /// Never blocks. Returns `false` once the queue has been dropped.
    pub fn push(&self, item: T) -> bool {
        self.tx.send(item).is_ok()
    }
}

/// Multi-producer, single-consumer queue with a timed pop.
#[derive(Debug)]
pub struct ResponseQueue<T> {
    tx: mpsc::UnboundedSender<T>,
    rx: mpsc::UnboundedReceiver<T>,
}

impl<T> ResponseQueue<T> {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self { tx, rx }
    }

    pub fn sender(&self) -> ResponseSender<T> {
        ResponseSender { tx: self.tx.clone() }
    }

    /// Wait up to `wait` for the next item.
    pub async fn wait_and_pop(&mut self, wait: Duration) -> Result<T> {
        match tokio::time::timeout(wait, self.rx.recv()).await {
            Ok(Some(item)) => Ok(item),
            Ok(None) => Err(PipelineError::Runtime("response queue closed".into())),
            Err(_) => Err(PipelineError::Timeout { waited_ms: wait.as_millis() as u64 }),
        }
    }

    /// Pop without waiting.
    pub fn try_pop(&mut self) -> Option<T> {
        self.rx.try_recv().ok()
    }
}

impl<T> Default for ResponseQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn items_arrive_in_push_order() {
        let mut q = ResponseQueue::new();
        let tx = q.sender();
        assert!(tx.push(1));
        assert!(tx.clone().push(2));
        assert_eq!(q.wait_and_pop(Duration::from_millis(10)).await.unwrap(), 1);
        assert_eq!(q.try_pop(), Some(2));
        assert_eq!(q.try_pop(), None);
    }

    #[tokio::test]
    async fn empty_queue_times_out() {
        let mut q: ResponseQueue<u32> = ResponseQueue::new();
        let err = q.wait_and_pop(Duration::from_millis(20)).await.unwrap_err();
        assert!(matches!(err, PipelineError::Timeout { waited_ms: 20 }));
    }

    #[tokio::test]
    async fn pushes_from_plain_threads() {
        let mut q = ResponseQueue::new();
        let handles: Vec<_> = (0..4)
            .map(|i| {
                let tx = q.sender();
                std::thread::spawn(move || tx.push(i))
            })
            .collect();
        for h in handles {
            assert!(h.join().unwrap());
        }
        let mut got = Vec::new();
        for _ in 0..4 {
            got.push(q.wait_and_pop(Duration::from_secs(1)).await.unwrap());
        }
        got.sort();
        assert_eq!(got, vec![0, 1, 2, 3]);
    }

    #[test]
    fn push_after_drop_reports_closed() {
        let q: ResponseQueue<u8> = ResponseQueue::new();
        let tx = q.sender();
        drop(q);
        assert!(!tx.push(1));
    }
}
