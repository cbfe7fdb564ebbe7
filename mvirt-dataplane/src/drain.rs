//! Bounded, non-blocking batch draining of input queues.
//!
//! When the driver wakes up for one message it opportunistically takes up to
//! `limit` more from the same queue. Higher limits batch more work under
//! load, at the cost of latency for the other queues.

use tokio::sync::mpsc;

/// A queue that can be polled without blocking.
pub trait BatchSource {
    type Item;

    /// Next queued item, or `None` when the queue is empty (or closed).
    fn try_next(&mut self) -> Option<Self::Item>;
}

impl<T> BatchSource for mpsc::Receiver<T> {
    type Item = T;

    fn try_next(&mut self) -> Option<T> {
        self.try_recv().ok()
    }
}

impl<T> BatchSource for mpsc::UnboundedReceiver<T> {
    type Item = T;

    fn try_next(&mut self) -> Option<T> {
        self.try_recv().ok()
    }
}

/// Build a batch starting with `first`, followed by at most `limit` items
/// already waiting in `source`.
pub fn drain_batch<S: BatchSource>(first: S::Item, source: &mut S, limit: usize) -> Vec<S::Item> {
    let mut batch = Vec::with_capacity(limit.min(64) + 1);
    batch.push(first);
    batch.extend(drain(source, limit));
    batch
}

/// Take at most `limit` items already waiting in `source`.
pub fn drain<S: BatchSource>(source: &mut S, limit: usize) -> Vec<S::Item> {
    let mut items = Vec::new();
    for _ in 0..limit {
        match source.try_next() {
            Some(item) => items.push(item),
            // Queue empty, we're caught up.
            None => break,
        }
    }
    items
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_drain_batch_respects_limit() {
        let (tx, mut rx) = mpsc::channel::<u32>(16);
        for i in 1..=10 {
            tx.send(i).await.unwrap();
        }

        let first = rx.recv().await.unwrap();
        let batch = drain_batch(first, &mut rx, 4);
        assert_eq!(batch, vec![1, 2, 3, 4, 5]);

        // The rest stays queued for the next wake-up.
        let rest = drain(&mut rx, 100);
        assert_eq!(rest, vec![6, 7, 8, 9, 10]);
    }

    #[tokio::test]
    async fn test_drain_stops_when_empty() {
        let (tx, mut rx) = mpsc::unbounded_channel::<&str>();
        tx.send("a").unwrap();
        tx.send("b").unwrap();

        assert_eq!(drain(&mut rx, 100), vec!["a", "b"]);
        assert!(drain(&mut rx, 100).is_empty());
    }

    #[tokio::test]
    async fn test_drain_closed_queue() {
        let (tx, mut rx) = mpsc::channel::<u8>(4);
        tx.send(7).await.unwrap();
        drop(tx);

        let first = rx.recv().await.unwrap();
        assert_eq!(drain_batch(first, &mut rx, 10), vec![7]);
    }

    #[test]
    fn test_zero_limit_keeps_only_first() {
        let (_tx, mut rx) = mpsc::unbounded_channel::<u8>();
        assert_eq!(drain_batch(1, &mut rx, 0), vec![1]);
    }
}
