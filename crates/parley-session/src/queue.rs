//! Deadline-bounded FIFO queue.
//!
//! A single-producer/single-consumer queue where every read carries its own
//! deadline. The producer half enqueues and eventually flushes; the consumer
//! half reads items in strict FIFO order, failing an individual read with
//! [`Expired`] when nothing arrives within the maximum wait time. After a
//! flush, reads past the drained tail terminate cleanly.

use std::time::Duration;

use futures::stream::{self, Stream};
use thiserror::Error;
use tokio::sync::mpsc;

/// A queue read exceeded its deadline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("queue read exceeded the deadline")]
pub struct Expired;

/// Producer half of a deadline queue.
pub struct QueueSender<T> {
    tx: mpsc::UnboundedSender<T>,
}

impl<T> QueueSender<T> {
    /// Append an item and wake the reader.
    ///
    /// Returns `false` if the reader is gone.
    pub fn enqueue(&self, item: T) -> bool {
        self.tx.send(item).is_ok()
    }

    /// Close the queue.
    ///
    /// Items already enqueued remain readable; once drained, the reader
    /// terminates instead of waiting out its deadline.
    pub fn flush(self) {}
}

/// Consumer half of a deadline queue.
pub struct DeadlineQueue<T> {
    rx: mpsc::UnboundedReceiver<T>,
    max_wait: Duration,
}

impl<T> DeadlineQueue<T> {
    /// Read the next item.
    ///
    /// Blocks up to the queue's maximum wait time. Returns `Ok(None)` once
    /// the queue has been flushed and drained, and `Err(Expired)` when the
    /// deadline passes first.
    pub async fn next(&mut self) -> Result<Option<T>, Expired> {
        tokio::time::timeout(self.max_wait, self.rx.recv())
            .await
            .map_err(|_| Expired)
    }

    /// The per-read deadline.
    pub fn max_wait(&self) -> Duration {
        self.max_wait
    }

    /// Lazy iteration over the queue.
    ///
    /// The stream ends after the flush is drained; a deadline expiry yields
    /// one `Err(Expired)` and then ends.
    pub fn into_stream(self) -> impl Stream<Item = Result<T, Expired>>
    where
        T: Send + 'static,
    {
        stream::unfold(Some(self), |state| async move {
            let mut queue = state?;
            match queue.next().await {
                Ok(Some(item)) => Some((Ok(item), Some(queue))),
                Ok(None) => None,
                Err(expired) => Some((Err(expired), None)),
            }
        })
    }
}

/// Create a connected queue pair with the given per-read deadline.
pub fn deadline_queue<T>(max_wait: Duration) -> (QueueSender<T>, DeadlineQueue<T>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (QueueSender { tx }, DeadlineQueue { rx, max_wait })
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;

    #[tokio::test]
    async fn items_arrive_in_fifo_order() {
        let (tx, mut rx) = deadline_queue(Duration::from_millis(100));
        for i in 0..5 {
            assert!(tx.enqueue(i));
        }
        for i in 0..5 {
            assert_eq!(rx.next().await, Ok(Some(i)));
        }
    }

    #[tokio::test]
    async fn read_past_deadline_expires() {
        let (_tx, mut rx) = deadline_queue::<u32>(Duration::from_millis(20));
        assert_eq!(rx.next().await, Err(Expired));
    }

    #[tokio::test]
    async fn flush_terminates_after_drain() {
        let (tx, mut rx) = deadline_queue(Duration::from_millis(100));
        tx.enqueue(1);
        tx.enqueue(2);
        tx.flush();
        assert_eq!(rx.next().await, Ok(Some(1)));
        assert_eq!(rx.next().await, Ok(Some(2)));
        assert_eq!(rx.next().await, Ok(None));
    }

    #[tokio::test]
    async fn enqueue_wakes_a_blocked_reader() {
        let (tx, mut rx) = deadline_queue(Duration::from_secs(5));
        let reader = tokio::spawn(async move { rx.next().await });
        tokio::time::sleep(Duration::from_millis(10)).await;
        tx.enqueue(42);
        assert_eq!(reader.await.unwrap(), Ok(Some(42)));
    }

    #[tokio::test]
    async fn stream_ends_on_flush() {
        let (tx, rx) = deadline_queue(Duration::from_millis(100));
        tx.enqueue("a");
        tx.enqueue("b");
        tx.flush();
        let items: Vec<_> = rx.into_stream().collect().await;
        assert_eq!(items, vec![Ok("a"), Ok("b")]);
    }

    #[tokio::test]
    async fn stream_surfaces_expiry_once() {
        let (_tx, rx) = deadline_queue::<u32>(Duration::from_millis(20));
        let items: Vec<_> = rx.into_stream().collect().await;
        assert_eq!(items, vec![Err(Expired)]);
    }
}
