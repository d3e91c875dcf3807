//! A bounded FIFO queue for handing values (mostly packets) from one task to another. All
//!  blocking operations exist in a variant with a timeout, and failing puts hand the value back
//!  to the caller so it can be released rather than lost.

use std::fmt::{Debug, Formatter};
use std::time::Duration;
use anyhow::bail;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::SendTimeoutError;
use tokio::time;

pub fn blocking_queue<T>(capacity: usize) -> (QueueSender<T>, QueueReceiver<T>) {
    let (tx, rx) = mpsc::channel(capacity);
    (QueueSender { tx }, QueueReceiver { rx })
}

pub struct QueueSender<T> {
    tx: mpsc::Sender<T>,
}

impl<T> Clone for QueueSender<T> {
    fn clone(&self) -> Self {
        QueueSender { tx: self.tx.clone() }
    }
}

impl<T> Debug for QueueSender<T> {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueueSender")
            .field("capacity", &self.tx.capacity())
            .finish()
    }
}

impl<T> QueueSender<T> {
    /// Waits for free capacity without a time limit. This is only for callers that know that the
    ///  queue is being drained.
    pub async fn put(&self, value: T) -> Result<(), T> {
        self.tx.send(value).await
            .map_err(|e| e.0)
    }

    pub async fn put_with_timeout(&self, value: T, timeout: Duration) -> Result<(), T> {
        self.tx.send_timeout(value, timeout).await
            .map_err(|e| match e {
                SendTimeoutError::Timeout(value) => value,
                SendTimeoutError::Closed(value) => value,
            })
    }

    pub fn try_put(&self, value: T) -> Result<(), T> {
        self.tx.try_send(value)
            .map_err(|e| e.into_inner())
    }
}

pub struct QueueReceiver<T> {
    rx: mpsc::Receiver<T>,
}

impl<T> QueueReceiver<T> {
    /// returns `None` only if all senders are gone
    pub async fn get(&mut self) -> Option<T> {
        self.rx.recv().await
    }

    pub async fn get_with_timeout(&mut self, timeout: Duration) -> anyhow::Result<T> {
        match time::timeout(timeout, self.rx.recv()).await {
            Ok(Some(value)) => Ok(value),
            Ok(None) => bail!("queue was closed"),
            Err(_) => bail!("timed out after {:?} waiting for the queue", timeout),
        }
    }

    pub fn try_get(&mut self) -> Option<T> {
        self.rx.try_recv().ok()
    }

    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_fifo() {
        let (tx, mut rx) = blocking_queue(10);
        for i in 0..5 {
            tx.put(i).await.unwrap();
        }
        for i in 0..5 {
            assert_eq!(rx.get().await, Some(i));
        }
        assert!(rx.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_get_timeout() {
        let (_tx, mut rx) = blocking_queue::<u32>(1);
        let start = time::Instant::now();
        assert!(rx.get_with_timeout(Duration::from_millis(2000)).await.is_err());
        assert!(start.elapsed() >= Duration::from_millis(2000));
    }

    #[tokio::test(start_paused = true)]
    async fn test_put_timeout_hands_value_back() {
        let (tx, mut rx) = blocking_queue(1);
        tx.put_with_timeout(1, Duration::from_millis(10)).await.unwrap();
        assert_eq!(tx.put_with_timeout(2, Duration::from_millis(10)).await, Err(2));
        assert_eq!(rx.try_get(), Some(1));
        assert_eq!(rx.try_get(), None);
    }

    #[test]
    fn test_try_put_full() {
        let (tx, mut rx) = blocking_queue(1);
        assert_eq!(tx.try_put('a'), Ok(()));
        assert_eq!(tx.try_put('b'), Err('b'));
        assert!(!rx.is_empty());
        assert_eq!(rx.try_get(), Some('a'));
    }

    #[tokio::test]
    async fn test_closed() {
        let (tx, mut rx) = blocking_queue::<u8>(1);
        drop(tx);
        assert_eq!(rx.get().await, None);
        assert!(rx.get_with_timeout(Duration::from_millis(10)).await.is_err());
    }

    #[tokio::test]
    async fn test_get_wakes_up_on_put() {
        let (tx, mut rx) = blocking_queue(1);
        let handle = tokio::spawn(async move {
            rx.get_with_timeout(Duration::from_secs(5)).await
        });
        tx.put(42).await.unwrap();
        assert_eq!(handle.await.unwrap().unwrap(), 42);
    }
}
