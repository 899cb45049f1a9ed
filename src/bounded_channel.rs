// SPDX-License-Identifier: Apache-2.0

use flume::{Receiver, Sender};
use std::fmt;
use std::time::Duration;

pub struct BoundedSender<T> {
    tx: Sender<T>,
}

#[derive(Debug, PartialEq, Eq)]
pub enum SendError {
    Disconnected,
}

impl fmt::Display for SendError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SendError::Disconnected => write!(f, "channel disconnected"),
        }
    }
}

/// A timed or non-blocking send that did not go through. The item is
/// handed back to the caller.
#[derive(Debug, PartialEq, Eq)]
pub enum TrySendError<T> {
    Full(T),
    Disconnected(T),
}

impl<T> TrySendError<T> {
    pub fn into_inner(self) -> T {
        match self {
            TrySendError::Full(item) | TrySendError::Disconnected(item) => item,
        }
    }
}

impl<T> BoundedSender<T> {
    /// Blocking send - blocks until there is capacity in the channel.
    /// Use this from non-async contexts (e.g., dedicated OS threads).
    pub fn send_blocking(&self, item: T) -> Result<(), SendError> {
        match self.tx.send(item) {
            Ok(()) => Ok(()),
            Err(_e) => Err(SendError::Disconnected), // receiver closed
        }
    }

    /// Blocking send with timeout. The item comes back if the channel stayed
    /// full for the whole timeout.
    pub fn send_timeout(&self, item: T, timeout: Duration) -> Result<(), TrySendError<T>> {
        self.tx.send_timeout(item, timeout).map_err(|e| match e {
            flume::SendTimeoutError::Timeout(item) => TrySendError::Full(item),
            flume::SendTimeoutError::Disconnected(item) => TrySendError::Disconnected(item),
        })
    }

    /// Non-blocking send - returns immediately.
    pub fn try_send(&self, item: T) -> Result<(), TrySendError<T>> {
        self.tx.try_send(item).map_err(|e| match e {
            flume::TrySendError::Full(item) => TrySendError::Full(item),
            flume::TrySendError::Disconnected(item) => TrySendError::Disconnected(item),
        })
    }

    pub fn len(&self) -> usize {
        self.tx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tx.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.tx.is_full()
    }

    pub fn capacity(&self) -> Option<usize> {
        self.tx.capacity()
    }
}

impl<T> Clone for BoundedSender<T> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
        }
    }
}

#[derive(Clone)]
pub struct BoundedReceiver<T> {
    rx: Receiver<T>,
}

impl<T> BoundedReceiver<T> {
    pub async fn next(&mut self) -> Option<T> {
        match self.rx.recv_async().await {
            Ok(item) => Some(item),
            Err(_e) => None, // disconnected
        }
    }

    /// Non-blocking receive - returns immediately.
    /// Returns None if no item is available or channel is disconnected.
    pub fn try_recv(&self) -> Option<T> {
        self.rx.try_recv().ok()
    }

    /// Blocking receive with timeout - blocks until an item is available or timeout.
    /// Returns None if timeout expires or channel is disconnected.
    pub fn recv_timeout(&self, timeout: Duration) -> Option<T> {
        self.rx.recv_timeout(timeout).ok()
    }

    /// Take everything currently queued without blocking.
    pub fn drain(&self) -> Vec<T> {
        self.rx.drain().collect()
    }

    pub fn len(&self) -> usize {
        self.rx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }
}

pub fn bounded<T>(size: usize) -> (BoundedSender<T>, BoundedReceiver<T>) {
    let (tx, rx) = flume::bounded::<T>(size);

    let sender = BoundedSender { tx };
    let receiver = BoundedReceiver { rx };

    (sender, receiver)
}

/// A channel without a capacity bound, for queues whose size is already
/// limited by their producers.
pub fn unbounded<T>() -> (BoundedSender<T>, BoundedReceiver<T>) {
    let (tx, rx) = flume::unbounded::<T>();
    (BoundedSender { tx }, BoundedReceiver { rx })
}

#[cfg(test)]
mod tests {
    use super::{SendError, TrySendError, bounded, unbounded};
    use std::time::{Duration, Instant};
    use tokio_test::{assert_err, assert_ok, assert_pending, assert_ready, task::spawn};

    #[tokio::test]
    async fn basics() {
        let (tx, mut rx) = bounded(3);

        let msg = 10;

        let mut recv1 = spawn(async { rx.next().await });
        assert!(!recv1.is_woken());

        // receiver should be in pending state
        assert_pending!(recv1.poll());

        assert_ok!(tx.try_send(msg));

        assert!(recv1.is_woken());

        assert_eq!(Some(msg), assert_ready!(recv1.poll()));

        drop(recv1);

        let mut recv2 = spawn(async { rx.next().await });

        drop(tx);
        // receives None since send channel was closed
        assert_eq!(None, assert_ready!(recv2.poll()));
    }

    #[test]
    fn send_timeout_returns_item_when_full() {
        let (tx, rx) = bounded(1);
        assert_ok!(tx.send_timeout(1, Duration::from_millis(10)));
        assert!(tx.is_full());

        let start = Instant::now();
        let err = assert_err!(tx.send_timeout(2, Duration::from_millis(50)));
        assert!(start.elapsed() >= Duration::from_millis(50));
        assert_eq!(err, TrySendError::Full(2));

        assert_eq!(rx.try_recv(), Some(1));
        assert_ok!(tx.try_send(3));
        assert_eq!(assert_err!(tx.try_send(4)).into_inner(), 4);
    }

    #[test]
    fn blocked_sender_wakes_when_space_frees() {
        let (tx, rx) = bounded(1);
        tx.send_blocking(1).unwrap();

        let handle = std::thread::spawn(move || tx.send_timeout(2, Duration::from_secs(5)));
        std::thread::sleep(Duration::from_millis(20));
        assert_eq!(rx.recv_timeout(Duration::from_secs(1)), Some(1));
        assert_ok!(handle.join().unwrap());
        assert_eq!(rx.recv_timeout(Duration::from_secs(1)), Some(2));
    }

    #[test]
    fn sender_fails_on_rx_close() {
        let (tx, rx) = bounded(1);
        drop(rx);
        assert_eq!(Err(SendError::Disconnected), tx.send_blocking(10));
        assert_eq!(
            Err(TrySendError::Disconnected(11)),
            tx.send_timeout(11, Duration::from_millis(1))
        );
    }

    #[test]
    fn drain_empties_queue() {
        let (tx, rx) = unbounded();
        for i in 0..5 {
            tx.try_send(i).unwrap();
        }
        assert_eq!(rx.drain(), vec![0, 1, 2, 3, 4]);
        assert!(rx.is_empty());
        assert_eq!(rx.recv_timeout(Duration::from_millis(1)), None);
    }
}
