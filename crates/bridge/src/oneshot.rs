//! A simple oneshot channel for single-use replies from the host thread.
//! Uses std::sync::mpsc under the hood.

use std::sync::mpsc;
use std::time::Duration;

pub struct Sender<T>(mpsc::SyncSender<T>);
pub struct Receiver<T>(mpsc::Receiver<T>);

impl<T> Sender<T> {
    /// Never blocks: the buffer holds exactly the one value.
    pub fn send(self, value: T) -> Result<(), T> {
        self.0.send(value).map_err(|e| e.0)
    }
}

impl<T> Receiver<T> {
    pub fn recv_timeout(self, timeout: Duration) -> Result<T, RecvTimeoutError> {
        self.0.recv_timeout(timeout).map_err(|e| match e {
            mpsc::RecvTimeoutError::Timeout => RecvTimeoutError::Timeout,
            mpsc::RecvTimeoutError::Disconnected => RecvTimeoutError::Disconnected,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecvTimeoutError {
    Timeout,
    /// The sender was dropped without sending.
    Disconnected,
}

pub fn channel<T>() -> (Sender<T>, Receiver<T>) {
    // Buffer of 1 for oneshot semantics
    let (tx, rx) = mpsc::sync_channel(1);
    (Sender(tx), Receiver(rx))
}
