//! One-shot shutdown signal.
//!
//! datagen runs two long-lived activities, the emission loop and the metrics
//! server, and both must stop when the run ends. The run ends either because
//! the operator interrupted it or because the configured duration elapsed.
//!
//! The mechanism has two halves, a [`Broadcaster`] and any number of
//! [`Watcher`] instances. Once the `Broadcaster` signals, every `Watcher` --
//! including those cloned afterward -- observes the signal. Dropping the
//! `Broadcaster` counts as signaling.

use tokio::sync::watch;

/// Construct a `Watcher` and `Broadcaster` pair.
#[must_use]
pub fn signal() -> (Watcher, Broadcaster) {
    let (sender, receiver) = watch::channel(false);
    (Watcher { receiver }, Broadcaster { sender })
}

#[derive(Debug)]
/// Mechanism to notify one or more `Watcher` instances that the run is over.
pub struct Broadcaster {
    sender: watch::Sender<bool>,
}

impl Broadcaster {
    /// Send the signal through to every `Watcher`.
    ///
    /// Calling this more than once is harmless. Does not wait for watchers to
    /// observe the signal.
    pub fn signal(&self) {
        self.sender.send_replace(true);
    }
}

#[derive(Debug, Clone)]
/// Mechanism to watch for the end of the run.
pub struct Watcher {
    receiver: watch::Receiver<bool>,
}

impl Watcher {
    /// Wait for the signal. Returns immediately if the signal has already
    /// been sent or the `Broadcaster` is gone.
    pub async fn recv(mut self) {
        // An error here means the broadcaster dropped, same as a signal.
        let _ = self.receiver.wait_for(|signaled| *signaled).await;
    }
}
