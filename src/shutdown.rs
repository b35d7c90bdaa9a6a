use tokio::sync::{broadcast, mpsc};

/// One trigger, many watchers. Triggering broadcasts once and then waits
/// until every watcher (and its alive marker) has been dropped, so tasks
/// get a chance to finish their teardown before the process exits.
pub fn channel() -> (Trigger, Watcher) {
    let (broadcast_tx, _) = broadcast::channel(1);

    let (alive_tx, alive_rx) = mpsc::channel(1);

    let trigger = Trigger {
        sender: broadcast_tx.clone(),
        drained: alive_rx,
    };
    let watcher = Watcher {
        receiver: broadcast_tx.subscribe(),
        sender: broadcast_tx,
        alive_marker: alive_tx,
    };

    (trigger, watcher)
}

pub struct Trigger {
    sender: broadcast::Sender<()>,
    drained: mpsc::Receiver<()>,
}

impl Trigger {
    /// Fire the shutdown signal and wait for all watchers to go away.
    pub async fn fire(mut self) {
        let _ = self.sender.send(());
        let _ = self.drained.recv().await;
    }
}

#[derive(Debug)]
pub struct Watcher {
    sender: broadcast::Sender<()>,
    receiver: broadcast::Receiver<()>,
    alive_marker: mpsc::Sender<()>,
}

impl Watcher {
    pub async fn recv(&mut self) {
        let _ = self.receiver.recv().await;
    }
}

impl Clone for Watcher {
    fn clone(&self) -> Self {
        Self {
            receiver: self.sender.subscribe(),
            sender: self.sender.clone(),
            alive_marker: self.alive_marker.clone(),
        }
    }
}
