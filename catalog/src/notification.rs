use tokio::sync::watch;

/// Wakes subscribers whenever a catalog persisted a status change.
///
/// Carries no payload: subscribers re-read the rows they care about.
pub struct NotificationChannel {
    state_tx: watch::Sender<()>,
}

impl NotificationChannel {
    pub fn new() -> Self {
        let (state_tx, _) = watch::channel(());
        Self { state_tx }
    }

    pub fn notify_state(&self) {
        // Does not fail when nobody is subscribed
        self.state_tx.send_replace(());
    }

    pub fn subscribe_state(&self) -> watch::Receiver<()> {
        self.state_tx.subscribe()
    }
}

impl Default for NotificationChannel {
    fn default() -> Self {
        Self::new()
    }
}

pub trait NotifiableCatalog {
    fn subscribe_state(&self) -> watch::Receiver<()>;
}
