//! One-shot broadcast flags built on `tokio::sync::watch`.

use tokio::sync::watch;

/// A flag that starts unset and can be fired once. Any number of tasks can
/// wait on it through [`Signal::listener`] and [`fired`].
#[derive(Debug)]
pub struct Signal(watch::Sender<bool>);

impl Signal {
    pub fn new() -> Self {
        Self(watch::channel(false).0)
    }

    pub fn fire(&self) {
        self.0.send_replace(true);
    }

    pub fn is_fired(&self) -> bool {
        *self.0.borrow()
    }

    pub fn listener(&self) -> watch::Receiver<bool> {
        self.0.subscribe()
    }
}

impl Default for Signal {
    fn default() -> Self {
        Self::new()
    }
}

/// Resolves once the signal behind `listener` has fired. Safe to use as a
/// `select!` branch; a listener that already saw the flag resolves at once.
pub async fn fired(listener: &mut watch::Receiver<bool>) {
    loop {
        let set = *listener.borrow_and_update();
        if set || listener.changed().await.is_err() {
            return;
        }
    }
}
