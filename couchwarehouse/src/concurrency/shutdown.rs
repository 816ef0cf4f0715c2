use tokio::sync::watch;

/// Receiving side of a shutdown signal.
pub type ShutdownRx = watch::Receiver<()>;

/// Sending side of a shutdown signal, shared by everything that may stop a pipeline or feed.
#[derive(Debug, Clone)]
pub struct ShutdownTx(watch::Sender<()>);

impl ShutdownTx {
    /// Notifies every subscribed receiver.
    ///
    /// Fails only if all receivers were dropped, which means there is nothing left to stop.
    pub fn shutdown(&self) -> Result<(), watch::error::SendError<()>> {
        self.0.send(())
    }

    /// Returns a new receiver that observes shutdowns sent from now on.
    pub fn subscribe(&self) -> ShutdownRx {
        self.0.subscribe()
    }
}

/// Creates a connected pair of [`ShutdownTx`] and [`ShutdownRx`].
pub fn create_shutdown_channel() -> (ShutdownTx, ShutdownRx) {
    let (tx, rx) = watch::channel(());
    (ShutdownTx(tx), rx)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn subscribers_observe_shutdown() {
        let (tx, mut rx) = create_shutdown_channel();
        let mut late = tx.subscribe();

        tx.shutdown().unwrap();

        assert!(rx.changed().await.is_ok());
        assert!(late.changed().await.is_ok());
    }
}
