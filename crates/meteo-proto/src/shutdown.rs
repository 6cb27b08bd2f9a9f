use tokio::sync::watch;

/// Process-wide shutdown flag. `true` once shutdown was requested.
pub type Shutdown = watch::Receiver<bool>;

/// Resolves once the flag is `true` or the sending side is gone.
///
/// Notifications that leave the flag `false` are ignored.
pub async fn shutdown_requested(shutdown: &mut Shutdown) {
    while !*shutdown.borrow_and_update() {
        if shutdown.changed().await.is_err() {
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::time::timeout;

    #[tokio::test]
    async fn false_notifications_are_ignored() {
        let (tx, mut rx) = watch::channel(false);
        tx.send(false).unwrap();
        assert!(timeout(Duration::from_millis(50), shutdown_requested(&mut rx)).await.is_err());
        tx.send(true).unwrap();
        timeout(Duration::from_secs(1), shutdown_requested(&mut rx)).await.unwrap();
    }

    #[tokio::test]
    async fn already_set_resolves_immediately() {
        let (_tx, mut rx) = watch::channel(true);
        timeout(Duration::from_millis(50), shutdown_requested(&mut rx)).await.unwrap();
    }

    #[tokio::test]
    async fn dropped_sender_counts_as_shutdown() {
        let (tx, mut rx) = watch::channel(false);
        drop(tx);
        timeout(Duration::from_millis(50), shutdown_requested(&mut rx)).await.unwrap();
    }
}
