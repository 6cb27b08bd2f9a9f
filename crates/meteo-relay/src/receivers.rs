use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};

use meteo_proto::{write_full, FRAME_LEN};
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::{oneshot, Mutex};
use tracing::{info, warn};

pub type ReceiverId = u64;

type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

struct Receiver {
    id: ReceiverId,
    peer: SocketAddr,
    writer: BoxedWriter,
    /// Dropped together with the entry, which wakes the connection's keep-alive task.
    _evicted: oneshot::Sender<()>,
}

/// Handle returned to the connection that registered a receiver.
pub struct Registration {
    pub id: ReceiverId,
    /// Resolves (with an error) once the entry has left the set, by eviction or removal.
    pub evicted: oneshot::Receiver<()>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BroadcastReport {
    pub delivered: usize,
    pub evicted: usize,
}

/// Downstream connections eligible for broadcast.
///
/// Every access goes through one async mutex, held for the whole fan-out of a frame,
/// so two broadcasts never interleave their writes on the same receiver.
pub struct ReceiverSet {
    inner: Mutex<Vec<Receiver>>,
    capacity: usize,
    next_id: AtomicU64,
}

impl ReceiverSet {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(Vec::with_capacity(capacity)),
            capacity,
            next_id: AtomicU64::new(1),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub async fn len(&self) -> usize {
        self.inner.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Register a receiver. Returns `None` when the set is full; the writer is dropped,
    /// which closes that direction of the connection.
    pub async fn add<W>(&self, peer: SocketAddr, writer: W) -> Option<Registration>
    where
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let mut set = self.inner.lock().await;
        if set.len() >= self.capacity {
            warn!("relay: receiver set full ({}), rejecting {}", self.capacity, peer);
            return None;
        }
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, evicted) = oneshot::channel();
        set.push(Receiver { id, peer, writer: Box::new(writer), _evicted: tx });
        info!("relay: receiver {} added, total={}", peer, set.len());
        Some(Registration { id, evicted })
    }

    /// Unregister a receiver. Returns false if it was already evicted.
    pub async fn remove(&self, id: ReceiverId) -> bool {
        let mut set = self.inner.lock().await;
        match set.iter().position(|r| r.id == id) {
            Some(idx) => {
                let r = set.swap_remove(idx);
                info!("relay: receiver {} removed, total={}", r.peer, set.len());
                true
            }
            None => false,
        }
    }

    /// Write `frame` to every receiver. A receiver whose write fails is swap-removed
    /// and closed, and its registration is notified; the fan-out continues with the rest.
    pub async fn broadcast(&self, frame: &[u8; FRAME_LEN]) -> BroadcastReport {
        let mut set = self.inner.lock().await;
        let mut report = BroadcastReport::default();
        let mut i = 0;
        while i < set.len() {
            match write_full(&mut set[i].writer, frame).await {
                Ok(()) => {
                    report.delivered += 1;
                    i += 1;
                }
                Err(e) => {
                    let mut r = set.swap_remove(i);
                    warn!("relay: send to receiver {} failed, removing: {}", r.peer, e);
                    let _ = r.writer.shutdown().await;
                    report.evicted += 1;
                }
            }
        }
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], port))
    }

    fn frame() -> [u8; FRAME_LEN] {
        let mut f = [0u8; FRAME_LEN];
        f[0] = 1;
        f[1] = 2;
        f
    }

    #[tokio::test]
    async fn broadcast_reaches_every_receiver() {
        let set = ReceiverSet::new(8);
        let mut readers = Vec::new();
        for port in 0..3 {
            let (w, r) = tokio::io::duplex(256);
            set.add(addr(port), w).await.unwrap();
            readers.push(r);
        }
        let report = set.broadcast(&frame()).await;
        assert_eq!(report, BroadcastReport { delivered: 3, evicted: 0 });
        for mut r in readers {
            let mut buf = [0u8; FRAME_LEN];
            r.read_exact(&mut buf).await.unwrap();
            assert_eq!(buf, frame());
        }
    }

    #[tokio::test]
    async fn failed_receiver_is_evicted_others_still_served() {
        let set = ReceiverSet::new(8);
        let (w0, mut r0) = tokio::io::duplex(256);
        let (w1, r1) = tokio::io::duplex(256);
        let (w2, mut r2) = tokio::io::duplex(256);
        set.add(addr(1), w0).await.unwrap();
        set.add(addr(2), w1).await.unwrap();
        set.add(addr(3), w2).await.unwrap();
        drop(r1);

        let report = set.broadcast(&frame()).await;
        assert_eq!(report, BroadcastReport { delivered: 2, evicted: 1 });
        assert_eq!(set.len().await, 2);

        let mut buf = [0u8; FRAME_LEN];
        r0.read_exact(&mut buf).await.unwrap();
        r2.read_exact(&mut buf).await.unwrap();
        assert_eq!(buf, frame());
    }

    #[tokio::test]
    async fn capacity_is_enforced() {
        let set = ReceiverSet::new(1);
        let (w0, _r0) = tokio::io::duplex(64);
        let (w1, mut r1) = tokio::io::duplex(64);
        assert!(set.add(addr(1), w0).await.is_some());
        assert!(set.add(addr(2), w1).await.is_none());
        // rejected writer was dropped, so its peer sees EOF
        let mut buf = [0u8; 1];
        assert_eq!(r1.read(&mut buf).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn remove_is_idempotent() {
        let set = ReceiverSet::new(4);
        let (w, _r) = tokio::io::duplex(64);
        let id = set.add(addr(1), w).await.unwrap().id;
        assert!(set.remove(id).await);
        assert!(!set.remove(id).await);
        assert!(set.is_empty().await);
    }

    #[tokio::test]
    async fn eviction_notifies_the_registration() {
        let set = ReceiverSet::new(4);
        let (w_dead, r_dead) = tokio::io::duplex(64);
        let (w_live, _r_live) = tokio::io::duplex(64);
        let mut dead = set.add(addr(1), w_dead).await.unwrap();
        let mut live = set.add(addr(2), w_live).await.unwrap();
        drop(r_dead);

        set.broadcast(&frame()).await;
        let res = tokio::time::timeout(std::time::Duration::from_secs(1), &mut dead.evicted).await;
        assert!(res.is_ok(), "evicted receiver was not notified");
        assert_eq!(live.evicted.try_recv(), Err(oneshot::error::TryRecvError::Empty));
    }

    #[tokio::test]
    async fn remove_also_notifies() {
        let set = ReceiverSet::new(4);
        let (w, _r) = tokio::io::duplex(64);
        let mut reg = set.add(addr(1), w).await.unwrap();
        assert_eq!(set.capacity(), 4);
        set.remove(reg.id).await;
        assert_eq!(reg.evicted.try_recv(), Err(oneshot::error::TryRecvError::Closed));
    }
}
