//! Registry of live tunnels

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;

use dashmap::DashMap;
use tokio_util::sync::CancellationToken;

use wh_core::types::{BindAddress, TunnelId};
use wh_protocol::ForwardRequest;

/// Tunnels owned by one client session, indexed by tunnel ID
pub struct TunnelRegistry {
    tunnels: DashMap<TunnelId, Arc<TunnelHandle>>,
}

/// Bookkeeping for a running tunnel
pub struct TunnelHandle {
    /// Tunnel identifier
    pub id: TunnelId,
    /// The client's original forward request
    pub request: ForwardRequest,
    /// Address the gateway is listening on for this tunnel
    pub gateway_listen: BindAddress,
    /// When the gateway accepted the listen request
    pub opened_at: Instant,
    cancel: CancellationToken,
    active_pipes: Arc<AtomicUsize>,
}

impl TunnelHandle {
    pub fn new(
        id: TunnelId,
        request: ForwardRequest,
        gateway_listen: BindAddress,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            id,
            request,
            gateway_listen,
            opened_at: Instant::now(),
            cancel,
            active_pipes: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Number of relay pipes currently running in this tunnel
    pub fn active_pipes(&self) -> usize {
        self.active_pipes.load(Ordering::Relaxed)
    }

    /// Counter shared with the tunnel task
    pub(crate) fn pipe_counter(&self) -> Arc<AtomicUsize> {
        Arc::clone(&self.active_pipes)
    }

    /// Token governing the tunnel and all of its pipes
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Ask the tunnel to tear itself down
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }

    pub fn is_shutting_down(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

impl TunnelRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self {
            tunnels: DashMap::new(),
        }
    }

    pub fn insert(&self, handle: TunnelHandle) -> Arc<TunnelHandle> {
        let handle = Arc::new(handle);
        self.tunnels.insert(handle.id, Arc::clone(&handle));
        handle
    }

    pub fn remove(&self, id: &TunnelId) -> Option<Arc<TunnelHandle>> {
        self.tunnels.remove(id).map(|(_, handle)| handle)
    }

    /// Get a tunnel by ID
    pub fn get(&self, id: &TunnelId) -> Option<Arc<TunnelHandle>> {
        self.tunnels.get(id).map(|r| Arc::clone(&r))
    }

    /// List all tunnels
    pub fn list(&self) -> Vec<Arc<TunnelHandle>> {
        self.tunnels.iter().map(|r| Arc::clone(&r)).collect()
    }

    /// Shut down one tunnel. Returns false if it is not registered.
    pub fn shutdown(&self, id: &TunnelId) -> bool {
        match self.get(id) {
            Some(handle) => {
                handle.shutdown();
                true
            }
            None => false,
        }
    }

    /// Shut down every registered tunnel, returning how many were signalled
    pub fn shutdown_all(&self) -> usize {
        let handles = self.list();
        for handle in &handles {
            handle.shutdown();
        }
        handles.len()
    }

    /// Number of live tunnels
    pub fn len(&self) -> usize {
        self.tunnels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tunnels.is_empty()
    }
}

impl Default for TunnelRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn handle(id: u64) -> TunnelHandle {
        TunnelHandle::new(
            TunnelId(id),
            ForwardRequest::new("0.0.0.0", 9000),
            BindAddress::new("127.0.0.1", 8080),
            CancellationToken::new(),
        )
    }

    #[test]
    fn test_insert_get_remove() {
        let registry = TunnelRegistry::new();
        assert!(registry.is_empty());

        registry.insert(handle(1));
        registry.insert(handle(2));
        assert_eq!(registry.len(), 2);
        assert_eq!(registry.get(&TunnelId(1)).unwrap().request.bind_port, 9000);

        assert!(registry.remove(&TunnelId(1)).is_some());
        assert!(registry.get(&TunnelId(1)).is_none());
        assert!(registry.remove(&TunnelId(1)).is_none());
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_shutdown_one() {
        let registry = TunnelRegistry::new();
        let first = registry.insert(handle(1));
        let second = registry.insert(handle(2));

        assert!(registry.shutdown(&TunnelId(1)));
        assert!(first.is_shutting_down());
        assert!(!second.is_shutting_down());
        assert!(!registry.shutdown(&TunnelId(99)));
    }

    #[test]
    fn test_shutdown_all() {
        let registry = TunnelRegistry::new();
        let handles: Vec<_> = (1..=3).map(|i| registry.insert(handle(i))).collect();

        assert_eq!(registry.shutdown_all(), 3);
        assert!(handles.iter().all(|h| h.is_shutting_down()));
    }

    #[test]
    fn test_pipe_counter_is_shared() {
        let tunnel = handle(1);
        let counter = tunnel.pipe_counter();
        counter.fetch_add(2, Ordering::Relaxed);
        assert_eq!(tunnel.active_pipes(), 2);
    }
}
