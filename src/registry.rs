use crate::{
    conn_id::ConnectionId,
    error::RegistryError,
    vsock::{SocketHandle, VirtualSocket},
};
use parking_lot::RwLock;
use std::{collections::HashMap, net::SocketAddr, sync::Arc, time::Duration};
use tracing::debug;

/// DEFAULT_BIND_TIMEOUT bounds how long a negotiated socket waits for its raw socket
pub const DEFAULT_BIND_TIMEOUT: Duration = Duration::from_secs(30);

/// ConnectionRegistry maps connection ids to in-flight virtual sockets.
///
/// It is owned by the server role and cloned into every task that needs it.
/// The lock only guards map access and is never held across I/O.
#[derive(Clone)]
pub struct ConnectionRegistry {
    sockets: Arc<RwLock<HashMap<ConnectionId, Arc<SocketHandle>>>>,
    bind_timeout: Duration,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self {
            sockets: Arc::new(RwLock::new(HashMap::new())),
            bind_timeout: DEFAULT_BIND_TIMEOUT,
        }
    }

    /// with_bind_timeout sets the raw socket wait applied to new sockets
    pub fn with_bind_timeout(mut self, bind_timeout: Duration) -> Self {
        self.bind_timeout = bind_timeout;
        self
    }

    /// create registers a pending virtual socket under `id`
    pub fn create(
        &self,
        id: ConnectionId,
        remote_addr: SocketAddr,
    ) -> Result<VirtualSocket, RegistryError> {
        let mut sockets = self.sockets.write();
        if sockets.contains_key(&id) {
            return Err(RegistryError::DuplicateId(id));
        }

        let (socket, handle) = VirtualSocket::new(id, remote_addr, self.clone(), self.bind_timeout);
        sockets.insert(id, handle);

        // DEBUG
        debug!(conn_id = %id, remote = %remote_addr, "virtual socket registered");
        Ok(socket)
    }

    /// lookup returns the handle registered under `id`
    pub fn lookup(&self, id: &ConnectionId) -> Result<Arc<SocketHandle>, RegistryError> {
        self.sockets
            .read()
            .get(id)
            .cloned()
            .ok_or(RegistryError::NotFound(*id))
    }

    /// remove drops the entry for `id`; returns false if it was already gone
    pub fn remove(&self, id: &ConnectionId) -> bool {
        let removed = self.sockets.write().remove(id).is_some();
        if removed {
            debug!(conn_id = %id, "virtual socket deregistered");
        }
        removed
    }

    pub fn contains(&self, id: &ConnectionId) -> bool {
        self.sockets.read().contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.sockets.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.sockets.read().is_empty()
    }
}

impl Default for ConnectionRegistry {
    fn default() -> Self {
        Self::new()
    }
}
