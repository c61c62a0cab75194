use crate::error::{ServerError, ServerResult};
use crate::messages::ControlMessage;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use parking_lot::RwLock;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

pub type ClientId = String;

/// Outbound side of one control connection. Every send goes through the
/// connection's writer task, so writes to a client never interleave.
#[derive(Debug, Clone)]
pub struct ControlHandle {
    pub connection_id: Uuid,
    sender: mpsc::UnboundedSender<Arc<ControlMessage>>,
}

impl ControlHandle {
    pub fn new(connection_id: Uuid, sender: mpsc::UnboundedSender<Arc<ControlMessage>>) -> Self {
        Self {
            connection_id,
            sender,
        }
    }

    /// Returns false when the connection's writer is gone.
    pub fn send(&self, message: Arc<ControlMessage>) -> bool {
        self.sender.send(message).is_ok()
    }
}

#[derive(Debug, Clone)]
pub struct ClientIdentity {
    pub id: ClientId,
    pub control: Option<ControlHandle>,
    pub data_address: Option<SocketAddr>,
    pub last_heartbeat: Instant,
}

impl ClientIdentity {
    pub fn new(id: impl Into<ClientId>, control: Option<ControlHandle>) -> Self {
        Self {
            id: id.into(),
            control,
            data_address: None,
            last_heartbeat: Instant::now(),
        }
    }

    pub fn generate(control: Option<ControlHandle>) -> Self {
        Self::new(Uuid::new_v4().to_string(), control)
    }

    pub fn is_timed_out(&self, now: Instant, timeout: Duration) -> bool {
        now.saturating_duration_since(self.last_heartbeat) > timeout
    }
}

/// Notified once per client departure, whatever caused it.
pub trait DisconnectObserver: Send + Sync {
    fn on_client_disconnect(&self, client_id: &str);
}

/// Authoritative table of connected clients across both transports.
pub struct ClientRegistry {
    clients: DashMap<ClientId, ClientIdentity>,
    by_connection: DashMap<Uuid, ClientId>,
    by_address: DashMap<SocketAddr, ClientId>,
    observers: RwLock<Vec<Arc<dyn DisconnectObserver>>>,
    heartbeat_timeout: Duration,
}

impl ClientRegistry {
    pub fn new(heartbeat_timeout: Duration) -> Self {
        Self {
            clients: DashMap::new(),
            by_connection: DashMap::new(),
            by_address: DashMap::new(),
            observers: RwLock::new(Vec::new()),
            heartbeat_timeout,
        }
    }

    /// Observers run synchronously, in registration order.
    pub fn add_observer(&self, observer: Arc<dyn DisconnectObserver>) {
        self.observers.write().push(observer);
    }

    pub fn register(&self, identity: ClientIdentity) -> ServerResult<()> {
        let id = identity.id.clone();
        let connection_id = identity.control.as_ref().map(|c| c.connection_id);
        let data_address = identity.data_address;

        match self.clients.entry(id.clone()) {
            Entry::Occupied(_) => {
                return Err(ServerError::InvalidArgument(format!(
                    "client {} already registered",
                    id
                )));
            }
            Entry::Vacant(entry) => {
                entry.insert(identity);
            }
        }

        if let Some(connection_id) = connection_id {
            self.by_connection.insert(connection_id, id.clone());
        }
        if let Some(address) = data_address {
            self.by_address.insert(address, id.clone());
        }
        info!("Client {} registered", id);
        Ok(())
    }

    pub fn lookup_by_id(&self, id: &str) -> Option<ClientIdentity> {
        self.clients.get(id).map(|c| c.clone())
    }

    pub fn lookup_by_control_handle(&self, connection_id: Uuid) -> Option<ClientIdentity> {
        let id = self.by_connection.get(&connection_id)?.clone();
        self.lookup_by_id(&id)
    }

    pub fn lookup_by_data_address(&self, address: SocketAddr) -> Option<ClientIdentity> {
        let id = self.by_address.get(&address)?.clone();
        self.lookup_by_id(&id)
    }

    /// The client's current data address, if it has bound one.
    pub fn data_address(&self, id: &str) -> Option<SocketAddr> {
        self.clients.get(id).and_then(|c| c.data_address)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.clients.contains_key(id)
    }

    /// Correlates a data-channel address with a known client. A previous
    /// address of this client, or a previous owner of this address, is
    /// unbound.
    pub fn bind_data_address(&self, id: &str, address: SocketAddr) -> ServerResult<()> {
        let previous = {
            let mut client = self
                .clients
                .get_mut(id)
                .ok_or_else(|| ServerError::client_not_found(id))?;
            client.data_address.replace(address)
        };

        if let Some(previous) = previous.filter(|p| *p != address) {
            self.by_address.remove_if(&previous, |_, owner| owner == id);
        }

        if let Some(other) = self.by_address.insert(address, id.to_string()) {
            if other != id {
                if let Some(mut stale) = self.clients.get_mut(&other) {
                    if stale.data_address == Some(address) {
                        stale.data_address = None;
                    }
                }
            }
        }
        debug!("Client {} bound to data address {}", id, address);
        Ok(())
    }

    /// Points a known client at a new control connection.
    pub fn attach_control(&self, id: &str, handle: ControlHandle) -> ServerResult<()> {
        let connection_id = handle.connection_id;
        let previous = {
            let mut client = self
                .clients
                .get_mut(id)
                .ok_or_else(|| ServerError::client_not_found(id))?;
            client.last_heartbeat = Instant::now();
            client.control.replace(handle)
        };

        if let Some(previous) = previous.filter(|p| p.connection_id != connection_id) {
            self.by_connection.remove(&previous.connection_id);
        }
        self.by_connection.insert(connection_id, id.to_string());
        Ok(())
    }

    /// Forgets a closed control connection without forgetting the client,
    /// which may still reconnect before its heartbeat expires.
    pub fn detach_control(&self, connection_id: Uuid) -> Option<ClientId> {
        let (_, id) = self.by_connection.remove(&connection_id)?;
        if let Some(mut client) = self.clients.get_mut(&id) {
            if client
                .control
                .as_ref()
                .is_some_and(|c| c.connection_id == connection_id)
            {
                client.control = None;
            }
        }
        Some(id)
    }

    pub fn touch_heartbeat(&self, id: &str) -> ServerResult<()> {
        let mut client = self
            .clients
            .get_mut(id)
            .ok_or_else(|| ServerError::client_not_found(id))?;
        client.last_heartbeat = Instant::now();
        Ok(())
    }

    pub fn is_alive(&self, id: &str) -> bool {
        self.clients
            .get(id)
            .is_some_and(|c| !c.is_timed_out(Instant::now(), self.heartbeat_timeout))
    }

    pub fn list_ids(&self) -> Vec<ClientId> {
        self.clients.iter().map(|c| c.key().clone()).collect()
    }

    /// Removes a client and notifies observers. Only the call that actually
    /// removes the entry notifies, so repeated removals are harmless.
    pub fn remove(&self, id: &str) -> Option<ClientIdentity> {
        self.remove_if(id, |_| true)
    }

    fn remove_if(
        &self,
        id: &str,
        predicate: impl FnOnce(&ClientIdentity) -> bool,
    ) -> Option<ClientIdentity> {
        let (_, identity) = self.clients.remove_if(id, |_, c| predicate(c))?;

        if let Some(control) = &identity.control {
            self.by_connection
                .remove_if(&control.connection_id, |_, owner| owner == id);
        }
        if let Some(address) = identity.data_address {
            self.by_address.remove_if(&address, |_, owner| owner == id);
        }
        info!("Client {} removed", id);

        let observers = self.observers.read().clone();
        for observer in observers {
            observer.on_client_disconnect(id);
        }
        Some(identity)
    }

    /// Best-effort send on a client's control channel. A missing client or
    /// closed connection is logged and the message dropped.
    pub fn send(&self, id: &str, message: ControlMessage) -> bool {
        self.send_shared(id, Arc::new(message))
    }

    pub fn send_shared(&self, id: &str, message: Arc<ControlMessage>) -> bool {
        let handle = self.clients.get(id).and_then(|c| c.control.clone());
        match handle {
            Some(handle) => {
                if handle.send(message) {
                    true
                } else {
                    warn!("Dropping message for client {}: connection closed", id);
                    false
                }
            }
            None => {
                debug!("Dropping message for client {}: no control connection", id);
                false
            }
        }
    }

    /// Removes every client silent for longer than the heartbeat timeout.
    pub fn prune_stale(&self, now: Instant) -> Vec<ClientId> {
        let timeout = self.heartbeat_timeout;
        let stale: Vec<ClientId> = self
            .clients
            .iter()
            .filter(|c| c.is_timed_out(now, timeout))
            .map(|c| c.key().clone())
            .collect();

        let mut removed = Vec::new();
        for id in stale {
            // A heartbeat may have landed since the scan
            if self.remove_if(&id, |c| c.is_timed_out(now, timeout)).is_some() {
                info!("Client {} timed out", id);
                removed.push(id);
            }
        }
        removed
    }

    pub fn spawn_liveness_sweep(
        self: &Arc<Self>,
        interval: Duration,
        shutdown: CancellationToken,
    ) -> JoinHandle<()> {
        let registry = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        let removed = registry.prune_stale(Instant::now());
                        if !removed.is_empty() {
                            debug!("Liveness sweep removed {} client(s)", removed.len());
                        }
                    }
                }
            }
            debug!("Liveness sweep stopped");
        })
    }
}
