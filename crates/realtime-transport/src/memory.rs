//! In-process realtime backend.
//!
//! One shared document tree serves any number of clients. Each client has
//! its own connection state, listeners and on-disconnect hooks, so tests
//! can model several devices, dropped links and persisted failure flags
//! without a network.

use crate::flags::{has_connection_failure, record_connection_failure, FlagStorage, MemoryFlagStorage};
use crate::path::layout;
use crate::transport::{validate_batch, validate_write_path};
use crate::wire::{read_at, write_at};
use crate::{
    DbPath, ListenerFn, ListenerId, PushIdGenerator, Transport, TransportError, TransportFactory,
    TransportResult, Value, WriteBatch,
};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{json, Value as JsonValue};
use std::collections::BTreeMap;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tracing::{debug, info, warn};

type Pending = Vec<(ListenerFn, Option<JsonValue>)>;

/// Per-client operation counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TransportStats {
    pub get_once: usize,
    pub listen: usize,
    pub unlisten: usize,
    pub off_path: usize,
    pub update: usize,
    pub set: usize,
    pub remove: usize,
}

struct ListenerEntry {
    path: DbPath,
    callback: ListenerFn,
    /// Last value delivered; `None` until the first delivery.
    last: Option<Option<JsonValue>>,
}

struct ClientState {
    online_requested: bool,
    link_up: bool,
    connected: bool,
    listeners: BTreeMap<ListenerId, ListenerEntry>,
    on_disconnect: Vec<DbPath>,
    stats: TransportStats,
}

impl ClientState {
    fn emit_connected(&mut self, pending: &mut Pending) {
        let info = layout::info_connected();
        let value = Some(JsonValue::Bool(self.connected));
        for entry in self.listeners.values_mut().filter(|e| e.path == info) {
            entry.last = Some(value.clone());
            pending.push((entry.callback.clone(), value.clone()));
        }
    }

    /// Deliver every data listener overlapping one of `changed` whose
    /// value differs from what it last saw.
    fn deliver(&mut self, tree: &JsonValue, changed: Option<&[DbPath]>, pending: &mut Pending) {
        if !self.connected {
            return;
        }
        for entry in self.listeners.values_mut() {
            if entry.path.is_metadata() {
                continue;
            }
            if let Some(changed) = changed {
                if !changed.iter().any(|c| c.overlaps(&entry.path)) {
                    continue;
                }
            }
            let current = read_at(tree, &entry.path);
            if entry.last.as_ref() != Some(&current) {
                entry.last = Some(current.clone());
                pending.push((entry.callback.clone(), current));
            }
        }
    }
}

struct BackendState {
    tree: JsonValue,
    network_up: bool,
    frozen_time: Option<i64>,
    connect_delay: Option<Duration>,
    failing_connects: u32,
    next_client: u64,
    next_listener: u64,
    clients: BTreeMap<u64, ClientState>,
    names: BTreeMap<String, RegisteredName>,
}

struct RegisteredName {
    client_id: u64,
    handle: Weak<MemoryTransport>,
}

impl BackendState {
    fn server_time(&self) -> i64 {
        self.frozen_time
            .unwrap_or_else(|| chrono::Utc::now().timestamp_millis())
    }

    fn client_mut(&mut self, id: u64) -> TransportResult<&mut ClientState> {
        self.clients.get_mut(&id).ok_or(TransportError::Shutdown)
    }

    fn connected_client(&mut self, id: u64) -> TransportResult<&mut ClientState> {
        let client = self.client_mut(id)?;
        if !client.connected {
            return Err(TransportError::Offline);
        }
        Ok(client)
    }

    /// Recompute every client's connection. A client may stay connected
    /// while failure flags exist but cannot become connected.
    fn refresh(&mut self, blocked: bool, pending: &mut Pending) {
        let network_up = self.network_up;
        let mut removed = Vec::new();
        let mut came_online = Vec::new();

        for (id, client) in self.clients.iter_mut() {
            let can_stay = client.online_requested && client.link_up && network_up;
            let next = if client.connected {
                can_stay
            } else {
                can_stay && !blocked
            };
            if next == client.connected {
                continue;
            }
            client.connected = next;
            client.emit_connected(pending);
            if next {
                came_online.push(*id);
            } else {
                removed.append(&mut client.on_disconnect);
            }
        }

        for path in &removed {
            write_at(&mut self.tree, path, None);
        }
        let tree = &self.tree;
        for id in came_online {
            if let Some(client) = self.clients.get_mut(&id) {
                client.deliver(tree, None, pending);
            }
        }
        if !removed.is_empty() {
            self.notify(&removed, pending);
        }
    }

    fn notify(&mut self, changed: &[DbPath], pending: &mut Pending) {
        let tree = &self.tree;
        for client in self.clients.values_mut() {
            client.deliver(tree, Some(changed), pending);
        }
    }
}

fn run(pending: Pending) {
    for (callback, value) in pending {
        callback(value);
    }
}

/// Shared in-memory store and client registry.
pub struct MemoryBackend {
    me: Weak<MemoryBackend>,
    flags: Arc<dyn FlagStorage>,
    push_ids: PushIdGenerator,
    state: Mutex<BackendState>,
}

impl MemoryBackend {
    /// Backend with in-memory failure flags.
    pub fn new() -> Arc<Self> {
        Self::with_flag_storage(Arc::new(MemoryFlagStorage::new()))
    }

    pub fn with_flag_storage(flags: Arc<dyn FlagStorage>) -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            me: me.clone(),
            flags,
            push_ids: PushIdGenerator::new(),
            state: Mutex::new(BackendState {
                tree: JsonValue::Object(Default::default()),
                network_up: true,
                frozen_time: None,
                connect_delay: None,
                failing_connects: 0,
                next_client: 1,
                next_listener: 1,
                clients: BTreeMap::new(),
                names: BTreeMap::new(),
            }),
        })
    }

    pub fn flags(&self) -> Arc<dyn FlagStorage> {
        self.flags.clone()
    }

    fn blocked(&self) -> bool {
        has_connection_failure(self.flags.as_ref())
    }

    /// Register a client under `app_name`. Names stay reserved for the
    /// lifetime of the backend, even after the client shuts down.
    pub fn connect_client(&self, app_name: &str) -> TransportResult<Arc<MemoryTransport>> {
        let backend = self.me.upgrade().ok_or(TransportError::Shutdown)?;
        let blocked = self.blocked();
        let mut pending = Pending::new();

        let transport = {
            let mut state = self.state.lock();
            if state.names.contains_key(app_name) {
                return Err(TransportError::DuplicateApp(app_name.to_string()));
            }
            let client_id = state.next_client;
            state.next_client += 1;

            let transport = Arc::new(MemoryTransport {
                backend,
                client_id,
                app_name: app_name.to_string(),
            });
            state.names.insert(
                app_name.to_string(),
                RegisteredName {
                    client_id,
                    handle: Arc::downgrade(&transport),
                },
            );
            state.clients.insert(
                client_id,
                ClientState {
                    online_requested: true,
                    link_up: true,
                    connected: false,
                    listeners: BTreeMap::new(),
                    on_disconnect: Vec::new(),
                    stats: TransportStats::default(),
                },
            );
            state.refresh(blocked, &mut pending);
            transport
        };

        info!(app_name, connected = transport.is_connected(), "Memory client registered");
        run(pending);
        Ok(transport)
    }

    /// Live client registered under `app_name`, if any.
    pub fn client(&self, app_name: &str) -> Option<Arc<MemoryTransport>> {
        let weak = self
            .state
            .lock()
            .names
            .get(app_name)
            .map(|n| n.handle.clone());
        weak.and_then(|w| w.upgrade())
    }

    /// Every identity ever registered, in order.
    pub fn registered_apps(&self) -> Vec<String> {
        self.state.lock().names.keys().cloned().collect()
    }

    /// Current value at `path` in read shape, regardless of connectivity.
    pub fn snapshot(&self, path: &DbPath) -> Option<JsonValue> {
        read_at(&self.state.lock().tree, path)
    }

    /// Current value at `path` as stored (lists appear as keyed maps).
    pub fn stored(&self, path: &DbPath) -> Option<JsonValue> {
        crate::wire::lookup(&self.state.lock().tree, path).cloned()
    }

    /// Write raw JSON at `path` as if another client had done it.
    pub fn seed(&self, path: &DbPath, value: JsonValue) {
        let mut pending = Pending::new();
        {
            let mut state = self.state.lock();
            write_at(&mut state.tree, path, Some(value));
            state.notify(std::slice::from_ref(path), &mut pending);
        }
        run(pending);
    }

    /// Resolve server timestamps to `ms` instead of the wall clock.
    pub fn freeze_server_time(&self, ms: i64) {
        self.state.lock().frozen_time = Some(ms);
    }

    /// Make every factory connect wait `delay` before registering.
    pub fn set_connect_delay(&self, delay: Option<Duration>) {
        self.state.lock().connect_delay = delay;
    }

    /// Make the next `count` factory connects fail.
    pub fn fail_next_connects(&self, count: u32) {
        self.state.lock().failing_connects = count;
    }

    /// Bring the whole network down or up. Going down with
    /// `record_failure` writes a failure flag for each connected client.
    pub fn set_network_available(&self, up: bool, record_failure: bool) {
        let blocked;
        let mut pending = Pending::new();
        {
            let mut state = self.state.lock();
            if !up && record_failure {
                let names: Vec<String> = state
                    .names
                    .iter()
                    .filter(|(_, n)| state.clients.get(&n.client_id).is_some_and(|c| c.connected))
                    .map(|(name, _)| name.clone())
                    .collect();
                for name in names {
                    if let Err(e) = record_connection_failure(self.flags.as_ref(), &name) {
                        warn!(app_name = %name, error = %e, "Failed to record connection failure");
                    }
                }
            }
            state.network_up = up;
            blocked = self.blocked();
            state.refresh(blocked, &mut pending);
        }
        debug!(up, blocked, "Memory network availability changed");
        run(pending);
    }

    /// Drop one client's link, as a dead socket would.
    pub fn drop_connection(&self, app_name: &str, record_failure: bool) {
        self.set_link(app_name, false, record_failure);
    }

    /// Restore one client's link. The client reconnects only if it still
    /// wants to be online and no failure flags are present.
    pub fn restore_connection(&self, app_name: &str) {
        self.set_link(app_name, true, false);
    }

    fn set_link(&self, app_name: &str, up: bool, record_failure: bool) {
        let Some(client_id) = self.state.lock().names.get(app_name).map(|n| n.client_id) else {
            return;
        };
        if !up && record_failure {
            if let Err(e) = record_connection_failure(self.flags.as_ref(), app_name) {
                warn!(app_name, error = %e, "Failed to record connection failure");
            }
        }
        let blocked = self.blocked();
        let mut pending = Pending::new();
        {
            let mut state = self.state.lock();
            if let Ok(client) = state.client_mut(client_id) {
                client.link_up = up;
            }
            state.refresh(blocked, &mut pending);
        }
        run(pending);
    }
}

#[async_trait]
impl TransportFactory for MemoryBackend {
    async fn connect(&self, app_name: &str) -> TransportResult<Arc<dyn Transport>> {
        let delay = self.state.lock().connect_delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        {
            let mut state = self.state.lock();
            if state.failing_connects > 0 {
                state.failing_connects -= 1;
                return Err(TransportError::Offline);
            }
        }
        let transport: Arc<dyn Transport> = self.connect_client(app_name)?;
        Ok(transport)
    }
}

/// One client of a [`MemoryBackend`].
pub struct MemoryTransport {
    backend: Arc<MemoryBackend>,
    client_id: u64,
    app_name: String,
}

impl MemoryTransport {
    pub fn backend(&self) -> &Arc<MemoryBackend> {
        &self.backend
    }

    /// Operation counters for this client.
    pub fn stats(&self) -> TransportStats {
        self.backend
            .state
            .lock()
            .clients
            .get(&self.client_id)
            .map(|c| c.stats)
            .unwrap_or_default()
    }

    /// Paths registered for removal on disconnect.
    pub fn pending_disconnect_hooks(&self) -> Vec<DbPath> {
        self.backend
            .state
            .lock()
            .clients
            .get(&self.client_id)
            .map(|c| c.on_disconnect.clone())
            .unwrap_or_default()
    }

    fn write(&self, changes: Vec<(DbPath, Option<JsonValue>)>) -> TransportResult<()> {
        let mut pending = Pending::new();
        {
            let mut state = self.backend.state.lock();
            state.connected_client(self.client_id)?;
            let mut changed = Vec::with_capacity(changes.len());
            for (path, value) in changes {
                write_at(&mut state.tree, &path, value);
                changed.push(path);
            }
            state.notify(&changed, &mut pending);
        }
        run(pending);
        Ok(())
    }

    fn set_connection_wanted(&self, wanted: bool) {
        let blocked = self.backend.blocked();
        let mut pending = Pending::new();
        {
            let mut state = self.backend.state.lock();
            if let Ok(client) = state.client_mut(self.client_id) {
                client.online_requested = wanted;
            }
            state.refresh(blocked, &mut pending);
        }
        run(pending);
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    fn app_name(&self) -> &str {
        &self.app_name
    }

    async fn get_once(&self, path: &DbPath) -> TransportResult<Option<JsonValue>> {
        path.validate()?;
        let mut state = self.backend.state.lock();
        let client = state.client_mut(self.client_id)?;
        client.stats.get_once += 1;
        if *path == layout::info_connected() {
            return Ok(Some(JsonValue::Bool(client.connected)));
        }
        state.connected_client(self.client_id)?;
        Ok(read_at(&state.tree, path))
    }

    async fn update(&self, batch: WriteBatch) -> TransportResult<()> {
        let server_ts = {
            let mut state = self.backend.state.lock();
            state.client_mut(self.client_id)?.stats.update += 1;
            json!(state.server_time())
        };
        validate_batch(&batch)?;
        let changes = batch
            .iter()
            .map(|(path, value)| Ok((path.clone(), Some(value.to_wire(&server_ts)?))))
            .collect::<TransportResult<Vec<_>>>()?;
        self.write(changes)
    }

    async fn set(&self, path: &DbPath, value: Value) -> TransportResult<()> {
        let server_ts = {
            let mut state = self.backend.state.lock();
            state.client_mut(self.client_id)?.stats.set += 1;
            json!(state.server_time())
        };
        validate_write_path(path)?;
        let wire = value.to_wire(&server_ts)?;
        self.write(vec![(path.clone(), Some(wire))])
    }

    async fn remove(&self, path: &DbPath) -> TransportResult<()> {
        self.backend
            .state
            .lock()
            .client_mut(self.client_id)?
            .stats
            .remove += 1;
        validate_write_path(path)?;
        self.write(vec![(path.clone(), None)])
    }

    fn push_key(&self) -> String {
        self.backend.push_ids.generate()
    }

    fn listen(&self, path: &DbPath, listener: ListenerFn) -> ListenerId {
        let mut pending = Pending::new();
        let id = {
            let mut state = self.backend.state.lock();
            let id = ListenerId(state.next_listener);
            state.next_listener += 1;

            if let Err(e) = path.validate() {
                warn!(path = %path, error = %e, "Listener on invalid path will never fire");
            }
            let state = &mut *state;
            let tree = &state.tree;
            if let Some(client) = state.clients.get_mut(&self.client_id) {
                client.stats.listen += 1;
                let mut entry = ListenerEntry {
                    path: path.clone(),
                    callback: listener,
                    last: None,
                };
                if *path == layout::info_connected() {
                    let value = Some(JsonValue::Bool(client.connected));
                    entry.last = Some(value.clone());
                    pending.push((entry.callback.clone(), value));
                } else if client.connected && path.validate().is_ok() {
                    let current = read_at(tree, path);
                    entry.last = Some(current.clone());
                    pending.push((entry.callback.clone(), current));
                }
                client.listeners.insert(id, entry);
            }
            id
        };
        run(pending);
        id
    }

    fn unlisten(&self, id: ListenerId) -> bool {
        let removed = {
            let mut state = self.backend.state.lock();
            match state.client_mut(self.client_id) {
                Ok(client) => {
                    client.stats.unlisten += 1;
                    client.listeners.remove(&id)
                }
                Err(_) => None,
            }
        };
        removed.is_some()
    }

    fn off_path(&self, path: &DbPath) -> usize {
        let removed: Vec<ListenerEntry> = {
            let mut state = self.backend.state.lock();
            match state.client_mut(self.client_id) {
                Ok(client) => {
                    client.stats.off_path += 1;
                    let ids: Vec<ListenerId> = client
                        .listeners
                        .iter()
                        .filter(|(_, e)| e.path == *path)
                        .map(|(id, _)| *id)
                        .collect();
                    ids.iter()
                        .filter_map(|id| client.listeners.remove(id))
                        .collect()
                }
                Err(_) => Vec::new(),
            }
        };
        removed.len()
    }

    async fn on_disconnect_remove(&self, path: &DbPath) -> TransportResult<()> {
        validate_write_path(path)?;
        let mut state = self.backend.state.lock();
        let client = state.connected_client(self.client_id)?;
        if !client.on_disconnect.contains(path) {
            client.on_disconnect.push(path.clone());
        }
        Ok(())
    }

    fn go_offline(&self) {
        debug!(app_name = %self.app_name, "Going offline");
        self.set_connection_wanted(false);
    }

    fn go_online(&self) {
        debug!(app_name = %self.app_name, "Going online");
        self.set_connection_wanted(true);
    }

    fn is_connected(&self) -> bool {
        self.backend
            .state
            .lock()
            .clients
            .get(&self.client_id)
            .is_some_and(|c| c.connected)
    }

    fn listener_count(&self) -> usize {
        self.backend
            .state
            .lock()
            .clients
            .get(&self.client_id)
            .map_or(0, |c| c.listeners.len())
    }

    fn shutdown(&self) {
        let blocked = self.backend.blocked();
        let mut pending = Pending::new();
        let listeners = {
            let mut state = self.backend.state.lock();
            let Some(client) = state.clients.get_mut(&self.client_id) else {
                return;
            };
            let listeners = std::mem::take(&mut client.listeners);
            client.online_requested = false;
            state.refresh(blocked, &mut pending);
            state.clients.remove(&self.client_id);
            listeners
        };
        info!(app_name = %self.app_name, "Memory client shut down");
        drop(listeners);
        run(pending);
    }
}

impl Drop for MemoryTransport {
    fn drop(&mut self) {
        self.shutdown();
    }
}
