//! REST + server-sent-events transport for a hosted realtime database.
//!
//! Reads and writes are plain HTTP calls on `{base}/{path}.json`. Value
//! listeners hold an event stream open per path and keep a local copy of
//! the subtree, applying `put` and `patch` events to it. A probe stream
//! decides the connected flag: it is true while the probe is open.

use crate::flags::{has_connection_failure, record_connection_failure, stream_failure_key, FlagStorage};
use crate::path::layout;
use crate::transport::{validate_batch, validate_write_path};
use crate::wire::{merge_at, read_shape, write_at};
use crate::{
    DbPath, ListenerFn, ListenerId, PushIdGenerator, Transport, TransportError, TransportFactory,
    TransportResult, Value, WriteBatch,
};
use async_trait::async_trait;
use futures_util::StreamExt;
use parking_lot::Mutex;
use serde::Deserialize;
use serde_json::{json, Map, Value as JsonValue};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use url::Url;

/// Connection settings for the REST transport.
#[derive(Debug, Clone)]
pub struct RestConfig {
    pub base_url: Url,
    /// Secret or ID token sent as the `auth` query parameter.
    pub auth: Option<String>,
    pub retry_base: Duration,
    pub retry_max: Duration,
    /// Timeout for one-shot requests. Streams are not limited.
    pub request_timeout: Duration,
}

impl RestConfig {
    pub fn new(mut base_url: Url) -> Self {
        if !base_url.path().ends_with('/') {
            let path = format!("{}/", base_url.path());
            base_url.set_path(&path);
        }
        Self {
            base_url,
            auth: None,
            retry_base: Duration::from_secs(2),
            retry_max: Duration::from_secs(30),
            request_timeout: Duration::from_secs(15),
        }
    }

    pub fn with_auth(mut self, auth: Option<String>) -> Self {
        self.auth = auth;
        self
    }

    pub fn with_retry(mut self, base: Duration, max: Duration) -> Self {
        self.retry_base = base;
        self.retry_max = max;
        self
    }

    /// Delay before reopening a stream after `attempt` consecutive failures.
    pub fn retry_delay(&self, attempt: u32) -> Duration {
        let factor = 1u32
            .checked_shl(attempt.saturating_sub(1))
            .unwrap_or(u32::MAX);
        self.retry_base.saturating_mul(factor).min(self.retry_max)
    }

    /// `{base}/{path}.json?auth=...`
    pub fn url_for(&self, path: &DbPath) -> TransportResult<Url> {
        let mut url = self.base_url.clone();
        {
            let mut segments = url
                .path_segments_mut()
                .map_err(|_| TransportError::InvalidPath(format!("base URL {}", self.base_url)))?;
            segments.pop_if_empty();
            match path.segments().split_last() {
                None => {
                    segments.push(".json");
                }
                Some((last, head)) => {
                    segments.extend(head);
                    segments.push(&format!("{last}.json"));
                }
            }
        }
        if let Some(auth) = &self.auth {
            url.query_pairs_mut().append_pair("auth", auth);
        }
        Ok(url)
    }
}

// =============================================================================
// Server-sent events
// =============================================================================

/// One decoded server-sent event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SseEvent {
    pub event: String,
    pub data: String,
}

/// Incremental parser for an event-stream body.
#[derive(Debug, Default)]
pub struct SseParser {
    buffer: Vec<u8>,
}

impl SseParser {
    /// Feed a body chunk and return every event it completed.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<SseEvent> {
        self.buffer
            .extend(chunk.iter().copied().filter(|b| *b != b'\r'));
        let mut events = Vec::new();
        while let Some(end) = self.buffer.windows(2).position(|w| w == b"\n\n") {
            let block: Vec<u8> = self.buffer.drain(..end + 2).collect();
            if let Some(event) = parse_block(&String::from_utf8_lossy(&block)) {
                events.push(event);
            }
        }
        events
    }
}

fn parse_block(block: &str) -> Option<SseEvent> {
    let mut event = None;
    let mut data: Vec<&str> = Vec::new();
    for line in block.lines() {
        if line.starts_with(':') {
            continue;
        }
        let (field, value) = line.split_once(':').unwrap_or((line, ""));
        let value = value.strip_prefix(' ').unwrap_or(value);
        match field {
            "event" => event = Some(value.to_string()),
            "data" => data.push(value),
            _ => {}
        }
    }
    if event.is_none() && data.is_empty() {
        return None;
    }
    Some(SseEvent {
        event: event.unwrap_or_else(|| "message".to_string()),
        data: data.join("\n"),
    })
}

#[derive(Debug, Deserialize)]
struct StreamPayload {
    path: String,
    data: JsonValue,
}

/// Effect of one event on a listener's local copy.
#[derive(Debug, PartialEq)]
enum StreamStep {
    Changed,
    Idle,
    Closed(String),
}

fn apply_event(cache: &mut JsonValue, event: &SseEvent) -> TransportResult<StreamStep> {
    match event.event.as_str() {
        "put" => {
            let payload: StreamPayload = serde_json::from_str(&event.data)?;
            write_at(cache, &DbPath::parse(&payload.path)?, Some(payload.data));
            Ok(StreamStep::Changed)
        }
        "patch" => {
            let payload: StreamPayload = serde_json::from_str(&event.data)?;
            let path = DbPath::parse(&payload.path)?;
            match payload.data {
                JsonValue::Object(children) => merge_at(cache, &path, children),
                other => write_at(cache, &path, Some(other)),
            }
            Ok(StreamStep::Changed)
        }
        "keep-alive" => Ok(StreamStep::Idle),
        "cancel" | "auth_revoked" => Ok(StreamStep::Closed(format!(
            "{}: {}",
            event.event, event.data
        ))),
        other => {
            debug!(event = other, "Ignoring unknown stream event");
            Ok(StreamStep::Idle)
        }
    }
}

fn cached_value(cache: &JsonValue) -> Option<JsonValue> {
    match cache {
        JsonValue::Object(map) if map.is_empty() => None,
        JsonValue::Null => None,
        other => Some(read_shape(other)),
    }
}

async fn check_status(response: reqwest::Response) -> TransportResult<reqwest::Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let message = response.text().await.unwrap_or_default();
    Err(TransportError::Server {
        status: status.as_u16(),
        message,
    })
}

// =============================================================================
// Transport
// =============================================================================

struct RestListener {
    path: DbPath,
    callback: ListenerFn,
    task: Option<JoinHandle<()>>,
}

impl RestListener {
    fn stop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

#[derive(Default)]
struct RestState {
    online_requested: bool,
    shut_down: bool,
    connected: bool,
    next_listener: u64,
    listeners: BTreeMap<ListenerId, RestListener>,
    probe: Option<JoinHandle<()>>,
}

struct RestShared {
    app_name: String,
    config: RestConfig,
    http: reqwest::Client,
    flags: Arc<dyn FlagStorage>,
    push_ids: PushIdGenerator,
    runtime: Handle,
    state: Mutex<RestState>,
}

impl RestShared {
    fn wants_connection(&self) -> bool {
        let state = self.state.lock();
        state.online_requested && !state.shut_down
    }

    fn is_listening(&self, id: ListenerId) -> bool {
        self.state.lock().listeners.contains_key(&id)
    }

    fn ensure_usable(&self) -> TransportResult<()> {
        let state = self.state.lock();
        if state.shut_down {
            return Err(TransportError::Shutdown);
        }
        if !state.online_requested {
            return Err(TransportError::Offline);
        }
        Ok(())
    }

    fn set_connected(&self, connected: bool) {
        let callbacks: Vec<ListenerFn> = {
            let mut state = self.state.lock();
            if state.connected == connected {
                return;
            }
            state.connected = connected;
            let info = layout::info_connected();
            state
                .listeners
                .values()
                .filter(|l| l.path == info)
                .map(|l| l.callback.clone())
                .collect()
        };
        info!(app_name = %self.app_name, connected, "Connection state changed");
        for callback in callbacks {
            callback(Some(JsonValue::Bool(connected)));
        }
    }

    async fn open_stream(&self, path: &DbPath) -> TransportResult<reqwest::Response> {
        let response = self
            .http
            .get(self.config.url_for(path)?)
            .header(reqwest::header::ACCEPT, "text/event-stream")
            .send()
            .await?;
        check_status(response).await
    }

    fn spawn_stream(self: &Arc<Self>, id: ListenerId, path: DbPath, callback: ListenerFn) -> JoinHandle<()> {
        self.runtime
            .spawn(run_listener_stream(self.clone(), id, path, callback))
    }

    fn spawn_probe(self: &Arc<Self>) -> JoinHandle<()> {
        self.runtime.spawn(run_probe(self.clone()))
    }
}

async fn run_listener_stream(shared: Arc<RestShared>, id: ListenerId, path: DbPath, callback: ListenerFn) {
    let mut attempt = 0u32;
    let mut last: Option<Option<JsonValue>> = None;

    loop {
        match shared.open_stream(&path).await {
            Ok(response) => {
                attempt = 0;
                let mut cache = JsonValue::Object(Map::new());
                let mut parser = SseParser::default();
                let mut body = response.bytes_stream();
                'events: while let Some(chunk) = body.next().await {
                    let bytes = match chunk {
                        Ok(bytes) => bytes,
                        Err(e) => {
                            warn!(path = %path, error = %e, "Listener stream read failed");
                            break;
                        }
                    };
                    for event in parser.push(&bytes) {
                        match apply_event(&mut cache, &event) {
                            Ok(StreamStep::Changed) => {
                                let current = cached_value(&cache);
                                if last.as_ref() != Some(&current) {
                                    last = Some(current.clone());
                                    callback(current);
                                }
                            }
                            Ok(StreamStep::Idle) => {}
                            Ok(StreamStep::Closed(reason)) => {
                                warn!(path = %path, reason = %reason, "Listener stream closed by server");
                                break 'events;
                            }
                            Err(e) => {
                                warn!(path = %path, error = %e, "Malformed stream event");
                            }
                        }
                    }
                }
            }
            Err(e) => {
                warn!(path = %path, error = %e, "Failed to open listener stream");
            }
        }

        if !shared.is_listening(id) || !shared.wants_connection() {
            return;
        }
        attempt = attempt.saturating_add(1);
        tokio::time::sleep(shared.config.retry_delay(attempt)).await;
    }
}

async fn run_probe(shared: Arc<RestShared>) {
    let path = layout::connection_probe();
    let mut attempt = 0u32;

    loop {
        match shared.open_stream(&path).await {
            Ok(response) => {
                attempt = 0;
                shared.set_connected(true);
                if let Err(e) = shared.flags.delete(&stream_failure_key(&shared.app_name)) {
                    warn!(error = %e, "Failed to clear own failure flag");
                }
                let mut parser = SseParser::default();
                let mut body = response.bytes_stream();
                'events: while let Some(chunk) = body.next().await {
                    let Ok(bytes) = chunk else {
                        break;
                    };
                    for event in parser.push(&bytes) {
                        if matches!(event.event.as_str(), "cancel" | "auth_revoked") {
                            warn!(event = %event.event, "Probe stream closed by server");
                            break 'events;
                        }
                    }
                }
            }
            Err(e) => {
                warn!(app_name = %shared.app_name, error = %e, "Probe stream failed");
            }
        }

        shared.set_connected(false);
        if let Err(e) = record_connection_failure(shared.flags.as_ref(), &shared.app_name) {
            warn!(error = %e, "Failed to record connection failure");
        }
        if !shared.wants_connection() {
            return;
        }
        attempt = attempt.saturating_add(1);
        tokio::time::sleep(shared.config.retry_delay(attempt)).await;
    }
}

/// REST client for one app identity.
pub struct RestTransport {
    shared: Arc<RestShared>,
}

impl RestTransport {
    fn start(&self) {
        if has_connection_failure(self.shared.flags.as_ref()) {
            warn!(
                app_name = %self.shared.app_name,
                "Previous connection failure recorded, not connecting"
            );
            return;
        }
        let mut state = self.shared.state.lock();
        if state.probe.is_none() {
            state.probe = Some(self.shared.spawn_probe());
        }
        let info = layout::info_connected();
        for (id, listener) in state.listeners.iter_mut() {
            if listener.path != info && listener.task.is_none() {
                listener.task = Some(self.shared.spawn_stream(
                    *id,
                    listener.path.clone(),
                    listener.callback.clone(),
                ));
            }
        }
    }

    fn stop_streams(&self) {
        let mut state = self.shared.state.lock();
        if let Some(probe) = state.probe.take() {
            probe.abort();
        }
        for listener in state.listeners.values_mut() {
            listener.stop();
        }
    }

    async fn send(&self, request: reqwest::RequestBuilder) -> TransportResult<reqwest::Response> {
        let response = request.timeout(self.shared.config.request_timeout).send().await?;
        check_status(response).await
    }
}

#[async_trait]
impl Transport for RestTransport {
    fn app_name(&self) -> &str {
        &self.shared.app_name
    }

    async fn get_once(&self, path: &DbPath) -> TransportResult<Option<JsonValue>> {
        path.validate()?;
        if *path == layout::info_connected() {
            return Ok(Some(JsonValue::Bool(self.is_connected())));
        }
        self.shared.ensure_usable()?;
        let url = self.shared.config.url_for(path)?;
        let value: JsonValue = self.send(self.shared.http.get(url)).await?.json().await?;
        Ok(match value {
            JsonValue::Null => None,
            other => Some(read_shape(&other)),
        })
    }

    async fn update(&self, batch: WriteBatch) -> TransportResult<()> {
        self.shared.ensure_usable()?;
        validate_batch(&batch)?;
        let server_ts = json!({".sv": "timestamp"});
        let mut body = Map::new();
        for (path, value) in &batch {
            body.insert(path.to_string(), value.to_wire(&server_ts)?);
        }
        let url = self.shared.config.url_for(&DbPath::root())?;
        self.send(self.shared.http.patch(url).json(&body)).await?;
        Ok(())
    }

    async fn set(&self, path: &DbPath, value: Value) -> TransportResult<()> {
        self.shared.ensure_usable()?;
        validate_write_path(path)?;
        let wire = value.to_wire(&json!({".sv": "timestamp"}))?;
        let url = self.shared.config.url_for(path)?;
        self.send(self.shared.http.put(url).json(&wire)).await?;
        Ok(())
    }

    async fn remove(&self, path: &DbPath) -> TransportResult<()> {
        self.shared.ensure_usable()?;
        validate_write_path(path)?;
        let url = self.shared.config.url_for(path)?;
        self.send(self.shared.http.delete(url)).await?;
        Ok(())
    }

    fn push_key(&self) -> String {
        self.shared.push_ids.generate()
    }

    fn listen(&self, path: &DbPath, listener: ListenerFn) -> ListenerId {
        let (id, initial) = {
            let mut state = self.shared.state.lock();
            let id = ListenerId(state.next_listener);
            state.next_listener += 1;

            let mut initial = None;
            let mut task = None;
            if *path == layout::info_connected() {
                initial = Some(state.connected);
            } else if path.validate().is_err() {
                warn!(path = %path, "Listener on invalid path will never fire");
            } else if state.probe.is_some() {
                task = Some(self.shared.spawn_stream(id, path.clone(), listener.clone()));
            }
            state.listeners.insert(
                id,
                RestListener {
                    path: path.clone(),
                    callback: listener.clone(),
                    task,
                },
            );
            (id, initial)
        };
        if let Some(connected) = initial {
            listener(Some(JsonValue::Bool(connected)));
        }
        id
    }

    fn unlisten(&self, id: ListenerId) -> bool {
        let removed = self.shared.state.lock().listeners.remove(&id);
        match removed {
            Some(mut listener) => {
                listener.stop();
                true
            }
            None => false,
        }
    }

    fn off_path(&self, path: &DbPath) -> usize {
        let removed: Vec<RestListener> = {
            let mut state = self.shared.state.lock();
            let ids: Vec<ListenerId> = state
                .listeners
                .iter()
                .filter(|(_, l)| l.path == *path)
                .map(|(id, _)| *id)
                .collect();
            ids.iter()
                .filter_map(|id| state.listeners.remove(id))
                .collect()
        };
        let count = removed.len();
        for mut listener in removed {
            listener.stop();
        }
        count
    }

    async fn on_disconnect_remove(&self, _path: &DbPath) -> TransportResult<()> {
        Err(TransportError::Unsupported("on-disconnect hooks over REST"))
    }

    fn go_offline(&self) {
        self.shared.state.lock().online_requested = false;
        self.stop_streams();
        self.shared.set_connected(false);
        debug!(app_name = %self.shared.app_name, "Went offline");
    }

    fn go_online(&self) {
        {
            let mut state = self.shared.state.lock();
            if state.shut_down {
                return;
            }
            state.online_requested = true;
        }
        self.start();
    }

    fn is_connected(&self) -> bool {
        self.shared.state.lock().connected
    }

    fn listener_count(&self) -> usize {
        self.shared.state.lock().listeners.len()
    }

    fn shutdown(&self) {
        let listeners = {
            let mut state = self.shared.state.lock();
            if state.shut_down {
                return;
            }
            state.shut_down = true;
            state.online_requested = false;
            if let Some(probe) = state.probe.take() {
                probe.abort();
            }
            std::mem::take(&mut state.listeners)
        };
        for mut listener in listeners.into_values() {
            listener.stop();
        }
        self.shared.state.lock().connected = false;
        info!(app_name = %self.shared.app_name, "REST client shut down");
    }
}

impl Drop for RestTransport {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Builds [`RestTransport`] clients. Identities are never reused.
pub struct RestTransportFactory {
    config: RestConfig,
    flags: Arc<dyn FlagStorage>,
    http: reqwest::Client,
    registered: Mutex<BTreeSet<String>>,
}

impl RestTransportFactory {
    pub fn new(config: RestConfig, flags: Arc<dyn FlagStorage>) -> TransportResult<Self> {
        let http = reqwest::Client::builder()
            .user_agent(concat!("frontdesk-sync/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self {
            config,
            flags,
            http,
            registered: Mutex::new(BTreeSet::new()),
        })
    }
}

#[async_trait]
impl TransportFactory for RestTransportFactory {
    async fn connect(&self, app_name: &str) -> TransportResult<Arc<dyn Transport>> {
        if !self.registered.lock().insert(app_name.to_string()) {
            return Err(TransportError::DuplicateApp(app_name.to_string()));
        }
        let runtime = Handle::try_current()
            .map_err(|_| TransportError::Unsupported("REST transport outside a tokio runtime"))?;

        let transport = RestTransport {
            shared: Arc::new(RestShared {
                app_name: app_name.to_string(),
                config: self.config.clone(),
                http: self.http.clone(),
                flags: self.flags.clone(),
                push_ids: PushIdGenerator::new(),
                runtime,
                state: Mutex::new(RestState {
                    online_requested: true,
                    ..Default::default()
                }),
            }),
        };
        transport.start();
        info!(app_name, base_url = %self.config.base_url, "REST client created");
        Ok(Arc::new(transport))
    }
}
