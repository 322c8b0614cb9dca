//! Realtime telemetry over the vendor's push backend.
//!
//! The cloud streams device state changes into a per-device document; this
//! module exchanges the listener session token for stream credentials, opens
//! a server-streamed watch on that document, and forwards every pushed
//! snapshot to a caller-supplied callback. Streaming telemetry is costly on
//! the service side, so listeners must not be started and stopped on a whim.

use reqwest::{header, StatusCode};
use serde::Deserialize;
use serde_json::{Map, Value};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, instrument, warn};

use crate::client::Flo;
use crate::config::PushConfig;
use crate::error::Error;
use crate::heartbeat::Heartbeat;
use crate::util::uri::make_uri;

/// Pause before re-opening a watch stream that ended or failed, so a
/// flapping stream cannot hammer the backend.
const RECONNECT_DELAY: Duration = Duration::from_secs(2);

/// Snapshot delivery callback: receives the full field mapping of the device
/// state document on every change notification, uninterpreted.
pub type SnapshotCallback = Box<dyn Fn(Map<String, Value>) + Send + Sync>;

#[derive(Debug, Deserialize)]
struct TokenExchangeResponse {
    #[serde(rename = "idToken")]
    id_token: Option<String>,
    // refreshToken: also returned, but snapshots stop flowing long before
    // the id token expires, so we never refresh it.
}

/// Transient credentials for the push backend.
#[derive(Clone, Debug)]
pub(crate) struct StreamCredentials {
    pub id_token: String,
}

/// Exchange the listener session token for stream credentials against the
/// identity endpoint.
#[instrument(skip_all)]
pub(crate) async fn exchange_token(
    http: &reqwest::Client,
    push: &PushConfig,
    token: &str,
) -> Result<StreamCredentials, Error> {
    let endpoint = make_uri(
        &push.identity_endpoint,
        "/verifyCustomToken",
        Some(&format!("key={}", push.api_key)),
    )?;

    let response = http
        .post(endpoint.to_string())
        .header(header::CONTENT_TYPE, "application/json; charset=UTF-8")
        .json(&serde_json::json!({ "returnSecureToken": true, "token": token }))
        .send()
        .await?;

    let body = response.text().await?;
    let exchange: TokenExchangeResponse = serde_json::from_str(&body)?;
    let id_token = exchange.id_token.ok_or(Error::MissingField("idToken"))?;
    debug!("token exchange complete");

    Ok(StreamCredentials { id_token })
}

/// Stateful subscription delivering push notifications for one device.
///
/// Created by [`Flo::realtime_listener`]; starts in the stopped state. Both
/// [`start`](Self::start) and [`stop`](Self::stop) are idempotent.
pub struct Listener {
    flo: Flo,
    token: String,
    device: String,
    callback: Arc<RwLock<SnapshotCallback>>,
    heartbeat_enabled: bool,
    watch: Option<Watch>,
    heartbeat: Option<Heartbeat>,
}

struct Watch {
    shutdown_tx: broadcast::Sender<()>,
    task: JoinHandle<()>,
}

impl Listener {
    pub(crate) fn new(
        flo: Flo,
        token: String,
        device: String,
        callback: SnapshotCallback,
        heartbeat: bool,
    ) -> Self {
        Self {
            flo,
            token,
            device,
            callback: Arc::new(RwLock::new(callback)),
            heartbeat_enabled: heartbeat,
            watch: None,
            heartbeat: None,
        }
    }

    /// Swap the delivery callback. Takes effect for snapshots decoded after
    /// the swap.
    pub fn set_callback(&self, callback: impl Fn(Map<String, Value>) + Send + Sync + 'static) {
        *self
            .callback
            .write()
            .expect("snapshot callback lock poisoned") = Box::new(callback);
    }

    /// Begin listening. A no-op if already started.
    ///
    /// Issues one presence keepalive up front (so the first snapshot carries
    /// fresh data even when the periodic heartbeat is disabled), exchanges
    /// the session token for stream credentials, opens the document watch,
    /// and starts the heartbeat if one was requested.
    #[instrument(skip_all, fields(device = %self.device))]
    pub async fn start(&mut self) -> Result<(), Error> {
        if self.watch.is_some() {
            return Ok(());
        }

        // The initial keepalive completes before the watch opens; that is
        // the only ordering guarantee between the two.
        self.flo.presence_heartbeat().await?;

        let http = self.flo.http().clone();
        let push = self.flo.push_config();
        let credentials = exchange_token(&http, push, &self.token).await?;

        let endpoint = watch_uri(push, &self.device)?;
        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let task = tokio::spawn(watch_task(
            http,
            endpoint,
            credentials,
            Arc::clone(&self.callback),
            shutdown_rx,
        ));
        self.watch = Some(Watch { shutdown_tx, task });

        if self.heartbeat_enabled {
            let flo = self.flo.clone();
            self.heartbeat = Some(Heartbeat::start(flo.heartbeat_interval(), move || {
                let flo = flo.clone();
                async move { flo.presence_heartbeat().await.map(|_| ()) }
            }));
        }

        debug!("listener started");
        Ok(())
    }

    /// Shut down the watch and the heartbeat, if started. A no-op otherwise.
    pub fn stop(&mut self) {
        let Some(watch) = self.watch.take() else {
            return;
        };

        let _ = watch.shutdown_tx.send(());
        watch.task.abort();
        if let Some(heartbeat) = self.heartbeat.take() {
            heartbeat.cancel();
        }
        debug!(device = %self.device, "listener stopped");
    }
}

impl Drop for Listener {
    fn drop(&mut self) {
        self.stop();
    }
}

fn watch_uri(push: &PushConfig, device: &str) -> Result<String, Error> {
    let path = format!(
        "/v1/projects/{}/databases/(default)/documents/devices/{device}",
        push.project
    );
    Ok(make_uri(&push.listen_endpoint, &path, None)?.to_string())
}

async fn watch_task(
    http: reqwest::Client,
    endpoint: String,
    credentials: StreamCredentials,
    callback: Arc<RwLock<SnapshotCallback>>,
    mut shutdown_rx: broadcast::Receiver<()>,
) {
    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => break,
            result = watch_once(&http, &endpoint, &credentials, &callback) => {
                match result {
                    Ok(()) => debug!("watch stream ended, reconnecting"),
                    Err(e) => warn!("watch stream failed: {e}"),
                }
                tokio::select! {
                    _ = shutdown_rx.recv() => break,
                    _ = tokio::time::sleep(RECONNECT_DELAY) => {}
                }
            }
        }
    }
    debug!("watch stopped");
}

/// Open the document watch and pump snapshots to the callback until the
/// stream ends.
async fn watch_once(
    http: &reqwest::Client,
    endpoint: &str,
    credentials: &StreamCredentials,
    callback: &Arc<RwLock<SnapshotCallback>>,
) -> Result<(), Error> {
    let mut response = http
        .get(endpoint)
        .bearer_auth(&credentials.id_token)
        .header(header::ACCEPT, "text/event-stream")
        .send()
        .await?;

    let status = response.status();
    if status != StatusCode::OK {
        warn!(status = status.as_u16(), "watch rejected");
        return Ok(());
    }

    let mut decoder = EventDecoder::default();
    while let Some(chunk) = response.chunk().await? {
        for payload in decoder.feed(&chunk) {
            match serde_json::from_str::<Value>(&payload) {
                Ok(event) => match snapshot_fields(event) {
                    Some(fields) => {
                        let deliver = callback.read().expect("snapshot callback lock poisoned");
                        (*deliver)(fields);
                    }
                    None => debug!("ignoring non-snapshot event"),
                },
                Err(e) => warn!("undecodable snapshot payload: {e}"),
            }
        }
    }

    Ok(())
}

/// Pull the field mapping out of a pushed event. Snapshots arrive either as
/// the bare state document or wrapped in a `document` envelope; either way
/// the mapping is forwarded untouched.
fn snapshot_fields(event: Value) -> Option<Map<String, Value>> {
    match event {
        Value::Object(mut map) => match map.remove("document") {
            Some(Value::Object(fields)) => Some(fields),
            Some(_) => None,
            None => Some(map),
        },
        _ => None,
    }
}

/// Incremental decoder for event-stream framing. Only `data:` lines carry
/// snapshots; comments and other fields are skipped. An empty line ends the
/// event.
#[derive(Default)]
struct EventDecoder {
    buffer: String,
    data: Vec<String>,
}

impl EventDecoder {
    fn feed(&mut self, chunk: &[u8]) -> Vec<String> {
        self.buffer.push_str(&String::from_utf8_lossy(chunk));

        let mut events = Vec::new();
        while let Some(pos) = self.buffer.find('\n') {
            let line: String = self.buffer.drain(..=pos).collect();
            let line = line.trim_end_matches(['\r', '\n']);

            if line.is_empty() {
                if !self.data.is_empty() {
                    events.push(self.data.join("\n"));
                    self.data.clear();
                }
            } else if let Some(data) = line.strip_prefix("data:") {
                self.data
                    .push(data.strip_prefix(' ').unwrap_or(data).to_owned());
            }
        }
        events
    }
}
