use chrono::{DateTime, Local, Utc};
use serde_json::{json, Map, Value};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, instrument, warn};

use crate::config::{Config, PushConfig};
use crate::error::Error;
use crate::request::{Executor, Request};
use crate::session::SessionManager;
use crate::stream::Listener;
use crate::util::uri::make_uri;

/// Timestamp format the consumption endpoint requires.
const CONSUMPTION_TIME_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.3fZ";

/// Aggregation interval for consumption queries.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Interval {
    #[default]
    Hourly,
    Daily,
    Monthly,
}

impl Interval {
    fn as_str(&self) -> &'static str {
        match self {
            Interval::Hourly => "1h",
            Interval::Daily => "1d",
            Interval::Monthly => "1m",
        }
    }
}

impl fmt::Display for Interval {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Target system mode for a location. The service rejects anything else, so
/// anything else is unrepresentable here.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SystemMode {
    Home,
    Away,
    Sleep,
}

impl SystemMode {
    fn as_str(&self) -> &'static str {
        match self {
            SystemMode::Home => "home",
            SystemMode::Away => "away",
            SystemMode::Sleep => "sleep",
        }
    }
}

impl fmt::Display for SystemMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Date range and granularity for [`Flo::consumption`]. Unset bounds default
/// to the current local day, mirroring how the vendor's own dashboard
/// queries today's usage.
#[derive(Clone, Debug, Default)]
pub struct ConsumptionQuery {
    pub start: Option<DateTime<Local>>,
    pub end: Option<DateTime<Local>>,
    pub interval: Interval,
}

#[derive(Default)]
struct Cache {
    account: Option<Value>,
    locations: HashMap<String, Value>,
}

struct Inner {
    http: reqwest::Client,
    config: Config,
    session: Arc<SessionManager>,
    executor: Executor,
    cache: Mutex<Cache>,
}

/// Asynchronous client for the Flo cloud API.
///
/// Cheap to clone; clones share the session, the cache, and the underlying
/// connection pool. All data calls resolve to `Ok(None)` when the service
/// never produced an HTTP 200 within the retry budget, so check for data
/// before indexing into it.
///
/// # Example
/// ```rust,ignore
/// let flo = Flo::new("user@example.com");
/// flo.login("password").await?;
///
/// if let Some(locations) = flo.locations(false).await? {
///     println!("{locations:#}");
/// }
/// ```
#[derive(Clone)]
pub struct Flo {
    inner: Arc<Inner>,
}

impl Flo {
    /// Create a client with the production endpoints. Does not authenticate;
    /// call [`login`](Self::login).
    pub fn new(username: impl Into<String>) -> Self {
        Self::with_config(username, Config::default())
    }

    pub fn with_config(username: impl Into<String>, config: Config) -> Self {
        let http = reqwest::Client::new();
        let session = Arc::new(SessionManager::new(http.clone(), &config, username));
        let executor = Executor::new(http.clone(), Arc::clone(&session), &config);
        Self {
            inner: Arc::new(Inner {
                http,
                config,
                session,
                executor,
                cache: Mutex::new(Cache::default()),
            }),
        }
    }

    /// Authenticate with the given secret. A rejected login is soft: it is
    /// logged and the client simply stays disconnected.
    pub async fn login(&self, secret: &str) -> Result<(), Error> {
        self.inner.session.login(secret).await
    }

    /// Opt in to credential retention so lapsed sessions re-authenticate
    /// automatically on the next call. Off by default.
    pub async fn save_secret(&self, secret: impl Into<String>) {
        self.inner.session.save_secret(secret).await;
    }

    pub async fn is_connected(&self) -> bool {
        self.inner.session.is_connected().await
    }

    pub async fn user_id(&self) -> Option<String> {
        self.inner.session.user_id().await
    }

    /// Perform one raw API call. All the typed operations below funnel
    /// through this; it is public as an escape hatch for endpoints the crate
    /// does not wrap.
    pub async fn query(&self, request: Request) -> Result<Option<Value>, Error> {
        self.inner.executor.execute(request).await
    }

    fn v2_uri(&self, path: &str, query: Option<&str>) -> Result<String, Error> {
        Ok(make_uri(&self.inner.config.api_base, path, query)?.to_string())
    }

    /// The user document with locations expanded, cached after the first
    /// fetch.
    pub async fn account(&self, refresh: bool) -> Result<Option<Value>, Error> {
        if !refresh {
            if let Some(account) = &self.inner.cache.lock().await.account {
                return Ok(Some(account.clone()));
            }
        }

        let Some(user_id) = self.ensure_user_id().await? else {
            warn!("cannot fetch account data without an authenticated session");
            return Ok(None);
        };

        let url = self.v2_uri(&format!("/users/{user_id}"), Some("expand=locations"))?;
        let data = self.query(Request::get(url)).await?;
        if let Some(data) = &data {
            self.inner.cache.lock().await.account = Some(data.clone());
        }
        Ok(data)
    }

    async fn ensure_user_id(&self) -> Result<Option<String>, Error> {
        if !self.is_connected().await {
            self.inner.session.relogin().await?;
        }
        Ok(self.user_id().await)
    }

    /// All locations registered with the account.
    pub async fn locations(&self, refresh: bool) -> Result<Option<Value>, Error> {
        Ok(self
            .account(refresh)
            .await?
            .and_then(|account| account.get("locations").cloned()))
    }

    /// One location with its devices expanded, cached per id.
    pub async fn location(&self, location_id: &str, refresh: bool) -> Result<Option<Value>, Error> {
        if !refresh {
            if let Some(location) = self.inner.cache.lock().await.locations.get(location_id) {
                return Ok(Some(location.clone()));
            }
        }

        let url = self.v2_uri(&format!("/locations/{location_id}"), Some("expand=devices"))?;
        match self.query(Request::get(url.clone())).await? {
            Some(data) => {
                self.inner
                    .cache
                    .lock()
                    .await
                    .locations
                    .insert(location_id.to_owned(), data.clone());
                Ok(Some(data))
            }
            None => {
                warn!("failed to load data from {url}");
                Ok(None)
            }
        }
    }

    /// Current device document. Uncached: telemetry changes constantly.
    pub async fn device(&self, device_id: &str) -> Result<Option<Value>, Error> {
        let url = self.v2_uri(&format!("/devices/{device_id}"), None)?;
        self.query(Request::get(url)).await
    }

    /// The device's target system mode.
    pub async fn preset_mode(&self, device_id: &str) -> Result<Option<Value>, Error> {
        Ok(self
            .device(device_id)
            .await?
            .and_then(|device| device.pointer("/systemMode/target").cloned()))
    }

    /// The device's latest telemetry sample.
    pub async fn telemetry(&self, device_id: &str) -> Result<Option<Value>, Error> {
        Ok(self
            .device(device_id)
            .await?
            .and_then(|device| device.pointer("/telemetry/current").cloned()))
    }

    /// The last known valve state.
    pub async fn valve_status(&self, device_id: &str) -> Result<Option<Value>, Error> {
        Ok(self
            .device(device_id)
            .await?
            .and_then(|device| device.pointer("/valve/lastKnown").cloned()))
    }

    pub async fn open_valve(&self, device_id: &str) -> Result<Option<Value>, Error> {
        debug!("opening valve for device {device_id}");
        self.set_valve(device_id, "open").await
    }

    pub async fn close_valve(&self, device_id: &str) -> Result<Option<Value>, Error> {
        debug!("closing valve for device {device_id}");
        self.set_valve(device_id, "closed").await
    }

    async fn set_valve(&self, device_id: &str, target: &str) -> Result<Option<Value>, Error> {
        let url = self.v2_uri(&format!("/devices/{device_id}"), None)?;
        self.query(Request::post(url).with_param("valve", json!({ "target": target })))
            .await
    }

    /// Change a location's system mode. Sleep carries the revert defaults
    /// the vendor app uses (8 hours, then back to home); `extra` parameters
    /// override them on collision.
    pub async fn set_mode(
        &self,
        location_id: &str,
        mode: SystemMode,
        extra: Option<Map<String, Value>>,
    ) -> Result<Option<Value>, Error> {
        let url = self.v2_uri(&format!("/locations/{location_id}/systemMode"), None)?;

        let mut params = Map::new();
        params.insert("target".to_owned(), json!(mode.as_str()));
        if mode == SystemMode::Sleep {
            params.insert("revertMinutes".to_owned(), json!(480));
            params.insert("revertMode".to_owned(), json!("home"));
        }
        if let Some(extra) = extra {
            params.extend(extra);
        }

        self.query(Request::post(url).with_params(params)).await
    }

    /// Run the plumbing health test on a device.
    pub async fn run_health_test(&self, device_id: &str) -> Result<Option<Value>, Error> {
        let url = self.v2_uri(&format!("/devices/{device_id}/healthTest/run"), None)?;
        self.query(Request::post(url)).await
    }

    /// The account-wide alarm catalog.
    pub async fn alarms(&self) -> Result<Option<Value>, Error> {
        let url = self.v2_uri("/alarms", None)?;
        self.query(Request::get(url)).await
    }

    /// Triggered critical alerts for a location.
    pub async fn alerts(&self, location_id: &str) -> Result<Option<Value>, Error> {
        let url = self.v2_uri("/alerts", None)?;
        self.query(
            Request::get(url)
                .with_param("isInternalAlarm", "false")
                .with_param("locationId", location_id)
                .with_param("status", "triggered")
                .with_param("severity", "critical")
                .with_param("page", 1)
                .with_param("size", 100),
        )
        .await
    }

    /// Water consumption for a device over the query's date range.
    #[instrument(skip_all, fields(device = device_id))]
    pub async fn consumption(
        &self,
        device_id: &str,
        query: ConsumptionQuery,
    ) -> Result<Option<Value>, Error> {
        let (location_id, mac_address) = self.locate_device(device_id).await?;

        // Unset bounds cover the current local day, converted to UTC the way
        // the service expects.
        let now = Local::now();
        let start = query.start.unwrap_or_else(|| local_day_bound(now, 0, 0, 0));
        let end = query.end.unwrap_or_else(|| local_day_bound(now, 23, 59, 59));

        let url = self.v2_uri("/water/consumption", None)?;
        self.query(
            Request::get(url)
                .with_param("locationId", location_id)
                .with_param("macAddress", mac_address)
                .with_param("startDate", format_timestamp(start))
                .with_param("endDate", format_timestamp(end))
                .with_param("interval", query.interval.as_str()),
        )
        .await
    }

    /// The presence keepalive sustaining server-side telemetry streaming.
    pub async fn presence_heartbeat(&self) -> Result<Option<Value>, Error> {
        let url = self.v2_uri("/presence/me", None)?;
        self.query(Request::post(url)).await
    }

    /// Drop the cached account/location data. The next lookup refetches.
    pub async fn clear_cache(&self) {
        *self.inner.cache.lock().await = Cache::default();
    }

    /// Find the location id and MAC address for a device id in the account
    /// data. An unknown id is a caller error, not a transient condition.
    pub(crate) async fn locate_device(&self, device_id: &str) -> Result<(String, String), Error> {
        let Some(locations) = self.locations(false).await? else {
            return Err(Error::NoData("account locations".to_owned()));
        };

        for location in locations.as_array().into_iter().flatten() {
            for device in location
                .get("devices")
                .and_then(Value::as_array)
                .into_iter()
                .flatten()
            {
                if device.get("id").and_then(Value::as_str) == Some(device_id) {
                    let location_id = location
                        .get("id")
                        .and_then(Value::as_str)
                        .ok_or(Error::MissingField("location.id"))?;
                    let mac_address = device
                        .get("macAddress")
                        .and_then(Value::as_str)
                        .ok_or(Error::MissingField("device.macAddress"))?;
                    return Ok((location_id.to_owned(), mac_address.to_owned()));
                }
            }
        }

        Err(Error::UnknownDevice(device_id.to_owned()))
    }

    /// Build a realtime listener for a device.
    ///
    /// The returned [`Listener`] is stopped; call [`Listener::start`] to
    /// begin receiving snapshots. With `heartbeat` enabled the listener
    /// keeps the server-side stream alive on the configured interval — that
    /// streaming is costly for the service, so don't run listeners you are
    /// not consuming.
    #[instrument(skip_all, fields(device = device_id))]
    pub async fn realtime_listener(
        &self,
        device_id: &str,
        callback: impl Fn(Map<String, Value>) + Send + Sync + 'static,
        heartbeat: bool,
    ) -> Result<Listener, Error> {
        let (_location_id, mac_address) = self.locate_device(device_id).await?;

        let url = self.v2_uri("/session/firestore", None)?;
        // The session endpoint is flaky enough to deserve a couple of quick
        // extra tries before giving up.
        let mut data = None;
        for attempt in 0..3 {
            if attempt > 0 {
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
            data = self.query(Request::post(url.clone())).await?;
            if data.is_some() {
                break;
            }
        }
        let data = data.ok_or_else(|| Error::NoData(url))?;

        let token = data
            .get("token")
            .and_then(Value::as_str)
            .ok_or(Error::MissingField("token"))?
            .to_owned();

        Ok(Listener::new(
            self.clone(),
            token,
            mac_address,
            Box::new(callback),
            heartbeat,
        ))
    }

    pub(crate) fn http(&self) -> &reqwest::Client {
        &self.inner.http
    }

    pub(crate) fn push_config(&self) -> &PushConfig {
        &self.inner.config.push
    }

    pub(crate) fn heartbeat_interval(&self) -> Duration {
        self.inner.config.request.heartbeat_interval
    }
}

fn local_day_bound(now: DateTime<Local>, hour: u32, min: u32, sec: u32) -> DateTime<Local> {
    now.date_naive()
        .and_hms_opt(hour, min, sec)
        .and_then(|t| t.and_local_timezone(Local).earliest())
        .unwrap_or(now)
}

fn format_timestamp(instant: DateTime<Local>) -> String {
    instant
        .with_timezone(&Utc)
        .format(CONSUMPTION_TIME_FORMAT)
        .to_string()
}
