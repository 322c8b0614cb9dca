use reqwest::header::{self, HeaderMap, HeaderName, HeaderValue};
use reqwest::StatusCode;
use serde_json::{Map, Value};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, field, instrument, warn, Span};

use crate::config::Config;
use crate::error::Error;
use crate::session::SessionManager;

/// HTTP methods accepted by the API surface. Anything else is not
/// representable, so "unsupported method" cannot happen at runtime.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Method {
    Get,
    Post,
    Put,
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Method::Get => "GET",
            Method::Post => "POST",
            Method::Put => "PUT",
        };
        f.write_str(name)
    }
}

/// Descriptor for one logical API call.
///
/// Parameters are sent as the query string for GET and as a JSON body for
/// POST/PUT. Extra headers override the base header set on name collision.
/// The retry budget and force-login flag fall back to the configured
/// defaults unless overridden per call.
///
/// # Example
/// ```rust,ignore
/// let request = Request::get("https://api-gw.meetflo.com/api/v2/alerts")
///     .with_param("locationId", "loc-1")
///     .with_retry(1);
/// let alerts = flo.query(request).await?;
/// ```
#[derive(Clone, Debug)]
pub struct Request {
    url: String,
    method: Method,
    params: Map<String, Value>,
    headers: Vec<(String, String)>,
    retry: Option<u32>,
    force_login: Option<bool>,
}

impl Request {
    fn new(url: impl Into<String>, method: Method) -> Self {
        Self {
            url: url.into(),
            method,
            params: Map::new(),
            headers: Vec::new(),
            retry: None,
            force_login: None,
        }
    }

    pub fn get(url: impl Into<String>) -> Self {
        Self::new(url, Method::Get)
    }

    pub fn post(url: impl Into<String>) -> Self {
        Self::new(url, Method::Post)
    }

    pub fn put(url: impl Into<String>) -> Self {
        Self::new(url, Method::Put)
    }

    pub fn method(&self) -> Method {
        self.method
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn with_param(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.params.insert(key.into(), value.into());
        self
    }

    pub fn with_params(mut self, params: Map<String, Value>) -> Self {
        self.params.extend(params);
        self
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    /// Override the configured retry budget; `retry` additional attempts
    /// after the first. Zero means exactly one attempt.
    pub fn with_retry(mut self, retry: u32) -> Self {
        self.retry = Some(retry);
        self
    }

    /// Do not attempt re-authentication up front even if the session lapsed.
    pub fn without_login(mut self) -> Self {
        self.force_login = Some(false);
        self
    }
}

/// Performs logical API calls: auth-header injection, forced re-login, and
/// bounded retry around the HTTP transport.
pub(crate) struct Executor {
    http: reqwest::Client,
    session: Arc<SessionManager>,
    user_agent: String,
    timeout: Duration,
    default_retry: u32,
    default_force_login: bool,
}

impl Executor {
    pub fn new(http: reqwest::Client, session: Arc<SessionManager>, config: &Config) -> Self {
        Self {
            http,
            session,
            user_agent: config.user_agent.clone(),
            timeout: config.request.timeout,
            default_retry: config.request.retry,
            default_force_login: config.request.force_login,
        }
    }

    /// Perform one logical API call.
    ///
    /// Makes up to `retry + 1` attempts; the first HTTP 200 short-circuits
    /// and returns the parsed body. Any other status is logged and retried
    /// immediately with the same descriptor. An exhausted budget resolves to
    /// `Ok(None)` — absence, not an error — so callers must check for data
    /// before indexing into it. A malformed body on a 200 and network-level
    /// transport failures are hard errors and are not retried.
    #[instrument(skip_all, fields(method = %request.method, url = %request.url, tries = field::Empty))]
    pub async fn execute(&self, request: Request) -> Result<Option<Value>, Error> {
        let force_login = request.force_login.unwrap_or(self.default_force_login);
        if force_login && !self.session.is_connected().await {
            // Once per call, never between attempts.
            self.session.relogin().await?;
        }

        let retry = request.retry.unwrap_or(self.default_retry);
        let mut tries = 0;
        while tries <= retry {
            tries += 1;

            // Headers are rebuilt from the current token on every attempt; a
            // stale header set must never outlive the token it carried.
            let token = self.session.auth_token().await;
            let headers = self.build_headers(token.as_deref(), &request.headers);

            let mut builder = match request.method {
                Method::Get => self.http.get(&request.url),
                Method::Post => self.http.post(&request.url),
                Method::Put => self.http.put(&request.url),
            };
            builder = builder.timeout(self.timeout).headers(headers);
            builder = match request.method {
                Method::Get if !request.params.is_empty() => builder.query(&request.params),
                Method::Get => builder,
                Method::Post | Method::Put => builder.json(&request.params),
            };

            debug!("attempt {tries}/{}", retry + 1);
            let response = builder.send().await?;
            let status = response.status();

            if status == StatusCode::OK {
                Span::current().record("tries", tries);
                let body = response.text().await?;
                let value: Value = serde_json::from_str(&body)?;
                return Ok(Some(value));
            }

            debug!(
                status = status.as_u16(),
                "attempt {tries}/{} failed",
                retry + 1
            );
        }

        warn!("no result after {} attempts", retry + 1);
        Ok(None)
    }

    /// The base header set plus the current token, with descriptor headers
    /// replacing base entries on name collision.
    fn build_headers(&self, token: Option<&str>, extra: &[(String, String)]) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(
            header::CONTENT_TYPE,
            HeaderValue::from_static("application/json;charset=UTF-8"),
        );
        headers.insert(header::ACCEPT, HeaderValue::from_static("application/json"));
        if let Ok(agent) = HeaderValue::try_from(self.user_agent.as_str()) {
            headers.insert(header::USER_AGENT, agent);
        }
        if let Some(token) = token {
            match HeaderValue::try_from(token) {
                Ok(value) => {
                    headers.insert(header::AUTHORIZATION, value);
                }
                Err(_) => warn!("auth token is not a valid header value"),
            }
        }

        for (name, value) in extra {
            match (
                HeaderName::try_from(name.as_str()),
                HeaderValue::try_from(value.as_str()),
            ) {
                (Ok(name), Ok(value)) => {
                    headers.insert(name, value);
                }
                _ => warn!("ignoring invalid header {name}"),
            }
        }
        headers
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use mockito::{Matcher, Server};
    use serde_json::json;

    fn test_executor(server: &Server) -> Executor {
        let config = Config {
            api_base: server.url().parse().unwrap(),
            auth_endpoint: format!("{}/users/auth", server.url()).parse().unwrap(),
            ..Config::default()
        };
        let http = reqwest::Client::new();
        let session = Arc::new(SessionManager::new(http.clone(), &config, "user@example.com"));
        Executor::new(http, session, &config)
    }

    #[tokio::test]
    async fn returns_body_on_first_success() {
        let mut server = Server::new_async().await;
        let mock = server
            .mock("GET", "/devices/d1")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"valve": {"lastKnown": "open"}}"#)
            .create_async()
            .await;

        let executor = test_executor(&server);
        let result = executor
            .execute(Request::get(format!("{}/devices/d1", server.url())).without_login())
            .await
            .unwrap();

        assert_eq!(result, Some(json!({"valve": {"lastKnown": "open"}})));
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn retries_until_success() {
        let mut server = Server::new_async().await;

        // Three failures, then the real body on the fourth attempt.
        let failures = server
            .mock("GET", "/devices/d1")
            .with_status(503)
            .expect(3)
            .create_async()
            .await;
        let success = server
            .mock("GET", "/devices/d1")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"attempt": 4}"#)
            .create_async()
            .await;

        let executor = test_executor(&server);
        let result = executor
            .execute(
                Request::get(format!("{}/devices/d1", server.url()))
                    .with_retry(3)
                    .without_login(),
            )
            .await
            .unwrap();

        assert_eq!(result, Some(json!({"attempt": 4})));
        failures.assert_async().await;
        success.assert_async().await;
    }

    #[tokio::test]
    async fn exhausted_budget_resolves_to_absence() {
        let mut server = Server::new_async().await;
        let mock = server
            .mock("GET", "/devices/d1")
            .with_status(503)
            .expect(4)
            .create_async()
            .await;

        let executor = test_executor(&server);
        let result = executor
            .execute(
                Request::get(format!("{}/devices/d1", server.url()))
                    .with_retry(3)
                    .without_login(),
            )
            .await
            .unwrap();

        assert_eq!(result, None);
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn zero_retry_makes_exactly_one_attempt() {
        let mut server = Server::new_async().await;
        let mock = server
            .mock("GET", "/devices/d1")
            .with_status(500)
            .expect(1)
            .create_async()
            .await;

        let executor = test_executor(&server);
        let result = executor
            .execute(
                Request::get(format!("{}/devices/d1", server.url()))
                    .with_retry(0)
                    .without_login(),
            )
            .await
            .unwrap();

        assert_eq!(result, None);
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn malformed_body_on_success_is_a_hard_error() {
        let mut server = Server::new_async().await;
        let mock = server
            .mock("GET", "/devices/d1")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body("not json")
            .expect(1) // never retried
            .create_async()
            .await;

        let executor = test_executor(&server);
        let result = executor
            .execute(
                Request::get(format!("{}/devices/d1", server.url()))
                    .with_retry(3)
                    .without_login(),
            )
            .await;

        assert!(matches!(result, Err(Error::Decode(_))));
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn get_sends_params_as_query() {
        let mut server = Server::new_async().await;
        let mock = server
            .mock("GET", "/alerts")
            .match_query(Matcher::AllOf(vec![
                Matcher::UrlEncoded("locationId".into(), "loc-1".into()),
                Matcher::UrlEncoded("status".into(), "triggered".into()),
            ]))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body("[]")
            .create_async()
            .await;

        let executor = test_executor(&server);
        let result = executor
            .execute(
                Request::get(format!("{}/alerts", server.url()))
                    .with_param("locationId", "loc-1")
                    .with_param("status", "triggered")
                    .without_login(),
            )
            .await
            .unwrap();

        assert_eq!(result, Some(json!([])));
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn post_sends_params_as_json_body() {
        let mut server = Server::new_async().await;
        let mock = server
            .mock("POST", "/devices/d1")
            .match_body(Matcher::Json(json!({"valve": {"target": "open"}})))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body("{}")
            .create_async()
            .await;

        let executor = test_executor(&server);
        executor
            .execute(
                Request::post(format!("{}/devices/d1", server.url()))
                    .with_param("valve", json!({"target": "open"}))
                    .without_login(),
            )
            .await
            .unwrap();

        mock.assert_async().await;
    }

    #[tokio::test]
    async fn extra_headers_override_base_headers() {
        let mut server = Server::new_async().await;
        let mock = server
            .mock("GET", "/ping")
            .match_header("accept", "text/plain")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body("{}")
            .create_async()
            .await;

        let executor = test_executor(&server);
        executor
            .execute(
                Request::get(format!("{}/ping", server.url()))
                    .with_header("Accept", "text/plain")
                    .without_login(),
            )
            .await
            .unwrap();

        mock.assert_async().await;
    }

    #[tokio::test]
    async fn lapsed_session_relogs_in_before_the_call() {
        let mut server = Server::new_async().await;

        let auth = server
            .mock("POST", "/users/auth")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(
                r#"{"token": "fresh-token", "tokenExpiration": 86400,
                    "tokenPayload": {"user": {"user_id": "u1"}}}"#,
            )
            .expect(1)
            .create_async()
            .await;
        let data = server
            .mock("GET", "/devices/d1")
            .match_header("authorization", "fresh-token")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body("{}")
            .create_async()
            .await;

        let executor = test_executor(&server);
        executor.session.save_secret("hunter2").await;

        let result = executor
            .execute(Request::get(format!("{}/devices/d1", server.url())))
            .await
            .unwrap();

        assert_eq!(result, Some(json!({})));
        auth.assert_async().await;
        data.assert_async().await;
    }
}
