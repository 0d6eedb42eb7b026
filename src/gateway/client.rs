use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use reqwest::{Client, Method, StatusCode, header};
use serde_json::{Value, json};
use tokio::sync::Mutex;
use tokio::time::sleep;
use tracing::debug;

use super::error::GatewayError;
use super::models::{ApiEnvelope, ClientConfig, Inbound, InboundSettings, ServerStatus};
use super::retry::RetryPolicy;

/// Panel sessions last about an hour; refresh well before that.
const SESSION_TTL: Duration = Duration::from_secs(55 * 60);

/// Backoff applied on HTTP 429 when the panel omits Retry-After.
const DEFAULT_RETRY_AFTER: Duration = Duration::from_secs(5);

struct Session {
    cookie: String,
    issued_at: Instant,
}

impl Session {
    fn is_valid(&self) -> bool {
        self.issued_at.elapsed() < SESSION_TTL
    }
}

enum Failure {
    /// HTTP 401: the session was rejected.
    Unauthorized,
    /// HTTP 429 with the delay the panel asked for.
    RateLimited(Duration),
    Api(GatewayError),
}

/// Authenticated HTTP client for one remote gateway.
///
/// Session state (cookie + issue time) is owned here, one instance per
/// server; it is never shared across gateways.
pub struct GatewayClient {
    http: Client,
    base_url: String,
    username: String,
    password: String,
    retry: RetryPolicy,
    session: Mutex<Option<Session>>,
}

impl GatewayClient {
    pub fn new(
        panel_url: &str,
        username: &str,
        password: &str,
        retry: RetryPolicy,
        request_timeout: Duration,
    ) -> Result<Self, GatewayError> {
        let http = Client::builder()
            .timeout(request_timeout)
            .build()
            .map_err(|e| GatewayError::Operation(format!("failed to build http client: {e}")))?;
        Ok(Self {
            http,
            base_url: panel_url.trim_end_matches('/').to_string(),
            username: username.to_string(),
            password: password.to_string(),
            retry,
            session: Mutex::new(None),
        })
    }

    /// Logs in and stores the session cookie. Called lazily before the
    /// first request and again whenever the session expires or a 401
    /// forces a refresh.
    pub async fn authenticate(&self) -> Result<(), GatewayError> {
        let resp = self
            .http
            .post(format!("{}/login", self.base_url))
            .form(&[
                ("username", self.username.as_str()),
                ("password", self.password.as_str()),
            ])
            .send()
            .await
            .map_err(GatewayError::from)?;

        let status = resp.status();
        let cookie = resp
            .headers()
            .get_all(header::SET_COOKIE)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .filter_map(|v| v.split(';').next())
            .map(str::trim)
            .find(|c| !c.is_empty() && !c.starts_with("lang="))
            .map(str::to_string);

        if !status.is_success() {
            return Err(GatewayError::Authentication(format!(
                "login returned {status}"
            )));
        }
        let env: ApiEnvelope<Value> = resp.json().await.map_err(GatewayError::from)?;
        if !env.success {
            return Err(GatewayError::Authentication(if env.msg.is_empty() {
                "credentials rejected".to_string()
            } else {
                env.msg
            }));
        }
        let cookie = cookie.ok_or_else(|| {
            GatewayError::Authentication("login succeeded but no session cookie was set".to_string())
        })?;

        debug!(base_url = %self.base_url, "gateway session established");
        *self.session.lock().await = Some(Session {
            cookie,
            issued_at: Instant::now(),
        });
        Ok(())
    }

    async fn session_cookie(&self) -> Result<String, GatewayError> {
        {
            let guard = self.session.lock().await;
            if let Some(session) = guard.as_ref() {
                if session.is_valid() {
                    return Ok(session.cookie.clone());
                }
            }
        }
        self.authenticate().await?;
        let guard = self.session.lock().await;
        guard
            .as_ref()
            .map(|s| s.cookie.clone())
            .ok_or_else(|| GatewayError::Authentication("session missing after login".to_string()))
    }

    async fn invalidate_session(&self) {
        *self.session.lock().await = None;
    }

    /// One HTTP round trip, with typed mapping of the panel's answers.
    async fn execute(
        &self,
        method: Method,
        path: &str,
        body: Option<&Value>,
    ) -> Result<Value, Failure> {
        let cookie = self.session_cookie().await.map_err(Failure::Api)?;
        let url = format!("{}{}", self.base_url, path);
        let mut request = self.http.request(method, &url).header(header::COOKIE, cookie);
        if let Some(body) = body {
            request = request.json(body);
        }
        let resp = request
            .send()
            .await
            .map_err(|e| Failure::Api(GatewayError::from(e)))?;

        let status = resp.status();
        if status == StatusCode::UNAUTHORIZED {
            return Err(Failure::Unauthorized);
        }
        if status == StatusCode::TOO_MANY_REQUESTS {
            let after = resp
                .headers()
                .get(header::RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.trim().parse::<u64>().ok())
                .map(Duration::from_secs)
                .unwrap_or(DEFAULT_RETRY_AFTER);
            return Err(Failure::RateLimited(after));
        }
        if status == StatusCode::NOT_FOUND {
            return Err(Failure::Api(GatewayError::NotFound(path.to_string())));
        }
        if status == StatusCode::BAD_REQUEST || status == StatusCode::UNPROCESSABLE_ENTITY {
            let msg = resp.text().await.unwrap_or_default();
            return Err(Failure::Api(GatewayError::Validation(msg)));
        }
        if status.is_server_error() {
            return Err(Failure::Api(GatewayError::Operation(format!(
                "gateway returned {status} for {path}"
            ))));
        }

        let env: ApiEnvelope<Value> = resp
            .json()
            .await
            .map_err(|e| Failure::Api(GatewayError::from(e)))?;
        if env.success {
            Ok(env.obj.unwrap_or(Value::Null))
        } else {
            Err(Failure::Api(envelope_error(env.msg)))
        }
    }

    /// Sends a request through the shared retry policy.
    ///
    /// HTTP 401 triggers exactly one re-login and immediate retry of the
    /// same request; HTTP 429 sleeps the server-supplied Retry-After and
    /// then counts as a retryable failure against the policy's attempt
    /// budget; connection errors back off exponentially; 404/400/422
    /// surface immediately as typed errors.
    pub async fn request_with_retry(
        &self,
        method: Method,
        path: &str,
        body: Option<Value>,
    ) -> Result<Value, GatewayError> {
        let reauthed = AtomicBool::new(false);
        self.retry
            .run(path, || {
                let method = method.clone();
                let body = body.clone();
                let reauthed = &reauthed;
                async move {
                    match self.execute(method.clone(), path, body.as_ref()).await {
                        Ok(value) => Ok(value),
                        Err(Failure::Unauthorized) => {
                            if reauthed.swap(true, Ordering::SeqCst) {
                                return Err(GatewayError::Authentication(
                                    "session rejected again after re-login".to_string(),
                                ));
                            }
                            self.invalidate_session().await;
                            self.authenticate().await?;
                            match self.execute(method, path, body.as_ref()).await {
                                Ok(value) => Ok(value),
                                Err(Failure::Unauthorized) => Err(GatewayError::Authentication(
                                    "session rejected again after re-login".to_string(),
                                )),
                                Err(Failure::RateLimited(after)) => {
                                    sleep(after).await;
                                    Err(GatewayError::Connection(
                                        "gateway rate-limited the request".to_string(),
                                    ))
                                }
                                Err(Failure::Api(err)) => Err(err),
                            }
                        }
                        Err(Failure::RateLimited(after)) => {
                            sleep(after).await;
                            Err(GatewayError::Connection(
                                "gateway rate-limited the request".to_string(),
                            ))
                        }
                        Err(Failure::Api(err)) => Err(err),
                    }
                }
            })
            .await
    }

    pub async fn list_inbounds(&self) -> Result<Vec<Inbound>, GatewayError> {
        let obj = self
            .request_with_retry(Method::GET, "/panel/api/inbounds/list", None)
            .await?;
        decode("inbound list", obj)
    }

    pub async fn get_inbound(&self, inbound_id: i32) -> Result<Inbound, GatewayError> {
        let obj = self
            .request_with_retry(
                Method::GET,
                &format!("/panel/api/inbounds/get/{inbound_id}"),
                None,
            )
            .await?;
        decode("inbound", obj)
    }

    pub async fn add_client(
        &self,
        inbound_id: i32,
        client: &ClientConfig,
    ) -> Result<(), GatewayError> {
        let settings = InboundSettings {
            clients: vec![client.clone()],
        };
        let body = json!({ "id": inbound_id, "settings": settings.encode() });
        self.request_with_retry(
            Method::POST,
            &format!("/panel/api/inbounds/{inbound_id}/addClient"),
            Some(body),
        )
        .await?;
        Ok(())
    }

    /// Replaces one client inside an inbound via the panel's only bulk
    /// write primitive: fetch the inbound, splice the client into its
    /// settings, post the whole list back.
    ///
    /// Two concurrent updates of the same inbound can interleave between
    /// the fetch and the write; the loser's change is repaired by the next
    /// sync pass.
    pub async fn update_client(
        &self,
        inbound_id: i32,
        client: &ClientConfig,
    ) -> Result<(), GatewayError> {
        let inbound = self.get_inbound(inbound_id).await?;
        let mut settings = inbound.parsed_settings()?;
        let slot = settings
            .clients
            .iter_mut()
            .find(|c| c.id == client.id || c.email == client.email)
            .ok_or_else(|| {
                GatewayError::NotFound(format!(
                    "client {} in inbound {inbound_id}",
                    client.email
                ))
            })?;
        *slot = client.clone();

        let mut payload = serde_json::to_value(&inbound)
            .map_err(|e| GatewayError::Operation(format!("failed to encode inbound: {e}")))?;
        payload["settings"] = Value::String(settings.encode());
        self.request_with_retry(
            Method::POST,
            &format!("/panel/api/inbounds/update/{inbound_id}"),
            Some(payload),
        )
        .await?;
        Ok(())
    }

    pub async fn delete_client(&self, inbound_id: i32, uuid: &str) -> Result<(), GatewayError> {
        self.request_with_retry(
            Method::POST,
            &format!("/panel/api/inbounds/{inbound_id}/delClient/{uuid}"),
            None,
        )
        .await?;
        Ok(())
    }

    pub async fn reset_client_traffic(
        &self,
        inbound_id: i32,
        email: &str,
    ) -> Result<(), GatewayError> {
        self.request_with_retry(
            Method::POST,
            &format!("/panel/api/inbounds/{inbound_id}/resetClientTraffic/{email}"),
            None,
        )
        .await?;
        Ok(())
    }

    pub async fn server_status(&self) -> Result<ServerStatus, GatewayError> {
        let obj = self
            .request_with_retry(Method::GET, "/panel/api/server/status", None)
            .await?;
        decode("server status", obj)
    }

    pub async fn online_clients(&self) -> Result<Vec<String>, GatewayError> {
        let obj = self
            .request_with_retry(Method::POST, "/panel/api/inbounds/onlines", None)
            .await?;
        if obj.is_null() {
            return Ok(Vec::new());
        }
        decode("online client list", obj)
    }
}

fn decode<T: serde::de::DeserializeOwned>(what: &str, obj: Value) -> Result<T, GatewayError> {
    serde_json::from_value(obj)
        .map_err(|e| GatewayError::Operation(format!("unexpected {what} shape: {e}")))
}

/// The panel reports many application-level failures as HTTP 200 with
/// `success:false`; absence is the one case the callers care to tell apart.
fn envelope_error(msg: String) -> GatewayError {
    let lower = msg.to_lowercase();
    if lower.contains("not found") || lower.contains("no client") {
        GatewayError::NotFound(msg)
    } else {
        GatewayError::Operation(msg)
    }
}
