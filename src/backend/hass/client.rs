use std::time::Duration;

use futures::{SinkExt, StreamExt};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::net::TcpStream;
use tokio_tungstenite::MaybeTlsStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{WebSocketStream, connect_async};
use url::Url;

use lightscene_api::config::HassServer;
use lightscene_api::context::ContextId;

use crate::error::{ApiError, ApiResult};
use crate::scene::event::PlatformEvent;
use crate::scene::source::SceneDefinition;

pub const EVENT_STATE_CHANGED: &str = "state_changed";
pub const EVENT_CALL_SERVICE: &str = "call_service";
pub const EVENT_SCENE_RELOADED: &str = "scene_reloaded";

const SUBSCRIBED_EVENTS: &[&str] = &[EVENT_STATE_CHANGED, EVENT_CALL_SERVICE, EVENT_SCENE_RELOADED];

#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq)]
pub struct HassContext {
    pub id: String,
    #[serde(default)]
    pub parent_id: Option<String>,
}

#[derive(Clone, Debug, Deserialize)]
pub struct HassState {
    pub entity_id: String,
    pub state: String,
    #[serde(default)]
    pub attributes: Map<String, Value>,
    #[serde(default)]
    pub context: Option<HassContext>,
}

/// Body of `POST /api/states/<entity_id>`
#[derive(Clone, Debug, Serialize)]
pub struct HassStateUpdate {
    pub state: String,
    pub attributes: Map<String, Value>,
}

pub struct HassClient {
    backend_name: String,
    base_url: Url,
    http: reqwest::Client,
    token: Option<String>,
    token_env: String,
}

#[derive(Debug, Deserialize)]
struct HassWsEvent {
    #[serde(default)]
    event_type: String,
    #[serde(default)]
    data: Value,
    #[serde(default)]
    context: Option<HassContext>,
}

impl HassWsEvent {
    fn context_id(&self) -> Option<ContextId> {
        self.context.as_ref().map(|ctx| ContextId::new(ctx.id.as_str()))
    }

    fn into_platform_event(self) -> Option<PlatformEvent> {
        match self.event_type.as_str() {
            EVENT_STATE_CHANGED => Some(PlatformEvent::StateChanged {
                entity_id: self.data.get("entity_id")?.as_str()?.to_string(),
                context: self.context_id()?,
            }),
            EVENT_CALL_SERVICE => Some(PlatformEvent::CallService {
                domain: self.data.get("domain")?.as_str()?.to_string(),
                service: self.data.get("service")?.as_str()?.to_string(),
                service_data: self
                    .data
                    .get("service_data")
                    .cloned()
                    .unwrap_or_else(|| Value::Object(Map::new())),
                context: self.context_id()?,
            }),
            EVENT_SCENE_RELOADED => Some(PlatformEvent::SceneReloaded),
            _ => None,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
enum HassWsIncoming {
    #[serde(rename = "auth_required")]
    AuthRequired,
    #[serde(rename = "auth_ok")]
    AuthOk,
    #[serde(rename = "auth_invalid")]
    AuthInvalid,
    #[serde(rename = "result")]
    Result {
        id: u64,
        success: bool,
        #[serde(default)]
        error: Option<Value>,
    },
    #[serde(rename = "event")]
    Event { event: HassWsEvent },
    #[serde(other)]
    Other,
}

pub struct HassWs {
    backend_name: String,
    socket: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

impl HassWs {
    async fn recv_json(&mut self) -> ApiResult<Option<HassWsIncoming>> {
        let Some(msg) = self.socket.next().await else {
            return Ok(None);
        };
        let msg = msg.map_err(ApiError::from)?;
        let Message::Text(text) = msg else {
            return Ok(Some(HassWsIncoming::Other));
        };
        Ok(Some(serde_json::from_str::<HassWsIncoming>(&text)?))
    }

    async fn send_json(&mut self, value: &Value) -> ApiResult<()> {
        self.socket
            .send(Message::Text(value.to_string().into()))
            .await?;
        Ok(())
    }

    async fn authenticate(&mut self, token: &str) -> ApiResult<()> {
        let auth = serde_json::json!({
            "type": "auth",
            "access_token": token,
        });
        self.send_json(&auth).await?;

        loop {
            let Some(msg) = self.recv_json().await? else {
                return Err(ApiError::service_error(format!(
                    "[{}] Home Assistant websocket closed during auth",
                    self.backend_name
                )));
            };
            match msg {
                HassWsIncoming::AuthOk => return Ok(()),
                HassWsIncoming::AuthInvalid => {
                    return Err(ApiError::service_error(format!(
                        "[{}] Home Assistant websocket auth failed (check token)",
                        self.backend_name
                    )));
                }
                _ => {}
            }
        }
    }

    async fn subscribe(&mut self, id: u64, event_type: &str) -> ApiResult<()> {
        let sub = serde_json::json!({
            "id": id,
            "type": "subscribe_events",
            "event_type": event_type,
        });
        self.send_json(&sub).await?;

        loop {
            let Some(msg) = self.recv_json().await? else {
                return Err(ApiError::service_error(format!(
                    "[{}] Home Assistant websocket closed during subscribe",
                    self.backend_name
                )));
            };
            if let HassWsIncoming::Result {
                id: reply,
                success,
                error,
            } = msg
            {
                if reply != id {
                    continue;
                }
                if success {
                    return Ok(());
                }
                return Err(ApiError::service_error(format!(
                    "[{}] Home Assistant subscribe_events({event_type}) failed: {}",
                    self.backend_name,
                    error.unwrap_or(Value::Null)
                )));
            }
        }
    }

    /// Next event the bus cares about, or `None` once the socket closed.
    pub async fn next_event(&mut self) -> ApiResult<Option<PlatformEvent>> {
        while let Some(msg) = self.recv_json().await? {
            let HassWsIncoming::Event { event } = msg else {
                continue;
            };

            let event_type = event.event_type.clone();
            match event.into_platform_event() {
                Some(ev) => return Ok(Some(ev)),
                None => {
                    log::warn!(
                        "[{}] Dropping malformed {event_type} event",
                        self.backend_name
                    );
                }
            }
        }
        Ok(None)
    }
}

impl HassClient {
    const DEFAULT_TIMEOUT_SECS: u64 = 10;

    pub fn new(backend_name: &str, server: &HassServer) -> ApiResult<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(Self::DEFAULT_TIMEOUT_SECS))
            .build()?;

        Ok(Self {
            backend_name: backend_name.to_string(),
            base_url: server.url.clone(),
            http,
            token: None,
            token_env: server.token_env_name().to_string(),
        })
    }

    #[must_use]
    pub fn backend_name(&self) -> &str {
        &self.backend_name
    }

    pub fn load_token_from_env(&mut self) -> ApiResult<()> {
        let token = std::env::var(&self.token_env).map_err(|_| {
            ApiError::service_error(format!(
                "[{}] Missing Home Assistant token env var {}",
                self.backend_name, self.token_env
            ))
        })?;
        if token.trim().is_empty() {
            return Err(ApiError::service_error(format!(
                "[{}] Empty Home Assistant token in env var {}",
                self.backend_name, self.token_env
            )));
        }
        self.token = Some(token.trim().to_string());
        Ok(())
    }

    fn endpoint_url(&self, endpoint: &str) -> ApiResult<Url> {
        let base = if self.base_url.path().is_empty() {
            format!("{}/", self.base_url)
        } else {
            self.base_url.to_string()
        };
        let base = Url::parse(&base)?;
        Ok(base.join(endpoint.trim_start_matches('/'))?)
    }

    fn token(&self) -> ApiResult<&str> {
        self.token.as_deref().ok_or_else(|| {
            ApiError::service_error(format!(
                "[{}] Home Assistant token not initialized",
                self.backend_name
            ))
        })
    }

    async fn check_status(
        &self,
        response: reqwest::Response,
        action: &str,
    ) -> ApiResult<reqwest::Response> {
        if response.status().is_success() {
            return Ok(response);
        }

        let status = response.status();
        let body = response.text().await.unwrap_or_else(|_| String::new());

        let details = if body.is_empty() {
            format!("{status}")
        } else {
            format!("{status}: {body}")
        };

        let err = if status == StatusCode::UNAUTHORIZED {
            format!(
                "[{}] Home Assistant unauthorized during {}. Verify {}",
                self.backend_name, action, self.token_env
            )
        } else {
            format!(
                "[{}] Home Assistant error during {}: {}",
                self.backend_name, action, details
            )
        };

        Err(ApiError::service_error(err))
    }

    pub async fn get_states(&self) -> ApiResult<Vec<HassState>> {
        let url = self.endpoint_url("/api/states")?;
        let response = self.http.get(url).bearer_auth(self.token()?).send().await?;
        let response = self.check_status(response, "GET /api/states").await?;
        Ok(response.json().await?)
    }

    /// Stored definition of a UI-managed scene. Scenes defined outside the
    /// scene editor have none.
    pub async fn get_scene_config(&self, id: &str) -> ApiResult<Option<SceneDefinition>> {
        let url = self.endpoint_url(&format!("/api/config/scene/config/{id}"))?;
        let response = self.http.get(url).bearer_auth(self.token()?).send().await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let response = self
            .check_status(response, &format!("GET /api/config/scene/config/{id}"))
            .await?;
        Ok(Some(response.json().await?))
    }

    /// Call a service, returning the states that changed because of it.
    pub async fn call_service(
        &self,
        domain: &str,
        service: &str,
        data: Map<String, Value>,
    ) -> ApiResult<Vec<HassState>> {
        let url = self.endpoint_url(&format!("/api/services/{domain}/{service}"))?;
        let payload = Value::Object(data);

        let response = self
            .http
            .post(url)
            .bearer_auth(self.token()?)
            .json(&payload)
            .send()
            .await?;
        let response = self
            .check_status(response, &format!("POST /api/services/{domain}/{service}"))
            .await?;
        Ok(response.json().await?)
    }

    pub async fn set_state(&self, entity_id: &str, update: &HassStateUpdate) -> ApiResult<()> {
        let url = self.endpoint_url(&format!("/api/states/{entity_id}"))?;
        let response = self
            .http
            .post(url)
            .bearer_auth(self.token()?)
            .json(update)
            .send()
            .await?;
        let _response = self
            .check_status(response, &format!("POST /api/states/{entity_id}"))
            .await?;
        Ok(())
    }

    fn ws_endpoint_url(&self) -> ApiResult<Url> {
        let mut url = self.endpoint_url("/api/websocket")?;
        let scheme = match url.scheme() {
            "https" => "wss",
            _ => "ws",
        };
        url.set_scheme(scheme).map_err(|()| {
            ApiError::service_error(format!(
                "[{}] Failed to convert HA url scheme for websocket",
                self.backend_name
            ))
        })?;
        Ok(url)
    }

    /// Open an authenticated websocket, subscribed to every event type the
    /// scene-lights react to.
    pub async fn subscribe_events(&self) -> ApiResult<HassWs> {
        let ws_url = self.ws_endpoint_url()?;
        let (socket, _response) = connect_async(ws_url.as_str()).await?;

        let mut ws = HassWs {
            backend_name: self.backend_name.clone(),
            socket,
        };

        ws.authenticate(self.token()?).await?;

        for (id, event_type) in (1..).zip(SUBSCRIBED_EVENTS) {
            ws.subscribe(id, event_type).await?;
        }

        Ok(ws)
    }
}
