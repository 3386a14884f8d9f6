use crate::error::AppError;
use crate::sync::polling::SnapshotSource;
use crate::sync::push::{PushConnection, PushConnector, PushFrame};
use crate::sync::queue::ActionSender;
use crate::sync::types::{ActionKind, QueuedAction, Snapshot, SnapshotOrigin, SnapshotWire};
use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use reqwest::{Client, Method};
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async_with_config, MaybeTlsStream, WebSocketStream};

type PriceWsStream = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

const IDEMPOTENCY_HEADER: &str = "Idempotency-Key";

fn trim_base(base_url: &str) -> String {
    base_url.trim().trim_end_matches('/').to_string()
}

fn prices_endpoint(base_url: &str) -> String {
    format!("{}/prices", trim_base(base_url))
}

fn action_collection(kind: ActionKind) -> &'static str {
    if kind.is_alert() {
        "alerts"
    } else {
        "portfolio/holdings"
    }
}

/// Maps a queued mutation to its REST method and URL.
fn action_route(base_url: &str, action: &QueuedAction) -> Result<(Method, String), AppError> {
    let collection = format!("{}/{}", trim_base(base_url), action_collection(action.kind));
    let method = match action.kind {
        ActionKind::CreateAlert | ActionKind::AddHolding => return Ok((Method::POST, collection)),
        ActionKind::UpdateAlert | ActionKind::UpdateHolding => Method::PUT,
        ActionKind::DeleteAlert | ActionKind::DeleteHolding => Method::DELETE,
    };

    let entity_id = action.entity_id().ok_or_else(|| {
        AppError::InvalidArgument(format!(
            "{} payload is missing an 'id' field",
            action.kind.as_str()
        ))
    })?;
    Ok((method, format!("{collection}/{entity_id}")))
}

#[derive(Debug, Clone)]
pub struct WebSocketConnector {
    url: String,
}

impl WebSocketConnector {
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }
}

#[async_trait]
impl PushConnector for WebSocketConnector {
    async fn open(&self) -> Result<Box<dyn PushConnection>, AppError> {
        let ws_config = WebSocketConfig {
            max_message_size: Some(64 << 20),
            max_frame_size: Some(16 << 20),
            ..Default::default()
        };

        let (stream, _) = connect_async_with_config(self.url.as_str(), Some(ws_config), true).await?;
        Ok(Box::new(WebSocketConnection { stream }))
    }
}

struct WebSocketConnection {
    stream: PriceWsStream,
}

#[async_trait]
impl PushConnection for WebSocketConnection {
    async fn send_text(&mut self, text: String) -> Result<(), AppError> {
        self.stream.send(Message::Text(text)).await?;
        Ok(())
    }

    async fn next_frame(&mut self) -> Option<Result<PushFrame, AppError>> {
        loop {
            let message = match self.stream.next().await? {
                Ok(message) => message,
                Err(error) => return Some(Err(error.into())),
            };
            match message {
                Message::Text(text) => return Some(Ok(PushFrame::Text(text))),
                Message::Binary(bytes) => return Some(Ok(PushFrame::Binary(bytes))),
                Message::Close(_) => return None,
                Message::Ping(_) | Message::Pong(_) | Message::Frame(_) => {}
            }
        }
    }

    async fn close(&mut self) {
        let _ = self.stream.close(None).await;
    }
}

/// `GET {base}/prices`, answered with the snapshot message shape.
#[derive(Debug, Clone)]
pub struct HttpSnapshotSource {
    client: Client,
    endpoint: String,
}

impl HttpSnapshotSource {
    pub fn new(client: Client, base_url: &str) -> Self {
        Self {
            client,
            endpoint: prices_endpoint(base_url),
        }
    }
}

#[async_trait]
impl SnapshotSource for HttpSnapshotSource {
    async fn fetch_snapshot(&self) -> Result<Snapshot, AppError> {
        let response = self
            .client
            .get(&self.endpoint)
            .send()
            .await?
            .error_for_status()?;
        let payload = response.json::<SnapshotWire>().await?;
        payload.into_snapshot(SnapshotOrigin::Poll)
    }
}

#[derive(Debug, Clone)]
pub struct HttpActionSender {
    client: Client,
    base_url: String,
    bearer_token: Option<String>,
}

impl HttpActionSender {
    pub fn new(client: Client, base_url: &str) -> Self {
        Self {
            client,
            base_url: trim_base(base_url),
            bearer_token: None,
        }
    }

    pub fn with_bearer_token(mut self, token: Option<String>) -> Self {
        self.bearer_token = token.filter(|value| !value.trim().is_empty());
        self
    }
}

#[async_trait]
impl ActionSender for HttpActionSender {
    async fn send(&self, action: &QueuedAction) -> Result<(), AppError> {
        let (method, url) = action_route(&self.base_url, action)?;
        let has_body = method != Method::DELETE;

        let mut request = self
            .client
            .request(method, url)
            .header(IDEMPOTENCY_HEADER, action.id.as_str());
        if has_body {
            request = request.json(&action.payload);
        }
        if let Some(token) = self.bearer_token.as_deref() {
            request = request.bearer_auth(token);
        }

        let response = request.send().await?;
        let status = response.status();
        if status.is_server_error() {
            // 5xx stays a transient reqwest error.
            response.error_for_status()?;
        } else if !status.is_success() {
            return Err(AppError::Rejected(format!(
                "{} answered {status}",
                action.kind.as_str()
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn prices_endpoint_trims_trailing_slash() {
        assert_eq!(
            prices_endpoint("https://api.example.test/v1/"),
            "https://api.example.test/v1/prices"
        );
    }

    #[test]
    fn create_actions_post_to_collection() {
        let action = QueuedAction::new(ActionKind::CreateAlert, json!({ "code": "XAUUSD" }));
        let (method, url) =
            action_route("https://api.example.test", &action).expect("route should resolve");

        assert_eq!(method, Method::POST);
        assert_eq!(url, "https://api.example.test/alerts");
    }

    #[test]
    fn holding_updates_target_entity_url() {
        let action = QueuedAction::new(ActionKind::UpdateHolding, json!({ "id": 42, "qty": 3 }));
        let (method, url) =
            action_route("https://api.example.test", &action).expect("route should resolve");

        assert_eq!(method, Method::PUT);
        assert_eq!(url, "https://api.example.test/portfolio/holdings/42");
    }

    #[test]
    fn delete_without_id_is_invalid() {
        let action = QueuedAction::new(ActionKind::DeleteAlert, json!({ "code": "XAUUSD" }));

        assert!(matches!(
            action_route("https://api.example.test", &action),
            Err(AppError::InvalidArgument(_))
        ));
    }

    #[tokio::test]
    async fn unreachable_api_is_a_transient_failure() {
        let sender = HttpActionSender::new(Client::new(), "http://127.0.0.1:9");
        let action = QueuedAction::new(ActionKind::AddHolding, json!({ "code": "XAGUSD" }));

        let error = sender.send(&action).await.expect_err("nothing listens on port 9");

        assert!(error.is_transient());
    }
}
