//! [`ThreadBackend`] over the Atelier HTTP API and its WebSocket feed.

use std::time::Duration;

use async_trait::async_trait;
use chrono::SecondsFormat;
use futures_util::StreamExt;
use serde::de::DeserializeOwned;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tracing::{debug, warn};

use atelier_types::api::{
    CreateMessageRequest, ErrorResponse, PageResponse, UpdateMessageRequest, WireMessage,
    attachment_value,
};
use atelier_types::events::ChangeEvent;
use atelier_types::models::{Attachment, Cursor, MessageId, MessagePatch, ThreadId};

use crate::backend::{FeedStream, ThreadBackend};
use crate::config::Identity;
use crate::error::{BackendError, BackendErrorKind, SyncError};

const USER_ID_HEADER: &str = "x-user-id";
const USERNAME_HEADER: &str = "x-username";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(20);

pub struct HttpBackend {
    http: reqwest::Client,
    base_url: String,
    identity: Identity,
}

impl HttpBackend {
    pub fn new(base_url: &str, identity: Identity) -> Result<Self, SyncError> {
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| SyncError::Network(e.to_string()))?;
        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            identity,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    fn request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        let builder = self
            .http
            .request(method, self.url(path))
            .header(USER_ID_HEADER, self.identity.user_id.to_string());
        match &self.identity.username {
            Some(username) => builder.header(USERNAME_HEADER, username),
            None => builder,
        }
    }
}

/// `http(s)://` base to `ws(s)://`.
fn ws_url(base_url: &str, path: &str) -> Result<String, BackendError> {
    let rest = if let Some(rest) = base_url.strip_prefix("https://") {
        format!("wss://{}", rest)
    } else if let Some(rest) = base_url.strip_prefix("http://") {
        format!("ws://{}", rest)
    } else if base_url.starts_with("ws://") || base_url.starts_with("wss://") {
        base_url.to_string()
    } else {
        return Err(BackendError::new(
            BackendErrorKind::Protocol,
            format!("unsupported base url '{}'", base_url),
        ));
    };
    Ok(format!("{}{}", rest, path))
}

fn transport(err: reqwest::Error) -> BackendError {
    if err.is_decode() {
        BackendError::new(BackendErrorKind::Protocol, err.to_string())
    } else {
        BackendError::network(err.to_string())
    }
}

async fn decode<T: DeserializeOwned>(res: reqwest::Response) -> Result<T, BackendError> {
    let status = res.status();
    if !status.is_success() {
        let body = res.text().await.unwrap_or_default();
        let message = serde_json::from_str::<ErrorResponse>(&body)
            .map(|e| e.message)
            .unwrap_or(body);
        return Err(BackendError::from_status(status.as_u16(), message));
    }
    res.json::<T>().await.map_err(transport)
}

fn page_query(cursor: Option<Cursor>, limit: u32) -> Vec<(&'static str, String)> {
    let mut query = vec![("limit", limit.to_string())];
    if let Some(cursor) = cursor {
        query.push((
            "before",
            cursor.created_at.to_rfc3339_opts(SecondsFormat::Micros, true),
        ));
        query.push(("before_id", cursor.id.to_string()));
    }
    query
}

#[async_trait]
impl ThreadBackend for HttpBackend {
    async fn fetch_page(
        &self,
        thread_id: ThreadId,
        cursor: Option<Cursor>,
        limit: u32,
    ) -> Result<PageResponse, BackendError> {
        let res = self
            .request(reqwest::Method::GET, &format!("/threads/{}/messages", thread_id))
            .query(&page_query(cursor, limit))
            .send()
            .await
            .map_err(transport)?;
        decode(res).await
    }

    async fn subscribe(&self, thread_id: ThreadId) -> Result<FeedStream, BackendError> {
        let url = ws_url(&self.base_url, &format!("/threads/{}/feed", thread_id))?;
        let mut request = url
            .into_client_request()
            .map_err(|e| BackendError::new(BackendErrorKind::Protocol, e.to_string()))?;

        let headers = request.headers_mut();
        let user_id = HeaderValue::from_str(&self.identity.user_id.to_string())
            .map_err(|e| BackendError::new(BackendErrorKind::Protocol, e.to_string()))?;
        headers.insert(USER_ID_HEADER, user_id);
        if let Some(username) = &self.identity.username {
            if let Ok(value) = HeaderValue::from_str(username) {
                headers.insert(USERNAME_HEADER, value);
            }
        }

        let (socket, _) = connect_async(request)
            .await
            .map_err(|e| BackendError::network(e.to_string()))?;
        debug!(%thread_id, "change feed connected");

        // Pings are answered by the socket itself while it is being read.
        let events = socket.filter_map(move |frame| async move {
            match frame {
                Ok(WsMessage::Text(text)) => match serde_json::from_str::<ChangeEvent>(text.as_str()) {
                    Ok(event) => Some(event),
                    Err(e) => {
                        warn!(%thread_id, "undecodable change event: {}", e);
                        None
                    }
                },
                Ok(_) => None,
                Err(e) => {
                    warn!(%thread_id, "change feed error: {}", e);
                    None
                }
            }
        });
        Ok(Box::pin(events))
    }

    async fn create_message(
        &self,
        thread_id: ThreadId,
        content: &str,
        attachments: &[Attachment],
    ) -> Result<WireMessage, BackendError> {
        let body = CreateMessageRequest {
            content: content.to_string(),
            attachments: attachments.iter().map(attachment_value).collect(),
        };
        let res = self
            .request(reqwest::Method::POST, &format!("/threads/{}/messages", thread_id))
            .json(&body)
            .send()
            .await
            .map_err(transport)?;
        decode(res).await
    }

    async fn update_message(
        &self,
        id: MessageId,
        patch: &MessagePatch,
    ) -> Result<WireMessage, BackendError> {
        let res = self
            .request(reqwest::Method::PATCH, &format!("/messages/{}", id))
            .json(&UpdateMessageRequest::from(patch))
            .send()
            .await
            .map_err(transport)?;
        decode(res).await
    }
}
