//! Network client for the medisync-server API.
//!
//! One-shot calls go over REST with bearer API-key authentication. Each
//! live query opens its own WebSocket, because browsers and proxies in front
//! of the server only pass the key as a `?key=` query parameter on upgrade.

use std::time::Duration;

use futures::future::BoxFuture;
use futures::{FutureExt, SinkExt, StreamExt};
use reqwest::StatusCode;
use tokio::time::timeout;
use tokio_tungstenite::{connect_async, tungstenite::Message};

use super::protocol::{
    ClientFrame, CreatedResponse, ErrorBody, MeResponse, QueryRequest, QueryResponse, ServerFrame,
};
use super::{Document, Fields, LiveQuery, Query, RemoteStore, SnapshotSender};
use crate::error::RemoteError;
use crate::identity::OwnerId;

/// Default time to wait for the first frame of a live query.
const SNAPSHOT_TIMEOUT: Duration = Duration::from_secs(10);

/// REST + WebSocket client implementing [`RemoteStore`].
#[derive(Debug, Clone)]
pub struct HttpStore {
    server_url: String,
    api_key: String,
    client: reqwest::Client,
    snapshot_timeout: Duration,
}

impl HttpStore {
    pub fn new(server_url: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            server_url: server_url.into().trim_end_matches('/').to_string(),
            api_key: api_key.into(),
            client: reqwest::Client::new(),
            snapshot_timeout: SNAPSHOT_TIMEOUT,
        }
    }

    /// Sets how long `listen` waits for the first frame before giving up.
    pub fn with_snapshot_timeout(mut self, snapshot_timeout: Duration) -> Self {
        self.snapshot_timeout = snapshot_timeout;
        self
    }

    pub fn server_url(&self) -> &str {
        &self.server_url
    }

    /// Resolves the owner id the API key is bound to via `/me`.
    pub async fn fetch_identity(&self) -> Result<OwnerId, RemoteError> {
        let response = self
            .client
            .get(self.build_http_url("/me"))
            .bearer_auth(&self.api_key)
            .send()
            .await
            .map_err(transport_error)?;
        let me: MeResponse = decode_response(response).await?;
        Ok(OwnerId::new(me.owner_id))
    }

    fn document_url(&self, collection: &str, id: &str) -> String {
        self.build_http_url(&format!("/collections/{}/documents/{}", collection, id))
    }

    async fn add_document(&self, collection: &str, fields: Fields) -> Result<String, RemoteError> {
        let url = self.build_http_url(&format!("/collections/{}/documents", collection));
        let response = self
            .client
            .post(url)
            .bearer_auth(&self.api_key)
            .json(&fields)
            .send()
            .await
            .map_err(transport_error)?;
        let created: CreatedResponse = decode_response(response).await?;
        Ok(created.id)
    }

    async fn update_document(
        &self,
        collection: &str,
        id: &str,
        fields: Fields,
    ) -> Result<(), RemoteError> {
        let response = self
            .client
            .patch(self.document_url(collection, id))
            .bearer_auth(&self.api_key)
            .json(&fields)
            .send()
            .await
            .map_err(transport_error)?;
        check_status(response).await.map(|_| ())
    }

    async fn delete_document(&self, collection: &str, id: &str) -> Result<(), RemoteError> {
        let response = self
            .client
            .delete(self.document_url(collection, id))
            .bearer_auth(&self.api_key)
            .send()
            .await
            .map_err(transport_error)?;
        check_status(response).await.map(|_| ())
    }

    async fn get_document(
        &self,
        collection: &str,
        id: &str,
    ) -> Result<Option<Document>, RemoteError> {
        let response = self
            .client
            .get(self.document_url(collection, id))
            .bearer_auth(&self.api_key)
            .send()
            .await
            .map_err(transport_error)?;
        match decode_response::<Document>(response).await {
            Ok(doc) => Ok(Some(doc)),
            Err(RemoteError::NotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn run_query(&self, query: &Query) -> Result<Vec<Document>, RemoteError> {
        let url = self.build_http_url(&format!("/collections/{}/query", query.collection));
        let body = QueryRequest {
            filter: query.filter.clone(),
        };
        let response = self
            .client
            .post(url)
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(transport_error)?;
        let result: QueryResponse = decode_response(response).await?;
        Ok(result.documents)
    }

    /// Opens the socket, sends the `listen` frame and waits for the first
    /// frame before handing the feed to a forwarding task.
    async fn open_listener(&self, query: &Query) -> Result<LiveQuery, RemoteError> {
        let ws_url = self.build_ws_url(&query.collection);
        let (ws_stream, _) = connect_async(&ws_url)
            .await
            .map_err(|e| RemoteError::Transport(e.to_string()))?;
        let (mut sender, mut receiver) = ws_stream.split();

        let listen = ClientFrame::Listen {
            filter: query.filter.clone(),
        };
        let encoded = listen
            .encode()
            .map_err(|e| RemoteError::Protocol(e.to_string()))?;
        sender
            .send(Message::Text(encoded.into()))
            .await
            .map_err(|e| RemoteError::Transport(e.to_string()))?;

        let first = timeout(self.snapshot_timeout, async {
            while let Some(msg_result) = receiver.next().await {
                match msg_result {
                    Ok(Message::Text(text)) => return decode_frame(text.as_str()),
                    Ok(Message::Close(_)) => {
                        return Err(RemoteError::Transport(
                            "Server closed connection before first snapshot".to_string(),
                        ));
                    }
                    Ok(_) => {}
                    Err(e) => return Err(RemoteError::Transport(e.to_string())),
                }
            }
            Err(RemoteError::Transport(
                "Connection closed before first snapshot".to_string(),
            ))
        })
        .await
        .map_err(|_| RemoteError::Unavailable("Timed out waiting for snapshot".to_string()))??;

        let (tx, live) = LiveQuery::channel();
        let _ = tx.send(Ok(first));
        let collection = query.collection.clone();

        tokio::spawn(async move {
            forward_snapshots(tx, sender, receiver).await;
            tracing::debug!("Live query on {} closed", collection);
        });

        Ok(live)
    }

    /// Builds the WebSocket URL for a collection's live-query endpoint.
    fn build_ws_url(&self, collection: &str) -> String {
        let base_url = if self.server_url.starts_with("http://") {
            self.server_url.replacen("http://", "ws://", 1)
        } else if self.server_url.starts_with("https://") {
            self.server_url.replacen("https://", "wss://", 1)
        } else if !self.server_url.starts_with("ws://") && !self.server_url.starts_with("wss://") {
            format!("ws://{}", self.server_url)
        } else {
            self.server_url.clone()
        };

        format!(
            "{}/collections/{}/listen?key={}",
            base_url,
            collection,
            urlencoding::encode(&self.api_key)
        )
    }

    /// Builds an HTTP URL for a given path.
    fn build_http_url(&self, path: &str) -> String {
        let base_url = if self.server_url.starts_with("ws://") {
            self.server_url.replacen("ws://", "http://", 1)
        } else if self.server_url.starts_with("wss://") {
            self.server_url.replacen("wss://", "https://", 1)
        } else if !self.server_url.starts_with("http://")
            && !self.server_url.starts_with("https://")
        {
            format!("http://{}", self.server_url)
        } else {
            self.server_url.clone()
        };

        format!("{}{}", base_url, path)
    }
}

/// Pumps snapshot frames into `tx` until either side closes.
async fn forward_snapshots<S, R>(tx: SnapshotSender, mut sender: S, mut receiver: R)
where
    S: SinkExt<Message> + Unpin,
    R: StreamExt<Item = Result<Message, tokio_tungstenite::tungstenite::Error>> + Unpin,
{
    loop {
        tokio::select! {
            _ = tx.closed() => {
                let _ = sender.send(Message::Close(None)).await;
                return;
            }
            next = receiver.next() => match next {
                Some(Ok(Message::Text(text))) => {
                    let frame = decode_frame(text.as_str());
                    let failed = frame.is_err();
                    if tx.send(frame).is_err() || failed {
                        let _ = sender.send(Message::Close(None)).await;
                        return;
                    }
                }
                Some(Ok(Message::Ping(data))) => {
                    let _ = sender.send(Message::Pong(data)).await;
                }
                Some(Ok(Message::Close(_))) | None => return,
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    let _ = tx.send(Err(RemoteError::Transport(e.to_string())));
                    return;
                }
            }
        }
    }
}

fn decode_frame(text: &str) -> Result<Vec<Document>, RemoteError> {
    match ServerFrame::decode(text).map_err(|e| RemoteError::Protocol(e.to_string()))? {
        ServerFrame::Snapshot { documents } => Ok(documents),
        ServerFrame::Error { code, message } => Err(code.into_remote_error(message)),
    }
}

fn transport_error(err: reqwest::Error) -> RemoteError {
    if err.is_connect() || err.is_timeout() {
        RemoteError::Unavailable(err.to_string())
    } else {
        RemoteError::Transport(err.to_string())
    }
}

async fn check_status(response: reqwest::Response) -> Result<reqwest::Response, RemoteError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let text = response.text().await.unwrap_or_default();
    let message = match serde_json::from_str::<ErrorBody>(&text) {
        Ok(body) => return Err(body.error.into_remote_error(body.message)),
        Err(_) if text.is_empty() => format!("Server returned status {}", status),
        Err(_) => text,
    };
    Err(status_error(status, message))
}

fn status_error(status: StatusCode, message: String) -> RemoteError {
    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => RemoteError::PermissionDenied(message),
        StatusCode::NOT_FOUND => RemoteError::NotFound(message),
        s if s.is_server_error() => RemoteError::Unavailable(message),
        _ => RemoteError::Protocol(message),
    }
}

async fn decode_response<T: serde::de::DeserializeOwned>(
    response: reqwest::Response,
) -> Result<T, RemoteError> {
    check_status(response)
        .await?
        .json()
        .await
        .map_err(|e| RemoteError::Protocol(e.to_string()))
}

impl RemoteStore for HttpStore {
    fn add<'a>(
        &'a self,
        collection: &'a str,
        fields: Fields,
    ) -> BoxFuture<'a, Result<String, RemoteError>> {
        self.add_document(collection, fields).boxed()
    }

    fn update<'a>(
        &'a self,
        collection: &'a str,
        id: &'a str,
        fields: Fields,
    ) -> BoxFuture<'a, Result<(), RemoteError>> {
        self.update_document(collection, id, fields).boxed()
    }

    fn delete<'a>(
        &'a self,
        collection: &'a str,
        id: &'a str,
    ) -> BoxFuture<'a, Result<(), RemoteError>> {
        self.delete_document(collection, id).boxed()
    }

    fn get<'a>(
        &'a self,
        collection: &'a str,
        id: &'a str,
    ) -> BoxFuture<'a, Result<Option<Document>, RemoteError>> {
        self.get_document(collection, id).boxed()
    }

    fn query<'a>(&'a self, query: &'a Query) -> BoxFuture<'a, Result<Vec<Document>, RemoteError>> {
        self.run_query(query).boxed()
    }

    fn listen<'a>(&'a self, query: &'a Query) -> BoxFuture<'a, Result<LiveQuery, RemoteError>> {
        self.open_listener(query).boxed()
    }
}
