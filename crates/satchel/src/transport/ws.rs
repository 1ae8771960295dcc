//! JSON-RPC 2.0 subscription manager.
//!
//! One WebSocket connection per mint, opened lazily on the first
//! subscribe and closed when the last subscription goes away. Filter
//! batches are limited to [`MAX_FILTERS_PER_SUBSCRIPTION`]; larger
//! lists are split into grouped subscriptions. Request ids are a
//! per-mint monotonic counter and a pending map correlates subscribe
//! requests with their `result`/`error`; an error response deletes the
//! local subscription.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use futures::future::{join_all, BoxFuture};
use futures::{SinkExt, StreamExt};
use satchel_common::mint_url::MintUrl;
use satchel_common::Error;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use uuid::Uuid;

use super::http::{MeltQuoteResponse, MintQuoteResponse};

/// Maximum filters carried by a single subscription.
pub const MAX_FILTERS_PER_SUBSCRIPTION: usize = 100;

const JSON_RPC_VERSION: &str = "2.0";

/// Subscription kinds supported by the mint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SubscriptionKind {
    /// bolt11 mint quote updates, filtered by quote id
    Bolt11MintQuote,
    /// bolt11 melt quote updates, filtered by quote id
    Bolt11MeltQuote,
    /// Proof state updates, filtered by hex-encoded Y
    ProofState,
}

impl fmt::Display for SubscriptionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SubscriptionKind::Bolt11MintQuote => write!(f, "bolt11_mint_quote"),
            SubscriptionKind::Bolt11MeltQuote => write!(f, "bolt11_melt_quote"),
            SubscriptionKind::ProofState => write!(f, "proof_state"),
        }
    }
}

impl FromStr for SubscriptionKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "bolt11_mint_quote" => Ok(SubscriptionKind::Bolt11MintQuote),
            "bolt11_melt_quote" => Ok(SubscriptionKind::Bolt11MeltQuote),
            "proof_state" => Ok(SubscriptionKind::ProofState),
            other => Err(Error::Validation(format!(
                "unknown subscription kind `{other}`"
            ))),
        }
    }
}

impl Serialize for SubscriptionKind {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for SubscriptionKind {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Self::from_str(&s).map_err(serde::de::Error::custom)
    }
}

/// Payload of a server push.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum NotificationPayload {
    /// `proof_state` notification
    ProofState(cashu::nuts::nut07::ProofState),
    /// `bolt11_melt_quote` notification
    MeltQuote(MeltQuoteResponse),
    /// `bolt11_mint_quote` notification
    MintQuote(MintQuoteResponse),
}

/// Callback invoked for each matching notification.
pub type NotificationCallback =
    Arc<dyn Fn(NotificationPayload) -> BoxFuture<'static, Result<(), Error>> + Send + Sync>;

#[derive(Debug, Serialize)]
struct SubscribeParams<'a> {
    kind: SubscriptionKind,
    #[serde(rename = "subId")]
    sub_id: &'a str,
    filters: &'a [String],
}

#[derive(Debug, Serialize)]
struct UnsubscribeParams<'a> {
    #[serde(rename = "subId")]
    sub_id: &'a str,
}

#[derive(Debug, Serialize)]
struct WsRequest<P: Serialize> {
    jsonrpc: &'static str,
    id: usize,
    method: &'static str,
    params: P,
}

#[derive(Debug, Clone, Deserialize)]
struct WsErrorBody {
    code: i64,
    message: String,
}

#[derive(Debug, Clone, Deserialize)]
struct NotificationParams {
    #[serde(rename = "subId")]
    sub_id: String,
    payload: NotificationPayload,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum IncomingMessage {
    Error {
        id: usize,
        error: WsErrorBody,
    },
    Response {
        id: usize,
        #[allow(dead_code)]
        result: serde_json::Value,
    },
    Notification {
        #[allow(dead_code)]
        method: String,
        params: NotificationParams,
    },
}

struct SubscriptionGroup {
    kind: SubscriptionKind,
    filters: HashSet<String>,
    callbacks: Vec<NotificationCallback>,
}

#[derive(Default)]
struct ConnectionState {
    next_request_id: usize,
    /// Subscribe requests awaiting their result, keyed by request id.
    pending: HashMap<usize, String>,
    groups: HashMap<String, SubscriptionGroup>,
}

impl ConnectionState {
    fn next_id(&mut self) -> usize {
        self.next_request_id += 1;
        self.next_request_id
    }

    /// Shrink the remaining-filter sets of every group of `kind`,
    /// returning the sub ids of groups that became empty. Removed
    /// groups are dropped locally; the caller issues the wire
    /// unsubscribe exactly once per returned id.
    fn remove_filters(&mut self, kind: SubscriptionKind, filters: &[String]) -> Vec<String> {
        let mut emptied = Vec::new();
        for (sub_id, group) in self.groups.iter_mut() {
            if group.kind != kind {
                continue;
            }
            for filter in filters {
                group.filters.remove(filter);
            }
            if group.filters.is_empty() {
                emptied.push(sub_id.clone());
            }
        }
        for sub_id in &emptied {
            self.groups.remove(sub_id);
        }
        emptied
    }
}

/// Split a filter list into subscription-sized batches.
fn split_filters(filters: Vec<String>) -> Vec<Vec<String>> {
    let mut batches = Vec::new();
    let mut current = Vec::new();
    for filter in filters {
        current.push(filter);
        if current.len() == MAX_FILTERS_PER_SUBSCRIPTION {
            batches.push(std::mem::take(&mut current));
        }
    }
    if !current.is_empty() {
        batches.push(current);
    }
    batches
}

struct MintConnection {
    outgoing: mpsc::UnboundedSender<Message>,
    state: Arc<Mutex<ConnectionState>>,
    reader: JoinHandle<()>,
}

impl MintConnection {
    fn is_alive(&self) -> bool {
        !self.reader.is_finished()
    }
}

impl Drop for MintConnection {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

/// Per-mint JSON-RPC subscription manager.
#[derive(Default)]
pub struct SubscriptionManager {
    connections: Mutex<HashMap<MintUrl, Arc<MintConnection>>>,
}

impl fmt::Debug for SubscriptionManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubscriptionManager").finish_non_exhaustive()
    }
}

fn ws_url(mint_url: &MintUrl) -> Result<url::Url, Error> {
    let mut url = mint_url.join_paths(&["v1", "ws"])?;
    let scheme = match url.scheme() {
        "https" => "wss",
        "http" => "ws",
        other => {
            return Err(Error::Validation(format!(
                "cannot open websocket for scheme `{other}`"
            )))
        }
    };
    url.set_scheme(scheme)
        .map_err(|_| Error::Validation("could not build websocket url".to_string()))?;
    Ok(url)
}

async fn dispatch_notification(state: &Arc<Mutex<ConnectionState>>, params: NotificationParams) {
    let callbacks: Vec<NotificationCallback> = {
        let state = state.lock().await;
        match state.groups.get(&params.sub_id) {
            Some(group) => group.callbacks.clone(),
            None => {
                tracing::debug!(sub_id = %params.sub_id, "notification for unknown subscription");
                return;
            }
        }
    };

    let results = join_all(
        callbacks
            .iter()
            .map(|callback| callback(params.payload.clone())),
    )
    .await;

    for result in results {
        if let Err(err) = result {
            tracing::warn!(sub_id = %params.sub_id, "subscription callback failed: {err}");
        }
    }
}

async fn handle_incoming(state: &Arc<Mutex<ConnectionState>>, text: &str) {
    let message = match serde_json::from_str::<IncomingMessage>(text) {
        Ok(message) => message,
        Err(err) => {
            tracing::debug!("ignoring unparseable websocket message: {err}");
            return;
        }
    };

    match message {
        IncomingMessage::Response { id, .. } => {
            let mut state = state.lock().await;
            state.pending.remove(&id);
        }
        IncomingMessage::Error { id, error } => {
            let mut state = state.lock().await;
            if let Some(sub_id) = state.pending.remove(&id) {
                tracing::warn!(
                    sub_id = %sub_id,
                    code = error.code,
                    "mint rejected subscription: {}",
                    error.message
                );
                state.groups.remove(&sub_id);
            }
        }
        IncomingMessage::Notification { params, .. } => {
            dispatch_notification(state, params).await;
        }
    }
}

impl SubscriptionManager {
    /// Create a new manager.
    pub fn new() -> Self {
        Self::default()
    }

    async fn connection(&self, mint_url: &MintUrl) -> Result<Arc<MintConnection>, Error> {
        let mut connections = self.connections.lock().await;

        if let Some(connection) = connections.get(mint_url) {
            if connection.is_alive() {
                return Ok(connection.clone());
            }
            connections.remove(mint_url);
        }

        let url = ws_url(mint_url)?;
        let (socket, _) = connect_async(url.as_str())
            .await
            .map_err(|err| Error::Network(err.to_string()))?;
        let (mut sink, mut stream) = socket.split();

        let (outgoing, mut outgoing_rx) = mpsc::unbounded_channel::<Message>();
        let state = Arc::new(Mutex::new(ConnectionState::default()));

        let reader_state = state.clone();
        let mint = mint_url.clone();
        let reader = tokio::spawn(async move {
            loop {
                tokio::select! {
                    queued = outgoing_rx.recv() => {
                        match queued {
                            Some(message) => {
                                if let Err(err) = sink.send(message).await {
                                    tracing::warn!(mint_url = %mint, "websocket send failed: {err}");
                                    break;
                                }
                            }
                            None => break,
                        }
                    }
                    received = stream.next() => {
                        match received {
                            Some(Ok(Message::Text(text))) => {
                                handle_incoming(&reader_state, text.as_ref()).await;
                            }
                            Some(Ok(Message::Ping(_) | Message::Pong(_))) => {}
                            Some(Ok(Message::Close(_))) | None => {
                                tracing::debug!(mint_url = %mint, "websocket closed by mint");
                                break;
                            }
                            Some(Ok(_)) => {}
                            Some(Err(err)) => {
                                tracing::warn!(mint_url = %mint, "websocket error: {err}");
                                break;
                            }
                        }
                    }
                }
            }
        });

        let connection = Arc::new(MintConnection {
            outgoing,
            state,
            reader,
        });
        connections.insert(mint_url.clone(), connection.clone());
        Ok(connection)
    }

    /// Subscribe to notifications of `kind` for the given filters.
    ///
    /// Filters beyond [`MAX_FILTERS_PER_SUBSCRIPTION`] are split into
    /// grouped subscriptions. Returns the subscription ids created.
    pub async fn subscribe(
        &self,
        mint_url: &MintUrl,
        kind: SubscriptionKind,
        filters: Vec<String>,
        callback: NotificationCallback,
    ) -> Result<Vec<String>, Error> {
        if filters.is_empty() {
            return Err(Error::Validation(
                "subscription filters must be non-empty".to_string(),
            ));
        }

        let connection = self.connection(mint_url).await?;
        let mut sub_ids = Vec::new();

        for batch in split_filters(filters) {
            let sub_id = format!("{}-{}", kind, Uuid::new_v4().simple());

            let request = {
                let mut state = connection.state.lock().await;
                let request_id = state.next_id();
                state.pending.insert(request_id, sub_id.clone());
                state.groups.insert(
                    sub_id.clone(),
                    SubscriptionGroup {
                        kind,
                        filters: batch.iter().cloned().collect(),
                        callbacks: vec![callback.clone()],
                    },
                );
                serde_json::to_string(&WsRequest {
                    jsonrpc: JSON_RPC_VERSION,
                    id: request_id,
                    method: "subscribe",
                    params: SubscribeParams {
                        kind,
                        sub_id: &sub_id,
                        filters: &batch,
                    },
                })?
            };

            connection
                .outgoing
                .send(Message::Text(request.into()))
                .map_err(|_| Error::Network("websocket connection is gone".to_string()))?;
            sub_ids.push(sub_id);
        }

        Ok(sub_ids)
    }

    /// Attach another callback to an existing subscription.
    pub async fn add_callback(
        &self,
        mint_url: &MintUrl,
        sub_id: &str,
        callback: NotificationCallback,
    ) -> Result<(), Error> {
        let connections = self.connections.lock().await;
        let connection = connections
            .get(mint_url)
            .ok_or_else(|| Error::Validation("no subscriptions for mint".to_string()))?;
        let mut state = connection.state.lock().await;
        let group = state
            .groups
            .get_mut(sub_id)
            .ok_or_else(|| Error::Validation(format!("unknown subscription `{sub_id}`")))?;
        group.callbacks.push(callback);
        Ok(())
    }

    /// Drop filters from every subscription of `kind`.
    ///
    /// A group whose remaining-filter set becomes empty is
    /// unsubscribed on the wire exactly once. Closing the last group
    /// tears the mint's connection down. Unknown filters are ignored,
    /// making this idempotent.
    pub async fn unsubscribe(
        &self,
        mint_url: &MintUrl,
        kind: SubscriptionKind,
        filters: &[String],
    ) -> Result<(), Error> {
        let mut connections = self.connections.lock().await;
        let Some(connection) = connections.get(mint_url).cloned() else {
            return Ok(());
        };

        let (emptied, no_groups_left) = {
            let mut state = connection.state.lock().await;
            let emptied = state.remove_filters(kind, filters);
            (emptied, state.groups.is_empty())
        };

        for sub_id in &emptied {
            let request = {
                let mut state = connection.state.lock().await;
                let request_id = state.next_id();
                serde_json::to_string(&WsRequest {
                    jsonrpc: JSON_RPC_VERSION,
                    id: request_id,
                    method: "unsubscribe",
                    params: UnsubscribeParams { sub_id },
                })?
            };
            // The connection may already be gone; unsubscribe stays
            // idempotent either way.
            let _ = connection.outgoing.send(Message::Text(request.into()));
        }

        if no_groups_left {
            connections.remove(mint_url);
        }

        Ok(())
    }

    /// Tear down every subscription of a mint.
    pub async fn stop_mint(&self, mint_url: &MintUrl) {
        let mut connections = self.connections.lock().await;
        connections.remove(mint_url);
    }

    /// Tear down every connection.
    pub async fn shutdown(&self) {
        let mut connections = self.connections.lock().await;
        connections.clear();
    }

    /// Number of live subscription groups for a mint.
    pub async fn group_count(&self, mint_url: &MintUrl) -> usize {
        let connections = self.connections.lock().await;
        match connections.get(mint_url) {
            Some(connection) => connection.state.lock().await.groups.len(),
            None => 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dummy_callback() -> NotificationCallback {
        Arc::new(|_| Box::pin(async { Ok(()) }))
    }

    fn group(kind: SubscriptionKind, filters: &[&str]) -> SubscriptionGroup {
        SubscriptionGroup {
            kind,
            filters: filters.iter().map(|f| f.to_string()).collect(),
            callbacks: vec![dummy_callback()],
        }
    }

    #[test]
    fn filters_split_into_batches_of_100() {
        let filters: Vec<String> = (0..250).map(|i| format!("quote-{i}")).collect();
        let batches = split_filters(filters);

        assert_eq!(batches.len(), 3);
        assert_eq!(batches[0].len(), 100);
        assert_eq!(batches[1].len(), 100);
        assert_eq!(batches[2].len(), 50);
    }

    #[test]
    fn small_filter_lists_stay_in_one_batch() {
        let batches = split_filters(vec!["a".to_string(), "b".to_string()]);
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0].len(), 2);
    }

    #[test]
    fn removing_filters_shrinks_and_reports_empty_groups() {
        let mut state = ConnectionState::default();
        state.groups.insert(
            "sub-1".to_string(),
            group(SubscriptionKind::Bolt11MintQuote, &["q1", "q2"]),
        );
        state.groups.insert(
            "sub-2".to_string(),
            group(SubscriptionKind::ProofState, &["y1"]),
        );

        // Shrinking leaves the group alive while filters remain.
        let emptied = state.remove_filters(SubscriptionKind::Bolt11MintQuote, &["q1".to_string()]);
        assert!(emptied.is_empty());
        assert_eq!(state.groups.len(), 2);

        // Wrong-kind removal never touches the group.
        let emptied = state.remove_filters(SubscriptionKind::Bolt11MeltQuote, &["y1".to_string()]);
        assert!(emptied.is_empty());

        // Last filter gone: the group is removed and reported once.
        let emptied = state.remove_filters(SubscriptionKind::Bolt11MintQuote, &["q2".to_string()]);
        assert_eq!(emptied, vec!["sub-1".to_string()]);
        assert_eq!(state.groups.len(), 1);

        // Idempotent: removing again reports nothing.
        let emptied = state.remove_filters(SubscriptionKind::Bolt11MintQuote, &["q2".to_string()]);
        assert!(emptied.is_empty());
    }

    #[test]
    fn subscribe_request_has_wire_shape() {
        let request = WsRequest {
            jsonrpc: JSON_RPC_VERSION,
            id: 7,
            method: "subscribe",
            params: SubscribeParams {
                kind: SubscriptionKind::ProofState,
                sub_id: "proof_state-abc",
                filters: &["02deadbeef".to_string()],
            },
        };

        let value = serde_json::to_value(&request).unwrap();
        assert_eq!(value["jsonrpc"], "2.0");
        assert_eq!(value["id"], 7);
        assert_eq!(value["method"], "subscribe");
        assert_eq!(value["params"]["kind"], "proof_state");
        assert_eq!(value["params"]["subId"], "proof_state-abc");
        assert_eq!(value["params"]["filters"][0], "02deadbeef");
    }

    #[test]
    fn incoming_messages_parse() {
        let response: IncomingMessage =
            serde_json::from_str(r#"{"jsonrpc":"2.0","id":1,"result":{"status":"OK","subId":"s"}}"#)
                .unwrap();
        assert!(matches!(response, IncomingMessage::Response { id: 1, .. }));

        let error: IncomingMessage = serde_json::from_str(
            r#"{"jsonrpc":"2.0","id":2,"error":{"code":-32601,"message":"no such method"}}"#,
        )
        .unwrap();
        assert!(matches!(error, IncomingMessage::Error { id: 2, .. }));

        let notification: IncomingMessage = serde_json::from_str(
            r#"{"jsonrpc":"2.0","method":"subscribe","params":{"subId":"s","payload":{"quote":"q1","request":"lnbc1...","state":"PAID","expiry":123}}}"#,
        )
        .unwrap();
        match notification {
            IncomingMessage::Notification { params, .. } => {
                assert_eq!(params.sub_id, "s");
                assert!(matches!(
                    params.payload,
                    NotificationPayload::MintQuote(ref quote) if quote.quote == "q1"
                ));
            }
            other => panic!("expected notification, got {other:?}"),
        }
    }

    #[test]
    fn ws_url_swaps_scheme() {
        let url = ws_url(&MintUrl::from_str("https://mint.example.com").unwrap()).unwrap();
        assert_eq!(url.to_string(), "wss://mint.example.com/v1/ws");

        let url = ws_url(&MintUrl::from_str("http://localhost:3338").unwrap()).unwrap();
        assert_eq!(url.to_string(), "ws://localhost:3338/v1/ws");
    }
}
