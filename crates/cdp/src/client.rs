//! Low-level Chrome DevTools Protocol (CDP) client over WebSocket.
//!
//! Communicates with a page target via its debugging WebSocket endpoint.
//! Commands are matched to responses by request ID; events are routed to at
//! most one subscriber per event name.

use leakwatch_core::{Error, Result};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, Mutex};
use tracing::{debug, error, warn};

type Pending = Arc<Mutex<HashMap<u64, oneshot::Sender<Value>>>>;
type Listeners = Arc<Mutex<HashMap<String, mpsc::UnboundedSender<Value>>>>;

/// A CDP WebSocket client that can send commands and receive responses/events.
pub struct CdpClient {
    /// Sender to write messages to the WebSocket.
    ws_tx: mpsc::Sender<String>,
    /// Pending command responses, keyed by request ID.
    pending: Pending,
    /// Auto-incrementing command ID.
    next_id: AtomicU64,
    /// Event subscribers (Domain.event -> channel), one per event name.
    listeners: Listeners,
    /// Applied by `send_command`. `None` waits forever.
    command_timeout: Option<Duration>,
    /// Handle to the reader task so we can abort on close.
    _reader_handle: tokio::task::JoinHandle<()>,
    /// Handle to the writer task.
    _writer_handle: tokio::task::JoinHandle<()>,
}

/// Events for a single method, in arrival order.
///
/// Dropping the stream ends the subscription; the slot can then be claimed
/// again with [`CdpClient::subscribe`].
pub struct EventStream {
    method: String,
    rx: mpsc::UnboundedReceiver<Value>,
}

impl EventStream {
    pub fn method(&self) -> &str {
        &self.method
    }

    /// Next event's params. `None` once the connection is gone.
    pub async fn next(&mut self) -> Option<Value> {
        self.rx.recv().await
    }

    /// An event that has already been dispatched, without waiting.
    pub fn try_next(&mut self) -> Option<Value> {
        self.rx.try_recv().ok()
    }
}

impl CdpClient {
    /// Connect to a Chrome CDP WebSocket endpoint.
    pub async fn connect(ws_url: &str, command_timeout: Option<Duration>) -> Result<Self> {
        use futures::{SinkExt, StreamExt};
        use tokio_tungstenite::connect_async;
        use tokio_tungstenite::tungstenite::Message;

        let url = url::Url::parse(ws_url)
            .map_err(|e| Error::Connection(format!("Invalid CDP endpoint {}: {}", ws_url, e)))?;

        let (ws_stream, _) = connect_async(url).await.map_err(|e| {
            Error::Connection(format!("Failed to connect to CDP endpoint {}: {}", ws_url, e))
        })?;

        let (mut ws_sink, mut ws_stream_read) = ws_stream.split();

        // Channel for outgoing messages
        let (ws_tx, mut ws_rx) = mpsc::channel::<String>(256);

        let pending: Pending = Arc::new(Mutex::new(HashMap::new()));
        let pending_clone = pending.clone();

        let listeners: Listeners = Arc::new(Mutex::new(HashMap::new()));
        let listeners_clone = listeners.clone();

        // Writer task: owns the sink, forwards messages from channel
        let writer_handle = tokio::spawn(async move {
            while let Some(msg) = ws_rx.recv().await {
                if let Err(e) = ws_sink.send(Message::Text(msg)).await {
                    error!("CDP WebSocket write error: {}", e);
                    break;
                }
            }
        });

        // Reader task: reads from WebSocket, dispatches responses and events
        // in arrival order, so every event sent before a response is queued
        // for its subscriber before that response resolves.
        let reader_handle = tokio::spawn(async move {
            while let Some(msg_result) = ws_stream_read.next().await {
                match msg_result {
                    Ok(Message::Text(text)) => {
                        let Ok(val) = serde_json::from_str::<Value>(&text) else {
                            warn!("Ignoring malformed CDP message");
                            continue;
                        };
                        if let Some(id) = val.get("id").and_then(|v| v.as_u64()) {
                            let mut pending = pending_clone.lock().await;
                            if let Some(tx) = pending.remove(&id) {
                                let _ = tx.send(val);
                            }
                        } else if let Some(method) = val.get("method").and_then(|v| v.as_str()) {
                            let mut listeners = listeners_clone.lock().await;
                            if let Some(tx) = listeners.get(method) {
                                let params = val.get("params").cloned().unwrap_or(Value::Null);
                                if tx.send(params).is_err() {
                                    listeners.remove(method);
                                }
                            }
                        }
                    }
                    Ok(Message::Close(_)) => {
                        debug!("CDP WebSocket closed by server");
                        break;
                    }
                    Err(e) => {
                        warn!("CDP WebSocket read error: {}", e);
                        break;
                    }
                    _ => {}
                }
            }
            // Wake everyone still waiting on this connection.
            pending_clone.lock().await.clear();
            listeners_clone.lock().await.clear();
        });

        Ok(Self {
            ws_tx,
            pending,
            next_id: AtomicU64::new(1),
            listeners,
            command_timeout,
            _reader_handle: reader_handle,
            _writer_handle: writer_handle,
        })
    }

    /// Send a CDP command and wait for the response, bounded by the client's
    /// command timeout.
    pub async fn send_command(&self, method: &str, params: Value) -> Result<Value> {
        self.send_command_with_timeout(method, params, self.command_timeout)
            .await
    }

    /// Send a CDP command and wait however long the browser takes.
    pub async fn send_command_unbounded(&self, method: &str, params: Value) -> Result<Value> {
        self.send_command_with_timeout(method, params, None).await
    }

    pub async fn send_command_with_timeout(
        &self,
        method: &str,
        params: Value,
        timeout: Option<Duration>,
    ) -> Result<Value> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);

        let msg = json!({
            "id": id,
            "method": method,
            "params": params,
        });

        let (tx, rx) = oneshot::channel();
        {
            let mut pending = self.pending.lock().await;
            pending.insert(id, tx);
        }

        if let Err(e) = self.ws_tx.send(msg.to_string()).await {
            self.pending.lock().await.remove(&id);
            return Err(Error::Protocol(format!(
                "Failed to send CDP command {}: {}",
                method, e
            )));
        }

        let response = match timeout {
            Some(limit) => match tokio::time::timeout(limit, rx).await {
                Ok(received) => received,
                Err(_) => {
                    let mut pending = self.pending.lock().await;
                    pending.remove(&id);
                    return Err(Error::Protocol(format!(
                        "CDP command '{}' timed out after {}s",
                        method,
                        limit.as_secs()
                    )));
                }
            },
            None => rx.await,
        };

        let response = response.map_err(|_| {
            Error::Protocol(format!("CDP connection closed while waiting for '{}'", method))
        })?;

        if let Some(error) = response.get("error") {
            Err(Error::Protocol(format!("CDP error from '{}': {}", method, error)))
        } else {
            Ok(response.get("result").cloned().unwrap_or(Value::Null))
        }
    }

    /// Subscribe to a CDP event. Only one live subscriber per event name is
    /// allowed; a dropped stream frees the slot.
    pub async fn subscribe(&self, method: &str) -> Result<EventStream> {
        let mut listeners = self.listeners.lock().await;
        if let Some(existing) = listeners.get(method) {
            if !existing.is_closed() {
                return Err(Error::Protocol(format!(
                    "Event '{}' already has a subscriber",
                    method
                )));
            }
        }
        let (tx, rx) = mpsc::unbounded_channel();
        listeners.insert(method.to_string(), tx);
        Ok(EventStream {
            method: method.to_string(),
            rx,
        })
    }

    /// Wait for the next occurrence of an event and unsubscribe.
    pub async fn wait_for_event(&self, method: &str) -> Result<Value> {
        let mut stream = self.subscribe(method).await?;
        stream
            .next()
            .await
            .ok_or_else(|| Error::Connection(format!("Connection closed before '{}'", method)))
    }

    /// Enable a CDP domain (e.g., "Page", "Runtime", "HeapProfiler").
    pub async fn enable_domain(&self, domain: &str) -> Result<()> {
        self.send_command(&format!("{}.enable", domain), json!({}))
            .await?;
        Ok(())
    }

    /// Start a navigation. Load completion is reported by `Page.loadEventFired`.
    pub async fn navigate(&self, url: &str) -> Result<Value> {
        let result = self
            .send_command("Page.navigate", json!({ "url": url }))
            .await?;
        if let Some(text) = result.get("errorText").and_then(|v| v.as_str()) {
            return Err(Error::Connection(format!("Navigation to {} failed: {}", url, text)));
        }
        Ok(result)
    }

    /// Register a script that runs in every new document before its own scripts.
    pub async fn add_script_to_evaluate_on_new_document(&self, source: &str) -> Result<String> {
        let result = self
            .send_command(
                "Page.addScriptToEvaluateOnNewDocument",
                json!({ "source": source }),
            )
            .await?;
        Ok(result
            .get("identifier")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string())
    }

    /// Evaluate an expression in an execution context. Awaiting evaluations
    /// are unbounded: the page decides when the promise settles.
    pub async fn evaluate(
        &self,
        context_id: i64,
        expression: &str,
        await_promise: bool,
    ) -> Result<Value> {
        let params = json!({
            "contextId": context_id,
            "expression": expression,
            "returnByValue": true,
            "awaitPromise": await_promise,
        });
        if await_promise {
            self.send_command_unbounded("Runtime.evaluate", params).await
        } else {
            self.send_command("Runtime.evaluate", params).await
        }
    }

    /// Compile a script against a context. Returns the raw result, which holds
    /// either `scriptId` or `exceptionDetails`.
    pub async fn compile_script(
        &self,
        context_id: i64,
        source: &str,
        source_url: &str,
    ) -> Result<Value> {
        self.send_command(
            "Runtime.compileScript",
            json!({
                "expression": source,
                "sourceURL": source_url,
                "persistScript": true,
                "executionContextId": context_id,
            }),
        )
        .await
    }

    pub async fn run_script(&self, context_id: i64, script_id: &str) -> Result<Value> {
        self.send_command(
            "Runtime.runScript",
            json!({
                "scriptId": script_id,
                "executionContextId": context_id,
                "returnByValue": true,
            }),
        )
        .await
    }

    /// Blocking forced garbage collection in the page's isolate.
    pub async fn collect_garbage(&self) -> Result<()> {
        self.send_command_unbounded("HeapProfiler.collectGarbage", json!({}))
            .await?;
        Ok(())
    }

    /// Request a heap snapshot. Data arrives as `HeapProfiler.addHeapSnapshotChunk`
    /// events before this command returns.
    pub async fn take_heap_snapshot(&self, report_progress: bool) -> Result<()> {
        self.send_command_unbounded(
            "HeapProfiler.takeHeapSnapshot",
            json!({ "reportProgress": report_progress }),
        )
        .await?;
        Ok(())
    }

    /// Ask the browser to shut down. Fails harmlessly on a page-only endpoint.
    pub async fn close_browser(&self) -> Result<()> {
        self.send_command("Browser.close", json!({})).await?;
        Ok(())
    }
}

impl Drop for CdpClient {
    fn drop(&mut self) {
        self._reader_handle.abort();
        self._writer_handle.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::{SinkExt, StreamExt};
    use tokio::net::TcpListener;
    use tokio_tungstenite::tungstenite::Message;

    /// Serve one WebSocket connection, answering each command with `respond`.
    /// Returned events are sent before the response.
    async fn serve<F>(respond: F) -> String
    where
        F: Fn(&Value) -> (Vec<Value>, Value) + Send + 'static,
    {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();
            while let Some(Ok(Message::Text(text))) = ws.next().await {
                let request: Value = serde_json::from_str(&text).unwrap();
                let (events, mut response) = respond(&request);
                for event in events {
                    ws.send(Message::Text(event.to_string())).await.unwrap();
                }
                response["id"] = request["id"].clone();
                ws.send(Message::Text(response.to_string())).await.unwrap();
            }
        });
        format!("ws://{}", addr)
    }

    #[tokio::test]
    async fn test_command_round_trip() {
        let url = serve(|req| {
            assert_eq!(req["method"], "Runtime.evaluate");
            (vec![], json!({ "result": { "result": { "type": "boolean", "value": true } } }))
        })
        .await;
        let client = CdpClient::connect(&url, Some(Duration::from_secs(5)))
            .await
            .unwrap();
        let result = client.evaluate(1, "true", false).await.unwrap();
        assert_eq!(result["result"]["value"], json!(true));
    }

    #[tokio::test]
    async fn test_error_response_maps_to_protocol_error() {
        let url = serve(|_| (vec![], json!({ "error": { "code": -32601, "message": "nope" } }))).await;
        let client = CdpClient::connect(&url, None).await.unwrap();
        let err = client.enable_domain("Bogus").await.unwrap_err();
        assert!(matches!(err, Error::Protocol(msg) if msg.contains("nope")));
    }

    #[tokio::test]
    async fn test_events_arrive_before_response_in_order() {
        let url = serve(|_| {
            let chunks = ["{\"a\":", "1}"]
                .iter()
                .map(|c| {
                    json!({
                        "method": "HeapProfiler.addHeapSnapshotChunk",
                        "params": { "chunk": c }
                    })
                })
                .collect();
            (chunks, json!({ "result": {} }))
        })
        .await;
        let client = CdpClient::connect(&url, None).await.unwrap();
        let mut chunks = client
            .subscribe("HeapProfiler.addHeapSnapshotChunk")
            .await
            .unwrap();
        client.take_heap_snapshot(false).await.unwrap();

        let mut payload = String::new();
        while let Some(event) = chunks.try_next() {
            payload.push_str(event["chunk"].as_str().unwrap());
        }
        assert_eq!(payload, "{\"a\":1}");
    }

    #[tokio::test]
    async fn test_single_subscriber_per_event() {
        let url = serve(|_| (vec![], json!({ "result": {} }))).await;
        let client = CdpClient::connect(&url, None).await.unwrap();

        let first = client.subscribe("Page.loadEventFired").await.unwrap();
        assert_eq!(first.method(), "Page.loadEventFired");
        assert!(client.subscribe("Page.loadEventFired").await.is_err());

        drop(first);
        assert!(client.subscribe("Page.loadEventFired").await.is_ok());
    }

    #[tokio::test]
    async fn test_failed_send_leaves_nothing_pending() {
        let url = serve(|_| (vec![], json!({ "result": {} }))).await;
        let mut client = CdpClient::connect(&url, None).await.unwrap();
        client._writer_handle.abort();
        let _ = (&mut client._writer_handle).await;

        let err = client.enable_domain("Page").await.unwrap_err();
        assert!(matches!(err, Error::Protocol(msg) if msg.contains("Failed to send")));
        assert!(client.pending.lock().await.is_empty());
    }

    #[tokio::test]
    async fn test_navigation_error_text_is_connection_error() {
        let url = serve(|_| {
            (vec![], json!({ "result": { "frameId": "F", "errorText": "net::ERR_NAME_NOT_RESOLVED" } }))
        })
        .await;
        let client = CdpClient::connect(&url, None).await.unwrap();
        let err = client.navigate("http://nowhere.invalid").await.unwrap_err();
        assert!(matches!(err, Error::Connection(_)));
    }
}
