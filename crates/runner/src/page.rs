//! The protocol surface a run needs, and its CDP implementation.

use async_trait::async_trait;
use leakwatch_cdp::CdpClient;
use leakwatch_core::{Error, Result};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExecutionContextId(pub i64);

/// Outcome of evaluating script in the page.
#[derive(Debug, Clone, PartialEq)]
pub struct Evaluation {
    /// The protocol's `RemoteObject` for the completion value.
    pub result: Value,
    /// The protocol's `exceptionDetails`, untouched, when the script threw.
    pub exception: Option<Value>,
}

impl Evaluation {
    pub fn from_response(response: &Value) -> Self {
        Self {
            result: response.get("result").cloned().unwrap_or(Value::Null),
            exception: response.get("exceptionDetails").cloned(),
        }
    }

    /// The returned value, or a `ScriptEvaluation` error carrying the
    /// exception details as reported.
    pub fn into_value(self, context: &str) -> Result<Value> {
        if let Some(details) = self.exception {
            return Err(Error::ScriptEvaluation {
                context: context.to_string(),
                details,
            });
        }
        Ok(self.result.get("value").cloned().unwrap_or(Value::Null))
    }
}

/// Streamed output of a heap snapshot request.
#[derive(Debug, Clone, PartialEq)]
pub enum SnapshotEvent {
    Chunk(String),
    Progress { done: u64, total: u64, finished: bool },
}

/// Everything the controller asks of the browser page.
#[async_trait]
pub trait PageSession: Send + Sync {
    /// Enable the protocol domains and register `bootstrap` to run in every
    /// new document ahead of the page's own scripts.
    async fn prepare(&self, bootstrap: &str) -> Result<()>;

    /// Navigate and wait for the page's default execution context and its
    /// load event.
    async fn open(&self, url: &str) -> Result<ExecutionContextId>;

    async fn evaluate(
        &self,
        context: ExecutionContextId,
        expression: &str,
        await_promise: bool,
    ) -> Result<Evaluation>;

    /// Compile and run a script against a context.
    async fn run_script(
        &self,
        context: ExecutionContextId,
        source: &str,
        source_url: &str,
    ) -> Result<Evaluation>;

    /// Blocking forced garbage collection.
    async fn collect_garbage(&self) -> Result<()>;

    /// Request a snapshot and forward its chunks and progress, in emission
    /// order. Returns once the browser reports the snapshot complete.
    async fn take_heap_snapshot(&self, events: mpsc::UnboundedSender<SnapshotEvent>) -> Result<()>;
}

/// A page driven over a [`CdpClient`].
pub struct CdpPage {
    client: Arc<CdpClient>,
    /// Bound on navigation producing a context and a load event. `None`
    /// waits forever.
    load_timeout: Option<Duration>,
}

impl CdpPage {
    pub fn new(client: Arc<CdpClient>, load_timeout: Option<Duration>) -> Self {
        Self {
            client,
            load_timeout,
        }
    }

    pub fn client(&self) -> &CdpClient {
        &self.client
    }

    async fn relay_console(&self) -> Result<()> {
        let mut stream = self.client.subscribe("Runtime.consoleAPICalled").await?;
        tokio::spawn(async move {
            while let Some(event) = stream.next().await {
                let level = event.get("type").and_then(|v| v.as_str()).unwrap_or("log");
                let text = console_text(&event);
                match level {
                    "error" | "assert" => error!(target: "leakwatch::console", "{}", text),
                    "warning" => warn!(target: "leakwatch::console", "{}", text),
                    "debug" => debug!(target: "leakwatch::console", "{}", text),
                    _ => info!(target: "leakwatch::console", "{}", text),
                }
            }
        });
        Ok(())
    }
}

/// Join console arguments the way the browser console prints them.
fn console_text(event: &Value) -> String {
    event
        .get("args")
        .and_then(|v| v.as_array())
        .map(|args| {
            args.iter()
                .map(|arg| match arg.get("value") {
                    Some(Value::String(s)) => s.clone(),
                    Some(other) => other.to_string(),
                    None => arg
                        .get("description")
                        .and_then(|v| v.as_str())
                        .unwrap_or_default()
                        .to_string(),
                })
                .collect::<Vec<_>>()
                .join(" ")
        })
        .unwrap_or_default()
}

fn is_default_context_of(event: &Value, frame_id: Option<&str>) -> bool {
    let aux = event.get("context").and_then(|c| c.get("auxData"));
    let is_default = aux
        .and_then(|a| a.get("isDefault"))
        .and_then(|v| v.as_bool())
        .unwrap_or(false);
    let same_frame = match frame_id {
        Some(frame) => aux.and_then(|a| a.get("frameId")).and_then(|v| v.as_str()) == Some(frame),
        None => true,
    };
    is_default && same_frame
}

#[async_trait]
impl PageSession for CdpPage {
    async fn prepare(&self, bootstrap: &str) -> Result<()> {
        for domain in ["Page", "Runtime", "HeapProfiler"] {
            self.client.enable_domain(domain).await?;
        }
        self.relay_console().await?;
        self.client
            .add_script_to_evaluate_on_new_document(bootstrap)
            .await?;
        Ok(())
    }

    async fn open(&self, url: &str) -> Result<ExecutionContextId> {
        // Subscribe before navigating so neither event can slip past.
        let mut contexts = self
            .client
            .subscribe("Runtime.executionContextCreated")
            .await?;
        let mut loads = self.client.subscribe("Page.loadEventFired").await?;

        let navigation = self.client.navigate(url).await?;
        let frame_id = navigation.get("frameId").and_then(|v| v.as_str());

        let loaded = async {
            let context = loop {
                let event = contexts.next().await.ok_or_else(|| {
                    Error::Connection(format!("No execution context was created for {}", url))
                })?;
                if is_default_context_of(&event, frame_id) {
                    let id = event
                        .get("context")
                        .and_then(|c| c.get("id"))
                        .and_then(|v| v.as_i64())
                        .ok_or_else(|| {
                            Error::Connection("Execution context event without an id".to_string())
                        })?;
                    break ExecutionContextId(id);
                }
            };
            debug!(context = context.0, "Page execution context created");

            loads.next().await.ok_or_else(|| {
                Error::Connection(format!("Connection closed before {} finished loading", url))
            })?;
            Ok::<_, Error>(context)
        };

        let context = match self.load_timeout {
            Some(limit) => tokio::time::timeout(limit, loaded).await.map_err(|_| {
                Error::Connection(format!(
                    "{} produced no execution context and load event within {:?}",
                    url, limit
                ))
            })??,
            None => loaded.await?,
        };
        info!(url = %url, "Page loaded");
        Ok(context)
    }

    async fn evaluate(
        &self,
        context: ExecutionContextId,
        expression: &str,
        await_promise: bool,
    ) -> Result<Evaluation> {
        let response = self
            .client
            .evaluate(context.0, expression, await_promise)
            .await?;
        Ok(Evaluation::from_response(&response))
    }

    async fn run_script(
        &self,
        context: ExecutionContextId,
        source: &str,
        source_url: &str,
    ) -> Result<Evaluation> {
        let compiled = self
            .client
            .compile_script(context.0, source, source_url)
            .await?;
        if let Some(details) = compiled.get("exceptionDetails") {
            return Ok(Evaluation {
                result: Value::Null,
                exception: Some(details.clone()),
            });
        }
        let script_id = compiled
            .get("scriptId")
            .and_then(|v| v.as_str())
            .ok_or_else(|| Error::UnexpectedResult {
                context: "Runtime.compileScript".to_string(),
                value: compiled.clone(),
            })?;
        let response = self.client.run_script(context.0, script_id).await?;
        Ok(Evaluation::from_response(&response))
    }

    async fn collect_garbage(&self) -> Result<()> {
        self.client.collect_garbage().await
    }

    async fn take_heap_snapshot(&self, events: mpsc::UnboundedSender<SnapshotEvent>) -> Result<()> {
        let mut chunks = self
            .client
            .subscribe("HeapProfiler.addHeapSnapshotChunk")
            .await?;
        let mut progress = self
            .client
            .subscribe("HeapProfiler.reportHeapSnapshotProgress")
            .await?;

        let forward = |event: SnapshotEvent| {
            events
                .send(event)
                .map_err(|_| Error::Other("Snapshot consumer went away".to_string()))
        };
        let chunk_of = |params: Value| {
            SnapshotEvent::Chunk(
                params
                    .get("chunk")
                    .and_then(|v| v.as_str())
                    .unwrap_or_default()
                    .to_string(),
            )
        };

        let request = self.client.take_heap_snapshot(true);
        tokio::pin!(request);
        loop {
            tokio::select! {
                biased;
                Some(params) = chunks.next() => forward(chunk_of(params))?,
                Some(params) = progress.next() => forward(SnapshotEvent::Progress {
                    done: params.get("done").and_then(|v| v.as_u64()).unwrap_or(0),
                    total: params.get("total").and_then(|v| v.as_u64()).unwrap_or(0),
                    finished: params.get("finished").and_then(|v| v.as_bool()).unwrap_or(false),
                })?,
                result = &mut request => {
                    result?;
                    break;
                }
            }
        }

        // Chunks dispatched before the response are already queued.
        while let Some(params) = chunks.try_next() {
            forward(chunk_of(params))?;
        }
        Ok(())
    }
}
