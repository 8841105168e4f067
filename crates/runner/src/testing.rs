//! Test doubles: a scripted in-memory page, and a scripted CDP endpoint for
//! exercising `CdpPage` over a real WebSocket.

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use leakwatch_core::{Error, Result};
use leakwatch_heap::builder::SnapshotBuilder;
use serde_json::{json, Value};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;

use crate::harness;
use crate::page::{Evaluation, ExecutionContextId, PageSession, SnapshotEvent};

pub fn boolean(value: bool) -> Evaluation {
    Evaluation {
        result: json!({ "type": "boolean", "value": value }),
        exception: None,
    }
}

pub fn thrown(details: Value) -> Evaluation {
    Evaluation {
        result: json!({ "type": "object", "subtype": "error" }),
        exception: Some(details),
    }
}

fn object(value: Value) -> Evaluation {
    Evaluation {
        result: json!({ "type": "object", "value": value }),
        exception: None,
    }
}

#[derive(Default)]
struct Script {
    resumes: VecDeque<Evaluation>,
    snapshots: VecDeque<Vec<String>>,
    tests: VecDeque<(String, String)>,
    counts: Option<Value>,
    missing: Vec<String>,
    no_context: bool,
    log: Vec<String>,
}

#[derive(Default)]
pub struct FakePage {
    script: Mutex<Script>,
}

impl FakePage {
    pub fn new() -> Self {
        Self::default()
    }

    fn with(self, f: impl FnOnce(&mut Script)) -> Self {
        f(&mut self.script.lock().unwrap());
        self
    }

    pub fn resumes(self, resumes: Vec<Evaluation>) -> Self {
        self.with(|s| s.resumes = resumes.into())
    }

    /// One entry per boundary, each a list of chunks.
    pub fn snapshots(self, snapshots: Vec<Vec<String>>) -> Self {
        self.with(|s| s.snapshots = snapshots.into())
    }

    pub fn tests(self, tests: Vec<(&str, &str)>) -> Self {
        self.with(|s| {
            s.tests = tests
                .into_iter()
                .map(|(m, n)| (m.to_string(), n.to_string()))
                .collect()
        })
    }

    pub fn counts(self, counts: Value) -> Self {
        self.with(|s| s.counts = Some(counts))
    }

    pub fn missing(self, missing: Vec<&str>) -> Self {
        self.with(|s| s.missing = missing.into_iter().map(String::from).collect())
    }

    pub fn without_context(self) -> Self {
        self.with(|s| s.no_context = true)
    }

    pub fn log(&self) -> Vec<String> {
        self.script.lock().unwrap().log.clone()
    }

    pub fn calls(&self, name: &str) -> usize {
        self.script
            .lock()
            .unwrap()
            .log
            .iter()
            .filter(|c| *c == name)
            .count()
    }

    fn record(&self, call: &str) {
        self.script.lock().unwrap().log.push(call.to_string());
    }

    /// A window holding an unrelated object, and no watched instances.
    pub fn clean() -> Vec<String> {
        let mut b = SnapshotBuilder::new();
        let window = b.node("object", "Window", 32);
        let widget = b.node("object", "Widget", 16);
        b.property(SnapshotBuilder::ROOT, window, "global");
        b.property(window, widget, "widget");
        split(b.build(), 3)
    }

    /// A `Container` @7 kept alive through an array on the window.
    pub fn leaking() -> Vec<String> {
        let mut b = SnapshotBuilder::new();
        let window = b.node("object", "Window", 32);
        let list = b.node("array", "", 16);
        let container = b.node("object", "Container", 40);
        b.property(SnapshotBuilder::ROOT, window, "global");
        b.property(window, list, "items");
        b.element(list, container, 0);
        split(b.build(), 2)
    }

    /// A `Container` only reachable through a weak edge.
    pub fn orphaned() -> Vec<String> {
        let mut b = SnapshotBuilder::new();
        let window = b.node("object", "Window", 32);
        let container = b.node("object", "Container", 40);
        b.property(SnapshotBuilder::ROOT, window, "global");
        b.weak(window, container, "cache");
        vec![b.build()]
    }
}

/// Cut a payload into `parts` pieces on char boundaries.
pub fn split(payload: String, parts: usize) -> Vec<String> {
    let chars: Vec<char> = payload.chars().collect();
    let size = chars.len().div_ceil(parts.max(1)).max(1);
    chars.chunks(size).map(|c| c.iter().collect()).collect()
}

#[async_trait]
impl PageSession for FakePage {
    async fn prepare(&self, bootstrap: &str) -> Result<()> {
        assert_eq!(bootstrap, harness::BOOTSTRAP);
        self.record("prepare");
        Ok(())
    }

    async fn open(&self, url: &str) -> Result<ExecutionContextId> {
        self.record("open");
        if self.script.lock().unwrap().no_context {
            return Err(Error::Connection(format!(
                "No execution context was created for {}",
                url
            )));
        }
        Ok(ExecutionContextId(1))
    }

    async fn evaluate(
        &self,
        context: ExecutionContextId,
        expression: &str,
        await_promise: bool,
    ) -> Result<Evaluation> {
        assert_eq!(context, ExecutionContextId(1));
        let mut script = self.script.lock().unwrap();
        match expression {
            harness::CAPABILITY_CHECK => {
                script.log.push("capability".to_string());
                Ok(object(json!(script.missing)))
            }
            harness::RESUME => {
                assert!(await_promise);
                script.log.push("resume".to_string());
                script
                    .resumes
                    .pop_front()
                    .ok_or_else(|| Error::Other("no scripted resume left".to_string()))
            }
            harness::CURRENT_TEST => {
                script.log.push("current".to_string());
                Ok(match script.tests.pop_front() {
                    Some((module, name)) => object(json!({ "module": module, "name": name })),
                    None => object(Value::Null),
                })
            }
            harness::RUN_COUNTS => {
                script.log.push("counts".to_string());
                Ok(object(script.counts.clone().unwrap_or(Value::Null)))
            }
            other => Err(Error::Other(format!("unexpected expression {}", other))),
        }
    }

    async fn run_script(
        &self,
        _context: ExecutionContextId,
        source: &str,
        source_url: &str,
    ) -> Result<Evaluation> {
        assert_eq!(source, harness::ATTACH);
        assert_eq!(source_url, harness::ATTACH_SOURCE_URL);
        self.record("attach");
        Ok(boolean(true))
    }

    async fn collect_garbage(&self) -> Result<()> {
        self.record("gc");
        Ok(())
    }

    async fn take_heap_snapshot(&self, events: mpsc::UnboundedSender<SnapshotEvent>) -> Result<()> {
        let chunks = {
            let mut script = self.script.lock().unwrap();
            script.log.push("snapshot".to_string());
            script
                .snapshots
                .pop_front()
                .ok_or_else(|| Error::Other("no scripted snapshot left".to_string()))?
        };
        let total = chunks.len() as u64;
        for (i, chunk) in chunks.into_iter().enumerate() {
            let _ = events.send(SnapshotEvent::Progress {
                done: i as u64,
                total,
                finished: false,
            });
            let _ = events.send(SnapshotEvent::Chunk(chunk));
        }
        let _ = events.send(SnapshotEvent::Progress {
            done: total,
            total,
            finished: true,
        });
        Ok(())
    }
}

/// Requests a scripted endpoint has received, in order.
pub type Requests = Arc<Mutex<Vec<Value>>>;

pub fn event(method: &str, params: Value) -> Value {
    json!({ "method": method, "params": params })
}

/// Serve one CDP connection on a local port. Every command is answered by
/// `respond`: its events go out first, in order, then the response.
pub async fn serve_cdp<F>(respond: F) -> (String, Requests)
where
    F: Fn(&Value) -> (Vec<Value>, Value) + Send + 'static,
{
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let requests: Requests = Arc::new(Mutex::new(Vec::new()));
    let seen = requests.clone();
    tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();
        while let Some(Ok(Message::Text(text))) = ws.next().await {
            let request: Value = serde_json::from_str(&text).unwrap();
            seen.lock().unwrap().push(request.clone());
            let (events, mut response) = respond(&request);
            for event in events {
                if ws.send(Message::Text(event.to_string())).await.is_err() {
                    return;
                }
            }
            response["id"] = request["id"].clone();
            if ws.send(Message::Text(response.to_string())).await.is_err() {
                return;
            }
        }
    });
    (format!("ws://{}", addr), requests)
}

pub fn methods(requests: &Requests) -> Vec<String> {
    requests
        .lock()
        .unwrap()
        .iter()
        .map(|r| r["method"].as_str().unwrap_or_default().to_string())
        .collect()
}
