//! Snapshot acquisition: collect garbage, stream a heap snapshot, parse it.

use leakwatch_core::Result;
use leakwatch_heap::HeapSnapshot;
use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::page::{PageSession, SnapshotEvent};

#[derive(Debug, Default)]
struct Assembled {
    payload: String,
    chunks: usize,
}

async fn assemble(mut events: mpsc::UnboundedReceiver<SnapshotEvent>) -> Assembled {
    let mut assembled = Assembled::default();
    while let Some(event) = events.recv().await {
        match event {
            SnapshotEvent::Chunk(chunk) => {
                assembled.payload.push_str(&chunk);
                assembled.chunks += 1;
            }
            SnapshotEvent::Progress {
                done,
                total,
                finished,
            } => {
                debug!(done, total, finished, "Heap snapshot progress");
            }
        }
    }
    assembled
}

/// Force a collection, then capture and parse a full heap snapshot.
///
/// Chunks are concatenated in emission order. A failed request or an
/// unparseable payload is an error; a partial snapshot is never returned.
pub async fn capture<P: PageSession + ?Sized>(page: &P) -> Result<HeapSnapshot> {
    page.collect_garbage().await?;

    let (tx, rx) = mpsc::unbounded_channel();
    let (requested, assembled) = tokio::join!(page.take_heap_snapshot(tx), assemble(rx));
    requested?;

    let Assembled { payload, chunks } = assembled;
    let bytes = payload.len();
    let snapshot = HeapSnapshot::parse(&payload)?;
    drop(payload);

    info!(
        chunks,
        bytes,
        nodes = snapshot.node_count(),
        edges = snapshot.edge_count(),
        "Heap snapshot captured"
    );
    Ok(snapshot)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{split, FakePage};
    use leakwatch_core::Error;

    #[tokio::test]
    async fn test_collects_before_snapshot() {
        let page = FakePage::new().snapshots(vec![FakePage::clean()]);
        capture(&page).await.unwrap();
        assert_eq!(page.log(), vec!["gc", "snapshot"]);
    }

    #[tokio::test]
    async fn test_chunks_concatenate_in_order() {
        let whole = FakePage::leaking().concat();
        let page = FakePage::new().snapshots(vec![split(whole.clone(), 7), vec![whole]]);

        let chunked = capture(&page).await.unwrap();
        let single = capture(&page).await.unwrap();
        assert_eq!(chunked.node_count(), single.node_count());
        assert_eq!(chunked.edge_count(), single.edge_count());
        assert_eq!(chunked.node_count(), 4);
    }

    #[tokio::test]
    async fn test_truncated_payload_is_a_parse_error() {
        let mut chunks = FakePage::clean();
        chunks.pop();
        let page = FakePage::new().snapshots(vec![chunks]);
        let err = capture(&page).await.unwrap_err();
        assert!(matches!(err, Error::SnapshotParse(_)));
    }

    #[tokio::test]
    async fn test_failed_request_propagates() {
        let page = FakePage::new();
        assert!(capture(&page).await.is_err());
        assert_eq!(page.calls("gc"), 1);
    }
}
