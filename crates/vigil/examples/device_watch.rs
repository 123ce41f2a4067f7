//! Device watch example: one document followed through a handle and a
//! stream, across an upstream failure and recovery.
//!
//! ```bash
//! cargo run --example device_watch
//! ```

use serde_json::json;
use tokio_stream::StreamExt;
use vigil::prelude::*;

fn reading(version: u64, status: &str) -> Document {
    let fields = json!({ "status": status, "firmware": "2.4.1" });
    Document::new(
        "hw-01",
        Version(version),
        fields.as_object().cloned().unwrap_or_default(),
    )
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let source = MemorySource::new();
    let client = VigilClient::new(source.clone());

    let path = DocumentPath::new("devices", "hw-01");
    let sensor = client.live_document(path.clone())?;
    let mut feed = client.stream_query(path.clone())?;

    // Handle and stream share one entry and one upstream subscription.
    println!(
        "entries: {}, upstream subscriptions: {}",
        client.entry_count(),
        source.subscribe_count()
    );

    // First item is the current state: the store answered, no such device.
    let state = feed.next().await.expect("stream is live");
    println!("[feed] device exists: {}", state.data().is_some_and(|s| !s.is_empty()));

    source.publish_document(path.clone(), Some(reading(1, "online")))?;
    let state = feed.next().await.expect("stream is live");
    if let Some(doc) = state.data().and_then(Snapshot::first) {
        println!("[feed] v{} status {:?}", doc.version(), doc.field("status"));
    }
    println!(
        "[sensor] status: {:?}",
        sensor.document().and_then(|d| d.field("status").cloned())
    );

    // The gateway drops; consumers keep the last good reading.
    source.publish_error(
        path.clone(),
        CacheError::UpstreamUnavailable("gateway rebooting".into()),
    )?;
    let state = feed.next().await.expect("stream is live");
    println!(
        "[feed] error: {:?}, last known reading kept: {}",
        state.error().map(ToString::to_string),
        state.data().is_some()
    );

    // Recovery republishes the same reading: the error clears even though
    // the data did not change.
    source.publish_document(path.clone(), Some(reading(1, "online")))?;
    let state = feed.next().await.expect("stream is live");
    println!("[feed] error cleared: {}", state.error().is_none());

    // A real change comes through with a version bump.
    source.publish_document(path, Some(reading(2, "offline")))?;
    let state = feed.next().await.expect("stream is live");
    if let Some(doc) = state.data().and_then(Snapshot::first) {
        println!("[feed] v{} status {:?}", doc.version(), doc.field("status"));
    }

    drop(feed);
    drop(sensor);
    println!("entries after shutdown: {}", client.entry_count());

    Ok(())
}
