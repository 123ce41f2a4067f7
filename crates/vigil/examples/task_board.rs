//! Task board example: several widgets watch the same query through one
//! shared upstream subscription.
//!
//! ```bash
//! cargo run --example task_board
//! ```

use serde_json::json;
use vigil::prelude::*;

fn task(id: &str, version: u64, title: &str, status: &str) -> Document {
    let fields = json!({ "title": title, "status": status });
    Document::new(
        id,
        Version(version),
        fields.as_object().cloned().unwrap_or_default(),
    )
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let source = MemorySource::new();
    let client = VigilClient::new(source.clone());

    // The list widget and the counter badge describe the same query with
    // their filters in a different order; both collapse to one key.
    let list_query = Query::collection("tasks")
        .filter("team", FilterOp::Eq, "atlas")
        .filter("status", FilterOp::Ne, "done")
        .order_by("createdAt", Direction::Desc);
    let badge_query = Query::collection("tasks")
        .filter("status", FilterOp::Ne, "done")
        .filter("team", FilterOp::Eq, "atlas")
        .order_by("createdAt", Direction::Desc);

    let mut list = client.live_query(list_query.clone())?;
    let _badge = client.observe_fn(badge_query, |state| {
        println!(
            "[badge] open tasks: {}",
            state.data().map_or(0, Snapshot::len)
        );
    })?;

    println!("upstream subscriptions: {}", source.subscribe_count());

    // The store answers immediately: nothing published yet.
    let state = list.changed().await.expect("subscription is live");
    println!("[list] initial: {} task(s)", state.data().map_or(0, Snapshot::len));

    // Three tasks land.
    source.publish(
        list_query.clone(),
        vec![
            task("t1", 1, "wire the burndown chart", "doing"),
            task("t2", 1, "fix pager rotation", "todo"),
            task("t3", 1, "write release notes", "todo"),
        ],
    )?;
    let state = list.changed().await.expect("subscription is live");
    for doc in state.data().into_iter().flat_map(Snapshot::iter) {
        println!("[list] {} {:?}", doc.id(), doc.field("title"));
    }

    // Replaying the same snapshot wakes nobody.
    source.publish(
        list_query.clone(),
        vec![
            task("t1", 1, "wire the burndown chart", "doing"),
            task("t2", 1, "fix pager rotation", "todo"),
            task("t3", 1, "write release notes", "todo"),
        ],
    )?;
    println!(
        "suppressed deliveries so far: {}",
        client.metrics().suppressed()
    );

    // A widget opening late joins warm: data is there before the call
    // returns, and the upstream subscription count stays at one.
    let late = client.live_query(list_query)?;
    println!(
        "[late] sees {} task(s) immediately",
        late.state().data().map_or(0, Snapshot::len)
    );
    println!("upstream subscriptions: {}", source.subscribe_count());

    Ok(())
}
