use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::sync::{broadcast, mpsc};

use crate::fixtures::ScriptedWorker;
use crate::registry::{SessionEvent, SessionWatcher};

#[tokio::test]
async fn registry_tracks_joins_and_leaves() -> Result<()> {
    let (shutdown_tx, _) = broadcast::channel(1);
    let (events_tx, events_rx) = mpsc::channel(16);
    let (watcher, registry) = SessionWatcher::new(events_rx, shutdown_tx.subscribe());
    let handle = watcher.spawn();

    let worker = Arc::new(ScriptedWorker::new(8));
    events_tx
        .send(SessionEvent::NodeJoin {
            node_id: 1,
            endpoint: "worker-1:7100".into(),
            client: worker.clone(),
        })
        .await
        .context("error sending join event")?;
    events_tx
        .send(SessionEvent::NodeJoin {
            node_id: 2,
            endpoint: "worker-2:7100".into(),
            client: Arc::new(ScriptedWorker::new(4)),
        })
        .await
        .context("error sending join event")?;

    let mut membership = registry.membership();
    while membership.borrow().len() < 2 {
        membership.changed().await.context("membership channel closed")?;
    }
    let nodes = membership.borrow().clone();
    assert_eq!(nodes, vec![1, 2], "expected membership [1, 2], got {:?}", nodes);
    assert!(registry.get_client(1).is_some(), "expected a client for node 1");

    events_tx
        .send(SessionEvent::NodeLeave { node_id: 1 })
        .await
        .context("error sending leave event")?;
    while membership.borrow().len() > 1 {
        membership.changed().await.context("membership channel closed")?;
    }
    let nodes = membership.borrow().clone();
    assert_eq!(nodes, vec![2], "expected membership [2], got {:?}", nodes);
    assert!(registry.get_client(1).is_none(), "expected no client for departed node 1");

    let _res = shutdown_tx.send(());
    handle.await.context("error joining session watcher")??;
    Ok(())
}

#[tokio::test]
async fn query_all_slots_returns_mutable_snapshot() -> Result<()> {
    let (shutdown_tx, _) = broadcast::channel(1);
    let (events_tx, events_rx) = mpsc::channel(16);
    let (watcher, registry) = SessionWatcher::new(events_rx, shutdown_tx.subscribe());
    let _handle = watcher.spawn();

    events_tx
        .send(SessionEvent::NodeJoin {
            node_id: 7,
            endpoint: "worker-7:7100".into(),
            client: Arc::new(ScriptedWorker::new(16)),
        })
        .await
        .context("error sending join event")?;
    let mut membership = registry.membership();
    while membership.borrow().is_empty() {
        membership.changed().await.context("membership channel closed")?;
    }

    let mut slots = registry.query_all_slots().await;
    let entry = slots.get(&7).copied().expect("expected slots entry for node 7");
    assert_eq!(entry.available_slots, 16, "expected 16 available slots, got {}", entry.available_slots);

    // Local mutation of the snapshot must not affect a fresh query.
    slots.get_mut(&7).expect("expected slots entry for node 7").available_slots = 0;
    let fresh = registry.query_all_slots().await;
    let entry = fresh.get(&7).copied().expect("expected slots entry for node 7");
    assert_eq!(entry.available_slots, 16, "expected fresh query to report 16 slots, got {}", entry.available_slots);

    let _res = shutdown_tx.send(());
    Ok(())
}
