//! Replication tests for tether-engine
//!
//! Restart, migration and live-stream interplay: a collection is closed and
//! reopened at a newer schema version against the same storage while a
//! replication resumes from its checkpoint.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use serde_json::json;
use tether_engine::{
    pull_stream, Checkpoint, Collection, CollectionOptions, CollectionSchema, Database,
    EngineConfig, Error, FieldDef, FieldType, MemoryStorage, MigrationStatus, MigrationStrategy,
    PullBatch, PullOptions, PullStreamEvent, ReplicationOptions, ReplicationStatus,
};

const IDENTIFIER: &str = "items-sync";

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn schema_v0() -> CollectionSchema {
    CollectionSchema::new(
        "items",
        0,
        "id",
        vec![FieldDef::optional("foo", FieldType::String)],
    )
}

fn schema_v1() -> CollectionSchema {
    CollectionSchema::new(
        "items",
        1,
        "id",
        vec![
            FieldDef::optional("foo", FieldType::String),
            FieldDef::optional("bar", FieldType::String),
        ],
    )
}

fn options_v1() -> CollectionOptions {
    CollectionOptions::new(schema_v1()).migration_strategy(0, MigrationStrategy::identity())
}

/// Handler for a source that has nothing beyond what it streams.
fn idle_pull() -> PullOptions {
    PullOptions::new(|_| async { Ok::<_, String>(PullBatch::empty()) })
}

fn batch(documents: Vec<serde_json::Value>) -> PullBatch {
    PullBatch::new(documents, None)
}

async fn open(storage: &MemoryStorage, options: CollectionOptions) -> (Database, Collection) {
    let db = Database::open("app", storage.clone(), EngineConfig::default()).unwrap();
    let collection = db.add_collection(options).await.unwrap();
    (db, collection)
}

async fn foo_of(collection: &Collection, key: &str) -> Option<serde_json::Value> {
    collection
        .find_one(key)
        .exec()
        .await
        .unwrap()
        .and_then(|d| d.get("foo").cloned())
}

// ============================================================================
// Restart across a schema change
// ============================================================================

#[tokio::test]
async fn stream_write_before_restart() {
    init_tracing();
    let storage = MemoryStorage::new();
    let (db, items) = open(&storage, CollectionOptions::new(schema_v0())).await;
    items.insert(json!({"id": "a", "foo": "initial"})).await.unwrap();

    let (sender, stream) = pull_stream();
    let replication = items
        .replicate(ReplicationOptions::new(IDENTIFIER, idle_pull().stream(stream)))
        .unwrap();
    replication.await_initial_replication().await.unwrap();

    sender
        .send(batch(vec![json!({"id": "a", "foo": "changed-before"})]))
        .unwrap();
    replication.await_in_sync().await.unwrap();

    assert_eq!(foo_of(&items, "a").await, Some(json!("changed-before")));
    db.close().await;
}

#[tokio::test]
async fn stream_write_after_migration() {
    init_tracing();
    let storage = MemoryStorage::new();
    {
        let (db, items) = open(&storage, CollectionOptions::new(schema_v0())).await;
        items.insert(json!({"id": "a", "foo": "initial"})).await.unwrap();
        items.update("a", json!({"foo": "changed-before"})).await.unwrap();
        storage.set_checkpoint("items", IDENTIFIER, json!({"seq": 1}).into());
        db.close().await;
    }

    let (db, items) = open(&storage, options_v1()).await;
    assert_eq!(items.migration_status(), MigrationStatus::Done);

    let (sender, stream) = pull_stream();
    let replication = items
        .replicate(ReplicationOptions::new(IDENTIFIER, idle_pull().stream(stream)))
        .unwrap();
    sender
        .send(batch(vec![json!({"id": "a", "foo": "changed-after"})]))
        .unwrap();
    replication.await_in_sync().await.unwrap();

    let doc = items.find_one("a").exec().await.unwrap().unwrap();
    assert_eq!(doc.get("foo"), Some(&json!("changed-after")));
    assert_eq!(doc.get("bar"), None);
    assert_eq!(doc.metadata.schema_version, 1);
    db.close().await;
}

#[tokio::test]
async fn stream_write_beats_local_update_after_migration() {
    init_tracing();
    let storage = MemoryStorage::new();
    {
        let (db, items) = open(&storage, CollectionOptions::new(schema_v0())).await;
        items.insert(json!({"id": "a", "foo": "changed-before"})).await.unwrap();
        db.close().await;
    }

    let (db, items) = open(&storage, options_v1()).await;
    items
        .update("a", json!({"foo": "changed-preRep-afterMig"}))
        .await
        .unwrap();

    let (sender, stream) = pull_stream();
    let replication = items
        .replicate(ReplicationOptions::new(IDENTIFIER, idle_pull().stream(stream)))
        .unwrap();
    sender
        .send(batch(vec![json!({"id": "a", "foo": "changed-after"})]))
        .unwrap();
    replication.await_in_sync().await.unwrap();

    assert_eq!(foo_of(&items, "a").await, Some(json!("changed-after")));
    db.close().await;
}

// ============================================================================
// Migration and replication ordering
// ============================================================================

#[tokio::test]
async fn observer_never_sees_old_shape() {
    init_tracing();
    let storage = MemoryStorage::new();
    {
        let (db, items) = open(&storage, CollectionOptions::new(schema_v0())).await;
        for i in 0..20 {
            items
                .insert(json!({"id": format!("doc-{i:03}"), "foo": "old"}))
                .await
                .unwrap();
        }
        db.close().await;
    }

    let options = CollectionOptions::new(schema_v1())
        .migration_strategy(
            0,
            MigrationStrategy::new(|mut fields| {
                fields.insert("foo".into(), json!("new"));
                fields.insert("bar".into(), json!("added"));
                Some(fields)
            }),
        )
        .auto_migrate(false);
    let db = Database::open("app", storage.clone(), EngineConfig::default()).unwrap();
    let items = db.add_collection(options).await.unwrap();
    assert!(items.migration_needed());

    let observer = {
        let items = items.clone();
        tokio::spawn(async move {
            let mut results = items.find_one("doc-007").observe().await.unwrap();
            results.next().await.unwrap().unwrap()
        })
    };
    let reader = {
        let items = items.clone();
        tokio::spawn(async move { items.find_one("doc-007").exec().await.unwrap().unwrap() })
    };

    items.migrate().await.unwrap();

    for doc in [observer.await.unwrap(), reader.await.unwrap()] {
        assert_eq!(doc.get("foo"), Some(&json!("new")));
        assert_eq!(doc.get("bar"), Some(&json!("added")));
    }
    assert!(!items.migration_needed());
    db.close().await;
}

#[tokio::test]
async fn batch_during_migration_applies_after_done() {
    init_tracing();
    let storage = MemoryStorage::new();
    {
        let (db, items) = open(&storage, CollectionOptions::new(schema_v0())).await;
        for i in 0..50 {
            items
                .insert(json!({"id": format!("doc-{i:03}"), "foo": "old"}))
                .await
                .unwrap();
        }
        db.close().await;
    }

    let db = Database::open("app", storage.clone(), EngineConfig::default()).unwrap();
    let items = db
        .add_collection(options_v1().auto_migrate(false))
        .await
        .unwrap();
    let mut events = items.bus().subscribe(|_| true);
    assert_eq!(events.drain().len(), 50);

    let (sender, stream) = pull_stream();
    let replication = items
        .replicate(ReplicationOptions::new(IDENTIFIER, idle_pull().stream(stream)))
        .unwrap();
    let mut received = replication.received();

    let mut status = items.watch_migration_status();
    let migration = {
        let items = items.clone();
        tokio::spawn(async move { items.migrate().await })
    };
    status
        .wait_for(|s| matches!(s, MigrationStatus::Running(_)))
        .await
        .unwrap();

    sender
        .send(batch(vec![json!({"id": "zzz", "foo": "streamed"})]))
        .unwrap();
    assert!(storage.get("items", "zzz").is_none());

    migration.await.unwrap().unwrap();
    replication.await_in_sync().await.unwrap();

    let published = events.drain();
    let streamed: Vec<usize> = published
        .iter()
        .enumerate()
        .filter(|(_, d)| d.primary_key == "zzz")
        .map(|(i, _)| i)
        .collect();
    assert_eq!(streamed, vec![50], "streamed write must follow every migrated write");
    assert!(published[..50].iter().all(|d| d.metadata.schema_version == 1));

    let applied = received.drain();
    assert_eq!(applied.len(), 1);
    assert_eq!(applied[0].primary_key, "zzz");
    db.close().await;
}

#[tokio::test]
async fn batch_during_initial_sync_is_buffered() {
    init_tracing();
    let storage = MemoryStorage::new();
    let (db, items) = open(&storage, CollectionOptions::new(schema_v0())).await;

    let (sender, stream) = pull_stream();
    let (release, gate) = tokio::sync::oneshot::channel::<()>();
    let gate = Arc::new(tokio::sync::Mutex::new(Some(gate)));
    let pull = PullOptions::new(move |checkpoint: Option<Checkpoint>| {
        let gate = Arc::clone(&gate);
        async move {
            if let Some(gate) = gate.lock().await.take() {
                let _ = gate.await;
            }
            if checkpoint.is_some() {
                return Ok::<_, String>(PullBatch::new(Vec::new(), checkpoint));
            }
            Ok(PullBatch::new(
                vec![json!({"id": "a", "foo": "pulled"})],
                Some(json!({"seq": 1}).into()),
            ))
        }
    });
    let replication = items
        .replicate(ReplicationOptions::new(IDENTIFIER, pull.stream(stream)))
        .unwrap();

    sender
        .send(batch(vec![json!({"id": "a", "foo": "streamed"})]))
        .unwrap();
    tokio::task::yield_now().await;
    assert_eq!(replication.status(), ReplicationStatus::InitialSync);
    release.send(()).unwrap();

    replication.await_in_sync().await.unwrap();
    assert_eq!(foo_of(&items, "a").await, Some(json!("streamed")));
    assert_eq!(replication.status(), ReplicationStatus::InSync);
    db.close().await;
}

#[tokio::test]
async fn in_sync_covers_every_queued_batch() {
    init_tracing();
    let storage = MemoryStorage::new();
    let (db, items) = open(&storage, CollectionOptions::new(schema_v0())).await;

    let (sender, stream) = pull_stream();
    let replication = items
        .replicate(ReplicationOptions::new(IDENTIFIER, idle_pull().stream(stream)))
        .unwrap();

    for i in 0..25 {
        sender
            .send(batch(vec![json!({"id": format!("k{}", i % 5), "foo": format!("v{i}")})]))
            .unwrap();
    }
    replication.await_in_sync().await.unwrap();

    for k in 0..5 {
        let expected = format!("v{}", 20 + k);
        assert_eq!(
            foo_of(&items, &format!("k{k}")).await,
            Some(json!(expected))
        );
    }
    let state = replication.state();
    assert_eq!(state.processed, 25);
    assert_eq!(state.status, ReplicationStatus::InSync);
    db.close().await;
}

#[tokio::test]
async fn restart_does_not_reapply_checkpointed_documents() {
    init_tracing();
    let storage = MemoryStorage::new();
    let calls = Arc::new(AtomicUsize::new(0));

    let source = {
        let calls = Arc::clone(&calls);
        move || {
            let calls = Arc::clone(&calls);
            PullOptions::new(move |checkpoint: Option<Checkpoint>| {
                calls.fetch_add(1, Ordering::SeqCst);
                let since = checkpoint
                    .and_then(|c| c.value()["seq"].as_u64())
                    .unwrap_or(0);
                let documents = (since + 1..=3)
                    .map(|seq| json!({"id": format!("doc-{seq}"), "foo": "remote"}))
                    .collect();
                async move {
                    Ok::<_, String>(PullBatch::new(documents, Some(json!({"seq": 3}).into())))
                }
            })
        }
    };

    let first_revisions = {
        let (db, items) = open(&storage, CollectionOptions::new(schema_v0())).await;
        let replication = items
            .replicate(ReplicationOptions::new(IDENTIFIER, source()).live(false))
            .unwrap();
        replication.await_initial_replication().await.unwrap();
        assert_eq!(items.count().await.unwrap(), 3);
        let revisions: Vec<_> = items
            .find(None)
            .exec()
            .await
            .unwrap()
            .into_iter()
            .map(|d| d.revision)
            .collect();
        db.close().await;
        revisions
    };

    let (db, items) = open(&storage, CollectionOptions::new(schema_v0())).await;
    let replication = items
        .replicate(ReplicationOptions::new(IDENTIFIER, source()).live(false))
        .unwrap();
    let mut received = replication.received();
    replication.await_initial_replication().await.unwrap();

    assert!(received.drain().is_empty());
    let revisions: Vec<_> = items
        .find(None)
        .exec()
        .await
        .unwrap()
        .into_iter()
        .map(|d| d.revision)
        .collect();
    assert_eq!(revisions, first_revisions);
    assert_eq!(
        replication.state().last_checkpoint,
        Some(Checkpoint::new(json!({"seq": 3})))
    );
    // Two round-trips on the first run, one on the second
    assert_eq!(calls.load(Ordering::SeqCst), 3);
    db.close().await;
}

// ============================================================================
// Failure handling
// ============================================================================

#[tokio::test]
async fn handler_retries_then_fails() {
    init_tracing();
    let storage = MemoryStorage::new();
    let (db, items) = open(&storage, CollectionOptions::new(schema_v0())).await;
    let calls = Arc::new(AtomicUsize::new(0));

    let pull = {
        let calls = Arc::clone(&calls);
        PullOptions::new(move |_| {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err::<PullBatch, _>("offline") }
        })
    };
    let replication = items
        .replicate(ReplicationOptions::new(IDENTIFIER, pull).retry(3, Duration::from_millis(1)))
        .unwrap();
    let mut errors = replication.errors();

    let expected = Error::PullHandlerFailed {
        attempts: 3,
        reason: "offline".into(),
    };
    assert_eq!(replication.await_initial_replication().await, Err(expected.clone()));
    assert_eq!(replication.status(), ReplicationStatus::Failed(expected.clone()));
    assert_eq!(calls.load(Ordering::SeqCst), 3);
    assert_eq!(errors.recv().await.unwrap().cause, expected);
    db.close().await;
}

#[tokio::test]
async fn transient_handler_failure_recovers() {
    init_tracing();
    let storage = MemoryStorage::new();
    let (db, items) = open(&storage, CollectionOptions::new(schema_v0())).await;
    let calls = Arc::new(AtomicUsize::new(0));

    let pull = {
        let calls = Arc::clone(&calls);
        PullOptions::new(move |checkpoint: Option<Checkpoint>| {
            let call = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                match (call, checkpoint) {
                    (0, _) => Err("flaky".to_string()),
                    (_, None) => Ok(PullBatch::new(
                        vec![json!({"id": "a", "foo": "pulled"})],
                        Some(json!(1).into()),
                    )),
                    (_, Some(checkpoint)) => Ok(PullBatch::new(Vec::new(), Some(checkpoint))),
                }
            }
        })
    };
    let replication = items
        .replicate(
            ReplicationOptions::new(IDENTIFIER, pull)
                .live(false)
                .retry(3, Duration::from_millis(1)),
        )
        .unwrap();

    replication.await_initial_replication().await.unwrap();
    assert_eq!(foo_of(&items, "a").await, Some(json!("pulled")));
    assert_eq!(replication.status(), ReplicationStatus::Stopped);
    db.close().await;
}

#[tokio::test]
async fn rejected_batch_keeps_checkpoint() {
    init_tracing();
    let storage = MemoryStorage::new();
    let (db, items) = open(&storage, CollectionOptions::new(schema_v0())).await;

    let (sender, stream) = pull_stream();
    let pull = idle_pull().stream(stream).modifier(|fields| {
        if fields.get("foo") == Some(&json!("poison")) {
            return Err("poisoned document".to_string());
        }
        Ok(fields)
    });
    let replication = items
        .replicate(ReplicationOptions::new(IDENTIFIER, pull))
        .unwrap();
    let mut errors = replication.errors();

    sender
        .send(PullBatch::new(
            vec![json!({"id": "a", "foo": "fine"}), json!({"id": "b", "foo": "poison"})],
            Some(json!({"seq": 9}).into()),
        ))
        .unwrap();
    sender
        .send(PullBatch::new(
            vec![json!({"id": "c", "foo": 42})],
            Some(json!({"seq": 10}).into()),
        ))
        .unwrap();
    sender
        .send(PullBatch::new(
            vec![json!({"id": "d", "foo": "ok"})],
            Some(json!({"seq": 11}).into()),
        ))
        .unwrap();
    replication.await_in_sync().await.unwrap();

    let first = errors.recv().await.unwrap();
    assert_eq!(
        first.cause,
        Error::BatchModifierRejected("poisoned document".into())
    );
    assert_eq!(first.batch.unwrap().documents.len(), 2);
    assert!(matches!(
        errors.recv().await.unwrap().cause,
        Error::TypeMismatch { .. }
    ));

    // Whole batches skipped, later batch applied
    assert_eq!(foo_of(&items, "a").await, None);
    assert_eq!(foo_of(&items, "d").await, Some(json!("ok")));
    assert_eq!(
        storage.checkpoint("items", IDENTIFIER),
        Some(Checkpoint::new(json!({"seq": 11})))
    );
    db.close().await;
}

#[tokio::test]
async fn unresolved_conflict_reported_per_document() {
    init_tracing();
    let storage = MemoryStorage::new();
    let options = CollectionOptions::new(schema_v0()).conflict_handler(
        |conflict: &tether_engine::Conflict<'_>| {
            if conflict.local.primary_key == "a" {
                tether_engine::ConflictResolution::Unresolved("needs review".into())
            } else {
                tether_engine::ConflictResolution::RemoteWins
            }
        },
    );
    let (db, items) = open(&storage, options).await;
    items.insert(json!({"id": "a", "foo": "local"})).await.unwrap();
    items.insert(json!({"id": "b", "foo": "local"})).await.unwrap();

    let (sender, stream) = pull_stream();
    let replication = items
        .replicate(ReplicationOptions::new(IDENTIFIER, idle_pull().stream(stream)))
        .unwrap();
    let mut errors = replication.errors();

    sender
        .send(PullBatch::new(
            vec![json!({"id": "a", "foo": "remote"}), json!({"id": "b", "foo": "remote"})],
            Some(json!(5).into()),
        ))
        .unwrap();
    replication.await_in_sync().await.unwrap();

    assert_eq!(
        errors.recv().await.unwrap().cause,
        Error::ConflictUnresolved {
            document: "a".into(),
            reason: "needs review".into()
        }
    );
    assert_eq!(foo_of(&items, "a").await, Some(json!("local")));
    assert_eq!(foo_of(&items, "b").await, Some(json!("remote")));
    assert_eq!(
        storage.checkpoint("items", IDENTIFIER),
        Some(Checkpoint::new(json!(5)))
    );
    db.close().await;
}

#[tokio::test]
async fn failed_migration_fails_replication() {
    init_tracing();
    let storage = MemoryStorage::new();
    {
        let (db, items) = open(&storage, CollectionOptions::new(schema_v0())).await;
        items.insert(json!({"id": "a", "foo": "x"})).await.unwrap();
        db.close().await;
    }

    let failing = CollectionOptions::new(schema_v1())
        .migration_strategy(0, MigrationStrategy::fallible(|_| Err("broken".to_string())))
        .auto_migrate(false);
    let db = Database::open("app", storage.clone(), EngineConfig::default()).unwrap();
    let items = db.add_collection(failing).await.unwrap();

    let replication = items
        .replicate(ReplicationOptions::new(IDENTIFIER, idle_pull()))
        .unwrap();
    assert!(matches!(
        items.migrate().await,
        Err(Error::MigrationStepFailed { .. })
    ));

    assert!(matches!(
        replication.await_initial_replication().await,
        Err(Error::MigrationStepFailed { .. })
    ));
    assert!(matches!(
        items.find_one("a").exec().await,
        Err(Error::MigrationStepFailed { .. })
    ));
    // Nothing was committed
    assert_eq!(storage.get("items", "a").unwrap().metadata.schema_version, 0);
    db.close().await;
}

#[tokio::test]
async fn stream_close_stops_replication() {
    init_tracing();
    let storage = MemoryStorage::new();
    let (db, items) = open(&storage, CollectionOptions::new(schema_v0())).await;

    let (sender, stream) = pull_stream();
    let replication = items
        .replicate(ReplicationOptions::new(IDENTIFIER, idle_pull().stream(stream)))
        .unwrap();
    let mut errors = replication.errors();

    sender
        .send(batch(vec![json!({"id": "a", "foo": "last"})]))
        .unwrap();
    sender.close();

    assert_eq!(errors.recv().await.unwrap().cause, Error::StreamClosed);
    replication.await_in_sync().await.unwrap();
    let mut state = replication.watch_status();
    state
        .wait_for(|s| s.status == ReplicationStatus::Stopped)
        .await
        .unwrap();
    assert_eq!(foo_of(&items, "a").await, Some(json!("last")));
    db.close().await;
}

// ============================================================================
// Lifecycle
// ============================================================================

#[tokio::test]
async fn cancel_is_idempotent_and_final() {
    init_tracing();
    let storage = MemoryStorage::new();
    let (db, items) = open(&storage, CollectionOptions::new(schema_v0())).await;

    let (sender, stream) = pull_stream();
    let replication = items
        .replicate(ReplicationOptions::new(IDENTIFIER, idle_pull().stream(stream)))
        .unwrap();
    replication.await_initial_replication().await.unwrap();

    replication.cancel().await;
    replication.cancel().await;
    assert_eq!(replication.status(), ReplicationStatus::Canceled);
    assert!(items.replication_identifiers().is_empty());

    let _ = sender.send(batch(vec![json!({"id": "late", "foo": "x"})]));
    tokio::task::yield_now().await;
    assert!(storage.get("items", "late").is_none());
    assert_eq!(
        replication.await_in_sync().await,
        Err(Error::ReplicationCanceled(IDENTIFIER.into()))
    );
    db.close().await;
}

#[tokio::test]
async fn duplicate_identifier_rejected() {
    init_tracing();
    let storage = MemoryStorage::new();
    let (db, items) = open(&storage, CollectionOptions::new(schema_v0())).await;

    let first = items
        .replicate(ReplicationOptions::new(IDENTIFIER, idle_pull()))
        .unwrap();
    assert_eq!(
        items
            .replicate(ReplicationOptions::new(IDENTIFIER, idle_pull()))
            .unwrap_err(),
        Error::ReplicationAlreadyRunning(IDENTIFIER.into())
    );

    first.cancel().await;
    let second = items
        .replicate(ReplicationOptions::new(IDENTIFIER, idle_pull()))
        .unwrap();
    second.await_initial_replication().await.unwrap();
    db.close().await;
}

#[tokio::test]
async fn stopped_replication_restarts_from_checkpoint() {
    init_tracing();
    let storage = MemoryStorage::new();
    let (db, items) = open(&storage, CollectionOptions::new(schema_v0())).await;
    let calls = Arc::new(AtomicUsize::new(0));

    let source = {
        let calls = Arc::clone(&calls);
        move || {
            let calls = Arc::clone(&calls);
            PullOptions::new(move |checkpoint: Option<Checkpoint>| {
                calls.fetch_add(1, Ordering::SeqCst);
                let documents = match checkpoint {
                    None => vec![json!({"id": "a", "foo": "remote"})],
                    Some(_) => Vec::new(),
                };
                async move {
                    Ok::<_, String>(PullBatch::new(documents, Some(json!({"seq": 1}).into())))
                }
            })
        }
    };

    let first = items
        .replicate(ReplicationOptions::new(IDENTIFIER, source()).live(false))
        .unwrap();
    first
        .watch_status()
        .wait_for(|s| s.status == ReplicationStatus::Stopped)
        .await
        .unwrap();
    assert_eq!(items.replication_identifiers(), vec![IDENTIFIER.to_string()]);

    let second = items
        .replicate(ReplicationOptions::new(IDENTIFIER, source()).live(false))
        .unwrap();
    let mut received = second.received();
    second.await_initial_replication().await.unwrap();
    assert!(received.drain().is_empty());
    assert_eq!(foo_of(&items, "a").await, Some(json!("remote")));
    // Two round-trips on the first run, one on the second
    assert_eq!(calls.load(Ordering::SeqCst), 3);

    // The old handle no longer owns the identifier
    first.cancel().await;
    assert_eq!(items.replication_identifiers(), vec![IDENTIFIER.to_string()]);
    assert_eq!(
        items
            .replicate(ReplicationOptions::new(IDENTIFIER, idle_pull()))
            .unwrap_err(),
        Error::ReplicationAlreadyRunning(IDENTIFIER.into())
    );
    db.close().await;
}

#[tokio::test]
async fn closed_stream_replication_restarts() {
    init_tracing();
    let storage = MemoryStorage::new();
    let (db, items) = open(&storage, CollectionOptions::new(schema_v0())).await;

    let (sender, stream) = pull_stream();
    let first = items
        .replicate(ReplicationOptions::new(IDENTIFIER, idle_pull().stream(stream)))
        .unwrap();
    first.await_initial_replication().await.unwrap();
    sender.close();
    first
        .watch_status()
        .wait_for(|s| s.status == ReplicationStatus::Stopped)
        .await
        .unwrap();

    let (sender, stream) = pull_stream();
    let second = items
        .replicate(ReplicationOptions::new(IDENTIFIER, idle_pull().stream(stream)))
        .unwrap();
    second.await_initial_replication().await.unwrap();
    sender
        .send(batch(vec![json!({"id": "a", "foo": "after restart"})]))
        .unwrap();
    second.await_in_sync().await.unwrap();

    assert_eq!(foo_of(&items, "a").await, Some(json!("after restart")));
    assert!(first.is_finished());
    assert!(!second.is_finished());
    db.close().await;
}

#[tokio::test]
async fn failed_replication_restarts() {
    init_tracing();
    let storage = MemoryStorage::new();
    let (db, items) = open(&storage, CollectionOptions::new(schema_v0())).await;

    let offline = PullOptions::new(|_| async { Err::<PullBatch, _>("offline") });
    let first = items
        .replicate(ReplicationOptions::new(IDENTIFIER, offline).retry(1, Duration::from_millis(1)))
        .unwrap();
    assert!(first.await_initial_replication().await.is_err());

    let online = PullOptions::new(|_| async {
        Ok::<_, String>(PullBatch::new(vec![json!({"id": "a", "foo": "online"})], None))
    });
    let second = items
        .replicate(ReplicationOptions::new(IDENTIFIER, online).live(false))
        .unwrap();
    second.await_initial_replication().await.unwrap();
    assert_eq!(foo_of(&items, "a").await, Some(json!("online")));
    db.close().await;
}

#[tokio::test]
async fn oversized_remote_revision_rejects_batch() {
    init_tracing();
    let storage = MemoryStorage::new();
    let (db, items) = open(&storage, CollectionOptions::new(schema_v0())).await;
    items.insert(json!({"id": "local", "foo": "mine"})).await.unwrap();

    let (sender, stream) = pull_stream();
    let replication = items
        .replicate(ReplicationOptions::new(IDENTIFIER, idle_pull().stream(stream)))
        .unwrap();
    let mut errors = replication.errors();
    replication.await_initial_replication().await.unwrap();

    let revision = format!("{}-x", u64::MAX);
    sender
        .send(batch(vec![json!({"id": "a", "foo": "huge", "_rev": revision})]))
        .unwrap();
    replication.await_in_sync().await.unwrap();

    assert_eq!(errors.recv().await.unwrap().cause, Error::InvalidRevision(revision));
    assert!(storage.get("items", "a").is_none());
    assert!(!replication.is_finished());

    items
        .upsert(json!({"id": "local", "foo": "still writable"}))
        .await
        .unwrap();
    assert_eq!(foo_of(&items, "local").await, Some(json!("still writable")));
    db.close().await;
}

#[tokio::test]
async fn resync_runs_handler_in_stream_order() {
    init_tracing();
    let storage = MemoryStorage::new();
    let (db, items) = open(&storage, CollectionOptions::new(schema_v0())).await;
    let remote = Arc::new(std::sync::Mutex::new(Vec::<serde_json::Value>::new()));

    let pull = {
        let remote = Arc::clone(&remote);
        PullOptions::new(move |checkpoint: Option<Checkpoint>| {
            let since = checkpoint.and_then(|c| c.value().as_u64()).unwrap_or(0) as usize;
            let documents: Vec<_> = remote.lock().unwrap()[since..].to_vec();
            let next = since + documents.len();
            async move { Ok::<_, String>(PullBatch::new(documents, Some(json!(next).into()))) }
        })
    };
    let (sender, stream) = pull_stream();
    let replication = items
        .replicate(ReplicationOptions::new(IDENTIFIER, pull.stream(stream)))
        .unwrap();
    replication.await_initial_replication().await.unwrap();

    remote
        .lock()
        .unwrap()
        .push(json!({"id": "a", "foo": "from-handler"}));
    sender
        .send(batch(vec![json!({"id": "b", "foo": "from-stream"})]))
        .unwrap();
    sender.send(PullStreamEvent::Resync).unwrap();
    replication.await_in_sync().await.unwrap();

    assert_eq!(foo_of(&items, "a").await, Some(json!("from-handler")));
    assert_eq!(foo_of(&items, "b").await, Some(json!("from-stream")));

    remote
        .lock()
        .unwrap()
        .push(json!({"id": "c", "foo": "via-re-sync"}));
    replication.re_sync();
    replication.await_in_sync().await.unwrap();
    assert_eq!(foo_of(&items, "c").await, Some(json!("via-re-sync")));
    db.close().await;
}

#[tokio::test]
async fn close_cancels_replications() {
    init_tracing();
    let storage = MemoryStorage::new();
    let (db, items) = open(&storage, CollectionOptions::new(schema_v0())).await;

    let (_sender, stream) = pull_stream();
    let replication = items
        .replicate(ReplicationOptions::new(IDENTIFIER, idle_pull().stream(stream)))
        .unwrap();
    replication.await_initial_replication().await.unwrap();

    db.close().await;
    assert_eq!(replication.status(), ReplicationStatus::Canceled);
    assert_eq!(
        items.insert(json!({"id": "a"})).await,
        Err(Error::CollectionClosed("items".into()))
    );
}

#[tokio::test]
async fn observe_follows_replicated_changes() {
    init_tracing();
    let storage = MemoryStorage::new();
    let (db, items) = open(&storage, CollectionOptions::new(schema_v0())).await;
    items.insert(json!({"id": "a", "foo": "initial"})).await.unwrap();

    let mut results = items.find_one("a").observe().await.unwrap();
    let first = results.next().await.unwrap().unwrap();
    assert_eq!(first.get("foo"), Some(&json!("initial")));

    let (sender, stream) = pull_stream();
    let replication = items
        .replicate(ReplicationOptions::new(IDENTIFIER, idle_pull().stream(stream)))
        .unwrap();
    sender
        .send(batch(vec![json!({"id": "a", "foo": "remote"})]))
        .unwrap();
    replication.await_in_sync().await.unwrap();

    let second = results.next().await.unwrap().unwrap();
    assert_eq!(second.get("foo"), Some(&json!("remote")));
    assert!(second.revision > first.revision);

    items.remove("a").await.unwrap();
    assert_eq!(results.next().await.unwrap(), None);
    db.close().await;
}
