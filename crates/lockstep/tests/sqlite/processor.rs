//! Integration tests for the EventProcessor lifecycle with live loops.

use std::time::Duration;

use lockstep::{
    Completion, Error, EventProcessor, EventProcessorConfig, MachineId, NewEvent,
    ProcessedStatus, SqliteStore,
};
use serde_json::{Value, json};
use test_utils::db_test;

use crate::support::db::{assert_conserved, count_rows, locate, make_all_due};
use crate::support::helpers::{
    DEFAULT_POLL_INTERVAL, DEFAULT_TEST_TIMEOUT, TEST_MAX_ATTEMPTS, init_test_tracing,
    test_config,
};

fn processor(pool: &sqlx::SqlitePool) -> EventProcessor<SqliteStore> {
    EventProcessor::new(SqliteStore::new(pool.clone()), test_config())
}

db_test!(invalid_events_are_rejected_before_any_write, |pool| {
    let processor = processor(pool);

    let cases = [
        NewEvent::new("", "RUN", json!({})),
        NewEvent::new("m1", " ", json!({})),
        NewEvent::new("m1", "RUN", Value::Null),
        NewEvent::new("m1", "RUN", json!({})).max_attempts(0),
    ];

    for event in cases {
        let result = processor.enqueue(event).await;
        assert!(matches!(result, Err(Error::Validation(_))));
    }

    assert_eq!(count_rows(pool, "queued_events").await?, 0);
    Ok(())
});

db_test!(enqueue_stamps_policy_max_attempts, |pool| {
    let config = EventProcessorConfig {
        retry_policy: lockstep::RetryPolicy {
            max_attempts: 7,
            ..Default::default()
        },
        ..test_config()
    };
    let processor = EventProcessor::new(SqliteStore::new(pool.clone()), config);

    let defaulted = processor
        .enqueue(NewEvent::new("m1", "RUN", json!({})))
        .await?;
    let explicit = processor
        .enqueue(NewEvent::new("m1", "RUN", json!({})).max_attempts(2))
        .await?;

    assert_eq!(defaulted.max_attempts, 7);
    assert_eq!(explicit.max_attempts, 2);
    Ok(())
});

db_test!(typed_payload_is_stored_as_json, |pool| {
    #[derive(serde::Serialize)]
    struct RunNode {
        node: &'static str,
        inputs: Vec<i32>,
    }

    let processor = processor(pool);
    let event = NewEvent::from_serializable(
        "m1",
        "RUN",
        &RunNode {
            node: "transform",
            inputs: vec![1, 2],
        },
    )?;

    processor.enqueue(event).await?;

    let stored = processor.events_by_machine(&MachineId::new("m1")).await?;
    assert_eq!(
        stored.queued[0].payload,
        json!({ "node": "transform", "inputs": [1, 2] })
    );
    Ok(())
});

db_test!(subscriber_receives_locked_event_and_completes_it, |pool| {
    init_test_tracing();

    let processor = processor(pool);
    let mut events = processor.subscribe();
    processor.start();

    let queued = processor
        .enqueue(NewEvent::new("m1", "RUN", json!({ "n": 1 })))
        .await?;

    let event = tokio::time::timeout(DEFAULT_TEST_TIMEOUT, events.recv())
        .await?
        .expect("stream open");
    assert_eq!(event.id, queued.id);
    assert_eq!(event.payload, json!({ "n": 1 }));
    assert_eq!(locate(pool, queued.id).await?, (0, 1, 0));

    let completion = processor.complete(event.id, true).await;
    assert!(matches!(completion, Some(Completion::Completed { .. })));

    let stored = processor.events_by_machine(&MachineId::new("m1")).await?;
    assert_eq!(stored.processed[0].status, ProcessedStatus::Complete);

    processor.shutdown().await;
    Ok(())
});

db_test!(double_completion_is_tolerated, |pool| {
    let processor = processor(pool);
    let mut events = processor.subscribe();
    processor.start();

    processor
        .enqueue(NewEvent::new("m1", "RUN", json!({})))
        .await?;
    let event = tokio::time::timeout(DEFAULT_TEST_TIMEOUT, events.recv())
        .await?
        .expect("stream open");

    assert!(processor.complete(event.id, true).await.is_some());
    assert!(processor.complete(event.id, true).await.is_none());
    assert!(processor.complete(uuid::Uuid::now_v7(), false).await.is_none());

    assert_conserved(pool, event.id).await?;
    processor.shutdown().await;
    Ok(())
});

db_test!(machine_events_delivered_in_creation_order, |pool| {
    init_test_tracing();

    let processor = processor(pool);
    let mut events = processor.subscribe();

    let mut expected = Vec::new();
    for i in 0..4 {
        let queued = processor
            .enqueue(NewEvent::new("m1", "STEP", json!({ "step": i })))
            .await?;
        expected.push(queued.id);
        tokio::time::sleep(Duration::from_millis(2)).await;
    }

    processor.start();

    let mut delivered = Vec::new();
    while delivered.len() < expected.len() {
        let event = tokio::time::timeout(DEFAULT_TEST_TIMEOUT, events.recv())
            .await?
            .expect("stream open");
        assert_eq!(
            crate::support::db::count_processing_for_machine(pool, "m1").await?,
            1
        );
        delivered.push(event.id);
        processor.complete(event.id, true).await;
    }

    assert_eq!(delivered, expected);
    processor.shutdown().await;
    Ok(())
});

db_test!(failed_event_is_redelivered_until_exhausted, |pool| {
    let processor = processor(pool);
    let mut events = processor.subscribe();
    processor.start();

    let queued = processor
        .enqueue(NewEvent::new("m1", "RUN", json!({})))
        .await?;

    let mut attempts = Vec::new();
    let mut last = None;
    for _ in 0..TEST_MAX_ATTEMPTS {
        let event = tokio::time::timeout(DEFAULT_TEST_TIMEOUT, events.recv())
            .await?
            .expect("stream open");
        assert_eq!(event.id, queued.id);
        attempts.push(event.attempts);
        last = processor.complete(event.id, false).await;
    }

    assert_eq!(attempts, vec![0, 1, 2]);
    assert_eq!(
        last,
        Some(Completion::Failed {
            attempts: TEST_MAX_ATTEMPTS
        })
    );
    assert_eq!(locate(pool, queued.id).await?, (0, 0, 1));
    processor.shutdown().await;
    Ok(())
});

db_test!(shutdown_is_idempotent_and_closes_stream, |pool| {
    let processor = processor(pool);
    let mut events = processor.subscribe();
    processor.start();
    processor.start();

    tokio::time::timeout(Duration::from_secs(2), processor.shutdown())
        .await
        .expect("shutdown should complete within timeout");
    tokio::time::timeout(Duration::from_secs(2), processor.shutdown())
        .await
        .expect("second shutdown should return immediately");

    assert!(events.recv().await.is_none());
    assert!(processor.subscribe().recv().await.is_none());

    // Loops stay stopped.
    processor.start();
    let queued = processor
        .enqueue(NewEvent::new("m1", "RUN", json!({})))
        .await?;
    tokio::time::sleep(DEFAULT_POLL_INTERVAL * 5).await;
    assert_eq!(locate(pool, queued.id).await?, (1, 0, 0));
    Ok(())
});

db_test!(shutdown_without_start_closes_stream, |pool| {
    let processor = processor(pool);
    let mut events = processor.subscribe();

    processor.shutdown().await;

    assert!(events.recv().await.is_none());
    Ok(())
});

db_test!(shutdown_waits_for_in_flight_completion, |pool| {
    let processor = processor(pool);
    let mut events = processor.subscribe();
    processor.start();

    let queued = processor
        .enqueue(NewEvent::new("m1", "RUN", json!({})))
        .await?;
    let event = tokio::time::timeout(DEFAULT_TEST_TIMEOUT, events.recv())
        .await?
        .expect("stream open");

    let worker = processor.clone();
    let completion = tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(300)).await;
        worker.complete(event.id, true).await
    });

    processor.shutdown().await;

    // Shutdown returned only after the completion landed.
    assert_eq!(locate(pool, queued.id).await?, (0, 0, 1));
    assert!(completion.await?.is_some());
    Ok(())
});

db_test!(shutdown_gives_up_after_timeout, |pool| {
    let config = EventProcessorConfig {
        shutdown_timeout: Duration::from_millis(200),
        ..test_config()
    };
    let processor = EventProcessor::new(SqliteStore::new(pool.clone()), config);
    let mut events = processor.subscribe();
    processor.start();

    let queued = processor
        .enqueue(NewEvent::new("m1", "RUN", json!({})))
        .await?;
    tokio::time::timeout(DEFAULT_TEST_TIMEOUT, events.recv())
        .await?
        .expect("stream open");

    tokio::time::timeout(Duration::from_secs(2), processor.shutdown())
        .await
        .expect("shutdown bounded by shutdown_timeout");

    // The lease is left for a later reclaimer sweep.
    assert_eq!(locate(pool, queued.id).await?, (0, 1, 0));
    Ok(())
});

db_test!(reclaimed_lease_no_longer_blocks_shutdown, |pool| {
    let processor = processor(pool);
    let mut events = processor.subscribe();
    processor.start();

    let queued = processor
        .enqueue(NewEvent::new("m1", "RUN", json!({})))
        .await?;
    tokio::time::timeout(DEFAULT_TEST_TIMEOUT, events.recv())
        .await?
        .expect("stream open");

    let later = time::OffsetDateTime::now_utc() + time::Duration::minutes(5);
    let report = processor.reclaimer().sweep(later).await?;
    assert_eq!(report.requeued, vec![queued.id]);

    tokio::time::timeout(Duration::from_secs(2), processor.shutdown())
        .await
        .expect("nothing left in flight");
    Ok(())
});

db_test!(retried_event_is_redispatched_after_backoff, |pool| {
    let config = EventProcessorConfig {
        retry_policy: lockstep::RetryPolicy::default(),
        ..test_config()
    };
    let processor = EventProcessor::new(SqliteStore::new(pool.clone()), config);
    let mut events = processor.subscribe();
    processor.start();

    let queued = processor
        .enqueue(NewEvent::new("m1", "RUN", json!({})))
        .await?;
    let event = tokio::time::timeout(DEFAULT_TEST_TIMEOUT, events.recv())
        .await?
        .expect("stream open");
    processor.complete(event.id, false).await;

    // Five minute backoff: nothing arrives.
    let early = tokio::time::timeout(DEFAULT_POLL_INTERVAL * 10, events.recv()).await;
    assert!(early.is_err());

    make_all_due(pool).await?;
    let retried = tokio::time::timeout(DEFAULT_TEST_TIMEOUT, events.recv())
        .await?
        .expect("stream open");
    assert_eq!(retried.id, queued.id);
    assert_eq!(retried.attempts, 1);

    processor.complete(retried.id, true).await;
    processor.shutdown().await;
    Ok(())
});
