//! Claim/ack/nack lifecycle of the pending queue.

use mnemo_db::queue::{NackOutcome, PendingQueue, QueueConfig, TaskKind};
use mnemo_db::test_helpers::create_test_pool;

fn queue(pool: sqlx::SqlitePool) -> PendingQueue {
    PendingQueue::new(pool, QueueConfig::default())
}

#[tokio::test]
async fn claim_is_exclusive_and_fifo() {
    let pool = create_test_pool().await.unwrap();
    let q = queue(pool);

    q.enqueue("doc-a", TaskKind::Summarize, &serde_json::json!({"content": "aaa"}))
        .await
        .unwrap();
    q.enqueue("doc-b", TaskKind::Summarize, &serde_json::json!({"content": "bbb"}))
        .await
        .unwrap();

    let first = q.claim("w1", 1).await.unwrap();
    assert_eq!(first.len(), 1);
    assert_eq!(first[0].doc_id, "doc-a");
    assert_eq!(first[0].attempts, 1);

    // Second claim must not hand out the already-claimed task.
    let second = q.claim("w2", 10).await.unwrap();
    assert_eq!(second.len(), 1);
    assert_eq!(second[0].doc_id, "doc-b");

    q.ack(&first[0]).await.unwrap();
    q.ack(&second[0]).await.unwrap();
    assert_eq!(q.count().await.unwrap(), 0);
}

#[tokio::test]
async fn at_most_one_inflight_task_per_doc() {
    let pool = create_test_pool().await.unwrap();
    let q = queue(pool);

    q.enqueue("doc-a", TaskKind::Summarize, &serde_json::json!({}))
        .await
        .unwrap();
    q.enqueue("doc-a", TaskKind::Embed, &serde_json::json!({}))
        .await
        .unwrap();

    let claimed = q.claim("w1", 10).await.unwrap();
    assert_eq!(claimed.len(), 1, "both tasks target the same doc");

    // While one task for doc-a is processing, the other stays unclaimable.
    let more = q.claim("w2", 10).await.unwrap();
    assert!(more.is_empty());

    q.ack(&claimed[0]).await.unwrap();
    let rest = q.claim("w2", 10).await.unwrap();
    assert_eq!(rest.len(), 1);
}

#[tokio::test]
async fn nack_requeues_with_backoff_then_dead_letters() {
    let pool = create_test_pool().await.unwrap();
    let q = PendingQueue::new(
        pool,
        QueueConfig {
            max_attempts: 2,
            ..QueueConfig::default()
        },
    );

    q.enqueue("doc-a", TaskKind::Embed, &serde_json::json!({}))
        .await
        .unwrap();

    let t1 = q.claim("w1", 1).await.unwrap().remove(0);
    let outcome = q.nack(&t1, "provider timeout").await.unwrap();
    assert!(matches!(outcome, NackOutcome::Requeued { .. }));

    // Backoff keeps the task out of immediate reach.
    assert!(q.claim("w1", 1).await.unwrap().is_empty());

    // Fast-forward: clear the backoff to simulate its expiry.
    sqlx::query("UPDATE pending_tasks SET retry_after = '2000-01-01T00:00:00.000000Z'")
        .execute(q.pool())
        .await
        .unwrap();

    let t2 = q.claim("w1", 1).await.unwrap().remove(0);
    assert_eq!(t2.attempts, 2);
    let outcome = q.nack(&t2, "provider timeout").await.unwrap();
    assert_eq!(outcome, NackOutcome::DeadLettered);

    let failed = q.list_failed().await.unwrap();
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0].doc_id, "doc-a");
    assert_eq!(failed[0].last_error.as_deref(), Some("provider timeout"));

    // Dead letters are out of rotation until retried explicitly.
    assert!(q.claim("w1", 1).await.unwrap().is_empty());
    assert_eq!(q.retry_failed().await.unwrap(), 1);
    assert_eq!(q.claim("w1", 1).await.unwrap().len(), 1);
}

#[tokio::test]
async fn stale_claims_are_recovered() {
    let pool = create_test_pool().await.unwrap();
    let q1 = queue(pool.clone());

    q1.enqueue("doc-a", TaskKind::Summarize, &serde_json::json!({}))
        .await
        .unwrap();
    let task = q1.claim("w1", 1).await.unwrap().remove(0);
    assert_eq!(task.attempts, 1);

    // Crash the worker: its claim expires, and a fresh queue handle
    // (another process) picks the task up again.
    sqlx::query("UPDATE pending_tasks SET claim_expires_at = '2000-01-01T00:00:00.000000Z'")
        .execute(&pool)
        .await
        .unwrap();

    let q2 = queue(pool);
    let reclaimed = q2.claim("w2", 1).await.unwrap();
    assert_eq!(reclaimed.len(), 1);
    assert_eq!(reclaimed[0].doc_id, "doc-a");
    assert_eq!(reclaimed[0].attempts, 2);
}

#[tokio::test]
async fn enqueue_replaces_existing_task() {
    let pool = create_test_pool().await.unwrap();
    let q = queue(pool);

    q.enqueue("doc-a", TaskKind::Summarize, &serde_json::json!({"content": "old"}))
        .await
        .unwrap();
    q.enqueue("doc-a", TaskKind::Summarize, &serde_json::json!({"content": "new"}))
        .await
        .unwrap();

    assert_eq!(q.count().await.unwrap(), 1);
    let task = q.claim("w1", 1).await.unwrap().remove(0);
    assert_eq!(task.payload["content"], "new");
}
