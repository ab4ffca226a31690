use lockstep::Result;
use sqlx::SqlitePool;
use uuid::Uuid;

// =============================================================================
// Row counts
// =============================================================================

/// Where an event currently lives, as `(queued, processing, processed)` row counts.
pub async fn locate(pool: &SqlitePool, event_id: Uuid) -> Result<(i64, i64, i64)> {
    let queued: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM queued_events WHERE id = ?1")
        .bind(event_id)
        .fetch_one(pool)
        .await?;
    let processing: i64 =
        sqlx::query_scalar("SELECT COUNT(*) FROM processing_events WHERE id = ?1")
            .bind(event_id)
            .fetch_one(pool)
            .await?;
    let processed: i64 =
        sqlx::query_scalar("SELECT COUNT(*) FROM processed_events WHERE id = ?1")
            .bind(event_id)
            .fetch_one(pool)
            .await?;

    Ok((queued, processing, processed))
}

/// Assert that an event exists in exactly one table.
pub async fn assert_conserved(pool: &SqlitePool, event_id: Uuid) -> Result<()> {
    let (queued, processing, processed) = locate(pool, event_id).await?;
    assert_eq!(
        queued + processing + processed,
        1,
        "event {event_id} in queued={queued} processing={processing} processed={processed}"
    );
    Ok(())
}

pub async fn count_rows(pool: &SqlitePool, table: &str) -> Result<i64> {
    let count = sqlx::query_scalar(&format!("SELECT COUNT(*) FROM {table}"))
        .fetch_one(pool)
        .await?;
    Ok(count)
}

pub async fn count_processing_for_machine(pool: &SqlitePool, machine_id: &str) -> Result<i64> {
    let count = sqlx::query_scalar("SELECT COUNT(*) FROM processing_events WHERE machine_id = ?1")
        .bind(machine_id)
        .fetch_one(pool)
        .await?;
    Ok(count)
}

/// Highest number of processing rows held by any single machine.
pub async fn max_processing_per_machine(pool: &SqlitePool) -> Result<i64> {
    let max: Option<i64> = sqlx::query_scalar(
        "SELECT MAX(n) FROM (SELECT COUNT(*) AS n FROM processing_events GROUP BY machine_id)",
    )
    .fetch_one(pool)
    .await?;
    Ok(max.unwrap_or(0))
}

// =============================================================================
// Row mutations
// =============================================================================

/// Make every queued row due immediately.
pub async fn make_all_due(pool: &SqlitePool) -> Result<()> {
    sqlx::query("UPDATE queued_events SET scheduled_for = 0")
        .execute(pool)
        .await?;
    Ok(())
}
