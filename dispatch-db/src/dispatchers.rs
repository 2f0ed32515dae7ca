//! Dispatcher registry: liveness and job assignment for cluster coordinators

use std::time::Duration;

use sqlx::{
    postgres::types::PgInterval,
    types::chrono::{DateTime, Utc},
    PgConnection, Postgres,
};

use crate::ids::{DispatcherId, JobId, JobRunId, ScraperId};

/// One live scraper-cluster coordinator process.
///
/// `idle` is self-reported through heartbeats. What actually gates
/// reassignment is whether `current_job_run_id` still points at an
/// unfinished run.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct Dispatcher {
    pub id: DispatcherId,
    pub scraper_id: ScraperId,
    pub current_job_id: Option<JobId>,
    pub current_job_run_id: Option<JobRunId>,
    pub last_callin: DateTime<Utc>,
    /// Self-reported seconds of uptime
    pub up_time: i64,
    pub idle: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Register a fresh dispatcher identity for a scraper.
///
/// A scraper may run several dispatchers at once; each announce yields a
/// distinct row.
pub async fn insert<'c, E>(exe: E, scraper_id: &ScraperId) -> Result<Dispatcher, sqlx::Error>
where
    E: sqlx::Executor<'c, Database = Postgres>,
{
    let query = indoc::indoc! {r#"
        INSERT INTO dispatchers (id, scraper_id, last_callin, up_time, idle)
        VALUES ($1, $2, now(), 0, TRUE)
        RETURNING *
    "#};
    sqlx::query_as(query)
        .bind(DispatcherId::random())
        .bind(scraper_id)
        .fetch_one(exe)
        .await
}

/// Upsert liveness for a dispatcher.
///
/// An unknown id is re-created under the supplied scraper; dispatchers
/// self-generate their ids and may recover them after a restart. The upsert
/// never touches the current-job columns or the scraper binding of an
/// existing row.
pub async fn upsert_heartbeat<'c, E>(
    exe: E,
    id: &DispatcherId,
    scraper_id: &ScraperId,
    up_time: i64,
    idle: bool,
) -> Result<Dispatcher, sqlx::Error>
where
    E: sqlx::Executor<'c, Database = Postgres>,
{
    let query = indoc::indoc! {r#"
        INSERT INTO dispatchers (id, scraper_id, last_callin, up_time, idle)
        VALUES ($1, $2, now(), $3, $4)
        ON CONFLICT (id) DO UPDATE
        SET last_callin = now(), up_time = EXCLUDED.up_time, idle = EXCLUDED.idle
        RETURNING *
    "#};
    sqlx::query_as(query)
        .bind(id)
        .bind(scraper_id)
        .bind(up_time)
        .bind(idle)
        .fetch_one(exe)
        .await
}

pub async fn get_by_id<'c, E>(exe: E, id: &DispatcherId) -> Result<Option<Dispatcher>, sqlx::Error>
where
    E: sqlx::Executor<'c, Database = Postgres>,
{
    sqlx::query_as("SELECT * FROM dispatchers WHERE id = $1")
        .bind(id)
        .fetch_optional(exe)
        .await
}

/// Lock a dispatcher row for the duration of an assignment transaction, so
/// two concurrent assigns for the same dispatcher serialize.
pub(crate) async fn lock_by_id(
    conn: &mut PgConnection,
    id: &DispatcherId,
) -> Result<Option<Dispatcher>, sqlx::Error> {
    sqlx::query_as("SELECT * FROM dispatchers WHERE id = $1 FOR UPDATE")
        .bind(id)
        .fetch_optional(conn)
        .await
}

/// Record a successful assignment on the dispatcher row.
pub(crate) async fn set_assignment(
    conn: &mut PgConnection,
    id: &DispatcherId,
    job_id: &JobId,
    run_id: &JobRunId,
) -> Result<(), sqlx::Error> {
    let query = indoc::indoc! {r#"
        UPDATE dispatchers
        SET current_job_id = $2, current_job_run_id = $3, idle = FALSE
        WHERE id = $1
    "#};
    sqlx::query(query)
        .bind(id)
        .bind(job_id)
        .bind(run_id)
        .execute(conn)
        .await?;
    Ok(())
}

/// Detach a dispatcher from its run. Only the stale reaper does this
/// server-side; live dispatchers report their own state via heartbeat.
pub(crate) async fn clear_assignment(
    conn: &mut PgConnection,
    id: &DispatcherId,
) -> Result<(), sqlx::Error> {
    let query = indoc::indoc! {r#"
        UPDATE dispatchers
        SET current_job_id = NULL, current_job_run_id = NULL, idle = TRUE
        WHERE id = $1
    "#};
    sqlx::query(query).bind(id).execute(conn).await?;
    Ok(())
}

/// Dispatchers that have called in within `interval`.
pub async fn active<'c, E>(exe: E, interval: Duration) -> Result<Vec<Dispatcher>, sqlx::Error>
where
    E: sqlx::Executor<'c, Database = Postgres>,
{
    let query = indoc::indoc! {r#"
        SELECT *
        FROM dispatchers
        WHERE last_callin >= now() - $1
        ORDER BY last_callin DESC
    "#};
    sqlx::query_as(query)
        .bind(pg_interval(interval))
        .fetch_all(exe)
        .await
}

/// Dispatchers past the stale interval that still hold an open run.
///
/// Selection keys on the run reference alone, not the self-reported idle
/// flag; a dispatcher may report idle with its run still dangling. Rows come
/// back locked (`SKIP LOCKED`) so concurrent reapers on other service
/// instances never force-close the same run twice.
pub(crate) async fn stale_with_open_runs(
    conn: &mut PgConnection,
    interval: Duration,
) -> Result<Vec<Dispatcher>, sqlx::Error> {
    let query = indoc::indoc! {r#"
        SELECT *
        FROM dispatchers
        WHERE current_job_run_id IS NOT NULL
          AND last_callin < now() - $1
        FOR UPDATE SKIP LOCKED
    "#};
    sqlx::query_as(query)
        .bind(pg_interval(interval))
        .fetch_all(conn)
        .await
}

fn pg_interval(duration: Duration) -> PgInterval {
    let mut interval = PgInterval::default();
    interval.microseconds = i64::try_from(duration.as_micros()).unwrap_or(i64::MAX);
    interval
}
