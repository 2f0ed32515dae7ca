//! Worker registry: liveness for the crawl processes under a dispatcher

use sqlx::{
    types::chrono::{DateTime, Utc},
    Postgres,
};

use crate::ids::{DispatcherId, ScraperId, WorkerId};

/// A crawl process owned by exactly one dispatcher at a time.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct Worker {
    pub id: WorkerId,
    pub scraper_id: ScraperId,
    pub dispatcher_id: DispatcherId,
    pub last_callin: DateTime<Utc>,
    /// Self-reported seconds of uptime
    pub up_time: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

pub async fn insert<'c, E>(
    exe: E,
    scraper_id: &ScraperId,
    dispatcher_id: &DispatcherId,
) -> Result<Worker, sqlx::Error>
where
    E: sqlx::Executor<'c, Database = Postgres>,
{
    let query = indoc::indoc! {r#"
        INSERT INTO workers (id, scraper_id, dispatcher_id, last_callin, up_time)
        VALUES ($1, $2, $3, now(), 0)
        RETURNING *
    "#};
    sqlx::query_as(query)
        .bind(WorkerId::random())
        .bind(scraper_id)
        .bind(dispatcher_id)
        .fetch_one(exe)
        .await
}

pub async fn get_by_id<'c, E>(exe: E, id: &WorkerId) -> Result<Option<Worker>, sqlx::Error>
where
    E: sqlx::Executor<'c, Database = Postgres>,
{
    sqlx::query_as("SELECT * FROM workers WHERE id = $1")
        .bind(id)
        .fetch_optional(exe)
        .await
}

/// Strict liveness update: `None` for an unknown id.
///
/// Unlike dispatchers, workers are never re-created from a heartbeat; a
/// worker identity only comes out of an authorized announce.
pub async fn update_heartbeat<'c, E>(
    exe: E,
    id: &WorkerId,
    up_time: i64,
) -> Result<Option<Worker>, sqlx::Error>
where
    E: sqlx::Executor<'c, Database = Postgres>,
{
    let query = indoc::indoc! {r#"
        UPDATE workers
        SET last_callin = now(), up_time = $2
        WHERE id = $1
        RETURNING *
    "#};
    sqlx::query_as(query)
        .bind(id)
        .bind(up_time)
        .fetch_optional(exe)
        .await
}
