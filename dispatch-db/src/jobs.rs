//! Scrape jobs and the claim engine
//!
//! A job row doubles as the claim semaphore: `in_process` marks a job as
//! held by exactly one dispatcher. Claiming locks the candidate row and
//! re-checks the semaphore under the lock, so the check-then-update window
//! is closed even across service instances.

use sqlx::{
    types::chrono::{DateTime, Utc},
    PgConnection, Postgres,
};
use uuid::Uuid;

use crate::ids::JobId;

/// A unit of recurring scrape work tied to a municipality site.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct Job {
    pub id: JobId,
    pub name: String,
    pub description: String,
    /// Root URL the crawl starts from
    pub url: String,
    /// How many link levels deep the crawl follows
    pub link_level: i32,
    /// Claim semaphore: true while exactly one unfinished run holds the job
    pub in_process: bool,
    pub start_run_time: Option<DateTime<Utc>>,
    pub last_run_time: Option<DateTime<Utc>>,
    pub municipality_id: Uuid,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Fields required to configure a job
#[derive(Debug, Clone)]
pub struct NewJob {
    pub name: String,
    pub description: String,
    pub url: String,
    pub link_level: i32,
    pub municipality_id: Uuid,
}

pub async fn insert<'c, E>(exe: E, new: &NewJob) -> Result<Job, sqlx::Error>
where
    E: sqlx::Executor<'c, Database = Postgres>,
{
    let query = indoc::indoc! {r#"
        INSERT INTO jobs (id, name, description, url, link_level, in_process, municipality_id)
        VALUES ($1, $2, $3, $4, $5, FALSE, $6)
        RETURNING *
    "#};
    sqlx::query_as(query)
        .bind(JobId::random())
        .bind(&new.name)
        .bind(&new.description)
        .bind(&new.url)
        .bind(new.link_level)
        .bind(new.municipality_id)
        .fetch_one(exe)
        .await
}

pub async fn get_by_id<'c, E>(exe: E, id: &JobId) -> Result<Option<Job>, sqlx::Error>
where
    E: sqlx::Executor<'c, Database = Postgres>,
{
    sqlx::query_as("SELECT * FROM jobs WHERE id = $1")
        .bind(id)
        .fetch_optional(exe)
        .await
}

pub async fn list_page<'c, E>(exe: E, start: i64, count: i64) -> Result<Vec<Job>, sqlx::Error>
where
    E: sqlx::Executor<'c, Database = Postgres>,
{
    let query = indoc::indoc! {r#"
        SELECT *
        FROM jobs
        ORDER BY created_at ASC
        OFFSET $1 LIMIT $2
    "#};
    sqlx::query_as(query)
        .bind(start)
        .bind(count)
        .fetch_all(exe)
        .await
}

/// Lock the next eligible claim candidate.
///
/// Eligible jobs are ordered by staleness: oldest `last_run_time` first,
/// never-run jobs before all others, so work round-robins across the whole
/// table. `SKIP LOCKED` keeps concurrent claimers from queueing on the same
/// row; each caller locks a distinct candidate or sees none.
async fn lock_next_eligible(conn: &mut PgConnection) -> Result<Option<JobId>, sqlx::Error> {
    let query = indoc::indoc! {r#"
        SELECT id
        FROM jobs
        WHERE in_process = FALSE
        ORDER BY last_run_time ASC NULLS FIRST, created_at ASC
        LIMIT 1
        FOR UPDATE SKIP LOCKED
    "#};
    sqlx::query_scalar(query).fetch_optional(conn).await
}

/// Flip the claim semaphore, guarded on the precondition still holding.
///
/// Returns `None` if the row was already in process, which means the caller
/// lost a race it should not have been in.
async fn mark_in_process(conn: &mut PgConnection, id: &JobId) -> Result<Option<Job>, sqlx::Error> {
    let query = indoc::indoc! {r#"
        UPDATE jobs
        SET in_process = TRUE, start_run_time = now()
        WHERE id = $1 AND in_process = FALSE
        RETURNING *
    "#};
    sqlx::query_as(query).bind(id).fetch_optional(conn).await
}

/// Claim the next eligible job within the caller's transaction.
///
/// Returns `None` when no job is eligible; that is a defined outcome, not a
/// failure. The claim becomes visible to other claimers at commit.
pub(crate) async fn claim_next(conn: &mut PgConnection) -> Result<Option<Job>, sqlx::Error> {
    let Some(candidate) = lock_next_eligible(&mut *conn).await? else {
        return Ok(None);
    };
    // The candidate was selected before its lock was granted; the guarded
    // update re-checks the semaphore under the lock.
    mark_in_process(&mut *conn, &candidate).await
}

/// Return a job to the eligible pool and stamp its `last_run_time`, which
/// sends it to the back of the staleness order.
///
/// Only run closure calls this; there is no other path out of `in_process`.
pub(crate) async fn release<'c, E>(exe: E, id: &JobId) -> Result<(), sqlx::Error>
where
    E: sqlx::Executor<'c, Database = Postgres>,
{
    let query = indoc::indoc! {r#"
        UPDATE jobs
        SET in_process = FALSE, last_run_time = now()
        WHERE id = $1
    "#};
    sqlx::query(query).bind(id).execute(exe).await?;
    Ok(())
}
