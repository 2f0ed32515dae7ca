//! Job runs: one execution of a job, bounded by open and close
//!
//! At most one unfinished run exists per job at any time. The guarded
//! insert enforces that in-line; a partial unique index on
//! `job_runs (job_id) WHERE NOT finished` backs it up against races.

use sqlx::{
    types::chrono::{DateTime, Utc},
    PgConnection, Postgres,
};

use crate::{
    ids::{JobId, JobRunId, ScraperId},
    jobs, Error,
};

/// One execution instance of a job.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct JobRun {
    pub id: JobRunId,
    pub job_id: JobId,
    /// Scraper whose dispatcher claimed the job
    pub scraper_id: ScraperId,
    pub start_time: DateTime<Utc>,
    pub finished: bool,
    /// Set iff `finished` is true
    pub finish_time: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

pub async fn get_by_id<'c, E>(exe: E, id: &JobRunId) -> Result<Option<JobRun>, sqlx::Error>
where
    E: sqlx::Executor<'c, Database = Postgres>,
{
    sqlx::query_as("SELECT * FROM job_runs WHERE id = $1")
        .bind(id)
        .fetch_optional(exe)
        .await
}

/// The unfinished run for a job, if one exists.
pub async fn get_open_for_job<'c, E>(exe: E, job_id: &JobId) -> Result<Option<JobRun>, sqlx::Error>
where
    E: sqlx::Executor<'c, Database = Postgres>,
{
    sqlx::query_as("SELECT * FROM job_runs WHERE job_id = $1 AND finished = FALSE")
        .bind(job_id)
        .fetch_optional(exe)
        .await
}

/// Guarded insert: succeeds only while the job has no unfinished run.
async fn insert_open(
    conn: &mut PgConnection,
    job_id: &JobId,
    scraper_id: &ScraperId,
) -> Result<Option<JobRun>, sqlx::Error> {
    let query = indoc::indoc! {r#"
        INSERT INTO job_runs (id, job_id, scraper_id, start_time, finished)
        SELECT $1, $2, $3, now(), FALSE
        WHERE NOT EXISTS (
            SELECT 1 FROM job_runs WHERE job_id = $2 AND finished = FALSE
        )
        RETURNING *
    "#};
    sqlx::query_as(query)
        .bind(JobRunId::random())
        .bind(job_id)
        .bind(scraper_id)
        .fetch_optional(conn)
        .await
}

/// Open a run for a claimed job within the caller's transaction.
///
/// Refuses a second unfinished run for the same job, which defends against
/// callers that bypassed the claim engine.
pub(crate) async fn open(
    conn: &mut PgConnection,
    job_id: &JobId,
    scraper_id: &ScraperId,
) -> Result<JobRun, Error> {
    if jobs::get_by_id(&mut *conn, job_id).await?.is_none() {
        return Err(Error::NotFound {
            entity: "job",
            id: *job_id.as_uuid(),
        });
    }
    match insert_open(&mut *conn, job_id, scraper_id).await {
        Ok(Some(run)) => Ok(run),
        Ok(None) => Err(Error::RunAlreadyOpen(*job_id)),
        // Two concurrent opens can both pass the NOT EXISTS guard; the
        // partial unique index turns the loser into a conflict.
        Err(err) if crate::is_unique_violation(&err) => Err(Error::RunAlreadyOpen(*job_id)),
        Err(err) => Err(err.into()),
    }
}

async fn lock_by_id(
    conn: &mut PgConnection,
    id: &JobRunId,
) -> Result<Option<JobRun>, sqlx::Error> {
    sqlx::query_as("SELECT * FROM job_runs WHERE id = $1 FOR UPDATE")
        .bind(id)
        .fetch_optional(conn)
        .await
}

async fn finish(conn: &mut PgConnection, id: &JobRunId) -> Result<JobRun, sqlx::Error> {
    let query = indoc::indoc! {r#"
        UPDATE job_runs
        SET finished = TRUE, finish_time = now()
        WHERE id = $1
        RETURNING *
    "#};
    sqlx::query_as(query).bind(id).fetch_one(conn).await
}

/// Close a run within the caller's transaction and release its job.
///
/// Returns `None` if the run does not exist. Closing an already-closed run
/// returns it unchanged; the release step already happened the first time.
pub(crate) async fn close(
    conn: &mut PgConnection,
    id: &JobRunId,
) -> Result<Option<JobRun>, sqlx::Error> {
    let Some(run) = lock_by_id(&mut *conn, id).await? else {
        return Ok(None);
    };
    if run.finished {
        return Ok(Some(run));
    }
    let run = finish(&mut *conn, id).await?;
    jobs::release(&mut *conn, &run.job_id).await?;
    Ok(Some(run))
}
