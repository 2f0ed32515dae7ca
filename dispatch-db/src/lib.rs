//! Coordination layer for a fleet of distributed municipal-site scrapers.
//!
//! Many independent dispatcher processes poll a central service for scrape
//! work. This crate owns the part that has to be right under contention:
//! handing the oldest eligible job to exactly one dispatcher, tracking the
//! resulting run, and reconciling dispatcher/worker liveness against it.
//!
//! There is no in-process shared mutable state. All mutual exclusion is
//! delegated to Postgres row locks, so any number of service instances may
//! run against one database. The facade is [`DispatchDb`]; the HTTP layer
//! that fronts it lives elsewhere and only ever calls these operations.

use std::time::Duration;

use backon::{ExponentialBuilder, Retryable};
use thiserror::Error;
use tracing::{instrument, warn};
use uuid::Uuid;

mod conn;
mod dispatchers;
mod ids;
mod jobs;
mod runs;
mod scrapers;
mod workers;

use self::conn::DbConnPool;
pub use self::{
    dispatchers::Dispatcher,
    ids::{DispatcherId, JobId, JobRunId, ScraperId, WorkerId},
    jobs::{Job, NewJob},
    runs::JobRun,
    scrapers::{NewScraper, Scraper},
    workers::Worker,
};

/// A dispatcher is considered live if it has called in within this period.
/// The stale reaper force-closes runs held by dispatchers beyond it.
pub const DEFAULT_STALE_DISPATCHER_INTERVAL: Duration = Duration::from_secs(60);

/// Default pool size for the dispatch DB.
pub const DEFAULT_POOL_SIZE: u32 = 10;

#[derive(Error, Debug)]
pub enum Error {
    #[error("error connecting to dispatch db: {0}")]
    ConnectionError(sqlx::Error),

    #[error("error running migrations: {0}")]
    MigrationError(#[from] sqlx::migrate::MigrateError),

    #[error("error executing database query: {0}")]
    Db(#[from] sqlx::Error),

    /// A referenced row does not exist. Surfaced to the caller, not retried.
    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: Uuid },

    /// Token invalid or absent. Callers must not read this as "no work".
    #[error("scraper token not recognized")]
    Unauthorized,

    /// Opening a second unfinished run for a job is a contract violation by
    /// the caller, never silently ignored.
    #[error("job {0} already has an unfinished run")]
    RunAlreadyOpen(JobId),

    /// The dispatcher's previously assigned run is still open.
    #[error("dispatcher {0} still holds an open run")]
    DispatcherBusy(DispatcherId),
}

impl Error {
    /// Returns `true` if retrying the operation could plausibly succeed.
    ///
    /// Covers connection-level failures (I/O, TLS, pool exhaustion) and the
    /// Postgres serialization-failure and deadlock SQLSTATEs (40001, 40P01)
    /// that lock-heavy transactions can hit under contention. Contract
    /// errors like [`Error::RunAlreadyOpen`] are never transient.
    pub fn is_transient(&self) -> bool {
        match self {
            Error::ConnectionError(_) => true,
            Error::Db(err) => match err {
                sqlx::Error::Io(_)
                | sqlx::Error::Tls(_)
                | sqlx::Error::PoolTimedOut
                | sqlx::Error::PoolClosed => true,
                sqlx::Error::Database(db_err) => {
                    matches!(db_err.code().as_deref(), Some("40001") | Some("40P01"))
                }
                _ => false,
            },
            _ => false,
        }
    }
}

impl From<conn::ConnError> for Error {
    fn from(err: conn::ConnError) -> Self {
        match err {
            conn::ConnError::ConnectionError(err) => Error::ConnectionError(err),
            conn::ConnError::MigrationFailed(err) => Error::MigrationError(err),
        }
    }
}

pub(crate) fn is_unique_violation(err: &sqlx::Error) -> bool {
    matches!(err, sqlx::Error::Database(db_err) if db_err.code().as_deref() == Some("23505"))
}

fn is_fk_violation(err: &sqlx::Error) -> bool {
    matches!(err, sqlx::Error::Database(db_err) if db_err.code().as_deref() == Some("23503"))
}

/// Bounded backoff for the claim transaction. Other operations surface
/// transient failures immediately; only claiming retries.
fn claim_retry_policy() -> ExponentialBuilder {
    ExponentialBuilder::default()
        .with_min_delay(Duration::from_millis(50))
        .with_max_delay(Duration::from_secs(1))
        .with_max_times(3)
}

/// Connection pool to the dispatch DB. Clones refer to the same instance.
#[derive(Clone, Debug)]
pub struct DispatchDb {
    pub pool: DbConnPool,
    stale_dispatcher_interval: Duration,
}

impl DispatchDb {
    /// Sets up a connection pool to the dispatch DB.
    ///
    /// Runs migrations if necessary.
    #[instrument(skip_all, err)]
    pub async fn connect(url: &str, pool_size: u32) -> Result<Self, Error> {
        Self::connect_with_config(url, pool_size, true).await
    }

    /// Sets up a connection pool with configurable migration behavior.
    ///
    /// Runs migrations only if `auto_migrate` is true.
    #[instrument(skip_all, err)]
    pub async fn connect_with_config(
        url: &str,
        pool_size: u32,
        auto_migrate: bool,
    ) -> Result<Self, Error> {
        let pool = DbConnPool::connect(url, pool_size).await?;
        if auto_migrate {
            pool.run_migrations().await?;
        }
        Ok(Self {
            pool,
            stale_dispatcher_interval: DEFAULT_STALE_DISPATCHER_INTERVAL,
        })
    }

    /// Configures how long a dispatcher may go without calling in before the
    /// reaper treats it as dead.
    pub fn with_stale_dispatcher_interval(self, interval: Duration) -> Self {
        Self {
            stale_dispatcher_interval: interval,
            ..self
        }
    }

    pub fn default_pool_size() -> u32 {
        DEFAULT_POOL_SIZE
    }
}

/// Scraper authentication API
impl DispatchDb {
    /// Resolves an opaque scraper token to its owning [`Scraper`].
    ///
    /// An unknown token is an explicit [`Error::Unauthorized`], never an
    /// empty result.
    pub async fn scraper_by_token(&self, token: &str) -> Result<Scraper, Error> {
        scrapers::get_by_token(&*self.pool, token)
            .await?
            .ok_or(Error::Unauthorized)
    }

    #[instrument(skip(self, new), err)]
    pub async fn create_scraper(&self, new: NewScraper) -> Result<Scraper, Error> {
        Ok(scrapers::insert(&*self.pool, &new).await?)
    }

    pub async fn get_scraper(&self, id: &ScraperId) -> Result<Option<Scraper>, Error> {
        Ok(scrapers::get_by_id(&*self.pool, id).await?)
    }
}

/// Job claim API
impl DispatchDb {
    #[instrument(skip(self, new), err)]
    pub async fn create_job(&self, new: NewJob) -> Result<Job, Error> {
        Ok(jobs::insert(&*self.pool, &new).await?)
    }

    pub async fn get_job(&self, id: &JobId) -> Result<Option<Job>, Error> {
        Ok(jobs::get_by_id(&*self.pool, id).await?)
    }

    pub async fn list_jobs(&self, start: i64, count: i64) -> Result<Vec<Job>, Error> {
        Ok(jobs::list_page(&*self.pool, start, count).await?)
    }

    /// Claims the next eligible job for the calling dispatcher.
    ///
    /// Eligible jobs are those with `in_process = false`, ordered by
    /// staleness: oldest `last_run_time` first, never-run jobs before all
    /// others. This round-robins work across every configured job instead
    /// of re-running the same one back to back.
    ///
    /// The claim is one transaction: lock the candidate row, re-check the
    /// `in_process` precondition under the lock, flip it, commit. Under N
    /// concurrent callers each successful call returns a distinct job, and
    /// that holds across process boundaries because the exclusion lives in
    /// the database, not in this process.
    ///
    /// Returns `Ok(None)` when nothing is eligible; that signals "no work
    /// available now", not an error. Transient storage failures are retried
    /// a bounded number of times with backoff before surfacing.
    #[instrument(skip(self), err)]
    pub async fn claim_next_job(&self) -> Result<Option<Job>, Error> {
        let claim = || async {
            let mut tx = self.pool.begin().await?;
            let job = jobs::claim_next(&mut *tx).await?;
            tx.commit().await?;
            Ok::<_, Error>(job)
        };
        claim
            .retry(claim_retry_policy())
            .when(Error::is_transient)
            .notify(|err: &Error, dur: Duration| {
                warn!(
                    error = %err,
                    "transient failure claiming job, retrying in {:.2}s",
                    dur.as_secs_f32()
                );
            })
            .await
    }
}

/// Run tracker API
impl DispatchDb {
    /// Opens a run for a freshly claimed job.
    ///
    /// Called right after a successful claim. Refuses to open a second
    /// unfinished run for a job that already has one
    /// ([`Error::RunAlreadyOpen`]).
    #[instrument(skip(self), err)]
    pub async fn open_run(&self, job_id: &JobId, scraper_id: &ScraperId) -> Result<JobRun, Error> {
        let mut tx = self.pool.begin().await?;
        let run = runs::open(&mut *tx, job_id, scraper_id).await?;
        tx.commit().await?;
        Ok(run)
    }

    /// Marks a run finished and releases its job back to the eligible pool.
    ///
    /// Closing an already-closed run is a no-op success. The owning
    /// dispatcher row is left untouched; its idle flag changes only through
    /// its own heartbeat payload.
    #[instrument(skip(self), err)]
    pub async fn close_run(&self, run_id: &JobRunId) -> Result<JobRun, Error> {
        let mut tx = self.pool.begin().await?;
        let run = runs::close(&mut *tx, run_id)
            .await?
            .ok_or(Error::NotFound {
                entity: "job run",
                id: *run_id.as_uuid(),
            })?;
        tx.commit().await?;
        Ok(run)
    }

    pub async fn get_run(&self, id: &JobRunId) -> Result<Option<JobRun>, Error> {
        Ok(runs::get_by_id(&*self.pool, id).await?)
    }

    /// The unfinished run for a job, if one exists.
    pub async fn open_run_for_job(&self, job_id: &JobId) -> Result<Option<JobRun>, Error> {
        Ok(runs::get_open_for_job(&*self.pool, job_id).await?)
    }
}

/// Dispatcher registry API
impl DispatchDb {
    /// Registers a new dispatcher identity for a scraper, idle with zero
    /// uptime. A scraper may announce any number of dispatchers.
    #[instrument(skip(self), err)]
    pub async fn announce_dispatcher(&self, scraper_id: &ScraperId) -> Result<Dispatcher, Error> {
        let mut tx = self.pool.begin().await?;
        if scrapers::get_by_id(&mut *tx, scraper_id).await?.is_none() {
            return Err(Error::NotFound {
                entity: "scraper",
                id: *scraper_id.as_uuid(),
            });
        }
        let dispatcher = dispatchers::insert(&mut *tx, scraper_id).await?;
        tx.commit().await?;
        Ok(dispatcher)
    }

    /// Upserts dispatcher liveness.
    ///
    /// A heartbeat for an unknown id is treated as a fresh announce under
    /// the supplied scraper rather than an error: dispatchers generate and
    /// recover their ids client-side. Workers get the strict treatment
    /// instead; see [`DispatchDb::worker_heartbeat`].
    #[instrument(skip(self), err)]
    pub async fn dispatcher_heartbeat(
        &self,
        id: &DispatcherId,
        scraper_id: &ScraperId,
        up_time: i64,
        idle: bool,
    ) -> Result<Dispatcher, Error> {
        match dispatchers::upsert_heartbeat(&*self.pool, id, scraper_id, up_time, idle).await {
            Ok(dispatcher) => Ok(dispatcher),
            Err(err) if is_fk_violation(&err) => Err(Error::NotFound {
                entity: "scraper",
                id: *scraper_id.as_uuid(),
            }),
            Err(err) => Err(err.into()),
        }
    }

    pub async fn get_dispatcher(&self, id: &DispatcherId) -> Result<Option<Dispatcher>, Error> {
        Ok(dispatchers::get_by_id(&*self.pool, id).await?)
    }

    /// Claims a job and opens a run on behalf of a dispatcher, in a single
    /// transaction: claim, open run, record the assignment on the
    /// dispatcher row (`idle = false`).
    ///
    /// Returns `Ok(None)` and leaves the dispatcher untouched when no job
    /// is eligible. A dispatcher whose previous run is still open gets
    /// [`Error::DispatcherBusy`]; it must close that run first.
    #[instrument(skip(self), err)]
    pub async fn assign_job(
        &self,
        dispatcher_id: &DispatcherId,
    ) -> Result<Option<(Job, JobRun)>, Error> {
        let mut tx = self.pool.begin().await?;
        let Some(dispatcher) = dispatchers::lock_by_id(&mut *tx, dispatcher_id).await? else {
            return Err(Error::NotFound {
                entity: "dispatcher",
                id: *dispatcher_id.as_uuid(),
            });
        };
        // The idle flag is self-reported; what gates reassignment is
        // whether the previously assigned run is still open.
        if let Some(run_id) = &dispatcher.current_job_run_id {
            if let Some(run) = runs::get_by_id(&mut *tx, run_id).await? {
                if !run.finished {
                    return Err(Error::DispatcherBusy(*dispatcher_id));
                }
            }
        }
        let Some(job) = jobs::claim_next(&mut *tx).await? else {
            return Ok(None);
        };
        let run = runs::open(&mut *tx, &job.id, &dispatcher.scraper_id).await?;
        dispatchers::set_assignment(&mut *tx, dispatcher_id, &job.id, &run.id).await?;
        tx.commit().await?;
        Ok(Some((job, run)))
    }

    /// Dispatchers that have called in within the stale interval.
    pub async fn active_dispatchers(&self) -> Result<Vec<Dispatcher>, Error> {
        Ok(dispatchers::active(&*self.pool, self.stale_dispatcher_interval).await?)
    }

    /// Force-closes runs held by dispatchers that stopped calling in.
    ///
    /// A dispatcher past the stale interval with an open run is presumed
    /// dead: its run is closed, its job released back to the eligible pool,
    /// and the dispatcher row detached and marked idle. Returns the ids of
    /// the released jobs.
    ///
    /// Liveness monitoring is layered on top of the claim engine; callers
    /// run this periodically rather than the engine timing out claims
    /// itself.
    #[instrument(skip(self), err)]
    pub async fn reap_stale_dispatchers(&self) -> Result<Vec<JobId>, Error> {
        let mut tx = self.pool.begin().await?;
        let stale =
            dispatchers::stale_with_open_runs(&mut *tx, self.stale_dispatcher_interval).await?;
        let mut released = Vec::new();
        for dispatcher in stale {
            let Some(run_id) = dispatcher.current_job_run_id else {
                continue;
            };
            if let Some(run) = runs::close(&mut *tx, &run_id).await? {
                released.push(run.job_id);
            }
            dispatchers::clear_assignment(&mut *tx, &dispatcher.id).await?;
        }
        tx.commit().await?;
        Ok(released)
    }
}

/// Worker registry API
impl DispatchDb {
    /// Registers a worker under a dispatcher.
    ///
    /// The dispatcher must exist and belong to the same scraper; a mismatch
    /// is an authorization failure, not a missing row.
    #[instrument(skip(self), err)]
    pub async fn announce_worker(
        &self,
        scraper_id: &ScraperId,
        dispatcher_id: &DispatcherId,
    ) -> Result<Worker, Error> {
        let mut tx = self.pool.begin().await?;
        let Some(dispatcher) = dispatchers::get_by_id(&mut *tx, dispatcher_id).await? else {
            return Err(Error::NotFound {
                entity: "dispatcher",
                id: *dispatcher_id.as_uuid(),
            });
        };
        if dispatcher.scraper_id != *scraper_id {
            return Err(Error::Unauthorized);
        }
        let worker = workers::insert(&mut *tx, scraper_id, dispatcher_id).await?;
        tx.commit().await?;
        Ok(worker)
    }

    /// Updates worker liveness.
    ///
    /// An unknown worker id is [`Error::NotFound`]; workers are never
    /// re-created implicitly, unlike dispatchers.
    #[instrument(skip(self), err)]
    pub async fn worker_heartbeat(&self, id: &WorkerId, up_time: i64) -> Result<Worker, Error> {
        workers::update_heartbeat(&*self.pool, id, up_time)
            .await?
            .ok_or(Error::NotFound {
                entity: "worker",
                id: *id.as_uuid(),
            })
    }

    pub async fn get_worker(&self, id: &WorkerId) -> Result<Option<Worker>, Error> {
        Ok(workers::get_by_id(&*self.pool, id).await?)
    }

    /// Confirms a worker and its dispatcher/scraper chain before a document
    /// submission is forwarded to ingestion.
    ///
    /// The worker must exist, its dispatcher must still exist, and both
    /// must belong to the same scraper.
    pub async fn verify_reporting_chain(&self, worker_id: &WorkerId) -> Result<Worker, Error> {
        let Some(worker) = workers::get_by_id(&*self.pool, worker_id).await? else {
            return Err(Error::NotFound {
                entity: "worker",
                id: *worker_id.as_uuid(),
            });
        };
        let Some(dispatcher) = dispatchers::get_by_id(&*self.pool, &worker.dispatcher_id).await?
        else {
            return Err(Error::NotFound {
                entity: "dispatcher",
                id: *worker.dispatcher_id.as_uuid(),
            });
        };
        if dispatcher.scraper_id != worker.scraper_id {
            return Err(Error::Unauthorized);
        }
        Ok(worker)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pool_exhaustion_is_transient() {
        let err = Error::Db(sqlx::Error::PoolTimedOut);
        assert!(err.is_transient());
    }

    #[test]
    fn contract_errors_are_not_transient() {
        assert!(!Error::Unauthorized.is_transient());
        assert!(!Error::RunAlreadyOpen(JobId::random()).is_transient());
        assert!(!Error::NotFound {
            entity: "job",
            id: uuid::Uuid::new_v4(),
        }
        .is_transient());
    }
}
