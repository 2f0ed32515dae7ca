//! Shared setup for the DB integration tests
#![allow(dead_code)]

use std::time::Duration;

use backon::{ExponentialBuilder, Retryable};
use dispatch_db::{DispatchDb, Error, NewJob, NewScraper};
use pgtemp::PgTempDB;
use uuid::Uuid;

/// Spins up a temporary Postgres instance and connects the coordinator to
/// it, retrying while the database is still starting up.
///
/// The `PgTempDB` handle must stay alive for the duration of the test.
pub async fn temp_dispatch_db() -> (PgTempDB, DispatchDb) {
    let temp_db = PgTempDB::new();
    let uri = temp_db.connection_uri();

    let db = (|| DispatchDb::connect(&uri, 10))
        .retry(startup_retry_policy())
        .when(is_database_starting_up)
        .await
        .expect("Failed to connect to dispatch db");

    (temp_db, db)
}

fn startup_retry_policy() -> ExponentialBuilder {
    ExponentialBuilder::default()
        .with_min_delay(Duration::from_millis(10))
        .with_max_delay(Duration::from_millis(100))
        .with_max_times(20)
}

fn is_database_starting_up(err: &Error) -> bool {
    match err {
        Error::ConnectionError(sqlx::Error::Database(db_err)) => db_err
            .to_string()
            .contains("the database system is starting up"),
        _ => false,
    }
}

pub fn new_scraper(name: &str) -> NewScraper {
    NewScraper {
        name: name.to_owned(),
        description: format!("test scraper {name}"),
        token: format!("{}-{}", Uuid::new_v4(), Uuid::new_v4()),
        owner_id: None,
    }
}

pub fn new_job(name: &str) -> NewJob {
    NewJob {
        name: name.to_owned(),
        description: format!("test job {name}"),
        url: format!("https://city.example/{name}"),
        link_level: 2,
        municipality_id: Uuid::new_v4(),
    }
}
