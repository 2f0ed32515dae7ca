//! Scraper installations, the authentication principals of the fleet

use sqlx::{
    types::chrono::{DateTime, Utc},
    Postgres,
};
use uuid::Uuid;

use crate::ids::ScraperId;

/// A registered scraper installation.
///
/// The `token` is the opaque secret presented by its dispatchers and
/// workers; lookup goes through a unique index.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct Scraper {
    pub id: ScraperId,
    pub name: String,
    pub description: String,
    pub token: String,
    /// Owning user in the admin store, if any
    pub owner_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Fields required to register a scraper
#[derive(Debug, Clone)]
pub struct NewScraper {
    pub name: String,
    pub description: String,
    pub token: String,
    pub owner_id: Option<Uuid>,
}

pub async fn insert<'c, E>(exe: E, new: &NewScraper) -> Result<Scraper, sqlx::Error>
where
    E: sqlx::Executor<'c, Database = Postgres>,
{
    let query = indoc::indoc! {r#"
        INSERT INTO scrapers (id, name, description, token, owner_id)
        VALUES ($1, $2, $3, $4, $5)
        RETURNING *
    "#};
    sqlx::query_as(query)
        .bind(ScraperId::random())
        .bind(&new.name)
        .bind(&new.description)
        .bind(&new.token)
        .bind(new.owner_id)
        .fetch_one(exe)
        .await
}

pub async fn get_by_id<'c, E>(exe: E, id: &ScraperId) -> Result<Option<Scraper>, sqlx::Error>
where
    E: sqlx::Executor<'c, Database = Postgres>,
{
    sqlx::query_as("SELECT * FROM scrapers WHERE id = $1")
        .bind(id)
        .fetch_optional(exe)
        .await
}

/// Unique-indexed token lookup. A miss is an authentication failure, which
/// the facade distinguishes from an empty result.
pub async fn get_by_token<'c, E>(exe: E, token: &str) -> Result<Option<Scraper>, sqlx::Error>
where
    E: sqlx::Executor<'c, Database = Postgres>,
{
    sqlx::query_as("SELECT * FROM scrapers WHERE token = $1")
        .bind(token)
        .fetch_optional(exe)
        .await
}
