//! DB integration tests for scraper token authentication

use dispatch_db::Error;

mod common;

#[tokio::test]
async fn token_resolves_to_owning_scraper() {
    //* Given
    let (_temp_db, db) = common::temp_dispatch_db().await;
    let new = common::new_scraper("tokened");
    let token = new.token.clone();
    let scraper = db
        .create_scraper(new)
        .await
        .expect("Failed to create scraper");

    //* When
    let resolved = db
        .scraper_by_token(&token)
        .await
        .expect("Token should resolve");

    //* Then
    assert_eq!(resolved.id, scraper.id);
    assert_eq!(resolved.token, token);
}

#[tokio::test]
async fn unknown_token_is_unauthorized() {
    //* Given
    let (_temp_db, db) = common::temp_dispatch_db().await;
    db.create_scraper(common::new_scraper("other"))
        .await
        .expect("Failed to create scraper");

    //* When
    let result = db.scraper_by_token("not-a-real-token").await;

    //* Then
    assert!(
        matches!(result, Err(Error::Unauthorized)),
        "Expected Unauthorized, got {result:?}"
    );
}

#[tokio::test]
async fn scraper_lookup_by_id() {
    //* Given
    let (_temp_db, db) = common::temp_dispatch_db().await;
    let scraper = db
        .create_scraper(common::new_scraper("findable"))
        .await
        .expect("Failed to create scraper");

    //* When
    let found = db
        .get_scraper(&scraper.id)
        .await
        .expect("Lookup failed")
        .expect("Scraper not found");

    //* Then
    assert_eq!(found.id, scraper.id);
    assert_eq!(found.name, scraper.name);
}
