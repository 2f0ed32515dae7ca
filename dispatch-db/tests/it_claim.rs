//! DB integration tests for the job claim engine

use std::collections::HashSet;

use dispatch_db::JobId;

mod common;

#[tokio::test]
async fn claim_follows_staleness_order_then_runs_dry() {
    //* Given
    let (_temp_db, db) = common::temp_dispatch_db().await;

    // A has never run; B ran two hours ago; C ran one hour ago.
    let job_a = db
        .create_job(common::new_job("job-a"))
        .await
        .expect("Failed to create job A");
    let job_b = db
        .create_job(common::new_job("job-b"))
        .await
        .expect("Failed to create job B");
    let job_c = db
        .create_job(common::new_job("job-c"))
        .await
        .expect("Failed to create job C");

    sqlx::query("UPDATE jobs SET last_run_time = now() - interval '2 hours' WHERE id = $1")
        .bind(job_b.id)
        .execute(&*db.pool)
        .await
        .expect("Failed to backdate job B");
    sqlx::query("UPDATE jobs SET last_run_time = now() - interval '1 hour' WHERE id = $1")
        .bind(job_c.id)
        .execute(&*db.pool)
        .await
        .expect("Failed to backdate job C");

    //* When
    let first = db.claim_next_job().await.expect("First claim failed");
    let second = db.claim_next_job().await.expect("Second claim failed");
    let third = db.claim_next_job().await.expect("Third claim failed");
    let fourth = db.claim_next_job().await.expect("Fourth claim failed");

    //* Then
    // Null last_run_time sorts first, then oldest runs.
    assert_eq!(first.expect("Expected job A").id, job_a.id);
    assert_eq!(second.expect("Expected job B").id, job_b.id);
    assert_eq!(third.expect("Expected job C").id, job_c.id);
    assert!(fourth.is_none(), "All jobs in process, expected no work");
}

#[tokio::test]
async fn claim_marks_job_in_process_and_stamps_start_time() {
    //* Given
    let (_temp_db, db) = common::temp_dispatch_db().await;
    let job = db
        .create_job(common::new_job("stamped"))
        .await
        .expect("Failed to create job");
    assert!(!job.in_process);
    assert!(job.start_run_time.is_none());

    //* When
    let claimed = db
        .claim_next_job()
        .await
        .expect("Claim failed")
        .expect("Expected a job");

    //* Then
    assert_eq!(claimed.id, job.id);
    assert!(claimed.in_process);
    assert!(claimed.start_run_time.is_some());

    let stored = db
        .get_job(&job.id)
        .await
        .expect("Failed to fetch job")
        .expect("Job not found");
    assert!(stored.in_process);
}

#[tokio::test]
async fn claim_returns_none_on_empty_table() {
    //* Given
    let (_temp_db, db) = common::temp_dispatch_db().await;

    //* When
    let claimed = db.claim_next_job().await.expect("Claim failed");

    //* Then
    assert!(claimed.is_none());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_claims_never_hand_out_the_same_job() {
    //* Given
    const CLAIMERS: usize = 8;
    const JOBS: usize = 3;

    let (_temp_db, db) = common::temp_dispatch_db().await;

    let mut job_ids = HashSet::new();
    for i in 0..JOBS {
        let job = db
            .create_job(common::new_job(&format!("contended-{i}")))
            .await
            .expect("Failed to create job");
        job_ids.insert(job.id);
    }

    //* When
    let mut handles = Vec::new();
    for _ in 0..CLAIMERS {
        let db = db.clone();
        handles.push(tokio::spawn(async move { db.claim_next_job().await }));
    }

    let mut claimed: Vec<JobId> = Vec::new();
    for handle in handles {
        let result = handle.await.expect("Claimer panicked").expect("Claim failed");
        if let Some(job) = result {
            claimed.push(job.id);
        }
    }

    //* Then
    // At most one success per eligible job, and no job claimed twice.
    assert!(
        claimed.len() <= JOBS,
        "More successful claims than jobs: {claimed:?}"
    );
    let distinct: HashSet<_> = claimed.iter().copied().collect();
    assert_eq!(
        distinct.len(),
        claimed.len(),
        "A job was handed to two claimers: {claimed:?}"
    );
    assert!(distinct.is_subset(&job_ids));
}
