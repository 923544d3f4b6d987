//! Job store behavior across connections: claims, duplicates and aborts.

use std::collections::HashSet;
use std::sync::{Arc, Barrier};
use std::thread;

use autoapply::core::types::JobStatus;
use autoapply::test_support::TestStore;

/// Four workers with their own connections race over twenty jobs; every job
/// is claimed exactly once.
#[test]
fn concurrent_claims_never_hand_out_a_job_twice() {
    let db = TestStore::new().expect("store");
    let mut store = db.open().expect("open");
    for i in 0..20 {
        assert!(
            store
                .enqueue(&format!("https://ex.com/job/{i}"), "", "")
                .expect("enqueue")
        );
    }

    let barrier = Arc::new(Barrier::new(4));
    let handles: Vec<_> = (0..4)
        .map(|_| {
            let mut conn = db.open().expect("open");
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                let mut claimed = Vec::new();
                while let Some(job) = conn.claim_next().expect("claim") {
                    assert_eq!(job.status, JobStatus::InProgress);
                    claimed.push(job.id);
                }
                claimed
            })
        })
        .collect();

    let mut all = Vec::new();
    for handle in handles {
        all.extend(handle.join().expect("join"));
    }
    let unique: HashSet<i64> = all.iter().copied().collect();
    assert_eq!(all.len(), 20);
    assert_eq!(unique.len(), 20);

    let counts = store.counts().expect("counts");
    assert_eq!(counts.pending, 0);
    assert_eq!(counts.in_progress, 20);
}

#[test]
fn duplicate_url_is_ignored_across_connections() {
    let db = TestStore::new().expect("store");
    let mut first = db.open().expect("open");
    let mut second = db.open().expect("open");

    assert!(
        first
            .enqueue("https://ex.com/job/1", "Engineer", "Acme")
            .expect("enqueue")
    );
    assert!(
        !second
            .enqueue("https://ex.com/job/1", "Other title", "Other")
            .expect("enqueue")
    );

    let jobs = first.list_all().expect("list");
    assert_eq!(jobs.len(), 1);
    assert_eq!(jobs[0].title, "Engineer");
}

#[test]
fn claims_follow_insertion_order() {
    let db = TestStore::new().expect("store");
    let mut store = db.open().expect("open");
    for url in ["https://ex.com/a", "https://ex.com/b", "https://ex.com/c"] {
        store.enqueue(url, "", "").expect("enqueue");
    }
    let order: Vec<String> = std::iter::from_fn(|| store.claim_next().expect("claim"))
        .map(|job| job.url)
        .collect();
    assert_eq!(
        order,
        vec!["https://ex.com/a", "https://ex.com/b", "https://ex.com/c"]
    );
}

#[test]
fn operator_abort_wins_over_a_late_worker_write() {
    let db = TestStore::new().expect("store");
    let mut worker = db.open().expect("open");
    let mut operator = db.open().expect("open");

    worker.enqueue("https://ex.com/job/1", "", "").expect("enqueue");
    let job = worker.claim_next().expect("claim").expect("job");

    assert!(operator.abort(job.id, "wrong posting").expect("abort"));
    assert!(
        !worker
            .set_status(job.id, JobStatus::Success, "finished after 3 iterations")
            .expect("set status")
    );

    let stored = operator.get(job.id).expect("get").expect("job");
    assert_eq!(stored.status, JobStatus::Failed);
    assert!(stored.log.contains("aborted by operator: wrong posting"));
    assert!(!stored.log.contains("finished after"));
}

#[test]
fn aborted_pending_job_is_never_claimed() {
    let db = TestStore::new().expect("store");
    let mut store = db.open().expect("open");
    store.enqueue("https://ex.com/job/1", "", "").expect("enqueue");
    store.enqueue("https://ex.com/job/2", "", "").expect("enqueue");

    let first = store.list_all().expect("list").into_iter().find(|j| j.url.ends_with("/1"));
    let first = first.expect("job 1");
    assert!(store.abort(first.id, "duplicate posting").expect("abort"));

    let claimed = store.claim_next().expect("claim").expect("job");
    assert_eq!(claimed.url, "https://ex.com/job/2");
    assert!(store.claim_next().expect("claim").is_none());
}
