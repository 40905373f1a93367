//! Concurrency tests for pqmsg
//!
//! Many workers race on the same ping inbox entries, replay cache and
//! per-peer session. Exactly one winner per transition is the invariant.

use pqmsg::ping::{
    AutoDownloadPolicy, ClaimDecision, FailureOutcome, MemoryPingInbox, PingState, TransportHealth,
};
use pqmsg::storage::{open_database, RocksDbConfig, RocksDbPingInbox};
use pqmsg::{
    AckConfig, ManualClock, PaddingConfig, PingConfig, PingInbox, RatchetState, Received,
    ReplayCache, Session,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Barrier, Mutex};
use std::thread;
use tempfile::TempDir;

const WORKERS: usize = 8;

/// Runs `work` on `WORKERS` threads released together; returns their results.
fn race<T, F>(work: F) -> Vec<T>
where
    T: Send + 'static,
    F: Fn(usize) -> T + Send + Sync + 'static,
{
    let barrier = Arc::new(Barrier::new(WORKERS));
    let work = Arc::new(work);
    let handles: Vec<_> = (0..WORKERS)
        .map(|worker| {
            let barrier = Arc::clone(&barrier);
            let work = Arc::clone(&work);
            thread::spawn(move || {
                barrier.wait();
                work(worker)
            })
        })
        .collect();
    handles
        .into_iter()
        .map(|h| h.join().expect("worker panicked"))
        .collect()
}

/// Test that every ping is claimed by exactly one worker
#[test]
fn test_claim_race_single_winner() {
    let inbox = Arc::new(MemoryPingInbox::new());
    for round in 0..50 {
        let ping_id = format!("ping-{}", round);
        inbox.insert_or_touch(&ping_id, "alice", None, 0).unwrap();

        let racing = Arc::clone(&inbox);
        let id = ping_id.clone();
        let rows: usize = race(move |_| racing.claim_for_download(&id, 1).unwrap())
            .into_iter()
            .sum();
        assert_eq!(rows, 1, "round {}", round);
        assert_eq!(
            inbox.get(&ping_id).unwrap().unwrap().state,
            PingState::DownloadQueued
        );
    }
}

/// Test that the policy reports losers as routine claim losses
#[test]
fn test_policy_claim_race() {
    let inbox = Arc::new(MemoryPingInbox::new());
    inbox.insert_or_touch("ping", "alice", None, 0).unwrap();
    let policy = Arc::new(AutoDownloadPolicy::new(PingConfig::default()));

    let racing = Arc::clone(&inbox);
    let results = race(move |_| {
        policy.try_claim(racing.as_ref(), "ping", TransportHealth::Healthy, 5)
    });

    let winners = results
        .iter()
        .filter(|r| matches!(r, Ok(ClaimDecision::Claimed)))
        .count();
    assert_eq!(winners, 1);
    // A loser either lost the claim outright or saw the winner's pressure
    assert!(results.iter().all(|r| match r {
        Ok(_) => true,
        Err(e) => e.is_routine(),
    }));
}

/// Test that concurrent failure reports apply exactly once per claim
#[test]
fn test_failure_race_on_rocksdb() {
    let temp = TempDir::new().unwrap();
    let db = open_database(temp.path(), &RocksDbConfig::default()).unwrap();
    let inbox = Arc::new(RocksDbPingInbox::new(db));
    inbox.insert_or_touch("ping", "alice", None, 0).unwrap();
    assert_eq!(inbox.claim_for_download("ping", 0).unwrap(), 1);

    let racing = Arc::clone(&inbox);
    let outcomes = race(move |_| racing.record_failure("ping", 5, 10).unwrap());
    let applied = outcomes
        .iter()
        .filter(|o| **o != FailureOutcome::NotApplied)
        .count();
    assert_eq!(applied, 1);

    let entry = inbox.get("ping").unwrap().unwrap();
    assert_eq!(entry.state, PingState::FailedTemp);
    assert_eq!(entry.attempt_count, 1);
}

/// Test that a fingerprint is accepted by exactly one of many racing receivers
#[test]
fn test_replay_cache_race() {
    let cache = Arc::new(ReplayCache::new(1_000).unwrap());
    for round in 0..50u32 {
        let racing = Arc::clone(&cache);
        let accepted = race(move |_| racing.check_bytes(b"peer", &round.to_be_bytes()))
            .into_iter()
            .filter(|fresh| *fresh)
            .count();
        assert_eq!(accepted, 1, "round {}", round);
    }
}

/// Test that a session shared behind a lock delivers each packet once
#[test]
fn test_locked_session_delivers_once() {
    let secret = [5u8; 64];
    let replay = Arc::new(ReplayCache::new(1_000).unwrap());
    let clock = Arc::new(ManualClock::new(0));
    let make = |local: &str, peer: &str| {
        Session::new(
            RatchetState::establish(&secret, local, peer).unwrap(),
            AckConfig::default(),
            PaddingConfig::no_delay(),
            replay.clone(),
            clock.clone(),
        )
    };
    let mut alice = make("alice", "bob");
    let bob = Arc::new(Mutex::new(make("bob", "alice")));

    let packets: Arc<Vec<Vec<u8>>> = Arc::new(
        (0..20)
            .map(|i: u32| alice.send(&i.to_be_bytes()).unwrap().packet)
            .collect(),
    );
    let delivered = Arc::new(AtomicUsize::new(0));

    // Every worker tries to deliver every packet
    let racing_bob = Arc::clone(&bob);
    let racing_packets = Arc::clone(&packets);
    let counter = Arc::clone(&delivered);
    race(move |worker| {
        for offset in 0..racing_packets.len() {
            let packet = &racing_packets[(offset + worker) % racing_packets.len()];
            let mut session = racing_bob.lock().unwrap();
            if let Ok(Received::Message { .. }) = session.receive(packet) {
                counter.fetch_add(1, Ordering::SeqCst);
            }
        }
    });

    assert_eq!(delivered.load(Ordering::SeqCst), packets.len());
    assert_eq!(bob.lock().unwrap().ratchet().skipped_key_count(), 0);
}
