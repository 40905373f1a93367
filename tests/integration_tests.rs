//! Integration tests for pqmsg
//!
//! These tests drive complete flows across modules: hybrid agreement into a
//! ratchet, KEM steps in both directions, sessions with ACK retries,
//! persistence through RocksDB and the wake handshake end to end.

use pqmsg::ack::AckKind;
use pqmsg::crypto::generate_signing_key;
use pqmsg::crypto::kem::{hybrid_decapsulate, hybrid_encapsulate, HybridKeyPair};
use pqmsg::crypto::Password;
use pqmsg::ping::{
    AutoDownloadPolicy, ClaimDecision, MemoryPingInbox, PingState, PingToken, TransportHealth,
};
use pqmsg::storage::{open_database, RatchetStore, RocksDbConfig, RocksDbPingInbox, RocksDbRatchetStore};
use pqmsg::{
    AckConfig, Clock, ManualClock, PaddingConfig, PingConfig, PingInbox, RatchetState, Received,
    ReplayCache, RetryAction, Session, WakeHandler, Watchdog,
};
use std::sync::Arc;
use tempfile::TempDir;

/// Runs a real hybrid agreement and returns both ratchet states.
fn establish_pair() -> (RatchetState, RatchetState) {
    let bob_kem = HybridKeyPair::generate();
    let (alice_secret, ciphertext) =
        hybrid_encapsulate(bob_kem.public_key()).expect("Failed to encapsulate");
    let bob_secret = hybrid_decapsulate(&bob_kem, &ciphertext).expect("Failed to decapsulate");
    assert_eq!(alice_secret.as_bytes(), bob_secret.as_bytes());

    (
        RatchetState::establish(alice_secret.as_bytes(), "alice", "bob")
            .expect("Failed to establish Alice"),
        RatchetState::establish(bob_secret.as_bytes(), "bob", "alice")
            .expect("Failed to establish Bob"),
    )
}

fn session(ratchet: RatchetState, replay: &Arc<ReplayCache>, clock: &Arc<ManualClock>) -> Session {
    Session::new(
        ratchet,
        AckConfig {
            retry_interval_ms: 1_000,
            max_attempts: 3,
        },
        PaddingConfig::no_delay(),
        replay.clone(),
        clock.clone(),
    )
}

/// Test a conversation across KEM steps taken by each side in turn
#[test]
fn test_ratchet_kem_steps_both_directions() {
    let (mut alice, mut bob) = establish_pair();

    let (a0, n0) = alice.encrypt(b"gen0 first").unwrap();
    let (a1, n1) = alice.encrypt(b"gen0 second").unwrap();

    // Alice steps before Bob has read anything from generation 0
    let bob_public = bob.own_kem_public().clone();
    let step = alice.kem_ratchet_step(&bob_public).expect("Alice KEM step");
    assert_eq!(alice.generation(), 1);
    bob.kem_ratchet_receive(&step).expect("Bob applies step");
    assert_eq!(bob.generation(), 1);

    let (b, nb) = alice.encrypt(b"gen1").unwrap();
    assert_eq!(nb, 0);
    assert_eq!(bob.decrypt(&b, nb).unwrap(), b"gen1");

    // Late generation 0 messages, themselves out of order
    assert_eq!(bob.decrypt(&a1, n1).unwrap(), b"gen0 second");
    assert_eq!(bob.decrypt(&a0, n0).unwrap(), b"gen0 first");

    // Bob steps back toward Alice's fresh key
    let alice_public = alice.own_kem_public().clone();
    assert_eq!(bob.peer_kem_public(), Some(&alice_public));
    let step = bob.kem_ratchet_step(&alice_public).expect("Bob KEM step");
    alice.kem_ratchet_receive(&step).expect("Alice applies step");
    assert_eq!(alice.generation(), 2);
    assert_eq!(bob.generation(), 2);

    let (c, nc) = bob.encrypt(b"gen2 from bob").unwrap();
    assert_eq!(alice.decrypt(&c, nc).unwrap(), b"gen2 from bob");
    let (d, nd) = alice.encrypt(b"gen2 from alice").unwrap();
    assert_eq!(bob.decrypt(&d, nd).unwrap(), b"gen2 from alice");

    // A stale step is refused
    assert!(alice.kem_ratchet_receive(&step).is_err());
}

/// Delivers `packet` and carries back the ACK it asks for.
fn deliver(from: &mut Session, to: &mut Session, packet: &[u8]) -> Received {
    let received = to.receive(packet).expect("Delivery failed");
    if let Some(message_id) = received.ack_id() {
        let ack = to.acknowledge(message_id).unwrap();
        match from.receive(&ack).unwrap() {
            Received::Acked { first, .. } => assert!(first),
            other => panic!("Expected ACK, got {:?}", other),
        }
    }
    received
}

/// Test a long two-way session where both sides reach the re-key interval
#[test]
fn test_session_conversation_with_rekeys() {
    let (alice_ratchet, bob_ratchet) = establish_pair();
    let replay = Arc::new(ReplayCache::new(1_000).unwrap());
    let clock = Arc::new(ManualClock::new(0));
    let mut alice = session(alice_ratchet, &replay, &clock);
    let mut bob = session(bob_ratchet, &replay, &clock);

    let announce = alice.announce_kem_key().unwrap();
    assert!(matches!(
        deliver(&mut alice, &mut bob, &announce.packet),
        Received::PeerKeyUpdated { .. }
    ));
    let announce = bob.announce_kem_key().unwrap();
    assert!(matches!(
        deliver(&mut bob, &mut alice, &announce.packet),
        Received::PeerKeyUpdated { .. }
    ));

    let (mut steps, mut requests) = (0, 0);
    for i in 0..200u32 {
        let (sender, receiver) = if i % 2 == 0 {
            (&mut alice, &mut bob)
        } else {
            (&mut bob, &mut alice)
        };

        if sender.should_rekey() {
            let outbound = sender.rekey().unwrap();
            match deliver(sender, receiver, &outbound.packet) {
                Received::Rekeyed { generation, .. } => {
                    assert_eq!(generation, receiver.ratchet().generation());
                    steps += 1;
                }
                Received::RekeyRequested { .. } => requests += 1,
                other => panic!("Expected re-key, got {:?}", other),
            }
        }

        let body = i.to_be_bytes();
        let outbound = sender.send(&body).unwrap();
        assert_eq!(outbound.packet.len(), 4096);
        match deliver(sender, receiver, &outbound.packet) {
            Received::Message {
                message_id,
                body: got,
            } => {
                assert_eq!(got, body);
                assert_eq!(message_id, outbound.message_id);
            }
            other => panic!("Expected message, got {:?}", other),
        }
    }

    // Only Alice steps; Bob's turns at the interval become requests
    assert!(steps >= 2, "expected at least two re-keys, got {}", steps);
    assert!(requests >= 1, "expected a re-key request, got {}", requests);
    assert_eq!(alice.ratchet().generation(), steps);
    assert_eq!(alice.ratchet().generation(), bob.ratchet().generation());
    alice.drain_acked();
    bob.drain_acked();
    assert_eq!(alice.acks().pending_count(), 0);
    assert_eq!(bob.acks().pending_count(), 0);
}

/// Test that an unacknowledged message is resent byte-for-byte and then gives up
#[test]
fn test_session_retry_until_exhausted() {
    let (alice_ratchet, bob_ratchet) = establish_pair();
    let replay = Arc::new(ReplayCache::new(100).unwrap());
    let clock = Arc::new(ManualClock::new(0));
    let mut alice = session(alice_ratchet, &replay, &clock);
    let mut bob = session(bob_ratchet, &replay, &clock);

    let outbound = alice.send(b"are you there?").unwrap();
    assert!(alice.due_for_retry().is_empty());

    let mut resent = Vec::new();
    for _ in 0..5 {
        clock.advance(1_000);
        resent.extend(alice.due_for_retry());
    }

    let resends: Vec<&Vec<u8>> = resent
        .iter()
        .filter_map(|action| match action {
            RetryAction::Resend { wire_bytes, .. } => Some(wire_bytes),
            RetryAction::Exhausted { .. } => None,
        })
        .collect();
    assert_eq!(resends.len(), 2);
    assert!(resends.iter().all(|bytes| **bytes == outbound.packet));
    assert!(resent
        .iter()
        .any(|action| matches!(action, RetryAction::Exhausted { message_id } if *message_id == outbound.message_id)));

    // The first copy is delivered, later copies only ask for the ACK again
    assert!(matches!(
        bob.receive(&outbound.packet).unwrap(),
        Received::Message { .. }
    ));
    assert_eq!(
        bob.receive(resends[0]).unwrap(),
        Received::Redelivered {
            message_id: outbound.message_id.clone()
        }
    );
}

/// Test that ratchet states survive a restart through the encrypted store
#[test]
fn test_persistence_across_restart() {
    let temp = TempDir::new().expect("Failed to create temp dir");
    let password = Password::new("correct horse battery staple".to_string());
    let (mut alice, mut bob) = establish_pair();

    let (ct, n) = alice.encrypt(b"before restart").unwrap();
    {
        let db = open_database(temp.path(), &RocksDbConfig::default()).unwrap();
        let store = RocksDbRatchetStore::open(db, &password).unwrap();
        store.save("bob", &alice).unwrap();
    }

    let db = open_database(temp.path(), &RocksDbConfig::default()).unwrap();
    let store = RocksDbRatchetStore::open(db, &password).unwrap();
    let mut restored = store.load("bob").unwrap().expect("State should exist");
    assert_eq!(restored.sending_message_number(), 1);

    assert_eq!(bob.decrypt(&ct, n).unwrap(), b"before restart");
    let (ct, n) = restored.encrypt(b"after restart").unwrap();
    assert_eq!(bob.decrypt(&ct, n).unwrap(), b"after restart");
    assert_eq!(store.contacts().unwrap(), vec!["bob".to_string()]);
}

/// Test the complete wake handshake: ping, pong, claim, store, delivery ACK
#[test]
fn test_wake_handshake_end_to_end() {
    let clock = Arc::new(ManualClock::new(1_000));
    let alice_key = generate_signing_key();
    let alice_public = alice_key.verifying_key().to_bytes();

    let bob_inbox = Arc::new(MemoryPingInbox::new());
    let bob = WakeHandler::new(
        bob_inbox.clone(),
        generate_signing_key(),
        PingConfig::default(),
        clock.clone(),
    );
    let alice = WakeHandler::new(
        Arc::new(MemoryPingInbox::new()),
        alice_key.clone(),
        PingConfig::default(),
        clock.clone(),
    );

    // Alice wakes Bob
    let ping = PingToken::new(&alice_key, bob.public_key());
    let inbound = bob
        .on_ping("alice", &alice_public, &ping.to_bytes().unwrap())
        .expect("Ping should be accepted");

    // Bob answers, then claims the download under normal pressure
    let pong = bob.send_pong(&inbound.ping_id, true).unwrap();
    pong.verify(&bob.public_key(), 300).expect("Pong should verify");

    let policy = AutoDownloadPolicy::new(PingConfig::default());
    let decision = policy
        .try_claim(bob_inbox.as_ref(), &inbound.ping_id, TransportHealth::Healthy, clock.now_ms())
        .unwrap();
    assert_eq!(decision, ClaimDecision::Claimed);

    // A second worker loses the race
    let err = policy
        .try_claim(bob_inbox.as_ref(), &inbound.ping_id, TransportHealth::Healthy, clock.now_ms())
        .unwrap_err();
    assert!(err.is_routine());

    // Payload stored, ACK flows back to Alice
    let ack = bob.complete_download(&inbound.ping_id).unwrap();
    assert_eq!(ack.kind, AckKind::MessageAck);
    let (verified, _) = alice
        .on_delivery_ack("bob", &bob.public_key(), &ack.to_bytes().unwrap())
        .expect("ACK should verify");
    assert_eq!(verified.item_id, inbound.ping_id);

    let entry = bob_inbox.get(&inbound.ping_id).unwrap().unwrap();
    assert_eq!(entry.state, PingState::MsgStored);
}

/// Test that a crashed claimant is recovered by the watchdog on durable storage
#[test]
fn test_watchdog_recovers_stuck_claim_on_rocksdb() {
    let temp = TempDir::new().expect("Failed to create temp dir");
    let db = open_database(temp.path(), &RocksDbConfig::default()).unwrap();
    let inbox = Arc::new(RocksDbPingInbox::new(db));
    let clock = Arc::new(ManualClock::new(0));
    let config = PingConfig {
        max_retries: 2,
        stuck_claim_threshold_ms: 10_000,
        ..PingConfig::default()
    };

    inbox.insert_or_touch("crashed", "alice", None, 0).unwrap();
    assert_eq!(inbox.claim_for_download("crashed", 0).unwrap(), 1);

    let watchdog = Watchdog::new(inbox.clone(), config, clock.clone());
    clock.set(9_999);
    assert_eq!(watchdog.sweep().unwrap().reclaimed(), 0);

    clock.set(10_000);
    let report = watchdog.sweep().unwrap();
    assert_eq!(report.failed_temp, 1);
    assert_eq!(
        inbox.get("crashed").unwrap().unwrap().state,
        PingState::FailedTemp
    );

    // Reclaimed entries are claimable again; a second stall needs manual action
    assert_eq!(inbox.claim_for_download("crashed", 10_000).unwrap(), 1);
    clock.set(20_000);
    assert_eq!(watchdog.sweep().unwrap().manual_required, 1);
    assert_eq!(
        inbox.get("crashed").unwrap().unwrap().state,
        PingState::ManualRequired
    );
}
