//! Command implementations for the pqmsg CLI.

use crate::clock::{MonotonicClock, SharedClock};
use crate::config::CoreConfig;
use crate::crypto::kem::{hybrid_decapsulate, hybrid_encapsulate, HybridKeyPair};
use crate::ping::{PingInbox, Watchdog};
use crate::ratchet::RatchetState;
use crate::replay::ReplayCache;
use crate::session::{Received, Session};
use crate::storage::{open_database, RocksDbPingInbox};
use crate::{PqmsgError, Result};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{info, warn};

fn data_dir(config: &CoreConfig, data_dir: Option<&Path>) -> PathBuf {
    data_dir
        .map(Path::to_path_buf)
        .unwrap_or_else(|| config.storage.path.clone())
}

fn open_inbox(config: &CoreConfig, dir: &Path) -> Result<Arc<RocksDbPingInbox>> {
    let db = open_database(dir, &config.storage.rocksdb)?;
    Ok(Arc::new(RocksDbPingInbox::new(db)))
}

/// Inbox timestamps are persisted, so they must survive restarts.
fn wall_clock() -> SharedClock {
    Arc::new(MonotonicClock::from_wall_clock())
}

/// Delivers one packet, carries back the ACK it asks for and returns what
/// the receiver made of it.
fn deliver(from: &mut Session, to: &mut Session, packet: &[u8]) -> Result<Received> {
    let received = to.receive(packet)?;
    match &received {
        Received::Duplicate => {
            warn!(peer = %to.ratchet().peer_identity(), "Demo packet treated as replay");
        }
        Received::RekeyRequested { .. } => {
            info!(peer = %to.ratchet().peer_identity(), "Demo peer asked for a re-key");
        }
        _ => {}
    }
    if let Some(message_id) = received.ack_id() {
        let ack = to.acknowledge(message_id)?;
        from.receive(&ack)?;
    }
    Ok(received)
}

/// Execute demo command
pub fn demo(messages: usize) -> Result<()> {
    let mut config = CoreConfig::for_testing();
    config.ratchet.kem_interval = 10;
    let clock = MonotonicClock::shared();
    let replay = Arc::new(ReplayCache::from_config(&config.replay)?);

    let bob_kem = HybridKeyPair::generate();
    let (alice_secret, ciphertext) = hybrid_encapsulate(bob_kem.public_key())?;
    let bob_secret = hybrid_decapsulate(&bob_kem, &ciphertext)?;
    info!(
        ciphertext_size = ciphertext.to_bytes().len(),
        "Hybrid agreement complete"
    );

    let make = |secret: &[u8], local: &str, peer: &str| -> Result<Session> {
        let ratchet = RatchetState::establish_with_config(secret, local, peer, config.ratchet)?;
        Ok(Session::new(
            ratchet,
            config.ack,
            config.padding,
            replay.clone(),
            clock.clone(),
        ))
    };
    let mut alice = make(alice_secret.as_bytes(), "alice", "bob")?;
    let mut bob = make(bob_secret.as_bytes(), "bob", "alice")?;

    let announce = alice.announce_kem_key()?;
    deliver(&mut alice, &mut bob, &announce.packet)?;
    let announce = bob.announce_kem_key()?;
    deliver(&mut bob, &mut alice, &announce.packet)?;

    let mut delivered = 0usize;
    for i in 0..messages {
        let (sender, receiver) = if i % 3 == 2 {
            (&mut bob, &mut alice)
        } else {
            (&mut alice, &mut bob)
        };

        // The initiator steps, the other side only asks
        if sender.should_rekey() {
            let outbound = sender.rekey()?;
            deliver(sender, receiver, &outbound.packet)?;
        }

        let body = format!("message {}", i);
        let outbound = sender.send(body.as_bytes())?;
        match deliver(sender, receiver, &outbound.packet)? {
            Received::Message { body: received, .. } => {
                if received != body.as_bytes() {
                    return Err(PqmsgError::invalid_state("Demo message corrupted"));
                }
                delivered += 1;
            }
            other => {
                return Err(PqmsgError::invalid_state(format!(
                    "Unexpected demo delivery: {:?}",
                    other
                )))
            }
        }
        sender.drain_acked();
    }

    info!(
        delivered,
        alice_generation = alice.ratchet().generation(),
        bob_generation = bob.ratchet().generation(),
        packet_size = config.padding.packet_size,
        replay_entries = replay.len(),
        "✅ Demo conversation complete"
    );
    Ok(())
}

/// Execute inbox-stats command
pub fn inbox_stats(dir: Option<&Path>) -> Result<()> {
    let config = CoreConfig::from_env()?;
    let dir = data_dir(&config, dir);
    let inbox = open_inbox(&config, &dir)?;
    let report = inbox.pressure()?;

    info!(
        path = %dir.display(),
        ping_seen = report.global.ping_seen,
        pong_sent = report.global.pong_sent,
        download_queued = report.global.download_queued,
        failed_temp = report.global.failed_temp,
        manual_required = report.global.manual_required,
        msg_stored = report.global.msg_stored,
        "Ping inbox"
    );

    let mut contacts: Vec<_> = report.per_contact.iter().collect();
    contacts.sort_by(|a, b| a.0.cmp(b.0));
    for (contact_id, pressure) in contacts {
        info!(
            contact_id = %contact_id,
            pending = pressure.pending(),
            manual_required = pressure.manual_required,
            "Contact pressure"
        );
    }
    Ok(())
}

/// Execute watchdog command
pub fn watchdog(dir: Option<&Path>, once: bool) -> Result<()> {
    let config = CoreConfig::from_env()?;
    let dir = data_dir(&config, dir);
    let inbox = open_inbox(&config, &dir)?;
    let watchdog = Watchdog::new(inbox, config.ping, wall_clock());

    if once {
        let report = watchdog.sweep()?;
        info!(
            failed_temp = report.failed_temp,
            manual_required = report.manual_required,
            purged = report.cleanup.total(),
            "Sweep complete"
        );
        return Ok(());
    }

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;
    runtime.block_on(async move {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        tokio::spawn(async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!(error = %e, "Failed to listen for ctrl-c");
            }
            info!("Shutting down watchdog");
            let _ = shutdown_tx.send(true);
        });
        watchdog.run(shutdown_rx).await;
    });
    Ok(())
}

/// Execute config command
pub fn show_config() -> Result<()> {
    let config = CoreConfig::from_env()?;
    let rendered = serde_json::to_string_pretty(&config)
        .map_err(|e| PqmsgError::serialization(e.to_string()))?;
    println!("{}", rendered);
    Ok(())
}
