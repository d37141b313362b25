//! Обмен описаниями и кандидатами, восстановление связи

mod common;

use common::{eventually, fast_config, init_logging, FakeMedia, FakePeerFactory, Faults, Participant};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use yapspace::peer::connection::{ConnectionHandle, PeerEvent};
use yapspace::peer::ice::{CredentialProvider, StaticCredentials};
use yapspace::peer::media::MediaSource;
use yapspace::peer::types::{IceCandidate, LinkState, SessionDescription};
use yapspace::signaling::{NegotiationState, Negotiator, Progress};
use yapspace::store::{CallPatch, CallStatus, CandidateSide, WriteMode};
use yapspace::{
    CallConfig, CallError, Identity, Matchmaker, MemoryStore, RendezvousStore, SessionStatus,
};

/// Пара в звонке: alice - offerer, bob - answerer
async fn connected_pair(config: CallConfig) -> (MemoryStore, Participant, Participant) {
    init_logging();
    let store = MemoryStore::new();
    let alice = Participant::new("alice", &store, config.clone());
    let bob = Participant::new("bob", &store, config);

    alice.session.search().await.unwrap();
    bob.session.search().await.unwrap();
    alice.wait_for(SessionStatus::Connected).await;
    bob.wait_for(SessionStatus::Connected).await;
    (store, alice, bob)
}

fn remote_candidate(n: usize) -> IceCandidate {
    IceCandidate {
        candidate: format!("candidate:remote {n} udp 2130706431 10.0.0.9 {} typ host", 6000 + n),
        sdp_mid: Some("0".into()),
        sdp_mline_index: Some(0),
        ..Default::default()
    }
}

#[tokio::test]
async fn candidates_go_only_to_the_partner() {
    let (store, alice, bob) = connected_pair(fast_config()).await;
    let id = alice.call_id().unwrap();
    let (a_peer, b_peer) = (alice.peers.last(), bob.peers.last());

    eventually("both sides applied partner candidates", || {
        a_peer.applied().len() == 2 && b_peer.applied().len() == 2
    })
    .await;

    for (n, line) in a_peer.applied().iter().enumerate() {
        assert!(line.starts_with(&format!("candidate:bob#0 {n} ")), "{line}");
    }
    for (n, line) in b_peer.applied().iter().enumerate() {
        assert!(line.starts_with(&format!("candidate:alice#0 {n} ")), "{line}");
    }
    assert_eq!(a_peer.rejected_candidates(), 0);
    assert_eq!(b_peer.rejected_candidates(), 0);

    let offered = store.candidates(&id, CandidateSide::Offerer);
    let answered = store.candidates(&id, CandidateSide::Answerer);
    assert_eq!(offered.len(), 2);
    assert_eq!(answered.len(), 2);
    assert!(offered.iter().all(|e| e.candidate.candidate.contains("alice#0")));
    assert!(answered.iter().all(|e| e.candidate.candidate.contains("bob#0")));

    alice.session.end_call().await.unwrap();
    bob.wait_for(SessionStatus::Disconnected).await;
}

#[tokio::test]
async fn early_candidates_wait_for_the_answer() {
    init_logging();
    let store = MemoryStore::new();
    let shared: Arc<dyn RendezvousStore> = Arc::new(store.clone());
    let config = CallConfig::default();
    let matchmaker = Matchmaker::new(shared.clone(), &config);
    let alice = Identity::new("alice").unwrap();

    let assignment = matchmaker.find_or_create(&alice).await.unwrap();
    let id = assignment.call_id().to_string();

    let factory = FakePeerFactory::new("alice");
    let local = FakeMedia::new().acquire().await.unwrap();
    let ice = StaticCredentials::from_config(&config).ice_config().await;
    let (remote_tx, _) = watch::channel(None);
    let (connection, events) =
        ConnectionHandle::open(factory.as_ref(), &ice, &local, Arc::new(remote_tx))
            .await
            .unwrap();

    let mut negotiator = Negotiator::new(
        assignment,
        alice,
        shared.clone(),
        connection.clone(),
        events,
        matchmaker,
        &config,
    );
    negotiator.start().await.unwrap();
    assert!(store.record(&id).unwrap().offer.is_some());

    // кандидаты собеседника обгоняют answer
    for n in 0..2 {
        shared
            .append(&id, CandidateSide::Answerer, remote_candidate(n))
            .await
            .unwrap();
    }
    let writer = store.clone();
    let call = id.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        let patch = CallPatch {
            answer: Some(SessionDescription::answer("answer:bob")),
            ..Default::default()
        };
        writer.update(&call, patch, WriteMode::Merge).await.unwrap();
    });

    let token = CancellationToken::new();
    let progress = tokio::time::timeout(Duration::from_secs(5), negotiator.next(&token))
        .await
        .expect("answer never applied");
    assert!(matches!(progress, Progress::PartnerAnswered));

    let peer = factory.last();
    assert_eq!(peer.rejected_candidates(), 0);
    assert_eq!(
        peer.applied(),
        vec![remote_candidate(0).candidate, remote_candidate(1).candidate]
    );
    assert_eq!(peer.remote().unwrap().sdp, "answer:bob");

    // свои кандидаты - только в свою подколлекцию
    let own = store.candidates(&id, CandidateSide::Offerer);
    assert_eq!(own.len(), 2);
    assert_eq!(store.candidates(&id, CandidateSide::Answerer).len(), 2);

    token.cancel();
    negotiator.unsubscribe();
    connection.close().await;
    assert_eq!(store.live_subscriptions(&id), 0);
}

#[tokio::test]
async fn expired_call_is_not_reopened_by_offer() {
    init_logging();
    let store = MemoryStore::new();
    let shared: Arc<dyn RendezvousStore> = Arc::new(store.clone());
    let config = CallConfig::default();
    let matchmaker = Matchmaker::new(shared.clone(), &config);
    let alice = Identity::new("alice").unwrap();

    let assignment = matchmaker.find_or_create(&alice).await.unwrap();
    let id = assignment.call_id().to_string();

    // janitor снимает запись, пока offerer готовит offer
    tokio::time::sleep(Duration::from_millis(5)).await;
    let expired = yapspace::matchmaker::expire_stale_calls(shared.as_ref(), Duration::from_millis(1))
        .await
        .unwrap();
    assert_eq!(expired, 1);

    let factory = FakePeerFactory::new("alice");
    let local = FakeMedia::new().acquire().await.unwrap();
    let ice = StaticCredentials::from_config(&config).ice_config().await;
    let (remote_tx, _) = watch::channel(None);
    let (connection, events) =
        ConnectionHandle::open(factory.as_ref(), &ice, &local, Arc::new(remote_tx))
            .await
            .unwrap();

    let mut negotiator = Negotiator::new(
        assignment,
        alice,
        shared,
        connection.clone(),
        events,
        matchmaker,
        &config,
    );
    let err = negotiator.start().await.unwrap_err();
    assert!(matches!(err, CallError::Negotiation(_)), "{err}");
    assert_eq!(negotiator.state(), NegotiationState::Failed);

    let record = store.record(&id).unwrap();
    assert_eq!(record.status, CallStatus::Expired);
    assert!(record.offer.is_none());

    negotiator.unsubscribe();
    connection.close().await;
}

#[tokio::test]
async fn rejected_answer_ends_the_call_for_both() {
    init_logging();
    let store = MemoryStore::new();
    let alice = Participant::new("alice", &store, fast_config());
    let bob = Participant::new("bob", &store, fast_config());
    alice.peers.set_faults(Faults {
        reject_remote_description: true,
        ..Default::default()
    });

    alice.session.search().await.unwrap();
    bob.session.search().await.unwrap();

    alice.wait_for(SessionStatus::Disconnected).await;
    bob.wait_for(SessionStatus::Disconnected).await;
    alice.assert_released();
    bob.assert_released();
    assert!(store.records().is_empty());

    // каждый может начать заново
    bob.session.search().await.unwrap();
    assert_eq!(bob.status(), SessionStatus::Waiting);
    bob.session.cancel_search().await.unwrap();
    assert!(store.records().is_empty());
}

#[tokio::test]
async fn failed_path_recovers_through_ice_restart() {
    let config = CallConfig {
        recovery_window_ms: 5_000,
        ..fast_config()
    };
    let (store, alice, bob) = connected_pair(config).await;
    let id = alice.call_id().unwrap();
    let (a_peer, b_peer) = (alice.peers.last(), bob.peers.last());
    let first_answer = a_peer.remote().unwrap().sdp;

    a_peer.emit(PeerEvent::Connection(LinkState::Failed));

    eventually("answerer applied the restart offer", || {
        b_peer
            .remote()
            .is_some_and(|d| d.sdp.contains("restart=true"))
    })
    .await;
    eventually("offerer applied the fresh answer", || {
        a_peer.remote().is_some_and(|d| d.sdp != first_answer)
    })
    .await;
    let record = store.record(&id).unwrap();
    assert!(record.offer.unwrap().sdp.contains("restart=true"));
    assert_eq!(record.answer, a_peer.remote());

    a_peer.emit(PeerEvent::Connection(LinkState::Connected));
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(alice.status(), SessionStatus::Connected);
    assert_eq!(bob.status(), SessionStatus::Connected);
    // тот же peer connection, без пересоздания
    assert_eq!(alice.peers.peers().len(), 1);

    alice.session.end_call().await.unwrap();
    bob.wait_for(SessionStatus::Disconnected).await;
}

#[tokio::test]
async fn second_failure_after_restart_ends_the_call() {
    let config = CallConfig {
        recovery_window_ms: 5_000,
        ..fast_config()
    };
    let (store, alice, bob) = connected_pair(config).await;
    let (a_peer, b_peer) = (alice.peers.last(), bob.peers.last());

    a_peer.emit(PeerEvent::Path(LinkState::Failed));
    eventually("restart offer answered", || {
        b_peer
            .remote()
            .is_some_and(|d| d.sdp.contains("restart=true"))
    })
    .await;
    a_peer.emit(PeerEvent::Path(LinkState::Connected));
    a_peer.emit(PeerEvent::Path(LinkState::Failed));

    alice.wait_for(SessionStatus::Disconnected).await;
    bob.wait_for(SessionStatus::Disconnected).await;
    alice.assert_released();
    bob.assert_released();
    assert!(store.records().is_empty());
}

#[tokio::test]
async fn lost_connection_times_out_after_recovery_window() {
    let config = CallConfig {
        recovery_window_ms: 150,
        ..fast_config()
    };
    let (store, alice, bob) = connected_pair(config).await;

    let started = Instant::now();
    alice
        .peers
        .last()
        .emit(PeerEvent::Connection(LinkState::Disconnected));

    alice.wait_for(SessionStatus::Disconnected).await;
    assert!(started.elapsed() >= Duration::from_millis(150));
    bob.wait_for(SessionStatus::Disconnected).await;
    alice.assert_released();
    bob.assert_released();
    assert!(store.records().is_empty());
}

#[tokio::test]
async fn answerer_watchdog_also_ends_the_call() {
    let config = CallConfig {
        recovery_window_ms: 150,
        ..fast_config()
    };
    let (store, alice, bob) = connected_pair(config).await;

    bob.peers
        .last()
        .emit(PeerEvent::Path(LinkState::Disconnected));

    bob.wait_for(SessionStatus::Disconnected).await;
    alice.wait_for(SessionStatus::Disconnected).await;
    assert!(store.records().is_empty());
}

#[tokio::test]
async fn brief_disconnect_is_tolerated() {
    let config = CallConfig {
        recovery_window_ms: 300,
        ..fast_config()
    };
    let (_store, alice, bob) = connected_pair(config).await;
    let a_peer = alice.peers.last();

    a_peer.emit(PeerEvent::Connection(LinkState::Disconnected));
    tokio::time::sleep(Duration::from_millis(50)).await;
    a_peer.emit(PeerEvent::Connection(LinkState::Connected));

    tokio::time::sleep(Duration::from_millis(600)).await;
    assert_eq!(alice.status(), SessionStatus::Connected);
    assert_eq!(bob.status(), SessionStatus::Connected);

    alice.session.end_call().await.unwrap();
    bob.wait_for(SessionStatus::Disconnected).await;
}

#[tokio::test]
async fn watchdog_rechecks_link_before_hanging_up() {
    let config = CallConfig {
        recovery_window_ms: 150,
        ..fast_config()
    };
    let (_store, alice, bob) = connected_pair(config).await;
    let a_peer = alice.peers.last();

    // связь вернулась, но событие об этом не дошло
    a_peer.emit(PeerEvent::Connection(LinkState::Disconnected));
    tokio::time::sleep(Duration::from_millis(20)).await;
    a_peer.set_link_silently(LinkState::Connected);

    tokio::time::sleep(Duration::from_millis(450)).await;
    assert_eq!(alice.status(), SessionStatus::Connected);
    assert_eq!(bob.status(), SessionStatus::Connected);
    assert_eq!(
        alice.session.view().negotiation,
        Some(NegotiationState::Connected)
    );

    alice.session.end_call().await.unwrap();
    bob.wait_for(SessionStatus::Disconnected).await;
}

#[tokio::test]
async fn view_reports_negotiation_progress() {
    let (_store, alice, bob) = connected_pair(fast_config()).await;

    eventually("both sides see an established link", || {
        alice.session.view().negotiation == Some(NegotiationState::Connected)
            && bob.session.view().negotiation == Some(NegotiationState::Connected)
    })
    .await;

    alice.session.end_call().await.unwrap();
    bob.wait_for(SessionStatus::Disconnected).await;
    assert_eq!(alice.session.view().negotiation, None);
    eventually("partner view is cleared", || {
        bob.session.view().negotiation.is_none()
    })
    .await;
}

#[tokio::test]
async fn closed_peer_ends_the_call_at_once() {
    let (store, alice, bob) = connected_pair(fast_config()).await;

    bob.peers
        .last()
        .emit(PeerEvent::Connection(LinkState::Closed));

    bob.wait_for(SessionStatus::Disconnected).await;
    alice.wait_for(SessionStatus::Disconnected).await;
    assert!(store.records().is_empty());
}

#[tokio::test]
async fn janitor_expiry_hangs_up_both_sides() {
    let config = CallConfig {
        stale_call_age_secs: 0,
        ..fast_config()
    };
    let (store, alice, bob) = connected_pair(config).await;

    tokio::time::sleep(Duration::from_millis(5)).await;
    assert_eq!(alice.session.expire_stale_calls().await.unwrap(), 1);

    alice.wait_for(SessionStatus::Disconnected).await;
    bob.wait_for(SessionStatus::Disconnected).await;
    alice.assert_released();
    bob.assert_released();
    assert!(store.records().is_empty());
}
