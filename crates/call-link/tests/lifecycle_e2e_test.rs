//! Call lifecycle end-to-end tests
//!
//! Drive a real `SessionDriver` against scripted links on paused tokio time.
//!
//! # Running Tests
//!
//! ```bash
//! cargo test -p remotemedia-call-link --test lifecycle_e2e_test
//!
//! # Run with output
//! cargo test -p remotemedia-call-link --test lifecycle_e2e_test -- --nocapture
//! ```

mod harness;

use harness::{CallHarness, LinkOp};
use remotemedia_call_link::peer::LinkState;
use remotemedia_call_link::signaling::protocol::{InboundSignal, OutboundSignal};
use remotemedia_call_link::{CallNotice, EndReason, ErrorClass, EscalationLevel};
use std::time::Duration;
use tokio::time::{sleep, Instant};

/// Initialize test logging (call once per test)
fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("info,remotemedia_call_link=debug")
        .with_test_writer()
        .try_init();
}

fn is_failure_or_end(notice: &CallNotice) -> bool {
    matches!(notice, CallNotice::Ended(_) | CallNotice::Failure(_))
}

// ============================================================================
// Established Call
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_established_call_never_times_out() {
    init_logging();

    let mut harness = CallHarness::start("alice");
    harness.connect("bob", "room-1").await.unwrap();

    sleep(Duration::from_millis(600_001)).await;
    harness.settle().await;

    let notices = harness.seen();
    assert!(!notices.iter().any(is_failure_or_end), "{:?}", notices);
    assert_eq!(harness.links.created().len(), 1);
    assert!(
        harness
            .signaling
            .count(|s| matches!(s, OutboundSignal::Heartbeat { .. }))
            >= 20
    );

    harness.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_repeated_connected_changes_nothing() {
    init_logging();

    let mut harness = CallHarness::start("alice");
    let generation = harness.connect("bob", "room-1").await.unwrap();

    for _ in 0..3 {
        harness.links.set_state(generation, LinkState::Connected);
        harness.settle().await;
    }
    sleep(Duration::from_secs(120)).await;

    let notices = harness.seen();
    assert!(!notices
        .iter()
        .any(|n| matches!(n, CallNotice::Recovering { .. }) || is_failure_or_end(n)));
    assert_eq!(harness.links.created().len(), 1);

    harness.shutdown().await;
}

// ============================================================================
// Grace Windows
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_transient_disconnects_are_absorbed() {
    init_logging();

    let mut harness = CallHarness::start("alice");
    let generation = harness.connect("bob", "room-1").await.unwrap();

    for _ in 0..3 {
        harness.links.set_state(generation, LinkState::Disconnected);
        sleep(Duration::from_secs(1)).await;
    }
    harness.links.set_state(generation, LinkState::Connected);
    sleep(Duration::from_secs(60)).await;

    let notices = harness.seen();
    assert!(!notices.iter().any(|n| matches!(
        n,
        CallNotice::Recovering { .. } | CallNotice::Degraded(_)
    )));
    assert!(!harness
        .links
        .ops(generation)
        .contains(&LinkOp::CreateOffer { ice_restart: true }));
    assert_eq!(harness.links.created().len(), 1);

    harness.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_grace_expiry_restarts_ice_once() {
    init_logging();

    let mut harness = CallHarness::start("alice");
    let generation = harness.connect("bob", "room-1").await.unwrap();

    let started = Instant::now();
    harness.links.set_state(generation, LinkState::Disconnected);
    harness.settle().await;
    // Repeated signals inside the window do not open another one
    harness.links.set_state(generation, LinkState::Disconnected);
    harness.links.set_state(generation, LinkState::Disconnected);

    let degraded = harness
        .wait_for(|n| matches!(n, CallNotice::Degraded(_)))
        .await
        .unwrap();
    assert_eq!(degraded, CallNotice::Degraded(LinkState::Disconnected));
    assert!(started.elapsed() >= Duration::from_secs(10));

    let recovering = harness
        .wait_for(|n| matches!(n, CallNotice::Recovering { .. }))
        .await
        .unwrap();
    assert!(matches!(
        recovering,
        CallNotice::Recovering {
            level: EscalationLevel::IceRestart,
            attempt: 0,
            ..
        }
    ));

    harness
        .until("ice restart offer", |h| {
            h.links
                .ops(generation)
                .contains(&LinkOp::CreateOffer { ice_restart: true })
        })
        .await
        .unwrap();

    let restarts = harness
        .seen()
        .iter()
        .filter(|n| matches!(n, CallNotice::Recovering { .. }))
        .count();
    assert_eq!(restarts, 1);
    assert!(harness.signaling.count(|s| matches!(
        s,
        OutboundSignal::Offer {
            ice_restart: true,
            ..
        }
    )) >= 1);

    harness.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_partner_offer_waits_for_in_flight_restart_offer() {
    init_logging();

    // "alice" sorts first, so the local side is the polite one
    let mut harness = CallHarness::start("zed");
    let generation = harness.respond("alice", "room-1").await.unwrap();

    harness.links.set_offer_delay(Duration::from_millis(300));
    harness.links.set_state(generation, LinkState::Disconnected);
    harness
        .wait_for(|n| matches!(n, CallNotice::Recovering { .. }))
        .await
        .unwrap();
    harness
        .until("restart offer started", |h| {
            h.links
                .ops(generation)
                .contains(&LinkOp::CreateOffer { ice_restart: true })
        })
        .await
        .unwrap();

    harness
        .handle
        .signal(InboundSignal::Offer {
            from: Some("alice".to_string()),
            sdp: "restart-from-alice".to_string(),
            ice_restart: true,
            rebuilt: false,
        })
        .unwrap();
    let rollback = LinkOp::AcceptOffer {
        sdp: "restart-from-alice".to_string(),
        rollback: true,
    };
    harness
        .until("rollback accepted", |h| h.links.ops(generation).contains(&rollback))
        .await
        .unwrap();
    harness.settle().await;

    // The rollback only starts once the offer it discards is complete
    let ops = harness.links.ops(generation);
    let position = |op: &LinkOp| ops.iter().position(|o| o == op).unwrap();
    assert!(position(&LinkOp::OfferReady { ice_restart: true }) < position(&rollback));

    // Our superseded offer is neither sent nor retried
    assert_eq!(
        ops.iter()
            .filter(|op| matches!(op, LinkOp::CreateOffer { .. }))
            .count(),
        1
    );
    assert_eq!(
        harness
            .signaling
            .count(|s| matches!(s, OutboundSignal::Offer { .. })),
        0
    );
    assert_eq!(
        harness
            .signaling
            .count(|s| matches!(s, OutboundSignal::Answer { .. })),
        2
    );
    assert!(!harness
        .seen()
        .iter()
        .any(|n| matches!(n, CallNotice::Failure(_))));

    harness.shutdown().await;
}

// ============================================================================
// Connection Setup
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_slow_setup_is_extended() {
    init_logging();

    let mut harness = CallHarness::start("alice");
    let started = Instant::now();
    harness.handle.matched("bob", "room-1").unwrap();

    let first = harness
        .wait_for(|n| matches!(n, CallNotice::SetupExtended { .. }))
        .await
        .unwrap();
    assert_eq!(
        first,
        CallNotice::SetupExtended {
            extension: 1,
            delay: Duration::from_secs(15),
        }
    );
    assert!(started.elapsed() >= Duration::from_secs(60));

    let second = harness
        .wait_for(|n| matches!(n, CallNotice::SetupExtended { .. }))
        .await
        .unwrap();
    assert_eq!(
        second,
        CallNotice::SetupExtended {
            extension: 2,
            delay: Duration::from_secs(30),
        }
    );
    assert!(!harness.seen().iter().any(is_failure_or_end));

    harness.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_responder_answers_early_offer() {
    init_logging();

    // "bob" sorts after "alice", so alice offers
    let mut harness = CallHarness::start("bob");
    harness.handle.matched("alice", "room-1").unwrap();
    harness
        .handle
        .signal(InboundSignal::Offer {
            from: Some("alice".to_string()),
            sdp: "offer-from-alice".to_string(),
            ice_restart: false,
            rebuilt: false,
        })
        .unwrap();

    harness
        .until("answer sent", |h| {
            h.signaling
                .count(|s| matches!(s, OutboundSignal::Answer { .. }))
                == 1
        })
        .await
        .unwrap();

    let generation = harness.links.latest().unwrap();
    let ops = harness.links.ops(generation);
    assert!(ops.contains(&LinkOp::AcceptOffer {
        sdp: "offer-from-alice".to_string(),
        rollback: false,
    }));
    assert!(!ops.iter().any(|op| matches!(op, LinkOp::CreateOffer { .. })));
    assert_eq!(
        harness
            .signaling
            .count(|s| matches!(s, OutboundSignal::Offer { .. })),
        0
    );

    harness.links.set_state(generation, LinkState::Connected);
    let connected = harness
        .wait_for(|n| matches!(n, CallNotice::Connected { .. }))
        .await
        .unwrap();
    assert_eq!(connected, CallNotice::Connected { recovered: false });

    harness.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_media_denial_waits_for_explicit_retry() {
    init_logging();

    let mut harness = CallHarness::with_media_denials("alice", 1);
    harness.handle.matched("bob", "room-1").unwrap();

    let failure = harness
        .wait_for(|n| matches!(n, CallNotice::Failure(_)))
        .await
        .unwrap();
    match failure {
        CallNotice::Failure(report) => assert_eq!(report.class, ErrorClass::MediaAccessFailure),
        other => panic!("unexpected notice: {:?}", other),
    }

    // No link and no second capture attempt until asked
    sleep(Duration::from_secs(30)).await;
    assert!(harness.links.created().is_empty());
    assert_eq!(harness.media.requests(), 1);

    harness.handle.retry_media().unwrap();
    harness
        .until("link after retry", |h| !h.links.created().is_empty())
        .await
        .unwrap();
    assert_eq!(harness.media.requests(), 2);

    let generation = harness.links.latest().unwrap();
    harness
        .until("tracks attached", |h| {
            h.links
                .ops(generation)
                .contains(&LinkOp::AttachStream { tracks: 2 })
        })
        .await
        .unwrap();

    harness.shutdown().await;
}

// ============================================================================
// Recovery Budget
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_exhausted_retries_end_the_session() {
    init_logging();

    let mut harness = CallHarness::start("alice");
    let generation = harness.connect("bob", "room-1").await.unwrap();

    harness.links.set_failing(true);
    harness.links.set_state(generation, LinkState::Failed);

    harness
        .wait_for(|n| *n == CallNotice::Ended(EndReason::ExhaustedRetries))
        .await
        .unwrap();

    let report = harness
        .seen()
        .into_iter()
        .find_map(|n| match n {
            CallNotice::Failure(report) if report.class == ErrorClass::ExhaustedRetries => {
                Some(report)
            }
            _ => None,
        })
        .expect("exhaustion report");
    assert_eq!(report.attempts, 5);
    assert!(report.relay_only);

    // Repeated failure pushed the session into relay-only mode
    let created = harness.links.created();
    assert!(created.len() > 1);
    assert!(created.last().is_some_and(|options| options.relay_only));

    harness.settle().await;
    assert_eq!(
        harness
            .signaling
            .count(|s| matches!(s, OutboundSignal::EndCall { .. })),
        1
    );

    harness.shutdown().await;
}

// ============================================================================
// Ending
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_partner_hangup_releases_link() {
    init_logging();

    let mut harness = CallHarness::start("alice");
    let generation = harness.connect("bob", "room-1").await.unwrap();

    harness.handle.signal(InboundSignal::CallEnded).unwrap();
    harness
        .wait_for(|n| *n == CallNotice::Ended(EndReason::PartnerEnded))
        .await
        .unwrap();

    harness
        .until("link closed", |h| h.links.ops(generation).contains(&LinkOp::Close))
        .await
        .unwrap();

    // Nothing fires after the end
    sleep(Duration::from_secs(3600)).await;
    let heartbeats = harness
        .signaling
        .count(|s| matches!(s, OutboundSignal::Heartbeat { .. }));
    sleep(Duration::from_secs(3600)).await;
    assert_eq!(
        harness
            .signaling
            .count(|s| matches!(s, OutboundSignal::Heartbeat { .. })),
        heartbeats
    );

    harness.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_try_again_starts_fresh_session() {
    init_logging();

    let mut harness = CallHarness::start("alice");
    let first = harness.connect("bob", "room-1").await.unwrap();

    harness.handle.hangup().unwrap();
    harness
        .wait_for(|n| *n == CallNotice::Ended(EndReason::LocalHangup))
        .await
        .unwrap();
    assert_eq!(
        harness
            .signaling
            .count(|s| matches!(s, OutboundSignal::EndCall { .. })),
        1
    );

    harness.handle.try_again().unwrap();
    harness
        .until("new link", |h| {
            h.links.latest().map_or(false, |generation| generation > first)
        })
        .await
        .unwrap();

    let second = harness.links.latest().unwrap();
    harness
        .until("new offer", |h| {
            h.links
                .ops(second)
                .contains(&LinkOp::CreateOffer { ice_restart: false })
        })
        .await
        .unwrap();
    assert!(!harness.links.created()[1].relay_only);

    harness.shutdown().await;
}
