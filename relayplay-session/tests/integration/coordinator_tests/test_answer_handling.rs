use relayplay_core::{NegotiationId, Role, SdpKind, SignalKind, SignalingEnvelope};
use relayplay_session::{CloseReason, ConnectionState, CoordinatorError, SignalDrop, Termination};
use serde_json::json;

use crate::integration::{eventually, init_tracing, spawn_coordinator, Harness};
use crate::utils::{PrimitiveCall, Script, answer_from};

async fn connected_host() -> Harness {
    let h = spawn_coordinator(Role::Host, Script::connecting()).await;
    h.handle.create_offer().await.expect("Failed to create offer");
    let negotiation = h.transport.negotiation_for(h.remote);
    h.handle
        .deliver(answer_from(&h.room, h.remote, h.local, negotiation))
        .expect("Failed to deliver answer");
    h.handle
        .wait_for(|s| s.state == ConnectionState::Connected)
        .await;
    h
}

#[tokio::test]
async fn test_second_answer_leaves_connection_untouched() {
    init_tracing();

    let h = connected_host().await;
    let calls_before = h.primitives.calls_for(h.remote);
    let negotiation = h.transport.negotiation_for(h.remote);

    h.handle
        .deliver(answer_from(&h.room, h.remote, h.local, negotiation))
        .expect("Failed to deliver answer");

    assert!(eventually(|| h.listener.drops().contains(&SignalDrop::DuplicateAnswer)).await);
    assert_eq!(h.handle.state(), ConnectionState::Connected);
    assert_eq!(h.primitives.calls_for(h.remote), calls_before);
}

#[tokio::test]
async fn test_answer_after_close_is_stale() {
    init_tracing();

    let h = connected_host().await;
    let negotiation = h.transport.negotiation_for(h.remote);
    h.handle.close();

    let termination = h.task.await.expect("Coordinator task panicked");
    assert_eq!(termination, Termination::Closed(CloseReason::Explicit));

    let result = h
        .handle
        .deliver(answer_from(&h.room, h.remote, h.local, negotiation));
    assert_eq!(
        result,
        Err(SignalDrop::StaleSignal {
            kind: SignalKind::Answer
        })
    );
    assert_eq!(
        h.primitives
            .count_for(h.remote, &PrimitiveCall::SetRemote(SdpKind::Answer)),
        1
    );
    assert_eq!(h.transport.count(SignalKind::Bye), 1);
}

#[tokio::test]
async fn test_answer_from_previous_negotiation_is_rejected() {
    init_tracing();

    let h = spawn_coordinator(Role::Host, Script::connecting()).await;
    h.handle.create_offer().await.expect("Failed to create offer");

    let stale = Some(NegotiationId::new());
    h.handle
        .deliver(answer_from(&h.room, h.remote, h.local, stale))
        .expect("Failed to deliver answer");

    assert!(
        eventually(|| h.listener.drops().contains(&SignalDrop::ForeignNegotiation {
            kind: SignalKind::Answer
        }))
        .await
    );
    assert_eq!(h.handle.state(), ConnectionState::AwaitingAnswer);
    assert_eq!(
        h.primitives
            .count_for(h.remote, &PrimitiveCall::SetRemote(SdpKind::Answer)),
        0
    );

    // The answer to the current offer still goes through
    let current = h.transport.negotiation_for(h.remote);
    h.handle
        .deliver(answer_from(&h.room, h.remote, h.local, current))
        .expect("Failed to deliver answer");
    h.handle
        .wait_for(|s| s.state == ConnectionState::Connected)
        .await;
}

#[tokio::test]
async fn test_answer_without_negotiation_id_is_accepted() {
    init_tracing();

    let h = spawn_coordinator(Role::Host, Script::connecting()).await;
    h.handle.create_offer().await.expect("Failed to create offer");

    h.handle
        .apply_answer(relayplay_core::SessionDescription::answer("v=0"), None)
        .expect("Failed to queue answer");

    let snapshot = h
        .handle
        .wait_for(|s| s.state == ConnectionState::Connected)
        .await;
    assert!(snapshot.termination.is_none());
}

#[tokio::test]
async fn test_unsolicited_answer_is_dropped() {
    init_tracing();

    let h = spawn_coordinator(Role::Host, Script::connecting()).await;
    h.handle
        .deliver(answer_from(&h.room, h.remote, h.local, None))
        .expect("Failed to deliver answer");

    assert!(
        eventually(|| h.listener.drops().contains(&SignalDrop::Unsolicited {
            kind: SignalKind::Answer
        }))
        .await
    );
    assert_eq!(h.handle.state(), ConnectionState::Idle);
}

#[tokio::test]
async fn test_answer_carrying_an_offer_is_malformed() {
    init_tracing();

    let h = spawn_coordinator(Role::Host, Script::connecting()).await;
    h.handle.create_offer().await.expect("Failed to create offer");

    let envelope = SignalingEnvelope::new(
        SignalKind::Answer,
        h.room.clone(),
        h.remote,
        h.local,
        json!({ "type": "offer", "sdp": "v=0" }),
        1,
    );
    h.handle.deliver(envelope).expect("Failed to deliver answer");

    assert!(
        eventually(|| h
            .listener
            .drops()
            .iter()
            .any(|d| matches!(d, SignalDrop::Malformed { kind: SignalKind::Answer, .. })))
        .await
    );
    assert_eq!(h.handle.state(), ConnectionState::AwaitingAnswer);
}

#[tokio::test]
async fn test_envelope_for_someone_else_is_dropped() {
    init_tracing();

    let h = spawn_coordinator(Role::Host, Script::connecting()).await;
    h.handle.create_offer().await.expect("Failed to create offer");

    let other = relayplay_core::PeerId::new();
    let negotiation = h.transport.negotiation_for(h.remote);
    h.handle
        .deliver(answer_from(&h.room, h.remote, other, negotiation))
        .expect("Failed to deliver answer");

    assert!(
        eventually(|| h
            .listener
            .drops()
            .contains(&SignalDrop::Misaddressed { to: other }))
        .await
    );
    assert_eq!(h.handle.state(), ConnectionState::AwaitingAnswer);
}

#[tokio::test]
async fn test_offer_is_created_only_once() {
    init_tracing();

    let h = spawn_coordinator(Role::Host, Script::connecting()).await;
    h.handle.create_offer().await.expect("Failed to create offer");

    let second = h.handle.create_offer().await;
    assert!(matches!(
        second,
        Err(CoordinatorError::InvalidState {
            state: ConnectionState::AwaitingAnswer,
            ..
        })
    ));
    assert_eq!(h.primitives.count_for(h.remote, &PrimitiveCall::CreateOffer), 1);
    assert_eq!(h.transport.count(SignalKind::Offer), 1);
}

#[tokio::test]
async fn test_guest_cannot_create_offer() {
    init_tracing();

    let h = spawn_coordinator(Role::Guest, Script::connecting()).await;
    let result = h.handle.create_offer().await;
    assert!(matches!(result, Err(CoordinatorError::InvalidState { .. })));
    assert!(h.primitives.calls_for(h.remote).is_empty());
}

#[tokio::test]
async fn test_failed_offer_fails_the_connection() {
    init_tracing();

    let h = spawn_coordinator(
        Role::Host,
        Script {
            fail_create_offer: true,
            ..Script::connecting()
        },
    )
    .await;

    let result = h.handle.create_offer().await;
    assert!(matches!(result, Err(CoordinatorError::Primitive(_))));

    let termination = h.task.await.expect("Coordinator task panicked");
    assert!(termination.is_fault());
    assert_eq!(termination.state(), ConnectionState::Failed);
    assert_eq!(h.transport.count(SignalKind::Offer), 0);
}

#[tokio::test]
async fn test_rejected_answer_fails_the_connection() {
    init_tracing();

    let h = spawn_coordinator(
        Role::Host,
        Script {
            fail_set_remote: true,
            ..Script::connecting()
        },
    )
    .await;
    h.handle.create_offer().await.expect("Failed to create offer");
    let negotiation = h.transport.negotiation_for(h.remote);

    h.handle
        .deliver(answer_from(&h.room, h.remote, h.local, negotiation))
        .expect("Failed to deliver answer");

    let termination = h.task.await.expect("Coordinator task panicked");
    assert!(matches!(termination, Termination::Failed(_)));
    assert!(h.handle.snapshot().is_settled());
}
