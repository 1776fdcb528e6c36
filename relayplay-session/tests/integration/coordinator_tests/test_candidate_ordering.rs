use relayplay_core::{NegotiationId, Role, SdpKind, SignalKind};
use relayplay_session::{ConnectionState, SignalDrop};

use crate::integration::{eventually, init_tracing, spawn_coordinator};
use crate::utils::{PrimitiveCall, Script, answer_from, candidate_from};

fn added_after(calls: &[PrimitiveCall], marker: &PrimitiveCall) -> Vec<String> {
    let start = calls
        .iter()
        .position(|c| c == marker)
        .expect("marker call missing");
    calls[start + 1..]
        .iter()
        .filter_map(|c| match c {
            PrimitiveCall::AddCandidate(candidate) => Some(candidate.clone()),
            _ => None,
        })
        .collect()
}

#[tokio::test]
async fn test_early_candidates_are_flushed_in_arrival_order() {
    init_tracing();

    let h = spawn_coordinator(Role::Host, Script::silent()).await;
    h.handle.create_offer().await.expect("Failed to create offer");
    let negotiation = h.transport.negotiation_for(h.remote);

    for candidate in ["candidate:1", "candidate:2", "candidate:3"] {
        h.handle
            .deliver(candidate_from(&h.room, h.remote, h.local, candidate, negotiation))
            .expect("Failed to deliver candidate");
    }

    let snapshot = h.handle.wait_for(|s| s.pending_candidates == 3).await;
    assert_eq!(snapshot.state, ConnectionState::AwaitingAnswer);
    assert!(
        !h.primitives
            .calls_for(h.remote)
            .iter()
            .any(|c| matches!(c, PrimitiveCall::AddCandidate(_)))
    );

    h.handle
        .deliver(answer_from(&h.room, h.remote, h.local, negotiation))
        .expect("Failed to deliver answer");
    let snapshot = h.handle.wait_for(|s| s.pending_candidates == 0).await;
    assert_eq!(snapshot.state, ConnectionState::ConnectivityPending);

    let calls = h.primitives.calls_for(h.remote);
    assert_eq!(
        added_after(&calls, &PrimitiveCall::SetRemote(SdpKind::Answer)),
        ["candidate:1", "candidate:2", "candidate:3"]
    );
}

#[tokio::test]
async fn test_later_candidates_are_forwarded_directly() {
    init_tracing();

    let h = spawn_coordinator(Role::Host, Script::connecting()).await;
    h.handle.create_offer().await.expect("Failed to create offer");
    let negotiation = h.transport.negotiation_for(h.remote);

    h.handle
        .deliver(candidate_from(&h.room, h.remote, h.local, "candidate:early", negotiation))
        .expect("Failed to deliver candidate");
    h.handle
        .deliver(answer_from(&h.room, h.remote, h.local, negotiation))
        .expect("Failed to deliver answer");
    h.handle
        .deliver(candidate_from(&h.room, h.remote, h.local, "candidate:late", negotiation))
        .expect("Failed to deliver candidate");

    assert!(
        eventually(|| h
            .primitives
            .count_for(h.remote, &PrimitiveCall::AddCandidate("candidate:late".into()))
            == 1)
        .await
    );

    let calls = h.primitives.calls_for(h.remote);
    assert_eq!(
        added_after(&calls, &PrimitiveCall::SetRemote(SdpKind::Answer)),
        ["candidate:early", "candidate:late"]
    );
}

#[tokio::test]
async fn test_candidate_from_another_negotiation_is_dropped() {
    init_tracing();

    let h = spawn_coordinator(Role::Host, Script::silent()).await;
    h.handle.create_offer().await.expect("Failed to create offer");

    h.handle
        .deliver(candidate_from(
            &h.room,
            h.remote,
            h.local,
            "candidate:foreign",
            Some(NegotiationId::new()),
        ))
        .expect("Failed to deliver candidate");

    assert!(
        eventually(|| h.listener.drops().contains(&SignalDrop::ForeignNegotiation {
            kind: SignalKind::Candidate
        }))
        .await
    );
    assert_eq!(h.handle.snapshot().pending_candidates, 0);
}

#[tokio::test]
async fn test_local_candidates_are_published_with_negotiation() {
    init_tracing();

    let h = spawn_coordinator(Role::Host, Script::silent()).await;
    h.handle.create_offer().await.expect("Failed to create offer");
    let negotiation = h.transport.negotiation_for(h.remote);

    assert!(h.primitives.emit(
        h.remote,
        relayplay_session::PrimitiveEvent::LocalCandidate(relayplay_core::IceCandidate::new(
            "candidate:local"
        ))
    ));

    assert!(eventually(|| h.transport.count(SignalKind::Candidate) == 1).await);
    let envelope = h
        .transport
        .last_to(h.remote, SignalKind::Candidate)
        .expect("candidate envelope");
    let payload = envelope.candidate_payload().expect("candidate payload");
    assert_eq!(payload.candidate.candidate, "candidate:local");
    assert_eq!(payload.negotiation, negotiation);
    assert_eq!(envelope.from(), &h.local);
}
