use relayplay_core::{PeerId, SignalKind};
use relayplay_session::room::DEPARTED_MEMORY;
use relayplay_session::{
    CloseReason, ConnectionState, RoomStatus, SessionEvent, SignalDrop, Termination,
};

use crate::integration::{TIMEOUT, create_host_room, init_tracing, wait_for_event};
use crate::utils::{Script, answer_from, bye_from};

#[tokio::test(start_paused = true)]
async fn test_disposed_slot_is_removed_after_settling() {
    init_tracing();

    let mut host = create_host_room(1, Script::connecting());
    let guest = PeerId::new();
    let handle = host
        .registry
        .invite_guest(&host.room, guest)
        .await
        .expect("Failed to invite guest");
    let negotiation = host.transport.negotiation_for(guest);
    host.registry
        .route_envelope(answer_from(&host.room, guest, host.host, negotiation))
        .await
        .expect("Failed to route answer");
    handle
        .wait_for(|s| s.state == ConnectionState::Connected)
        .await;

    host.registry
        .dispose_guest(&host.room, guest)
        .expect("Failed to dispose guest");

    let removed = wait_for_event(&mut host.events, |e| matches!(e, SessionEvent::SlotRemoved { .. })).await;
    let Some(SessionEvent::SlotRemoved { remote, termination, .. }) = removed else {
        panic!("slot was not removed");
    };
    assert_eq!(remote, guest);
    assert_eq!(termination, Termination::Closed(CloseReason::Disposed));
    assert!(handle.snapshot().is_settled());
    assert!(host.registry.handle(&host.room, guest).is_none());
    assert_eq!(host.registry.status(&host.room).unwrap(), RoomStatus::Waiting);

    // A late duplicate answer finds no coordinator
    let late = host
        .registry
        .route_envelope(answer_from(&host.room, guest, host.host, negotiation))
        .await;
    assert_eq!(
        late,
        Err(SignalDrop::StaleSignal {
            kind: SignalKind::Answer
        })
    );
}

#[tokio::test(start_paused = true)]
async fn test_one_guest_timing_out_leaves_sibling_connected() {
    init_tracing();

    let mut host = create_host_room(2, Script::connecting());
    let (a, b) = (PeerId::new(), PeerId::new());
    let handle_a = host
        .registry
        .invite_guest(&host.room, a)
        .await
        .expect("Failed to invite a");
    host.registry
        .invite_guest(&host.room, b)
        .await
        .expect("Failed to invite b");

    let negotiation = host.transport.negotiation_for(a);
    host.registry
        .route_envelope(answer_from(&host.room, a, host.host, negotiation))
        .await
        .expect("Failed to route answer");
    handle_a
        .wait_for(|s| s.state == ConnectionState::Connected)
        .await;

    // b never answers
    let removed = wait_for_event(&mut host.events, |e| {
        matches!(e, SessionEvent::SlotRemoved { remote, .. } if *remote == b)
    })
    .await;
    assert!(matches!(
        removed,
        Some(SessionEvent::SlotRemoved {
            termination: Termination::Closed(CloseReason::Timeout),
            ..
        })
    ));

    assert_eq!(handle_a.state(), ConnectionState::Connected);
    assert_eq!(host.registry.status(&host.room).unwrap(), RoomStatus::Error);
    assert_eq!(
        host.registry.fault(&host.room, b),
        Some(Termination::Closed(CloseReason::Timeout))
    );

    // Still connected long after b's deadline
    tokio::time::sleep(TIMEOUT * 2).await;
    assert_eq!(handle_a.state(), ConnectionState::Connected);

    // Acknowledging the fault clears the error
    host.registry
        .dispose_guest(&host.room, b)
        .expect("Failed to clear fault");
    assert_eq!(host.registry.status(&host.room).unwrap(), RoomStatus::Waiting);

    // Inviting b again opens a fresh negotiation
    host.registry
        .invite_guest(&host.room, b)
        .await
        .expect("Failed to invite b again");
    assert_eq!(host.registry.status(&host.room).unwrap(), RoomStatus::Connecting);
    assert_ne!(host.transport.negotiation_for(b), None);
    assert_eq!(host.transport.count(SignalKind::Offer), 3);
}

#[tokio::test(start_paused = true)]
async fn test_reinvite_replaces_fault_and_rejects_old_answer() {
    init_tracing();

    let mut host = create_host_room(1, Script::connecting());
    let guest = PeerId::new();
    host.registry
        .invite_guest(&host.room, guest)
        .await
        .expect("Failed to invite guest");
    let first = host.transport.negotiation_for(guest);

    wait_for_event(&mut host.events, |e| matches!(e, SessionEvent::SlotRemoved { .. })).await;
    assert_eq!(host.registry.status(&host.room).unwrap(), RoomStatus::Error);

    let handle = host
        .registry
        .invite_guest(&host.room, guest)
        .await
        .expect("Failed to invite guest again");
    assert!(host.registry.fault(&host.room, guest).is_none());
    let second = host.transport.negotiation_for(guest);
    assert_ne!(first, second);

    // The answer to the first offer shows up late
    host.registry
        .route_envelope(answer_from(&host.room, guest, host.host, first))
        .await
        .expect("Failed to route answer");
    let dropped = wait_for_event(&mut host.events, |e| matches!(e, SessionEvent::Dropped { .. })).await;
    assert!(matches!(
        dropped,
        Some(SessionEvent::Dropped {
            reason: SignalDrop::ForeignNegotiation {
                kind: SignalKind::Answer
            },
            ..
        })
    ));
    assert_eq!(handle.state(), ConnectionState::AwaitingAnswer);
}

#[tokio::test(start_paused = true)]
async fn test_bye_for_an_earlier_invite_leaves_the_reinvite_open() {
    init_tracing();

    let mut host = create_host_room(1, Script::connecting());
    let guest = PeerId::new();
    host.registry
        .invite_guest(&host.room, guest)
        .await
        .expect("Failed to invite guest");
    let first = host.transport.negotiation_for(guest);
    wait_for_event(&mut host.events, |e| matches!(e, SessionEvent::SlotRemoved { .. })).await;

    let handle = host
        .registry
        .invite_guest(&host.room, guest)
        .await
        .expect("Failed to invite guest again");

    // The guest's bye for the timed-out offer arrives after the new one went out
    host.registry
        .route_envelope(bye_from(&host.room, guest, host.host, first))
        .await
        .expect("Failed to route bye");
    let dropped = wait_for_event(&mut host.events, |e| matches!(e, SessionEvent::Dropped { .. })).await;
    assert!(matches!(
        dropped,
        Some(SessionEvent::Dropped {
            reason: SignalDrop::ForeignNegotiation {
                kind: SignalKind::Bye
            },
            ..
        })
    ));
    assert_eq!(handle.state(), ConnectionState::AwaitingAnswer);

    // The answer to the new offer still connects
    let second = host.transport.negotiation_for(guest);
    host.registry
        .route_envelope(answer_from(&host.room, guest, host.host, second))
        .await
        .expect("Failed to route answer");
    handle
        .wait_for(|s| s.state == ConnectionState::Connected)
        .await;
    assert_eq!(host.registry.status(&host.room).unwrap(), RoomStatus::Ready);
}

#[tokio::test(start_paused = true)]
async fn test_departed_peers_are_remembered_up_to_a_bound() {
    init_tracing();

    let mut host = create_host_room(1, Script::connecting());
    let mut departed = Vec::new();
    for _ in 0..DEPARTED_MEMORY + 1 {
        let guest = PeerId::new();
        host.registry
            .invite_guest(&host.room, guest)
            .await
            .expect("Failed to invite guest");
        host.registry
            .dispose_guest(&host.room, guest)
            .expect("Failed to dispose guest");
        wait_for_event(&mut host.events, |e| {
            matches!(e, SessionEvent::SlotRemoved { remote, .. } if *remote == guest)
        })
        .await;
        departed.push(guest);
    }

    let newest = departed[DEPARTED_MEMORY];
    let recent = host
        .registry
        .route_envelope(answer_from(&host.room, newest, host.host, None))
        .await;
    assert_eq!(
        recent,
        Err(SignalDrop::StaleSignal {
            kind: SignalKind::Answer
        })
    );

    let oldest = departed[0];
    let forgotten = host
        .registry
        .route_envelope(answer_from(&host.room, oldest, host.host, None))
        .await;
    assert_eq!(
        forgotten,
        Err(SignalDrop::UnknownPeer {
            room: host.room.clone(),
            from: oldest,
            kind: SignalKind::Answer
        })
    );
}

#[tokio::test(start_paused = true)]
async fn test_removed_slot_never_sees_timer_firings() {
    init_tracing();

    let mut host = create_host_room(1, Script::connecting());
    let guest = PeerId::new();
    let handle = host
        .registry
        .invite_guest(&host.room, guest)
        .await
        .expect("Failed to invite guest");

    host.registry
        .dispose_guest(&host.room, guest)
        .expect("Failed to dispose guest");
    let snapshot = handle.wait_for(|s| s.dispose_pending()).await;
    assert_eq!(snapshot.armed_timers, 2);

    let removed = wait_for_event(&mut host.events, |e| matches!(e, SessionEvent::SlotRemoved { .. })).await;
    assert!(removed.is_some());

    let settled = handle.snapshot();
    assert!(settled.is_settled());
    assert_eq!(settled.armed_timers, 0);

    // Past the original connection timeout nothing else happens
    tokio::time::sleep(TIMEOUT * 2).await;
    assert!(handle.is_stopped());
    assert_eq!(handle.snapshot(), settled);
    assert_eq!(host.transport.count(SignalKind::Bye), 1);
}
