use bytes::Bytes;
use relayplay_core::{Button, ChannelMessage, Role};
use relayplay_session::{ConnectionState, PrimitiveEvent};

use crate::integration::{Harness, eventually, init_tracing, spawn_coordinator};
use crate::utils::{EmulatorCall, PrimitiveCall, Script, answer_from};

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

fn frame(json: &'static str) -> PrimitiveEvent {
    PrimitiveEvent::Message(Bytes::from_static(json.as_bytes()))
}

#[tokio::test]
async fn test_remote_input_presses_mapped_buttons_only() {
    init_tracing();

    let h = connected_host().await;
    h.primitives.emit(
        h.remote,
        frame(r#"{"type":"remote-input","payload":{"key":"ArrowUp","pressed":true}}"#),
    );
    h.primitives.emit(
        h.remote,
        frame(r#"{"type":"remote-input","payload":{"key":"q","pressed":true}}"#),
    );
    h.primitives.emit(
        h.remote,
        frame(r#"{"type":"remote-input","payload":{"key":"START","pressed":false}}"#),
    );

    assert!(eventually(|| h.emulator.calls().len() == 2).await);
    assert_eq!(
        h.emulator.calls(),
        [
            EmulatorCall::Button {
                player: h.remote,
                button: Button::Up,
                pressed: true
            },
            EmulatorCall::Button {
                player: h.remote,
                button: Button::Start,
                pressed: false
            },
        ]
    );
}

#[tokio::test]
async fn test_chat_is_recorded_in_transcript() {
    init_tracing();

    let h = connected_host().await;
    let mut echo = h.router.transcript().subscribe();

    h.primitives
        .emit(h.remote, frame(r#"{"type":"chat","text":"ready when you are"}"#));

    let line = echo.recv().await.expect("chat echo");
    assert_eq!(line.from, h.remote);
    assert_eq!(line.text, "ready when you are");
    assert_eq!(h.router.transcript().messages(), [line]);
}

#[tokio::test]
async fn test_control_messages_drive_the_emulator() {
    init_tracing();

    let h = connected_host().await;
    for json in [
        r#"{"type":"set-mute","muted":true}"#,
        r#"{"type":"pause"}"#,
        r#"{"type":"resume"}"#,
        r#"{"type":"reset"}"#,
    ] {
        h.primitives.emit(h.remote, frame(json));
    }

    assert!(eventually(|| h.emulator.calls().len() == 4).await);
    assert_eq!(
        h.emulator.calls(),
        [
            EmulatorCall::SetMute {
                muted: true,
                volume: None
            },
            EmulatorCall::Pause,
            EmulatorCall::Resume,
            EmulatorCall::Reset,
        ]
    );
}

#[tokio::test]
async fn test_bad_frames_do_not_break_the_channel() {
    init_tracing();

    let h = connected_host().await;
    h.primitives.emit(h.remote, frame(r#"{"type":"teleport"}"#));
    h.primitives.emit(h.remote, frame("{not json"));
    h.primitives.emit(h.remote, frame(r#"{"type":"pause"}"#));

    assert!(eventually(|| h.emulator.calls() == [EmulatorCall::Pause]).await);
    assert_eq!(h.handle.state(), ConnectionState::Connected);
}

#[tokio::test]
async fn test_frames_before_connected_are_not_routed() {
    init_tracing();

    let h = spawn_coordinator(Role::Host, Script::connecting()).await;
    h.handle.create_offer().await.expect("Failed to create offer");
    h.primitives.emit(h.remote, frame(r#"{"type":"pause"}"#));

    // Queue order: the frame is handled before the answer
    let negotiation = h.transport.negotiation_for(h.remote);
    h.handle
        .deliver(answer_from(&h.room, h.remote, h.local, negotiation))
        .expect("Failed to deliver answer");
    h.handle
        .wait_for(|s| s.state == ConnectionState::Connected)
        .await;

    assert!(h.emulator.calls().is_empty());
}

#[tokio::test]
async fn test_send_writes_only_while_connected() {
    init_tracing();

    let h = spawn_coordinator(Role::Host, Script::connecting()).await;
    h.handle.create_offer().await.expect("Failed to create offer");
    h.handle
        .send(&ChannelMessage::chat("too early"))
        .expect("Failed to queue message");

    let negotiation = h.transport.negotiation_for(h.remote);
    h.handle
        .deliver(answer_from(&h.room, h.remote, h.local, negotiation))
        .expect("Failed to deliver answer");
    h.handle
        .wait_for(|s| s.state == ConnectionState::Connected)
        .await;

    let message = ChannelMessage::remote_input("a", true);
    h.handle.send(&message).expect("Failed to queue message");

    let expected = PrimitiveCall::Send(message.encode().expect("encode"));
    assert!(eventually(|| h.primitives.count_for(h.remote, &expected) == 1).await);
    let sends = h
        .primitives
        .calls_for(h.remote)
        .into_iter()
        .filter(|c| matches!(c, PrimitiveCall::Send(_)))
        .count();
    assert_eq!(sends, 1);
}
