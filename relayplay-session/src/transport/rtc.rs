use crate::transport::primitive::{
    LinkState, PeerConnectionPrimitive, PrimitiveEvent, PrimitiveEvents, PrimitiveFactory,
};
use crate::transport::transport_config::TransportConfig;
use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use relayplay_core::{IceCandidate, PeerId, Role, SdpKind, SessionDescription};
use std::sync::Arc;
use tracing::{debug, info};
use webrtc::api::APIBuilder;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::data_channel::RTCDataChannel;
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;

pub const DATA_CHANNEL_LABEL: &str = "relayplay";

type ChannelSlot = Arc<Mutex<Option<Arc<RTCDataChannel>>>>;

/// Builds webrtc-rs peer connections.
pub struct RtcPrimitiveFactory {
    config: TransportConfig,
}

impl RtcPrimitiveFactory {
    pub fn new(config: TransportConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl PrimitiveFactory for RtcPrimitiveFactory {
    async fn create(
        &self,
        remote: PeerId,
        role: Role,
        events: PrimitiveEvents,
    ) -> Result<Box<dyn PeerConnectionPrimitive>> {
        let connection = RtcPeerConnection::new(remote, role, &self.config, events).await?;
        Ok(Box::new(connection))
    }
}

pub struct RtcPeerConnection {
    remote: PeerId,
    peer_connection: Arc<RTCPeerConnection>,
    channel: ChannelSlot,
}

impl RtcPeerConnection {
    /// The host opens the data channel itself so it is part of the offer;
    /// the guest picks it up from `on_data_channel`.
    pub async fn new(
        remote: PeerId,
        role: Role,
        config: &TransportConfig,
        events: PrimitiveEvents,
    ) -> Result<Self> {
        let mut m = MediaEngine::default();
        m.register_default_codecs()?;
        let registry = register_default_interceptors(Registry::new(), &mut m)?;

        let api = APIBuilder::new()
            .with_media_engine(m)
            .with_interceptor_registry(registry)
            .build();

        let rtc_config = RTCConfiguration {
            ice_servers: vec![RTCIceServer {
                urls: config.ice_servers.clone(),
                credential: String::new(),
                username: String::new(),
            }],
            ..Default::default()
        };

        let peer_connection = Arc::new(
            api.new_peer_connection(rtc_config)
                .await
                .context("Failed to create peer connection")?,
        );
        let channel: ChannelSlot = Arc::new(Mutex::new(None));

        let state_events = events.clone();
        peer_connection.on_peer_connection_state_change(Box::new(
            move |s: RTCPeerConnectionState| {
                let events = state_events.clone();

                Box::pin(async move {
                    info!("Peer connection state for {}: {:?}", remote, s);
                    let state = match s {
                        RTCPeerConnectionState::New => LinkState::New,
                        RTCPeerConnectionState::Connecting => LinkState::Connecting,
                        RTCPeerConnectionState::Connected => LinkState::Connected,
                        RTCPeerConnectionState::Disconnected => LinkState::Disconnected,
                        RTCPeerConnectionState::Failed => LinkState::Failed,
                        RTCPeerConnectionState::Closed => LinkState::Closed,
                        RTCPeerConnectionState::Unspecified => return,
                    };
                    events.emit(PrimitiveEvent::StateChanged(state));
                })
            },
        ));

        let ice_events = events.clone();
        peer_connection.on_ice_candidate(Box::new(move |c: Option<RTCIceCandidate>| {
            let events = ice_events.clone();

            Box::pin(async move {
                let Some(candidate) = c else { return };
                let Ok(init) = candidate.to_json() else {
                    return;
                };
                events.emit(PrimitiveEvent::LocalCandidate(IceCandidate {
                    candidate: init.candidate,
                    sdp_mid: init.sdp_mid,
                    sdp_m_line_index: init.sdp_mline_index,
                    username_fragment: init.username_fragment,
                }));
            })
        }));

        match role {
            Role::Host => {
                let dc = peer_connection
                    .create_data_channel(DATA_CHANNEL_LABEL, None)
                    .await
                    .context("Failed to create data channel")?;
                wire_channel(remote, dc, channel.clone(), events.clone());
            }
            Role::Guest => {
                let dc_events = events.clone();
                let dc_slot = channel.clone();
                peer_connection.on_data_channel(Box::new(move |dc: Arc<RTCDataChannel>| {
                    let events = dc_events.clone();
                    let slot = dc_slot.clone();

                    Box::pin(async move {
                        debug!("Data channel '{}' announced by {}", dc.label(), remote);
                        wire_channel(remote, dc, slot, events);
                    })
                }));
            }
        }

        Ok(Self {
            remote,
            peer_connection,
            channel,
        })
    }
}

fn wire_channel(remote: PeerId, dc: Arc<RTCDataChannel>, slot: ChannelSlot, events: PrimitiveEvents) {
    let open_channel = dc.clone();
    let open_events = events.clone();
    dc.on_open(Box::new(move || {
        let events = open_events.clone();
        let ready = open_channel.clone();
        let slot = slot.clone();

        Box::pin(async move {
            info!("Data channel open for {}", remote);
            *slot.lock() = Some(ready);
            events.emit(PrimitiveEvent::ChannelOpen);
        })
    }));

    let msg_events = events;
    dc.on_message(Box::new(move |msg: DataChannelMessage| {
        let events = msg_events.clone();
        Box::pin(async move {
            events.emit(PrimitiveEvent::Message(msg.data));
        })
    }));
}

fn to_rtc(description: &SessionDescription) -> Result<RTCSessionDescription> {
    let sdp = description.sdp.clone();
    let desc = match description.kind {
        SdpKind::Offer => RTCSessionDescription::offer(sdp)?,
        SdpKind::Answer => RTCSessionDescription::answer(sdp)?,
    };
    Ok(desc)
}

#[async_trait]
impl PeerConnectionPrimitive for RtcPeerConnection {
    async fn create_offer(&self) -> Result<SessionDescription> {
        let offer = self.peer_connection.create_offer(None).await?;
        Ok(SessionDescription::offer(offer.sdp))
    }

    async fn create_answer(&self) -> Result<SessionDescription> {
        let answer = self.peer_connection.create_answer(None).await?;
        Ok(SessionDescription::answer(answer.sdp))
    }

    async fn set_local_description(&self, description: &SessionDescription) -> Result<()> {
        self.peer_connection
            .set_local_description(to_rtc(description)?)
            .await?;
        Ok(())
    }

    async fn set_remote_description(&self, description: &SessionDescription) -> Result<()> {
        self.peer_connection
            .set_remote_description(to_rtc(description)?)
            .await?;
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: &IceCandidate) -> Result<()> {
        let init = RTCIceCandidateInit {
            candidate: candidate.candidate.clone(),
            sdp_mid: candidate.sdp_mid.clone(),
            sdp_mline_index: candidate.sdp_m_line_index,
            username_fragment: candidate.username_fragment.clone(),
        };
        self.peer_connection
            .add_ice_candidate(init)
            .await
            .context("Failed to add ICE candidate")?;
        Ok(())
    }

    async fn send(&self, data: Bytes) -> Result<()> {
        let channel = self.channel.lock().clone();
        let Some(channel) = channel else {
            bail!("data channel to {} is not open", self.remote);
        };
        channel.send(&data).await?;
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.peer_connection.close().await?;
        Ok(())
    }
}
