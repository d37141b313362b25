use crate::error::{CallError, Result};
use crate::logger::{dump_candidate, dump_selected_pair};
use crate::peer::media::{MediaStream, MediaTrack, RemoteTrack};
use crate::peer::types::{
    IceCandidate, IceConfig, LinkState, MediaKind, SdpKind, SessionDescription, TransportPolicy,
};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::APIBuilder;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_connection_state::RTCIceConnectionState;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::offer_answer_options::RTCOfferOptions;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::policy::bundle_policy::RTCBundlePolicy;
use webrtc::peer_connection::policy::ice_transport_policy::RTCIceTransportPolicy;
use webrtc::peer_connection::policy::rtcp_mux_policy::RTCRtcpMuxPolicy;
use webrtc::peer_connection::sdp::sdp_type::RTCSdpType;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::RTPCodecType;
use webrtc::rtp_transceiver::rtp_receiver::RTCRtpReceiver;
use webrtc::rtp_transceiver::rtp_transceiver_direction::RTCRtpTransceiverDirection;
use webrtc::rtp_transceiver::{RTCRtpTransceiver, RTCRtpTransceiverInit};
use webrtc::track::track_remote::TrackRemote;

/// События peer connection для движка согласования
#[derive(Debug, Clone)]
pub enum PeerEvent {
    /// Найден локальный кандидат (trickle)
    LocalCandidate(IceCandidate),
    /// Сбор кандидатов завершён
    GatheringComplete,
    /// Состояние самого peer connection
    Connection(LinkState),
    /// Состояние ICE транспорта
    Path(LinkState),
    /// Пришёл трек собеседника
    Track(Arc<dyn MediaTrack>),
}

pub type PeerEventSink = mpsc::UnboundedSender<PeerEvent>;
pub type PeerEvents = mpsc::UnboundedReceiver<PeerEvent>;

/// Один peer connection
///
/// Реализация отдаёт события в [`PeerEventSink`], полученный от фабрики, и
/// перестаёт это делать после [`PeerConnection::detach_handlers`].
#[async_trait]
pub trait PeerConnection: Send + Sync {
    async fn add_track(&self, track: Arc<dyn MediaTrack>) -> Result<()>;

    /// Offer с запросом аудио и видео; `ice_restart` - новые ufrag/pwd
    async fn create_offer(&self, ice_restart: bool) -> Result<SessionDescription>;

    async fn create_answer(&self) -> Result<SessionDescription>;

    async fn set_local_description(&self, desc: SessionDescription) -> Result<()>;

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<()>;

    async fn has_remote_description(&self) -> bool;

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()>;

    /// Совмещённое состояние соединения и ICE транспорта
    fn link_state(&self) -> LinkState;

    /// Снимает все обработчики событий
    async fn detach_handlers(&self);

    async fn close(&self) -> Result<()>;

    /// Диагностика выбранной пары; по умолчанию ничего
    async fn dump_stats(&self, _moment: &str) {}
}

/// Создаёт peer connection под выданный набор ICE серверов
#[async_trait]
pub trait PeerFactory: Send + Sync {
    async fn create(
        &self,
        ice: &IceConfig,
        events: PeerEventSink,
    ) -> Result<Arc<dyn PeerConnection>>;
}

/// ========== WEBRTC-RS ==========

/// Фабрика настоящих peer connection на webrtc-rs
#[derive(Debug, Default, Clone)]
pub struct RtcPeerFactory;

#[async_trait]
impl PeerFactory for RtcPeerFactory {
    async fn create(
        &self,
        ice: &IceConfig,
        events: PeerEventSink,
    ) -> Result<Arc<dyn PeerConnection>> {
        let mut media_engine = MediaEngine::default();
        media_engine
            .register_default_codecs()
            .map_err(CallError::negotiation)?;
        let registry = register_default_interceptors(Registry::new(), &mut media_engine)
            .map_err(CallError::negotiation)?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        let pc = Arc::new(
            api.new_peer_connection(rtc_config(ice))
                .await
                .map_err(CallError::negotiation)?,
        );
        attach_handlers(&pc, events);

        Ok(Arc::new(RtcPeer {
            pc,
            sending: Mutex::new(HashSet::new()),
            receivers_ready: AtomicBool::new(false),
        }))
    }
}

/// Создает конфигурацию для peer connection
fn rtc_config(ice: &IceConfig) -> RTCConfiguration {
    let ice_servers = ice
        .servers
        .iter()
        .map(|server| RTCIceServer {
            urls: server.urls.clone(),
            username: server.username.clone().unwrap_or_default(),
            credential: server.credential.clone().unwrap_or_default(),
        })
        .collect();

    RTCConfiguration {
        ice_servers,
        ice_transport_policy: match ice.policy {
            TransportPolicy::All => RTCIceTransportPolicy::All,
            TransportPolicy::Relay => RTCIceTransportPolicy::Relay,
        },
        ice_candidate_pool_size: ice.pool_size,
        bundle_policy: RTCBundlePolicy::MaxBundle,
        rtcp_mux_policy: RTCRtcpMuxPolicy::Require,
        ..Default::default()
    }
}

fn attach_handlers(pc: &Arc<RTCPeerConnection>, events: PeerEventSink) {
    let tx = events.clone();
    pc.on_ice_candidate(Box::new(move |cand: Option<RTCIceCandidate>| {
        let tx = tx.clone();
        Box::pin(async move {
            match cand {
                Some(c) => match candidate_from_rtc(&c) {
                    Ok(candidate) => {
                        dump_candidate("LOCAL", &candidate);
                        let _ = tx.send(PeerEvent::LocalCandidate(candidate));
                    }
                    Err(e) => warn!("Failed to serialize local candidate: {e}"),
                },
                // cand == None означает конец сбора
                None => {
                    debug!("ICE candidate gathering completed (null candidate received)");
                    let _ = tx.send(PeerEvent::GatheringComplete);
                }
            }
        })
    }));

    pc.on_ice_gathering_state_change(Box::new(move |state| {
        debug!("ICE gathering state changed to: {:?}", state);
        Box::pin(async {})
    }));

    // слабая ссылка: обработчик живёт внутри самого pc
    let weak: Weak<RTCPeerConnection> = Arc::downgrade(pc);
    let tx = events.clone();
    pc.on_peer_connection_state_change(Box::new(move |st: RTCPeerConnectionState| {
        debug!("Peer connection state changed to: {:?}", st);
        let tx = tx.clone();
        let weak = weak.clone();
        Box::pin(async move {
            if matches!(
                st,
                RTCPeerConnectionState::Disconnected | RTCPeerConnectionState::Failed
            ) {
                if let Some(pc) = weak.upgrade() {
                    dump_selected_pair(&pc, "BEFORE-FAIL").await;
                }
            }
            if let Some(state) = link_from_connection(st) {
                let _ = tx.send(PeerEvent::Connection(state));
            }
        })
    }));

    let tx = events.clone();
    pc.on_ice_connection_state_change(Box::new(move |st: RTCIceConnectionState| {
        debug!("ICE connection state changed to: {:?}", st);
        if let Some(state) = link_from_ice(st) {
            let _ = tx.send(PeerEvent::Path(state));
        }
        Box::pin(async {})
    }));

    let tx = events;
    pc.on_track(Box::new(
        move |track: Arc<TrackRemote>,
              _receiver: Arc<RTCRtpReceiver>,
              _transceiver: Arc<RTCRtpTransceiver>| {
            info!(
                "Remote track arrived: kind={} id={} stream={}",
                track.kind(),
                track.id(),
                track.stream_id()
            );
            if let Some(remote) = RemoteTrack::new(track) {
                let _ = tx.send(PeerEvent::Track(Arc::new(remote)));
            }
            Box::pin(async {})
        },
    ));
}

fn link_from_connection(st: RTCPeerConnectionState) -> Option<LinkState> {
    match st {
        RTCPeerConnectionState::New => Some(LinkState::New),
        RTCPeerConnectionState::Connecting => Some(LinkState::Connecting),
        RTCPeerConnectionState::Connected => Some(LinkState::Connected),
        RTCPeerConnectionState::Disconnected => Some(LinkState::Disconnected),
        RTCPeerConnectionState::Failed => Some(LinkState::Failed),
        RTCPeerConnectionState::Closed => Some(LinkState::Closed),
        _ => None,
    }
}

fn link_from_ice(st: RTCIceConnectionState) -> Option<LinkState> {
    match st {
        RTCIceConnectionState::New => Some(LinkState::New),
        RTCIceConnectionState::Checking => Some(LinkState::Connecting),
        RTCIceConnectionState::Connected | RTCIceConnectionState::Completed => {
            Some(LinkState::Connected)
        }
        RTCIceConnectionState::Disconnected => Some(LinkState::Disconnected),
        RTCIceConnectionState::Failed => Some(LinkState::Failed),
        RTCIceConnectionState::Closed => Some(LinkState::Closed),
        _ => None,
    }
}

fn candidate_from_rtc(c: &RTCIceCandidate) -> Result<IceCandidate> {
    let init = c.to_json().map_err(CallError::negotiation)?;
    Ok(IceCandidate {
        candidate: init.candidate,
        sdp_mid: init.sdp_mid,
        sdp_mline_index: init.sdp_mline_index,
        username_fragment: init.username_fragment,
        foundation: Some(c.foundation.clone()),
        priority: Some(c.priority),
        protocol: Some(c.protocol.to_string()),
        address: Some(c.address.clone()),
        port: Some(c.port),
        typ: Some(c.typ.to_string()),
        related_address: Some(c.related_address.clone()).filter(|a| !a.is_empty()),
        related_port: Some(c.related_port).filter(|p| *p != 0),
    })
}

fn description_to_rtc(desc: SessionDescription) -> Result<RTCSessionDescription> {
    let parsed = match desc.kind {
        SdpKind::Offer => RTCSessionDescription::offer(desc.sdp),
        SdpKind::Answer => RTCSessionDescription::answer(desc.sdp),
        other => {
            return Err(CallError::Negotiation(format!(
                "unsupported description type {other:?}"
            )))
        }
    };
    parsed.map_err(CallError::negotiation)
}

fn description_from_rtc(desc: RTCSessionDescription) -> Result<SessionDescription> {
    let kind = match desc.sdp_type {
        RTCSdpType::Offer => SdpKind::Offer,
        RTCSdpType::Answer => SdpKind::Answer,
        RTCSdpType::Pranswer => SdpKind::Pranswer,
        RTCSdpType::Rollback => SdpKind::Rollback,
        _ => {
            return Err(CallError::Negotiation(
                "description without a type".to_string(),
            ))
        }
    };
    Ok(SessionDescription {
        kind,
        sdp: desc.sdp,
    })
}

pub struct RtcPeer {
    pc: Arc<RTCPeerConnection>,
    sending: Mutex<HashSet<MediaKind>>,
    receivers_ready: AtomicBool,
}

impl RtcPeer {
    /// Для видов, которые мы не отправляем, добавляем recvonly трансивер,
    /// чтобы offer всегда запрашивал и аудио, и видео
    async fn ensure_receivers(&self) -> Result<()> {
        if self.receivers_ready.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let sending = self.sending.lock().clone();
        for kind in [MediaKind::Audio, MediaKind::Video] {
            if sending.contains(&kind) {
                continue;
            }
            let codec = match kind {
                MediaKind::Audio => RTPCodecType::Audio,
                MediaKind::Video => RTPCodecType::Video,
            };
            self.pc
                .add_transceiver_from_kind(
                    codec,
                    Some(RTCRtpTransceiverInit {
                        direction: RTCRtpTransceiverDirection::Recvonly,
                        send_encodings: vec![],
                    }),
                )
                .await
                .map_err(CallError::negotiation)?;
        }
        Ok(())
    }
}

#[async_trait]
impl PeerConnection for RtcPeer {
    async fn add_track(&self, track: Arc<dyn MediaTrack>) -> Result<()> {
        let Some(source) = track.rtp_source() else {
            return Err(CallError::MediaAccess(format!(
                "track {} cannot be sent",
                track.id()
            )));
        };
        let sender = self
            .pc
            .add_track(source)
            .await
            .map_err(CallError::negotiation)?;
        self.sending.lock().insert(track.kind());

        // RTCP нужно вычитывать, иначе не работают interceptors
        tokio::spawn(async move {
            let mut buf = vec![0u8; 1500];
            while sender.read(&mut buf).await.is_ok() {}
        });
        Ok(())
    }

    async fn create_offer(&self, ice_restart: bool) -> Result<SessionDescription> {
        self.ensure_receivers().await?;
        let options = RTCOfferOptions {
            ice_restart,
            ..Default::default()
        };
        let offer = self
            .pc
            .create_offer(Some(options))
            .await
            .map_err(CallError::negotiation)?;
        description_from_rtc(offer)
    }

    async fn create_answer(&self) -> Result<SessionDescription> {
        let answer = self
            .pc
            .create_answer(None)
            .await
            .map_err(CallError::negotiation)?;
        description_from_rtc(answer)
    }

    async fn set_local_description(&self, desc: SessionDescription) -> Result<()> {
        self.pc
            .set_local_description(description_to_rtc(desc)?)
            .await
            .map_err(CallError::negotiation)
    }

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<()> {
        self.pc
            .set_remote_description(description_to_rtc(desc)?)
            .await
            .map_err(CallError::negotiation)
    }

    async fn has_remote_description(&self) -> bool {
        self.pc.remote_description().await.is_some()
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()> {
        dump_candidate("REMOTE", &candidate);
        self.pc
            .add_ice_candidate(RTCIceCandidateInit {
                candidate: candidate.candidate,
                sdp_mid: candidate.sdp_mid,
                sdp_mline_index: candidate.sdp_mline_index,
                username_fragment: candidate.username_fragment,
            })
            .await
            .map_err(CallError::negotiation)
    }

    fn link_state(&self) -> LinkState {
        let connection =
            link_from_connection(self.pc.connection_state()).unwrap_or(LinkState::New);
        let path = link_from_ice(self.pc.ice_connection_state()).unwrap_or(LinkState::New);
        connection.combine(path)
    }

    async fn detach_handlers(&self) {
        self.pc.on_ice_candidate(Box::new(|_| Box::pin(async {})));
        self.pc
            .on_ice_gathering_state_change(Box::new(|_| Box::pin(async {})));
        self.pc
            .on_peer_connection_state_change(Box::new(|_| Box::pin(async {})));
        self.pc
            .on_ice_connection_state_change(Box::new(|_| Box::pin(async {})));
        self.pc.on_track(Box::new(|_, _, _| Box::pin(async {})));
    }

    async fn close(&self) -> Result<()> {
        self.pc
            .close()
            .await
            .map_err(|e| CallError::Cleanup(e.to_string()))
    }

    async fn dump_stats(&self, moment: &str) {
        dump_selected_pair(&self.pc, moment).await;
    }
}

/// ========== CONNECTION HANDLE ==========

/// Владеет одним peer connection на время одной попытки соединения
///
/// Треки собеседника складываются в один общий поток; каждое изменение
/// набора треков публикуется в `remote_tx`.
pub struct ConnectionHandle {
    peer: Arc<dyn PeerConnection>,
    remote: Mutex<MediaStream>,
    remote_tx: Arc<watch::Sender<Option<MediaStream>>>,
    closed: AtomicBool,
}

impl ConnectionHandle {
    /// Создаёт peer connection и подключает к нему локальные треки
    pub async fn open(
        factory: &dyn PeerFactory,
        ice: &IceConfig,
        local: &MediaStream,
        remote_tx: Arc<watch::Sender<Option<MediaStream>>>,
    ) -> Result<(Arc<Self>, PeerEvents)> {
        let (tx, rx) = mpsc::unbounded_channel();
        let peer = factory.create(ice, tx).await?;
        let handle = Arc::new(Self {
            peer,
            remote: Mutex::new(MediaStream::new(format!("remote-{}", local.id()))),
            remote_tx,
            closed: AtomicBool::new(false),
        });

        for track in local.tracks() {
            if let Err(e) = handle.peer.add_track(track.clone()).await {
                handle.close().await;
                return Err(e);
            }
        }
        debug!(
            "Connection opened with {} ICE servers, local tracks {:?}",
            ice.servers.len(),
            local.track_ids()
        );
        Ok((handle, rx))
    }

    pub fn peer(&self) -> &Arc<dyn PeerConnection> {
        &self.peer
    }

    /// Добавляет трек в общий поток собеседника; true - набор изменился
    pub fn add_remote_track(&self, track: Arc<dyn MediaTrack>) -> bool {
        if self.is_closed() {
            return false;
        }
        let snapshot = {
            let mut remote = self.remote.lock();
            if !remote.add_track(track) {
                return false;
            }
            remote.clone()
        };
        debug!("Remote stream now has tracks {:?}", snapshot.track_ids());
        self.remote_tx.send_replace(Some(snapshot));
        true
    }

    pub fn remote_stream(&self) -> MediaStream {
        self.remote.lock().clone()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Снимает обработчики, закрывает соединение, останавливает треки
    /// собеседника. Повторный вызов ничего не делает.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.peer.detach_handlers().await;
        if let Err(e) = self.peer.close().await {
            warn!("Error closing peer connection: {e}");
        }
        self.remote.lock().stop_all();
        debug!("Connection closed");
    }
}

impl Drop for ConnectionHandle {
    fn drop(&mut self) {
        if self.closed.load(Ordering::SeqCst) {
            return;
        }
        warn!("Connection handle dropped without close, closing in background");
        if let Ok(runtime) = tokio::runtime::Handle::try_current() {
            let peer = self.peer.clone();
            runtime.spawn(async move {
                peer.detach_handlers().await;
                let _ = peer.close().await;
            });
        }
        self.remote.lock().stop_all();
    }
}
