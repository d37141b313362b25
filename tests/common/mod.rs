//! Общие заглушки для интеграционных тестов
//!
//! `FakePeer` ведёт себя как peer connection без сети: после установки
//! local description выдаёт пару host-кандидатов, а когда заданы обе
//! описания - сообщает connected и отдаёт аудио+видео трек собеседника.
//! Кандидат до remote description отвергается, как в браузере.

#![allow(dead_code)]

use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use yapspace::error::{CallError, Result};
use yapspace::peer::connection::{PeerConnection, PeerEvent, PeerFactory};
use yapspace::peer::media::{MediaSource, MediaStream, MediaTrack};
use yapspace::peer::types::{IceCandidate, IceConfig, LinkState, MediaKind, SessionDescription};
use yapspace::{CallConfig, CallSession, Collaborators, Identity, MemoryStore, SessionStatus};

pub fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "yapspace=debug".into()),
        )
        .with_test_writer()
        .try_init();
}

/// Быстрые таймеры для тестов
pub fn fast_config() -> CallConfig {
    CallConfig {
        rematch_interval_ms: 40,
        recovery_window_ms: 200,
        ..Default::default()
    }
}

#[derive(Debug)]
pub struct FakeTrack {
    id: String,
    kind: MediaKind,
    stopped: AtomicBool,
}

impl FakeTrack {
    pub fn new(id: impl Into<String>, kind: MediaKind) -> Arc<Self> {
        Arc::new(Self {
            id: id.into(),
            kind,
            stopped: AtomicBool::new(false),
        })
    }
}

impl MediaTrack for FakeTrack {
    fn id(&self) -> &str {
        &self.id
    }

    fn kind(&self) -> MediaKind {
        self.kind
    }

    fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
    }

    fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }
}

/// Камера и микрофон; помнит все выданные треки
#[derive(Default)]
pub struct FakeMedia {
    denied: bool,
    /// Пользователь думает над запросом доступа
    delay: Option<Duration>,
    issued: Mutex<Vec<Arc<FakeTrack>>>,
}

impl FakeMedia {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Пользователь запретил доступ
    pub fn denied() -> Arc<Self> {
        Arc::new(Self {
            denied: true,
            ..Default::default()
        })
    }

    pub fn slow(delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            delay: Some(delay),
            ..Default::default()
        })
    }

    pub fn issued(&self) -> Vec<Arc<FakeTrack>> {
        self.issued.lock().clone()
    }

    pub fn all_stopped(&self) -> bool {
        self.issued.lock().iter().all(|t| t.is_stopped())
    }
}

#[async_trait]
impl MediaSource for FakeMedia {
    async fn acquire(&self) -> Result<MediaStream> {
        match self.delay {
            Some(delay) => tokio::time::sleep(delay).await,
            None => tokio::task::yield_now().await,
        }
        if self.denied {
            return Err(CallError::MediaAccess("permission denied".into()));
        }
        let n = self.issued.lock().len();
        let audio = FakeTrack::new(format!("mic-{n}"), MediaKind::Audio);
        let video = FakeTrack::new(format!("cam-{n}"), MediaKind::Video);
        self.issued.lock().extend([audio.clone(), video.clone()]);

        let tracks: Vec<Arc<dyn MediaTrack>> = vec![audio, video];
        Ok(MediaStream::with_tracks(format!("local-{n}"), tracks))
    }
}

/// Что сломать в следующем созданном peer
#[derive(Debug, Default, Clone, Copy)]
pub struct Faults {
    pub reject_remote_description: bool,
    pub no_auto_connect: bool,
    /// create_answer зависает на это время
    pub answer_delay: Option<Duration>,
}

pub struct FakePeer {
    label: String,
    faults: Faults,
    events: Mutex<Option<mpsc::UnboundedSender<PeerEvent>>>,
    local: Mutex<Option<SessionDescription>>,
    remote: Mutex<Option<SessionDescription>>,
    applied: Mutex<Vec<IceCandidate>>,
    rejected_candidates: AtomicUsize,
    descriptions: AtomicUsize,
    connected: AtomicBool,
    closed: AtomicBool,
    link: Mutex<LinkState>,
}

impl FakePeer {
    pub fn label(&self) -> &str {
        &self.label
    }

    /// Кандидаты собеседника в порядке применения
    pub fn applied(&self) -> Vec<String> {
        self.applied
            .lock()
            .iter()
            .map(|c| c.candidate.clone())
            .collect()
    }

    pub fn rejected_candidates(&self) -> usize {
        self.rejected_candidates.load(Ordering::SeqCst)
    }

    pub fn remote(&self) -> Option<SessionDescription> {
        self.remote.lock().clone()
    }

    pub fn local(&self) -> Option<SessionDescription> {
        self.local.lock().clone()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn is_detached(&self) -> bool {
        self.events.lock().is_none()
    }

    /// Меняет состояние связи, не сообщая об этом
    pub fn set_link_silently(&self, state: LinkState) {
        *self.link.lock() = state;
    }

    /// Имитирует событие сетевого пути или соединения
    pub fn emit(&self, event: PeerEvent) {
        if let PeerEvent::Connection(state) | PeerEvent::Path(state) = &event {
            *self.link.lock() = *state;
        }
        if let Some(tx) = self.events.lock().as_ref() {
            let _ = tx.send(event);
        }
    }

    fn candidate(&self, n: usize) -> IceCandidate {
        IceCandidate {
            candidate: format!("candidate:{} {n} udp 2130706431 10.0.0.1 {} typ host", self.label, 5000 + n),
            sdp_mid: Some("0".into()),
            sdp_mline_index: Some(0),
            ..Default::default()
        }
    }

    fn maybe_connect(&self) {
        if self.faults.no_auto_connect || self.local.lock().is_none() || self.remote.lock().is_none() {
            return;
        }
        if self.connected.swap(true, Ordering::SeqCst) {
            return;
        }
        self.emit(PeerEvent::Connection(LinkState::Connecting));
        self.emit(PeerEvent::Path(LinkState::Connected));
        self.emit(PeerEvent::Connection(LinkState::Connected));
        let audio: Arc<dyn MediaTrack> = FakeTrack::new(format!("{}-audio", self.label), MediaKind::Audio);
        let video: Arc<dyn MediaTrack> = FakeTrack::new(format!("{}-video", self.label), MediaKind::Video);
        self.emit(PeerEvent::Track(audio));
        self.emit(PeerEvent::Track(video));
    }
}

#[async_trait]
impl PeerConnection for FakePeer {
    async fn add_track(&self, _track: Arc<dyn MediaTrack>) -> Result<()> {
        Ok(())
    }

    async fn create_offer(&self, ice_restart: bool) -> Result<SessionDescription> {
        let n = self.descriptions.fetch_add(1, Ordering::SeqCst);
        Ok(SessionDescription::offer(format!(
            "offer:{}:{n}:restart={ice_restart}",
            self.label
        )))
    }

    async fn create_answer(&self) -> Result<SessionDescription> {
        if let Some(delay) = self.faults.answer_delay {
            tokio::time::sleep(delay).await;
        }
        if self.remote.lock().is_none() {
            return Err(CallError::Negotiation("no remote offer".into()));
        }
        let n = self.descriptions.fetch_add(1, Ordering::SeqCst);
        Ok(SessionDescription::answer(format!("answer:{}:{n}", self.label)))
    }

    async fn set_local_description(&self, desc: SessionDescription) -> Result<()> {
        tokio::task::yield_now().await;
        let first = self.local.lock().replace(desc).is_none();
        if first {
            for n in 0..2 {
                self.emit(PeerEvent::LocalCandidate(self.candidate(n)));
            }
            self.emit(PeerEvent::GatheringComplete);
        }
        self.maybe_connect();
        Ok(())
    }

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<()> {
        tokio::task::yield_now().await;
        if self.faults.reject_remote_description {
            return Err(CallError::Negotiation("malformed remote description".into()));
        }
        *self.remote.lock() = Some(desc);
        self.maybe_connect();
        Ok(())
    }

    async fn has_remote_description(&self) -> bool {
        self.remote.lock().is_some()
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()> {
        if self.remote.lock().is_none() {
            self.rejected_candidates.fetch_add(1, Ordering::SeqCst);
            return Err(CallError::Negotiation(
                "candidate before remote description".into(),
            ));
        }
        self.applied.lock().push(candidate);
        Ok(())
    }

    fn link_state(&self) -> LinkState {
        *self.link.lock()
    }

    async fn detach_handlers(&self) {
        self.events.lock().take();
    }

    async fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

/// Фабрика, которая помнит все созданные peer
pub struct FakePeerFactory {
    name: String,
    faults: Mutex<Faults>,
    created: Mutex<Vec<Arc<FakePeer>>>,
}

impl FakePeerFactory {
    pub fn new(name: &str) -> Arc<Self> {
        Arc::new(Self {
            name: name.into(),
            faults: Mutex::new(Faults::default()),
            created: Mutex::new(Vec::new()),
        })
    }

    pub fn set_faults(&self, faults: Faults) {
        *self.faults.lock() = faults;
    }

    pub fn peers(&self) -> Vec<Arc<FakePeer>> {
        self.created.lock().clone()
    }

    pub fn last(&self) -> Arc<FakePeer> {
        self.created
            .lock()
            .last()
            .cloned()
            .expect("no peer created yet")
    }
}

#[async_trait]
impl PeerFactory for FakePeerFactory {
    async fn create(
        &self,
        _ice: &IceConfig,
        events: mpsc::UnboundedSender<PeerEvent>,
    ) -> Result<Arc<dyn PeerConnection>> {
        let mut created = self.created.lock();
        let peer = Arc::new(FakePeer {
            label: format!("{}#{}", self.name, created.len()),
            faults: *self.faults.lock(),
            events: Mutex::new(Some(events)),
            local: Mutex::new(None),
            remote: Mutex::new(None),
            applied: Mutex::new(Vec::new()),
            rejected_candidates: AtomicUsize::new(0),
            descriptions: AtomicUsize::new(0),
            connected: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            link: Mutex::new(LinkState::New),
        });
        created.push(peer.clone());
        let peer: Arc<dyn PeerConnection> = peer;
        Ok(peer)
    }
}

/// Участник со своими заглушками
pub struct Participant {
    pub session: CallSession,
    pub peers: Arc<FakePeerFactory>,
    pub media: Arc<FakeMedia>,
}

impl Participant {
    pub fn new(name: &str, store: &MemoryStore, config: CallConfig) -> Self {
        Self::with_media(name, store, config, FakeMedia::new())
    }

    pub fn with_media(
        name: &str,
        store: &MemoryStore,
        config: CallConfig,
        media: Arc<FakeMedia>,
    ) -> Self {
        let peers = FakePeerFactory::new(name);
        let deps = Collaborators {
            store: Arc::new(store.clone()),
            media: media.clone(),
            peers: peers.clone(),
            credentials: None,
        };
        let session = CallSession::new(Identity::new(name).unwrap(), deps, config).unwrap();
        Self {
            session,
            peers,
            media,
        }
    }

    pub fn status(&self) -> SessionStatus {
        self.session.status()
    }

    pub fn call_id(&self) -> Option<String> {
        self.session.view().call_id
    }

    pub async fn wait_for(&self, target: SessionStatus) {
        let mut status = self.session.subscribe_status();
        tokio::time::timeout(Duration::from_secs(5), status.wait_for(|s| *s == target))
            .await
            .unwrap_or_else(|_| {
                panic!(
                    "{} never reached {target}, stuck in {}",
                    self.session.identity(),
                    self.status()
                )
            })
            .unwrap();
    }

    /// Сессия полностью пуста
    pub fn assert_released(&self) {
        let view = self.session.view();
        assert_eq!(view.status, SessionStatus::Disconnected);
        assert_eq!(view.role, None);
        assert_eq!(view.call_id, None);
        assert!(self.session.local_stream().borrow().is_none());
        assert!(self.session.remote_stream().borrow().is_none());
        assert!(self.media.all_stopped());
        assert!(self.peers.peers().iter().all(|p| p.is_closed() && p.is_detached()));
    }
}

/// Ждёт, пока условие станет истинным
pub async fn eventually(what: &str, mut check: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !check() {
        if tokio::time::Instant::now() > deadline {
            panic!("timed out waiting for {what}");
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
