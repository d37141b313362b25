use crate::error::{CallError, Result};
use crate::peer::types::MediaKind;
use crate::utils::random_id;
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::debug;
use webrtc::api::media_engine::{MIME_TYPE_OPUS, MIME_TYPE_VP8};
use webrtc::media::Sample;
use webrtc::rtp_transceiver::rtp_codec::{RTCRtpCodecCapability, RTPCodecType};
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_remote::TrackRemote;

/// Медиа-трек, локальный или пришедший от собеседника
pub trait MediaTrack: Send + Sync + fmt::Debug {
    fn id(&self) -> &str;

    fn kind(&self) -> MediaKind;

    /// Останавливает трек; повторный вызов ничего не делает
    fn stop(&self);

    fn is_stopped(&self) -> bool;

    /// RTP-источник для отправки через webrtc-rs
    fn rtp_source(&self) -> Option<Arc<dyn TrackLocal + Send + Sync>> {
        None
    }
}

/// Набор треков с общим id
#[derive(Clone, Debug)]
pub struct MediaStream {
    id: String,
    tracks: Vec<Arc<dyn MediaTrack>>,
}

impl MediaStream {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            tracks: Vec::new(),
        }
    }

    pub fn with_tracks(id: impl Into<String>, tracks: Vec<Arc<dyn MediaTrack>>) -> Self {
        let mut stream = Self::new(id);
        for track in tracks {
            stream.add_track(track);
        }
        stream
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn tracks(&self) -> &[Arc<dyn MediaTrack>] {
        &self.tracks
    }

    pub fn track_ids(&self) -> Vec<String> {
        self.tracks.iter().map(|t| t.id().to_string()).collect()
    }

    /// Добавляет трек, если такого id ещё нет; true - набор изменился
    pub fn add_track(&mut self, track: Arc<dyn MediaTrack>) -> bool {
        if self.tracks.iter().any(|t| t.id() == track.id()) {
            return false;
        }
        self.tracks.push(track);
        true
    }

    pub fn has_kind(&self, kind: MediaKind) -> bool {
        self.tracks.iter().any(|t| t.kind() == kind)
    }

    pub fn stop_all(&self) {
        for track in &self.tracks {
            track.stop();
        }
    }
}

/// Источник локального аудио+видео
#[async_trait]
pub trait MediaSource: Send + Sync {
    async fn acquire(&self) -> Result<MediaStream>;
}

/// Локальный трек на базе `TrackLocalStaticSample`
pub struct RtpTrack {
    id: String,
    kind: MediaKind,
    track: Arc<TrackLocalStaticSample>,
    pump: Mutex<Option<JoinHandle<()>>>,
    stopped: AtomicBool,
}

impl fmt::Debug for RtpTrack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RtpTrack")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("stopped", &self.is_stopped())
            .finish()
    }
}

impl RtpTrack {
    pub fn new(kind: MediaKind, stream_id: &str) -> Self {
        let (mime, clock_rate, channels) = match kind {
            MediaKind::Audio => (MIME_TYPE_OPUS, 48_000, 2),
            MediaKind::Video => (MIME_TYPE_VP8, 90_000, 0),
        };
        let id = format!("{}-{}", kind_label(kind), random_id());
        let track = Arc::new(TrackLocalStaticSample::new(
            RTCRtpCodecCapability {
                mime_type: mime.to_owned(),
                clock_rate,
                channels,
                sdp_fmtp_line: String::new(),
                rtcp_feedback: vec![],
            },
            id.clone(),
            stream_id.to_owned(),
        ));
        Self {
            id,
            kind,
            track,
            pump: Mutex::new(None),
            stopped: AtomicBool::new(false),
        }
    }

    /// Гонит заглушку каждые 20 мс (Opus) или 33 мс (VP8), пока трек не остановят
    pub fn pump(&self) {
        let (frame, period) = match self.kind {
            // пустой Opus-фрейм (TOC 0xF8 + тишина)
            MediaKind::Audio => (Bytes::from_static(&[0xF8, 0xFF, 0xFE]), Duration::from_millis(20)),
            MediaKind::Video => (Bytes::from_static(&VP8_KEYFRAME), Duration::from_millis(33)),
        };
        let track = self.track.clone();
        let handle = tokio::spawn(async move {
            let mut tick = tokio::time::interval(period);
            loop {
                tick.tick().await;
                let sample = Sample {
                    data: frame.clone(),
                    duration: period,
                    ..Default::default()
                };
                if track.write_sample(&sample).await.is_err() {
                    break;
                }
            }
        });
        if let Some(previous) = self.pump.lock().replace(handle) {
            previous.abort();
        }
    }

    pub fn is_pumping(&self) -> bool {
        self.pump
            .lock()
            .as_ref()
            .is_some_and(|pump| !pump.is_finished())
    }
}

impl MediaTrack for RtpTrack {
    fn id(&self) -> &str {
        &self.id
    }

    fn kind(&self) -> MediaKind {
        self.kind
    }

    fn stop(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(pump) = self.pump.lock().take() {
            pump.abort();
        }
        debug!("stopped local {} track {}", kind_label(self.kind), self.id);
    }

    fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    fn rtp_source(&self) -> Option<Arc<dyn TrackLocal + Send + Sync>> {
        let track: Arc<dyn TrackLocal + Send + Sync> = self.track.clone();
        Some(track)
    }
}

/// Трек собеседника, пришедший через on_track
pub struct RemoteTrack {
    id: String,
    kind: MediaKind,
    track: Arc<TrackRemote>,
    stopped: AtomicBool,
}

impl fmt::Debug for RemoteTrack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemoteTrack")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .finish()
    }
}

impl RemoteTrack {
    pub fn new(track: Arc<TrackRemote>) -> Option<Self> {
        let kind = match track.kind() {
            RTPCodecType::Audio => MediaKind::Audio,
            RTPCodecType::Video => MediaKind::Video,
            _ => return None,
        };
        Some(Self {
            id: track.id(),
            kind,
            track,
            stopped: AtomicBool::new(false),
        })
    }

    /// RTP-поток для рендерера
    pub fn rtp_track(&self) -> Arc<TrackRemote> {
        self.track.clone()
    }
}

impl MediaTrack for RemoteTrack {
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

/// Синтетические Opus + VP8 треки для запуска без камеры
#[derive(Debug, Default, Clone)]
pub struct SyntheticMedia;

#[async_trait]
impl MediaSource for SyntheticMedia {
    async fn acquire(&self) -> Result<MediaStream> {
        let stream_id = format!("local-{}", random_id());
        let audio = RtpTrack::new(MediaKind::Audio, &stream_id);
        let video = RtpTrack::new(MediaKind::Video, &stream_id);
        audio.pump();
        video.pump();

        let tracks: Vec<Arc<dyn MediaTrack>> = vec![Arc::new(audio), Arc::new(video)];
        let stream = MediaStream::with_tracks(stream_id, tracks);
        if !stream.has_kind(MediaKind::Audio) || !stream.has_kind(MediaKind::Video) {
            return Err(CallError::MediaAccess("synthetic source lost a track".into()));
        }
        Ok(stream)
    }
}

/// Ключевой кадр VP8 16x16: тег кадра, стартовый код 9d 01 2a, размеры
const VP8_KEYFRAME: [u8; 24] = [
    0x50, 0x01, 0x00, 0x9d, 0x01, 0x2a, 0x10, 0x00, 0x10, 0x00, 0x00, 0x47, 0x08, 0x85, 0x85,
    0x88, 0x85, 0x84, 0x88, 0x02, 0x02, 0x00, 0x0c, 0x0d,
];

fn kind_label(kind: MediaKind) -> &'static str {
    match kind {
        MediaKind::Audio => "audio",
        MediaKind::Video => "video",
    }
}
