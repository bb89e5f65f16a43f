//! Lokale Medienquelle - opake Capture-Schnittstelle
//!
//! Die konkreten Capture-APIs (Mikrofon, Kamera) sind externe
//! Kollaborateure. Dieses Modul definiert die Schnittstelle, über die
//! der Call-Aufbau eine lokale Medienquelle anfordert, sowie eine
//! eingebaute Implementierung mit statischen Sample-Tracks.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::track::track_local::track_local_static_rtp::TrackLocalStaticRTP;
use webrtc::track::track_local::TrackLocal;

// ============================================================================
// CONSTANTS
// ============================================================================

/// Sample Rate für Opus-Audio
pub const AUDIO_CLOCK_RATE: u32 = 48000;

/// Clock Rate für VP8-Video
pub const VIDEO_CLOCK_RATE: u32 = 90000;

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug, Clone)]
pub enum MediaError {
    #[error("Media permission denied")]
    PermissionDenied,

    #[error("No capture device available")]
    NoDevice,

    #[error("Failed to create local track: {0}")]
    Track(String),
}

// ============================================================================
// CONSTRAINTS
// ============================================================================

/// Audio-Constraints für die Capture-Quelle
#[derive(Debug, Clone)]
pub struct AudioConstraints {
    pub echo_cancellation: bool,
    pub noise_suppression: bool,
}

impl Default for AudioConstraints {
    fn default() -> Self {
        Self {
            echo_cancellation: true,
            noise_suppression: true,
        }
    }
}

/// Video-Constraints mit begrenzter Auflösung und Framerate
#[derive(Debug, Clone)]
pub struct VideoConstraints {
    pub max_width: u32,
    pub max_height: u32,
    pub max_frame_rate: u32,
}

impl Default for VideoConstraints {
    fn default() -> Self {
        Self {
            max_width: 1280,
            max_height: 720,
            max_frame_rate: 30,
        }
    }
}

/// Gemeinsam vereinbarte Constraints für einen Anruf
#[derive(Debug, Clone, Default)]
pub struct MediaConstraints {
    pub audio: AudioConstraints,
    pub video: Option<VideoConstraints>,
}

impl MediaConstraints {
    /// Constraints für einen Audio- bzw. Video-Anruf
    pub fn for_call(wants_video: bool) -> Self {
        Self {
            audio: AudioConstraints::default(),
            video: wants_video.then(VideoConstraints::default),
        }
    }
}

// ============================================================================
// ROUTING / TOGGLES
// ============================================================================

/// Ausgabe-Route für Anruf-Audio
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpeakerRoute {
    Earpiece,
    Speaker,
}

/// Aktive Kamera
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CameraFacing {
    Front,
    Back,
}

// ============================================================================
// LOCAL MEDIA
// ============================================================================

/// Lokaler Track-Satz eines Anrufs
///
/// Die Toggle-Flags steuern die Capture-Pipeline; sie lösen keine
/// Neuverhandlung aus.
pub struct LocalMedia {
    audio_track: Arc<TrackLocalStaticRTP>,
    video_track: Option<Arc<TrackLocalStaticRTP>>,
    muted: AtomicBool,
    video_enabled: AtomicBool,
    speaker_route: Mutex<SpeakerRoute>,
    camera: Mutex<CameraFacing>,
    stopped: AtomicBool,
}

impl LocalMedia {
    pub fn new(
        audio_track: Arc<TrackLocalStaticRTP>,
        video_track: Option<Arc<TrackLocalStaticRTP>>,
    ) -> Self {
        let has_video = video_track.is_some();
        Self {
            audio_track,
            video_track,
            muted: AtomicBool::new(false),
            video_enabled: AtomicBool::new(has_video),
            speaker_route: Mutex::new(SpeakerRoute::Earpiece),
            camera: Mutex::new(CameraFacing::Front),
            stopped: AtomicBool::new(false),
        }
    }

    /// Alle Tracks zum Anhängen an die Peer Connection
    pub fn tracks(&self) -> Vec<Arc<dyn TrackLocal + Send + Sync>> {
        let mut tracks: Vec<Arc<dyn TrackLocal + Send + Sync>> =
            vec![Arc::clone(&self.audio_track) as Arc<dyn TrackLocal + Send + Sync>];
        if let Some(video) = &self.video_track {
            tracks.push(Arc::clone(video) as Arc<dyn TrackLocal + Send + Sync>);
        }
        tracks
    }

    pub fn has_video(&self) -> bool {
        self.video_track.is_some()
    }

    /// Schaltet das Mikrofon stumm bzw. wieder ein
    pub fn toggle_mute(&self) -> bool {
        let muted = !self.muted.load(Ordering::SeqCst);
        self.muted.store(muted, Ordering::SeqCst);
        muted
    }

    pub fn is_muted(&self) -> bool {
        self.muted.load(Ordering::SeqCst)
    }

    /// Schaltet den Video-Track ein bzw. aus
    pub fn toggle_video(&self) -> bool {
        let enabled = !self.video_enabled.load(Ordering::SeqCst);
        self.video_enabled.store(enabled, Ordering::SeqCst);
        enabled
    }

    pub fn is_video_enabled(&self) -> bool {
        self.video_enabled.load(Ordering::SeqCst)
    }

    /// Wechselt zwischen Hörer und Lautsprecher
    pub fn toggle_speaker(&self) -> SpeakerRoute {
        let mut route = self.speaker_route.lock();
        *route = match *route {
            SpeakerRoute::Earpiece => SpeakerRoute::Speaker,
            SpeakerRoute::Speaker => SpeakerRoute::Earpiece,
        };
        *route
    }

    pub fn speaker_route(&self) -> SpeakerRoute {
        *self.speaker_route.lock()
    }

    /// Wechselt zwischen Front- und Rückkamera
    pub fn switch_camera(&self) -> CameraFacing {
        let mut camera = self.camera.lock();
        *camera = match *camera {
            CameraFacing::Front => CameraFacing::Back,
            CameraFacing::Back => CameraFacing::Front,
        };
        *camera
    }

    pub fn camera(&self) -> CameraFacing {
        *self.camera.lock()
    }

    /// Stoppt alle Tracks; mehrfacher Aufruf ist unschädlich
    pub fn stop(&self) {
        if !self.stopped.swap(true, Ordering::SeqCst) {
            tracing::debug!("Local media stopped");
        }
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }
}

impl std::fmt::Debug for LocalMedia {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalMedia")
            .field("has_video", &self.has_video())
            .field("is_muted", &self.is_muted())
            .field("is_stopped", &self.is_stopped())
            .finish()
    }
}

// ============================================================================
// MEDIA SOURCE
// ============================================================================

/// Opake Quelle für lokale Medien
///
/// Konkrete Capture-Implementierungen (Gerätezugriff, Permissions)
/// liegen außerhalb dieses Crates.
#[async_trait]
pub trait MediaSource: Send + Sync {
    /// Fordert eine lokale Medienquelle mit den gegebenen Constraints an
    async fn acquire(&self, constraints: &MediaConstraints) -> Result<LocalMedia, MediaError>;
}

/// Eingebaute Quelle mit statischen Opus/VP8-Tracks
///
/// Die Tracks werden von einer externen Capture-Pipeline befüllt.
#[derive(Debug, Default)]
pub struct StaticMediaSource;

#[async_trait]
impl MediaSource for StaticMediaSource {
    async fn acquire(&self, constraints: &MediaConstraints) -> Result<LocalMedia, MediaError> {
        let audio_track = Arc::new(TrackLocalStaticRTP::new(
            RTCRtpCodecCapability {
                mime_type: "audio/opus".to_string(),
                clock_rate: AUDIO_CLOCK_RATE,
                channels: 1,
                ..Default::default()
            },
            "audio".to_string(),
            "funkruf".to_string(),
        ));

        let video_track = constraints.video.as_ref().map(|_| {
            Arc::new(TrackLocalStaticRTP::new(
                RTCRtpCodecCapability {
                    mime_type: "video/VP8".to_string(),
                    clock_rate: VIDEO_CLOCK_RATE,
                    ..Default::default()
                },
                "video".to_string(),
                "funkruf".to_string(),
            ))
        });

        tracing::debug!(
            "Acquired local media (video: {})",
            video_track.is_some()
        );

        Ok(LocalMedia::new(audio_track, video_track))
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_acquire_audio_only() {
        let source = StaticMediaSource;
        let media = source
            .acquire(&MediaConstraints::for_call(false))
            .await
            .unwrap();

        assert!(!media.has_video());
        assert_eq!(media.tracks().len(), 1);
    }

    #[tokio::test]
    async fn test_acquire_with_video() {
        let source = StaticMediaSource;
        let media = source
            .acquire(&MediaConstraints::for_call(true))
            .await
            .unwrap();

        assert!(media.has_video());
        assert_eq!(media.tracks().len(), 2);
        assert!(media.is_video_enabled());
    }

    #[tokio::test]
    async fn test_toggles() {
        let source = StaticMediaSource;
        let media = source
            .acquire(&MediaConstraints::for_call(true))
            .await
            .unwrap();

        assert!(!media.is_muted());
        assert!(media.toggle_mute());
        assert!(media.is_muted());
        assert!(!media.toggle_mute());

        assert_eq!(media.toggle_speaker(), SpeakerRoute::Speaker);
        assert_eq!(media.toggle_speaker(), SpeakerRoute::Earpiece);

        assert_eq!(media.switch_camera(), CameraFacing::Back);
        assert!(!media.toggle_video());
        assert!(!media.is_video_enabled());
    }

    #[tokio::test]
    async fn test_stop_is_idempotent() {
        let source = StaticMediaSource;
        let media = source
            .acquire(&MediaConstraints::for_call(false))
            .await
            .unwrap();

        media.stop();
        media.stop();
        assert!(media.is_stopped());
    }
}
