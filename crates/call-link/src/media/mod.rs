//! Capture collaborator
//!
//! The lifecycle only needs to know whether a capture stream exists and is
//! still live, and to hand its tracks to a freshly built link. How frames
//! get into the tracks is the capture source's business.

use crate::config::MediaConstraints;
use crate::error::MediaAccessError;
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info};
use webrtc::api::media_engine::{MIME_TYPE_OPUS, MIME_TYPE_VP8};
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;

/// Track media kind
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackKind {
    /// Microphone
    Audio,
    /// Camera
    Video,
}

/// One captured track
#[derive(Clone)]
pub struct MediaTrack {
    id: String,
    kind: TrackKind,
    rtc: Arc<TrackLocalStaticSample>,
    live: Arc<AtomicBool>,
}

impl MediaTrack {
    /// Wrap a local sample track
    pub fn new(kind: TrackKind, rtc: Arc<TrackLocalStaticSample>) -> Self {
        Self {
            id: rtc.id().to_string(),
            kind,
            rtc,
            live: Arc::new(AtomicBool::new(true)),
        }
    }

    /// Track id
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Media kind
    pub fn kind(&self) -> TrackKind {
        self.kind
    }

    /// Underlying track to add to a peer connection
    pub fn rtc_track(&self) -> Arc<TrackLocalStaticSample> {
        Arc::clone(&self.rtc)
    }

    /// Whether the track is still producing
    pub fn is_live(&self) -> bool {
        self.live.load(Ordering::SeqCst)
    }

    /// Stop the track; idempotent
    pub fn stop(&self) {
        if self.live.swap(false, Ordering::SeqCst) {
            debug!(track_id = %self.id, "Track stopped");
        }
    }
}

impl std::fmt::Debug for MediaTrack {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MediaTrack")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("live", &self.is_live())
            .finish()
    }
}

/// A capture stream: the set of tracks from one acquisition
#[derive(Debug, Clone)]
pub struct MediaStream {
    id: String,
    tracks: Vec<MediaTrack>,
}

impl MediaStream {
    /// Group tracks into a stream
    pub fn new(tracks: Vec<MediaTrack>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            tracks,
        }
    }

    /// Stream id
    pub fn id(&self) -> &str {
        &self.id
    }

    /// All tracks of the stream
    pub fn tracks(&self) -> &[MediaTrack] {
        &self.tracks
    }

    /// A stream is live while it has tracks and none of them has ended
    pub fn is_live(&self) -> bool {
        !self.tracks.is_empty() && self.tracks.iter().all(MediaTrack::is_live)
    }

    /// Stop every track
    pub fn stop(&self) {
        for track in &self.tracks {
            track.stop();
        }
    }
}

/// Capture device access
#[async_trait]
pub trait MediaSource: Send + Sync {
    /// Acquire a stream satisfying `constraints`
    async fn acquire_stream(
        &self,
        constraints: &MediaConstraints,
    ) -> std::result::Result<MediaStream, MediaAccessError>;
}

/// Capture source backed by sample tracks with no physical device
///
/// Produces an Opus audio track and a VP8 video track; callers feed them
/// through [`MediaTrack::rtc_track`] if they want frames on the wire.
///
/// # Example
///
/// ```
/// use remotemedia_call_link::media::{MediaSource, SyntheticMediaSource};
/// use remotemedia_call_link::MediaConstraints;
///
/// # tokio_test::block_on(async {
/// let source = SyntheticMediaSource::new("alice");
/// let stream = source
///     .acquire_stream(&MediaConstraints::default())
///     .await
///     .unwrap();
/// assert_eq!(stream.tracks().len(), 2);
/// assert!(stream.is_live());
/// # });
/// ```
#[derive(Debug, Clone, Default)]
pub struct SyntheticMediaSource {
    label: String,
}

impl SyntheticMediaSource {
    /// Create a source whose track ids start with `label`
    pub fn new(label: &str) -> Self {
        Self {
            label: label.to_string(),
        }
    }

    fn track(&self, kind: TrackKind, stream_id: &str) -> MediaTrack {
        let (capability, name) = match kind {
            TrackKind::Audio => (
                RTCRtpCodecCapability {
                    mime_type: MIME_TYPE_OPUS.to_string(),
                    clock_rate: 48000,
                    channels: 2,
                    sdp_fmtp_line: String::new(),
                    rtcp_feedback: vec![],
                },
                "audio",
            ),
            TrackKind::Video => (
                RTCRtpCodecCapability {
                    mime_type: MIME_TYPE_VP8.to_string(),
                    clock_rate: 90000,
                    channels: 0,
                    sdp_fmtp_line: String::new(),
                    rtcp_feedback: vec![],
                },
                "video",
            ),
        };

        let rtc = Arc::new(TrackLocalStaticSample::new(
            capability,
            format!("{}-{}", self.label, name),
            stream_id.to_string(),
        ));
        MediaTrack::new(kind, rtc)
    }
}

#[async_trait]
impl MediaSource for SyntheticMediaSource {
    async fn acquire_stream(
        &self,
        constraints: &MediaConstraints,
    ) -> std::result::Result<MediaStream, MediaAccessError> {
        if !constraints.audio && !constraints.video {
            return Err(MediaAccessError::UnsupportedConstraints(
                "neither audio nor video requested".to_string(),
            ));
        }

        if constraints.video && (constraints.video_width == 0 || constraints.video_height == 0) {
            return Err(MediaAccessError::UnsupportedConstraints(format!(
                "video resolution {}x{}",
                constraints.video_width, constraints.video_height
            )));
        }

        let stream_id = format!("stream-{}", uuid::Uuid::new_v4());
        let mut tracks = Vec::new();
        if constraints.audio {
            tracks.push(self.track(TrackKind::Audio, &stream_id));
        }
        if constraints.video {
            tracks.push(self.track(TrackKind::Video, &stream_id));
        }

        info!(
            label = %self.label,
            tracks = tracks.len(),
            "Synthetic capture stream acquired"
        );

        Ok(MediaStream::new(tracks))
    }
}
