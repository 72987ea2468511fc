use std::sync::Arc;

use webrtc::rtp_transceiver::rtp_codec::RTPCodecType;
use webrtc::track::track_remote::TrackRemote;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackKind {
    Audio,
    Video,
}

impl TrackKind {
    pub fn from_codec_type(kind: RTPCodecType) -> Option<Self> {
        match kind {
            RTPCodecType::Audio => Some(TrackKind::Audio),
            RTPCodecType::Video => Some(TrackKind::Video),
            _ => None,
        }
    }
}

/// A remote media track as handed to a sink. The sink owns reading from it.
#[derive(Clone)]
pub struct RemoteTrack {
    pub id: String,
    pub stream_id: String,
    pub kind: TrackKind,
    pub track: Arc<TrackRemote>,
}

/// Renderer or player for remote media. Frame contents are its business.
pub trait MediaSink: Send + Sync {
    fn attach(&self, track: RemoteTrack);
    fn detach(&self, track_id: &str);
}

#[derive(Clone, Default)]
pub struct MediaSinks {
    pub audio: Option<Arc<dyn MediaSink>>,
    pub video: Option<Arc<dyn MediaSink>>,
}

impl MediaSinks {
    pub fn for_kind(&self, kind: TrackKind) -> Option<&Arc<dyn MediaSink>> {
        match kind {
            TrackKind::Audio => self.audio.as_ref(),
            TrackKind::Video => self.video.as_ref(),
        }
    }
}

/// Logs attach/detach; used by the headless CLI.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl MediaSink for TracingSink {
    fn attach(&self, track: RemoteTrack) {
        tracing::info!(
            target = "rcall::media",
            track_id = %track.id,
            stream_id = %track.stream_id,
            kind = ?track.kind,
            "remote track attached"
        );
    }

    fn detach(&self, track_id: &str) {
        tracing::info!(target = "rcall::media", track_id, "remote track detached");
    }
}
