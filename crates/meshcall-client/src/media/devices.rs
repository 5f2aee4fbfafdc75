use super::{LocalTrack, MediaError, MediaKind};
use async_trait::async_trait;
use std::collections::BTreeSet;
use std::sync::{Arc, Mutex};

pub(crate) const LOCAL_STREAM_ID: &str = "meshcall-local";

/// Which kinds of capture to open in one attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MediaRequest {
    pub audio: bool,
    pub video: bool,
}

impl MediaRequest {
    pub const AUDIO_VIDEO: MediaRequest = MediaRequest {
        audio: true,
        video: true,
    };
    pub const AUDIO_ONLY: MediaRequest = MediaRequest {
        audio: true,
        video: false,
    };
    pub const VIDEO_ONLY: MediaRequest = MediaRequest {
        audio: false,
        video: true,
    };

    pub fn kinds(&self) -> Vec<MediaKind> {
        MediaKind::ALL
            .into_iter()
            .filter(|kind| match kind {
                MediaKind::Audio => self.audio,
                MediaKind::Video => self.video,
            })
            .collect()
    }
}

/// Access to capture devices.
///
/// An acquisition either opens every requested kind or nothing.
#[async_trait]
pub trait MediaDevices: Send + Sync {
    async fn acquire(&self, request: MediaRequest) -> Result<Vec<LocalTrack>, MediaError>;

    /// Give the devices behind `tracks` back; the tracks stop producing.
    fn release(&self, tracks: &[Arc<LocalTrack>]);
}

/// Devices exposed as WebRTC sample tracks.
///
/// An external capture pipeline writes encoded samples into the tracks.
/// Which kinds exist is configured up front; a kind can only be open once.
pub struct TrackDevices {
    audio_available: bool,
    video_available: bool,
    in_use: Mutex<BTreeSet<MediaKind>>,
}

impl TrackDevices {
    pub fn new(audio_available: bool, video_available: bool) -> Self {
        Self {
            audio_available,
            video_available,
            in_use: Mutex::new(BTreeSet::new()),
        }
    }

    fn is_available(&self, kind: MediaKind) -> bool {
        match kind {
            MediaKind::Audio => self.audio_available,
            MediaKind::Video => self.video_available,
        }
    }
}

#[async_trait]
impl MediaDevices for TrackDevices {
    async fn acquire(&self, request: MediaRequest) -> Result<Vec<LocalTrack>, MediaError> {
        let kinds = request.kinds();
        if kinds.is_empty() {
            return Err(MediaError::other("no media kind requested"));
        }

        let mut in_use = self
            .in_use
            .lock()
            .map_err(|_| MediaError::other("device registry lock poisoned"))?;

        for kind in &kinds {
            if !self.is_available(*kind) {
                return Err(MediaError::not_found(format!("no {} input device", kind)));
            }
            if in_use.contains(kind) {
                return Err(MediaError::device_in_use(format!(
                    "{} device is already open",
                    kind
                )));
            }
        }

        let tracks = kinds
            .into_iter()
            .map(|kind| {
                in_use.insert(kind);
                LocalTrack::new(kind, &kind.to_string(), LOCAL_STREAM_ID)
            })
            .collect();

        Ok(tracks)
    }

    fn release(&self, tracks: &[Arc<LocalTrack>]) {
        let mut in_use = match self.in_use.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        for track in tracks {
            track.stop();
            in_use.remove(&track.kind());
        }
    }
}
