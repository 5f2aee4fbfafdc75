pub mod capture;
pub mod devices;
pub mod error;
pub mod local;

pub use capture::SystemDevices;
pub use devices::{MediaDevices, MediaRequest, TrackDevices};
pub use error::{MediaError, MediaErrorKind};
pub use local::{LocalMediaBootstrap, LocalMediaHandle, LocalTrack, TrackWriter};

use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum MediaKind {
    Audio,
    Video,
}

impl MediaKind {
    pub const ALL: [MediaKind; 2] = [MediaKind::Audio, MediaKind::Video];
}

impl fmt::Display for MediaKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MediaKind::Audio => write!(f, "audio"),
            MediaKind::Video => write!(f, "video"),
        }
    }
}
