use std::fmt;

/// Why local capture could not be opened
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaErrorKind {
    NotFound,
    PermissionDenied,
    DeviceInUse,
    Other,
}

impl MediaErrorKind {
    /// What the user can do about it
    pub fn guidance(&self) -> &'static str {
        match self {
            MediaErrorKind::NotFound => {
                "No camera or microphone was found. Connect a device and try again."
            }
            MediaErrorKind::PermissionDenied => {
                "Access to the camera or microphone was denied. Grant access in your system settings and try again."
            }
            MediaErrorKind::DeviceInUse => {
                "The camera or microphone is already in use. Close other applications using it and try again."
            }
            MediaErrorKind::Other => {
                "The camera or microphone could not be opened. Check your devices and try again."
            }
        }
    }
}

impl fmt::Display for MediaErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MediaErrorKind::NotFound => write!(f, "device not found"),
            MediaErrorKind::PermissionDenied => write!(f, "permission denied"),
            MediaErrorKind::DeviceInUse => write!(f, "device already in use"),
            MediaErrorKind::Other => write!(f, "media error"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{kind}: {message}")]
pub struct MediaError {
    pub kind: MediaErrorKind,
    pub message: String,
}

impl MediaError {
    pub fn new(kind: MediaErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(MediaErrorKind::NotFound, message)
    }

    pub fn permission_denied(message: impl Into<String>) -> Self {
        Self::new(MediaErrorKind::PermissionDenied, message)
    }

    pub fn device_in_use(message: impl Into<String>) -> Self {
        Self::new(MediaErrorKind::DeviceInUse, message)
    }

    pub fn other(message: impl Into<String>) -> Self {
        Self::new(MediaErrorKind::Other, message)
    }

    pub fn guidance(&self) -> &'static str {
        self.kind.guidance()
    }
}
