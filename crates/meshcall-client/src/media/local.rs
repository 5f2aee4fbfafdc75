use super::{MediaDevices, MediaError, MediaKind, MediaRequest};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use webrtc::api::media_engine::{MIME_TYPE_OPUS, MIME_TYPE_VP8};
use webrtc::media::Sample;
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;

/// Write side of a local track, shared with whatever produces its samples
#[derive(Clone)]
pub struct TrackWriter {
    rtp: Arc<TrackLocalStaticSample>,
    enabled: Arc<AtomicBool>,
    stopped: Arc<AtomicBool>,
}

impl TrackWriter {
    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    /// Feed one encoded sample to all peers. Returns false when the track
    /// is disabled or stopped and the sample was dropped.
    pub async fn write_sample(&self, sample: &Sample) -> anyhow::Result<bool> {
        if self.is_stopped() || !self.enabled.load(Ordering::SeqCst) {
            return Ok(false);
        }
        self.rtp.write_sample(sample).await?;
        Ok(true)
    }
}

/// One captured track, sent to every peer
pub struct LocalTrack {
    kind: MediaKind,
    writer: TrackWriter,
}

impl LocalTrack {
    pub fn new(kind: MediaKind, id: &str, stream_id: &str) -> Self {
        let capability = match kind {
            MediaKind::Audio => RTCRtpCodecCapability {
                mime_type: MIME_TYPE_OPUS.to_owned(),
                clock_rate: 48000,
                channels: 2,
                sdp_fmtp_line: "minptime=10;useinbandfec=1".to_owned(),
                rtcp_feedback: vec![],
            },
            MediaKind::Video => RTCRtpCodecCapability {
                mime_type: MIME_TYPE_VP8.to_owned(),
                clock_rate: 90000,
                channels: 0,
                sdp_fmtp_line: String::new(),
                rtcp_feedback: vec![],
            },
        };

        Self {
            kind,
            writer: TrackWriter {
                rtp: Arc::new(TrackLocalStaticSample::new(
                    capability,
                    id.to_owned(),
                    stream_id.to_owned(),
                )),
                enabled: Arc::new(AtomicBool::new(true)),
                stopped: Arc::new(AtomicBool::new(false)),
            },
        }
    }

    pub fn kind(&self) -> MediaKind {
        self.kind
    }

    pub fn id(&self) -> &str {
        self.writer.rtp.id()
    }

    /// The sample track to attach to a peer connection
    pub fn rtp_track(&self) -> Arc<TrackLocalStaticSample> {
        self.writer.rtp.clone()
    }

    pub fn writer(&self) -> TrackWriter {
        self.writer.clone()
    }

    pub fn is_enabled(&self) -> bool {
        self.writer.enabled.load(Ordering::SeqCst)
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.writer.enabled.store(enabled, Ordering::SeqCst);
    }

    pub fn is_stopped(&self) -> bool {
        self.writer.is_stopped()
    }

    pub(crate) fn stop(&self) {
        self.writer.stopped.store(true, Ordering::SeqCst);
    }

    pub async fn write_sample(&self, sample: &Sample) -> anyhow::Result<bool> {
        self.writer.write_sample(sample).await
    }
}

impl fmt::Debug for LocalTrack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalTrack")
            .field("kind", &self.kind)
            .field("id", &self.id())
            .field("enabled", &self.is_enabled())
            .field("stopped", &self.is_stopped())
            .finish()
    }
}

/// Local capture shared read-only with every peer link.
///
/// Stopping (explicitly or on drop) hands the devices back.
pub struct LocalMediaHandle {
    tracks: Vec<Arc<LocalTrack>>,
    devices: Option<Arc<dyn MediaDevices>>,
    stopped: AtomicBool,
}

impl LocalMediaHandle {
    pub fn new(tracks: Vec<LocalTrack>, devices: Arc<dyn MediaDevices>) -> Self {
        Self {
            tracks: tracks.into_iter().map(Arc::new).collect(),
            devices: Some(devices),
            stopped: AtomicBool::new(false),
        }
    }

    /// No capture at all; peers still get receive-only media sections
    pub fn empty() -> Self {
        Self {
            tracks: Vec::new(),
            devices: None,
            stopped: AtomicBool::new(false),
        }
    }

    pub fn tracks(&self) -> &[Arc<LocalTrack>] {
        &self.tracks
    }

    pub fn track(&self, kind: MediaKind) -> Option<&Arc<LocalTrack>> {
        self.tracks.iter().find(|t| t.kind() == kind)
    }

    pub fn has_audio(&self) -> bool {
        self.track(MediaKind::Audio).is_some()
    }

    pub fn has_video(&self) -> bool {
        self.track(MediaKind::Video).is_some()
    }

    pub fn is_empty(&self) -> bool {
        self.tracks.is_empty()
    }

    pub fn is_muted(&self) -> bool {
        self.track(MediaKind::Audio)
            .map(|t| !t.is_enabled())
            .unwrap_or(true)
    }

    pub fn is_video_enabled(&self) -> bool {
        self.track(MediaKind::Video)
            .map(|t| t.is_enabled())
            .unwrap_or(false)
    }

    /// Flip the microphone. Returns the new muted state, or `None`
    /// without an audio track.
    pub fn toggle_mute(&self) -> Option<bool> {
        let track = self.track(MediaKind::Audio)?;
        let muted = track.is_enabled();
        track.set_enabled(!muted);
        tracing::info!("Microphone {}", if muted { "muted" } else { "unmuted" });
        Some(muted)
    }

    /// Flip the camera. Returns whether video is now enabled, or `None`
    /// without a video track.
    pub fn toggle_video(&self) -> Option<bool> {
        let track = self.track(MediaKind::Video)?;
        let enabled = !track.is_enabled();
        track.set_enabled(enabled);
        tracing::info!("Camera {}", if enabled { "enabled" } else { "disabled" });
        Some(enabled)
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    /// Release the devices. Idempotent.
    pub fn stop(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        match &self.devices {
            Some(devices) => devices.release(&self.tracks),
            None => self.tracks.iter().for_each(|t| t.stop()),
        }
        if !self.tracks.is_empty() {
            tracing::info!("Local media stopped");
        }
    }
}

impl Drop for LocalMediaHandle {
    fn drop(&mut self) {
        self.stop();
    }
}

impl fmt::Debug for LocalMediaHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalMediaHandle")
            .field("has_audio", &self.has_audio())
            .field("has_video", &self.has_video())
            .field("stopped", &self.is_stopped())
            .finish()
    }
}

/// Opens local capture with fallback: audio and video, then audio only,
/// then video only. When all three fail the error of the first attempt is
/// returned.
pub struct LocalMediaBootstrap {
    devices: Arc<dyn MediaDevices>,
}

impl LocalMediaBootstrap {
    const ATTEMPTS: [MediaRequest; 3] = [
        MediaRequest::AUDIO_VIDEO,
        MediaRequest::AUDIO_ONLY,
        MediaRequest::VIDEO_ONLY,
    ];

    pub fn new(devices: Arc<dyn MediaDevices>) -> Self {
        Self { devices }
    }

    pub async fn acquire(&self) -> Result<LocalMediaHandle, MediaError> {
        let mut first_error: Option<MediaError> = None;

        for request in Self::ATTEMPTS {
            match self.devices.acquire(request).await {
                Ok(tracks) => {
                    let handle = LocalMediaHandle::new(tracks, self.devices.clone());
                    if let Some(e) = &first_error {
                        tracing::warn!(
                            "Falling back to audio={} video={} after: {}",
                            handle.has_audio(),
                            handle.has_video(),
                            e
                        );
                    } else {
                        tracing::info!("Acquired audio and video");
                    }
                    return Ok(handle);
                }
                Err(e) => {
                    tracing::debug!("Media request {:?} failed: {}", request, e);
                    first_error.get_or_insert(e);
                }
            }
        }

        Err(first_error.unwrap_or_else(|| MediaError::other("no capture attempted")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::{MediaErrorKind, TrackDevices};
    use async_trait::async_trait;
    use std::sync::Mutex;

    /// Devices failing with a fixed error per request
    struct ScriptedDevices {
        audio_video: Option<MediaError>,
        audio_only: Option<MediaError>,
        video_only: Option<MediaError>,
        requests: Mutex<Vec<MediaRequest>>,
        released: AtomicBool,
    }

    impl ScriptedDevices {
        fn new(
            audio_video: Option<MediaError>,
            audio_only: Option<MediaError>,
            video_only: Option<MediaError>,
        ) -> Self {
            Self {
                audio_video,
                audio_only,
                video_only,
                requests: Mutex::new(Vec::new()),
                released: AtomicBool::new(false),
            }
        }
    }

    #[async_trait]
    impl MediaDevices for ScriptedDevices {
        async fn acquire(&self, request: MediaRequest) -> Result<Vec<LocalTrack>, MediaError> {
            self.requests.lock().unwrap().push(request);
            let outcome = match request {
                MediaRequest::AUDIO_VIDEO => &self.audio_video,
                MediaRequest::AUDIO_ONLY => &self.audio_only,
                _ => &self.video_only,
            };
            match outcome {
                Some(e) => Err(e.clone()),
                None => Ok(request
                    .kinds()
                    .into_iter()
                    .map(|k| LocalTrack::new(k, &k.to_string(), "test"))
                    .collect()),
            }
        }

        fn release(&self, tracks: &[Arc<LocalTrack>]) {
            tracks.iter().for_each(|t| t.stop());
            self.released.store(true, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn full_capture_on_first_attempt() {
        let devices = Arc::new(ScriptedDevices::new(None, None, None));
        let handle = LocalMediaBootstrap::new(devices.clone())
            .acquire()
            .await
            .unwrap();

        assert!(handle.has_audio());
        assert!(handle.has_video());
        assert_eq!(*devices.requests.lock().unwrap(), vec![MediaRequest::AUDIO_VIDEO]);
    }

    #[tokio::test]
    async fn falls_back_to_audio_only() {
        let devices = Arc::new(ScriptedDevices::new(
            Some(MediaError::not_found("no camera")),
            None,
            None,
        ));
        let handle = LocalMediaBootstrap::new(devices).acquire().await.unwrap();

        assert!(handle.has_audio());
        assert!(!handle.has_video());
    }

    #[tokio::test]
    async fn falls_back_to_video_only() {
        let devices = Arc::new(ScriptedDevices::new(
            Some(MediaError::device_in_use("mic busy")),
            Some(MediaError::device_in_use("mic busy")),
            None,
        ));
        let handle = LocalMediaBootstrap::new(devices.clone())
            .acquire()
            .await
            .unwrap();

        assert!(!handle.has_audio());
        assert!(handle.has_video());
        assert_eq!(devices.requests.lock().unwrap().len(), 3);
    }

    #[tokio::test]
    async fn total_failure_reports_first_error() {
        let devices = Arc::new(ScriptedDevices::new(
            Some(MediaError::permission_denied("denied")),
            Some(MediaError::not_found("no mic")),
            Some(MediaError::not_found("no camera")),
        ));
        let err = LocalMediaBootstrap::new(devices).acquire().await.unwrap_err();

        assert_eq!(err.kind, MediaErrorKind::PermissionDenied);
        assert_eq!(err.message, "denied");
        assert!(err.guidance().contains("denied"));
    }

    #[tokio::test]
    async fn no_devices_at_all_is_not_found() {
        let devices = Arc::new(TrackDevices::new(false, false));
        let err = LocalMediaBootstrap::new(devices).acquire().await.unwrap_err();
        assert_eq!(err.kind, MediaErrorKind::NotFound);
    }

    #[tokio::test]
    async fn toggles_flip_enabled_flags_without_reacquiring() {
        let devices = Arc::new(ScriptedDevices::new(None, None, None));
        let handle = LocalMediaBootstrap::new(devices.clone())
            .acquire()
            .await
            .unwrap();
        let audio = handle.track(MediaKind::Audio).unwrap().clone();

        assert!(!handle.is_muted());
        assert_eq!(handle.toggle_mute(), Some(true));
        assert!(handle.is_muted());
        assert!(!audio.is_enabled());
        assert_eq!(handle.toggle_mute(), Some(false));
        assert!(audio.is_enabled());

        assert_eq!(handle.toggle_video(), Some(false));
        assert!(!handle.is_video_enabled());
        assert_eq!(handle.toggle_video(), Some(true));

        // Same track object throughout, one acquisition
        assert!(Arc::ptr_eq(&audio, handle.track(MediaKind::Audio).unwrap()));
        assert_eq!(devices.requests.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn disabled_track_drops_samples() {
        let track = LocalTrack::new(MediaKind::Audio, "audio", "test");
        track.set_enabled(false);
        let written = track.write_sample(&Sample::default()).await.unwrap();
        assert!(!written);

        // Writers handed to capture share the flags
        let writer = track.writer();
        track.set_enabled(true);
        track.stop();
        assert!(writer.is_stopped());
        assert!(!writer.write_sample(&Sample::default()).await.unwrap());
    }

    #[test]
    fn toggles_without_tracks_report_none() {
        let handle = LocalMediaHandle::empty();
        assert!(handle.is_empty());
        assert_eq!(handle.toggle_mute(), None);
        assert_eq!(handle.toggle_video(), None);
        assert!(handle.is_muted());
    }

    #[tokio::test]
    async fn dropping_the_handle_releases_devices() {
        let devices = Arc::new(ScriptedDevices::new(None, None, None));
        let handle = LocalMediaBootstrap::new(devices.clone())
            .acquire()
            .await
            .unwrap();
        let video = handle.track(MediaKind::Video).unwrap().clone();

        drop(handle);
        assert!(devices.released.load(Ordering::SeqCst));
        assert!(video.is_stopped());
    }

    #[tokio::test]
    async fn stop_is_idempotent() {
        let devices = Arc::new(TrackDevices::new(true, true));
        let handle = LocalMediaBootstrap::new(devices.clone())
            .acquire()
            .await
            .unwrap();
        handle.stop();
        handle.stop();
        assert!(handle.is_stopped());

        // Devices are free again
        let again = LocalMediaBootstrap::new(devices).acquire().await.unwrap();
        assert!(again.has_audio() && again.has_video());
    }
}
