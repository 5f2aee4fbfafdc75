//! System capture devices
//!
//! The microphone is opened through cpal on a dedicated thread, which owns
//! the input stream and an Opus encoder and hands 20 ms packets to the audio
//! track. Video has no system backend here: the video track is fed by an
//! external pipeline, as with [`TrackDevices`].

use super::devices::LOCAL_STREAM_ID;
use super::{
    LocalTrack, MediaDevices, MediaError, MediaErrorKind, MediaKind, MediaRequest, TrackDevices,
    TrackWriter,
};
use async_trait::async_trait;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc as std_mpsc, Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use webrtc::media::Sample;

const OPUS_SAMPLE_RATE: u32 = 48000;
/// 20 ms of mono audio at 48 kHz
const FRAME_SAMPLES: usize = 960;
const FRAME_DURATION: Duration = Duration::from_millis(20);
const MAX_PACKET_BYTES: usize = 4000;
const PACKET_QUEUE: usize = 50;

/// Microphone through cpal, video through an external pipeline
pub struct SystemDevices {
    microphone_enabled: bool,
    /// Running flag of the open microphone thread
    microphone: Mutex<Option<Arc<AtomicBool>>>,
    external: TrackDevices,
}

impl SystemDevices {
    pub fn new(microphone_enabled: bool, external_video: bool) -> Self {
        Self {
            microphone_enabled,
            microphone: Mutex::new(None),
            external: TrackDevices::new(false, external_video),
        }
    }

    fn microphone_slot(&self) -> std::sync::MutexGuard<'_, Option<Arc<AtomicBool>>> {
        match self.microphone.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn close_microphone(&self) {
        if let Some(running) = self.microphone_slot().take() {
            running.store(false, Ordering::SeqCst);
        }
    }

    async fn open_microphone(&self) -> Result<LocalTrack, MediaError> {
        if !self.microphone_enabled {
            return Err(MediaError::not_found("microphone capture is disabled"));
        }

        let running = Arc::new(AtomicBool::new(true));
        {
            let mut slot = self.microphone_slot();
            if slot.is_some() {
                return Err(MediaError::device_in_use("microphone is already open"));
            }
            *slot = Some(running.clone());
        }

        let (ready_tx, ready_rx) = oneshot::channel();
        let (packet_tx, packet_rx) = mpsc::channel(PACKET_QUEUE);
        let thread_running = running.clone();
        let spawned = std::thread::Builder::new()
            .name("meshcall-microphone".to_string())
            .spawn(move || run_microphone(ready_tx, thread_running, packet_tx));

        let ready = match spawned {
            Ok(_) => ready_rx
                .await
                .unwrap_or_else(|_| Err(MediaError::other("capture thread ended during setup"))),
            Err(e) => Err(MediaError::other(format!("could not start capture thread: {}", e))),
        };
        if let Err(e) = ready {
            self.close_microphone();
            return Err(e);
        }

        let track = LocalTrack::new(MediaKind::Audio, "audio", LOCAL_STREAM_ID);
        tokio::spawn(forward_packets(track.writer(), packet_rx));
        Ok(track)
    }
}

#[async_trait]
impl MediaDevices for SystemDevices {
    async fn acquire(&self, request: MediaRequest) -> Result<Vec<LocalTrack>, MediaError> {
        if request.kinds().is_empty() {
            return Err(MediaError::other("no media kind requested"));
        }

        let mut tracks = Vec::new();
        if request.audio {
            tracks.push(self.open_microphone().await?);
        }
        if request.video {
            match self.external.acquire(MediaRequest::VIDEO_ONLY).await {
                Ok(video) => tracks.extend(video),
                Err(e) => {
                    if request.audio {
                        self.close_microphone();
                    }
                    tracks.iter().for_each(|t| t.stop());
                    return Err(e);
                }
            }
        }

        Ok(tracks)
    }

    fn release(&self, tracks: &[Arc<LocalTrack>]) {
        let (audio, video): (Vec<_>, Vec<_>) = tracks
            .iter()
            .cloned()
            .partition(|track| track.kind() == MediaKind::Audio);

        if !audio.is_empty() {
            audio.iter().for_each(|t| t.stop());
            self.close_microphone();
        }
        self.external.release(&video);
    }
}

/// Owns the cpal stream and the encoder until `running` is cleared
fn run_microphone(
    ready: oneshot::Sender<Result<(), MediaError>>,
    running: Arc<AtomicBool>,
    packets: mpsc::Sender<Vec<u8>>,
) {
    let (pcm_tx, pcm_rx) = std_mpsc::sync_channel::<Vec<f32>>(64);

    let stream = match open_input_stream(pcm_tx) {
        Ok(stream) => stream,
        Err(e) => {
            let _ = ready.send(Err(e));
            return;
        }
    };
    let mut encoder = match opus::Encoder::new(
        OPUS_SAMPLE_RATE,
        opus::Channels::Mono,
        opus::Application::Voip,
    ) {
        Ok(encoder) => encoder,
        Err(e) => {
            let _ = ready.send(Err(MediaError::other(format!("opus encoder: {}", e))));
            return;
        }
    };
    if ready.send(Ok(())).is_err() {
        return;
    }

    let mut framer = Framer::new(FRAME_SAMPLES);
    let mut packet = vec![0u8; MAX_PACKET_BYTES];
    while running.load(Ordering::SeqCst) {
        let chunk = match pcm_rx.recv_timeout(Duration::from_millis(100)) {
            Ok(chunk) => chunk,
            Err(std_mpsc::RecvTimeoutError::Timeout) => continue,
            Err(std_mpsc::RecvTimeoutError::Disconnected) => break,
        };
        for frame in framer.push(&chunk) {
            match encoder.encode_float(&frame, &mut packet) {
                Ok(len) => {
                    // A full queue means the track is not keeping up; drop
                    if packets.try_send(packet[..len].to_vec()).is_err() && packets.is_closed() {
                        running.store(false, Ordering::SeqCst);
                    }
                }
                Err(e) => tracing::warn!("Opus encoding failed: {}", e),
            }
        }
    }

    drop(stream);
    tracing::info!("Microphone closed");
}

fn open_input_stream(pcm: std_mpsc::SyncSender<Vec<f32>>) -> Result<cpal::Stream, MediaError> {
    let host = cpal::default_host();
    let device = host
        .default_input_device()
        .ok_or_else(|| MediaError::not_found("no default input device"))?;
    let name = device.name().unwrap_or_else(|_| "input device".to_string());

    let config = device
        .supported_input_configs()
        .map_err(configs_error)?
        .filter(|range| {
            matches!(range.sample_format(), cpal::SampleFormat::F32 | cpal::SampleFormat::I16)
                && range.min_sample_rate().0 <= OPUS_SAMPLE_RATE
                && range.max_sample_rate().0 >= OPUS_SAMPLE_RATE
        })
        .min_by_key(|range| range.channels())
        .map(|range| range.with_sample_rate(cpal::SampleRate(OPUS_SAMPLE_RATE)))
        .ok_or_else(|| MediaError::other(format!("{} has no 48 kHz input mode", name)))?;

    let channels = config.channels() as usize;
    let sample_format = config.sample_format();
    tracing::info!("Opening microphone {} ({} channels, {:?})", name, channels, sample_format);

    let on_error = |err: cpal::StreamError| tracing::error!("Audio capture error: {}", err);
    let stream = match sample_format {
        cpal::SampleFormat::I16 => device.build_input_stream(
            &config.into(),
            move |data: &[i16], _: &cpal::InputCallbackInfo| {
                let samples: Vec<f32> = data.iter().map(|s| *s as f32 / 32768.0).collect();
                let _ = pcm.try_send(downmix(&samples, channels));
            },
            on_error,
            None,
        ),
        _ => device.build_input_stream(
            &config.into(),
            move |data: &[f32], _: &cpal::InputCallbackInfo| {
                let _ = pcm.try_send(downmix(data, channels));
            },
            on_error,
            None,
        ),
    }
    .map_err(build_error)?;

    stream.play().map_err(play_error)?;
    Ok(stream)
}

async fn forward_packets(writer: TrackWriter, mut packets: mpsc::Receiver<Vec<u8>>) {
    while let Some(packet) = packets.recv().await {
        if writer.is_stopped() {
            break;
        }
        let sample = Sample {
            data: packet.into(),
            duration: FRAME_DURATION,
            ..Default::default()
        };
        if let Err(e) = writer.write_sample(&sample).await {
            tracing::debug!("Dropped audio sample: {}", e);
        }
    }
}

/// Average interleaved channels into mono
fn downmix(data: &[f32], channels: usize) -> Vec<f32> {
    if channels <= 1 {
        return data.to_vec();
    }
    data.chunks(channels)
        .map(|frame| frame.iter().sum::<f32>() / frame.len() as f32)
        .collect()
}

/// Cuts a sample stream into fixed-size encoder frames
struct Framer {
    size: usize,
    pending: Vec<f32>,
}

impl Framer {
    fn new(size: usize) -> Self {
        Self {
            size,
            pending: Vec::with_capacity(size),
        }
    }

    fn push(&mut self, samples: &[f32]) -> Vec<Vec<f32>> {
        let mut frames = Vec::new();
        for sample in samples {
            self.pending.push(*sample);
            if self.pending.len() == self.size {
                frames.push(std::mem::replace(
                    &mut self.pending,
                    Vec::with_capacity(self.size),
                ));
            }
        }
        frames
    }
}

/// Sort a backend's own error text into a category
fn classify_backend(description: &str) -> MediaErrorKind {
    let description = description.to_lowercase();
    if ["permission", "denied", "not authorized", "unauthorized"]
        .iter()
        .any(|needle| description.contains(needle))
    {
        MediaErrorKind::PermissionDenied
    } else if ["busy", "in use", "exclusive"]
        .iter()
        .any(|needle| description.contains(needle))
    {
        MediaErrorKind::DeviceInUse
    } else {
        MediaErrorKind::Other
    }
}

fn backend_error(err: cpal::BackendSpecificError) -> MediaError {
    MediaError::new(classify_backend(&err.description), err.description)
}

fn configs_error(err: cpal::SupportedStreamConfigsError) -> MediaError {
    match err {
        cpal::SupportedStreamConfigsError::DeviceNotAvailable => {
            MediaError::not_found("input device is no longer available")
        }
        cpal::SupportedStreamConfigsError::BackendSpecific { err } => backend_error(err),
        other => MediaError::other(other.to_string()),
    }
}

fn build_error(err: cpal::BuildStreamError) -> MediaError {
    match err {
        cpal::BuildStreamError::DeviceNotAvailable => {
            MediaError::device_in_use("input device is not available")
        }
        cpal::BuildStreamError::BackendSpecific { err } => backend_error(err),
        other => MediaError::other(other.to_string()),
    }
}

fn play_error(err: cpal::PlayStreamError) -> MediaError {
    match err {
        cpal::PlayStreamError::DeviceNotAvailable => {
            MediaError::device_in_use("input device is not available")
        }
        cpal::PlayStreamError::BackendSpecific { err } => backend_error(err),
    }
}
