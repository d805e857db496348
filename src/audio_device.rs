//! Native media device: HTTP streaming, `symphonia` decoding and `cpal` output.
//!
//! A decode thread converts samples to the output format with `rubato` and appends them
//! to a shared window around the play head. The output callback only copies frames and
//! applies gain. Each load or restart bumps a generation counter so a superseded decode
//! thread stops at its next packet.

use std::collections::VecDeque;
use std::io::ErrorKind;
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;
use std::time::Duration;

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use log::{debug, error, info, warn};
use symphonia::core::audio::SampleBuffer;
use symphonia::core::codecs::DecoderOptions;
use symphonia::core::errors::Error as SymphoniaError;
use symphonia::core::formats::FormatOptions;
use symphonia::core::io::{MediaSourceStream, ReadOnlySource};
use symphonia::core::meta::MetadataOptions;
use symphonia::core::probe::Hint;
use tokio::sync::broadcast::Sender;

use crate::error::{DeviceError, PlayError};
use crate::media_transport::{DeviceEvent, LoadId, MediaDevice};
use crate::protocol::Message;
use crate::resample::FrameConverter;

const TIME_UPDATES_PER_SECOND: u32 = 4;
const PROGRESS_INTERVAL_SECS: f64 = 1.0;
/// Decoding pauses once this much audio is buffered ahead of the play head.
const MAX_AHEAD_SECS: u64 = 30;
/// Audio older than this behind the play head is dropped.
const KEEP_BEHIND_SECS: u64 = 15;
const BUFFER_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// What one output callback produced besides samples.
#[derive(Debug, Default, Clone, Copy, PartialEq)]
struct RenderOutcome {
    time_update: Option<f64>,
    ended: bool,
}

/// State shared by the engine thread, the decode thread and the output callback.
///
/// Frames are addressed by their absolute index in the output stream; `samples` holds the
/// window starting at `base_frame`.
#[derive(Debug)]
struct PlaybackBuffer {
    generation: u64,
    load_id: LoadId,
    has_source: bool,
    output_rate: u32,
    output_channels: usize,
    /// Interleaved at the output rate and channel count.
    samples: VecDeque<f32>,
    base_frame: u64,
    position: u64,
    duration: f64,
    decode_finished: bool,
    playing: bool,
    volume: f32,
    muted: bool,
    ended_reported: bool,
    frames_since_time_update: u32,
}

impl Default for PlaybackBuffer {
    fn default() -> Self {
        Self {
            generation: 0,
            load_id: 0,
            has_source: false,
            output_rate: 0,
            output_channels: 0,
            samples: VecDeque::new(),
            base_frame: 0,
            position: 0,
            duration: 0.0,
            decode_finished: false,
            playing: false,
            volume: 1.0,
            muted: false,
            ended_reported: false,
            frames_since_time_update: 0,
        }
    }
}

impl PlaybackBuffer {
    fn reset_source(&mut self) {
        self.generation += 1;
        self.has_source = false;
        self.samples = VecDeque::new();
        self.base_frame = 0;
        self.position = 0;
        self.duration = 0.0;
        self.decode_finished = false;
        self.playing = false;
        self.ended_reported = false;
        self.frames_since_time_update = 0;
    }

    fn buffered_frames(&self) -> u64 {
        if self.output_channels == 0 {
            0
        } else {
            (self.samples.len() / self.output_channels) as u64
        }
    }

    fn end_frame(&self) -> u64 {
        self.base_frame + self.buffered_frames()
    }

    fn frames_to_secs(&self, frames: u64) -> f64 {
        if self.output_rate == 0 {
            0.0
        } else {
            frames as f64 / self.output_rate as f64
        }
    }

    fn position_secs(&self) -> f64 {
        self.frames_to_secs(self.position)
    }

    fn wants_more(&self) -> bool {
        let ahead = self.end_frame().saturating_sub(self.position);
        ahead < MAX_AHEAD_SECS * self.output_rate as u64
    }

    /// Appends converted frames and drops whatever fell too far behind the play head.
    fn append(&mut self, samples: &[f32]) {
        self.samples.extend(samples.iter().copied());

        let keep = KEEP_BEHIND_SECS * self.output_rate as u64;
        let oldest_kept = self.position.saturating_sub(keep);
        if oldest_kept > self.base_frame {
            let stale = (oldest_kept - self.base_frame).min(self.buffered_frames());
            self.samples.drain(..stale as usize * self.output_channels);
            self.base_frame += stale;
        }
    }

    /// Moves the play head. Returns the new generation when the target lies before the
    /// buffered window and decoding has to start over.
    fn seek_frame(&mut self, frame: u64) -> Option<u64> {
        self.position = frame;
        self.ended_reported = false;
        self.frames_since_time_update = 0;
        if frame >= self.base_frame {
            return None;
        }
        self.generation += 1;
        self.samples.clear();
        self.base_frame = frame;
        self.decode_finished = false;
        Some(self.generation)
    }

    /// Copies buffered frames into `output` with gain applied. Underruns render silence;
    /// running past the end of a finished decode reports `ended` exactly once.
    fn render(&mut self, output: &mut [f32]) -> RenderOutcome {
        output.fill(0.0);
        let mut outcome = RenderOutcome::default();
        let channels = self.output_channels;
        if !self.playing || channels == 0 || self.output_rate == 0 {
            return outcome;
        }

        let gain = if self.muted { 0.0 } else { self.volume };
        let end = self.end_frame();

        for frame in output.chunks_mut(channels) {
            if self.position >= end || self.position < self.base_frame {
                if self.decode_finished && self.position >= end && !self.ended_reported {
                    self.ended_reported = true;
                    self.playing = false;
                    outcome.ended = true;
                }
                break;
            }
            let offset = (self.position - self.base_frame) as usize * channels;
            for (channel, sample) in frame.iter_mut().enumerate() {
                *sample = self.samples[offset + channel] * gain;
            }
            self.position += 1;
            self.frames_since_time_update += 1;
        }

        if !outcome.ended
            && self.frames_since_time_update >= self.output_rate / TIME_UPDATES_PER_SECOND
        {
            self.frames_since_time_update = 0;
            outcome.time_update = Some(self.position_secs());
        }
        outcome
    }
}

fn lock(shared: &Mutex<PlaybackBuffer>) -> MutexGuard<'_, PlaybackBuffer> {
    match shared.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

fn publish(bus_producer: &Sender<Message>, load: LoadId, outcome: RenderOutcome) {
    if let Some(seconds) = outcome.time_update {
        let _ = bus_producer.send(Message::Device(load, DeviceEvent::TimeUpdate(seconds)));
    }
    if outcome.ended {
        let _ = bus_producer.send(Message::Device(load, DeviceEvent::Ended));
    }
}

fn render_output<T: Copy>(
    output: &mut [T],
    scratch: &mut Vec<f32>,
    shared: &Mutex<PlaybackBuffer>,
    bus_producer: &Sender<Message>,
    convert: impl Fn(f32) -> T,
) {
    scratch.resize(output.len(), 0.0);
    let (outcome, load) = {
        let mut shared = lock(shared);
        (shared.render(scratch), shared.load_id)
    };
    for (target, sample) in output.iter_mut().zip(scratch.iter()) {
        *target = convert(sample.clamp(-1.0, 1.0));
    }
    publish(bus_producer, load, outcome);
}

/// File extension in the last URL path segment, used as a probe hint.
fn extension_hint(url: &str) -> Option<&str> {
    let path = url.split(['?', '#']).next().unwrap_or(url);
    let segment = path.rsplit('/').next()?;
    let (_, extension) = segment.rsplit_once('.')?;
    (!extension.is_empty()
        && extension.len() <= 5
        && extension.chars().all(|c| c.is_ascii_alphanumeric()))
    .then_some(extension)
}

/// Drops the first `skip_remaining` frames of a stream, one block at a time.
fn skip_frames<'a>(samples: &'a [f32], channels: usize, skip_remaining: &mut u64) -> &'a [f32] {
    if channels == 0 {
        return &[];
    }
    let frames = (samples.len() / channels) as u64;
    let skipped = (*skip_remaining).min(frames);
    *skip_remaining -= skipped;
    &samples[skipped as usize * channels..]
}

/// Streams a URL through `symphonia` into the shared buffer until the source ends or a
/// newer load or seek supersedes `generation`.
struct DecodeJob {
    url: String,
    generation: u64,
    load: LoadId,
    /// Output frames to discard before appending, for restarts after a backward seek.
    skip_frames: u64,
    announce_metadata: bool,
    http_client: ureq::Agent,
    shared: Arc<Mutex<PlaybackBuffer>>,
    bus_producer: Sender<Message>,
}

impl DecodeJob {
    fn is_current(&self) -> bool {
        lock(&self.shared).generation == self.generation
    }

    fn send(&self, event: DeviceEvent) {
        if self.is_current() {
            let _ = self.bus_producer.send(Message::Device(self.load, event));
        }
    }

    fn fail(&self, message: String) {
        if self.is_current() {
            error!("AudioDevice: {}", message);
            self.send(DeviceEvent::Error(message));
        }
    }

    /// Blocks while the window ahead of the play head is full. Returns false once superseded.
    fn wait_for_room(&self) -> bool {
        loop {
            {
                let shared = lock(&self.shared);
                if shared.generation != self.generation {
                    return false;
                }
                if shared.wants_more() {
                    return true;
                }
            }
            thread::sleep(BUFFER_POLL_INTERVAL);
        }
    }

    /// Appends converted output after the skip. Returns false once superseded.
    fn append(&self, converted: &[f32], channels: usize, skip_remaining: &mut u64) -> bool {
        let kept = skip_frames(converted, channels, skip_remaining);
        let mut shared = lock(&self.shared);
        if shared.generation != self.generation {
            return false;
        }
        if !kept.is_empty() {
            shared.append(kept);
        }
        true
    }

    fn run(self) {
        let response = match self.http_client.get(&self.url).call() {
            Ok(response) => response,
            Err(err) => {
                self.fail(format!("failed to open stream {}: {}", self.url, err));
                return;
            }
        };
        let source = ReadOnlySource::new(response.into_reader());
        let media_source = MediaSourceStream::new(Box::new(source), Default::default());

        let mut hint = Hint::new();
        if let Some(extension) = extension_hint(&self.url) {
            hint.with_extension(extension);
        }

        let mut probed = match symphonia::default::get_probe().format(
            &hint,
            media_source,
            &FormatOptions::default(),
            &MetadataOptions::default(),
        ) {
            Ok(probed) => probed,
            Err(err) => {
                self.fail(format!("failed to probe {}: {}", self.url, err));
                return;
            }
        };

        let Some(track) = probed.format.default_track() else {
            self.fail(format!("no playable track in {}", self.url));
            return;
        };
        let track_id = track.id;
        let sample_rate = track.codec_params.sample_rate.unwrap_or(44_100);
        let channels = track
            .codec_params
            .channels
            .map(|channels| channels.count())
            .unwrap_or(2);
        let duration = track
            .codec_params
            .n_frames
            .map(|frames| frames as f64 / sample_rate as f64)
            .unwrap_or(0.0);

        let mut decoder = match symphonia::default::get_codecs()
            .make(&track.codec_params, &DecoderOptions::default())
        {
            Ok(decoder) => decoder,
            Err(err) => {
                self.fail(format!("failed to create decoder: {}", err));
                return;
            }
        };

        let (output_rate, output_channels) = {
            let mut shared = lock(&self.shared);
            if shared.generation != self.generation {
                return;
            }
            if self.announce_metadata {
                shared.duration = duration;
            }
            (shared.output_rate, shared.output_channels)
        };
        if output_rate == 0 || output_channels == 0 {
            self.fail("no output stream to decode for".to_string());
            return;
        }
        let mut converter =
            match FrameConverter::new(sample_rate, channels, output_rate, output_channels) {
                Ok(converter) => converter,
                Err(err) => {
                    self.fail(err.to_string());
                    return;
                }
            };
        debug!(
            "AudioDevice: stream info sample_rate={}, channels={}, duration={:.1}s, output {} Hz",
            sample_rate, channels, duration, output_rate
        );
        if self.announce_metadata {
            self.send(DeviceEvent::MetadataLoaded { duration });
        }

        let mut skip_remaining = self.skip_frames;
        let mut produced_frames: u64 = 0;
        let mut secs_since_progress = 0.0;
        loop {
            if !self.wait_for_room() {
                return;
            }
            let packet = match probed.format.next_packet() {
                Ok(packet) => packet,
                Err(SymphoniaError::IoError(err)) if err.kind() == ErrorKind::UnexpectedEof => {
                    break;
                }
                Err(err) => {
                    self.fail(format!("stream read failed: {}", err));
                    return;
                }
            };
            if packet.track_id() != track_id {
                continue;
            }

            match decoder.decode(&packet) {
                Ok(decoded) => {
                    let spec = *decoded.spec();
                    let mut sample_buffer =
                        SampleBuffer::<f32>::new(decoded.capacity() as u64, spec);
                    sample_buffer.copy_interleaved_ref(decoded);

                    let converted = match converter.push(sample_buffer.samples()) {
                        Ok(converted) => converted,
                        Err(err) => {
                            self.fail(err.to_string());
                            return;
                        }
                    };
                    let frames = (converted.len() / output_channels) as u64;
                    produced_frames += frames;
                    if !self.append(&converted, output_channels, &mut skip_remaining) {
                        return;
                    }

                    secs_since_progress += frames as f64 / output_rate as f64;
                    if secs_since_progress >= PROGRESS_INTERVAL_SECS {
                        secs_since_progress = 0.0;
                        self.send(DeviceEvent::Progress);
                    }
                }
                Err(SymphoniaError::DecodeError(err)) => {
                    warn!("AudioDevice: skipping undecodable packet: {}", err);
                }
                Err(err) => {
                    self.fail(format!("decode failed: {}", err));
                    return;
                }
            }
        }

        match converter.finish() {
            Ok(tail) => {
                produced_frames += (tail.len() / output_channels) as u64;
                if !self.append(&tail, output_channels, &mut skip_remaining) {
                    return;
                }
            }
            Err(err) => warn!("AudioDevice: dropping resampler tail: {}", err),
        }

        let decoded_secs = produced_frames as f64 / output_rate as f64;
        {
            let mut shared = lock(&self.shared);
            if shared.generation != self.generation {
                return;
            }
            shared.decode_finished = true;
        }
        info!("AudioDevice: finished decoding {:.1}s from {}", decoded_secs, self.url);
        self.send(DeviceEvent::Progress);
        if self.announce_metadata && duration <= 0.0 && decoded_secs > 0.0 {
            lock(&self.shared).duration = decoded_secs;
            self.send(DeviceEvent::MetadataLoaded {
                duration: decoded_secs,
            });
        }
    }
}

/// [`MediaDevice`] backed by the default `cpal` output device.
pub struct StreamingAudioDevice {
    shared: Arc<Mutex<PlaybackBuffer>>,
    bus_producer: Sender<Message>,
    http_client: ureq::Agent,
    stream: Option<cpal::Stream>,
    url: Option<String>,
}

impl StreamingAudioDevice {
    pub fn new(
        bus_producer: Sender<Message>,
        connect_timeout: Duration,
    ) -> Result<Self, DeviceError> {
        let shared = Arc::new(Mutex::new(PlaybackBuffer::default()));
        let stream = Self::open_output(Arc::clone(&shared), bus_producer.clone())?;
        let http_client = ureq::AgentBuilder::new()
            .timeout_connect(connect_timeout)
            .build();
        Ok(Self {
            shared,
            bus_producer,
            http_client,
            stream: Some(stream),
            url: None,
        })
    }

    fn open_output(
        shared: Arc<Mutex<PlaybackBuffer>>,
        bus_producer: Sender<Message>,
    ) -> Result<cpal::Stream, DeviceError> {
        let host = cpal::default_host();
        let device = host
            .default_output_device()
            .ok_or(DeviceError::NoOutputDevice)?;
        let supported = device
            .default_output_config()
            .map_err(|err| DeviceError::OutputConfig(err.to_string()))?;
        let sample_format = supported.sample_format();
        let config = supported.config();
        {
            let mut shared = lock(&shared);
            shared.output_channels = config.channels as usize;
            shared.output_rate = config.sample_rate.0;
        }
        info!(
            "AudioDevice: output {} Hz, {} channels, {:?}",
            config.sample_rate.0, config.channels, sample_format
        );

        let mut scratch: Vec<f32> = Vec::new();
        let stream = match sample_format {
            cpal::SampleFormat::F32 => device.build_output_stream(
                &config,
                move |output: &mut [f32], _: &cpal::OutputCallbackInfo| {
                    render_output(output, &mut scratch, &shared, &bus_producer, |sample| sample);
                },
                |err| error!("AudioDevice: output stream error: {}", err),
                None,
            ),
            cpal::SampleFormat::I16 => device.build_output_stream(
                &config,
                move |output: &mut [i16], _: &cpal::OutputCallbackInfo| {
                    render_output(output, &mut scratch, &shared, &bus_producer, |sample| {
                        (sample * i16::MAX as f32) as i16
                    });
                },
                |err| error!("AudioDevice: output stream error: {}", err),
                None,
            ),
            cpal::SampleFormat::U16 => device.build_output_stream(
                &config,
                move |output: &mut [u16], _: &cpal::OutputCallbackInfo| {
                    render_output(output, &mut scratch, &shared, &bus_producer, |sample| {
                        ((sample * 0.5 + 0.5) * u16::MAX as f32) as u16
                    });
                },
                |err| error!("AudioDevice: output stream error: {}", err),
                None,
            ),
            other => {
                return Err(DeviceError::OutputConfig(format!(
                    "unsupported output sample format {:?}",
                    other
                )))
            }
        }
        .map_err(|err| DeviceError::Stream(err.to_string()))?;

        stream
            .play()
            .map_err(|err| DeviceError::Stream(err.to_string()))?;
        Ok(stream)
    }

    fn shared(&self) -> MutexGuard<'_, PlaybackBuffer> {
        lock(&self.shared)
    }

    fn spawn_decode(
        &self,
        generation: u64,
        load: LoadId,
        skip_frames: u64,
        announce_metadata: bool,
    ) {
        let Some(url) = self.url.clone() else {
            return;
        };
        let job = DecodeJob {
            url,
            generation,
            load,
            skip_frames,
            announce_metadata,
            http_client: self.http_client.clone(),
            shared: Arc::clone(&self.shared),
            bus_producer: self.bus_producer.clone(),
        };
        let spawned = thread::Builder::new()
            .name("audio-decode".to_string())
            .spawn(move || job.run());
        if let Err(err) = spawned {
            let message = format!("failed to spawn decode thread: {}", err);
            error!("AudioDevice: {}", message);
            let _ = self
                .bus_producer
                .send(Message::Device(load, DeviceEvent::Error(message)));
        }
    }

    /// Moves the play head, restarting the decode when the target was already dropped.
    fn seek_frame(&self, frame: u64) {
        let (restart, load) = {
            let mut shared = self.shared();
            (shared.seek_frame(frame), shared.load_id)
        };
        if let Some(generation) = restart {
            debug!(
                "AudioDevice: frame {} is behind the buffered window, restarting decode",
                frame
            );
            self.spawn_decode(generation, load, frame, false);
        }
    }
}

impl MediaDevice for StreamingAudioDevice {
    fn load(&mut self, url: &str, load: LoadId) {
        let generation = {
            let mut shared = self.shared();
            shared.reset_source();
            shared.has_source = true;
            shared.load_id = load;
            shared.generation
        };
        debug!("AudioDevice: loading {} (load {})", url, load);
        self.url = Some(url.to_string());
        self.spawn_decode(generation, load, 0, true);
    }

    fn play(&mut self) -> Result<(), PlayError> {
        if self.stream.is_none() {
            return Err(PlayError::NotAllowed("audio output released".to_string()));
        }
        let ended = {
            let shared = self.shared();
            if !shared.has_source {
                return Err(PlayError::NoSource);
            }
            shared.ended_reported
        };
        if ended {
            self.seek_frame(0);
        }
        self.shared().playing = true;
        Ok(())
    }

    fn pause(&mut self) {
        self.shared().playing = false;
    }

    fn set_current_time(&mut self, seconds: f64) {
        let frame = {
            let shared = self.shared();
            let seconds = if shared.duration > 0.0 {
                seconds.clamp(0.0, shared.duration)
            } else {
                seconds.max(0.0)
            };
            (seconds * shared.output_rate as f64).round() as u64
        };
        self.seek_frame(frame);
    }

    fn set_volume(&mut self, volume: f32) {
        self.shared().volume = volume.clamp(0.0, 1.0);
    }

    fn set_muted(&mut self, muted: bool) {
        self.shared().muted = muted;
    }

    fn current_time(&self) -> f64 {
        self.shared().position_secs()
    }

    fn duration(&self) -> f64 {
        self.shared().duration
    }

    fn buffered(&self) -> Vec<(f64, f64)> {
        let shared = self.shared();
        if shared.buffered_frames() > 0 {
            vec![(
                shared.frames_to_secs(shared.base_frame),
                shared.frames_to_secs(shared.end_frame()),
            )]
        } else {
            Vec::new()
        }
    }

    fn release(&mut self) {
        self.shared().reset_source();
        self.stream = None;
        self.url = None;
        debug!("AudioDevice: released output stream");
    }
}
