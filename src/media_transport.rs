//! Playback state machine wrapped around one native media device.
//!
//! The transport owns the device, mirrors its state into observable fields and applies
//! the playback policy: deferred autoplay, seek debounce, volume clamping, benign play
//! rejections and repeat-on-end. Natural end of a track with repeat off is reported only
//! through the injected `on_track_finished` callback.

use std::time::{Duration, Instant};

use log::{debug, error, info};

use crate::config::{BackendConfig, PlaybackConfig};
use crate::error::PlayError;
use crate::media_session::{MediaSession, SessionMetadata, SessionPlayback};
use crate::model::Track;
use crate::observable::{Subject, SubscriptionId};
use crate::playlist_navigator::PlaybackTarget;

/// Identifies one `set_source` load. Device events carry the id of the load they
/// belong to so events queued for a replaced source can be dropped.
pub type LoadId = u64;

/// Native audio element abstraction.
///
/// Calls return immediately; progress, metadata, end-of-track and asynchronous play
/// rejections are reported back as [`DeviceEvent`]s on the bus, tagged with the
/// [`LoadId`] given to `load`.
pub trait MediaDevice {
    fn load(&mut self, url: &str, load: LoadId);
    fn play(&mut self) -> Result<(), PlayError>;
    fn pause(&mut self);
    fn set_current_time(&mut self, seconds: f64);
    fn set_volume(&mut self, volume: f32);
    fn set_muted(&mut self, muted: bool);
    fn current_time(&self) -> f64;
    fn duration(&self) -> f64;
    /// Raw buffered ranges in seconds, in whatever shape the device reports them.
    fn buffered(&self) -> Vec<(f64, f64)>;
    /// Stops output and drops event delivery.
    fn release(&mut self);
}

/// Notifications emitted by a [`MediaDevice`].
#[derive(Debug, Clone, PartialEq)]
pub enum DeviceEvent {
    MetadataLoaded { duration: f64 },
    TimeUpdate(f64),
    /// More of the source has been buffered; re-read [`MediaDevice::buffered`].
    Progress,
    Play,
    Pause,
    Ended,
    Error(String),
    PlayRejected(PlayError),
}

/// Half-open `[start, end)` buffered span in seconds.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BufferedRange {
    pub start: f64,
    pub end: f64,
}

/// Observable transport outputs.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    CurrentTime(f64),
    Duration(f64),
    Playing(bool),
    Volume(f32),
    Muted(bool),
    Repeat(bool),
    Buffered(Vec<BufferedRange>),
}

/// Point-in-time read of the transport fields.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TransportSnapshot {
    pub current_time: f64,
    pub duration: f64,
    pub playing: bool,
    pub volume: f32,
    pub muted: bool,
    pub repeat: bool,
}

/// Maps a track to the URLs the device and the media session need.
pub trait SourceResolver {
    fn stream_url(&self, track: &Track) -> String;
    fn artwork_url(&self, track: &Track) -> Option<String>;
}

impl SourceResolver for BackendConfig {
    fn stream_url(&self, track: &Track) -> String {
        BackendConfig::stream_url(self, track.id)
    }

    fn artwork_url(&self, track: &Track) -> Option<String> {
        track
            .cover_url
            .as_deref()
            .or(track.cover_thumb_url.as_deref())
            .map(|path| BackendConfig::artwork_url(self, path))
    }
}

/// Drops a seek that lands close to both the previous applied seek (in time) and the
/// current position (in media time).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SeekDebounce {
    pub min_interval: Duration,
    pub window_secs: f64,
}

impl SeekDebounce {
    pub fn from_config(config: &PlaybackConfig) -> Self {
        Self {
            min_interval: Duration::from_millis(config.seek_debounce_ms),
            window_secs: config.seek_debounce_window_secs,
        }
    }
}

impl Default for SeekDebounce {
    fn default() -> Self {
        Self {
            min_interval: Duration::from_millis(100),
            window_secs: 1.0,
        }
    }
}

/// Merges raw device ranges into sorted, disjoint spans. Empty, inverted and
/// non-finite ranges are discarded.
pub fn normalize_ranges(raw: &[(f64, f64)]) -> Vec<BufferedRange> {
    let mut ranges: Vec<BufferedRange> = raw
        .iter()
        .filter(|(start, end)| start.is_finite() && end.is_finite() && end > start)
        .map(|&(start, end)| BufferedRange {
            start: start.max(0.0),
            end,
        })
        .filter(|range| range.end > range.start)
        .collect();
    ranges.sort_by(|a, b| a.start.total_cmp(&b.start));

    let mut merged: Vec<BufferedRange> = Vec::with_capacity(ranges.len());
    for range in ranges {
        match merged.last_mut() {
            Some(last) if range.start <= last.end => {
                last.end = last.end.max(range.end);
            }
            _ => merged.push(range),
        }
    }
    merged
}

pub struct MediaTransport<D: MediaDevice> {
    device: D,
    resolver: Box<dyn SourceResolver>,
    session: Box<dyn MediaSession>,
    on_track_finished: Box<dyn FnMut()>,
    seek_debounce: SeekDebounce,
    events: Subject<TransportEvent>,

    source_url: Option<String>,
    load: LoadId,
    session_metadata: Option<SessionMetadata>,
    current_time: f64,
    duration: f64,
    buffered: Vec<BufferedRange>,
    playing: bool,
    volume: f32,
    muted: bool,
    repeat: bool,

    pending_autoplay: bool,
    pending_start_position: Option<f64>,
    last_applied_seek: Option<Instant>,
    torn_down: bool,
}

impl<D: MediaDevice> MediaTransport<D> {
    pub fn new(
        mut device: D,
        resolver: Box<dyn SourceResolver>,
        session: Box<dyn MediaSession>,
        config: &PlaybackConfig,
        on_track_finished: Box<dyn FnMut()>,
    ) -> Self {
        let volume = if config.initial_volume.is_finite() {
            config.initial_volume.clamp(0.0, 1.0)
        } else {
            1.0
        };
        device.set_volume(volume);
        device.set_muted(false);

        Self {
            device,
            resolver,
            session,
            on_track_finished,
            seek_debounce: SeekDebounce::from_config(config),
            events: Subject::new(),
            source_url: None,
            load: 0,
            session_metadata: None,
            current_time: 0.0,
            duration: 0.0,
            buffered: Vec::new(),
            playing: false,
            volume,
            muted: false,
            repeat: false,
            pending_autoplay: false,
            pending_start_position: None,
            last_applied_seek: None,
            torn_down: false,
        }
    }

    pub fn subscribe<F>(&mut self, observer: F) -> SubscriptionId
    where
        F: FnMut(&TransportEvent) + 'static,
    {
        self.events.subscribe(observer)
    }

    pub fn unsubscribe(&mut self, id: SubscriptionId) -> bool {
        self.events.unsubscribe(id)
    }

    pub fn snapshot(&self) -> TransportSnapshot {
        TransportSnapshot {
            current_time: self.current_time,
            duration: self.duration,
            playing: self.playing,
            volume: self.volume,
            muted: self.muted,
            repeat: self.repeat,
        }
    }

    pub fn current_time(&self) -> f64 {
        self.current_time
    }

    pub fn duration(&self) -> f64 {
        self.duration
    }

    pub fn is_playing(&self) -> bool {
        self.playing
    }

    pub fn volume(&self) -> f32 {
        self.volume
    }

    pub fn is_muted(&self) -> bool {
        self.muted
    }

    pub fn is_repeat(&self) -> bool {
        self.repeat
    }

    pub fn buffered(&self) -> &[BufferedRange] {
        &self.buffered
    }

    pub fn source_url(&self) -> Option<&str> {
        self.source_url.as_deref()
    }

    /// Loads `track` unless it is already the loaded source. Returns whether a load
    /// happened. With `autoplay`, playback starts once the device reports metadata.
    pub fn set_source(&mut self, track: Option<&Track>, autoplay: bool) -> bool {
        if self.torn_down {
            return false;
        }
        let Some(track) = track else {
            return false;
        };
        let url = self.resolver.stream_url(track);
        if self.source_url.as_deref() == Some(url.as_str()) {
            return false;
        }

        debug!(
            "MediaTransport: loading track {} ({}) autoplay={}",
            track.id,
            track.display_name(),
            autoplay
        );
        self.pending_autoplay = autoplay;
        self.pending_start_position = None;
        self.last_applied_seek = None;
        self.update_current_time(0.0);
        self.update_buffered(Vec::new());
        self.update_duration(track.duration.max(0.0));
        self.update_playing(false);

        self.load += 1;
        self.device.load(&url, self.load);
        self.source_url = Some(url);

        let metadata = SessionMetadata {
            title: track.title.clone(),
            artist: track.artist.clone(),
            artwork_url: self.resolver.artwork_url(track),
            duration: (track.duration > 0.0).then_some(track.duration),
        };
        self.session.set_metadata(&metadata);
        self.session_metadata = Some(metadata);
        true
    }

    /// Starts playback at `seconds` once the next source reports its metadata.
    pub fn restore_position(&mut self, seconds: f64) {
        if seconds.is_finite() && seconds > 0.0 {
            self.pending_start_position = Some(seconds);
        }
    }

    pub fn play(&mut self) {
        if self.torn_down {
            return;
        }
        if self.source_url.is_none() {
            self.handle_play_failure(PlayError::NoSource);
            return;
        }
        match self.device.play() {
            Ok(()) => self.update_playing(true),
            Err(err) => self.handle_play_failure(err),
        }
    }

    pub fn pause(&mut self) {
        if self.torn_down {
            return;
        }
        self.pending_autoplay = false;
        self.device.pause();
        self.update_playing(false);
    }

    pub fn toggle_play(&mut self) {
        if self.playing {
            self.pause();
        } else {
            self.play();
        }
    }

    pub fn seek(&mut self, time_seconds: f64) {
        self.seek_at(time_seconds, Instant::now());
    }

    pub(crate) fn seek_at(&mut self, time_seconds: f64, now: Instant) {
        if self.torn_down || !time_seconds.is_finite() {
            return;
        }
        if let Some(last) = self.last_applied_seek {
            let recent = now.saturating_duration_since(last) < self.seek_debounce.min_interval;
            let nearby = (time_seconds - self.current_time).abs() < self.seek_debounce.window_secs;
            if recent && nearby {
                debug!("MediaTransport: dropped seek to {:.2}s", time_seconds);
                return;
            }
        }
        self.last_applied_seek = Some(now);
        self.apply_seek(time_seconds);
    }

    /// Volume is clamped to `[0, 1]`; non-finite input is ignored. Mute is untouched.
    pub fn set_volume(&mut self, volume: f32) {
        if self.torn_down || !volume.is_finite() {
            return;
        }
        let volume = volume.clamp(0.0, 1.0);
        self.device.set_volume(volume);
        if self.volume != volume {
            self.volume = volume;
            self.events.notify(&TransportEvent::Volume(volume));
        }
    }

    pub fn set_muted(&mut self, muted: bool) {
        if self.torn_down {
            return;
        }
        self.device.set_muted(muted);
        if self.muted != muted {
            self.muted = muted;
            self.events.notify(&TransportEvent::Muted(muted));
        }
    }

    pub fn toggle_mute(&mut self) {
        self.set_muted(!self.muted);
    }

    pub fn set_repeat(&mut self, repeat: bool) {
        if self.repeat != repeat {
            self.repeat = repeat;
            self.events.notify(&TransportEvent::Repeat(repeat));
        }
    }

    pub fn toggle_repeat(&mut self) {
        self.set_repeat(!self.repeat);
    }

    /// Id of the current source; events tagged with any other id are stale.
    pub fn current_load(&self) -> LoadId {
        self.load
    }

    pub fn handle_device_event(&mut self, load: LoadId, event: DeviceEvent) {
        if self.torn_down {
            return;
        }
        if load != self.load {
            debug!(
                "MediaTransport: dropping {:?} from replaced load {} (current {})",
                event, load, self.load
            );
            return;
        }
        match event {
            DeviceEvent::MetadataLoaded { duration } => {
                if duration.is_finite() && duration > 0.0 {
                    self.update_duration(duration);
                    if let Some(metadata) = self.session_metadata.as_mut() {
                        metadata.duration = Some(duration);
                        self.session.set_metadata(metadata);
                    }
                }
                if let Some(position) = self.pending_start_position.take() {
                    debug!("MediaTransport: restoring position {:.2}s", position);
                    self.apply_seek(position);
                }
                if std::mem::take(&mut self.pending_autoplay) {
                    self.play();
                }
            }
            DeviceEvent::TimeUpdate(seconds) => {
                if seconds.is_finite() {
                    self.update_current_time(seconds);
                }
            }
            DeviceEvent::Progress => {
                let ranges = normalize_ranges(&self.device.buffered());
                self.update_buffered(ranges);
            }
            DeviceEvent::Play => self.update_playing(true),
            DeviceEvent::Pause => self.update_playing(false),
            DeviceEvent::Ended => self.handle_ended(),
            DeviceEvent::Error(message) => {
                error!("MediaTransport: device error: {}", message);
                self.pause();
            }
            DeviceEvent::PlayRejected(err) => self.handle_play_failure(err),
        }
    }

    /// Releases the device and drops every observer. Safe to call more than once.
    pub fn teardown(&mut self) {
        if self.torn_down {
            return;
        }
        info!("MediaTransport: teardown");
        self.torn_down = true;
        self.pending_autoplay = false;
        self.pending_start_position = None;
        self.device.release();
        self.session.set_playback(SessionPlayback::Stopped);
        self.events.clear();
    }

    fn handle_ended(&mut self) {
        if self.repeat {
            debug!("MediaTransport: repeat on, restarting track");
            self.apply_seek(0.0);
            self.play();
            return;
        }
        self.update_playing(false);
        (self.on_track_finished)();
    }

    fn handle_play_failure(&mut self, err: PlayError) {
        if err.is_benign() {
            debug!("MediaTransport: ignoring benign play rejection: {}", err);
            return;
        }
        error!("MediaTransport: playback error: {}", err);
        self.pause();
    }

    fn apply_seek(&mut self, time_seconds: f64) {
        self.device.set_current_time(time_seconds);
        self.update_current_time(time_seconds);
    }

    fn update_current_time(&mut self, seconds: f64) {
        if self.current_time != seconds {
            self.current_time = seconds;
            self.session.set_position(seconds);
            self.events.notify(&TransportEvent::CurrentTime(seconds));
        }
    }

    fn update_duration(&mut self, seconds: f64) {
        if self.duration != seconds {
            self.duration = seconds;
            self.events.notify(&TransportEvent::Duration(seconds));
        }
    }

    fn update_buffered(&mut self, ranges: Vec<BufferedRange>) {
        if self.buffered != ranges {
            self.buffered = ranges;
            self.events
                .notify(&TransportEvent::Buffered(self.buffered.clone()));
        }
    }

    fn update_playing(&mut self, playing: bool) {
        if self.playing == playing {
            return;
        }
        self.playing = playing;
        let position = self.current_time;
        self.session.set_playback(if playing {
            SessionPlayback::Playing { position }
        } else {
            SessionPlayback::Paused { position }
        });
        self.events.notify(&TransportEvent::Playing(playing));
    }
}

impl<D: MediaDevice> PlaybackTarget for MediaTransport<D> {
    fn set_source(&mut self, track: Option<&Track>, autoplay: bool) -> bool {
        MediaTransport::set_source(self, track, autoplay)
    }

    fn play(&mut self) {
        MediaTransport::play(self)
    }
}

impl<D: MediaDevice> Drop for MediaTransport<D> {
    fn drop(&mut self) {
        self.teardown();
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use std::cell::RefCell;
    use std::rc::Rc;

    use super::{LoadId, MediaDevice, MediaTransport};
    use crate::config::{BackendConfig, PlaybackConfig};
    use crate::error::PlayError;
    use crate::media_session::NoopMediaSession;

    #[derive(Debug, Clone, PartialEq)]
    pub enum DeviceCall {
        Load(String),
        Play,
        Pause,
        SetCurrentTime(f64),
        SetVolume(f32),
        SetMuted(bool),
        Release,
    }

    #[derive(Debug, Default)]
    pub struct FakeDeviceState {
        pub calls: Vec<DeviceCall>,
        pub current_time: f64,
        pub duration: f64,
        pub buffered: Vec<(f64, f64)>,
        pub play_results: Vec<Result<(), PlayError>>,
    }

    impl FakeDeviceState {
        pub fn loads(&self) -> Vec<String> {
            self.calls
                .iter()
                .filter_map(|call| match call {
                    DeviceCall::Load(url) => Some(url.clone()),
                    _ => None,
                })
                .collect()
        }

        pub fn count(&self, wanted: &DeviceCall) -> usize {
            self.calls.iter().filter(|call| *call == wanted).count()
        }
    }

    /// Records every call; shared state stays readable after the transport takes ownership.
    #[derive(Debug, Clone, Default)]
    pub struct FakeDevice {
        pub state: Rc<RefCell<FakeDeviceState>>,
    }

    impl MediaDevice for FakeDevice {
        fn load(&mut self, url: &str, _load: LoadId) {
            let mut state = self.state.borrow_mut();
            state.current_time = 0.0;
            state.calls.push(DeviceCall::Load(url.to_string()));
        }

        fn play(&mut self) -> Result<(), PlayError> {
            let mut state = self.state.borrow_mut();
            state.calls.push(DeviceCall::Play);
            if state.play_results.is_empty() {
                Ok(())
            } else {
                state.play_results.remove(0)
            }
        }

        fn pause(&mut self) {
            self.state.borrow_mut().calls.push(DeviceCall::Pause);
        }

        fn set_current_time(&mut self, seconds: f64) {
            let mut state = self.state.borrow_mut();
            state.current_time = seconds;
            state.calls.push(DeviceCall::SetCurrentTime(seconds));
        }

        fn set_volume(&mut self, volume: f32) {
            self.state.borrow_mut().calls.push(DeviceCall::SetVolume(volume));
        }

        fn set_muted(&mut self, muted: bool) {
            self.state.borrow_mut().calls.push(DeviceCall::SetMuted(muted));
        }

        fn current_time(&self) -> f64 {
            self.state.borrow().current_time
        }

        fn duration(&self) -> f64 {
            self.state.borrow().duration
        }

        fn buffered(&self) -> Vec<(f64, f64)> {
            self.state.borrow().buffered.clone()
        }

        fn release(&mut self) {
            self.state.borrow_mut().calls.push(DeviceCall::Release);
        }
    }

    /// Transport over a fake device; the returned counter tracks finished-callback calls.
    pub fn fake_transport() -> (MediaTransport<FakeDevice>, FakeDevice, Rc<RefCell<usize>>) {
        let device = FakeDevice::default();
        let finished = Rc::new(RefCell::new(0usize));
        let finished_sink = Rc::clone(&finished);
        let transport = MediaTransport::new(
            device.clone(),
            Box::new(BackendConfig::default()),
            Box::new(NoopMediaSession),
            &PlaybackConfig::default(),
            Box::new(move || *finished_sink.borrow_mut() += 1),
        );
        device.state.borrow_mut().calls.clear();
        (transport, device, finished)
    }
}
