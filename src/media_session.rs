//! OS "now playing" surface (MPRIS/SMTC/Now Playing).
//!
//! The transport pushes metadata and playback state into a [`MediaSession`]; platform
//! control events (play, pause, next, seek...) come back as console-equivalent
//! [`ControlCommand`]s on the bus.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use log::{info, warn};
use souvlaki::{
    MediaControlEvent, MediaControls, MediaMetadata, MediaPlayback, MediaPosition, PlatformConfig,
    SeekDirection,
};
use tokio::sync::broadcast::Sender;

use crate::protocol::{ControlCommand, Message};

const MEDIA_CONTROLS_DISPLAY_NAME: &str = "Cadenza";
const MEDIA_CONTROLS_DBUS_NAME: &str = "cadenza";
const SEEK_STEP_SECS: f64 = 10.0;

/// Metadata published for the loaded track.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SessionMetadata {
    pub title: String,
    pub artist: String,
    pub artwork_url: Option<String>,
    /// Seconds; `None` until known.
    pub duration: Option<f64>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SessionPlayback {
    Stopped,
    Paused { position: f64 },
    Playing { position: f64 },
}

/// Playback variant last handed to the platform. Position changes alone are not
/// republished.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PlaybackPublishState {
    Stopped,
    Paused,
    Playing,
}

impl From<SessionPlayback> for PlaybackPublishState {
    fn from(playback: SessionPlayback) -> Self {
        match playback {
            SessionPlayback::Stopped => Self::Stopped,
            SessionPlayback::Paused { .. } => Self::Paused,
            SessionPlayback::Playing { .. } => Self::Playing,
        }
    }
}

/// Platform media-session integration. Every call is best effort.
pub trait MediaSession {
    fn set_metadata(&mut self, metadata: &SessionMetadata);
    fn set_playback(&mut self, playback: SessionPlayback);
    /// Keeps the position used to resolve relative seeks current.
    fn set_position(&mut self, _seconds: f64) {}
}

/// Used when media controls are disabled or the platform has none.
#[derive(Debug, Default)]
pub struct NoopMediaSession;

impl MediaSession for NoopMediaSession {
    fn set_metadata(&mut self, _metadata: &SessionMetadata) {}

    fn set_playback(&mut self, _playback: SessionPlayback) {}
}

#[derive(Debug, Clone, Copy, Default)]
struct ControlState {
    is_playing: bool,
    elapsed_secs: f64,
    total_secs: f64,
}

/// `souvlaki`-backed session.
pub struct OsMediaSession {
    controls: MediaControls,
    control_state: Arc<Mutex<ControlState>>,
    last_published_playback: Option<PlaybackPublishState>,
}

impl OsMediaSession {
    /// Returns `None` when the platform backend cannot be created.
    pub fn new(bus_producer: Sender<Message>) -> Option<Self> {
        let control_state = Arc::new(Mutex::new(ControlState::default()));
        let controls = Self::create_controls(bus_producer, Arc::clone(&control_state))?;
        info!("MediaSession: platform media controls attached");
        Some(Self {
            controls,
            control_state,
            last_published_playback: None,
        })
    }

    #[cfg(not(target_os = "windows"))]
    fn create_controls(
        bus_producer: Sender<Message>,
        control_state: Arc<Mutex<ControlState>>,
    ) -> Option<MediaControls> {
        let mut controls = match MediaControls::new(PlatformConfig {
            display_name: MEDIA_CONTROLS_DISPLAY_NAME,
            dbus_name: MEDIA_CONTROLS_DBUS_NAME,
            hwnd: None,
        }) {
            Ok(controls) => controls,
            Err(err) => {
                warn!("MediaSession: failed to create media controls backend: {}", err);
                return None;
            }
        };

        if let Err(err) = controls.attach(move |event| {
            let snapshot = match control_state.lock() {
                Ok(state) => *state,
                Err(poisoned) => *poisoned.into_inner(),
            };

            if let Some(command) = map_control_event(event, snapshot) {
                let _ = bus_producer.send(Message::Control(command));
            }
        }) {
            warn!("MediaSession: failed to attach media controls handler: {}", err);
            return None;
        }

        Some(controls)
    }

    #[cfg(target_os = "windows")]
    fn create_controls(
        _bus_producer: Sender<Message>,
        _control_state: Arc<Mutex<ControlState>>,
    ) -> Option<MediaControls> {
        // A headless process has no HWND to hand to SMTC.
        warn!("MediaSession: Windows media controls need a window handle; disabled");
        None
    }

    fn update_control_state<F>(&self, update: F)
    where
        F: FnOnce(&mut ControlState),
    {
        match self.control_state.lock() {
            Ok(mut state) => update(&mut state),
            Err(poisoned) => {
                let mut state = poisoned.into_inner();
                update(&mut state);
            }
        }
    }
}

impl MediaSession for OsMediaSession {
    fn set_metadata(&mut self, metadata: &SessionMetadata) {
        let total_secs = metadata.duration.unwrap_or(0.0);
        self.update_control_state(|state| state.total_secs = total_secs);

        let duration = metadata
            .duration
            .filter(|secs| secs.is_finite() && *secs > 0.0)
            .map(Duration::from_secs_f64);
        let result = self.controls.set_metadata(MediaMetadata {
            title: Some(metadata.title.as_str()),
            artist: Some(metadata.artist.as_str()),
            album: None,
            cover_url: metadata.artwork_url.as_deref(),
            duration,
        });
        if let Err(err) = result {
            warn!("MediaSession: failed to publish metadata: {}", err);
        }
    }

    fn set_playback(&mut self, playback: SessionPlayback) {
        let publish_state = PlaybackPublishState::from(playback);
        if self.last_published_playback == Some(publish_state) {
            return;
        }
        let is_playing = matches!(playback, SessionPlayback::Playing { .. });
        self.update_control_state(|state| state.is_playing = is_playing);

        let position = |secs: f64| Some(MediaPosition(Duration::from_secs_f64(secs.max(0.0))));
        let native = match playback {
            SessionPlayback::Stopped => MediaPlayback::Stopped,
            SessionPlayback::Paused { position: secs } => MediaPlayback::Paused {
                progress: position(secs),
            },
            SessionPlayback::Playing { position: secs } => MediaPlayback::Playing {
                progress: position(secs),
            },
        };
        if let Err(err) = self.controls.set_playback(native) {
            warn!(
                "MediaSession: failed to publish playback state {:?}: {}",
                playback, err
            );
            return;
        }
        self.last_published_playback = Some(publish_state);
    }

    fn set_position(&mut self, seconds: f64) {
        self.update_control_state(|state| state.elapsed_secs = seconds);
    }
}

fn map_control_event(event: MediaControlEvent, state: ControlState) -> Option<ControlCommand> {
    match event {
        MediaControlEvent::Play => Some(ControlCommand::Play),
        MediaControlEvent::Pause | MediaControlEvent::Stop => Some(ControlCommand::Pause),
        MediaControlEvent::Toggle => {
            if state.is_playing {
                Some(ControlCommand::Pause)
            } else {
                Some(ControlCommand::Play)
            }
        }
        MediaControlEvent::Next => Some(ControlCommand::Next),
        MediaControlEvent::Previous => Some(ControlCommand::Previous),
        MediaControlEvent::SetPosition(MediaPosition(position)) => {
            Some(ControlCommand::Seek(position.as_secs_f64()))
        }
        MediaControlEvent::SeekBy(direction, delta) => {
            seek_from_offset(state, signed_offset(direction, delta.as_secs_f64()))
        }
        MediaControlEvent::Seek(direction) => {
            seek_from_offset(state, signed_offset(direction, SEEK_STEP_SECS))
        }
        MediaControlEvent::SetVolume(volume) => {
            Some(ControlCommand::SetVolume(volume.clamp(0.0, 1.0) as f32))
        }
        MediaControlEvent::Quit => Some(ControlCommand::Quit),
        MediaControlEvent::OpenUri(_) | MediaControlEvent::Raise => None,
    }
}

fn signed_offset(direction: SeekDirection, secs: f64) -> f64 {
    match direction {
        SeekDirection::Forward => secs,
        SeekDirection::Backward => -secs,
    }
}

fn seek_from_offset(state: ControlState, offset: f64) -> Option<ControlCommand> {
    if state.total_secs <= 0.0 {
        return None;
    }
    let target = (state.elapsed_secs + offset).clamp(0.0, state.total_secs);
    Some(ControlCommand::Seek(target))
}
