//! Event-bus protocol shared by all runtime components.
//!
//! Producers on worker threads (audio device, push supervisor, media session, console,
//! ticker) publish these envelopes; the engine thread is the only consumer that mutates
//! component state.

use crate::event_sync::{ConnectionStatus, PushEvent};
use crate::media_transport::{DeviceEvent, LoadId};

/// Top-level envelope for all bus traffic.
#[derive(Debug, Clone)]
pub enum Message {
    /// Native device notification, tagged with the load it belongs to.
    Device(LoadId, DeviceEvent),
    Control(ControlCommand),
    Sync(SyncMessage),
    Playback(PlaybackMessage),
    /// Periodic heartbeat driving player-state snapshots.
    Tick,
    Shutdown,
}

/// User-level commands from the console or the OS media session.
#[derive(Debug, Clone, PartialEq)]
pub enum ControlCommand {
    /// Play the track at a library index.
    PlayIndex(usize),
    /// Move the cursor without starting playback.
    SelectIndex(usize),
    Next,
    Previous,
    TogglePlay,
    Play,
    Pause,
    /// Absolute seek in seconds.
    Seek(f64),
    /// Relative seek in seconds; negative values rewind.
    SeekRelative(f64),
    SetVolume(f32),
    ToggleMute,
    ToggleShuffle,
    ToggleRepeat,
    Download(String),
    ResetDownload,
    ShowStatus,
    ShowEvents,
    Quit,
}

/// Push-channel traffic forwarded by the supervisor thread.
#[derive(Debug, Clone)]
pub enum SyncMessage {
    EventReceived(PushEvent),
    ConnectionChanged(ConnectionStatus),
}

/// Transport-originated notifications that other components react to.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum PlaybackMessage {
    /// Natural end of a track with repeat off.
    TrackFinished,
}
