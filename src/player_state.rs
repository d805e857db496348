//! "Now playing" projection persisted to the backend.
//!
//! The projection has no authority of its own: every command forwards to the transport,
//! and the snapshot is recomputed from transport and navigator state.

use log::{debug, info, warn};

use crate::error::BackendError;
use crate::media_transport::{MediaDevice, MediaTransport, TransportSnapshot};
use crate::model::{Track, TrackId};
use crate::observable::{Subject, SubscriptionId};
use crate::playlist_navigator::PlaylistNavigator;

/// Backend wire shape of the persisted player state.
#[derive(Debug, Clone, Copy, PartialEq, serde::Deserialize, serde::Serialize)]
#[serde(default)]
pub struct PlayerStateSnapshot {
    pub current_track_id: Option<TrackId>,
    pub progress_seconds: f64,
    pub volume_level: f32,
    pub is_muted: bool,
    pub is_shuffle: bool,
    pub is_repeat: bool,
}

impl Default for PlayerStateSnapshot {
    fn default() -> Self {
        Self {
            current_track_id: None,
            progress_seconds: 0.0,
            volume_level: 1.0,
            is_muted: false,
            is_shuffle: false,
            is_repeat: false,
        }
    }
}

/// Persistence backend for [`PlayerStateSnapshot`].
pub trait PlayerStateStore {
    /// Last persisted state, or the default when none exists.
    fn fetch(&self) -> Result<PlayerStateSnapshot, BackendError>;
    fn save(&self, snapshot: &PlayerStateSnapshot) -> Result<(), BackendError>;
    /// Final save while shutting down, bounded by a short timeout.
    fn send_beacon(&self, snapshot: &PlayerStateSnapshot);
}

pub fn project(
    transport: &TransportSnapshot,
    current_track: Option<&Track>,
    shuffle: bool,
) -> PlayerStateSnapshot {
    PlayerStateSnapshot {
        current_track_id: current_track.map(|track| track.id),
        progress_seconds: transport.current_time,
        volume_level: transport.volume,
        is_muted: transport.muted,
        is_shuffle: shuffle,
        is_repeat: transport.repeat,
    }
}

/// Cached projection plus its observers.
#[derive(Default)]
pub struct PlayerState {
    latest: PlayerStateSnapshot,
    events: Subject<PlayerStateSnapshot>,
}

impl PlayerState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe<F>(&mut self, observer: F) -> SubscriptionId
    where
        F: FnMut(&PlayerStateSnapshot) + 'static,
    {
        self.events.subscribe(observer)
    }

    pub fn snapshot(&self) -> PlayerStateSnapshot {
        self.latest
    }

    /// Recomputes the projection; observers fire only when it changed.
    pub fn refresh(
        &mut self,
        transport: &TransportSnapshot,
        current_track: Option<&Track>,
        shuffle: bool,
    ) -> bool {
        let next = project(transport, current_track, shuffle);
        if next == self.latest {
            return false;
        }
        self.latest = next;
        self.events.notify(&next);
        true
    }

    pub fn set_volume<D: MediaDevice>(&self, transport: &mut MediaTransport<D>, volume: f32) {
        transport.set_volume(volume);
    }

    pub fn toggle_mute<D: MediaDevice>(&self, transport: &mut MediaTransport<D>) {
        transport.toggle_mute();
    }

    pub fn seek<D: MediaDevice>(&self, transport: &mut MediaTransport<D>, time_seconds: f64) {
        transport.seek(time_seconds);
    }

    pub fn toggle_play<D: MediaDevice>(&self, transport: &mut MediaTransport<D>) {
        transport.toggle_play();
    }

    /// Saves the cached snapshot. Failures are logged and dropped.
    pub fn persist(&self, store: &dyn PlayerStateStore) {
        match store.save(&self.latest) {
            Ok(()) => debug!(
                "PlayerState: saved snapshot track={:?} progress={:.1}s",
                self.latest.current_track_id, self.latest.progress_seconds
            ),
            Err(err) => warn!("PlayerState: failed to save snapshot: {}", err),
        }
    }

    pub fn send_beacon(&self, store: &dyn PlayerStateStore) {
        store.send_beacon(&self.latest);
    }
}

/// Applies the persisted state: modes and levels first, then the persisted track is
/// selected without playing and its progress queued for the next metadata load.
pub fn restore<D: MediaDevice>(
    store: &dyn PlayerStateStore,
    navigator: &mut PlaylistNavigator,
    transport: &mut MediaTransport<D>,
) -> Option<PlayerStateSnapshot> {
    let snapshot = match store.fetch() {
        Ok(snapshot) => snapshot,
        Err(err) => {
            warn!("PlayerState: failed to fetch persisted state: {}", err);
            return None;
        }
    };

    navigator.set_shuffle(snapshot.is_shuffle);
    transport.set_repeat(snapshot.is_repeat);
    transport.set_volume(snapshot.volume_level);
    transport.set_muted(snapshot.is_muted);

    if let Some(id) = snapshot.current_track_id {
        if navigator.select_track_id(id, transport) {
            transport.restore_position(snapshot.progress_seconds);
            info!(
                "PlayerState: restored track {} at {:.1}s",
                id, snapshot.progress_seconds
            );
        } else {
            info!("PlayerState: persisted track {} is no longer in the library", id);
        }
    }
    Some(snapshot)
}

#[cfg(test)]
pub(crate) mod test_support {
    use std::cell::RefCell;

    use super::{PlayerStateSnapshot, PlayerStateStore};
    use crate::error::BackendError;

    #[derive(Default)]
    pub struct MemoryStore {
        pub stored: RefCell<Option<PlayerStateSnapshot>>,
        pub saves: RefCell<Vec<PlayerStateSnapshot>>,
        pub beacons: RefCell<Vec<PlayerStateSnapshot>>,
        pub fail: bool,
    }

    impl PlayerStateStore for MemoryStore {
        fn fetch(&self) -> Result<PlayerStateSnapshot, BackendError> {
            if self.fail {
                return Err(BackendError::Status {
                    url: "memory://player-state".to_string(),
                    status: 500,
                });
            }
            Ok(self.stored.borrow().unwrap_or_default())
        }

        fn save(&self, snapshot: &PlayerStateSnapshot) -> Result<(), BackendError> {
            if self.fail {
                return Err(BackendError::Transport {
                    url: "memory://player-state".to_string(),
                    message: "offline".to_string(),
                });
            }
            self.saves.borrow_mut().push(*snapshot);
            *self.stored.borrow_mut() = Some(*snapshot);
            Ok(())
        }

        fn send_beacon(&self, snapshot: &PlayerStateSnapshot) {
            self.beacons.borrow_mut().push(*snapshot);
        }
    }
}
