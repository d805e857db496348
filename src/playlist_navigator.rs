//! Playlist cursor, play history and sequential/shuffled navigation.

use log::debug;
use rand::{rngs::StdRng, Rng, SeedableRng};

use crate::model::{Track, TrackId};
use crate::observable::{Subject, SubscriptionId};

/// Playback surface the navigator drives. Implemented by the media transport.
pub trait PlaybackTarget {
    /// Returns `false` when `track` is `None` or already loaded.
    fn set_source(&mut self, track: Option<&Track>, autoplay: bool) -> bool;
    fn play(&mut self);
}

/// Identity-keyed mutations applied by the push-event dispatcher.
pub trait TrackCollection {
    /// Appends `track`, or replaces the entry with the same id in place.
    fn add_track(&mut self, track: Track);
    /// Replaces the entry with the same id; unknown ids are ignored.
    fn replace_track(&mut self, track: Track);
    fn remove_track(&mut self, id: TrackId);
}

#[derive(Debug, Clone, PartialEq)]
pub enum NavigationEvent {
    /// Track list replaced; carries the new length.
    TracksChanged(usize),
    CurrentIndexChanged(Option<usize>),
    ShuffleChanged(bool),
    /// Carries the new history length.
    HistoryChanged(usize),
}

pub struct PlaylistNavigator {
    tracks: Vec<Track>,
    current_index: Option<usize>,
    play_history: Vec<Track>,
    shuffle_enabled: bool,
    rng: StdRng,
    events: Subject<NavigationEvent>,
}

impl Default for PlaylistNavigator {
    fn default() -> Self {
        Self::new()
    }
}

impl PlaylistNavigator {
    pub fn new() -> Self {
        Self::with_rng(StdRng::from_entropy())
    }

    pub fn with_rng(rng: StdRng) -> Self {
        Self {
            tracks: Vec::new(),
            current_index: None,
            play_history: Vec::new(),
            shuffle_enabled: false,
            rng,
            events: Subject::new(),
        }
    }

    pub fn subscribe<F>(&mut self, observer: F) -> SubscriptionId
    where
        F: FnMut(&NavigationEvent) + 'static,
    {
        self.events.subscribe(observer)
    }

    pub fn unsubscribe(&mut self, id: SubscriptionId) -> bool {
        self.events.unsubscribe(id)
    }

    pub fn tracks(&self) -> &[Track] {
        &self.tracks
    }

    pub fn current_index(&self) -> Option<usize> {
        self.current_index
    }

    pub fn current_track(&self) -> Option<&Track> {
        self.current_index.and_then(|index| self.tracks.get(index))
    }

    pub fn play_history(&self) -> &[Track] {
        &self.play_history
    }

    pub fn is_shuffle(&self) -> bool {
        self.shuffle_enabled
    }

    /// Replaces the list and re-homes the cursor onto the same track id, falling back
    /// to the first entry. Never touches playback.
    pub fn set_tracks(&mut self, tracks: Vec<Track>) {
        let previous_id = self.current_track().map(|track| track.id);
        self.tracks = tracks;
        let rehomed = previous_id
            .and_then(|id| self.position_of(id))
            .or_else(|| (!self.tracks.is_empty()).then_some(0));

        self.events
            .notify(&NavigationEvent::TracksChanged(self.tracks.len()));
        self.update_current_index(rehomed);
    }

    /// Moves the cursor and loads the track without starting playback. Out-of-range
    /// indices are ignored.
    pub fn select_index(&mut self, index: Option<usize>, target: &mut dyn PlaybackTarget) {
        match index {
            None => self.update_current_index(None),
            Some(index) if index < self.tracks.len() => {
                self.update_current_index(Some(index));
                target.set_source(self.tracks.get(index), false);
            }
            Some(index) => {
                debug!(
                    "PlaylistNavigator: ignoring select of index {} (len {})",
                    index,
                    self.tracks.len()
                );
            }
        }
    }

    /// Cursor by identity; returns whether the id was found.
    pub fn select_track_id(&mut self, id: TrackId, target: &mut dyn PlaybackTarget) -> bool {
        match self.position_of(id) {
            Some(index) => {
                self.select_index(Some(index), target);
                true
            }
            None => false,
        }
    }

    /// Plays the track at `index`, recording the current one in history.
    pub fn play_at(&mut self, index: usize, target: &mut dyn PlaybackTarget) {
        if index >= self.tracks.len() {
            debug!(
                "PlaylistNavigator: ignoring play of index {} (len {})",
                index,
                self.tracks.len()
            );
            return;
        }
        self.push_current_to_history();
        self.update_current_index(Some(index));
        self.start_current(target);
    }

    pub fn advance(&mut self, target: &mut dyn PlaybackTarget) {
        let Some(current) = self.current_index else {
            return;
        };
        let len = self.tracks.len();
        if len == 0 {
            return;
        }

        if self.shuffle_enabled {
            if len < 2 {
                return;
            }
            let mut pick = self.rng.gen_range(0..len - 1);
            if pick >= current {
                pick += 1;
            }
            self.push_current_to_history();
            self.update_current_index(Some(pick));
        } else {
            self.update_current_index(Some((current + 1) % len));
        }
        self.start_current(target);
    }

    pub fn retreat(&mut self, target: &mut dyn PlaybackTarget) {
        let Some(current) = self.current_index else {
            return;
        };
        let len = self.tracks.len();
        if len == 0 {
            return;
        }

        if self.shuffle_enabled {
            if let Some(previous) = self.play_history.pop() {
                self.events
                    .notify(&NavigationEvent::HistoryChanged(self.play_history.len()));
                match self.position_of(previous.id) {
                    Some(index) => {
                        self.update_current_index(Some(index));
                        self.start_current(target);
                    }
                    None => debug!(
                        "PlaylistNavigator: history entry {} no longer in list",
                        previous.id
                    ),
                }
                return;
            }
        }

        let index = if current == 0 { len - 1 } else { current - 1 };
        self.update_current_index(Some(index));
        self.start_current(target);
    }

    pub fn set_shuffle(&mut self, enabled: bool) {
        if self.shuffle_enabled != enabled {
            self.shuffle_enabled = enabled;
            self.events.notify(&NavigationEvent::ShuffleChanged(enabled));
        }
    }

    pub fn toggle_shuffle(&mut self) {
        self.set_shuffle(!self.shuffle_enabled);
    }

    /// Clears list, cursor and history.
    pub fn reset(&mut self) {
        self.set_tracks(Vec::new());
        if !self.play_history.is_empty() {
            self.play_history.clear();
            self.events.notify(&NavigationEvent::HistoryChanged(0));
        }
    }

    fn position_of(&self, id: TrackId) -> Option<usize> {
        self.tracks.iter().position(|track| track.id == id)
    }

    fn push_current_to_history(&mut self) {
        if let Some(track) = self.current_track().cloned() {
            self.play_history.push(track);
            self.events
                .notify(&NavigationEvent::HistoryChanged(self.play_history.len()));
        }
    }

    fn start_current(&mut self, target: &mut dyn PlaybackTarget) {
        if !target.set_source(self.current_track(), true) {
            target.play();
        }
    }

    fn update_current_index(&mut self, index: Option<usize>) {
        if self.current_index != index {
            self.current_index = index;
            self.events
                .notify(&NavigationEvent::CurrentIndexChanged(index));
        }
    }
}

impl TrackCollection for PlaylistNavigator {
    fn add_track(&mut self, track: Track) {
        let mut tracks = self.tracks.clone();
        match tracks.iter().position(|existing| existing.id == track.id) {
            Some(index) => tracks[index] = track,
            None => tracks.push(track),
        }
        self.set_tracks(tracks);
    }

    fn replace_track(&mut self, track: Track) {
        let Some(index) = self.position_of(track.id) else {
            debug!("PlaylistNavigator: update for unknown track {}", track.id);
            return;
        };
        let mut tracks = self.tracks.clone();
        tracks[index] = track;
        self.set_tracks(tracks);
    }

    fn remove_track(&mut self, id: TrackId) {
        if self.position_of(id).is_none() {
            return;
        }
        let tracks = self
            .tracks
            .iter()
            .filter(|track| track.id != id)
            .cloned()
            .collect();
        self.set_tracks(tracks);
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::PlaybackTarget;
    use crate::model::{Track, TrackId};

    #[derive(Debug, Clone, PartialEq)]
    pub enum TargetCall {
        SetSource(TrackId, bool),
        Play,
    }

    /// Records navigation-driven playback; mirrors the transport's "already loaded" rule.
    #[derive(Debug, Default)]
    pub struct RecordingTarget {
        pub loaded: Option<TrackId>,
        pub calls: Vec<TargetCall>,
    }

    impl RecordingTarget {
        pub fn played_ids(&self) -> Vec<TrackId> {
            let mut ids = Vec::new();
            let mut loaded = None;
            for call in &self.calls {
                match call {
                    TargetCall::SetSource(id, _) => loaded = Some(*id),
                    TargetCall::Play => {
                        if let Some(id) = loaded {
                            ids.push(id);
                        }
                    }
                }
            }
            ids
        }
    }

    impl PlaybackTarget for RecordingTarget {
        fn set_source(&mut self, track: Option<&Track>, autoplay: bool) -> bool {
            let Some(track) = track else {
                return false;
            };
            if self.loaded == Some(track.id) {
                return false;
            }
            self.loaded = Some(track.id);
            self.calls.push(TargetCall::SetSource(track.id, autoplay));
            if autoplay {
                self.calls.push(TargetCall::Play);
            }
            true
        }

        fn play(&mut self) {
            self.calls.push(TargetCall::Play);
        }
    }
}
