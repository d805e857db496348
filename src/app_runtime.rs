//! Application runtime bootstrap and top-level orchestration.
//!
//! [`PlayerRuntime`] owns every component and is the only place they are wired
//! together. Worker threads publish [`Message`]s on the bus; `run` consumes them in order
//! on the engine thread.

use std::ops::ControlFlow;
use std::thread;
use std::time::Duration;

use log::{debug, error, info, warn};
use tokio::sync::broadcast::{self, error::RecvError, Receiver, Sender};

use crate::audio_device::StreamingAudioDevice;
use crate::backend::BackendClient;
use crate::config::Config;
use crate::console::spawn_console_reader;
use crate::download_tracker::{DownloadState, DownloadTracker, DownloadTrigger};
use crate::event_sync::{
    spawn_supervisor, EventSyncChannel, HttpPushConnector, MessageLevel, SyncSupervisorHandle,
};
use crate::media_session::{MediaSession, NoopMediaSession, OsMediaSession};
use crate::media_transport::{MediaDevice, MediaTransport};
use crate::model::Track;
use crate::player_state::{self, PlayerState, PlayerStateStore};
use crate::playlist_navigator::PlaylistNavigator;
use crate::protocol::{ControlCommand, Message, PlaybackMessage, SyncMessage};

const BUS_CAPACITY: usize = 1024;
const PUSH_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// One application session: components, bus endpoints and background handles.
pub struct PlayerRuntime<D: MediaDevice, B: PlayerStateStore + DownloadTrigger> {
    config: Config,
    bus_producer: Sender<Message>,
    bus_consumer: Receiver<Message>,
    backend: B,
    transport: MediaTransport<D>,
    navigator: PlaylistNavigator,
    player_state: PlayerState,
    downloads: DownloadTracker,
    sync: EventSyncChannel,
    supervisor: Option<SyncSupervisorHandle>,
}

impl PlayerRuntime<StreamingAudioDevice, BackendClient> {
    /// Builds the production runtime, loads the library and starts the workers.
    pub fn build(config: Config) -> Result<Self, Box<dyn std::error::Error>> {
        let (bus_producer, _) = broadcast::channel(BUS_CAPACITY);

        let device = StreamingAudioDevice::new(
            bus_producer.clone(),
            Duration::from_secs(config.backend.request_timeout_secs),
        )?;
        let backend = BackendClient::new(config.backend.clone());
        let session: Box<dyn MediaSession> = if config.playback.media_controls_enabled {
            match OsMediaSession::new(bus_producer.clone()) {
                Some(session) => Box::new(session),
                None => Box::new(NoopMediaSession),
            }
        } else {
            info!("Runtime: media controls disabled by config");
            Box::new(NoopMediaSession)
        };

        let mut runtime = Self::assemble(config, bus_producer, device, backend, session);

        match runtime.backend.fetch_tracks() {
            Ok(tracks) => runtime.load_library(tracks),
            Err(err) => {
                warn!("Runtime: failed to fetch track list: {}", err);
                runtime.load_library(Vec::new());
            }
        }

        runtime.spawn_workers();
        Ok(runtime)
    }

    fn spawn_workers(&mut self) {
        let events_url = self.config.backend.url(&self.config.sync.events_path);
        info!("Runtime: push channel at {}", events_url);
        self.supervisor = Some(spawn_supervisor(
            Box::new(HttpPushConnector::new(events_url, PUSH_CONNECT_TIMEOUT)),
            self.bus_producer.clone(),
            Duration::from_secs(self.config.sync.reconnect_delay_secs),
        ));

        spawn_ticker(
            self.bus_producer.clone(),
            Duration::from_secs(self.config.persistence.snapshot_interval_secs),
        );
        spawn_console_reader(self.bus_producer.clone());
    }
}

impl<D: MediaDevice, B: PlayerStateStore + DownloadTrigger> PlayerRuntime<D, B> {
    /// Wires components around an existing bus. Nothing is fetched or spawned.
    pub fn assemble(
        config: Config,
        bus_producer: Sender<Message>,
        device: D,
        backend: B,
        session: Box<dyn MediaSession>,
    ) -> Self {
        let bus_consumer = bus_producer.subscribe();

        let finished_producer = bus_producer.clone();
        let transport = MediaTransport::new(
            device,
            Box::new(config.backend.clone()),
            session,
            &config.playback,
            Box::new(move || {
                let _ = finished_producer.send(Message::Playback(PlaybackMessage::TrackFinished));
            }),
        );

        let mut sync = EventSyncChannel::new(config.sync.recent_events_capacity);
        sync.subscribe_notifications(|notification| match notification.level {
            MessageLevel::Error => error!("Server: {}", notification.message),
            MessageLevel::Warning => warn!("Server: {}", notification.message),
            MessageLevel::Success | MessageLevel::Info => {
                info!("Server: {}", notification.message)
            }
        });
        sync.subscribe_status(|status| info!("EventSync: push channel {:?}", status));

        let mut downloads = DownloadTracker::new();
        downloads.subscribe(|job| match (job.state, job.error.as_deref(), &job.review) {
            (DownloadState::Failed, error, _) => {
                warn!("Download: failed: {}", error.unwrap_or_default())
            }
            (DownloadState::AwaitingReview, _, Some(candidate)) => info!(
                "Download: ready for review: {} / {}",
                candidate.suggested_artist.as_deref().unwrap_or("?"),
                candidate.suggested_title.as_deref().unwrap_or("?")
            ),
            (state, _, _) => info!("Download: {:?}", state),
        });

        Self {
            config,
            bus_producer,
            bus_consumer,
            backend,
            transport,
            navigator: PlaylistNavigator::new(),
            player_state: PlayerState::new(),
            downloads,
            sync,
            supervisor: None,
        }
    }

    /// Installs the startup track list, restores persisted state and loads the
    /// current track without playing it.
    pub fn load_library(&mut self, tracks: Vec<Track>) {
        info!("Runtime: library has {} track(s)", tracks.len());
        self.navigator.set_tracks(tracks);

        if self.config.persistence.restore_on_startup {
            player_state::restore(&self.backend, &mut self.navigator, &mut self.transport);
        }
        if self.transport.source_url().is_none() {
            let current = self.navigator.current_index();
            self.navigator.select_index(current, &mut self.transport);
        }
        self.refresh_state();
    }

    /// Consumes the bus until a shutdown request, then tears everything down.
    pub fn run(&mut self) {
        info!("Runtime: engine loop started");
        loop {
            match self.bus_consumer.blocking_recv() {
                Ok(message) => {
                    if self.dispatch(message).is_break() {
                        break;
                    }
                }
                Err(RecvError::Lagged(skipped)) => {
                    warn!("Runtime: engine lagged on bus, skipped {} message(s)", skipped);
                }
                Err(RecvError::Closed) => {
                    error!("Runtime: bus closed");
                    break;
                }
            }
        }
        self.shutdown();
    }

    /// Applies one bus message. `Break` means the session should end.
    pub fn dispatch(&mut self, message: Message) -> ControlFlow<()> {
        let flow = match message {
            Message::Device(load, event) => {
                self.transport.handle_device_event(load, event);
                ControlFlow::Continue(())
            }
            Message::Control(command) => self.handle_command(command),
            Message::Sync(SyncMessage::EventReceived(event)) => {
                self.sync
                    .handle_push_event(event, &mut self.navigator, &mut self.downloads);
                ControlFlow::Continue(())
            }
            Message::Sync(SyncMessage::ConnectionChanged(status)) => {
                self.sync.handle_status(status);
                ControlFlow::Continue(())
            }
            Message::Playback(PlaybackMessage::TrackFinished) => {
                debug!("Runtime: track finished, advancing");
                self.navigator.advance(&mut self.transport);
                ControlFlow::Continue(())
            }
            Message::Tick => {
                if self.transport.is_playing() {
                    self.refresh_state();
                    self.player_state.persist(&self.backend);
                }
                ControlFlow::Continue(())
            }
            Message::Shutdown => ControlFlow::Break(()),
        };
        self.refresh_state();
        flow
    }

    fn handle_command(&mut self, command: ControlCommand) -> ControlFlow<()> {
        match command {
            ControlCommand::PlayIndex(index) => self.navigator.play_at(index, &mut self.transport),
            ControlCommand::SelectIndex(index) => {
                self.navigator.select_index(Some(index), &mut self.transport)
            }
            ControlCommand::Next => self.navigator.advance(&mut self.transport),
            ControlCommand::Previous => self.navigator.retreat(&mut self.transport),
            ControlCommand::TogglePlay => self.player_state.toggle_play(&mut self.transport),
            ControlCommand::Play => self.transport.play(),
            ControlCommand::Pause => self.transport.pause(),
            ControlCommand::Seek(seconds) => self.player_state.seek(&mut self.transport, seconds),
            ControlCommand::SeekRelative(delta) => {
                let target = (self.transport.current_time() + delta).max(0.0);
                self.player_state.seek(&mut self.transport, target);
            }
            ControlCommand::SetVolume(volume) => {
                self.player_state.set_volume(&mut self.transport, volume)
            }
            ControlCommand::ToggleMute => self.player_state.toggle_mute(&mut self.transport),
            ControlCommand::ToggleShuffle => self.navigator.toggle_shuffle(),
            ControlCommand::ToggleRepeat => self.transport.toggle_repeat(),
            ControlCommand::Download(url) => self.downloads.request_download(&url, &self.backend),
            ControlCommand::ResetDownload => self.downloads.reset(),
            ControlCommand::ShowStatus => self.log_status(),
            ControlCommand::ShowEvents => self.log_recent_events(),
            ControlCommand::Quit => return ControlFlow::Break(()),
        }
        ControlFlow::Continue(())
    }

    fn refresh_state(&mut self) {
        self.player_state.refresh(
            &self.transport.snapshot(),
            self.navigator.current_track(),
            self.navigator.is_shuffle(),
        );
    }

    fn log_status(&self) {
        let snapshot = self.transport.snapshot();
        match self.navigator.current_track() {
            Some(track) => info!(
                "Status: [{}/{}] {} {:.1}/{:.1}s {}",
                self.navigator.current_index().map_or(0, |index| index + 1),
                self.navigator.tracks().len(),
                track.display_name(),
                snapshot.current_time,
                snapshot.duration,
                if snapshot.playing { "playing" } else { "paused" }
            ),
            None => info!("Status: nothing selected ({} tracks)", self.navigator.tracks().len()),
        }
        info!(
            "Status: volume={:.2} muted={} shuffle={} repeat={} history={}",
            snapshot.volume,
            snapshot.muted,
            self.navigator.is_shuffle(),
            snapshot.repeat,
            self.navigator.play_history().len()
        );
        info!(
            "Status: download={:?} push={:?}",
            self.downloads.state(),
            self.sync.status()
        );
    }

    fn log_recent_events(&self) {
        let recent = self.sync.recent_events();
        if recent.is_empty() {
            info!("Events: none received");
            return;
        }
        for entry in recent.iter() {
            info!(
                "Events: {} {} action={} message={}",
                entry.received_at.format("%H:%M:%S"),
                entry.id,
                entry.event.action_key.as_deref().unwrap_or("-"),
                entry.event.message_to_show.as_deref().unwrap_or("-")
            );
        }
    }

    /// Final snapshot beacon, then the push supervisor and the transport are released.
    pub fn shutdown(&mut self) {
        info!("Runtime: shutting down");
        self.refresh_state();
        self.player_state.send_beacon(&self.backend);
        if let Some(mut supervisor) = self.supervisor.take() {
            supervisor.shutdown();
        }
        self.transport.teardown();
    }
}

/// Emits `Tick` every `interval` until the bus has no consumers left.
fn spawn_ticker(bus_producer: Sender<Message>, interval: Duration) {
    let spawned = thread::Builder::new()
        .name("state-ticker".to_string())
        .spawn(move || loop {
            thread::sleep(interval);
            if bus_producer.send(Message::Tick).is_err() {
                break;
            }
        });
    if let Err(err) = spawned {
        warn!("Runtime: failed to spawn ticker thread: {}", err);
    }
}

#[cfg(test)]
mod tests {
    use std::ops::ControlFlow;

    use serde_json::json;
    use tokio::sync::broadcast::{self, error::TryRecvError, Receiver};

    use super::PlayerRuntime;
    use crate::config::Config;
    use crate::download_tracker::test_support::RecordingTrigger;
    use crate::download_tracker::{DownloadState, DownloadTrigger};
    use crate::error::BackendError;
    use crate::event_sync::{ConnectionStatus, PushEvent};
    use crate::media_session::NoopMediaSession;
    use crate::media_transport::test_support::{DeviceCall, FakeDevice};
    use crate::media_transport::DeviceEvent;
    use crate::model::test_track;
    use crate::player_state::test_support::MemoryStore;
    use crate::player_state::{PlayerStateSnapshot, PlayerStateStore};
    use crate::protocol::{ControlCommand, Message, PlaybackMessage, SyncMessage};

    #[derive(Default)]
    struct FakeBackend {
        store: MemoryStore,
        trigger: RecordingTrigger,
    }

    impl PlayerStateStore for FakeBackend {
        fn fetch(&self) -> Result<PlayerStateSnapshot, BackendError> {
            self.store.fetch()
        }

        fn save(&self, snapshot: &PlayerStateSnapshot) -> Result<(), BackendError> {
            self.store.save(snapshot)
        }

        fn send_beacon(&self, snapshot: &PlayerStateSnapshot) {
            self.store.send_beacon(snapshot)
        }
    }

    impl DownloadTrigger for FakeBackend {
        fn trigger_download(&self, url: &str) -> Result<(), BackendError> {
            self.trigger.trigger_download(url)
        }
    }

    struct Harness {
        runtime: PlayerRuntime<FakeDevice, FakeBackend>,
        device: FakeDevice,
        bus_observer: Receiver<Message>,
    }

    fn harness_with(backend: FakeBackend, track_count: i64) -> Harness {
        let (bus_producer, bus_observer) = broadcast::channel(64);
        let device = FakeDevice::default();
        let mut runtime = PlayerRuntime::assemble(
            Config::default(),
            bus_producer,
            device.clone(),
            backend,
            Box::new(NoopMediaSession),
        );
        runtime.load_library((1..=track_count).map(test_track).collect());
        Harness {
            runtime,
            device,
            bus_observer,
        }
    }

    fn harness(track_count: i64) -> Harness {
        harness_with(FakeBackend::default(), track_count)
    }

    fn control(command: ControlCommand) -> Message {
        Message::Control(command)
    }

    fn dispatch_device(h: &mut Harness, event: DeviceEvent) {
        let load = h.runtime.transport.current_load();
        h.runtime.dispatch(Message::Device(load, event));
    }

    fn drain_finished(receiver: &mut Receiver<Message>) -> usize {
        let mut finished = 0;
        loop {
            match receiver.try_recv() {
                Ok(Message::Playback(PlaybackMessage::TrackFinished)) => finished += 1,
                Ok(_) => {}
                Err(TryRecvError::Lagged(_)) => continue,
                Err(TryRecvError::Empty) | Err(TryRecvError::Closed) => return finished,
            }
        }
    }

    #[test]
    fn test_load_library_selects_first_track_without_playing() {
        let h = harness(3);

        assert_eq!(h.runtime.navigator.current_index(), Some(0));
        assert_eq!(h.device.state.borrow().loads().len(), 1);
        assert_eq!(h.device.state.borrow().count(&DeviceCall::Play), 0);
        assert_eq!(
            h.runtime.player_state.snapshot().current_track_id,
            Some(1)
        );
    }

    #[test]
    fn test_load_library_restores_persisted_state() {
        let backend = FakeBackend::default();
        *backend.store.stored.borrow_mut() = Some(PlayerStateSnapshot {
            current_track_id: Some(3),
            progress_seconds: 42.0,
            volume_level: 0.4,
            is_muted: true,
            is_shuffle: true,
            is_repeat: true,
        });

        let mut h = harness_with(backend, 3);
        dispatch_device(&mut h, DeviceEvent::MetadataLoaded { duration: 180.0 });

        assert_eq!(h.runtime.navigator.current_index(), Some(2));
        assert!(h.runtime.navigator.is_shuffle());
        let snapshot = h.runtime.transport.snapshot();
        assert_eq!(snapshot.volume, 0.4);
        assert!(snapshot.muted);
        assert!(snapshot.repeat);
        assert!(!snapshot.playing);
        assert_eq!(
            h.device.state.borrow().count(&DeviceCall::SetCurrentTime(42.0)),
            1
        );
    }

    #[test]
    fn test_track_finished_advances_through_bus() {
        let mut h = harness(3);
        h.runtime.dispatch(control(ControlCommand::PlayIndex(0)));
        dispatch_device(&mut h, DeviceEvent::MetadataLoaded { duration: 180.0 });
        assert!(h.runtime.transport.is_playing());

        dispatch_device(&mut h, DeviceEvent::Ended);
        assert_eq!(drain_finished(&mut h.bus_observer), 1);

        h.runtime.dispatch(Message::Playback(PlaybackMessage::TrackFinished));
        assert_eq!(h.runtime.navigator.current_index(), Some(1));
        assert_eq!(h.device.state.borrow().loads().len(), 2);
    }

    #[test]
    fn test_stale_end_queued_behind_next_does_not_skip() {
        let mut h = harness(4);
        h.runtime.dispatch(control(ControlCommand::PlayIndex(0)));
        dispatch_device(&mut h, DeviceEvent::MetadataLoaded { duration: 180.0 });
        dispatch_device(&mut h, DeviceEvent::TimeUpdate(179.9));
        let old_load = h.runtime.transport.current_load();

        h.runtime.dispatch(control(ControlCommand::Next));
        assert_eq!(h.runtime.navigator.current_index(), Some(1));

        h.runtime
            .dispatch(Message::Device(old_load, DeviceEvent::TimeUpdate(179.95)));
        h.runtime.dispatch(Message::Device(old_load, DeviceEvent::Ended));

        assert_eq!(drain_finished(&mut h.bus_observer), 0);
        assert_eq!(h.runtime.navigator.current_index(), Some(1));
        assert_eq!(h.runtime.transport.current_time(), 0.0);
    }

    #[test]
    fn test_repeat_end_restarts_without_advancing() {
        let mut h = harness(2);
        h.runtime.dispatch(control(ControlCommand::PlayIndex(0)));
        dispatch_device(&mut h, DeviceEvent::MetadataLoaded { duration: 180.0 });
        h.runtime.dispatch(control(ControlCommand::ToggleRepeat));

        dispatch_device(&mut h, DeviceEvent::Ended);

        assert_eq!(drain_finished(&mut h.bus_observer), 0);
        assert_eq!(h.runtime.navigator.current_index(), Some(0));
        assert!(h.runtime.transport.is_playing());
    }

    #[test]
    fn test_push_events_mutate_library_and_downloads() {
        let mut h = harness(2);

        h.runtime.dispatch(Message::Sync(SyncMessage::EventReceived(PushEvent {
            action_key: Some("track_added".to_string()),
            action_payload: Some(json!({"id": 9, "title": "New", "artist": "Band"})),
            ..PushEvent::default()
        })));
        h.runtime.dispatch(Message::Sync(SyncMessage::EventReceived(PushEvent {
            action_key: Some("download_failed".to_string()),
            action_payload: Some(json!({"error": "disk full"})),
            ..PushEvent::default()
        })));
        h.runtime.dispatch(Message::Sync(SyncMessage::EventReceived(PushEvent {
            action_key: Some("mystery".to_string()),
            ..PushEvent::default()
        })));

        let ids: Vec<i64> = h.runtime.navigator.tracks().iter().map(|t| t.id).collect();
        assert_eq!(ids, vec![1, 2, 9]);
        assert_eq!(h.runtime.downloads.state(), DownloadState::Failed);
        assert_eq!(h.runtime.sync.recent_events().len(), 3);
    }

    #[test]
    fn test_connection_status_is_tracked() {
        let mut h = harness(1);
        h.runtime.dispatch(Message::Sync(SyncMessage::ConnectionChanged(
            ConnectionStatus::Connected,
        )));
        assert_eq!(h.runtime.sync.status(), ConnectionStatus::Connected);
    }

    #[test]
    fn test_download_command_posts_through_backend() {
        let mut h = harness(1);

        h.runtime
            .dispatch(control(ControlCommand::Download("https://example.com/v".to_string())));
        assert_eq!(h.runtime.downloads.state(), DownloadState::Downloading);
        assert_eq!(
            *h.runtime.backend.trigger.requested.borrow(),
            vec!["https://example.com/v".to_string()]
        );

        h.runtime.dispatch(control(ControlCommand::ResetDownload));
        assert_eq!(h.runtime.downloads.state(), DownloadState::Idle);
    }

    #[test]
    fn test_tick_persists_only_while_playing() {
        let mut h = harness(2);
        h.runtime.dispatch(Message::Tick);
        assert!(h.runtime.backend.store.saves.borrow().is_empty());

        h.runtime.dispatch(control(ControlCommand::PlayIndex(1)));
        dispatch_device(&mut h, DeviceEvent::MetadataLoaded { duration: 180.0 });
        dispatch_device(&mut h, DeviceEvent::TimeUpdate(12.5));
        h.runtime.dispatch(Message::Tick);

        let saves = h.runtime.backend.store.saves.borrow();
        assert_eq!(saves.len(), 1);
        assert_eq!(saves[0].current_track_id, Some(2));
        assert_eq!(saves[0].progress_seconds, 12.5);
    }

    #[test]
    fn test_volume_and_seek_commands_pass_through() {
        let mut h = harness(1);
        h.runtime.dispatch(control(ControlCommand::SetVolume(1.5)));
        assert_eq!(h.runtime.player_state.snapshot().volume_level, 1.0);

        h.runtime.dispatch(control(ControlCommand::SeekRelative(-5.0)));
        assert_eq!(h.device.state.borrow().count(&DeviceCall::SetCurrentTime(0.0)), 1);
    }

    #[test]
    fn test_quit_and_shutdown_break_the_loop() {
        let mut h = harness(1);
        assert_eq!(
            h.runtime.dispatch(control(ControlCommand::ShowStatus)),
            ControlFlow::Continue(())
        );
        assert_eq!(
            h.runtime.dispatch(control(ControlCommand::Quit)),
            ControlFlow::Break(())
        );
        assert_eq!(h.runtime.dispatch(Message::Shutdown), ControlFlow::Break(()));
    }

    #[test]
    fn test_shutdown_sends_beacon_and_releases_device() {
        let mut h = harness(2);

        h.runtime.shutdown();
        h.runtime.shutdown();

        let beacons = h.runtime.backend.store.beacons.borrow();
        assert_eq!(beacons.len(), 2);
        assert_eq!(beacons[0].current_track_id, Some(1));
        assert_eq!(h.device.state.borrow().count(&DeviceCall::Release), 1);
    }
}
