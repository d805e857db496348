//! Server-pushed event synchronization.
//!
//! A supervisor thread keeps exactly one Server-Sent Events connection open, decodes each
//! `data:` payload into a [`PushEvent`] and forwards it over the bus. On the engine thread
//! [`EventSyncChannel`] records the event, publishes its notification and dispatches the
//! action onto the track collection or the download tracker.
//!
//! Delivery is at-most-once per connection: events missed while disconnected are not
//! replayed, and nothing is deduplicated across reconnects.

use std::collections::VecDeque;
use std::io::{BufRead, BufReader};
use std::ops::ControlFlow;
use std::sync::mpsc::{self, RecvTimeoutError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use serde_json::Value;
use tokio::sync::broadcast::Sender;
use uuid::Uuid;

use crate::download_tracker::{DownloadEvent, DownloadTracker, ReviewCandidate};
use crate::error::SyncError;
use crate::model::{Track, TrackId};
use crate::observable::{Subject, SubscriptionId};
use crate::playlist_navigator::TrackCollection;
use crate::protocol::{Message, SyncMessage};

pub const DEFAULT_RECENT_EVENTS_CAPACITY: usize = 10;

/// One inbound push message. Every field is optional on the wire.
#[derive(Debug, Clone, Default, PartialEq, serde::Deserialize, serde::Serialize)]
#[serde(default)]
pub struct PushEvent {
    pub message_to_show: Option<String>,
    pub message_level: Option<String>,
    pub action_key: Option<String>,
    pub action_payload: Option<Value>,
}

impl PushEvent {
    /// Severity of `message_to_show`; unknown or missing levels read as `Info`.
    pub fn level(&self) -> MessageLevel {
        match self.message_level.as_deref() {
            Some("success") => MessageLevel::Success,
            Some("warning") => MessageLevel::Warning,
            Some("error") => MessageLevel::Error,
            _ => MessageLevel::Info,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageLevel {
    Success,
    Info,
    Warning,
    Error,
}

/// User-facing message carried by a push event.
#[derive(Debug, Clone, PartialEq)]
pub struct Notification {
    pub level: MessageLevel,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    Connected,
    Disconnected,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RecentEvent {
    pub id: Uuid,
    pub received_at: DateTime<Utc>,
    pub event: PushEvent,
}

/// Bounded log of received events, most recent first.
#[derive(Debug, Clone)]
pub struct RecentEvents {
    capacity: usize,
    entries: VecDeque<RecentEvent>,
}

impl Default for RecentEvents {
    fn default() -> Self {
        Self::with_capacity(DEFAULT_RECENT_EVENTS_CAPACITY)
    }
}

impl RecentEvents {
    pub fn with_capacity(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            entries: VecDeque::with_capacity(capacity),
        }
    }

    pub fn record(&mut self, event: PushEvent) -> &RecentEvent {
        self.entries.push_front(RecentEvent {
            id: Uuid::new_v4(),
            received_at: Utc::now(),
            event,
        });
        self.entries.truncate(self.capacity);
        &self.entries[0]
    }

    pub fn iter(&self) -> impl Iterator<Item = &RecentEvent> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Decoded `action_key` + `action_payload`.
#[derive(Debug, Clone, PartialEq)]
pub enum SyncAction {
    TrackAdded(Track),
    TrackUpdated(Track),
    TrackDeleted(TrackId),
    Download(DownloadEvent),
}

#[derive(Debug, Clone, PartialEq)]
pub enum ActionDecode {
    Action(SyncAction),
    /// No `action_key`, or a key this client does not know.
    Ignored,
    /// Known key whose payload could not be read.
    Malformed { key: String, reason: String },
}

fn track_from_payload(payload: Option<&Value>) -> Result<Track, String> {
    let payload = payload.ok_or("missing payload")?;
    let value = payload.get("track").unwrap_or(payload);
    serde_json::from_value(value.clone()).map_err(|err| err.to_string())
}

fn track_id_from_payload(payload: Option<&Value>) -> Result<TrackId, String> {
    let payload = payload.ok_or("missing payload")?;
    if let Some(id) = payload.as_i64() {
        return Ok(id);
    }
    payload
        .get("id")
        .or_else(|| payload.get("track_id"))
        .and_then(Value::as_i64)
        .ok_or_else(|| "payload has no track id".to_string())
}

fn review_from_payload(payload: Option<&Value>) -> Result<ReviewCandidate, String> {
    let payload = payload.ok_or("missing payload")?;
    serde_json::from_value(payload.clone()).map_err(|err| err.to_string())
}

pub fn decode_action(event: &PushEvent) -> ActionDecode {
    let Some(key) = event.action_key.as_deref() else {
        return ActionDecode::Ignored;
    };
    let payload = event.action_payload.as_ref();

    let decoded = match key {
        "track_added" => track_from_payload(payload).map(SyncAction::TrackAdded),
        "track_updated" => track_from_payload(payload).map(SyncAction::TrackUpdated),
        "track_deleted" => track_id_from_payload(payload).map(SyncAction::TrackDeleted),
        "download_started" => Ok(SyncAction::Download(DownloadEvent::Started)),
        "download_completed" => Ok(SyncAction::Download(DownloadEvent::Completed)),
        "download_failed" => Ok(SyncAction::Download(DownloadEvent::Failed {
            error: payload
                .and_then(|value| value.get("error"))
                .and_then(Value::as_str)
                .map(ToString::to_string),
        })),
        "download_ready_for_review" => review_from_payload(payload)
            .map(|candidate| SyncAction::Download(DownloadEvent::ReadyForReview(candidate))),
        _ => return ActionDecode::Ignored,
    };

    match decoded {
        Ok(action) => ActionDecode::Action(action),
        Err(reason) => ActionDecode::Malformed {
            key: key.to_string(),
            reason,
        },
    }
}

/// Engine-side half of the push channel.
pub struct EventSyncChannel {
    recent: RecentEvents,
    status: ConnectionStatus,
    notifications: Subject<Notification>,
    status_events: Subject<ConnectionStatus>,
}

impl EventSyncChannel {
    pub fn new(recent_capacity: usize) -> Self {
        Self {
            recent: RecentEvents::with_capacity(recent_capacity),
            status: ConnectionStatus::Disconnected,
            notifications: Subject::new(),
            status_events: Subject::new(),
        }
    }

    pub fn subscribe_notifications<F>(&mut self, observer: F) -> SubscriptionId
    where
        F: FnMut(&Notification) + 'static,
    {
        self.notifications.subscribe(observer)
    }

    pub fn subscribe_status<F>(&mut self, observer: F) -> SubscriptionId
    where
        F: FnMut(&ConnectionStatus) + 'static,
    {
        self.status_events.subscribe(observer)
    }

    pub fn recent_events(&self) -> &RecentEvents {
        &self.recent
    }

    pub fn status(&self) -> ConnectionStatus {
        self.status
    }

    pub fn handle_status(&mut self, status: ConnectionStatus) {
        if self.status != status {
            self.status = status;
            self.status_events.notify(&status);
        }
    }

    /// Records the event, publishes its message, then applies its action.
    pub fn handle_push_event(
        &mut self,
        event: PushEvent,
        tracks: &mut dyn TrackCollection,
        downloads: &mut DownloadTracker,
    ) {
        let event = self.recent.record(event).event.clone();

        if let Some(message) = event.message_to_show.as_deref() {
            self.notifications.notify(&Notification {
                level: event.level(),
                message: message.to_string(),
            });
        }

        match decode_action(&event) {
            ActionDecode::Action(action) => apply_action(action, tracks, downloads),
            ActionDecode::Ignored => {
                if let Some(key) = event.action_key.as_deref() {
                    debug!("EventSync: ignoring unknown action {}", key);
                }
            }
            ActionDecode::Malformed { key, reason } => {
                warn!("EventSync: dropping {} with bad payload: {}", key, reason);
            }
        }
    }
}

fn apply_action(
    action: SyncAction,
    tracks: &mut dyn TrackCollection,
    downloads: &mut DownloadTracker,
) {
    match action {
        SyncAction::TrackAdded(track) => tracks.add_track(track),
        SyncAction::TrackUpdated(track) => tracks.replace_track(track),
        SyncAction::TrackDeleted(id) => tracks.remove_track(id),
        SyncAction::Download(event) => downloads.apply(event),
    }
}

/// Reads an SSE stream, handing each complete event's data to `on_data`. Returns when
/// the stream ends or `on_data` breaks.
pub fn read_sse_stream<R, F>(reader: R, mut on_data: F) -> Result<ControlFlow<()>, SyncError>
where
    R: BufRead,
    F: FnMut(String) -> ControlFlow<()>,
{
    let mut data: Option<String> = None;
    for line in reader.lines() {
        let line = line?;
        let line = line.strip_suffix('\r').unwrap_or(&line);

        if line.is_empty() {
            if let Some(payload) = data.take() {
                if on_data(payload).is_break() {
                    return Ok(ControlFlow::Break(()));
                }
            }
            continue;
        }
        if line.starts_with(':') {
            continue;
        }

        let (field, value) = match line.split_once(':') {
            Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
            None => (line, ""),
        };
        if field == "data" {
            match data.as_mut() {
                Some(buffer) => {
                    buffer.push('\n');
                    buffer.push_str(value);
                }
                None => data = Some(value.to_string()),
            }
        }
    }
    Ok(ControlFlow::Continue(()))
}

/// Opens the push stream.
pub trait PushConnector: Send {
    fn connect(&self) -> Result<Box<dyn BufRead + Send>, SyncError>;
}

/// `ureq`-backed SSE connector. No read timeout: the stream is long-lived.
pub struct HttpPushConnector {
    url: String,
    agent: ureq::Agent,
}

impl HttpPushConnector {
    pub fn new(url: String, connect_timeout: Duration) -> Self {
        let agent = ureq::AgentBuilder::new()
            .timeout_connect(connect_timeout)
            .build();
        Self { url, agent }
    }
}

impl PushConnector for HttpPushConnector {
    fn connect(&self) -> Result<Box<dyn BufRead + Send>, SyncError> {
        let response = self
            .agent
            .get(&self.url)
            .set("Accept", "text/event-stream")
            .set("Cache-Control", "no-cache")
            .call()
            .map_err(|err| SyncError::Connect(format!("{}: {}", self.url, err)))?;
        Ok(Box::new(BufReader::new(response.into_reader())))
    }
}

/// Owner handle for the supervisor thread. Dropping it stops the supervisor.
pub struct SyncSupervisorHandle {
    shutdown_tx: Option<mpsc::Sender<()>>,
    thread: Option<JoinHandle<()>>,
}

impl SyncSupervisorHandle {
    /// Cancels the reconnect wait and stops the loop. Idempotent.
    ///
    /// A supervisor blocked inside an open stream notices at the next received event;
    /// the thread is not joined so shutdown never waits on the network.
    pub fn shutdown(&mut self) {
        if let Some(shutdown_tx) = self.shutdown_tx.take() {
            info!("EventSync: stopping push supervisor");
            let _ = shutdown_tx.send(());
        }
        if let Some(thread) = self.thread.take() {
            if thread.is_finished() {
                let _ = thread.join();
            }
        }
    }
}

impl Drop for SyncSupervisorHandle {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Spawns the connect / read / wait / reconnect loop on a dedicated thread.
pub fn spawn_supervisor(
    connector: Box<dyn PushConnector>,
    bus_producer: Sender<Message>,
    reconnect_delay: Duration,
) -> SyncSupervisorHandle {
    let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>();
    let thread = thread::Builder::new()
        .name("event-sync".to_string())
        .spawn(move || run_supervisor(connector, bus_producer, shutdown_rx, reconnect_delay));

    let thread = match thread {
        Ok(thread) => Some(thread),
        Err(err) => {
            warn!("EventSync: failed to spawn supervisor thread: {}", err);
            None
        }
    };
    SyncSupervisorHandle {
        shutdown_tx: Some(shutdown_tx),
        thread,
    }
}

fn publish_status(bus_producer: &Sender<Message>, status: ConnectionStatus) {
    let _ = bus_producer.send(Message::Sync(SyncMessage::ConnectionChanged(status)));
}

fn run_supervisor(
    connector: Box<dyn PushConnector>,
    bus_producer: Sender<Message>,
    shutdown_rx: mpsc::Receiver<()>,
    reconnect_delay: Duration,
) {
    info!("EventSync: supervisor started");
    loop {
        match connector.connect() {
            Ok(reader) => {
                info!("EventSync: connected");
                publish_status(&bus_producer, ConnectionStatus::Connected);

                let result = read_sse_stream(reader, |payload| {
                    if !matches!(shutdown_rx.try_recv(), Err(mpsc::TryRecvError::Empty)) {
                        return ControlFlow::Break(());
                    }
                    match serde_json::from_str::<PushEvent>(&payload) {
                        Ok(event) => {
                            if bus_producer
                                .send(Message::Sync(SyncMessage::EventReceived(event)))
                                .is_err()
                            {
                                return ControlFlow::Break(());
                            }
                        }
                        Err(err) => warn!("EventSync: skipping undecodable event: {}", err),
                    }
                    ControlFlow::Continue(())
                });

                publish_status(&bus_producer, ConnectionStatus::Disconnected);
                match result {
                    Ok(ControlFlow::Break(())) => break,
                    Ok(ControlFlow::Continue(())) => warn!("EventSync: {}", SyncError::Closed),
                    Err(err) => warn!("EventSync: {}", err),
                }
            }
            Err(err) => warn!("EventSync: {}", err),
        }

        debug!(
            "EventSync: reconnecting in {}s",
            reconnect_delay.as_secs_f64()
        );
        match shutdown_rx.recv_timeout(reconnect_delay) {
            Err(RecvTimeoutError::Timeout) => continue,
            Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
        }
    }
    info!("EventSync: supervisor stopped");
}
