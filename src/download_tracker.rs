//! Single-slot background download state machine.
//!
//! `Idle -> Downloading -> {Completed | AwaitingReview | Failed}`. Any state can be
//! forced back to `Downloading` by a fresh start, and only the consumer resets to `Idle`.

use log::{debug, info, warn};

use crate::error::BackendError;
use crate::observable::{Subject, SubscriptionId};

const DEFAULT_FAILURE_MESSAGE: &str = "Download failed";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DownloadState {
    #[default]
    Idle,
    Downloading,
    AwaitingReview,
    Completed,
    Failed,
}

/// Pending item a human confirms or discards before it is committed server-side.
#[derive(Debug, Clone, PartialEq, serde::Deserialize, serde::Serialize)]
pub struct ReviewCandidate {
    #[serde(alias = "tempId")]
    pub temp_id: String,
    #[serde(default, alias = "suggestedTitle")]
    pub suggested_title: Option<String>,
    #[serde(default, alias = "suggestedArtist")]
    pub suggested_artist: Option<String>,
    #[serde(default, alias = "coverDataUrl")]
    pub cover_data_url: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct DownloadJob {
    pub state: DownloadState,
    pub error: Option<String>,
    pub review: Option<ReviewCandidate>,
}

/// Push-driven transitions.
#[derive(Debug, Clone, PartialEq)]
pub enum DownloadEvent {
    Started,
    Completed,
    Failed { error: Option<String> },
    ReadyForReview(ReviewCandidate),
}

/// Issues the download POST. The outcome arrives later as push events.
pub trait DownloadTrigger {
    fn trigger_download(&self, url: &str) -> Result<(), BackendError>;
}

#[derive(Default)]
pub struct DownloadTracker {
    job: DownloadJob,
    events: Subject<DownloadJob>,
}

impl DownloadTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe<F>(&mut self, observer: F) -> SubscriptionId
    where
        F: FnMut(&DownloadJob) + 'static,
    {
        self.events.subscribe(observer)
    }

    pub fn job(&self) -> &DownloadJob {
        &self.job
    }

    pub fn state(&self) -> DownloadState {
        self.job.state
    }

    /// Local start: `Downloading` with every result field cleared.
    pub fn start(&mut self) {
        self.transition(DownloadJob {
            state: DownloadState::Downloading,
            error: None,
            review: None,
        });
    }

    pub fn reset(&mut self) {
        self.transition(DownloadJob::default());
    }

    pub fn apply(&mut self, event: DownloadEvent) {
        let next = match event {
            DownloadEvent::Started => DownloadJob {
                state: DownloadState::Downloading,
                error: None,
                review: None,
            },
            DownloadEvent::Completed => DownloadJob {
                state: DownloadState::Completed,
                error: None,
                review: None,
            },
            DownloadEvent::Failed { error } => DownloadJob {
                state: DownloadState::Failed,
                error: Some(error.unwrap_or_else(|| DEFAULT_FAILURE_MESSAGE.to_string())),
                review: None,
            },
            DownloadEvent::ReadyForReview(candidate) => DownloadJob {
                state: DownloadState::AwaitingReview,
                error: None,
                review: Some(candidate),
            },
        };
        self.transition(next);
    }

    /// Starts a download of `url`. A rejected request becomes `Failed` immediately.
    pub fn request_download(&mut self, url: &str, trigger: &dyn DownloadTrigger) {
        let url = url.trim();
        if url.is_empty() {
            self.apply(DownloadEvent::Failed {
                error: Some("Download URL is empty".to_string()),
            });
            return;
        }

        self.start();
        info!("DownloadTracker: requesting download of {}", url);
        if let Err(err) = trigger.trigger_download(url) {
            warn!("DownloadTracker: download request failed: {}", err);
            self.apply(DownloadEvent::Failed {
                error: Some(err.to_string()),
            });
        }
    }

    fn transition(&mut self, next: DownloadJob) {
        if next == self.job {
            return;
        }
        debug!(
            "DownloadTracker: {:?} -> {:?}",
            self.job.state, next.state
        );
        self.job = next;
        self.events.notify(&self.job);
    }
}


#[cfg(test)]
mod tests {
    use std::cell::RefCell;
    use std::rc::Rc;

    use super::test_support::RecordingTrigger;
    use super::{DownloadEvent, DownloadState, DownloadTracker, ReviewCandidate};

    fn candidate() -> ReviewCandidate {
        ReviewCandidate {
            temp_id: "tmp-1".to_string(),
            suggested_title: Some("Song".to_string()),
            suggested_artist: Some("Band".to_string()),
            cover_data_url: None,
        }
    }

    #[test]
    fn test_failure_then_restart_clears_error() {
        let mut tracker = DownloadTracker::new();
        tracker.start();
        tracker.apply(DownloadEvent::Failed {
            error: Some("x".to_string()),
        });
        assert_eq!(tracker.state(), DownloadState::Failed);
        assert_eq!(tracker.job().error.as_deref(), Some("x"));

        tracker.start();

        assert_eq!(tracker.state(), DownloadState::Downloading);
        assert!(tracker.job().error.is_none());
    }

    #[test]
    fn test_review_then_reset_returns_to_idle() {
        let mut tracker = DownloadTracker::new();
        tracker.apply(DownloadEvent::Started);
        tracker.apply(DownloadEvent::ReadyForReview(candidate()));
        assert_eq!(tracker.state(), DownloadState::AwaitingReview);
        assert_eq!(tracker.job().review, Some(candidate()));

        tracker.reset();

        assert_eq!(tracker.state(), DownloadState::Idle);
        assert!(tracker.job().review.is_none());
    }

    #[test]
    fn test_start_from_review_clears_candidate() {
        let mut tracker = DownloadTracker::new();
        tracker.apply(DownloadEvent::ReadyForReview(candidate()));
        tracker.start();
        assert_eq!(tracker.state(), DownloadState::Downloading);
        assert!(tracker.job().review.is_none());
    }

    #[test]
    fn test_failure_without_message_gets_default_text() {
        let mut tracker = DownloadTracker::new();
        tracker.apply(DownloadEvent::Failed { error: None });
        assert_eq!(tracker.job().error.as_deref(), Some("Download failed"));
    }

    #[test]
    fn test_request_download_posts_url_and_starts() {
        let mut tracker = DownloadTracker::new();
        let trigger = RecordingTrigger::default();

        tracker.request_download(" https://example.com/v ", &trigger);

        assert_eq!(tracker.state(), DownloadState::Downloading);
        assert_eq!(
            *trigger.requested.borrow(),
            vec!["https://example.com/v".to_string()]
        );
    }

    #[test]
    fn test_request_download_failure_becomes_failed_state() {
        let mut tracker = DownloadTracker::new();
        let trigger = RecordingTrigger {
            fail_with: Some(502),
            ..RecordingTrigger::default()
        };

        tracker.request_download("https://example.com/v", &trigger);

        assert_eq!(tracker.state(), DownloadState::Failed);
        assert!(tracker
            .job()
            .error
            .as_deref()
            .is_some_and(|error| error.contains("502")));
    }

    #[test]
    fn test_request_download_rejects_empty_url() {
        let mut tracker = DownloadTracker::new();
        let trigger = RecordingTrigger::default();
        tracker.request_download("   ", &trigger);
        assert_eq!(tracker.state(), DownloadState::Failed);
        assert!(trigger.requested.borrow().is_empty());
    }

    #[test]
    fn test_observers_see_each_transition_once() {
        let mut tracker = DownloadTracker::new();
        let seen = Rc::new(RefCell::new(Vec::new()));
        let sink = Rc::clone(&seen);
        tracker.subscribe(move |job| sink.borrow_mut().push(job.state));

        tracker.start();
        tracker.apply(DownloadEvent::Started);
        tracker.apply(DownloadEvent::Completed);

        assert_eq!(
            *seen.borrow(),
            vec![DownloadState::Downloading, DownloadState::Completed]
        );
    }

    #[test]
    fn test_review_candidate_accepts_camel_case_payload() {
        let decoded: ReviewCandidate = serde_json::from_str(
            r#"{"tempId": "t9", "suggestedTitle": "A", "coverDataUrl": "data:image/png;base64,AA"}"#,
        )
        .expect("candidate should decode");
        assert_eq!(decoded.temp_id, "t9");
        assert_eq!(decoded.suggested_title.as_deref(), Some("A"));
        assert!(decoded.suggested_artist.is_none());
    }
}
