//! HTTP client for the library backend.

use std::time::Duration;

use log::{debug, warn};
use serde_json::Value;

use crate::config::BackendConfig;
use crate::download_tracker::DownloadTrigger;
use crate::error::BackendError;
use crate::model::Track;
use crate::player_state::{PlayerStateSnapshot, PlayerStateStore};

const BEACON_TIMEOUT: Duration = Duration::from_secs(2);

/// `ureq`-backed client for tracks, player state and download requests.
pub struct BackendClient {
    config: BackendConfig,
    http_client: ureq::Agent,
}

impl BackendClient {
    pub fn new(config: BackendConfig) -> Self {
        let timeout = Duration::from_secs(config.request_timeout_secs);
        let http_client = ureq::AgentBuilder::new()
            .timeout_connect(Duration::from_secs(5).min(timeout))
            .timeout_read(timeout)
            .timeout_write(timeout)
            .build();
        Self {
            config,
            http_client,
        }
    }

    pub fn config(&self) -> &BackendConfig {
        &self.config
    }

    /// Full library listing, fetched once at startup.
    pub fn fetch_tracks(&self) -> Result<Vec<Track>, BackendError> {
        let url = self.config.url(&self.config.tracks_path);
        let response = self
            .http_client
            .get(&url)
            .call()
            .map_err(|err| map_request_error(&url, err))?;
        let body = response.into_string().map_err(|err| BackendError::Decode {
            url: url.clone(),
            message: err.to_string(),
        })?;
        parse_track_list(&body).map_err(|message| BackendError::Decode { url, message })
    }
}

fn map_request_error(url: &str, err: ureq::Error) -> BackendError {
    match err {
        ureq::Error::Status(status, _) => BackendError::Status {
            url: url.to_string(),
            status,
        },
        ureq::Error::Transport(transport) => BackendError::Transport {
            url: url.to_string(),
            message: transport.to_string(),
        },
    }
}

/// Accepts a bare array or an object wrapping it under `tracks`. Entries that do not
/// decode are skipped.
pub fn parse_track_list(body: &str) -> Result<Vec<Track>, String> {
    let parsed: Value = serde_json::from_str(body).map_err(|err| err.to_string())?;
    let items = match &parsed {
        Value::Array(items) => items,
        Value::Object(_) => match parsed.get("tracks") {
            Some(Value::Array(items)) => items,
            _ => return Err("response has no track array".to_string()),
        },
        _ => return Err("unexpected track list shape".to_string()),
    };

    Ok(items
        .iter()
        .filter_map(|item| match serde_json::from_value::<Track>(item.clone()) {
            Ok(track) => Some(track),
            Err(err) => {
                warn!("BackendClient: skipping undecodable track: {}", err);
                None
            }
        })
        .collect())
}

/// Empty or `null` bodies mean no state has been persisted yet.
pub fn parse_player_state(body: &str) -> Result<PlayerStateSnapshot, String> {
    let trimmed = body.trim();
    if trimmed.is_empty() || trimmed == "null" {
        return Ok(PlayerStateSnapshot::default());
    }
    serde_json::from_str(trimmed).map_err(|err| err.to_string())
}

impl PlayerStateStore for BackendClient {
    fn fetch(&self) -> Result<PlayerStateSnapshot, BackendError> {
        let url = self.config.url(&self.config.player_state_path);
        let response = match self.http_client.get(&url).call() {
            Ok(response) => response,
            Err(ureq::Error::Status(404, _)) => {
                debug!("BackendClient: no persisted player state");
                return Ok(PlayerStateSnapshot::default());
            }
            Err(err) => return Err(map_request_error(&url, err)),
        };
        let body = response.into_string().map_err(|err| BackendError::Decode {
            url: url.clone(),
            message: err.to_string(),
        })?;
        parse_player_state(&body).map_err(|message| BackendError::Decode { url, message })
    }

    fn save(&self, snapshot: &PlayerStateSnapshot) -> Result<(), BackendError> {
        let url = self.config.url(&self.config.player_state_path);
        self.http_client
            .post(&url)
            .send_json(snapshot)
            .map_err(|err| map_request_error(&url, err))?;
        Ok(())
    }

    fn send_beacon(&self, snapshot: &PlayerStateSnapshot) {
        let url = self.config.url(&self.config.player_state_path);
        let agent = ureq::AgentBuilder::new().timeout(BEACON_TIMEOUT).build();
        match agent.post(&url).send_json(snapshot) {
            Ok(_) => debug!("BackendClient: beacon delivered to {}", url),
            Err(err) => warn!("BackendClient: beacon to {} failed: {}", url, err),
        }
    }
}

impl DownloadTrigger for BackendClient {
    fn trigger_download(&self, url: &str) -> Result<(), BackendError> {
        let endpoint = self.config.url(&self.config.download_path);
        self.http_client
            .post(&endpoint)
            .send_json(serde_json::json!({ "url": url }))
            .map_err(|err| map_request_error(&endpoint, err))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::io::{Read, Write};
    use std::net::TcpListener;
    use std::sync::mpsc;
    use std::thread;
    use std::time::{Duration, Instant};

    use super::{parse_player_state, parse_track_list, BackendClient};
    use crate::config::BackendConfig;
    use crate::download_tracker::DownloadTrigger;
    use crate::error::BackendError;
    use crate::player_state::{PlayerStateSnapshot, PlayerStateStore};

    fn unreachable_client() -> BackendClient {
        BackendClient::new(BackendConfig {
            base_url: "http://127.0.0.1:1".to_string(),
            request_timeout_secs: 1,
            ..BackendConfig::default()
        })
    }

    #[test]
    fn test_parse_track_list_accepts_bare_and_wrapped_arrays() {
        let bare = parse_track_list(r#"[{"id": 1, "title": "A", "artist": "B"}]"#)
            .expect("bare list should parse");
        assert_eq!(bare.len(), 1);

        let wrapped = parse_track_list(r#"{"tracks": [{"id": 2}, {"id": 3}]}"#)
            .expect("wrapped list should parse");
        let ids: Vec<i64> = wrapped.iter().map(|track| track.id).collect();
        assert_eq!(ids, vec![2, 3]);
    }

    #[test]
    fn test_parse_track_list_skips_bad_entries_and_rejects_bad_shapes() {
        let tracks = parse_track_list(r#"[{"id": 1}, {"title": "no id"}]"#).expect("list");
        assert_eq!(tracks.len(), 1);

        assert!(parse_track_list(r#"{"items": []}"#).is_err());
        assert!(parse_track_list("42").is_err());
        assert!(parse_track_list("not json").is_err());
    }

    #[test]
    fn test_parse_player_state_defaults_on_empty_body() {
        assert_eq!(
            parse_player_state("  ").expect("empty body"),
            PlayerStateSnapshot::default()
        );
        assert_eq!(
            parse_player_state("null").expect("null body"),
            PlayerStateSnapshot::default()
        );
        let parsed = parse_player_state(r#"{"current_track_id": 8, "is_shuffle": true}"#)
            .expect("partial state");
        assert_eq!(parsed.current_track_id, Some(8));
        assert!(parsed.is_shuffle);
        assert_eq!(parsed.volume_level, 1.0);
    }

    #[test]
    fn test_unreachable_backend_maps_to_transport_errors() {
        let client = unreachable_client();

        assert!(matches!(
            client.fetch_tracks(),
            Err(BackendError::Transport { .. })
        ));
        assert!(matches!(
            client.save(&PlayerStateSnapshot::default()),
            Err(BackendError::Transport { .. })
        ));
        assert!(matches!(
            client.trigger_download("https://example.com/v"),
            Err(BackendError::Transport { .. })
        ));
    }

    /// Accepts one request, reports it once the JSON body is complete, then answers 200.
    fn spawn_recording_server() -> (String, mpsc::Receiver<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
        let address = listener.local_addr().expect("address");
        let (tx, rx) = mpsc::channel();
        thread::spawn(move || {
            let Ok((mut stream, _)) = listener.accept() else {
                return;
            };
            let mut request = Vec::new();
            let mut chunk = [0u8; 1024];
            loop {
                let read = stream.read(&mut chunk).unwrap_or(0);
                if read == 0 {
                    break;
                }
                request.extend_from_slice(&chunk[..read]);
                let text = String::from_utf8_lossy(&request);
                if text.contains("is_repeat") && text.trim_end().ends_with('}') {
                    break;
                }
            }
            let _ = tx.send(String::from_utf8_lossy(&request).into_owned());
            let _ = stream.write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 0\r\n\r\n");
        });
        (format!("http://{}", address), rx)
    }

    #[test]
    fn test_beacon_is_delivered_before_returning() {
        let (base_url, requests) = spawn_recording_server();
        let client = BackendClient::new(BackendConfig {
            base_url,
            ..BackendConfig::default()
        });
        let snapshot = PlayerStateSnapshot {
            current_track_id: Some(4),
            is_repeat: true,
            ..PlayerStateSnapshot::default()
        };

        client.send_beacon(&snapshot);

        let request = requests
            .try_recv()
            .expect("beacon should be delivered before send_beacon returns");
        assert!(request.starts_with("POST "));
        assert!(request.contains(&client.config().player_state_path));
        assert!(request.contains("\"current_track_id\":4"));
        assert!(request.contains("\"is_repeat\":true"));
    }

    #[test]
    fn test_beacon_to_unreachable_backend_returns_within_timeout() {
        let client = unreachable_client();
        let started = Instant::now();

        client.send_beacon(&PlayerStateSnapshot::default());

        assert!(started.elapsed() < Duration::from_secs(5));
    }
}
