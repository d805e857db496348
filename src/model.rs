//! Library data model shared by navigation, transport and sync.

/// Stable backend identity of a track.
pub type TrackId = i64;

/// One library track as served by the backend track list.
#[derive(Debug, Clone, PartialEq, serde::Deserialize, serde::Serialize)]
pub struct Track {
    pub id: TrackId,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub artist: String,
    /// Seconds. Zero until the backend knows the length.
    #[serde(default)]
    pub duration: f64,
    #[serde(default, alias = "cover_path")]
    pub cover_url: Option<String>,
    #[serde(default, alias = "cover_small_path")]
    pub cover_thumb_url: Option<String>,
}

impl Track {
    /// Human-readable "Artist - Title" label, falling back to the bare title.
    pub fn display_name(&self) -> String {
        let artist = self.artist.trim();
        let title = self.title.trim();
        match (artist.is_empty(), title.is_empty()) {
            (false, false) => format!("{artist} - {title}"),
            (true, false) => title.to_string(),
            (false, true) => artist.to_string(),
            (true, true) => format!("Track {}", self.id),
        }
    }
}

#[cfg(test)]
pub(crate) fn test_track(id: TrackId) -> Track {
    Track {
        id,
        title: format!("Title {id}"),
        artist: format!("Artist {id}"),
        duration: 180.0,
        cover_url: None,
        cover_thumb_url: None,
    }
}
