//! Playback-state sanitization.
//!
//! Streaming apps leak a surprising amount of noise into the now-playing
//! stream: snapshots pushed before metadata finished loading, "now playing"
//! signals fired by menu previews, and advertisement titles stomping over the
//! actual content. Every raw snapshot passes through here before it may be
//! surfaced; the gates run in a fixed order and each one can reject the
//! snapshot or substitute another.

use serde::Serialize;

use crate::device::{AppInfo, MediaKind, PlayState, PlayingSnapshot};

/// Case-insensitive substrings that mark a title as advertisement content.
const AD_MARKERS: &[&str] = &[
    "[ad]",
    "[youtube ad]",
    "advertisement",
    "skip ad",
    "sponsored",
    "ad - ",
];

/// A snapshot that passed sanitization, ready to be surfaced.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct SanitizedPlayback {
    pub title: String,
    pub artist: Option<String>,
    pub album: Option<String>,
    pub state: PlayState,
    #[serde(rename = "media_type")]
    pub media_kind: MediaKind,
    pub position: Option<u64>,
    pub total_time: Option<u64>,
    pub app_name: Option<String>,
    pub app_id: Option<String>,
}

/// Per-listener sanitization filter.
///
/// Holds the last valid content snapshot so advertisement events can be
/// substituted with the real content they interrupted.
#[derive(Debug, Default)]
pub struct PlaybackSanitizer {
    last_valid_content: Option<SanitizedPlayback>,
}

impl PlaybackSanitizer {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Applies all gates to a raw snapshot.
    ///
    /// Returns `None` when the snapshot should not be surfaced at all, the
    /// last valid content when an advertisement is substituted, or the
    /// sanitized snapshot otherwise.
    pub fn sanitize(
        &mut self,
        snapshot: &PlayingSnapshot,
        app: Option<&AppInfo>,
    ) -> Option<SanitizedPlayback> {
        let app_id = app
            .and_then(|a| a.identifier.as_deref())
            .unwrap_or_default()
            .to_ascii_lowercase();

        let Some(title) = complete_title(snapshot) else {
            debug!(
                "filtered incomplete metadata: title={:?} total_time={:?}",
                snapshot.title, snapshot.total_time
            );
            return None;
        };

        if !duration_settled(snapshot) {
            debug!("filtered snapshot with unloaded duration: {title}");
            return None;
        }

        if is_preview_prone(&app_id) && is_phantom_state(snapshot) {
            debug!("filtered menu-preview phantom state: {title}");
            return None;
        }

        if is_ad_supported(&app_id) && is_ad_title(&title) {
            debug!("substituting last valid content for ad: {title}");
            return self.last_valid_content.clone();
        }

        let sanitized = SanitizedPlayback {
            title,
            artist: snapshot.artist.clone(),
            album: snapshot.album.clone(),
            state: snapshot.state,
            media_kind: snapshot.media_kind,
            position: snapshot.position,
            total_time: snapshot.total_time,
            app_name: app.and_then(|a| a.name.clone()),
            app_id: app.and_then(|a| a.identifier.clone()),
        };

        if snapshot.total_time.unwrap_or(0) > 0 {
            self.last_valid_content = Some(sanitized.clone());
        }

        Some(sanitized)
    }
}

fn complete_title(snapshot: &PlayingSnapshot) -> Option<String> {
    let title = snapshot.title.as_deref()?.trim();
    if title.is_empty() {
        return None;
    }
    Some(title.to_string())
}

/// Whether the duration field can be trusted yet.
///
/// A zero or absent duration on active content is the signature of metadata
/// still loading, not of a real zero-length item. Idle, stopped and paused
/// states carry no such requirement.
fn duration_settled(snapshot: &PlayingSnapshot) -> bool {
    match snapshot.state {
        PlayState::Idle | PlayState::Stopped | PlayState::Paused => true,
        _ => snapshot.total_time.unwrap_or(0) > 0,
    }
}

/// Apps whose home screens autoplay previews, firing spurious "now playing"
/// signals for content that is not actually on screen.
fn is_preview_prone(app_id: &str) -> bool {
    app_id.contains("netflix")
}

/// A preview phantom: claims to be playing but has no duration. Paused and
/// idle states are exempt since previews never pause.
fn is_phantom_state(snapshot: &PlayingSnapshot) -> bool {
    snapshot.state == PlayState::Playing && snapshot.total_time.unwrap_or(0) == 0
}

/// Apps that interleave advertisements into the now-playing stream.
fn is_ad_supported(app_id: &str) -> bool {
    app_id.contains("youtube")
}

fn is_ad_title(title: &str) -> bool {
    let lowered = title.to_lowercase();
    AD_MARKERS.iter().any(|marker| lowered.contains(marker))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snapshot(state: PlayState, title: Option<&str>, total_time: Option<u64>) -> PlayingSnapshot {
        PlayingSnapshot {
            state,
            media_kind: MediaKind::Video,
            title: title.map(str::to_string),
            artist: None,
            album: None,
            position: Some(10),
            total_time,
            content_hash: Some("hash-1".into()),
        }
    }

    fn app(identifier: &str) -> AppInfo {
        AppInfo {
            name: Some(identifier.to_string()),
            identifier: Some(identifier.to_string()),
        }
    }

    #[test]
    fn rejects_missing_or_blank_title() {
        let mut sanitizer = PlaybackSanitizer::new();
        let no_title = snapshot(PlayState::Playing, None, Some(3600));
        assert!(sanitizer.sanitize(&no_title, None).is_none());

        let blank = snapshot(PlayState::Playing, Some("   "), Some(3600));
        assert!(sanitizer.sanitize(&blank, None).is_none());
    }

    #[test]
    fn rejects_playing_with_zero_duration() {
        let mut sanitizer = PlaybackSanitizer::new();
        let loading = snapshot(PlayState::Playing, Some("Show A"), Some(0));
        assert!(sanitizer.sanitize(&loading, None).is_none());

        let absent = snapshot(PlayState::Playing, Some("Show A"), None);
        assert!(sanitizer.sanitize(&absent, None).is_none());
    }

    #[test]
    fn accepts_paused_without_duration() {
        let mut sanitizer = PlaybackSanitizer::new();
        let paused = snapshot(PlayState::Paused, Some("Show A"), Some(0));
        let result = sanitizer.sanitize(&paused, None).unwrap();
        assert_eq!(result.title, "Show A");
        assert_eq!(result.state, PlayState::Paused);
    }

    #[test]
    fn accepts_idle_and_stopped_without_duration() {
        let mut sanitizer = PlaybackSanitizer::new();
        for state in [PlayState::Idle, PlayState::Stopped] {
            let raw = snapshot(state, Some("Menu"), None);
            assert!(sanitizer.sanitize(&raw, None).is_some(), "{state:?}");
        }
    }

    #[test]
    fn rejects_preview_phantom_for_preview_prone_app() {
        let mut sanitizer = PlaybackSanitizer::new();
        let phantom = snapshot(PlayState::Playing, Some("Previously Watched"), Some(0));
        assert!(sanitizer
            .sanitize(&phantom, Some(&app("com.netflix.Netflix")))
            .is_none());
    }

    #[test]
    fn substitutes_last_valid_content_for_ads() {
        let mut sanitizer = PlaybackSanitizer::new();
        let youtube = app("com.google.ios.youtube");

        let real = snapshot(PlayState::Playing, Some("Ferris Builds a Shed"), Some(900));
        let cached = sanitizer.sanitize(&real, Some(&youtube)).unwrap();

        let ad = snapshot(PlayState::Playing, Some("[Ad] Brand Thing"), Some(15));
        let substituted = sanitizer.sanitize(&ad, Some(&youtube)).unwrap();
        assert_eq!(substituted, cached);
    }

    #[test]
    fn ad_with_no_cached_content_yields_nothing() {
        let mut sanitizer = PlaybackSanitizer::new();
        let ad = snapshot(PlayState::Playing, Some("Sponsored content"), Some(15));
        assert!(sanitizer
            .sanitize(&ad, Some(&app("com.google.ios.youtube")))
            .is_none());
    }

    #[test]
    fn ad_markers_match_case_insensitively() {
        for title in ["[AD] loud brand", "Skip Ad in 5", "AD - something"] {
            assert!(is_ad_title(title), "{title}");
        }
        assert!(!is_ad_title("Madly Deeply"));
        assert!(!is_ad_title("Breaking Bad"));
    }

    #[test]
    fn ad_titles_pass_through_for_other_apps() {
        let mut sanitizer = PlaybackSanitizer::new();
        let raw = snapshot(PlayState::Playing, Some("[Ad] Not Really"), Some(60));
        let result = sanitizer.sanitize(&raw, Some(&app("tv.plex.client"))).unwrap();
        assert_eq!(result.title, "[Ad] Not Really");
    }

    #[test]
    fn valid_content_refreshes_the_cache() {
        let mut sanitizer = PlaybackSanitizer::new();
        let youtube = app("com.google.ios.youtube");

        let first = snapshot(PlayState::Playing, Some("First Video"), Some(600));
        sanitizer.sanitize(&first, Some(&youtube));
        let second = snapshot(PlayState::Playing, Some("Second Video"), Some(700));
        sanitizer.sanitize(&second, Some(&youtube));

        let ad = snapshot(PlayState::Playing, Some("[Ad] Interruption"), Some(15));
        let substituted = sanitizer.sanitize(&ad, Some(&youtube)).unwrap();
        assert_eq!(substituted.title, "Second Video");
    }

    #[test]
    fn zero_duration_paused_content_is_not_cached() {
        let mut sanitizer = PlaybackSanitizer::new();
        let youtube = app("com.google.ios.youtube");

        let paused = snapshot(PlayState::Paused, Some("Half Loaded"), Some(0));
        assert!(sanitizer.sanitize(&paused, Some(&youtube)).is_some());

        // Nothing valid cached yet, so the ad yields nothing.
        let ad = snapshot(PlayState::Playing, Some("[Ad] Brand"), Some(15));
        assert!(sanitizer.sanitize(&ad, Some(&youtube)).is_none());
    }
}
