use std::path::PathBuf;
use url::Url;

fn host_from_url(url: &str) -> Option<String> {
    Url::parse(url.trim())
        .ok()?
        .host_str()
        .map(|h| h.to_ascii_lowercase())
}

pub fn is_youtube_url(url: &str) -> bool {
    let host = match host_from_url(url) {
        Some(v) => v,
        None => return false,
    };

    host == "youtube.com"
        || host == "www.youtube.com"
        || host == "m.youtube.com"
        || host == "music.youtube.com"
        || host == "youtu.be"
        || host.ends_with(".youtube.com")
}

fn is_video_id(candidate: &str) -> bool {
    candidate.len() == 11
        && candidate
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}

/// Extracts the 11-character video id from the common YouTube URL shapes.
pub fn youtube_video_id(url: &str) -> Option<String> {
    if !is_youtube_url(url) {
        return None;
    }
    let parsed = Url::parse(url.trim()).ok()?;
    let host = parsed.host_str()?.to_ascii_lowercase();
    let mut segments = parsed.path_segments()?.filter(|s| !s.is_empty());

    let candidate = if host == "youtu.be" {
        segments.next().map(str::to_string)
    } else {
        match segments.next() {
            Some("watch") => parsed
                .query_pairs()
                .find(|(k, _)| k == "v")
                .map(|(_, v)| v.into_owned()),
            Some("shorts" | "live" | "embed" | "v") => segments.next().map(str::to_string),
            _ => None,
        }
    }?;

    if is_video_id(&candidate) {
        Some(candidate)
    } else {
        None
    }
}

/// Local path for `file://` URLs.
pub fn local_file_path(url: &str) -> Option<PathBuf> {
    let parsed = Url::parse(url.trim()).ok()?;
    if parsed.scheme() != "file" {
        return None;
    }
    parsed.to_file_path().ok()
}

pub fn is_remote_url(url: &str) -> bool {
    match Url::parse(url.trim()) {
        Ok(parsed) => matches!(parsed.scheme(), "http" | "https"),
        Err(_) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn youtube_url_detection_covers_common_hosts() {
        assert!(is_youtube_url("https://youtube.com/watch?v=abc"));
        assert!(is_youtube_url("https://www.youtube.com/watch?v=abc"));
        assert!(is_youtube_url("https://music.youtube.com/watch?v=abc"));
        assert!(is_youtube_url("https://youtu.be/abc"));
        assert!(!is_youtube_url("https://vimeo.com/1234"));
        assert!(!is_youtube_url("not a url"));
    }

    #[test]
    fn video_id_is_extracted_from_watch_short_and_shorts_urls() {
        assert_eq!(
            youtube_video_id("https://www.youtube.com/watch?v=dQw4w9WgXcQ&t=42").as_deref(),
            Some("dQw4w9WgXcQ")
        );
        assert_eq!(
            youtube_video_id("https://youtu.be/dQw4w9WgXcQ?si=xyz").as_deref(),
            Some("dQw4w9WgXcQ")
        );
        assert_eq!(
            youtube_video_id("https://www.youtube.com/shorts/dQw4w9WgXcQ").as_deref(),
            Some("dQw4w9WgXcQ")
        );
        assert_eq!(
            youtube_video_id("  https://m.youtube.com/embed/dQw4w9WgXcQ  ").as_deref(),
            Some("dQw4w9WgXcQ")
        );
    }

    #[test]
    fn malformed_ids_and_other_pages_are_rejected() {
        assert_eq!(youtube_video_id("https://www.youtube.com/watch?v=short"), None);
        assert_eq!(youtube_video_id("https://www.youtube.com/@channel/videos"), None);
        assert_eq!(youtube_video_id("https://example.com/watch?v=dQw4w9WgXcQ"), None);
    }

    #[cfg(unix)]
    #[test]
    fn file_urls_resolve_to_local_paths() {
        assert_eq!(
            local_file_path("file:///srv/sounds/hello.mp3"),
            Some(PathBuf::from("/srv/sounds/hello.mp3"))
        );
        assert_eq!(local_file_path("https://example.com/a.mp3"), None);
        assert!(is_remote_url("https://example.com/a.mp3"));
        assert!(!is_remote_url("file:///srv/sounds/hello.mp3"));
    }
}
