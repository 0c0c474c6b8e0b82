use crate::cache::{self, ContentCache};
use crate::cmd::{self, CommandRunError};
use crate::ffmpeg;
use crate::media_url;
use crate::paths::AppPaths;
use crate::{EngineError, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::process::Output;
use std::sync::Arc;
use std::time::Duration;

const DOWNLOAD_TIMEOUT: Duration = Duration::from_secs(600);
const CAPTION_TIMEOUT: Duration = Duration::from_secs(120);
const LISTING_TIMEOUT: Duration = Duration::from_secs(60);

/// Everything the job worker needs from the outside world to turn a URL into
/// playable audio plus an optional caption track.
#[async_trait]
pub trait MediaSource: Send + Sync {
    async fn fetch_audio(&self, url: &str) -> Result<PathBuf>;

    /// Raw caption track text, or `None` when the track is unavailable.
    async fn fetch_captions(&self, url: &str, language: &str) -> Option<String>;

    async fn trim_audio(
        &self,
        src: &Path,
        start_secs: f64,
        duration_secs: Option<f64>,
    ) -> Result<PathBuf>;

    async fn probe_duration(&self, path: &Path) -> Option<f64>;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CaptionTrackInfo {
    pub language_code: String,
    pub display_name: String,
    pub automatic: bool,
}

/// yt-dlp + ffmpeg backed [`MediaSource`] writing into a [`ContentCache`].
#[derive(Debug, Clone)]
pub struct MediaDownloader {
    paths: AppPaths,
    cache: Arc<ContentCache>,
    trim_timeout: Duration,
}

impl MediaDownloader {
    pub fn new(paths: AppPaths, cache: Arc<ContentCache>) -> Self {
        Self {
            paths,
            cache,
            trim_timeout: ffmpeg::TRIM_TIMEOUT,
        }
    }

    pub fn with_trim_timeout(mut self, timeout: Duration) -> Self {
        self.trim_timeout = timeout;
        self
    }

    pub fn cache(&self) -> &Arc<ContentCache> {
        &self.cache
    }

    pub async fn fetch_caption_track(&self, url: &str, language: &str) -> Option<String> {
        let language = language.trim();
        if language.is_empty() || !media_url::is_remote_url(url) {
            return None;
        }

        let scratch = match tempfile::Builder::new()
            .prefix(".captions-")
            .tempdir_in(self.cache.root())
        {
            Ok(v) => v,
            Err(e) => {
                tracing::warn!(error = %e, "could not create caption scratch directory");
                return None;
            }
        };
        let template = scratch.path().join("%(id)s.%(ext)s");

        let args: Vec<String> = vec![
            "--no-warnings".to_string(),
            "--ignore-config".to_string(),
            "--no-playlist".to_string(),
            "--skip-download".to_string(),
            "--write-subs".to_string(),
            "--sub-langs".to_string(),
            language.to_string(),
            "--convert-subs".to_string(),
            "vtt".to_string(),
            "-o".to_string(),
            template.to_string_lossy().to_string(),
            "--".to_string(),
            url.trim().to_string(),
        ];
        if let Err(e) = self.run_yt_dlp(&args, CAPTION_TIMEOUT).await {
            tracing::warn!(url, language, error = %e, "caption download failed");
            return None;
        }

        let track = find_caption_file(scratch.path(), language)?;
        match std::fs::read_to_string(&track) {
            Ok(text) if !text.trim().is_empty() => {
                tracing::info!(url, language, bytes = text.len(), "caption track downloaded");
                Some(text)
            }
            Ok(_) => None,
            Err(e) => {
                tracing::warn!(path = %track.display(), error = %e, "could not read caption track");
                None
            }
        }
    }

    /// Caption tracks the site advertises for `url`. Empty on any failure.
    pub async fn list_caption_tracks(&self, url: &str) -> Vec<CaptionTrackInfo> {
        if !media_url::is_remote_url(url) {
            return Vec::new();
        }
        let args: Vec<String> = vec![
            "--no-warnings".to_string(),
            "--ignore-config".to_string(),
            "--no-playlist".to_string(),
            "--skip-download".to_string(),
            "-J".to_string(),
            "--".to_string(),
            url.trim().to_string(),
        ];
        match self.run_yt_dlp(&args, LISTING_TIMEOUT).await {
            Ok(output) => parse_caption_listing(&output.stdout),
            Err(e) => {
                tracing::warn!(url, error = %e, "caption listing failed");
                Vec::new()
            }
        }
    }

    async fn download_to_cache(&self, url: &str) -> Result<PathBuf> {
        let target = self.cache.path_for_url(url);
        let id = cache::stable_id(url);
        let partial_prefix = format!("{id}.partial.");
        let template = self
            .cache
            .root()
            .join(format!("{partial_prefix}%(ext)s"));

        let mut args: Vec<String> = vec![
            "--no-warnings".to_string(),
            "--ignore-config".to_string(),
            "--no-playlist".to_string(),
            "--no-progress".to_string(),
            "-f".to_string(),
            "bestaudio/best".to_string(),
            "-x".to_string(),
            "--audio-format".to_string(),
            cache::AUDIO_EXTENSION.to_string(),
            "--no-simulate".to_string(),
            "--print".to_string(),
            "after_move:filepath".to_string(),
            "-o".to_string(),
            template.to_string_lossy().to_string(),
        ];
        let bundled_ffmpeg = self.paths.ffmpeg_bin_path();
        if bundled_ffmpeg.exists() {
            args.push("--ffmpeg-location".to_string());
            args.push(self.paths.ffmpeg_dir().to_string_lossy().to_string());
        }
        args.push("--".to_string());
        args.push(url.trim().to_string());

        tracing::info!(url, target = %target.display(), "downloading audio");
        let output = match self.run_yt_dlp(&args, DOWNLOAD_TIMEOUT).await {
            Ok(v) => v,
            Err(e) => {
                remove_partials(self.cache.root(), &partial_prefix);
                return Err(e);
            }
        };

        let produced = String::from_utf8_lossy(&output.stdout)
            .lines()
            .map(str::trim)
            .rfind(|l| !l.is_empty())
            .map(PathBuf::from)
            .filter(|p| p.is_file())
            .or_else(|| find_partial(self.cache.root(), &partial_prefix));

        let produced = match produced {
            Some(v) => v,
            None => {
                return Err(EngineError::DownloadFailed {
                    url: url.to_string(),
                    detail: "yt-dlp reported success but produced no audio file".to_string(),
                })
            }
        };

        if produced != target {
            if let Err(e) = std::fs::rename(&produced, &target) {
                remove_partials(self.cache.root(), &partial_prefix);
                return Err(EngineError::DownloadFailed {
                    url: url.to_string(),
                    detail: format!("could not move {} into the cache: {e}", produced.display()),
                });
            }
        }
        remove_partials(self.cache.root(), &partial_prefix);

        let size = std::fs::metadata(&target).map(|m| m.len()).unwrap_or(0);
        if size == 0 {
            let _ = std::fs::remove_file(&target);
            return Err(EngineError::DownloadFailed {
                url: url.to_string(),
                detail: "downloaded audio file is empty".to_string(),
            });
        }

        tracing::info!(url, path = %target.display(), bytes = size, "audio cached");
        Ok(target)
    }

    /// Runs yt-dlp, trying the bundled binary first and then `PATH`/Python installs.
    async fn run_yt_dlp(&self, args: &[String], timeout: Duration) -> Result<Output> {
        let mut failures: Vec<String> = Vec::new();
        let mut candidates: Vec<(String, Vec<String>)> = Vec::new();
        let bundled = self.paths.ytdlp_bin_path();
        if bundled.exists() {
            candidates.push((bundled.to_string_lossy().to_string(), Vec::new()));
        }
        candidates.push(("yt-dlp".to_string(), Vec::new()));
        candidates.push((
            "python".to_string(),
            vec!["-m".to_string(), "yt_dlp".to_string()],
        ));
        candidates.push((
            "python3".to_string(),
            vec!["-m".to_string(), "yt_dlp".to_string()],
        ));

        let mut last_code: Option<i32> = None;
        for (program, prefix) in candidates {
            let mut command = cmd::command(&program);
            command.args(prefix);
            command.args(args);
            match cmd::run_output_with_control(&mut command, Some(timeout), None).await {
                Ok(output) => {
                    if output.status.success() {
                        return Ok(output);
                    }
                    last_code = output.status.code();
                    failures.push(format!(
                        "{program} failed (code={:?}): {}",
                        output.status.code(),
                        cmd::stderr_text(&output)
                    ));
                }
                Err(CommandRunError::Spawn(e)) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(CommandRunError::Spawn(e)) => {
                    failures.push(format!("{program} could not start: {e}"));
                }
                Err(CommandRunError::Wait(e)) => {
                    failures.push(format!("{program} failed while running: {e}"));
                }
                Err(e @ (CommandRunError::Canceled | CommandRunError::TimedOut(_))) => {
                    return Err(e.into_engine_error("yt-dlp"));
                }
            }
        }

        if failures.is_empty() {
            return Err(EngineError::ExternalToolMissing {
                tool: "yt-dlp".to_string(),
            });
        }
        Err(EngineError::ExternalToolFailed {
            tool: "yt-dlp".to_string(),
            code: last_code,
            stderr: failures.join(" | "),
        })
    }
}

#[async_trait]
impl MediaSource for MediaDownloader {
    async fn fetch_audio(&self, url: &str) -> Result<PathBuf> {
        if let Some(local) = media_url::local_file_path(url) {
            if local.is_file() {
                return Ok(local);
            }
            return Err(EngineError::NotFound(local));
        }

        if let Some(hit) = self.cache.try_get_valid(url) {
            self.cache.touch(&hit);
            return Ok(hit);
        }

        match self.download_to_cache(url).await {
            Ok(path) => {
                self.cache.touch(&path);
                Ok(path)
            }
            Err(e @ (EngineError::ExternalToolMissing { .. } | EngineError::ExternalToolFailed { .. })) => {
                tracing::warn!(url, error = %e, "audio download failed");
                Err(EngineError::DownloadFailed {
                    url: url.to_string(),
                    detail: e.to_string(),
                })
            }
            Err(e) => {
                tracing::warn!(url, error = %e, "audio download failed");
                Err(e)
            }
        }
    }

    async fn fetch_captions(&self, url: &str, language: &str) -> Option<String> {
        self.fetch_caption_track(url, language).await
    }

    async fn trim_audio(
        &self,
        src: &Path,
        start_secs: f64,
        duration_secs: Option<f64>,
    ) -> Result<PathBuf> {
        ffmpeg::trim_audio(&self.paths, src, start_secs, duration_secs, self.trim_timeout).await
    }

    async fn probe_duration(&self, path: &Path) -> Option<f64> {
        ffmpeg::probe_duration(&self.paths, path).await
    }
}

fn find_partial(root: &Path, prefix: &str) -> Option<PathBuf> {
    std::fs::read_dir(root)
        .ok()?
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .find(|p| {
            p.is_file()
                && p.file_name()
                    .and_then(|n| n.to_str())
                    .map(|n| n.starts_with(prefix) && n.ends_with(cache::AUDIO_EXTENSION))
                    .unwrap_or(false)
        })
}

fn remove_partials(root: &Path, prefix: &str) {
    let entries = match std::fs::read_dir(root) {
        Ok(v) => v,
        Err(_) => return,
    };
    for entry in entries.filter_map(|e| e.ok()) {
        let name = entry.file_name();
        if name.to_string_lossy().starts_with(prefix) {
            let _ = std::fs::remove_file(entry.path());
        }
    }
}

fn find_caption_file(dir: &Path, language: &str) -> Option<PathBuf> {
    let mut tracks: Vec<PathBuf> = std::fs::read_dir(dir)
        .ok()?
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| {
            p.extension()
                .and_then(|e| e.to_str())
                .map(|e| e.eq_ignore_ascii_case("vtt"))
                .unwrap_or(false)
        })
        .collect();
    tracks.sort();
    let wanted = tracks.iter().position(|p| {
        p.file_name()
            .map(|n| n.to_string_lossy().contains(language))
            .unwrap_or(false)
    });
    match wanted {
        Some(i) => Some(tracks.swap_remove(i)),
        None => tracks.into_iter().next(),
    }
}

#[derive(Debug, Default, Deserialize)]
struct YtDlpInfo {
    #[serde(default)]
    subtitles: Option<std::collections::BTreeMap<String, Vec<YtDlpTrackFormat>>>,
    #[serde(default)]
    automatic_captions: Option<std::collections::BTreeMap<String, Vec<YtDlpTrackFormat>>>,
}

#[derive(Debug, Default, Deserialize)]
struct YtDlpTrackFormat {
    #[serde(default)]
    name: Option<String>,
}

fn parse_caption_listing(stdout: &[u8]) -> Vec<CaptionTrackInfo> {
    let info: YtDlpInfo = match serde_json::from_slice(stdout) {
        Ok(v) => v,
        Err(e) => {
            tracing::debug!(error = %e, "caption listing was not valid json");
            return Vec::new();
        }
    };

    let mut tracks = Vec::new();
    for (map, automatic) in [(info.subtitles, false), (info.automatic_captions, true)] {
        for (code, formats) in map.unwrap_or_default() {
            if code == "live_chat" || formats.is_empty() {
                continue;
            }
            let display_name = formats
                .iter()
                .find_map(|f| f.name.as_deref().map(str::trim).filter(|n| !n.is_empty()))
                .unwrap_or(code.as_str())
                .to_string();
            tracks.push(CaptionTrackInfo {
                language_code: code,
                display_name,
                automatic,
            });
        }
    }
    tracks.sort_by(|a, b| {
        a.language_code
            .cmp(&b.language_code)
            .then(a.automatic.cmp(&b.automatic))
    });
    tracks
}

#[cfg(test)]
mod tests {
    use super::*;

    fn downloader_in(dir: &Path) -> MediaDownloader {
        let paths = AppPaths::new(dir.to_path_buf());
        let cache = ContentCache::new(dir.join("cache"), Duration::from_secs(600), 10, true)
            .expect("cache");
        MediaDownloader::new(paths, Arc::new(cache))
    }

    #[tokio::test]
    async fn local_file_urls_bypass_the_cache() {
        let dir = tempfile::tempdir().expect("tempdir");
        let downloader = downloader_in(dir.path());
        let clip = dir.path().join("clip.mp3");
        std::fs::write(&clip, b"audio").expect("write");

        let url = url::Url::from_file_path(&clip).expect("file url").to_string();
        let path = downloader.fetch_audio(&url).await.expect("fetch");
        assert_eq!(path, clip);
    }

    #[tokio::test]
    async fn missing_local_file_is_not_found() {
        let dir = tempfile::tempdir().expect("tempdir");
        let downloader = downloader_in(dir.path());
        let gone = dir.path().join("gone.mp3");
        let url = url::Url::from_file_path(&gone).expect("file url").to_string();
        let err = downloader.fetch_audio(&url).await.expect_err("missing");
        assert!(matches!(err, EngineError::NotFound(p) if p == gone));
    }

    #[tokio::test]
    async fn cached_entry_is_returned_without_running_tools() {
        let dir = tempfile::tempdir().expect("tempdir");
        let downloader = downloader_in(dir.path());
        let url = "https://www.youtube.com/watch?v=dQw4w9WgXcQ";
        let cached = downloader.cache().path_for_url(url);
        std::fs::write(&cached, b"audio").expect("write");

        let first = downloader.fetch_audio(url).await.expect("fetch");
        let second = downloader.fetch_audio(url).await.expect("fetch");
        assert_eq!(first, cached);
        assert_eq!(second, cached);
    }

    #[tokio::test]
    async fn captions_for_local_files_are_absent() {
        let dir = tempfile::tempdir().expect("tempdir");
        let downloader = downloader_in(dir.path());
        assert_eq!(
            downloader
                .fetch_captions("file:///srv/sounds/a.mp3", "en")
                .await,
            None
        );
        assert!(downloader
            .list_caption_tracks("file:///srv/sounds/a.mp3")
            .await
            .is_empty());
    }

    #[test]
    fn caption_listing_merges_manual_and_automatic_tracks() {
        let json = br#"{
            "id": "dQw4w9WgXcQ",
            "subtitles": {
                "en": [{"ext": "vtt", "name": "English"}],
                "de": [{"ext": "vtt", "name": "German"}],
                "live_chat": [{"ext": "json"}]
            },
            "automatic_captions": {
                "en": [{"ext": "vtt", "name": "English (auto)"}],
                "fr": [{"ext": "vtt"}]
            }
        }"#;
        let tracks = parse_caption_listing(json);
        let summary: Vec<(&str, &str, bool)> = tracks
            .iter()
            .map(|t| (t.language_code.as_str(), t.display_name.as_str(), t.automatic))
            .collect();
        assert_eq!(
            summary,
            vec![
                ("de", "German", false),
                ("en", "English", false),
                ("en", "English (auto)", true),
                ("fr", "fr", true),
            ]
        );
    }

    #[test]
    fn caption_listing_without_tracks_is_empty() {
        assert!(parse_caption_listing(br#"{"id": "x"}"#).is_empty());
        assert!(parse_caption_listing(br#"{"subtitles": null}"#).is_empty());
        assert!(parse_caption_listing(b"ERROR: video unavailable").is_empty());
    }

    #[test]
    fn caption_file_prefers_requested_language() {
        let dir = tempfile::tempdir().expect("tempdir");
        std::fs::write(dir.path().join("abc.de.vtt"), "WEBVTT").expect("write");
        std::fs::write(dir.path().join("abc.en.vtt"), "WEBVTT").expect("write");
        std::fs::write(dir.path().join("abc.info.json"), "{}").expect("write");
        assert_eq!(
            find_caption_file(dir.path(), "en"),
            Some(dir.path().join("abc.en.vtt"))
        );
        assert_eq!(
            find_caption_file(dir.path(), "ja"),
            Some(dir.path().join("abc.de.vtt"))
        );
    }
}

#[cfg(all(test, unix))]
mod download_tests {
    use super::*;
    use crate::FailureKind;
    use std::os::unix::fs::PermissionsExt;

    /// A stand-in yt-dlp that writes `payload` to its `-o` template and prints
    /// the resulting path, logging each run to `runs.log`.
    fn fake_yt_dlp(dir: &Path, payload: &str) -> String {
        let log = dir.join("runs.log");
        format!(
            r#"#!/bin/sh
echo run >> '{log}'
out=""
while [ $# -gt 0 ]; do
  if [ "$1" = "-o" ]; then
    shift
    out="$1"
  fi
  shift
done
file=$(printf '%s' "$out" | sed 's/%(ext)s/mp3/')
printf '{payload}' > "$file"
echo "$file"
"#,
            log = log.display(),
        )
    }

    fn downloader_with_tool(dir: &Path, script: &str) -> MediaDownloader {
        let paths = AppPaths::new(dir.to_path_buf());
        let tool = paths.ytdlp_bin_path();
        std::fs::create_dir_all(tool.parent().expect("tool dir")).expect("mkdir");
        std::fs::write(&tool, script).expect("write tool");
        std::fs::set_permissions(&tool, std::fs::Permissions::from_mode(0o755)).expect("chmod");
        let cache = ContentCache::new(dir.join("cache"), Duration::from_secs(600), 10, true)
            .expect("cache");
        MediaDownloader::new(paths, Arc::new(cache))
    }

    fn runs(dir: &Path) -> usize {
        std::fs::read_to_string(dir.join("runs.log"))
            .map(|s| s.lines().count())
            .unwrap_or(0)
    }

    fn partials_left(downloader: &MediaDownloader, url: &str) -> Vec<String> {
        let prefix = format!("{}.partial.", cache::stable_id(url));
        std::fs::read_dir(downloader.cache().root())
            .expect("read_dir")
            .filter_map(|e| e.ok())
            .map(|e| e.file_name().to_string_lossy().to_string())
            .filter(|n| n.starts_with(&prefix))
            .collect()
    }

    #[tokio::test]
    async fn cache_miss_downloads_into_the_canonical_path_once() {
        let dir = tempfile::tempdir().expect("tempdir");
        let downloader = downloader_with_tool(dir.path(), &fake_yt_dlp(dir.path(), "audio"));
        let url = "https://example.invalid/track";

        let first = downloader.fetch_audio(url).await.expect("download");
        assert_eq!(first, downloader.cache().path_for_url(url));
        assert_eq!(std::fs::read(&first).expect("read"), b"audio");
        assert!(partials_left(&downloader, url).is_empty());
        assert_eq!(runs(dir.path()), 1);

        let second = downloader.fetch_audio(url).await.expect("cached");
        assert_eq!(second, first);
        assert_eq!(runs(dir.path()), 1);
    }

    #[tokio::test]
    async fn empty_download_is_rejected_and_removed() {
        let dir = tempfile::tempdir().expect("tempdir");
        let downloader = downloader_with_tool(dir.path(), &fake_yt_dlp(dir.path(), ""));
        let url = "https://example.invalid/silent";

        let err = downloader.fetch_audio(url).await.expect_err("empty");
        assert_eq!(err.kind(), FailureKind::DownloadFailed);
        assert!(!downloader.cache().path_for_url(url).exists());
    }

    #[tokio::test]
    async fn failing_tool_reports_a_download_failure() {
        let dir = tempfile::tempdir().expect("tempdir");
        let downloader = downloader_with_tool(
            dir.path(),
            "#!/bin/sh\necho 'ERROR: unsupported URL' >&2\nexit 2\n",
        );
        let url = "https://example.invalid/broken";

        let err = downloader.fetch_audio(url).await.expect_err("failure");
        assert_eq!(err.kind(), FailureKind::DownloadFailed);
        assert!(!downloader.cache().path_for_url(url).exists());
    }

    #[tokio::test]
    async fn blocked_cache_path_is_a_download_failure_without_leftovers() {
        let dir = tempfile::tempdir().expect("tempdir");
        let downloader = downloader_with_tool(dir.path(), &fake_yt_dlp(dir.path(), "audio"));
        let url = "https://example.invalid/blocked";
        let target = downloader.cache().path_for_url(url);
        std::fs::create_dir_all(&target).expect("mkdir");
        std::fs::write(target.join("keep"), b"x").expect("write");

        let err = downloader.fetch_audio(url).await.expect_err("rename");
        assert_eq!(err.kind(), FailureKind::DownloadFailed);
        assert!(partials_left(&downloader, url).is_empty());
    }
}
