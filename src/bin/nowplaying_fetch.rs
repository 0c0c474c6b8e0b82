use std::path::PathBuf;
use std::sync::Arc;

use nowplaying_engine::cache::ContentCache;
use nowplaying_engine::config::load_settings;
use nowplaying_engine::downloader::{MediaDownloader, MediaSource};
use nowplaying_engine::paths::AppPaths;
use nowplaying_engine::subtitles;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), String> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("nowplaying_engine=info")),
        )
        .init();

    let args: Vec<String> = std::env::args().collect();

    if args.iter().any(|a| a == "-h" || a == "--help") {
        print_help();
        return Ok(());
    }

    let mut base_dir: Option<PathBuf> = None;
    let mut url: Option<String> = None;
    let mut start: f64 = 0.0;
    let mut duration: Option<f64> = None;
    let mut caption_lang: Option<String> = None;
    let mut list_captions = false;
    let mut cleanup = false;

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--base-dir" => {
                i += 1;
                let v = args
                    .get(i)
                    .ok_or_else(|| "--base-dir requires a value".to_string())?;
                base_dir = Some(PathBuf::from(v));
            }
            "--url" => {
                i += 1;
                let v = args
                    .get(i)
                    .ok_or_else(|| "--url requires a value".to_string())?;
                url = Some(v.to_string());
            }
            "--start" => {
                i += 1;
                start = parse_seconds(args.get(i), "--start")?;
            }
            "--duration" => {
                i += 1;
                duration = Some(parse_seconds(args.get(i), "--duration")?);
            }
            "--captions" => {
                i += 1;
                let v = args
                    .get(i)
                    .ok_or_else(|| "--captions requires a language code".to_string())?;
                caption_lang = Some(v.to_string());
            }
            "--list-captions" => list_captions = true,
            "--cleanup" => cleanup = true,
            other => return Err(format!("unknown arg: {other} (try --help)")),
        }
        i += 1;
    }

    if url.is_none() && !cleanup {
        return Err("nothing to do (pass --url or --cleanup)".to_string());
    }

    let base_dir = base_dir
        .or_else(default_base_dir)
        .ok_or_else(|| "could not determine base dir; pass --base-dir".to_string())?;
    let paths = AppPaths::new(base_dir);
    paths.ensure_dirs().map_err(|e| e.to_string())?;
    let settings = load_settings(&paths).map_err(|e| e.to_string())?;

    let cache = Arc::new(
        ContentCache::from_settings(paths.cache_dir(&settings.cache_dir), &settings)
            .map_err(|e| e.to_string())?,
    );
    println!("Cache dir: {}", cache.root().to_string_lossy());

    if cleanup {
        let expired = cache.cleanup_expired();
        let evicted = cache.cleanup_over_capacity();
        println!("Cleanup: {expired} expired, {evicted} over capacity");
    }

    let Some(url) = url else {
        return Ok(());
    };
    let downloader = MediaDownloader::new(paths.clone(), cache);

    if list_captions {
        let tracks = downloader.list_caption_tracks(&url).await;
        if tracks.is_empty() {
            println!("Captions: none");
        }
        for track in tracks {
            let auto = if track.automatic { " (auto)" } else { "" };
            println!("Captions: {} {}{auto}", track.language_code, track.display_name);
        }
    }

    let audio = downloader.fetch_audio(&url).await.map_err(|e| e.to_string())?;
    println!("Audio: {}", audio.to_string_lossy());

    if let Some(seconds) = downloader.probe_duration(&audio).await {
        println!("Duration: {seconds:.2}s");
    }

    if start > 0.0 {
        let trimmed = downloader
            .trim_audio(&audio, start, duration)
            .await
            .map_err(|e| e.to_string())?;
        println!("Trimmed: {}", trimmed.to_string_lossy());
    }

    if let Some(lang) = caption_lang {
        match downloader.fetch_caption_track(&url, &lang).await {
            Some(track) => {
                let cues = subtitles::parse_vtt(&track);
                println!("Captions ({lang}): {} cues", cues.len());
            }
            None => println!("Captions ({lang}): unavailable"),
        }
    }

    Ok(())
}

fn parse_seconds(value: Option<&String>, flag: &str) -> Result<f64, String> {
    let v = value.ok_or_else(|| format!("{flag} requires a value"))?;
    let seconds: f64 = v
        .trim()
        .parse()
        .map_err(|_| format!("{flag} expects seconds, got {v:?}"))?;
    if !seconds.is_finite() || seconds < 0.0 {
        return Err(format!("{flag} must be a non-negative number"));
    }
    Ok(seconds)
}

fn default_base_dir() -> Option<PathBuf> {
    if let Ok(v) = std::env::var("NOWPLAYING_BASE_DIR") {
        let t = v.trim();
        if !t.is_empty() {
            return Some(PathBuf::from(t));
        }
    }
    std::env::current_dir().ok()
}

fn print_help() {
    println!(
        r#"nowplaying_fetch

Fetches a URL into the media cache the same way a queued job would.

Usage:
  cargo run --bin nowplaying_fetch -- --url https://youtu.be/<id>
  cargo run --bin nowplaying_fetch -- --url <url> --start 30 --duration 15
  cargo run --bin nowplaying_fetch -- --url <url> --list-captions --captions en
  cargo run --bin nowplaying_fetch -- --cleanup

Options:
  --base-dir <path>    Override base dir (default: $NOWPLAYING_BASE_DIR or the current dir)
  --url <url>          Media URL (or file:// path) to fetch
  --start <seconds>    Trim the fetched audio to start here
  --duration <secs>    Cap the trimmed audio to this length
  --captions <lang>    Download and parse the caption track for a language
  --list-captions      List the caption tracks the site offers
  --cleanup            Delete expired and over-capacity cache entries
"#
    );
}
