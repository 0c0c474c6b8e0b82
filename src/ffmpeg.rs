use crate::cmd;
use crate::paths::AppPaths;
use crate::{EngineError, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const TRIM_TIMEOUT: Duration = Duration::from_secs(120);
const PROBE_TIMEOUT: Duration = Duration::from_secs(30);

/// Cuts `src` to start at `start_secs`, optionally capped to `duration_secs`.
///
/// Returns `src` unchanged when there is nothing to cut. Output lands in a
/// `trimmed/` directory next to the source so cache scans never see it.
pub async fn trim_audio(
    paths: &AppPaths,
    src: &Path,
    start_secs: f64,
    duration_secs: Option<f64>,
    timeout: Duration,
) -> Result<PathBuf> {
    if !start_secs.is_finite() || start_secs <= 0.0 {
        return Ok(src.to_path_buf());
    }
    if !src.exists() {
        return Err(EngineError::NotFound(src.to_path_buf()));
    }

    let out_dir = src
        .parent()
        .map(|p| p.join("trimmed"))
        .unwrap_or_else(|| PathBuf::from("trimmed"));
    std::fs::create_dir_all(&out_dir)?;

    let stem = src
        .file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_else(|| "audio".to_string());
    let ext = src
        .extension()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_else(|| "mp3".to_string());
    let out = out_dir.join(format!(
        "{stem}_{}_{}.{ext}",
        (start_secs * 1000.0).round() as u64,
        uuid::Uuid::new_v4().simple()
    ));

    let mut command = cmd::command(paths.ffmpeg_cmd());
    command
        .args(["-nostdin", "-y", "-loglevel", "error"])
        .args(["-ss", &format!("{start_secs:.3}")])
        .arg("-i")
        .arg(src);
    if let Some(duration) = duration_secs.filter(|d| d.is_finite() && *d > 0.0) {
        command.args(["-t", &format!("{duration:.3}")]);
    }
    command.args(["-vn", "-c", "copy"]).arg(&out);

    tracing::info!(
        src = %src.display(),
        start_secs,
        duration_secs = ?duration_secs,
        "trimming audio"
    );
    let output = match cmd::run_output_with_control(&mut command, Some(timeout), None).await {
        Ok(v) => v,
        Err(e) => {
            let _ = std::fs::remove_file(&out);
            let err = e.into_engine_error("ffmpeg");
            tracing::warn!(src = %src.display(), error = %err, "trim failed");
            return Err(err);
        }
    };

    if !output.status.success() {
        let _ = std::fs::remove_file(&out);
        return Err(EngineError::ExternalToolFailed {
            tool: "ffmpeg".to_string(),
            code: output.status.code(),
            stderr: cmd::stderr_text(&output),
        });
    }
    if !out.exists() {
        return Err(EngineError::ExternalToolFailed {
            tool: "ffmpeg".to_string(),
            code: output.status.code(),
            stderr: "no output file produced".to_string(),
        });
    }

    Ok(out)
}

/// Track length in seconds, or `None` when ffprobe is unavailable or silent.
pub async fn probe_duration(paths: &AppPaths, input: &Path) -> Option<f64> {
    let mut command = cmd::command(paths.ffprobe_cmd());
    command
        .args(["-v", "error", "-print_format", "json", "-show_format"])
        .arg(input);

    let output = match cmd::run_output_with_control(&mut command, Some(PROBE_TIMEOUT), None).await
    {
        Ok(v) => v,
        Err(e) => {
            tracing::debug!(path = %input.display(), error = %e.into_engine_error("ffprobe"), "duration probe failed");
            return None;
        }
    };
    if !output.status.success() {
        tracing::debug!(
            path = %input.display(),
            stderr = %cmd::stderr_text(&output),
            "ffprobe exited with failure"
        );
        return None;
    }
    parse_probe_duration(&output.stdout)
}

fn parse_probe_duration(stdout: &[u8]) -> Option<f64> {
    let parsed: FfprobeOutput = serde_json::from_slice(stdout).ok()?;
    let seconds: f64 = parsed.format?.duration?.trim().parse().ok()?;
    if seconds.is_finite() && seconds > 0.0 {
        Some(seconds)
    } else {
        None
    }
}

#[derive(Debug, Clone, Deserialize)]
struct FfprobeOutput {
    format: Option<FfprobeFormat>,
}

#[derive(Debug, Clone, Deserialize)]
struct FfprobeFormat {
    duration: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn zero_offset_passes_source_through() {
        let dir = tempfile::tempdir().expect("tempdir");
        let paths = AppPaths::new(dir.path().to_path_buf());
        let src = dir.path().join("song.mp3");
        let out = trim_audio(&paths, &src, 0.0, Some(10.0), TRIM_TIMEOUT)
            .await
            .expect("trim");
        assert_eq!(out, src);
        let out = trim_audio(&paths, &src, -3.0, None, TRIM_TIMEOUT)
            .await
            .expect("trim");
        assert_eq!(out, src);
    }

    #[tokio::test]
    async fn missing_source_is_not_found() {
        let dir = tempfile::tempdir().expect("tempdir");
        let paths = AppPaths::new(dir.path().to_path_buf());
        let src = dir.path().join("gone.mp3");
        let err = trim_audio(&paths, &src, 5.0, None, TRIM_TIMEOUT)
            .await
            .expect_err("missing");
        assert!(matches!(err, EngineError::NotFound(p) if p == src));
    }

    #[test]
    fn probe_output_duration_is_parsed() {
        let json = br#"{ "format": { "format_name": "mp3", "duration": "183.512000" } }"#;
        assert_eq!(parse_probe_duration(json), Some(183.512));
        assert_eq!(parse_probe_duration(br#"{ "format": {} }"#), None);
        assert_eq!(parse_probe_duration(br#"{ "format": { "duration": "N/A" } }"#), None);
        assert_eq!(parse_probe_duration(b"not json"), None);
    }
}
