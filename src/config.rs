use crate::paths::AppPaths;
use crate::{EngineError, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DriftSettings {
    /// Seconds the captions should be pulled forward by the end of the track.
    pub target_end_drift_secs: f64,
    /// Curve exponent; computed from the track duration when unset.
    pub correction_power: Option<f64>,
    /// Constant speed-up ratio. Overrides the curve when set.
    pub linear_ratio: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Settings {
    pub allow_remote_media: bool,
    pub admin_bypass: bool,
    /// 0 = unlimited.
    pub max_audio_length_minutes: u32,

    pub enable_anti_spam: bool,
    pub max_spam_per_interval: u32,
    pub spam_check_interval_secs: f64,
    pub anti_spam_cooldown_secs: f64,

    pub cache_dir: String,
    pub cache_max_age_minutes: u64,
    pub cache_max_count: usize,
    pub cache_reuse_enabled: bool,

    pub queue_enabled: bool,
    pub max_queue_length: usize,
    pub queue_poll_ms: u64,
    pub volume: f32,

    pub caption_tick_ms: u64,
    pub caption_linger_secs: f64,
    pub caption_refresh_ms: u64,
    pub caption_wait_ms: u64,
    pub caption_font_size: u8,
    pub drift: DriftSettings,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            allow_remote_media: true,
            admin_bypass: true,
            max_audio_length_minutes: 7,
            enable_anti_spam: true,
            max_spam_per_interval: 10,
            spam_check_interval_secs: 20.0,
            anti_spam_cooldown_secs: 60.0,
            cache_dir: "cache".to_string(),
            cache_max_age_minutes: 30,
            cache_max_count: 100,
            cache_reuse_enabled: true,
            queue_enabled: false,
            max_queue_length: 10,
            queue_poll_ms: 500,
            volume: 1.0,
            caption_tick_ms: 50,
            caption_linger_secs: 5.0,
            caption_refresh_ms: 1000,
            caption_wait_ms: 3000,
            caption_font_size: 5,
            drift: DriftSettings::default(),
        }
    }
}

impl Settings {
    pub fn normalized(mut self) -> Self {
        self.cache_max_age_minutes = self.cache_max_age_minutes.max(1);
        self.caption_tick_ms = self.caption_tick_ms.clamp(20, 250);
        self.queue_poll_ms = self.queue_poll_ms.max(10);
        self.volume = if self.volume.is_finite() {
            self.volume.clamp(0.0, 1.0)
        } else {
            1.0
        };
        if !self.caption_linger_secs.is_finite() || self.caption_linger_secs < 0.0 {
            self.caption_linger_secs = 0.0;
        }
        if !self.spam_check_interval_secs.is_finite() || self.spam_check_interval_secs < 0.0 {
            self.spam_check_interval_secs = 0.0;
        }
        if !self.anti_spam_cooldown_secs.is_finite() || self.anti_spam_cooldown_secs < 0.0 {
            self.anti_spam_cooldown_secs = 0.0;
        }
        self
    }

    pub fn cache_max_age(&self) -> Duration {
        Duration::from_secs(self.cache_max_age_minutes.max(1) * 60)
    }

    /// Waiting jobs plus the in-flight one.
    pub fn queue_capacity(&self) -> usize {
        if self.queue_enabled {
            self.max_queue_length.max(1)
        } else {
            1
        }
    }

    pub fn max_audio_length(&self) -> Option<Duration> {
        if self.max_audio_length_minutes == 0 {
            None
        } else {
            Some(Duration::from_secs(u64::from(self.max_audio_length_minutes) * 60))
        }
    }
}

pub fn load_settings(paths: &AppPaths) -> Result<Settings> {
    let path = paths.settings_path();
    if !path.exists() {
        return Ok(Settings::default());
    }
    let bytes = std::fs::read(&path)?;
    let parsed: Settings = serde_json::from_slice(&bytes).map_err(|e| {
        EngineError::InvalidSettings(format!(
            "failed to parse settings at {}: {e}",
            path.to_string_lossy()
        ))
    })?;
    Ok(parsed.normalized())
}

pub fn save_settings(paths: &AppPaths, settings: &Settings) -> Result<()> {
    let path = paths.settings_path();
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let json = serde_json::to_string_pretty(settings)?;
    std::fs::write(&path, format!("{json}\n"))?;
    Ok(())
}
