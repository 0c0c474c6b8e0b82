use std::path::{Path, PathBuf};

#[derive(Debug, Clone)]
pub struct AppPaths {
    pub base_dir: PathBuf,
}

impl AppPaths {
    pub fn new(base_dir: PathBuf) -> Self {
        Self { base_dir }
    }

    pub fn config_dir(&self) -> PathBuf {
        self.base_dir.join("config")
    }

    pub fn settings_path(&self) -> PathBuf {
        self.config_dir().join("settings.json")
    }

    /// Cache root for the configured directory name. Absolute names are used as-is.
    pub fn cache_dir(&self, name: &str) -> PathBuf {
        let trimmed = name.trim();
        if trimmed.is_empty() {
            return self.base_dir.join("cache");
        }
        let candidate = Path::new(trimmed);
        if candidate.is_absolute() {
            candidate.to_path_buf()
        } else {
            self.base_dir.join(candidate)
        }
    }

    pub fn sounds_dir(&self) -> PathBuf {
        self.base_dir.join("sounds")
    }

    pub fn sounds_config_path(&self) -> PathBuf {
        self.sounds_dir().join("sounds.json")
    }

    pub fn tools_dir(&self) -> PathBuf {
        self.base_dir.join("tools")
    }

    pub fn ytdlp_bin_path(&self) -> PathBuf {
        let mut path = self.tools_dir().join("yt-dlp").join("yt-dlp");
        if cfg!(windows) {
            path.set_extension("exe");
        }
        path
    }

    pub fn ffmpeg_dir(&self) -> PathBuf {
        self.tools_dir().join("ffmpeg")
    }

    pub fn ffmpeg_bin_path(&self) -> PathBuf {
        let mut path = self.ffmpeg_dir().join("ffmpeg");
        if cfg!(windows) {
            path.set_extension("exe");
        }
        path
    }

    pub fn ffprobe_bin_path(&self) -> PathBuf {
        let mut path = self.ffmpeg_dir().join("ffprobe");
        if cfg!(windows) {
            path.set_extension("exe");
        }
        path
    }

    pub fn ffmpeg_cmd(&self) -> PathBuf {
        let path = self.ffmpeg_bin_path();
        if path.exists() {
            path
        } else {
            PathBuf::from("ffmpeg")
        }
    }

    pub fn ffprobe_cmd(&self) -> PathBuf {
        let path = self.ffprobe_bin_path();
        if path.exists() {
            path
        } else {
            PathBuf::from("ffprobe")
        }
    }

    pub fn ensure_dirs(&self) -> std::io::Result<()> {
        std::fs::create_dir_all(self.config_dir())?;
        std::fs::create_dir_all(self.sounds_dir())?;
        std::fs::create_dir_all(self.tools_dir())?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn relative_cache_names_live_under_base_dir() {
        let paths = AppPaths::new(PathBuf::from("/srv/np"));
        assert_eq!(paths.cache_dir("temp"), PathBuf::from("/srv/np/temp"));
        assert_eq!(paths.cache_dir("  "), PathBuf::from("/srv/np/cache"));
    }

    #[cfg(unix)]
    #[test]
    fn absolute_cache_names_are_kept() {
        let paths = AppPaths::new(PathBuf::from("/srv/np"));
        assert_eq!(paths.cache_dir("/var/cache/np"), PathBuf::from("/var/cache/np"));
    }

    #[test]
    fn bundled_tools_fall_back_to_path_lookup() {
        let dir = tempfile::tempdir().expect("tempdir");
        let paths = AppPaths::new(dir.path().to_path_buf());
        assert_eq!(paths.ffmpeg_cmd(), PathBuf::from("ffmpeg"));

        std::fs::create_dir_all(paths.ffmpeg_dir()).expect("mkdir");
        std::fs::write(paths.ffmpeg_bin_path(), b"stub").expect("write");
        assert_eq!(paths.ffmpeg_cmd(), paths.ffmpeg_bin_path());
    }
}
