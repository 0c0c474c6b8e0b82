use crate::cache::ContentCache;
use crate::captions::{CaptionConfig, CaptionEngine, DisplaySink, MonotonicClock};
use crate::config::Settings;
use crate::downloader::{CaptionTrackInfo, MediaDownloader, MediaSource};
use crate::jobs::{Job, JobQueue, Notifier, RejectReason, Requester};
use crate::paths::AppPaths;
use crate::playback::PlaybackSink;
use crate::soundboard::SoundBoard;
use crate::state::SharedState;
use crate::Result;
use std::sync::Arc;

/// Wires the cache, downloader, caption engine and queue together.
pub struct Engine {
    paths: AppPaths,
    settings: Settings,
    cache: Arc<ContentCache>,
    downloader: MediaDownloader,
    captions: CaptionEngine,
    state: Arc<SharedState>,
    queue: JobQueue,
    sounds: SoundBoard,
}

impl Engine {
    /// Builds an engine that downloads with yt-dlp. Needs a tokio runtime.
    pub fn new(
        paths: AppPaths,
        settings: Settings,
        playback: Arc<dyn PlaybackSink>,
        display: Arc<dyn DisplaySink>,
        notifier: Arc<dyn Notifier>,
    ) -> Result<Self> {
        Self::build(paths, settings, None, playback, display, notifier)
    }

    /// Same as [`Engine::new`] but jobs fetch through `media`.
    pub fn with_media_source(
        paths: AppPaths,
        settings: Settings,
        media: Arc<dyn MediaSource>,
        playback: Arc<dyn PlaybackSink>,
        display: Arc<dyn DisplaySink>,
        notifier: Arc<dyn Notifier>,
    ) -> Result<Self> {
        Self::build(paths, settings, Some(media), playback, display, notifier)
    }

    fn build(
        paths: AppPaths,
        settings: Settings,
        media: Option<Arc<dyn MediaSource>>,
        playback: Arc<dyn PlaybackSink>,
        display: Arc<dyn DisplaySink>,
        notifier: Arc<dyn Notifier>,
    ) -> Result<Self> {
        let settings = settings.normalized();
        paths.ensure_dirs()?;

        let cache = Arc::new(ContentCache::from_settings(
            paths.cache_dir(&settings.cache_dir),
            &settings,
        )?);
        let downloader = MediaDownloader::new(paths.clone(), cache.clone());
        let media: Arc<dyn MediaSource> = match media {
            Some(v) => v,
            None => Arc::new(downloader.clone()),
        };
        let captions = CaptionEngine::new(
            display,
            Arc::new(MonotonicClock::default()),
            CaptionConfig::from_settings(&settings),
        );
        let state = Arc::new(SharedState::new(&settings));
        let queue = JobQueue::new(
            settings.clone(),
            state.clone(),
            media,
            playback,
            captions.clone(),
            notifier,
        )?;
        let sounds = match SoundBoard::load(&paths.sounds_config_path()) {
            Ok(v) => v,
            Err(e) => {
                tracing::warn!(error = %e, "sound board could not be loaded");
                SoundBoard::default()
            }
        };

        tracing::info!(
            base_dir = %paths.base_dir.display(),
            cache = %cache.root().display(),
            queue_capacity = settings.queue_capacity(),
            "engine ready"
        );
        Ok(Self {
            paths,
            settings,
            cache,
            downloader,
            captions,
            state,
            queue,
            sounds,
        })
    }

    /// Housekeeping for a new host session. Returns the number of expired
    /// cache entries removed.
    pub fn on_session_start(&self) -> usize {
        let removed = self.cache.cleanup_expired();
        tracing::info!(removed, "session start cache cleanup");
        removed
    }

    pub fn enqueue(&self, job: Job) -> std::result::Result<usize, RejectReason> {
        self.queue.enqueue(job)
    }

    /// Queues a sound-board clip for `command`.
    pub fn play_sound(
        &self,
        command: &str,
        index: Option<usize>,
        requester: Option<Requester>,
        privileged: bool,
    ) -> std::result::Result<usize, RejectReason> {
        let path = self
            .sounds
            .resolve(command, index)
            .ok_or(RejectReason::UnknownSound)?;
        let url = url::Url::from_file_path(&path).map_err(|_| RejectReason::InvalidUrl)?;
        let mut job = Job::new(url.to_string()).privileged(privileged);
        if let Some(requester) = requester {
            job = job.with_requester(requester);
        }
        self.queue.enqueue(job)
    }

    pub fn skip(&self) -> bool {
        self.queue.skip()
    }

    pub fn stop_all(&self) -> usize {
        self.queue.stop_all()
    }

    pub fn set_playback_enabled(&self, enabled: bool) {
        tracing::info!(enabled, "playback toggled");
        self.state.set_playback_enabled(enabled);
        if !enabled {
            self.queue.stop_all();
        }
    }

    pub async fn list_caption_tracks(&self, url: &str) -> Vec<CaptionTrackInfo> {
        self.downloader.list_caption_tracks(url).await
    }

    pub fn reload_sounds(&mut self) -> Result<()> {
        self.sounds = SoundBoard::load(&self.paths.sounds_config_path())?;
        Ok(())
    }

    pub fn paths(&self) -> &AppPaths {
        &self.paths
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn cache(&self) -> &Arc<ContentCache> {
        &self.cache
    }

    pub fn captions(&self) -> &CaptionEngine {
        &self.captions
    }

    pub fn queue(&self) -> &JobQueue {
        &self.queue
    }

    pub fn shared_state(&self) -> &Arc<SharedState> {
        &self.state
    }

    pub fn sound_board(&self) -> &SoundBoard {
        &self.sounds
    }
}
