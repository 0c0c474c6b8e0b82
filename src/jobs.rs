use crate::captions::CaptionEngine;
use crate::config::Settings;
use crate::downloader::MediaSource;
use crate::drift::DriftModel;
use crate::media_url;
use crate::playback::{PlaybackEvent, PlaybackSink};
use crate::state::SharedState;
use crate::subtitles::{self, SubtitleCue};
use crate::{EngineError, FailureKind, Result};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// How long a freshly started track may report "not playing" before that
/// counts as the end, unless the sink already confirmed the start.
const START_GRACE: Duration = Duration::from_secs(3);

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Requester {
    pub id: String,
    pub name: String,
}

impl Requester {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: Uuid,
    pub url: String,
    pub start_offset_secs: f64,
    /// 0 = play to the end.
    pub hard_end_limit_secs: f64,
    pub requester: Option<Requester>,
    pub is_privileged: bool,
    pub caption_language: Option<String>,
}

impl Job {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            url: url.into().trim().to_string(),
            start_offset_secs: 0.0,
            hard_end_limit_secs: 0.0,
            requester: None,
            is_privileged: false,
            caption_language: None,
        }
    }

    pub fn with_start_offset(mut self, secs: f64) -> Self {
        self.start_offset_secs = secs;
        self
    }

    pub fn with_hard_end_limit(mut self, secs: f64) -> Self {
        self.hard_end_limit_secs = secs;
        self
    }

    pub fn with_requester(mut self, requester: Requester) -> Self {
        self.requester = Some(requester);
        self
    }

    pub fn privileged(mut self, privileged: bool) -> Self {
        self.is_privileged = privileged;
        self
    }

    pub fn with_caption_language(mut self, language: impl Into<String>) -> Self {
        let language = language.into().trim().to_string();
        self.caption_language = if language.is_empty() {
            None
        } else {
            Some(language)
        };
        self
    }

    pub fn is_local(&self) -> bool {
        media_url::local_file_path(&self.url).is_some()
    }

    /// Longest this job may play: the smaller of its own limit and the global one.
    pub fn playback_limit(&self, settings: &Settings) -> Option<Duration> {
        let own = if self.hard_end_limit_secs.is_finite() && self.hard_end_limit_secs > 0.0 {
            Some(Duration::from_secs_f64(self.hard_end_limit_secs))
        } else {
            None
        };
        [own, settings.max_audio_length()].into_iter().flatten().min()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RejectReason {
    #[error("playback is currently disabled")]
    PlaybackDisabled,
    #[error("only admins may play remote media right now")]
    AdminOnly,
    #[error("too many requests, please wait for the cooldown")]
    Cooldown,
    #[error("the queue is full (max {max})")]
    QueueFull { max: usize },
    #[error("not a playable url")]
    InvalidUrl,
    #[error("no such sound")]
    UnknownSound,
}

#[derive(Debug, Clone, PartialEq)]
pub enum JobNotice {
    Queued { position: usize },
    Started { url: String },
    Failed { kind: FailureKind, detail: String },
    Skipped,
    CooldownStarted,
}

impl JobNotice {
    pub fn message(&self) -> String {
        match self {
            JobNotice::Queued { position } => format!("Added to the queue at position {position}."),
            JobNotice::Started { url } => format!("Now playing: {url}"),
            JobNotice::Failed { kind, .. } => match kind {
                FailureKind::DownloadFailed => "Download failed.".to_string(),
                FailureKind::ProcessTimeout => "Processing the audio took too long.".to_string(),
                FailureKind::ParseError => "The media data could not be read.".to_string(),
                FailureKind::NotFound => "The audio file was not found.".to_string(),
                FailureKind::Canceled => "The request was canceled.".to_string(),
                FailureKind::Unknown => "Something went wrong while playing.".to_string(),
            },
            JobNotice::Skipped => "Your request was skipped.".to_string(),
            JobNotice::CooldownStarted => "Too many requests, cooldown started.".to_string(),
        }
    }
}

/// Delivers [`JobNotice`]s to whoever asked for the job.
pub trait Notifier: Send + Sync {
    fn notify(&self, requester: &Requester, notice: &JobNotice);
}

/// Writes notices to the log.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn notify(&self, requester: &Requester, notice: &JobNotice) {
        tracing::info!(requester = %requester.name, notice = %notice.message(), "job notice");
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum JobOutcome {
    Finished,
    LimitReached,
    Canceled,
}

struct ActiveJob {
    job: Job,
    cancel: CancellationToken,
}

#[derive(Default)]
struct Slots {
    pending: VecDeque<Job>,
    current: Option<ActiveJob>,
}

struct QueueInner {
    settings: Settings,
    state: Arc<SharedState>,
    media: Arc<dyn MediaSource>,
    playback: Arc<dyn PlaybackSink>,
    captions: CaptionEngine,
    notifier: Arc<dyn Notifier>,
    runtime: tokio::runtime::Handle,
    slots: Mutex<Slots>,
}

/// FIFO of playback jobs with a single worker executing them one at a time.
#[derive(Clone)]
pub struct JobQueue {
    inner: Arc<QueueInner>,
}

impl JobQueue {
    /// Must be called from within a tokio runtime; the worker runs on it.
    pub fn new(
        settings: Settings,
        state: Arc<SharedState>,
        media: Arc<dyn MediaSource>,
        playback: Arc<dyn PlaybackSink>,
        captions: CaptionEngine,
        notifier: Arc<dyn Notifier>,
    ) -> Result<Self> {
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|e| EngineError::Unknown(format!("job queue needs a tokio runtime: {e}")))?;
        Ok(Self {
            inner: Arc::new(QueueInner {
                settings,
                state,
                media,
                playback,
                captions,
                notifier,
                runtime,
                slots: Mutex::new(Slots::default()),
            }),
        })
    }

    fn slots(&self) -> MutexGuard<'_, Slots> {
        self.inner.slots.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn settings(&self) -> &Settings {
        &self.inner.settings
    }

    pub fn shared_state(&self) -> &Arc<SharedState> {
        &self.inner.state
    }

    /// Validates and appends `job`. Returns its 1-based position among the
    /// waiting jobs.
    pub fn enqueue(&self, job: Job) -> std::result::Result<usize, RejectReason> {
        let settings = &self.inner.settings;
        let state = &self.inner.state;

        if !state.playback_enabled() {
            return Err(RejectReason::PlaybackDisabled);
        }
        let remote = media_url::is_remote_url(&job.url);
        if !remote && !job.is_local() {
            return Err(RejectReason::InvalidUrl);
        }
        if remote && !settings.allow_remote_media {
            if !job.is_privileged {
                return Err(RejectReason::AdminOnly);
            }
            if !settings.admin_bypass {
                return Err(RejectReason::PlaybackDisabled);
            }
        }
        if !job.is_privileged && state.rate_limiter.is_blocked() {
            return Err(RejectReason::Cooldown);
        }

        let capacity = settings.queue_capacity();
        let (position, ahead) = {
            let mut slots = self.slots();
            let occupied = slots.pending.len() + usize::from(slots.current.is_some());
            if occupied >= capacity {
                tracing::info!(url = %job.url, capacity, "queue full, request rejected");
                return Err(RejectReason::QueueFull { max: capacity });
            }
            slots.pending.push_back(job.clone());
            (slots.pending.len(), occupied)
        };

        tracing::info!(job_id = %job.id, url = %job.url, position, "job queued");
        if ahead > 0 {
            self.notify(&job, JobNotice::Queued { position });
        }
        self.ensure_worker();
        Ok(position)
    }

    /// Cancels the in-flight job. Returns `false` when nothing was running.
    pub fn skip(&self) -> bool {
        let slots = self.slots();
        match &slots.current {
            Some(active) => {
                tracing::info!(job_id = %active.job.id, "skipping current job");
                active.cancel.cancel();
                true
            }
            None => false,
        }
    }

    /// Drops every waiting job and cancels the in-flight one. Returns how many
    /// waiting jobs were dropped.
    pub fn stop_all(&self) -> usize {
        let drained: Vec<Job> = {
            let mut slots = self.slots();
            if let Some(active) = &slots.current {
                active.cancel.cancel();
            }
            slots.pending.drain(..).collect()
        };
        tracing::info!(dropped = drained.len(), "stopping all playback");
        for job in &drained {
            self.notify(job, JobNotice::Skipped);
        }
        drained.len()
    }

    pub fn pending_jobs(&self) -> Vec<Job> {
        self.slots().pending.iter().cloned().collect()
    }

    pub fn current_job(&self) -> Option<Job> {
        self.slots().current.as_ref().map(|a| a.job.clone())
    }

    pub fn is_idle(&self) -> bool {
        let slots = self.slots();
        slots.pending.is_empty() && slots.current.is_none()
    }

    fn notify(&self, job: &Job, notice: JobNotice) {
        match &job.requester {
            Some(requester) => self.inner.notifier.notify(requester, &notice),
            None => tracing::info!(job_id = %job.id, notice = %notice.message(), "job notice"),
        }
    }

    fn ensure_worker(&self) {
        if self.inner.state.try_claim_worker() {
            let queue = self.clone();
            self.inner.runtime.spawn(async move { queue.worker_loop().await });
        }
    }

    async fn worker_loop(self) {
        tracing::debug!("queue worker started");
        loop {
            while let Some((job, cancel)) = self.next_job() {
                self.execute(job, cancel).await;
            }
            self.inner.state.release_worker();
            // A job enqueued between the last dequeue and the release would
            // otherwise wait for the next enqueue.
            let has_more = !self.slots().pending.is_empty();
            if !has_more || !self.inner.state.try_claim_worker() {
                break;
            }
        }
        tracing::debug!("queue worker idle");
    }

    fn next_job(&self) -> Option<(Job, CancellationToken)> {
        let mut slots = self.slots();
        let job = slots.pending.pop_front()?;
        let cancel = CancellationToken::new();
        slots.current = Some(ActiveJob {
            job: job.clone(),
            cancel: cancel.clone(),
        });
        Some((job, cancel))
    }

    async fn execute(&self, job: Job, cancel: CancellationToken) {
        let started = Instant::now();
        tracing::info!(job_id = %job.id, url = %job.url, "job started");

        let queue = self.clone();
        let body_job = job.clone();
        let body_cancel = cancel.clone();
        let body = self
            .inner
            .runtime
            .spawn(async move { queue.run_job(body_job, body_cancel).await });

        let outcome = match body.await {
            Ok(result) => result,
            Err(e) => {
                self.inner.playback.stop_all();
                if e.is_panic() {
                    Err(EngineError::Unknown("job panicked".to_string()))
                } else {
                    Err(EngineError::Unknown(e.to_string()))
                }
            }
        };

        self.inner.captions.stop();
        self.slots().current = None;

        match outcome {
            Ok(JobOutcome::Finished) => {
                tracing::info!(job_id = %job.id, elapsed_ms = started.elapsed().as_millis() as u64, "job completed");
            }
            Ok(JobOutcome::LimitReached) => {
                tracing::info!(job_id = %job.id, "job stopped at its length limit");
            }
            Ok(JobOutcome::Canceled) | Err(EngineError::Canceled) => {
                tracing::info!(job_id = %job.id, "job canceled");
                self.notify(&job, JobNotice::Skipped);
            }
            Err(err) => {
                tracing::warn!(job_id = %job.id, url = %job.url, error = %err, "job failed");
                self.notify(
                    &job,
                    JobNotice::Failed {
                        kind: err.kind(),
                        detail: err.to_string(),
                    },
                );
            }
        }

        if !job.is_privileged && self.inner.state.rate_limiter.record_play() {
            self.notify(&job, JobNotice::CooldownStarted);
        }
    }

    async fn run_job(&self, job: Job, cancel: CancellationToken) -> Result<JobOutcome> {
        let inner = &self.inner;
        let settings = &inner.settings;

        let audio = inner.media.fetch_audio(&job.url).await?;
        if cancel.is_cancelled() {
            return Ok(JobOutcome::Canceled);
        }

        let caption_session = job
            .caption_language
            .as_ref()
            .map(|_| inner.captions.begin_loading());
        let mut caption_task = CaptionFetch(job.caption_language.clone().map(|language| {
            let media = inner.media.clone();
            let url = job.url.clone();
            inner
                .runtime
                .spawn(async move { load_captions(media, url, language).await })
        }));

        let play_path = if job.start_offset_secs > 0.0 {
            let duration = Some(job.hard_end_limit_secs).filter(|d| d.is_finite() && *d > 0.0);
            inner
                .media
                .trim_audio(&audio, job.start_offset_secs, duration)
                .await?
        } else {
            audio.clone()
        };
        let _trimmed = TrimmedAudio::new(&play_path, &audio);
        if cancel.is_cancelled() {
            return Ok(JobOutcome::Canceled);
        }

        let duration = tokio::select! {
            _ = cancel.cancelled() => return Ok(JobOutcome::Canceled),
            duration = inner.media.probe_duration(&play_path) => duration,
        };
        let drift = DriftModel::for_track(duration, &settings.drift);

        let waited = match caption_task.0.as_mut() {
            Some(task) => {
                let wait = Duration::from_millis(settings.caption_wait_ms);
                tokio::select! {
                    _ = cancel.cancelled() => return Ok(JobOutcome::Canceled),
                    waited = tokio::time::timeout(wait, task) => Some(waited),
                }
            }
            None => None,
        };
        let mut ready_cues: Option<Vec<SubtitleCue>> = None;
        let mut late_captions: Option<JoinHandle<Option<Vec<SubtitleCue>>>> = None;
        match waited {
            Some(Ok(Ok(cues))) => ready_cues = cues,
            Some(Ok(Err(e))) => tracing::debug!(error = %e, "caption task failed"),
            Some(Err(_)) => late_captions = caption_task.take(),
            None => {}
        }

        if cancel.is_cancelled() {
            return Ok(JobOutcome::Canceled);
        }
        let mut events = inner.playback.subscribe();
        inner.playback.play(&play_path, settings.volume)?;
        let playback_started_at = inner.captions.now();
        tracing::info!(job_id = %job.id, path = %play_path.display(), duration_secs = ?duration, "playback started");
        self.notify(&job, JobNotice::Started { url: job.url.clone() });

        if let Some(session) = caption_session {
            if let Some(cues) = ready_cues {
                inner
                    .captions
                    .start(session, cues, drift.clone(), playback_started_at);
            } else if let Some(task) = late_captions {
                let captions = inner.captions.clone();
                let drift = drift.clone();
                inner.runtime.spawn(async move {
                    if let Ok(Some(cues)) = task.await {
                        captions.start(session, cues, drift, playback_started_at);
                    }
                });
            }
        }

        let limit = job.playback_limit(settings);
        let mut ticker = tokio::time::interval(Duration::from_millis(settings.queue_poll_ms.max(1)));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let play_started = Instant::now();
        let mut seen_started = false;
        let mut events_open = true;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    inner.playback.stop_all();
                    return Ok(JobOutcome::Canceled);
                }
                event = events.recv(), if events_open => match event {
                    Ok(PlaybackEvent::Started) => seen_started = true,
                    Ok(PlaybackEvent::Ended) if seen_started => return Ok(JobOutcome::Finished),
                    Ok(PlaybackEvent::Ended) => {}
                    Ok(PlaybackEvent::Delay { millis }) => inner.captions.report_delay(millis),
                    Err(RecvError::Lagged(missed)) => {
                        tracing::debug!(missed, "playback events lagged");
                    }
                    Err(RecvError::Closed) => events_open = false,
                },
                _ = ticker.tick() => {
                    if let Some(limit) = limit {
                        if play_started.elapsed() >= limit {
                            inner.playback.stop_all();
                            return Ok(JobOutcome::LimitReached);
                        }
                    }
                    if !inner.playback.is_playing()
                        && (seen_started || play_started.elapsed() >= START_GRACE)
                    {
                        return Ok(JobOutcome::Finished);
                    }
                }
            }
        }
    }
}

async fn load_captions(
    media: Arc<dyn MediaSource>,
    url: String,
    language: String,
) -> Option<Vec<SubtitleCue>> {
    let track = media.fetch_captions(&url, &language).await?;
    let cues = subtitles::parse_vtt(&track);
    tracing::info!(url, language, cues = cues.len(), "captions loaded");
    if cues.is_empty() {
        None
    } else {
        Some(cues)
    }
}

/// Background caption fetch. Aborted when the job stops waiting for it, which
/// also kills the yt-dlp child it may be running.
struct CaptionFetch(Option<JoinHandle<Option<Vec<SubtitleCue>>>>);

impl CaptionFetch {
    fn take(&mut self) -> Option<JoinHandle<Option<Vec<SubtitleCue>>>> {
        self.0.take()
    }
}

impl Drop for CaptionFetch {
    fn drop(&mut self) {
        if let Some(task) = self.0.take() {
            task.abort();
        }
    }
}

/// Deletes a trimmed copy once the job is done with it.
struct TrimmedAudio(Option<PathBuf>);

impl TrimmedAudio {
    fn new(play_path: &Path, source: &Path) -> Self {
        if play_path == source {
            Self(None)
        } else {
            Self(Some(play_path.to_path_buf()))
        }
    }
}

impl Drop for TrimmedAudio {
    fn drop(&mut self) {
        if let Some(path) = self.0.take() {
            if let Err(e) = std::fs::remove_file(&path) {
                tracing::debug!(path = %path.display(), error = %e, "could not remove trimmed audio");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn playback_limit_takes_the_smaller_non_zero_value() {
        let settings = Settings {
            max_audio_length_minutes: 2,
            ..Settings::default()
        };
        let job = Job::new("https://example.com/a");
        assert_eq!(job.playback_limit(&settings), Some(Duration::from_secs(120)));

        let job = job.with_hard_end_limit(30.0);
        assert_eq!(job.playback_limit(&settings), Some(Duration::from_secs(30)));

        let unlimited = Settings {
            max_audio_length_minutes: 0,
            ..Settings::default()
        };
        assert_eq!(
            Job::new("https://example.com/a").playback_limit(&unlimited),
            None
        );
    }

    #[test]
    fn caption_language_blank_means_none() {
        let job = Job::new(" https://example.com/a ").with_caption_language("  ");
        assert_eq!(job.url, "https://example.com/a");
        assert_eq!(job.caption_language, None);
        assert_eq!(
            Job::new("x").with_caption_language("ko").caption_language.as_deref(),
            Some("ko")
        );
    }

    #[test]
    fn failure_messages_follow_the_category() {
        let notice = JobNotice::Failed {
            kind: FailureKind::ProcessTimeout,
            detail: "ffmpeg timed out after 120s".to_string(),
        };
        assert_eq!(notice.message(), "Processing the audio took too long.");
        assert_eq!(
            JobNotice::Queued { position: 3 }.message(),
            "Added to the queue at position 3."
        );
    }

    #[test]
    fn trimmed_copy_is_removed_on_drop() {
        let dir = tempfile::tempdir().expect("tempdir");
        let source = dir.path().join("a.mp3");
        let trimmed = dir.path().join("a_trim.mp3");
        std::fs::write(&source, b"a").expect("write");
        std::fs::write(&trimmed, b"b").expect("write");

        drop(TrimmedAudio::new(&source, &source));
        assert!(source.exists());

        drop(TrimmedAudio::new(&trimmed, &source));
        assert!(!trimmed.exists());
        assert!(source.exists());
    }

    #[test]
    fn job_survives_a_json_round_trip() {
        let job = Job::new("https://example.com/a")
            .with_requester(Requester::new("42", "Dana"))
            .with_caption_language("en");
        let json = serde_json::to_string(&job).expect("serialize");
        let back: Job = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(back, job);
    }

    #[tokio::test]
    async fn dropped_caption_fetch_is_aborted() {
        let (tx, rx) = tokio::sync::oneshot::channel::<()>();
        let task = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(60)).await;
            let _ = tx.send(());
            None
        });
        drop(CaptionFetch(Some(task)));
        let outcome = tokio::time::timeout(Duration::from_secs(5), rx)
            .await
            .expect("aborted task releases its sender");
        assert!(outcome.is_err());
    }

    #[tokio::test]
    async fn taken_caption_fetch_keeps_running() {
        let task = tokio::spawn(async { Some(Vec::new()) });
        let mut fetch = CaptionFetch(Some(task));
        let task = fetch.take().expect("task");
        drop(fetch);
        assert_eq!(task.await.expect("join"), Some(Vec::new()));
    }
}
