use crate::config::Settings;
use crate::drift::{DelayCompensator, DriftModel};
use crate::subtitles::SubtitleCue;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

/// Monotonic time source for the render loop.
pub trait Clock: Send + Sync {
    fn now(&self) -> Duration;
}

#[derive(Debug, Clone)]
pub struct MonotonicClock {
    origin: Instant,
}

impl Default for MonotonicClock {
    fn default() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

impl Clock for MonotonicClock {
    fn now(&self) -> Duration {
        self.origin.elapsed()
    }
}

/// Where caption markup ends up. Calls must return promptly.
pub trait DisplaySink: Send + Sync {
    fn render(&self, markup: &str);
    fn clear(&self);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptionState {
    Idle,
    Loading,
    Active,
}

#[derive(Debug, Clone, PartialEq)]
pub enum RenderUpdate {
    Render(String),
    Clear,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CaptionConfig {
    pub tick: Duration,
    pub linger_secs: f64,
    pub refresh: Duration,
    pub font_size: u8,
}

impl Default for CaptionConfig {
    fn default() -> Self {
        Self::from_settings(&Settings::default())
    }
}

impl CaptionConfig {
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            tick: Duration::from_millis(settings.caption_tick_ms.max(1)),
            linger_secs: settings.caption_linger_secs.max(0.0),
            refresh: Duration::from_millis(settings.caption_refresh_ms),
            font_size: settings.caption_font_size,
        }
    }
}

/// Per-session render state. Pure: time comes in through `tick`.
#[derive(Debug, Clone)]
pub struct CaptionRenderer {
    cues: Vec<SubtitleCue>,
    drift: DriftModel,
    playback_started_at: Duration,
    linger_secs: f64,
    refresh: Duration,
    font_size: u8,
    last_shown: Vec<usize>,
    last_pushed: Option<String>,
    last_push_at: Option<Duration>,
}

impl CaptionRenderer {
    pub fn new(
        mut cues: Vec<SubtitleCue>,
        drift: DriftModel,
        playback_started_at: Duration,
        config: &CaptionConfig,
    ) -> Self {
        cues.sort_by(|a, b| a.start.total_cmp(&b.start));
        Self {
            cues,
            drift,
            playback_started_at,
            linger_secs: config.linger_secs,
            refresh: config.refresh,
            font_size: config.font_size,
            last_shown: Vec::new(),
            last_pushed: None,
            last_push_at: None,
        }
    }

    pub fn cue_count(&self) -> usize {
        self.cues.len()
    }

    /// Caption-track seconds at clock time `now`, given the current delay lead.
    pub fn caption_time(&self, now: Duration, lead_secs: f64) -> f64 {
        let raw = now.saturating_sub(self.playback_started_at).as_secs_f64();
        let base = (raw - lead_secs.max(0.0)).max(0.0);
        self.drift.corrected(base)
    }

    /// Cues to show at `elapsed`, one per vertical slot, top to bottom.
    ///
    /// With nothing active the previous set is kept until its latest end plus
    /// the linger window has passed.
    pub fn select_at(&mut self, elapsed: f64) -> Vec<SubtitleCue> {
        self.select_indices(elapsed)
            .into_iter()
            .map(|i| self.cues[i].clone())
            .collect()
    }

    fn select_indices(&mut self, elapsed: f64) -> Vec<usize> {
        let mut per_slot: Vec<usize> = Vec::new();
        for (i, cue) in self.cues.iter().enumerate() {
            if cue.start > elapsed {
                break;
            }
            if elapsed >= cue.end {
                continue;
            }
            match per_slot
                .iter_mut()
                .find(|j| self.cues[**j].line_percent == cue.line_percent)
            {
                // Sorted by start, so a later index never starts earlier.
                Some(slot) => *slot = i,
                None => per_slot.push(i),
            }
        }

        if !per_slot.is_empty() {
            per_slot.sort_by_key(|i| self.cues[*i].line_percent);
            self.last_shown = per_slot.clone();
            return per_slot;
        }

        let linger_until = self
            .last_shown
            .iter()
            .map(|i| self.cues[*i].end)
            .fold(f64::NEG_INFINITY, f64::max)
            + self.linger_secs;
        if !self.last_shown.is_empty() && elapsed <= linger_until {
            return self.last_shown.clone();
        }
        self.last_shown.clear();
        Vec::new()
    }

    fn compose(&self, shown: &[usize]) -> String {
        let inner = shown
            .iter()
            .map(|i| self.cues[*i].text.as_str())
            .filter(|t| !t.trim().is_empty())
            .collect::<Vec<_>>()
            .join("<br>");
        if inner.is_empty() {
            String::new()
        } else {
            format!("<font size='{}'>{inner}</font>", self.font_size)
        }
    }

    /// Advances to `now`. Returns what the display should do, if anything.
    pub fn tick(&mut self, now: Duration, lead_secs: f64) -> Option<RenderUpdate> {
        let elapsed = self.caption_time(now, lead_secs);
        let shown = self.select_indices(elapsed);
        let markup = self.compose(&shown);

        if markup.is_empty() {
            if self.last_pushed.take().is_some() {
                self.last_push_at = Some(now);
                return Some(RenderUpdate::Clear);
            }
            return None;
        }

        let changed = self.last_pushed.as_deref() != Some(markup.as_str());
        let stale = self
            .last_push_at
            .map(|at| now.saturating_sub(at) >= self.refresh)
            .unwrap_or(true);
        if changed || stale {
            self.last_pushed = Some(markup.clone());
            self.last_push_at = Some(now);
            Some(RenderUpdate::Render(markup))
        } else {
            None
        }
    }
}

struct Session {
    generation: u64,
    state: CaptionState,
    cancel: Option<CancellationToken>,
    delay: DelayCompensator,
}

struct CaptionInner {
    display: Arc<dyn DisplaySink>,
    clock: Arc<dyn Clock>,
    config: CaptionConfig,
    session: Mutex<Session>,
}

/// Drives one caption session at a time against a [`DisplaySink`].
#[derive(Clone)]
pub struct CaptionEngine {
    inner: Arc<CaptionInner>,
}

impl CaptionEngine {
    pub fn new(display: Arc<dyn DisplaySink>, clock: Arc<dyn Clock>, config: CaptionConfig) -> Self {
        Self {
            inner: Arc::new(CaptionInner {
                display,
                clock,
                config,
                session: Mutex::new(Session {
                    generation: 0,
                    state: CaptionState::Idle,
                    cancel: None,
                    delay: DelayCompensator::default(),
                }),
            }),
        }
    }

    fn session(&self) -> MutexGuard<'_, Session> {
        self.inner
            .session
            .lock()
            .unwrap_or_else(|e| e.into_inner())
    }

    pub fn now(&self) -> Duration {
        self.inner.clock.now()
    }

    pub fn state(&self) -> CaptionState {
        self.session().state
    }

    /// Opens a new session and returns its id. Any running session is cancelled.
    pub fn begin_loading(&self) -> u64 {
        let mut session = self.session();
        if let Some(token) = session.cancel.take() {
            token.cancel();
        }
        session.generation = session.generation.wrapping_add(1);
        session.state = CaptionState::Loading;
        session.delay.reset();
        session.generation
    }

    /// Starts rendering `cues` for `session`. Returns `false` and drops the cues
    /// when that session was stopped or replaced in the meantime.
    pub fn start(
        &self,
        session_id: u64,
        cues: Vec<SubtitleCue>,
        drift: DriftModel,
        playback_started_at: Duration,
    ) -> bool {
        let mut session = self.session();
        if session.generation != session_id || session.state != CaptionState::Loading {
            tracing::debug!(session_id, "discarding captions for a finished session");
            return false;
        }
        if cues.is_empty() {
            session.state = CaptionState::Idle;
            return false;
        }
        let handle = match tokio::runtime::Handle::try_current() {
            Ok(v) => v,
            Err(e) => {
                tracing::warn!(error = %e, "no async runtime to drive captions");
                session.state = CaptionState::Idle;
                return false;
            }
        };

        let renderer = CaptionRenderer::new(cues, drift, playback_started_at, &self.inner.config);
        tracing::info!(
            session_id,
            cues = renderer.cue_count(),
            "caption rendering started"
        );
        let token = CancellationToken::new();
        session.cancel = Some(token.clone());
        session.state = CaptionState::Active;
        drop(session);

        handle.spawn(render_loop(self.inner.clone(), renderer, token, session_id));
        true
    }

    /// Feeds an audio stall into the delay compensation.
    pub fn report_delay(&self, millis: f64) {
        let now = self.now();
        let mut session = self.session();
        if session.state != CaptionState::Idle {
            session.delay.report(millis, now);
        }
    }

    pub fn stop(&self) {
        {
            let mut session = self.session();
            if let Some(token) = session.cancel.take() {
                token.cancel();
            }
            if session.state != CaptionState::Idle {
                tracing::debug!(session_id = session.generation, "captions stopped");
            }
            session.state = CaptionState::Idle;
            session.delay.reset();
        }
        self.inner.display.clear();
    }
}

async fn render_loop(
    inner: Arc<CaptionInner>,
    mut renderer: CaptionRenderer,
    token: CancellationToken,
    session_id: u64,
) {
    let mut ticker = tokio::time::interval(inner.config.tick);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            _ = ticker.tick() => {}
        }
        let now = inner.clock.now();
        // Held while pushing so a concurrent stop() always clears last.
        let session = inner.session.lock().unwrap_or_else(|e| e.into_inner());
        if session.generation != session_id || token.is_cancelled() {
            break;
        }
        match renderer.tick(now, session.delay.current_lead(now)) {
            Some(RenderUpdate::Render(markup)) => inner.display.render(&markup),
            Some(RenderUpdate::Clear) => inner.display.clear(),
            None => {}
        }
        drop(session);
    }
}
