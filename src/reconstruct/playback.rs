//! Step document -> flat frame list, and the player that walks it.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::{Deserialize, Deserializer, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Default time each frame stays on screen during playback.
pub const DEFAULT_FRAME_INTERVAL: Duration = Duration::from_millis(1000);

/// One before/after screenshot pair recorded for a step attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PicturePair {
    pub before_ref: Option<String>,
    pub after_ref: Option<String>,
}

impl<'de> Deserialize<'de> for PicturePair {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        struct Wire {
            #[serde(default)]
            last: Option<String>,
            #[serde(default)]
            next: Option<String>,
        }
        let wire = Wire::deserialize(deserializer)?;
        Ok(PicturePair {
            before_ref: wire.last.filter(|r| !r.is_empty()),
            after_ref: wire.next.filter(|r| !r.is_empty()),
        })
    }
}

/// A completed sub-goal and the screenshots around its action.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Step {
    pub goal_text: String,
    pub operation_label: String,
    pub picture_pairs: Vec<PicturePair>,
}

impl Step {
    /// When a step was attempted more than once only the last pair counts.
    pub fn authoritative_pair(&self) -> Option<&PicturePair> {
        self.picture_pairs.last()
    }
}

impl<'de> Deserialize<'de> for Step {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize, Default)]
        struct Info {
            #[serde(default)]
            opter: String,
            #[serde(default)]
            picture: Vec<PicturePair>,
        }
        #[derive(Deserialize)]
        struct Wire {
            #[serde(default)]
            subgoal: String,
            #[serde(default)]
            info: Option<Info>,
        }
        let wire = Wire::deserialize(deserializer)?;
        let info = wire.info.unwrap_or_default();
        Ok(Step {
            goal_text: wire.subgoal,
            operation_label: info.opter,
            picture_pairs: info.picture,
        })
    }
}

/// The `script` artifact: overall plan plus ordered steps.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepDocument {
    #[serde(rename = "total_plan", default)]
    pub overall_plan: String,
    #[serde(rename = "subgoals", default)]
    pub steps: Vec<Step>,
}

impl StepDocument {
    pub fn from_json(raw: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(raw)
    }
}

/// Flatten the document into playback order: each step's last pair, before
/// then after, absent refs skipped, consecutive repeats collapsed.
pub fn build_frames(doc: &StepDocument) -> Vec<String> {
    let mut frames = Vec::with_capacity(doc.steps.len() * 2);
    for pair in doc.steps.iter().filter_map(Step::authoritative_pair) {
        frames.extend(pair.before_ref.iter().cloned());
        frames.extend(pair.after_ref.iter().cloned());
    }
    collapse_consecutive(frames)
}

/// Drop any element equal to its immediate predecessor. Non-adjacent repeats stay.
pub fn collapse_consecutive<T: PartialEq>(mut items: Vec<T>) -> Vec<T> {
    items.dedup();
    items
}

/// Download path for a frame reference: `images/{basename}`, where the basename
/// is split off on either kind of path separator.
pub fn frame_download_path(reference: &str) -> String {
    let name = reference
        .rsplit(['/', '\\'])
        .next()
        .unwrap_or(reference);
    format!("images/{name}")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PlayState {
    Paused,
    Playing,
}

/// Cursor over a frame list with play/pause and a frame interval.
#[derive(Debug, Clone)]
pub struct Player {
    frames: Vec<String>,
    cursor: usize,
    state: PlayState,
    interval: Duration,
}

impl Player {
    pub fn new(frames: Vec<String>) -> Self {
        Self {
            frames,
            cursor: 0,
            state: PlayState::Paused,
            interval: DEFAULT_FRAME_INTERVAL,
        }
    }

    pub fn frames(&self) -> &[String] {
        &self.frames
    }

    pub fn cursor(&self) -> usize {
        self.cursor
    }

    pub fn state(&self) -> PlayState {
        self.state
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn current(&self) -> Option<&str> {
        self.frames.get(self.cursor).map(String::as_str)
    }

    fn last_index(&self) -> Option<usize> {
        self.frames.len().checked_sub(1)
    }

    pub fn at_end(&self) -> bool {
        self.last_index().map_or(true, |last| self.cursor >= last)
    }

    /// No-op when there is nothing left to play.
    pub fn play(&mut self) {
        if !self.at_end() {
            self.state = PlayState::Playing;
        }
    }

    pub fn pause(&mut self) {
        self.state = PlayState::Paused;
    }

    pub fn seek(&mut self, index: usize) {
        if let Some(last) = self.last_index() {
            self.cursor = index.min(last);
        }
    }

    pub fn step_forward(&mut self) {
        if let Some(last) = self.last_index() {
            self.cursor = (self.cursor + 1).min(last);
        }
    }

    pub fn step_backward(&mut self) {
        self.cursor = self.cursor.saturating_sub(1);
    }

    /// Takes effect on the next tick; the cursor is untouched.
    pub fn set_interval(&mut self, interval: Duration) {
        self.interval = interval;
    }

    /// Advance one frame while playing; pause on reaching the final frame.
    /// Returns whether the cursor moved.
    pub fn tick(&mut self) -> bool {
        if self.state != PlayState::Playing {
            return false;
        }
        let moved = !self.at_end();
        if moved {
            self.cursor += 1;
        }
        if self.at_end() {
            self.state = PlayState::Paused;
        }
        moved
    }

    /// Swap in a re-derived frame list, keeping the cursor in range.
    pub fn replace_frames(&mut self, frames: Vec<String>) {
        self.frames = frames;
        match self.last_index() {
            Some(last) => self.cursor = self.cursor.min(last),
            None => {
                self.cursor = 0;
                self.state = PlayState::Paused;
            }
        }
    }
}

/// Drive `player` until it pauses or `cancel` fires, reporting each new frame.
///
/// The interval is re-read before every sleep so a change applies on the next tick.
pub async fn drive<F>(player: Arc<Mutex<Player>>, cancel: CancellationToken, mut on_frame: F)
where
    F: FnMut(usize, &str),
{
    loop {
        let interval = match player.lock() {
            Ok(p) if p.state() == PlayState::Playing => p.interval(),
            _ => break,
        };

        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(interval) => {}
        }

        let Ok(mut p) = player.lock() else { break };
        if p.tick() {
            if let Some(frame) = p.current() {
                on_frame(p.cursor(), frame);
            }
        }
    }
    debug!("playback driver stopped");
}
