//! Threshold turn detector.
//!
//! A turn starts after more than `n_pre` consecutive frames above the
//! threshold and ends after more than `n_post` consecutive frames at or below
//! the end threshold. Turn boundaries are announced as `turnStart` and
//! `turnEnd` messages:
//!
//! | message     | floats                          | ints                       | user_time1            |
//! |-------------|---------------------------------|----------------------------|-----------------------|
//! | `turnStart` | `[n_pre, start vIdx, period]`   |                            | first voiced frame    |
//! | `turnEnd`   | `[n_post, end vIdx, period]`    | `[complete, reason]`       | first unvoiced frame  |
//!
//! `reason` is 0 for a normal end and 2 for a turn closed at end of input.

use super::registered_mut;
use crate::defaults;
use crate::level::{LevelReader, Sample};
use crate::pipeline::{Component, ComponentError, Message, Registrar, TickContext, TickResult};
use tracing::{debug, info, warn};

pub const TURN_START: &str = "turnStart";
pub const TURN_END: &str = "turnEnd";

/// Why a turn ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndReason {
    Silence = 0,
    EndOfInput = 2,
}

/// A turn boundary, as carried by `turnStart`/`turnEnd` messages.
#[derive(Debug, Clone, PartialEq)]
pub enum TurnEvent {
    Start {
        vidx: i64,
        period: f64,
        time: f64,
    },
    End {
        vidx: i64,
        period: f64,
        time: f64,
        complete: bool,
        reason: EndReason,
    },
}

impl TurnEvent {
    pub fn vidx(&self) -> i64 {
        match self {
            TurnEvent::Start { vidx, .. } | TurnEvent::End { vidx, .. } => *vidx,
        }
    }

    /// Encodes the event; `smoothing` is `n_pre` for starts, `n_post` for ends.
    pub fn to_message(&self, smoothing: usize) -> Message<'static> {
        match self {
            TurnEvent::Start { vidx, period, time } => Message::new(TURN_START, "turn")
                .with_floats(&[smoothing as f64, *vidx as f64, *period])
                .with_user_time(*time, 0.0),
            TurnEvent::End {
                vidx,
                period,
                time,
                complete,
                reason,
            } => Message::new(TURN_END, "turn")
                .with_floats(&[smoothing as f64, *vidx as f64, *period])
                .with_ints(&[i64::from(*complete), *reason as i64])
                .with_user_time(*time, 0.0),
        }
    }

    pub fn from_message(msg: &Message<'_>) -> Option<Self> {
        let vidx = msg.floats[1] as i64;
        let period = msg.floats[2];
        let time = msg.user_time1;
        match msg.kind.as_str() {
            TURN_START => Some(TurnEvent::Start { vidx, period, time }),
            TURN_END => Some(TurnEvent::End {
                vidx,
                period,
                time,
                complete: msg.ints[0] != 0,
                reason: if msg.ints[1] == EndReason::EndOfInput as i64 {
                    EndReason::EndOfInput
                } else {
                    EndReason::Silence
                },
            }),
            _ => None,
        }
    }
}

pub struct TurnDetector {
    name: String,
    input_level: String,
    element: Option<String>,
    element_idx: usize,
    threshold: f64,
    end_threshold: f64,
    n_pre: usize,
    n_post: usize,
    eoi_frames_missing: u64,
    legacy_start_index: bool,
    recipients: Vec<String>,
    input: Option<LevelReader>,
    period: f64,

    in_turn: bool,
    voiced_run: usize,
    silent_run: usize,
    start_vidx: i64,
    start_time: f64,
    end_time: f64,
    last_vidx: i64,
    last_time: f64,
    saw_eoi: bool,
    force_end: bool,
    turns: u64,
}

impl TurnDetector {
    pub fn new(name: impl Into<String>, input_level: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            input_level: input_level.into(),
            element: None,
            element_idx: 0,
            threshold: defaults::TURN_THRESHOLD,
            end_threshold: defaults::TURN_THRESHOLD,
            n_pre: defaults::TURN_MIN_FRAMES,
            n_post: defaults::TURN_GAP_FRAMES,
            eoi_frames_missing: defaults::TURN_EOI_FRAMES_MISSING,
            legacy_start_index: false,
            recipients: Vec::new(),
            input: None,
            period: 0.0,
            in_turn: false,
            voiced_run: 0,
            silent_run: 0,
            start_vidx: 0,
            start_time: 0.0,
            end_time: 0.0,
            last_vidx: 0,
            last_time: 0.0,
            saw_eoi: false,
            force_end: false,
            turns: 0,
        }
    }

    /// Sets both the start and the end threshold.
    pub fn with_threshold(mut self, threshold: f64) -> Self {
        self.threshold = threshold;
        self.end_threshold = threshold;
        self
    }

    /// Threshold used while a turn is open.
    pub fn with_end_threshold(mut self, threshold: f64) -> Self {
        self.end_threshold = threshold;
        self
    }

    pub fn with_min_frames(mut self, n_pre: usize) -> Self {
        self.n_pre = n_pre;
        self
    }

    pub fn with_gap_frames(mut self, n_post: usize) -> Self {
        self.n_post = n_post;
        self
    }

    /// Input element to threshold, by name (`pcm_RMSenergy`, `frame[3]`).
    /// Defaults to the first element whose name contains `RMS`, else 0.
    pub fn with_element(mut self, element: impl Into<String>) -> Self {
        self.element = Some(element.into());
        self
    }

    pub fn with_eoi_frames_missing(mut self, frames: u64) -> Self {
        self.eoi_frames_missing = frames;
        self
    }

    /// Reports turn starts one frame early (`vIdx - count`), as older
    /// releases did. Models trained on those numbers need it.
    pub fn with_legacy_start_index(mut self, enabled: bool) -> Self {
        self.legacy_start_index = enabled;
        self
    }

    pub fn with_recipient(mut self, recipient: impl Into<String>) -> Self {
        self.recipients.push(recipient.into());
        self
    }

    pub fn is_in_turn(&self) -> bool {
        self.in_turn
    }

    /// Turns started so far.
    pub fn turns(&self) -> u64 {
        self.turns
    }

    /// Feeds one frame value; returns the boundary it completes, if any.
    pub fn step(&mut self, vidx: i64, time: f64, value: f64) -> Option<TurnEvent> {
        self.last_vidx = vidx;
        self.last_time = time;
        let threshold = if self.in_turn {
            self.end_threshold
        } else {
            self.threshold
        };

        if value > threshold {
            self.silent_run = 0;
            if self.in_turn {
                return None;
            }
            if self.voiced_run == 0 {
                self.start_time = time;
            }
            self.voiced_run += 1;
            if self.voiced_run <= self.n_pre {
                return None;
            }
            let count = self.voiced_run as i64;
            self.start_vidx = if self.legacy_start_index {
                vidx - count
            } else {
                vidx - count + 1
            };
            self.in_turn = true;
            self.voiced_run = 0;
            self.turns += 1;
            return Some(TurnEvent::Start {
                vidx: self.start_vidx,
                period: self.period,
                time: self.start_time,
            });
        }

        self.voiced_run = 0;
        if self.silent_run == 0 {
            self.end_time = time;
        }
        self.silent_run = self.silent_run.saturating_add(1);
        if !self.in_turn || self.silent_run <= self.n_post {
            return None;
        }
        self.in_turn = false;
        self.silent_run = 0;
        Some(TurnEvent::End {
            vidx: vidx - self.n_post as i64,
            period: self.period,
            time: self.end_time,
            complete: true,
            reason: EndReason::Silence,
        })
    }

    /// Closes an open turn at the last seen frame minus the frames assumed
    /// missing at end of input.
    pub fn force_close(&mut self) -> Option<TurnEvent> {
        if !self.in_turn {
            return None;
        }
        self.in_turn = false;
        self.voiced_run = 0;
        self.silent_run = 0;
        let missing = i64::try_from(self.eoi_frames_missing).unwrap_or(i64::MAX);
        Some(TurnEvent::End {
            vidx: self.last_vidx.saturating_sub(missing).max(self.start_vidx),
            period: self.period,
            time: self.last_time,
            complete: false,
            reason: EndReason::EndOfInput,
        })
    }

    fn announce(&self, ctx: &TickContext<'_>, event: &TurnEvent) {
        let smoothing = match event {
            TurnEvent::Start { .. } => self.n_pre,
            TurnEvent::End { .. } => self.n_post,
        };
        info!(component = %self.name, ?event, "turn boundary");
        for recipient in &self.recipients {
            if let Err(e) = ctx.send_message(recipient, event.to_message(smoothing)) {
                warn!(component = %self.name, %recipient, error = %e, "turn message not delivered");
            }
        }
    }
}

impl Component for TurnDetector {
    fn name(&self) -> &str {
        &self.name
    }

    fn register(&mut self, reg: &mut Registrar<'_>) -> Result<(), ComponentError> {
        let known = reg.bus().recipients();
        if let Some(missing) = self.recipients.iter().find(|r| !known.contains(r)) {
            return Err(ComponentError::Fatal(format!(
                "{}: unknown message recipient '{missing}'",
                self.name
            )));
        }
        self.input = Some(reg.reader_of(&self.input_level)?);
        Ok(())
    }

    fn configure(&mut self) -> Result<bool, ComponentError> {
        let input = registered_mut(&mut self.input, &self.name)?;
        let Some(layout) = input.upstream_layout() else {
            return Ok(false);
        };
        self.period = input.level().period();
        self.element_idx = match &self.element {
            Some(name) => match layout.find_field(name) {
                Some((_, element)) => element,
                None => {
                    return Err(ComponentError::Fatal(format!(
                        "{}: input '{}' has no element '{name}'",
                        self.name, self.input_level
                    )));
                }
            },
            None => layout
                .element_names()
                .iter()
                .position(|n| n.contains("RMS"))
                .unwrap_or(0),
        };
        debug!(component = %self.name, element = self.element_idx, "turn detector configured");
        Ok(true)
    }

    fn tick(&mut self, ctx: &mut TickContext<'_>) -> Result<TickResult, ComponentError> {
        if ctx.is_eoi() {
            self.saw_eoi = true;
        }
        if self.force_end {
            self.force_end = false;
            if let Some(event) = self.force_close() {
                self.announce(ctx, &event);
                return Ok(TickResult::Success);
            }
        }

        let mut progressed = false;
        loop {
            let Some(frame) = registered_mut(&mut self.input, &self.name)?.read_next()? else {
                break;
            };
            let Some(meta) = frame.tmeta().first() else {
                continue;
            };
            let vidx = i64::try_from(meta.vidx).unwrap_or(i64::MAX);
            let time = meta.wall_clock;
            let value = frame
                .data()
                .get(self.element_idx)
                .copied()
                .map_or(0.0, |v: Sample| f64::from(v));
            if let Some(event) = self.step(vidx, time, value) {
                self.announce(ctx, &event);
            }
            progressed = true;
        }
        Ok(if progressed {
            TickResult::Success
        } else {
            TickResult::SourceNotAvailable
        })
    }

    fn notify_empty_tickloop(&mut self) -> bool {
        // Everything upstream is drained; close the open turn next tick.
        if self.saw_eoi && self.in_turn && !self.force_end {
            self.force_end = true;
            return true;
        }
        false
    }
}
