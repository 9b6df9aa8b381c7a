//! The level: a time-indexed frame store with one writer and many readers.
//!
//! Cursor bookkeeping (`curW`, per-reader `curR`, cached `minR`) lives under
//! one mutex that is only held while validating or committing an index range.
//! Frame data is copied under the [`Gate`], never under the cursor mutex.
//! A write validates and reserves its range, copies, then publishes the new
//! write cursor, so readers never observe a frame before it is complete.

use super::error::LevelError;
use super::frame::{Block, Frame, Sample};
use super::gate::Gate;
use super::index::{Index, Padding, Side};
use super::meta::{FieldLayout, FieldMetaInfo, TimeMetaInfo};
use super::store::Store;
use crate::clock::{Clock, SystemClock, seconds_since};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, OnceLock, RwLock};
use std::time::Instant;
use tracing::{debug, warn};

/// Identifies one registered reader of a level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct ReaderId(usize);

impl ReaderId {
    pub fn index(self) -> usize {
        self.0
    }
}

/// Whether a full level may overwrite frames its readers have not consumed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum HangPolicy {
    /// Never evict: a full level reports `NoSpace` until readers catch up.
    Hang,
    /// Evict freely while nobody reads the level, otherwise hang.
    #[default]
    NoHangWithoutReaders,
    /// Always evict; slow readers lose data and are moved forward.
    NeverHang,
}

/// Static properties of a level, fixed at finalize.
#[derive(Debug, Clone, PartialEq)]
pub struct LevelConfig {
    /// Frame period in seconds (0 for aperiodic levels).
    pub period: f64,
    /// Length of one frame in seconds.
    pub frame_length: f64,
    /// Period of the frames this level's frames were derived from.
    pub frame_period: f64,
    /// Capacity in frames; 0 lets the pipeline size it.
    pub capacity: usize,
    /// Ring (wrapping) store; `false` selects a linear append-only store.
    pub ring: bool,
    /// Grow instead of failing or evicting when full.
    pub growable: bool,
    pub hang: HangPolicy,
    /// Padding used by anonymous reads and readers without their own policy.
    pub padding: Padding,
}

impl Default for LevelConfig {
    fn default() -> Self {
        Self {
            period: 0.0,
            frame_length: 0.0,
            frame_period: 0.0,
            capacity: 0,
            ring: true,
            growable: false,
            hang: HangPolicy::default(),
            padding: Padding::default(),
        }
    }
}

impl LevelConfig {
    /// Periodic level whose frames are as long as their period.
    pub fn periodic(period: f64) -> Self {
        Self {
            period,
            frame_length: period,
            ..Self::default()
        }
    }

    pub fn with_frame_length(mut self, seconds: f64) -> Self {
        self.frame_length = seconds;
        self
    }

    pub fn with_frame_period(mut self, seconds: f64) -> Self {
        self.frame_period = seconds;
        self
    }

    pub fn with_capacity(mut self, frames: usize) -> Self {
        self.capacity = frames;
        self
    }

    pub fn with_ring(mut self, ring: bool) -> Self {
        self.ring = ring;
        self
    }

    pub fn with_growable(mut self, growable: bool) -> Self {
        self.growable = growable;
        self
    }

    pub fn with_hang(mut self, hang: HangPolicy) -> Self {
        self.hang = hang;
        self
    }

    pub fn with_padding(mut self, padding: Padding) -> Self {
        self.padding = padding;
        self
    }
}

/// Point-in-time view of a level's cursors.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LevelStats {
    pub name: String,
    pub n_elements: usize,
    pub capacity: usize,
    pub ring: bool,
    pub growable: bool,
    pub cur_w: u64,
    pub min_r: u64,
    pub readers: Vec<u64>,
    pub eoi: bool,
    pub eoi_counter: u32,
    pub grow_count: u64,
    pub evicted: u64,
    pub left_reads: u64,
}

/// How a successful read moves the reader's cursor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Advance {
    /// To the end of the requested range.
    ToEnd,
    /// To an absolute index (overlapping reads consume less than they read).
    To(i64),
    /// Leave the cursor alone.
    Keep,
}

#[derive(Debug)]
struct Setup {
    config: LevelConfig,
    layout: FieldLayout,
    writer_block: usize,
}

#[derive(Debug, Clone, Copy, Default)]
struct Timing {
    period: f64,
    frame_length: f64,
    frame_period: f64,
}

impl Timing {
    fn padding_meta(&self, vidx: i64) -> TimeMetaInfo {
        TimeMetaInfo {
            vidx: u64::try_from(vidx).unwrap_or(0),
            period: self.period,
            time: vidx as f64 * self.period,
            length_sec: self.frame_length,
            frame_period: self.frame_period,
            ..TimeMetaInfo::default()
        }
    }
}

#[derive(Debug, Clone)]
struct ReaderSlot {
    cursor: u64,
    block: usize,
    padding: Option<Padding>,
    full_input: bool,
}

#[derive(Debug, Default)]
struct Cursors {
    cur_w: u64,
    /// End of the write currently being copied (equals `cur_w` when idle).
    pending_end: u64,
    readers: Vec<ReaderSlot>,
    /// Minimum reader cursor, refreshed whenever a reader cursor moves.
    min_r_cache: u64,
    capacity: usize,
    /// Oldest frame that survived the last growth.
    retained_from: u64,
    ring: bool,
    growable: bool,
    hang: HangPolicy,
    padding: Padding,
    n: usize,
    timing: Timing,
    grow_count: u64,
    evicted: u64,
    left_reads: u64,
}

#[derive(Debug, Clone, Copy)]
struct Growth {
    capacity: usize,
    keep_from: u64,
    keep_to: u64,
}

#[derive(Debug)]
struct WritePlan {
    start: u64,
    end: u64,
    growth: Option<Growth>,
    timing: Timing,
}

#[derive(Debug)]
struct ReadPlan {
    start: i64,
    end: i64,
    stored_from: u64,
    stored_to: u64,
    pad_front: usize,
    pad_back: usize,
    padding: Padding,
    n: usize,
    timing: Timing,
}

impl Cursors {
    fn min_r(&self) -> u64 {
        if self.readers.is_empty() {
            match self.hang {
                // Nothing is ever consumed, so nothing may be overwritten.
                HangPolicy::Hang => self.retained_from,
                _ => self.cur_w,
            }
        } else {
            self.min_r_cache
        }
    }

    fn refresh_min_r(&mut self) {
        self.min_r_cache = self
            .readers
            .iter()
            .map(|r| r.cursor)
            .min()
            .unwrap_or(self.cur_w);
    }

    fn oldest_retained(&self) -> u64 {
        if !self.ring {
            return 0;
        }
        let horizon = self.cur_w.max(self.pending_end);
        horizon
            .saturating_sub(self.capacity as u64)
            .max(self.retained_from)
    }

    fn n_free(&self) -> usize {
        let used = if self.ring {
            self.cur_w.saturating_sub(self.min_r())
        } else {
            self.cur_w
        };
        self.capacity.saturating_sub(used as usize)
    }

    /// Whether `len` frames at the write cursor would be accepted, counting
    /// growth and eviction.
    fn accepts(&self, len: usize) -> bool {
        if self.growable || self.n_free() >= len {
            return true;
        }
        self.ring
            && len <= self.capacity
            && match self.hang {
                HangPolicy::Hang => false,
                HangPolicy::NoHangWithoutReaders => self.readers.is_empty(),
                HangPolicy::NeverHang => true,
            }
    }

    fn slot(&self, id: ReaderId) -> Result<&ReaderSlot, LevelError> {
        self.readers
            .get(id.0)
            .ok_or(LevelError::UnknownReader { id: id.0 })
    }

    fn slot_mut(&mut self, id: ReaderId) -> Result<&mut ReaderSlot, LevelError> {
        self.readers
            .get_mut(id.0)
            .ok_or(LevelError::UnknownReader { id: id.0 })
    }

    fn make_room(
        &mut self,
        level: &str,
        end: u64,
        len: usize,
    ) -> Result<Option<Growth>, LevelError> {
        let cap = self.capacity as u64;
        if !self.ring {
            if end <= cap {
                return Ok(None);
            }
            if self.growable {
                return Ok(Some(Growth {
                    capacity: (self.capacity * 2).max(end as usize),
                    keep_from: 0,
                    keep_to: self.cur_w,
                }));
            }
            return Err(LevelError::NoSpace {
                needed: len,
                free: self.n_free(),
            });
        }

        let floor = self.min_r();
        if end.saturating_sub(floor) <= cap {
            return Ok(None);
        }
        if self.growable {
            let keep_from = self.oldest_retained();
            return Ok(Some(Growth {
                capacity: (self.capacity * 2).max((end - keep_from) as usize),
                keep_from,
                keep_to: self.cur_w,
            }));
        }
        let may_evict = match self.hang {
            HangPolicy::Hang => false,
            HangPolicy::NoHangWithoutReaders => self.readers.is_empty(),
            HangPolicy::NeverHang => true,
        };
        if may_evict && len as u64 <= cap {
            let new_floor = end - cap;
            let mut lifted = 0u64;
            for reader in &mut self.readers {
                if reader.cursor < new_floor {
                    lifted += new_floor - reader.cursor;
                    reader.cursor = new_floor;
                }
            }
            if lifted > 0 {
                self.evicted += lifted;
                self.refresh_min_r();
                warn!(level = %level, frames = lifted, "evicted frames not yet read");
            }
            return Ok(None);
        }
        Err(LevelError::NoSpace {
            needed: len,
            free: self.n_free(),
        })
    }

    fn plan_read(
        &self,
        at: Index,
        len: usize,
        reader: Option<ReaderId>,
        eoi: bool,
    ) -> Result<ReadPlan, LevelError> {
        let (cur_r, padding) = match reader {
            Some(id) => {
                let slot = self.slot(id)?;
                (slot.cursor, slot.padding.unwrap_or(self.padding))
            }
            None => (self.min_r(), self.padding),
        };
        let start = at.resolve(cur_r, self.cur_w);
        let end = start.saturating_add(i64::try_from(len).unwrap_or(i64::MAX));
        if len == 0 || end <= 0 {
            return Err(LevelError::InvalidIndex { index: start });
        }

        let stored_from = start.max(0) as u64;
        if stored_from < self.oldest_retained() {
            return Err(LevelError::OutOfRange {
                side: Side::Left,
                start,
                end,
            });
        }
        let cur_w = self.cur_w;
        let stored_to = if end as u64 > cur_w {
            // Past the written data: not yet available unless draining, and
            // never available when nothing of the range was written.
            if !eoi || stored_from >= cur_w {
                return Err(LevelError::OutOfRange {
                    side: Side::Right,
                    start,
                    end,
                });
            }
            cur_w
        } else {
            end as u64
        };

        let (pad_front, pad_back) = match padding {
            Padding::None => (0, 0),
            _ => (
                usize::try_from(-start).unwrap_or(0),
                (end as u64 - stored_to) as usize,
            ),
        };
        Ok(ReadPlan {
            start,
            end,
            stored_from,
            stored_to,
            pad_front,
            pad_back,
            padding,
            n: self.n,
            timing: self.timing,
        })
    }
}

/// A named stream buffer shared by one writer and any number of readers.
pub struct Level {
    name: String,
    setup: Mutex<Setup>,
    layout: OnceLock<Arc<FieldLayout>>,
    cursors: Mutex<Cursors>,
    finalized: AtomicBool,
    eoi: AtomicBool,
    eoi_counter: AtomicU32,
    gate: Gate,
    store: RwLock<Store>,
    clock: Arc<dyn Clock>,
    epoch: Instant,
}

impl std::fmt::Debug for Level {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Level")
            .field("name", &self.name)
            .field("finalized", &self.is_finalized())
            .field("eoi", &self.is_eoi())
            .finish_non_exhaustive()
    }
}

impl Level {
    /// Creates an empty level timed by the system clock.
    pub fn new(name: impl Into<String>, config: LevelConfig) -> Self {
        let clock = SystemClock;
        let epoch = clock.now();
        Self::with_clock(name, config, Arc::new(clock), epoch)
    }

    /// Creates an empty level whose wall-clock stamps count from `epoch`.
    pub fn with_clock(
        name: impl Into<String>,
        config: LevelConfig,
        clock: Arc<dyn Clock>,
        epoch: Instant,
    ) -> Self {
        Self {
            name: name.into(),
            setup: Mutex::new(Setup {
                config,
                layout: FieldLayout::new(),
                writer_block: 1,
            }),
            layout: OnceLock::new(),
            cursors: Mutex::new(Cursors::default()),
            finalized: AtomicBool::new(false),
            eoi: AtomicBool::new(false),
            eoi_counter: AtomicU32::new(0),
            gate: Gate::new(),
            store: RwLock::new(Store::default()),
            clock,
            epoch,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    // --- setup -----------------------------------------------------------

    /// Adds a field of `count` elements and returns its index.
    pub fn add_field(&self, name: impl Into<String>, count: usize) -> Result<usize, LevelError> {
        self.add_field_meta(FieldMetaInfo::new(name, count))
    }

    pub fn add_field_meta(&self, field: FieldMetaInfo) -> Result<usize, LevelError> {
        let mut setup = self.setup.lock()?;
        if self.layout.get().is_some() || self.is_finalized() {
            return Err(LevelError::AlreadyFinalized);
        }
        let name = field.name.clone();
        setup
            .layout
            .push(field)
            .ok_or(LevelError::DuplicateField { name })
    }

    /// Freezes the field layout so readers can inspect it before finalize.
    pub fn fix_layout(&self) -> Result<Arc<FieldLayout>, LevelError> {
        let setup = self.setup.lock()?;
        if let Some(layout) = self.layout.get() {
            return Ok(layout.clone());
        }
        if setup.layout.n_elements() == 0 {
            return Err(LevelError::NoFields);
        }
        Ok(self
            .layout
            .get_or_init(|| Arc::new(setup.layout.clone()))
            .clone())
    }

    /// The frozen field layout, once fixed.
    pub fn layout(&self) -> Option<Arc<FieldLayout>> {
        self.layout.get().cloned()
    }

    /// Elements per frame (0 until the layout is fixed).
    pub fn n_elements(&self) -> usize {
        self.layout.get().map_or(0, |l| l.n_elements())
    }

    pub fn config(&self) -> Result<LevelConfig, LevelError> {
        Ok(self.setup.lock()?.config.clone())
    }

    /// Edits the configuration; only allowed before finalize.
    pub fn update_config(&self, f: impl FnOnce(&mut LevelConfig)) -> Result<(), LevelError> {
        let mut setup = self.setup.lock()?;
        if self.is_finalized() {
            return Err(LevelError::AlreadyFinalized);
        }
        f(&mut setup.config);
        Ok(())
    }

    pub fn set_writer_block(&self, frames: usize) -> Result<(), LevelError> {
        let mut setup = self.setup.lock()?;
        if self.is_finalized() {
            return Err(LevelError::AlreadyFinalized);
        }
        setup.writer_block = frames.max(1);
        Ok(())
    }

    pub fn writer_block(&self) -> usize {
        self.setup.lock().map_or(1, |s| s.writer_block)
    }

    /// Registers a reader; must happen before finalize.
    pub fn register_reader(&self) -> Result<ReaderId, LevelError> {
        let mut c = self.cursors.lock()?;
        if self.is_finalized() {
            return Err(LevelError::AlreadyFinalized);
        }
        c.readers.push(ReaderSlot {
            cursor: 0,
            block: 1,
            padding: None,
            full_input: false,
        });
        Ok(ReaderId(c.readers.len() - 1))
    }

    pub fn n_readers(&self) -> usize {
        self.cursors.lock().map_or(0, |c| c.readers.len())
    }

    pub fn set_reader_block(&self, id: ReaderId, frames: usize) -> Result<(), LevelError> {
        self.with_reader_setup(id, |slot| slot.block = frames.max(1))
    }

    pub fn set_reader_padding(&self, id: ReaderId, padding: Padding) -> Result<(), LevelError> {
        self.with_reader_setup(id, |slot| slot.padding = Some(padding))
    }

    /// Marks the reader as needing the whole input; the level then keeps
    /// every frame (linear, growable store).
    pub fn require_full_input(&self, id: ReaderId) -> Result<(), LevelError> {
        self.with_reader_setup(id, |slot| slot.full_input = true)
    }

    fn with_reader_setup(
        &self,
        id: ReaderId,
        f: impl FnOnce(&mut ReaderSlot),
    ) -> Result<(), LevelError> {
        let mut c = self.cursors.lock()?;
        if self.is_finalized() {
            return Err(LevelError::AlreadyFinalized);
        }
        f(c.slot_mut(id)?);
        Ok(())
    }

    /// Largest registered reader block (0 without readers).
    pub fn max_reader_block(&self) -> usize {
        self.cursors
            .lock()
            .map_or(0, |c| c.readers.iter().map(|r| r.block).max().unwrap_or(0))
    }

    /// Smallest capacity `finalize` accepts: one writer block plus one
    /// reader block.
    pub fn required_capacity(&self) -> usize {
        self.writer_block() + self.max_reader_block().max(1)
    }

    /// Allocates storage and freezes the layout.
    pub fn finalize(&self, capacity: usize) -> Result<(), LevelError> {
        let setup = self.setup.lock()?;
        if self.is_finalized() {
            return Err(LevelError::AlreadyFinalized);
        }
        if setup.layout.n_elements() == 0 {
            return Err(LevelError::NoFields);
        }
        let layout = self
            .layout
            .get_or_init(|| Arc::new(setup.layout.clone()))
            .clone();

        let mut c = self.cursors.lock()?;
        let reader_block = c.readers.iter().map(|r| r.block).max().unwrap_or(1);
        let required = setup.writer_block + reader_block;
        if capacity < required {
            return Err(LevelError::CapacityTooSmall {
                requested: capacity,
                required,
            });
        }

        let config = &setup.config;
        let full_input = c.readers.iter().any(|r| r.full_input);
        let ring = config.ring && !full_input;
        let growable = config.growable || full_input;
        let store = Store::allocate(layout.n_elements(), capacity, ring)?;
        *self.store.write()? = store;

        c.n = layout.n_elements();
        c.capacity = capacity;
        c.ring = ring;
        c.growable = growable;
        c.hang = config.hang;
        c.padding = config.padding;
        c.timing = Timing {
            period: config.period,
            frame_length: config.frame_length,
            frame_period: config.frame_period,
        };
        c.refresh_min_r();
        self.finalized.store(true, Ordering::SeqCst);
        debug!(
            level = %self.name,
            n = c.n,
            capacity,
            ring,
            growable,
            readers = c.readers.len(),
            "level finalized"
        );
        Ok(())
    }

    pub fn is_finalized(&self) -> bool {
        self.finalized.load(Ordering::SeqCst)
    }

    // --- writing ---------------------------------------------------------

    /// Stores one frame at `at`.
    pub fn set_frame(&self, at: Index, frame: &Frame) -> Result<(), LevelError> {
        self.write_frames(
            at,
            frame.len(),
            &frame.data,
            std::slice::from_ref(&frame.tmeta),
        )
    }

    /// Stores a block starting at `at`.
    pub fn set_block(&self, at: Index, block: &Block) -> Result<(), LevelError> {
        self.write_frames(at, block.n_elements(), block.data(), block.tmeta())
    }

    fn write_frames(
        &self,
        at: Index,
        width: usize,
        data: &[Sample],
        tmeta: &[TimeMetaInfo],
    ) -> Result<(), LevelError> {
        if !self.is_finalized() {
            return Err(LevelError::NotFinalized);
        }
        let len = tmeta.len();
        let plan = {
            let mut c = self.cursors.lock()?;
            if width != c.n {
                return Err(LevelError::WidthMismatch {
                    expected: c.n,
                    actual: width,
                });
            }
            if len == 0 {
                return Ok(());
            }
            let min_r = c.min_r();
            let v = at.resolve(min_r, c.cur_w);
            let Ok(start) = u64::try_from(v) else {
                return Err(LevelError::InvalidIndex { index: v });
            };
            if start > c.cur_w {
                return Err(LevelError::InvalidIndex { index: v });
            }
            if start < min_r {
                return Err(LevelError::WouldOverwriteLiveData { vidx: v, min_r });
            }
            let end = start + len as u64;
            let growth = c.make_room(&self.name, end, len)?;
            c.pending_end = c.pending_end.max(end);
            WritePlan {
                start,
                end,
                growth,
                timing: c.timing,
            }
        };

        let copied = self.copy_in(&plan, width, data, tmeta);

        let mut c = self.cursors.lock()?;
        let capacity = match copied {
            Ok(capacity) => capacity,
            Err(e) => {
                c.pending_end = c.cur_w;
                return Err(e);
            }
        };
        if let Some(growth) = plan.growth
            && capacity > c.capacity
        {
            c.capacity = capacity;
            c.retained_from = growth.keep_from;
            c.grow_count += 1;
        }
        c.cur_w = c.cur_w.max(plan.end);
        c.pending_end = c.cur_w;
        if c.readers.is_empty() {
            c.refresh_min_r();
        }
        Ok(())
    }

    /// Copies frames into the store; returns the store capacity afterwards.
    fn copy_in(
        &self,
        plan: &WritePlan,
        width: usize,
        data: &[Sample],
        tmeta: &[TimeMetaInfo],
    ) -> Result<usize, LevelError> {
        let _pass = self.gate.write()?;
        let mut store = self.store.write()?;
        if let Some(growth) = plan.growth {
            store.grow(growth.capacity, growth.keep_from, growth.keep_to)?;
            debug!(level = %self.name, capacity = store.capacity(), "level grew");
        }
        let wall_clock = seconds_since(self.clock.as_ref(), self.epoch);
        for (t, meta) in tmeta.iter().enumerate() {
            let vidx = plan.start + t as u64;
            let values = data.get(t * width..(t + 1) * width).unwrap_or(&[]);
            store.put(vidx, values, stamp(vidx, meta, plan.timing, wall_clock));
        }
        Ok(store.capacity())
    }

    /// Grows the store to `new_capacity` frames, keeping every retained frame.
    pub fn grow(&self, new_capacity: usize) -> Result<(), LevelError> {
        if !self.is_finalized() {
            return Err(LevelError::NotFinalized);
        }
        let _pass = self.gate.write()?;
        let (keep_from, keep_to) = {
            let c = self.cursors.lock()?;
            if new_capacity <= c.capacity {
                return Ok(());
            }
            (c.oldest_retained(), c.cur_w)
        };
        let capacity = {
            let mut store = self.store.write()?;
            store.grow(new_capacity, keep_from, keep_to)?;
            store.capacity()
        };
        let mut c = self.cursors.lock()?;
        c.capacity = capacity;
        c.retained_from = keep_from;
        c.grow_count += 1;
        debug!(level = %self.name, capacity, "level grown on request");
        Ok(())
    }

    // --- reading ---------------------------------------------------------

    /// Reads `len` frames starting at `at`; a registered reader's cursor
    /// moves to the end of the range.
    pub fn get_block(
        &self,
        at: Index,
        len: usize,
        reader: Option<ReaderId>,
    ) -> Result<Block, LevelError> {
        self.read(at, len, reader, Advance::ToEnd)
    }

    /// Reads a single frame.
    pub fn get_frame(&self, at: Index, reader: Option<ReaderId>) -> Result<Frame, LevelError> {
        let block = self.read(at, 1, reader, Advance::ToEnd)?;
        block.to_frame(0).ok_or(LevelError::InvalidIndex { index: -1 })
    }

    /// Validates a read without copying or moving any cursor.
    pub fn check_read(
        &self,
        at: Index,
        len: usize,
        reader: Option<ReaderId>,
    ) -> Result<(), LevelError> {
        if !self.is_finalized() {
            return Err(LevelError::NotFinalized);
        }
        let c = self.cursors.lock()?;
        c.plan_read(at, len, reader, self.is_eoi()).map(|_| ())
    }

    pub(crate) fn read(
        &self,
        at: Index,
        len: usize,
        reader: Option<ReaderId>,
        advance: Advance,
    ) -> Result<Block, LevelError> {
        if !self.is_finalized() {
            return Err(LevelError::NotFinalized);
        }
        let plan = {
            let c = self.cursors.lock()?;
            c.plan_read(at, len, reader, self.is_eoi())?
        };

        let block = self.copy_out(&plan)?;

        let mut c = self.cursors.lock()?;
        // The writer may have evicted the range while it was being copied.
        if plan.stored_from < c.oldest_retained() {
            c.left_reads += 1;
            return Err(LevelError::OutOfRange {
                side: Side::Left,
                start: plan.start,
                end: plan.end,
            });
        }
        if let Some(id) = reader {
            let target = match advance {
                Advance::ToEnd => plan.end,
                Advance::To(v) => v,
                Advance::Keep => return Ok(block),
            };
            let target = u64::try_from(target).unwrap_or(0).min(c.cur_w);
            let slot = c.slot_mut(id)?;
            if target > slot.cursor {
                slot.cursor = target;
                c.refresh_min_r();
            }
        }
        Ok(block)
    }

    fn copy_out(&self, plan: &ReadPlan) -> Result<Block, LevelError> {
        let _pass = self.gate.read()?;
        let store = self.store.read()?;
        let n = plan.n;
        let stored = (plan.stored_to - plan.stored_from) as usize;
        let frames = plan.pad_front + stored + plan.pad_back;
        let mut data = Vec::with_capacity(frames * n);
        let mut tmeta = Vec::with_capacity(frames);

        for i in 0..plan.pad_front {
            match plan.padding {
                Padding::ReplicateEdge => data.extend_from_slice(store.values(plan.stored_from)),
                _ => data.extend(std::iter::repeat_n(0.0, n)),
            }
            tmeta.push(plan.timing.padding_meta(plan.start + i as i64));
        }
        for vidx in plan.stored_from..plan.stored_to {
            data.extend_from_slice(store.values(vidx));
            tmeta.push(store.tmeta(vidx).cloned().unwrap_or_default());
        }
        for i in 0..plan.pad_back {
            match plan.padding {
                Padding::ReplicateEdge => {
                    data.extend_from_slice(store.values(plan.stored_to.saturating_sub(1)))
                }
                _ => data.extend(std::iter::repeat_n(0.0, n)),
            }
            tmeta.push(
                plan.timing
                    .padding_meta(plan.stored_to as i64 + i as i64),
            );
        }
        Ok(Block::from_parts(
            n,
            data,
            tmeta,
            self.layout(),
            plan.pad_front,
            plan.pad_back,
        ))
    }

    /// Moves a reader's cursor forward without reading; `None` means up to
    /// the write cursor. Returns the new cursor.
    pub fn catch_up_reader(&self, id: ReaderId, to: Option<u64>) -> Result<u64, LevelError> {
        let mut c = self.cursors.lock()?;
        let target = to.unwrap_or(c.cur_w).min(c.cur_w);
        let slot = c.slot_mut(id)?;
        if target > slot.cursor {
            slot.cursor = target;
            let cursor = slot.cursor;
            c.refresh_min_r();
            return Ok(cursor);
        }
        Ok(slot.cursor)
    }

    /// Moves a reader forward to the oldest retained frame; returns the number
    /// of frames it lost.
    pub(crate) fn skip_evicted(&self, id: ReaderId, from: u64) -> Result<u64, LevelError> {
        let mut c = self.cursors.lock()?;
        let oldest = c.oldest_retained();
        let slot = c.slot_mut(id)?;
        if slot.cursor < oldest {
            slot.cursor = oldest;
            c.refresh_min_r();
        }
        Ok(oldest.saturating_sub(from))
    }

    // --- status ----------------------------------------------------------

    pub fn set_eoi(&self) {
        if !self.eoi.swap(true, Ordering::SeqCst) {
            self.eoi_counter.fetch_add(1, Ordering::SeqCst);
        }
    }

    pub fn unset_eoi(&self) {
        self.eoi.store(false, Ordering::SeqCst);
    }

    pub fn is_eoi(&self) -> bool {
        self.eoi.load(Ordering::SeqCst)
    }

    /// Number of times EOI has been raised on this level.
    pub fn eoi_counter(&self) -> u32 {
        self.eoi_counter.load(Ordering::SeqCst)
    }

    pub fn cur_w(&self) -> u64 {
        self.cursors.lock().map_or(0, |c| c.cur_w)
    }

    pub fn min_r(&self) -> u64 {
        self.cursors.lock().map_or(0, |c| c.min_r())
    }

    /// Index of the last written frame.
    pub fn max_r(&self) -> Option<u64> {
        self.cur_w().checked_sub(1)
    }

    /// Oldest frame still held by the store.
    pub fn oldest_retained(&self) -> u64 {
        self.cursors.lock().map_or(0, |c| c.oldest_retained())
    }

    pub fn capacity(&self) -> usize {
        self.cursors.lock().map_or(0, |c| c.capacity)
    }

    /// Frames the writer can store without growing or evicting.
    pub fn n_free(&self) -> usize {
        self.cursors.lock().map_or(0, |c| c.n_free())
    }

    /// Whether a write of `frames` frames would succeed right now.
    pub fn can_write(&self, frames: usize) -> bool {
        self.is_finalized() && self.cursors.lock().is_ok_and(|c| c.accepts(frames))
    }

    /// Frames written but not yet consumed by `id`.
    pub fn n_avail(&self, id: ReaderId) -> Result<u64, LevelError> {
        let c = self.cursors.lock()?;
        Ok(c.cur_w.saturating_sub(c.slot(id)?.cursor))
    }

    pub fn reader_cursor(&self, id: ReaderId) -> Result<u64, LevelError> {
        Ok(self.cursors.lock()?.slot(id)?.cursor)
    }

    pub fn reader_block(&self, id: ReaderId) -> Result<usize, LevelError> {
        Ok(self.cursors.lock()?.slot(id)?.block)
    }

    /// Frame index covering `seconds` (None for aperiodic levels).
    pub fn sec_to_vidx(&self, seconds: f64) -> Option<u64> {
        let period = self.period();
        if period <= 0.0 || seconds < 0.0 {
            return None;
        }
        Some((seconds / period).floor() as u64)
    }

    /// Start time of frame `vidx` in seconds.
    pub fn vidx_to_sec(&self, vidx: u64) -> f64 {
        vidx as f64 * self.period()
    }

    pub fn period(&self) -> f64 {
        self.setup.lock().map_or(0.0, |s| s.config.period)
    }

    pub fn stats(&self) -> Result<LevelStats, LevelError> {
        let c = self.cursors.lock()?;
        Ok(LevelStats {
            name: self.name.clone(),
            n_elements: c.n,
            capacity: c.capacity,
            ring: c.ring,
            growable: c.growable,
            cur_w: c.cur_w,
            min_r: c.min_r(),
            readers: c.readers.iter().map(|r| r.cursor).collect(),
            eoi: self.is_eoi(),
            eoi_counter: self.eoi_counter(),
            grow_count: c.grow_count,
            evicted: c.evicted,
            left_reads: c.left_reads,
        })
    }
}

fn stamp(vidx: u64, meta: &TimeMetaInfo, timing: Timing, wall_clock: f64) -> TimeMetaInfo {
    let mut stamped = if meta.filled {
        meta.clone()
    } else {
        TimeMetaInfo {
            frame_period: timing.frame_period,
            wall_clock,
            tag: meta.tag.clone(),
            ..TimeMetaInfo::synthetic(vidx, timing.period, timing.frame_length)
        }
    };
    stamped.vidx = vidx;
    stamped.filled = true;
    stamped
}
