//! Per-component handles onto a shared level.

use super::buffer::{Advance, Level, LevelConfig, ReaderId};
use super::error::LevelError;
use super::frame::{Block, Frame};
use super::index::{Index, Padding, Side};
use super::meta::{FieldLayout, FieldMetaInfo};
use std::sync::Arc;
use tracing::warn;

/// The single writing side of a level.
#[derive(Debug, Clone)]
pub struct LevelWriter {
    level: Arc<Level>,
}

impl LevelWriter {
    pub(crate) fn new(level: Arc<Level>) -> Self {
        Self { level }
    }

    pub fn level(&self) -> &Arc<Level> {
        &self.level
    }

    pub fn name(&self) -> &str {
        self.level.name()
    }

    pub fn add_field(&self, name: impl Into<String>, count: usize) -> Result<usize, LevelError> {
        self.level.add_field(name, count)
    }

    pub fn add_field_meta(&self, field: FieldMetaInfo) -> Result<usize, LevelError> {
        self.level.add_field_meta(field)
    }

    /// Largest block this writer stores in one call.
    pub fn set_block_size(&self, frames: usize) -> Result<(), LevelError> {
        self.level.set_writer_block(frames)
    }

    pub fn update_config(&self, f: impl FnOnce(&mut LevelConfig)) -> Result<(), LevelError> {
        self.level.update_config(f)
    }

    /// Appends a block at the write cursor.
    pub fn write(&self, block: &Block) -> Result<(), LevelError> {
        self.level.set_block(Index::CurrentWrite, block)
    }

    pub fn write_at(&self, at: Index, block: &Block) -> Result<(), LevelError> {
        self.level.set_block(at, block)
    }

    pub fn write_frame(&self, frame: &Frame) -> Result<(), LevelError> {
        self.level.set_frame(Index::CurrentWrite, frame)
    }

    /// Whether a write of `frames` frames would be accepted now.
    pub fn check_write(&self, frames: usize) -> bool {
        self.level.can_write(frames)
    }

    pub fn set_eoi(&self) {
        self.level.set_eoi();
    }

    pub fn cur_w(&self) -> u64 {
        self.level.cur_w()
    }

    pub fn layout(&self) -> Option<Arc<FieldLayout>> {
        self.level.layout()
    }
}

/// One component's reading position on a level.
#[derive(Debug)]
pub struct LevelReader {
    level: Arc<Level>,
    id: ReaderId,
    block: usize,
    step: usize,
    eoi_level: u32,
    warned_left: bool,
    lost: u64,
}

impl LevelReader {
    pub(crate) fn new(level: Arc<Level>, id: ReaderId) -> Self {
        Self {
            level,
            id,
            block: 1,
            step: 1,
            eoi_level: 0,
            warned_left: false,
            lost: 0,
        }
    }

    pub fn level(&self) -> &Arc<Level> {
        &self.level
    }

    pub fn id(&self) -> ReaderId {
        self.id
    }

    pub fn name(&self) -> &str {
        self.level.name()
    }

    /// Reads `frames` frames per call and advances by `step`
    /// (overlapping windows when `step < frames`).
    pub fn set_block(&mut self, frames: usize, step: usize) -> Result<(), LevelError> {
        let frames = frames.max(1);
        let step = step.max(1);
        self.level.set_reader_block(self.id, frames.max(step))?;
        self.block = frames;
        self.step = step;
        Ok(())
    }

    pub fn block(&self) -> usize {
        self.block
    }

    pub fn step(&self) -> usize {
        self.step
    }

    pub fn set_padding(&self, padding: Padding) -> Result<(), LevelError> {
        self.level.set_reader_padding(self.id, padding)
    }

    pub fn require_full_input(&self) -> Result<(), LevelError> {
        self.level.require_full_input(self.id)
    }

    /// Restricts EOI to one drain pass: the reader only reports EOI while the
    /// level's EOI counter equals `level` (0 matches any pass).
    pub fn set_eoi_level(&mut self, level: u32) {
        self.eoi_level = level;
    }

    /// Field layout of the upstream level, once its writer configured it.
    pub fn upstream_layout(&self) -> Option<Arc<FieldLayout>> {
        self.level.layout()
    }

    pub fn cursor(&self) -> Result<u64, LevelError> {
        self.level.reader_cursor(self.id)
    }

    pub fn n_avail(&self) -> Result<u64, LevelError> {
        self.level.n_avail(self.id)
    }

    pub fn is_eoi(&self) -> bool {
        self.level.is_eoi() && (self.eoi_level == 0 || self.level.eoi_counter() == self.eoi_level)
    }

    /// Frames this reader lost to eviction.
    pub fn lost_frames(&self) -> u64 {
        self.lost
    }

    /// Reads the next window. `Ok(None)` means the data is not there yet.
    ///
    /// When the window was already overwritten, the reader warns once, skips
    /// to the oldest retained frame and retries.
    pub fn read_next(&mut self) -> Result<Option<Block>, LevelError> {
        match self.try_read_next() {
            Err(LevelError::OutOfRange {
                side: Side::Left,
                start,
                ..
            }) => {
                let lost = self
                    .level
                    .skip_evicted(self.id, u64::try_from(start).unwrap_or(0))?;
                self.lost += lost;
                if !self.warned_left {
                    self.warned_left = true;
                    warn!(
                        level = %self.level.name(),
                        lost,
                        "reader fell behind the writer; skipping ahead"
                    );
                }
                match self.try_read_next() {
                    Err(e) if e.is_retryable() => Ok(None),
                    other => other.map(Some),
                }
            }
            Err(e) if e.is_retryable() => Ok(None),
            other => other.map(Some),
        }
    }

    fn try_read_next(&self) -> Result<Block, LevelError> {
        let start = self.level.reader_cursor(self.id)?;
        let next = i64::try_from(start).unwrap_or(i64::MAX - self.step as i64) + self.step as i64;
        // A step past the window skips unread frames; wait until the next
        // window start exists so the cursor stays on the step grid.
        if self.step > self.block && !self.level.is_eoi() && next > self.level.cur_w() as i64 {
            return Err(LevelError::OutOfRange {
                side: Side::Right,
                start: start as i64,
                end: next,
            });
        }
        self.level
            .read(Index::CurrentRead, self.block, Some(self.id), Advance::To(next))
    }

    /// Reads everything written since the last read.
    pub fn read_to_end(&mut self) -> Result<Option<Block>, LevelError> {
        let avail = self.level.n_avail(self.id)?;
        if avail == 0 {
            return Ok(None);
        }
        match self
            .level
            .get_block(Index::CurrentRead, avail as usize, Some(self.id))
        {
            Ok(block) => Ok(Some(block)),
            Err(e) if e.is_retryable() => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// The last `len` written frames (fewer if less was written), without
    /// consuming anything.
    pub fn peek_latest(&self, len: usize) -> Result<Option<Block>, LevelError> {
        let len = len.min(usize::try_from(self.level.cur_w()).unwrap_or(usize::MAX));
        if len == 0 {
            return Ok(None);
        }
        let at = Index::RelativeToWrite(-i64::try_from(len).unwrap_or(i64::MAX));
        self.level
            .read(at, len, Some(self.id), Advance::Keep)
            .map(Some)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::level::buffer::HangPolicy;

    fn pair(config: LevelConfig) -> (LevelWriter, LevelReader) {
        let level = Arc::new(Level::new("pcm", config));
        let writer = LevelWriter::new(level.clone());
        writer.add_field("pcm", 1).unwrap();
        let id = level.register_reader().unwrap();
        let reader = LevelReader::new(level.clone(), id);
        (writer, reader)
    }

    fn finalize(reader: &LevelReader, capacity: usize) {
        reader.level().finalize(capacity).unwrap();
    }

    #[test]
    fn overlapping_windows_advance_by_step() {
        let (w, mut r) = pair(LevelConfig::default());
        r.set_block(4, 2).unwrap();
        finalize(&r, 16);
        w.write(&Block::from_samples(&[0.0, 1.0, 2.0, 3.0, 4.0, 5.0]))
            .unwrap();

        let a = r.read_next().unwrap().unwrap();
        assert_eq!(a.data(), &[0.0, 1.0, 2.0, 3.0]);
        let b = r.read_next().unwrap().unwrap();
        assert_eq!(b.data(), &[2.0, 3.0, 4.0, 5.0]);
        assert!(r.read_next().unwrap().is_none());
        assert_eq!(r.cursor().unwrap(), 4);
    }

    #[test]
    fn step_larger_than_block_stays_on_the_step_grid() {
        let (w, mut r) = pair(LevelConfig::default());
        r.set_block(1, 3).unwrap();
        finalize(&r, 16);
        w.write(&Block::from_samples(&[0.0, 1.0])).unwrap();
        // Frame 0 is there, but frame 3 is not yet.
        assert!(r.read_next().unwrap().is_none());
        assert_eq!(r.cursor().unwrap(), 0);

        w.write(&Block::from_samples(&[2.0, 3.0, 4.0, 5.0])).unwrap();
        assert_eq!(r.read_next().unwrap().unwrap().data(), &[0.0]);
        assert_eq!(r.read_next().unwrap().unwrap().data(), &[3.0]);
        assert!(r.read_next().unwrap().is_none());
        assert_eq!(r.cursor().unwrap(), 6);
    }

    #[test]
    fn not_ready_is_none_not_error() {
        let (_w, mut r) = pair(LevelConfig::default());
        r.set_block(2, 2).unwrap();
        finalize(&r, 8);
        assert!(r.read_next().unwrap().is_none());
    }

    #[test]
    fn left_read_skips_ahead_and_counts_loss() {
        let (w, mut r) = pair(LevelConfig::default().with_hang(HangPolicy::NeverHang));
        r.set_block(2, 2).unwrap();
        finalize(&r, 4);
        w.write(&Block::from_samples(&[0.0, 1.0, 2.0, 3.0])).unwrap();
        w.write(&Block::from_samples(&[4.0, 5.0, 6.0, 7.0])).unwrap();
        // The writer already lifted the cursor, so this read succeeds from 4.
        let block = r.read_next().unwrap().unwrap();
        assert_eq!(block.data(), &[4.0, 5.0]);
    }

    #[test]
    fn read_to_end_drains_available() {
        let (w, mut r) = pair(LevelConfig::default());
        finalize(&r, 8);
        w.write(&Block::from_samples(&[1.0, 2.0, 3.0])).unwrap();
        let all = r.read_to_end().unwrap().unwrap();
        assert_eq!(all.n_frames(), 3);
        assert!(r.read_to_end().unwrap().is_none());
    }

    #[test]
    fn peek_latest_does_not_consume() {
        let (w, r) = pair(LevelConfig::default());
        finalize(&r, 8);
        assert!(r.peek_latest(1).unwrap().is_none());
        w.write(&Block::from_samples(&[1.0, 9.0])).unwrap();
        let last = r.peek_latest(1).unwrap().unwrap();
        assert_eq!(last.data(), &[9.0]);
        let both = r.peek_latest(5).unwrap().unwrap();
        assert_eq!(both.data(), &[1.0, 9.0]);
        assert_eq!(r.cursor().unwrap(), 0);
    }

    #[test]
    fn eoi_level_matches_one_pass() {
        let (w, mut r) = pair(LevelConfig::default());
        r.set_eoi_level(2);
        finalize(&r, 8);
        w.set_eoi();
        assert!(!r.is_eoi());
        r.level().unset_eoi();
        w.set_eoi();
        assert!(r.is_eoi());
        r.level().unset_eoi();
        w.set_eoi();
        assert!(!r.is_eoi());
        r.set_eoi_level(0);
        assert!(r.is_eoi());
    }

    #[test]
    fn check_write_reports_free_space() {
        let (w, r) = pair(LevelConfig::default().with_hang(HangPolicy::Hang));
        finalize(&r, 4);
        assert!(w.check_write(4));
        w.write(&Block::from_samples(&[1.0, 2.0, 3.0])).unwrap();
        assert!(w.check_write(1));
        assert!(!w.check_write(2));
    }

    #[test]
    fn check_write_accepts_growable_and_evicting_levels() {
        let (w, r) = pair(LevelConfig::default().with_growable(true));
        finalize(&r, 2);
        w.write(&Block::from_samples(&[1.0, 2.0])).unwrap();
        assert!(w.check_write(8));

        let level = Arc::new(Level::new(
            "free",
            LevelConfig::default().with_hang(HangPolicy::NeverHang),
        ));
        let writer = LevelWriter::new(level.clone());
        writer.add_field("x", 1).unwrap();
        level.finalize(2).unwrap();
        writer.write(&Block::from_samples(&[1.0, 2.0])).unwrap();
        assert!(writer.check_write(2));
        assert!(!writer.check_write(3));
    }

    #[test]
    fn upstream_layout_visible_after_fix() {
        let (w, r) = pair(LevelConfig::default());
        assert!(r.upstream_layout().is_none());
        w.level().fix_layout().unwrap();
        let layout = r.upstream_layout().unwrap();
        assert_eq!(layout.element_names(), vec!["pcm".to_string()]);
    }
}
