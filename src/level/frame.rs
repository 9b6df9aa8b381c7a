//! Frames and blocks exchanged with a level.

use super::meta::{FieldLayout, TimeMetaInfo};
use std::sync::Arc;

/// Element type stored in levels.
pub type Sample = f32;

/// One time slice: `n` elements plus timing.
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    pub data: Vec<Sample>,
    pub tmeta: TimeMetaInfo,
    /// Layout of the level this frame came from, if any.
    pub fields: Option<Arc<FieldLayout>>,
}

impl Frame {
    pub fn new(data: Vec<Sample>) -> Self {
        Self {
            data,
            tmeta: TimeMetaInfo::default(),
            fields: None,
        }
    }

    pub fn zeros(n: usize) -> Self {
        Self::new(vec![0.0; n])
    }

    pub fn with_tmeta(mut self, tmeta: TimeMetaInfo) -> Self {
        self.tmeta = tmeta;
        self
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Value of a named element (`name` or `name[k]`).
    pub fn get(&self, name: &str) -> Option<Sample> {
        let (_, element) = self.fields.as_ref()?.find_field(name)?;
        self.data.get(element).copied()
    }
}

/// A contiguous run of frames, stored frame-major (`data[t * n + i]`).
#[derive(Debug, Clone, PartialEq)]
pub struct Block {
    n: usize,
    data: Vec<Sample>,
    tmeta: Vec<TimeMetaInfo>,
    fields: Option<Arc<FieldLayout>>,
    padded_front: usize,
    padded_back: usize,
}

impl Block {
    /// Zero-filled block of `frames` frames with `n` elements each.
    pub fn zeros(n: usize, frames: usize) -> Self {
        Self {
            n,
            data: vec![0.0; n * frames],
            tmeta: vec![TimeMetaInfo::default(); frames],
            fields: None,
            padded_front: 0,
            padded_back: 0,
        }
    }

    /// Wraps frame-major data. Trailing elements that do not fill a whole
    /// frame are dropped.
    pub fn from_data(n: usize, mut data: Vec<Sample>) -> Self {
        let frames = data.len().checked_div(n).unwrap_or(0);
        data.truncate(frames * n);
        Self {
            n,
            data,
            tmeta: vec![TimeMetaInfo::default(); frames],
            fields: None,
            padded_front: 0,
            padded_back: 0,
        }
    }

    /// Single-element-per-frame block from a run of samples.
    pub fn from_samples(samples: &[Sample]) -> Self {
        Self::from_data(1, samples.to_vec())
    }

    pub fn from_frames(frames: &[Frame]) -> Self {
        let n = frames.first().map_or(0, Frame::len);
        let mut block = Self::zeros(n, 0);
        for frame in frames {
            block.push_frame(&frame.data[..n.min(frame.len())], frame.tmeta.clone());
        }
        block
    }

    pub(crate) fn from_parts(
        n: usize,
        data: Vec<Sample>,
        tmeta: Vec<TimeMetaInfo>,
        fields: Option<Arc<FieldLayout>>,
        padded_front: usize,
        padded_back: usize,
    ) -> Self {
        Self {
            n,
            data,
            tmeta,
            fields,
            padded_front,
            padded_back,
        }
    }

    /// Appends a frame; short input is zero-extended, long input truncated.
    pub fn push_frame(&mut self, values: &[Sample], tmeta: TimeMetaInfo) {
        let take = values.len().min(self.n);
        self.data.extend_from_slice(&values[..take]);
        self.data.extend(std::iter::repeat_n(0.0, self.n - take));
        self.tmeta.push(tmeta);
    }

    /// Elements per frame.
    pub fn n_elements(&self) -> usize {
        self.n
    }

    pub fn n_frames(&self) -> usize {
        self.tmeta.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tmeta.is_empty()
    }

    pub fn frame(&self, t: usize) -> Option<&[Sample]> {
        self.data.get(t * self.n..(t + 1) * self.n)
    }

    pub fn frame_mut(&mut self, t: usize) -> Option<&mut [Sample]> {
        self.data.get_mut(t * self.n..(t + 1) * self.n)
    }

    /// Iterates over frames in time order.
    pub fn frames(&self) -> impl Iterator<Item = &[Sample]> {
        self.data.chunks_exact(self.n.max(1)).take(self.n_frames())
    }

    /// Values of element `i` across all frames.
    pub fn column(&self, i: usize) -> impl Iterator<Item = Sample> + '_ {
        self.frames().filter_map(move |f| f.get(i).copied())
    }

    /// Copies frame `t` out as an owned frame.
    pub fn to_frame(&self, t: usize) -> Option<Frame> {
        Some(Frame {
            data: self.frame(t)?.to_vec(),
            tmeta: self.tmeta.get(t)?.clone(),
            fields: self.fields.clone(),
        })
    }

    pub fn data(&self) -> &[Sample] {
        &self.data
    }

    pub fn into_data(self) -> Vec<Sample> {
        self.data
    }

    pub fn tmeta(&self) -> &[TimeMetaInfo] {
        &self.tmeta
    }

    pub fn tmeta_mut(&mut self) -> &mut [TimeMetaInfo] {
        &mut self.tmeta
    }

    pub fn fields(&self) -> Option<&Arc<FieldLayout>> {
        self.fields.as_ref()
    }

    pub fn set_fields(&mut self, fields: Option<Arc<FieldLayout>>) {
        self.fields = fields;
    }

    /// Frames synthesized before the first stored frame.
    pub fn padded_front(&self) -> usize {
        self.padded_front
    }

    /// Frames synthesized after the last stored frame.
    pub fn padded_back(&self) -> usize {
        self.padded_back
    }

    /// Number of frames that came from storage.
    pub fn n_stored(&self) -> usize {
        self.n_frames() - self.padded_front - self.padded_back
    }

    /// Timing of the whole block merged into one record.
    pub fn squash_time_meta(&self) -> Option<TimeMetaInfo> {
        TimeMetaInfo::squash(&self.tmeta)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn from_data_is_frame_major() {
        let b = Block::from_data(2, vec![1.0, 2.0, 3.0, 4.0, 5.0]);
        assert_eq!(b.n_frames(), 2);
        assert_eq!(b.frame(1), Some(&[3.0, 4.0][..]));
        assert_eq!(b.frame(2), None);
        assert_eq!(b.column(1).collect::<Vec<_>>(), vec![2.0, 4.0]);
    }

    #[test]
    fn push_frame_pads_short_input() {
        let mut b = Block::zeros(3, 0);
        b.push_frame(&[1.0], TimeMetaInfo::default());
        b.push_frame(&[1.0, 2.0, 3.0, 4.0], TimeMetaInfo::default());
        assert_eq!(b.data(), &[1.0, 0.0, 0.0, 1.0, 2.0, 3.0]);
    }

    #[test]
    fn from_frames_roundtrips_tmeta() {
        let frames: Vec<Frame> = (0..3)
            .map(|i| {
                Frame::new(vec![i as Sample; 2]).with_tmeta(TimeMetaInfo::synthetic(i, 0.5, 0.5))
            })
            .collect();
        let b = Block::from_frames(&frames);
        assert_eq!(b.n_frames(), 3);
        assert_eq!(b.to_frame(2).map(|f| f.tmeta.vidx), Some(2));
        assert_eq!(b.n_stored(), 3);
    }

    #[test]
    fn zero_width_block_has_no_frames_iterated() {
        let b = Block::from_data(0, vec![1.0]);
        assert_eq!(b.n_frames(), 0);
        assert_eq!(b.frames().count(), 0);
    }

    #[test]
    fn frame_get_by_name() {
        let mut layout = FieldLayout::new();
        layout
            .push(crate::level::meta::FieldMetaInfo::new("a", 1))
            .unwrap();
        layout
            .push(crate::level::meta::FieldMetaInfo::new("b", 2))
            .unwrap();
        let mut f = Frame::new(vec![1.0, 2.0, 3.0]);
        f.fields = Some(Arc::new(layout));
        assert_eq!(f.get("b[1]"), Some(3.0));
        assert_eq!(f.get("a"), Some(1.0));
    }
}
