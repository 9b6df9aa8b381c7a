//! Backing storage of a level: a ring (slot = vIdx mod capacity) or a linear
//! append-only array (slot = vIdx).

use super::error::LevelError;
use super::frame::Sample;
use super::meta::TimeMetaInfo;

#[derive(Debug, Default)]
pub(crate) struct Store {
    n: usize,
    capacity: usize,
    ring: bool,
    data: Vec<Sample>,
    tmeta: Vec<TimeMetaInfo>,
}

impl Store {
    pub(crate) fn allocate(n: usize, capacity: usize, ring: bool) -> Result<Self, LevelError> {
        let mut store = Self {
            n,
            capacity,
            ring,
            data: Vec::new(),
            tmeta: Vec::new(),
        };
        reserve(&mut store.data, n * capacity, capacity)?;
        reserve(&mut store.tmeta, capacity, capacity)?;
        store.data.resize(n * capacity, 0.0);
        store.tmeta.resize(capacity, TimeMetaInfo::default());
        Ok(store)
    }

    pub(crate) fn capacity(&self) -> usize {
        self.capacity
    }

    fn slot(&self, vidx: u64) -> usize {
        if self.ring {
            (vidx % self.capacity.max(1) as u64) as usize
        } else {
            vidx as usize
        }
    }

    pub(crate) fn put(&mut self, vidx: u64, values: &[Sample], tmeta: TimeMetaInfo) {
        let slot = self.slot(vidx);
        let n = self.n;
        if let Some(dst) = self.data.get_mut(slot * n..(slot + 1) * n) {
            let take = n.min(values.len());
            dst[..take].copy_from_slice(&values[..take]);
        }
        if let Some(dst) = self.tmeta.get_mut(slot) {
            *dst = tmeta;
        }
    }

    pub(crate) fn values(&self, vidx: u64) -> &[Sample] {
        let slot = self.slot(vidx);
        self.data
            .get(slot * self.n..(slot + 1) * self.n)
            .unwrap_or(&[])
    }

    pub(crate) fn tmeta(&self, vidx: u64) -> Option<&TimeMetaInfo> {
        self.tmeta.get(self.slot(vidx))
    }

    /// Reallocates to `new_capacity`, keeping frames `[keep_from, keep_to)`
    /// at their new slots. Everything else is zeroed.
    pub(crate) fn grow(
        &mut self,
        new_capacity: usize,
        keep_from: u64,
        keep_to: u64,
    ) -> Result<(), LevelError> {
        if new_capacity <= self.capacity {
            return Ok(());
        }
        if !self.ring {
            let extra = new_capacity - self.capacity;
            reserve(&mut self.data, extra * self.n, new_capacity)?;
            reserve(&mut self.tmeta, extra, new_capacity)?;
            self.data.resize(new_capacity * self.n, 0.0);
            self.tmeta.resize(new_capacity, TimeMetaInfo::default());
            self.capacity = new_capacity;
            return Ok(());
        }

        let mut grown = Store::allocate(self.n, new_capacity, true)?;
        for vidx in keep_from..keep_to {
            let tmeta = self.tmeta(vidx).cloned().unwrap_or_default();
            grown.put(vidx, self.values(vidx), tmeta);
        }
        *self = grown;
        Ok(())
    }
}

fn reserve<T>(v: &mut Vec<T>, additional: usize, capacity: usize) -> Result<(), LevelError> {
    v.try_reserve_exact(additional)
        .map_err(|_| LevelError::AllocationFailed { capacity })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tm(v: u64) -> TimeMetaInfo {
        TimeMetaInfo::synthetic(v, 1.0, 1.0)
    }

    #[test]
    fn ring_wraps_slots() {
        let mut s = Store::allocate(2, 3, true).unwrap();
        for v in 0..5u64 {
            s.put(v, &[v as Sample, -(v as Sample)], tm(v));
        }
        // 3 and 4 overwrote slots 0 and 1
        assert_eq!(s.values(3), &[3.0, -3.0]);
        assert_eq!(s.values(0), &[3.0, -3.0]);
        assert_eq!(s.values(2), &[2.0, -2.0]);
        assert_eq!(s.tmeta(4).map(|t| t.vidx), Some(4));
    }

    #[test]
    fn ring_grow_remaps_kept_window() {
        let mut s = Store::allocate(1, 4, true).unwrap();
        for v in 2..6u64 {
            s.put(v, &[v as Sample], tm(v));
        }
        s.grow(8, 2, 6).unwrap();
        assert_eq!(s.capacity(), 8);
        for v in 2..6u64 {
            assert_eq!(s.values(v), &[v as Sample]);
            assert_eq!(s.tmeta(v).map(|t| t.vidx), Some(v));
        }
        // Slot of a never-kept frame is zeroed
        assert_eq!(s.values(6), &[0.0]);
    }

    #[test]
    fn linear_grow_extends_in_place() {
        let mut s = Store::allocate(1, 2, false).unwrap();
        s.put(0, &[1.0], tm(0));
        s.put(1, &[2.0], tm(1));
        s.grow(5, 0, 2).unwrap();
        s.put(4, &[5.0], tm(4));
        assert_eq!(s.values(0), &[1.0]);
        assert_eq!(s.values(4), &[5.0]);
        assert_eq!(s.capacity(), 5);
    }

    #[test]
    fn grow_to_smaller_is_noop() {
        let mut s = Store::allocate(1, 4, true).unwrap();
        s.grow(2, 0, 0).unwrap();
        assert_eq!(s.capacity(), 4);
    }
}
