//! Field and timing metadata carried alongside level data.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Declared semantic type of a field.
///
/// Codes are stable and grouped by family (high byte).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DataType {
    #[default]
    Unknown,
    Signal,
    Pcm,
    Spectrum,
    SpectrumBinsMag,
    SpectrumBinsComplex,
    SpectrumBinsPower,
    SpectrumBinsLogPower,
    SpectrumBinsDb,
    SpectrumBinsDbPower,
    SpectrumBinsPhase,
    BandsMag,
    Coefficients,
    Acf,
    Cepstral,
    MixedLld,
    Functionals,
}

impl DataType {
    /// Numeric code of this type.
    pub fn code(self) -> u32 {
        match self {
            DataType::Unknown => 0x0000,
            DataType::Signal => 0x0100,
            DataType::Pcm => 0x0101,
            DataType::Spectrum => 0x0200,
            DataType::SpectrumBinsMag => 0x0201,
            DataType::SpectrumBinsComplex => 0x0202,
            DataType::SpectrumBinsPower => 0x0203,
            DataType::SpectrumBinsLogPower => 0x0204,
            DataType::SpectrumBinsDb => 0x0205,
            DataType::SpectrumBinsDbPower => 0x0206,
            DataType::SpectrumBinsPhase => 0x0207,
            DataType::BandsMag => 0x0220,
            DataType::Coefficients => 0x0300,
            DataType::Acf => 0x0380,
            DataType::Cepstral => 0x0400,
            DataType::MixedLld => 0x1000,
            DataType::Functionals => 0x2000,
        }
    }

    /// Looks up a type by its numeric code.
    pub fn from_code(code: u32) -> Option<Self> {
        const ALL: [DataType; 17] = [
            DataType::Unknown,
            DataType::Signal,
            DataType::Pcm,
            DataType::Spectrum,
            DataType::SpectrumBinsMag,
            DataType::SpectrumBinsComplex,
            DataType::SpectrumBinsPower,
            DataType::SpectrumBinsLogPower,
            DataType::SpectrumBinsDb,
            DataType::SpectrumBinsDbPower,
            DataType::SpectrumBinsPhase,
            DataType::BandsMag,
            DataType::Coefficients,
            DataType::Acf,
            DataType::Cepstral,
            DataType::MixedLld,
            DataType::Functionals,
        ];
        ALL.into_iter().find(|t| t.code() == code)
    }

    /// True for the signal family (raw or PCM samples).
    pub fn is_signal(self) -> bool {
        self.code() & 0xff00 == 0x0100
    }

    /// True for the spectrum family, including the per-bin variants.
    pub fn is_spectrum(self) -> bool {
        self.code() & 0xff00 == 0x0200
    }
}

/// Descriptor of one named field in a frame.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FieldMetaInfo {
    /// Field name (without array suffix).
    pub name: String,
    /// Number of elements this field spans.
    pub count: usize,
    /// Declared semantic type.
    pub data_type: DataType,
    /// First array index used when naming elements (`name[offset]`).
    pub array_offset: usize,
    /// Element offset of this field inside the frame, set by the layout.
    pub start: usize,
}

impl FieldMetaInfo {
    pub fn new(name: impl Into<String>, count: usize) -> Self {
        Self {
            name: name.into(),
            count,
            data_type: DataType::Unknown,
            array_offset: 0,
            start: 0,
        }
    }

    pub fn with_data_type(mut self, data_type: DataType) -> Self {
        self.data_type = data_type;
        self
    }

    pub fn with_array_offset(mut self, offset: usize) -> Self {
        self.array_offset = offset;
        self
    }

    /// Name of element `k` within this field.
    pub fn element_name(&self, k: usize) -> String {
        if self.count > 1 {
            format!("{}[{}]", self.name, k + self.array_offset)
        } else {
            self.name.clone()
        }
    }
}

/// Ordered list of fields making up one frame.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct FieldLayout {
    fields: Vec<FieldMetaInfo>,
    n_elements: usize,
}

impl FieldLayout {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a field and returns its index, or `None` if the name is taken.
    pub fn push(&mut self, mut field: FieldMetaInfo) -> Option<usize> {
        if self.fields.iter().any(|f| f.name == field.name) {
            return None;
        }
        field.start = self.n_elements;
        self.n_elements += field.count;
        self.fields.push(field);
        Some(self.fields.len() - 1)
    }

    /// Total number of elements per frame.
    pub fn n_elements(&self) -> usize {
        self.n_elements
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn fields(&self) -> &[FieldMetaInfo] {
        &self.fields
    }

    pub fn field(&self, idx: usize) -> Option<&FieldMetaInfo> {
        self.fields.get(idx)
    }

    /// Finds a field by name; `name[k]` addresses a single array element.
    ///
    /// Returns the field index and the element index within the frame.
    pub fn find_field(&self, name: &str) -> Option<(usize, usize)> {
        let (base, element) = match name.strip_suffix(']').and_then(|s| s.split_once('[')) {
            Some((base, idx)) => (base, Some(idx.trim().parse::<usize>().ok()?)),
            None => (name, None),
        };
        let idx = self.fields.iter().position(|f| f.name == base)?;
        let field = &self.fields[idx];
        match element {
            None => Some((idx, field.start)),
            Some(k) => {
                let k = k.checked_sub(field.array_offset)?;
                (k < field.count).then_some((idx, field.start + k))
            }
        }
    }

    /// Maps a frame element index to `(field index, offset within field)`.
    pub fn field_of_element(&self, element: usize) -> Option<(usize, usize)> {
        self.fields
            .iter()
            .position(|f| element >= f.start && element < f.start + f.count)
            .map(|idx| (idx, element - self.fields[idx].start))
    }

    /// Display name of a frame element.
    pub fn element_name(&self, element: usize) -> Option<String> {
        let (idx, k) = self.field_of_element(element)?;
        Some(self.fields[idx].element_name(k))
    }

    /// Names of all elements in frame order.
    pub fn element_names(&self) -> Vec<String> {
        self.fields
            .iter()
            .flat_map(|f| (0..f.count).map(move |k| f.element_name(k)))
            .collect()
    }
}

/// Free-form per-frame tag.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct FrameTag {
    pub id: i32,
    pub ints: [i64; 8],
    pub floats: [f64; 8],
    pub text: Option<String>,
    pub blob: Option<Vec<u8>>,
}

/// Timing record of one frame.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct TimeMetaInfo {
    /// Absolute frame index on the level's timeline.
    pub vidx: u64,
    /// Frame period in seconds (0 for aperiodic levels).
    pub period: f64,
    /// Start time of the frame in seconds.
    pub time: f64,
    /// Length of the frame in seconds.
    pub length_sec: f64,
    /// Period of the frames this frame was derived from (0 if unknown).
    pub frame_period: f64,
    /// Seconds since pipeline start when the frame was stored.
    pub wall_clock: f64,
    /// True when the producer filled the record itself.
    pub filled: bool,
    pub tag: Option<Box<FrameTag>>,
}

impl TimeMetaInfo {
    /// Record the level synthesizes for a frame at `vidx`.
    pub fn synthetic(vidx: u64, period: f64, length_sec: f64) -> Self {
        Self {
            vidx,
            period,
            time: vidx as f64 * period,
            length_sec,
            ..Self::default()
        }
    }

    /// Start time plus length.
    pub fn end_time(&self) -> f64 {
        self.time + self.length_sec
    }

    /// Merges a run of records into one spanning all of them.
    ///
    /// Index, period and wall clock come from the first record; the length
    /// covers up to the end of the last one. The first tag wins.
    pub fn squash(records: &[TimeMetaInfo]) -> Option<TimeMetaInfo> {
        let first = records.first()?;
        let last = records.last()?;
        let mut merged = first.clone();
        merged.length_sec = (last.end_time() - first.time).max(first.length_sec);
        merged.filled = records.iter().all(|r| r.filled);
        if merged.tag.is_none() {
            merged.tag = records.iter().find_map(|r| r.tag.clone());
        }
        Some(merged)
    }
}

impl fmt::Display for TimeMetaInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "vIdx={} t={:.4}s len={:.4}s",
            self.vidx, self.time, self.length_sec
        )
    }
}
