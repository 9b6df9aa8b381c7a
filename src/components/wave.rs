//! WAV file source.

use super::{registered, write_or_stall};
use crate::defaults;
use crate::error::{LevelflowError, Result};
use crate::level::{Block, DataType, FieldMetaInfo, LevelConfig, LevelWriter, Sample};
use crate::pipeline::{Component, ComponentError, Registrar, TickContext, TickResult};
use std::io::Read;
use std::path::Path;
use tracing::{debug, info};

/// Writes the samples of a WAV file, down-mixed to mono and scaled to
/// [-1, 1], into a one-element `pcm` level.
pub struct WaveSource {
    name: String,
    level: String,
    samples: Vec<Sample>,
    sample_rate: u32,
    position: usize,
    block: usize,
    out: Option<LevelWriter>,
}

impl WaveSource {
    /// Decodes the whole file up front.
    pub fn open(name: impl Into<String>, path: impl AsRef<Path>) -> Result<Self> {
        let reader = hound::WavReader::open(path.as_ref())?;
        Self::from_wav(name.into(), reader)
    }

    pub fn from_reader<R: Read>(name: impl Into<String>, reader: R) -> Result<Self> {
        Self::from_wav(name.into(), hound::WavReader::new(reader)?)
    }

    fn from_wav<R: Read>(name: String, mut reader: hound::WavReader<R>) -> Result<Self> {
        let spec = reader.spec();
        let channels = usize::from(spec.channels.max(1));
        let interleaved: Vec<Sample> = match spec.sample_format {
            hound::SampleFormat::Float => reader
                .samples::<f32>()
                .collect::<std::result::Result<Vec<_>, _>>()?,
            hound::SampleFormat::Int => {
                if spec.bits_per_sample == 0 || spec.bits_per_sample > 32 {
                    return Err(LevelflowError::UnsupportedInput {
                        message: format!("{} bits per sample", spec.bits_per_sample),
                    });
                }
                let scale = 1.0 / f64::from(1u32 << (spec.bits_per_sample - 1));
                reader
                    .samples::<i32>()
                    .map(|s| s.map(|v| (f64::from(v) * scale) as Sample))
                    .collect::<std::result::Result<Vec<_>, _>>()?
            }
        };

        let samples = if channels == 1 {
            interleaved
        } else {
            interleaved
                .chunks_exact(channels)
                .map(|frame| frame.iter().sum::<Sample>() / channels as Sample)
                .collect()
        };
        debug!(
            source = %name,
            sample_rate = spec.sample_rate,
            channels,
            samples = samples.len(),
            "wave file decoded"
        );

        let mut source = Self {
            name,
            level: "pcm".to_string(),
            samples,
            sample_rate: spec.sample_rate,
            position: 0,
            block: 1,
            out: None,
        };
        source.set_block_sec(defaults::SOURCE_BLOCK_SEC);
        Ok(source)
    }

    /// Source over samples already in memory.
    pub fn from_samples(name: impl Into<String>, samples: Vec<Sample>, sample_rate: u32) -> Self {
        let mut source = Self {
            name: name.into(),
            level: "pcm".to_string(),
            samples,
            sample_rate: sample_rate.max(1),
            position: 0,
            block: 1,
            out: None,
        };
        source.set_block_sec(defaults::SOURCE_BLOCK_SEC);
        source
    }

    /// Output level name (default `pcm`).
    pub fn with_level(mut self, level: impl Into<String>) -> Self {
        self.level = level.into();
        self
    }

    /// Seconds of audio written per tick.
    pub fn with_block_sec(mut self, seconds: f64) -> Self {
        self.set_block_sec(seconds);
        self
    }

    fn set_block_sec(&mut self, seconds: f64) {
        self.block = ((seconds * f64::from(self.sample_rate)).round() as usize).max(1);
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn duration_sec(&self) -> f64 {
        self.samples.len() as f64 / f64::from(self.sample_rate.max(1))
    }

    pub fn n_samples(&self) -> usize {
        self.samples.len()
    }
}

impl Component for WaveSource {
    fn name(&self) -> &str {
        &self.name
    }

    fn register(&mut self, reg: &mut Registrar<'_>) -> std::result::Result<(), ComponentError> {
        let period = 1.0 / f64::from(self.sample_rate);
        self.out = Some(reg.writer_of(&self.level, LevelConfig::periodic(period))?);
        Ok(())
    }

    fn configure(&mut self) -> std::result::Result<bool, ComponentError> {
        let out = registered(&self.out, &self.name)?;
        out.add_field_meta(FieldMetaInfo::new("pcm", 1).with_data_type(DataType::Pcm))?;
        out.set_block_size(self.block)?;
        Ok(true)
    }

    fn tick(&mut self, _ctx: &mut TickContext<'_>) -> std::result::Result<TickResult, ComponentError> {
        if self.position >= self.samples.len() {
            return Ok(TickResult::Inactive);
        }
        let out = registered(&self.out, &self.name)?;
        let end = (self.position + self.block).min(self.samples.len());
        let result = write_or_stall(out, &Block::from_samples(&self.samples[self.position..end]))?;
        if result.is_progress() {
            self.position = end;
            if self.position == self.samples.len() {
                info!(source = %self.name, frames = end, "wave input exhausted");
            }
        }
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn wav_bytes(spec: hound::WavSpec, samples: &[i16]) -> Vec<u8> {
        let mut cursor = Cursor::new(Vec::new());
        {
            let mut writer = hound::WavWriter::new(&mut cursor, spec).unwrap();
            for &s in samples {
                writer.write_sample(s).unwrap();
            }
            writer.finalize().unwrap();
        }
        cursor.into_inner()
    }

    #[test]
    fn decodes_mono_and_scales() {
        let spec = hound::WavSpec {
            channels: 1,
            sample_rate: 8000,
            bits_per_sample: 16,
            sample_format: hound::SampleFormat::Int,
        };
        let bytes = wav_bytes(spec, &[0, 16384, -32768]);
        let source = WaveSource::from_reader("wave", Cursor::new(bytes)).unwrap();
        assert_eq!(source.sample_rate(), 8000);
        assert_eq!(source.samples, vec![0.0, 0.5, -1.0]);
    }

    #[test]
    fn downmixes_stereo() {
        let spec = hound::WavSpec {
            channels: 2,
            sample_rate: 16000,
            bits_per_sample: 16,
            sample_format: hound::SampleFormat::Int,
        };
        let bytes = wav_bytes(spec, &[16384, 0, -16384, -16384]);
        let source = WaveSource::from_reader("wave", Cursor::new(bytes)).unwrap();
        assert_eq!(source.samples, vec![0.25, -0.5]);
    }

    #[test]
    fn rejects_garbage() {
        let result = WaveSource::from_reader("wave", Cursor::new(b"not a wav".to_vec()));
        assert!(matches!(result, Err(LevelflowError::Wav(_))));
    }

    #[test]
    fn block_follows_sample_rate() {
        let source = WaveSource::from_samples("wave", vec![0.0; 10], 16000).with_block_sec(0.01);
        assert_eq!(source.block, 160);
        assert!((source.duration_sec() - 10.0 / 16000.0).abs() < 1e-12);
    }
}
