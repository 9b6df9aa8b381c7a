//! Cuts a one-element signal level into overlapping frames.

use super::{registered, registered_mut, write_or_stall};
use crate::defaults;
use crate::level::{
    Block, DataType, FieldMetaInfo, LevelConfig, LevelReader, LevelWriter, Padding,
};
use crate::pipeline::{Component, ComponentError, Registrar, TickContext, TickResult};
use std::time::Duration;
use tracing::debug;

pub struct Framer {
    name: String,
    input_level: String,
    output_level: String,
    size: Duration,
    step: Duration,
    /// Frame size and step in input frames, known after configure.
    size_frames: usize,
    step_frames: usize,
    input: Option<LevelReader>,
    out: Option<LevelWriter>,
}

impl Framer {
    pub fn new(
        name: impl Into<String>,
        input_level: impl Into<String>,
        output_level: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            input_level: input_level.into(),
            output_level: output_level.into(),
            size: Duration::from_secs_f64(defaults::FRAME_SIZE_SEC),
            step: Duration::from_secs_f64(defaults::FRAME_STEP_SEC),
            size_frames: 0,
            step_frames: 0,
            input: None,
            out: None,
        }
    }

    pub fn with_frame_size(mut self, size: Duration) -> Self {
        self.size = size;
        self
    }

    pub fn with_frame_step(mut self, step: Duration) -> Self {
        self.step = step;
        self
    }

    /// Frame size and step in input frames (zero before configure).
    pub fn frame_geometry(&self) -> (usize, usize) {
        (self.size_frames, self.step_frames)
    }
}

impl Component for Framer {
    fn name(&self) -> &str {
        &self.name
    }

    fn register(&mut self, reg: &mut Registrar<'_>) -> Result<(), ComponentError> {
        self.input = Some(reg.reader_of(&self.input_level)?);
        self.out = Some(reg.writer_of(&self.output_level, LevelConfig::default())?);
        Ok(())
    }

    fn configure(&mut self) -> Result<bool, ComponentError> {
        let input = registered_mut(&mut self.input, &self.name)?;
        let Some(layout) = input.upstream_layout() else {
            return Ok(false);
        };
        if layout.n_elements() != 1 {
            return Err(ComponentError::Fatal(format!(
                "framer input '{}' has {} elements, expected 1",
                self.input_level,
                layout.n_elements()
            )));
        }
        let period = input.level().period();
        if period <= 0.0 {
            return Err(ComponentError::Fatal(format!(
                "framer input '{}' is not periodic",
                self.input_level
            )));
        }

        let size = ((self.size.as_secs_f64() / period).round() as usize).max(1);
        let step = ((self.step.as_secs_f64() / period).round() as usize).max(1);
        input.set_block(size, step)?;
        input.set_padding(Padding::Zero)?;

        let out = registered(&self.out, &self.name)?;
        out.update_config(|c| {
            c.period = step as f64 * period;
            c.frame_length = size as f64 * period;
            c.frame_period = period;
        })?;
        out.add_field_meta(FieldMetaInfo::new("frame", size).with_data_type(DataType::Signal))?;
        self.size_frames = size;
        self.step_frames = step;
        debug!(component = %self.name, size, step, "framer configured");
        Ok(true)
    }

    fn tick(&mut self, _ctx: &mut TickContext<'_>) -> Result<TickResult, ComponentError> {
        let out = registered(&self.out, &self.name)?;
        let input = registered_mut(&mut self.input, &self.name)?;
        let mut progressed = false;
        loop {
            if !out.check_write(1) {
                break;
            }
            let Some(window) = input.read_next()? else {
                break;
            };
            let frame = Block::from_data(self.size_frames, window.into_data());
            if !write_or_stall(out, &frame)?.is_progress() {
                return Err(ComponentError::Fatal(format!(
                    "level '{}' refused a frame after reporting space",
                    out.name()
                )));
            }
            progressed = true;
        }
        Ok(if progressed {
            TickResult::Success
        } else if !out.check_write(1) {
            TickResult::DestNoSpace
        } else {
            TickResult::SourceNotAvailable
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::components::WaveSource;
    use crate::level::Index;
    use crate::pipeline::{Pipeline, PipelineConfig};

    #[test]
    fn frames_overlap_and_pad_the_tail() {
        let samples: Vec<f32> = (1..=10).map(|v| v as f32).collect();
        let mut pipeline = Pipeline::new(PipelineConfig::default());
        pipeline
            .add(WaveSource::from_samples("wave", samples, 1000).with_block_sec(0.003))
            .unwrap();
        pipeline
            .add(
                Framer::new("framer", "pcm", "frames")
                    .with_frame_size(Duration::from_millis(4))
                    .with_frame_step(Duration::from_millis(2)),
            )
            .unwrap();
        pipeline.run().unwrap();

        let frames = pipeline.level("frames").unwrap();
        assert_eq!(frames.n_elements(), 4);
        assert_eq!(frames.cur_w(), 5);
        assert!((frames.period() - 0.002).abs() < 1e-12);
        let block = frames.get_block(Index::Absolute(0), 5, None).unwrap();
        assert_eq!(block.frame(0).unwrap(), &[1.0, 2.0, 3.0, 4.0]);
        assert_eq!(block.frame(3).unwrap(), &[7.0, 8.0, 9.0, 10.0]);
        assert_eq!(block.frame(4).unwrap(), &[9.0, 10.0, 0.0, 0.0]);
    }

    #[test]
    fn step_longer_than_frame_skips_the_gap() {
        let samples: Vec<f32> = (1..=10).map(|v| v as f32).collect();
        let mut pipeline = Pipeline::new(PipelineConfig::default());
        pipeline
            .add(WaveSource::from_samples("wave", samples, 1000).with_block_sec(0.002))
            .unwrap();
        pipeline
            .add(
                Framer::new("framer", "pcm", "frames")
                    .with_frame_size(Duration::from_millis(2))
                    .with_frame_step(Duration::from_millis(3)),
            )
            .unwrap();
        pipeline.run().unwrap();

        let frames = pipeline.level("frames").unwrap();
        assert_eq!(frames.cur_w(), 4);
        let block = frames.get_block(Index::Absolute(0), 4, None).unwrap();
        assert_eq!(block.frame(0).unwrap(), &[1.0, 2.0]);
        assert_eq!(block.frame(1).unwrap(), &[4.0, 5.0]);
        assert_eq!(block.frame(2).unwrap(), &[7.0, 8.0]);
        assert_eq!(block.frame(3).unwrap(), &[10.0, 0.0]);
    }

    #[test]
    fn rejects_multi_element_input() {
        let mut pipeline = Pipeline::new(PipelineConfig::default());
        pipeline
            .add(WaveSource::from_samples("wave", vec![0.0; 8], 1000))
            .unwrap();
        pipeline.add(Framer::new("framer", "pcm", "frames")).unwrap();
        pipeline.add(Framer::new("reframer", "frames", "frames2")).unwrap();
        assert!(pipeline.build().is_err());
    }
}
