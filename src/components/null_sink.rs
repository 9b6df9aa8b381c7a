//! Reader that discards everything, for benchmarks and for keeping a level
//! drained.

use super::registered_mut;
use crate::pipeline::{Component, ComponentError, Registrar, TickContext, TickResult};

pub struct NullSink {
    name: String,
    input_level: String,
    block: usize,
    input: Option<crate::level::LevelReader>,
    frames: u64,
}

impl NullSink {
    pub fn new(name: impl Into<String>, input_level: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            input_level: input_level.into(),
            block: 1,
            input: None,
            frames: 0,
        }
    }

    /// Frames consumed per read.
    pub fn with_block(mut self, frames: usize) -> Self {
        self.block = frames.max(1);
        self
    }

    /// Read positions consumed so far.
    pub fn frames(&self) -> u64 {
        self.frames
    }
}

impl Component for NullSink {
    fn name(&self) -> &str {
        &self.name
    }

    fn register(&mut self, reg: &mut Registrar<'_>) -> Result<(), ComponentError> {
        let mut input = reg.reader_of(&self.input_level)?;
        input.set_block(self.block, self.block)?;
        self.input = Some(input);
        Ok(())
    }

    fn tick(&mut self, _ctx: &mut TickContext<'_>) -> Result<TickResult, ComponentError> {
        let input = registered_mut(&mut self.input, &self.name)?;
        let before = input.cursor()?;
        while input.read_next()?.is_some() {}
        let consumed = input.cursor()?.saturating_sub(before);
        self.frames += consumed;
        Ok(if consumed > 0 {
            TickResult::Success
        } else {
            TickResult::SourceNotAvailable
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::components::WaveSource;
    use crate::pipeline::{Pipeline, PipelineConfig};

    #[test]
    fn drains_its_input() {
        let mut pipeline = Pipeline::new(PipelineConfig::default());
        pipeline
            .add(WaveSource::from_samples("wave", vec![0.25; 4000], 8000))
            .unwrap();
        pipeline.add(NullSink::new("null", "pcm").with_block(64)).unwrap();
        let summary = pipeline.run().unwrap();

        let stats = summary.levels.iter().find(|s| s.name == "pcm").unwrap();
        assert_eq!(stats.cur_w, 4000);
    }
}
