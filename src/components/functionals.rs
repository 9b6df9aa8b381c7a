//! Statistics over the whole input, emitted once at end of input.

use super::{registered, registered_mut, write_or_stall};
use crate::level::{
    Block, DataType, FieldMetaInfo, LevelConfig, LevelReader, LevelWriter, Sample,
};
use crate::pipeline::{Component, ComponentError, Registrar, TickContext, TickResult};
use tracing::{debug, info};

/// Suffixes of the statistics written per input element, in frame order.
pub const STATISTICS: [&str; 4] = ["amean", "stddev", "min", "max"];

/// Mean, population standard deviation, min and max of one column.
pub fn summarize(values: impl Iterator<Item = Sample>) -> Option<[f64; 4]> {
    let mut n = 0u64;
    let mut mean = 0.0f64;
    let mut m2 = 0.0f64;
    let mut min = f64::INFINITY;
    let mut max = f64::NEG_INFINITY;
    for v in values {
        let v = f64::from(v);
        n += 1;
        let delta = v - mean;
        mean += delta / n as f64;
        m2 += delta * (v - mean);
        min = min.min(v);
        max = max.max(v);
    }
    (n > 0).then(|| [mean, (m2 / n as f64).sqrt(), min, max])
}

/// Reads its whole input and, once everything upstream is drained, writes
/// one frame of [`STATISTICS`] per input element.
pub struct Functionals {
    name: String,
    input_level: String,
    output_level: String,
    input: Option<LevelReader>,
    out: Option<LevelWriter>,
    saw_eoi: bool,
    flush: bool,
    done: bool,
}

impl Functionals {
    pub fn new(
        name: impl Into<String>,
        input_level: impl Into<String>,
        output_level: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            input_level: input_level.into(),
            output_level: output_level.into(),
            input: None,
            out: None,
            saw_eoi: false,
            flush: false,
            done: false,
        }
    }

    fn emit(&mut self) -> Result<TickResult, ComponentError> {
        if !registered(&self.out, &self.name)?.check_write(1) {
            return Ok(TickResult::DestNoSpace);
        }
        let input = registered_mut(&mut self.input, &self.name)?;
        let Some(block) = input.read_to_end()? else {
            info!(component = %self.name, "no input, nothing to summarize");
            self.done = true;
            return Ok(TickResult::Inactive);
        };
        let n = block.n_elements();
        let mut values = Vec::with_capacity(n * STATISTICS.len());
        for element in 0..n {
            let stats = summarize(block.column(element)).unwrap_or([0.0; 4]);
            values.extend(stats.iter().map(|&v| v as Sample));
        }
        let mut frame = Block::from_data(values.len(), values);
        if let (Some(meta), Some(slot)) =
            (block.squash_time_meta(), frame.tmeta_mut().first_mut())
        {
            *slot = meta;
        }

        let out = registered(&self.out, &self.name)?;
        let result = write_or_stall(out, &frame)?;
        if result.is_progress() {
            self.done = true;
            debug!(component = %self.name, frames = block.n_frames(), "functionals written");
        }
        Ok(result)
    }
}

impl Component for Functionals {
    fn name(&self) -> &str {
        &self.name
    }

    fn register(&mut self, reg: &mut Registrar<'_>) -> Result<(), ComponentError> {
        let input = reg.reader_of(&self.input_level)?;
        input.require_full_input()?;
        self.input = Some(input);
        self.out = Some(reg.writer_of(&self.output_level, LevelConfig::default())?);
        Ok(())
    }

    fn configure(&mut self) -> Result<bool, ComponentError> {
        let input = registered(&self.input, &self.name)?;
        let Some(layout) = input.upstream_layout() else {
            return Ok(false);
        };
        let out = registered(&self.out, &self.name)?;
        for element in layout.element_names() {
            for stat in STATISTICS {
                out.add_field_meta(
                    FieldMetaInfo::new(format!("{element}_{stat}"), 1)
                        .with_data_type(DataType::Functionals),
                )?;
            }
        }
        Ok(true)
    }

    fn tick(&mut self, ctx: &mut TickContext<'_>) -> Result<TickResult, ComponentError> {
        if ctx.is_eoi() {
            self.saw_eoi = true;
        }
        if self.done {
            return Ok(TickResult::Inactive);
        }
        if self.flush {
            return self.emit();
        }
        Ok(TickResult::SourceNotAvailable)
    }

    fn notify_empty_tickloop(&mut self) -> bool {
        // An empty round during EOI means the input is complete.
        if self.saw_eoi && !self.done && !self.flush {
            self.flush = true;
            return true;
        }
        false
    }
}
