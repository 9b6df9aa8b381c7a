//! Per-frame RMS and log energy.

use super::{registered, registered_mut, write_or_stall};
use crate::defaults;
use crate::level::{
    Block, DataType, FieldMetaInfo, LevelConfig, LevelReader, LevelWriter, Sample,
};
use crate::pipeline::{Component, ComponentError, Registrar, TickContext, TickResult};

/// Root mean square of `frame`.
pub fn rms(frame: &[Sample]) -> f64 {
    mean_square(frame).sqrt()
}

/// Natural log of the mean square, floored at `floor`.
pub fn log_energy(frame: &[Sample], floor: f64) -> f64 {
    mean_square(frame).max(floor).ln()
}

fn mean_square(frame: &[Sample]) -> f64 {
    if frame.is_empty() {
        return 0.0;
    }
    frame.iter().map(|&x| f64::from(x) * f64::from(x)).sum::<f64>() / frame.len() as f64
}

/// Writes `pcm_RMSenergy` and/or `pcm_LOGenergy` for every input frame.
pub struct Energy {
    name: String,
    input_level: String,
    output_level: String,
    rms: bool,
    log: bool,
    log_floor: f64,
    input: Option<LevelReader>,
    out: Option<LevelWriter>,
}

impl Energy {
    pub fn new(
        name: impl Into<String>,
        input_level: impl Into<String>,
        output_level: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            input_level: input_level.into(),
            output_level: output_level.into(),
            rms: true,
            log: true,
            log_floor: defaults::LOG_ENERGY_FLOOR,
            input: None,
            out: None,
        }
    }

    pub fn with_rms(mut self, enabled: bool) -> Self {
        self.rms = enabled;
        self
    }

    pub fn with_log(mut self, enabled: bool) -> Self {
        self.log = enabled;
        self
    }

    pub fn with_log_floor(mut self, floor: f64) -> Self {
        self.log_floor = floor;
        self
    }

    fn compute(&self, frame: &[Sample]) -> Vec<Sample> {
        let mut values = Vec::with_capacity(2);
        if self.rms {
            values.push(rms(frame) as Sample);
        }
        if self.log {
            values.push(log_energy(frame, self.log_floor) as Sample);
        }
        values
    }
}

impl Component for Energy {
    fn name(&self) -> &str {
        &self.name
    }

    fn register(&mut self, reg: &mut Registrar<'_>) -> Result<(), ComponentError> {
        if !self.rms && !self.log {
            return Err(ComponentError::Fatal(format!(
                "{}: both RMS and log energy are disabled",
                self.name
            )));
        }
        self.input = Some(reg.reader_of(&self.input_level)?);
        self.out = Some(reg.writer_of(&self.output_level, LevelConfig::default())?);
        Ok(())
    }

    fn configure(&mut self) -> Result<bool, ComponentError> {
        let input = registered(&self.input, &self.name)?;
        if input.upstream_layout().is_none() {
            return Ok(false);
        }
        let upstream = input.level().config()?;
        let out = registered(&self.out, &self.name)?;
        out.update_config(|c| {
            c.period = upstream.period;
            c.frame_length = upstream.frame_length;
            c.frame_period = upstream.frame_period;
        })?;
        if self.rms {
            out.add_field_meta(
                FieldMetaInfo::new("pcm_RMSenergy", 1).with_data_type(DataType::MixedLld),
            )?;
        }
        if self.log {
            out.add_field_meta(
                FieldMetaInfo::new("pcm_LOGenergy", 1).with_data_type(DataType::MixedLld),
            )?;
        }
        Ok(true)
    }

    fn tick(&mut self, _ctx: &mut TickContext<'_>) -> Result<TickResult, ComponentError> {
        let mut progressed = false;
        loop {
            let out = registered(&self.out, &self.name)?;
            if !out.check_write(1) {
                break;
            }
            let Some(frame) = registered_mut(&mut self.input, &self.name)?.read_next()? else {
                break;
            };
            let values = self.compute(frame.data());
            let out = registered(&self.out, &self.name)?;
            if !write_or_stall(out, &Block::from_data(values.len(), values))?.is_progress() {
                return Err(ComponentError::Fatal(format!(
                    "level '{}' refused a frame after reporting space",
                    out.name()
                )));
            }
            progressed = true;
        }
        let out = registered(&self.out, &self.name)?;
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

    #[test]
    fn rms_of_constant_frame() {
        assert!((rms(&[0.5, -0.5, 0.5, -0.5]) - 0.5).abs() < 1e-9);
        assert_eq!(rms(&[]), 0.0);
    }

    #[test]
    fn log_energy_is_floored() {
        let floored = log_energy(&[0.0; 16], defaults::LOG_ENERGY_FLOOR);
        assert!((floored - (-27.631021)).abs() < 1e-5);
        assert!((log_energy(&[1.0, -1.0], 1e-12)).abs() < 1e-12);
    }

    #[test]
    fn compute_respects_enabled_fields() {
        let energy = Energy::new("e", "frames", "energy").with_log(false);
        assert_eq!(energy.compute(&[1.0, 1.0]), vec![1.0]);
        let energy = Energy::new("e", "frames", "energy");
        assert_eq!(energy.compute(&[1.0, 1.0]).len(), 2);
    }
}
