//! End-to-end runs of the demo chain: WAV file or live feed in, CSV out.

use levelflow::components::{
    CsvSink, Energy, Framer, Functionals, LiveSource, NullSink, TurnDetector, TurnEvent,
    WaveSource,
};
use levelflow::pipeline::{
    Component, ComponentError, Message, Pipeline, PipelineConfig, RunOutcome, TickContext,
    TickResult,
};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;
use tempfile::TempDir;

const RATE: u32 = 16_000;

/// Silence, a 440 Hz tone at half scale, silence; 0.3 s + 0.4 s + 0.3 s.
fn write_test_wav(dir: &TempDir) -> std::path::PathBuf {
    let path = dir.path().join("speech.wav");
    let spec = hound::WavSpec {
        channels: 1,
        sample_rate: RATE,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };
    let mut writer = hound::WavWriter::create(&path, spec).unwrap();
    for i in 0..RATE {
        let t = f64::from(i) / f64::from(RATE);
        let value = if (0.3..0.7).contains(&t) {
            0.5 * (2.0 * std::f64::consts::PI * 440.0 * t).sin()
        } else {
            0.0
        };
        writer.write_sample((value * 32767.0) as i16).unwrap();
    }
    writer.finalize().unwrap();
    path
}

/// Records turn messages sent to it.
struct TurnLog {
    events: Arc<Mutex<Vec<TurnEvent>>>,
}

impl Component for TurnLog {
    fn name(&self) -> &str {
        "turn_log"
    }

    fn tick(&mut self, _ctx: &mut TickContext<'_>) -> Result<TickResult, ComponentError> {
        Ok(TickResult::Inactive)
    }

    fn handle_message(&mut self, msg: &Message<'_>) -> bool {
        match TurnEvent::from_message(msg) {
            Some(event) => {
                self.events.lock().unwrap().push(event);
                true
            }
            None => false,
        }
    }
}

#[test]
fn wav_file_drains_through_the_whole_chain() {
    let dir = TempDir::new().unwrap();
    let wav = write_test_wav(&dir);
    let energy_csv = dir.path().join("energy.csv");
    let functionals_csv = dir.path().join("functionals.csv");
    let events = Arc::new(Mutex::new(Vec::new()));

    let mut pipeline = Pipeline::new(PipelineConfig::default());
    pipeline.add(WaveSource::open("wave", &wav).unwrap()).unwrap();
    pipeline
        .add(
            Framer::new("framer", "pcm", "frames")
                .with_frame_size(Duration::from_millis(25))
                .with_frame_step(Duration::from_millis(10)),
        )
        .unwrap();
    pipeline
        .add(Energy::new("energy", "frames", "energy"))
        .unwrap();
    pipeline
        .add(
            TurnDetector::new("turn", "energy")
                .with_recipient("turn_log")
                .with_recipient("energy_csv"),
        )
        .unwrap();
    pipeline
        .add(TurnLog {
            events: events.clone(),
        })
        .unwrap();
    pipeline
        .add(
            CsvSink::to_path("energy_csv", "energy", &energy_csv)
                .unwrap()
                .with_turn_column(),
        )
        .unwrap();
    pipeline
        .add(Functionals::new("functionals", "energy", "functionals"))
        .unwrap();
    pipeline
        .add(CsvSink::to_path("functionals_csv", "functionals", &functionals_csv).unwrap())
        .unwrap();

    let summary = pipeline.run().unwrap();
    assert_eq!(summary.outcome, RunOutcome::Drained);
    assert_eq!(summary.eoi_passes, 1);

    let energy_frames = summary
        .levels
        .iter()
        .find(|l| l.name == "energy")
        .unwrap()
        .cur_w;
    assert_eq!(energy_frames, 100);

    let rows = std::fs::read_to_string(&energy_csv).unwrap();
    let rows: Vec<&str> = rows.lines().collect();
    assert_eq!(
        rows[0],
        "frameIndex;frameTime;pcm_RMSenergy;pcm_LOGenergy;turn"
    );
    assert_eq!(rows.len(), 101);
    assert!(rows.iter().skip(1).any(|r| r.ends_with(";1")));

    let events = events.lock().unwrap();
    assert_eq!(events.len(), 2, "one turn expected, got {events:?}");
    assert!(matches!(events[0], TurnEvent::Start { .. }));
    assert!(matches!(events[1], TurnEvent::End { .. }));
    let start = events[0].vidx();
    assert!((25..=45).contains(&start), "turn started at frame {start}");
    assert!(events[1].vidx() > start);

    let functionals = std::fs::read_to_string(&functionals_csv).unwrap();
    let lines: Vec<&str> = functionals.lines().collect();
    assert_eq!(lines.len(), 2);
    assert!(lines[0].contains("pcm_RMSenergy_amean"));
    assert!(lines[0].contains("pcm_LOGenergy_max"));
    let values: Vec<f64> = lines[1]
        .split(';')
        .skip(2)
        .map(|v| v.parse().unwrap())
        .collect();
    // RMS: mean, stddev, min, max.
    assert!(values[0] > 0.05 && values[0] < 0.3);
    assert_eq!(values[2], 0.0);
    assert!((values[3] - 0.5 / 2f64.sqrt()).abs() < 0.01);
}

#[test]
fn live_feed_keeps_the_pipeline_running_until_closed() {
    let (source, feed) = LiveSource::new("live", 1_000, 4);
    let mut pipeline = Pipeline::new(PipelineConfig::default());
    pipeline.add(source.with_block(64)).unwrap();
    pipeline.add(NullSink::new("null", "pcm")).unwrap();
    let handle = pipeline.spawn().unwrap();

    let producer = thread::spawn(move || {
        for _ in 0..20 {
            assert!(feed.push_blocking(vec![0.1; 50]));
            thread::sleep(Duration::from_millis(5));
        }
    });
    producer.join().unwrap();

    let summary = handle.join().unwrap();
    assert_eq!(summary.outcome, RunOutcome::Drained);
    let pcm = summary.levels.iter().find(|l| l.name == "pcm").unwrap();
    assert_eq!(pcm.cur_w, 1_000);
    assert_eq!(pcm.readers, vec![1_000]);
}

#[test]
fn tick_limit_stops_a_live_pipeline() {
    let (source, feed) = LiveSource::new("live", 1_000, 4);
    let config = PipelineConfig {
        max_ticks: 5,
        external_wait: Duration::from_millis(1),
        ..PipelineConfig::default()
    };
    let mut pipeline = Pipeline::new(config);
    pipeline
        .add(source.with_poll_interval(Duration::from_millis(1)))
        .unwrap();
    pipeline.add(NullSink::new("null", "pcm")).unwrap();

    let summary = pipeline.run().unwrap();
    assert_eq!(summary.outcome, RunOutcome::TickLimit);
    assert_eq!(summary.rounds, 5);
    drop(feed);
}
