//! Stub conversion models

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use voxshift_worker::model::VoiceModel;
use voxshift_worker::WorkerError;

/// Returns a fixed-length silence buffer after sleeping, recording every
/// execution interval.
pub struct SilenceModel {
    delay: Duration,
    output_len: usize,
    intervals: Mutex<Vec<(Instant, Instant)>>,
    calls: AtomicUsize,
    gauge: Option<Arc<AtomicUsize>>,
    readings: Mutex<Vec<(usize, usize)>>,
}

impl SilenceModel {
    pub fn new(delay: Duration, output_len: usize) -> Arc<Self> {
        Self::build(delay, output_len, None)
    }

    /// Also reads `gauge` when each call starts and when it ends
    pub fn observing(delay: Duration, output_len: usize, gauge: Arc<AtomicUsize>) -> Arc<Self> {
        Self::build(delay, output_len, Some(gauge))
    }

    fn build(delay: Duration, output_len: usize, gauge: Option<Arc<AtomicUsize>>) -> Arc<Self> {
        Arc::new(Self {
            delay,
            output_len,
            intervals: Mutex::new(Vec::new()),
            calls: AtomicUsize::new(0),
            gauge,
            readings: Mutex::new(Vec::new()),
        })
    }

    /// Gauge values at the start and end of each call, in call order
    pub fn readings(&self) -> Vec<(usize, usize)> {
        self.readings.lock().unwrap().clone()
    }

    fn read_gauge(&self) -> usize {
        self.gauge
            .as_ref()
            .map_or(0, |gauge| gauge.load(Ordering::SeqCst))
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn intervals(&self) -> Vec<(Instant, Instant)> {
        self.intervals.lock().unwrap().clone()
    }

    /// Pairs of recorded executions that overlapped in time
    pub fn overlap_count(&self) -> usize {
        let mut intervals = self.intervals();
        intervals.sort_by_key(|(start, _)| *start);
        intervals
            .windows(2)
            .filter(|pair| pair[1].0 < pair[0].1)
            .count()
    }
}

impl VoiceModel for SilenceModel {
    fn convert(
        &self,
        _source: &[f32],
        _reference: &[f32],
        _sampling_steps: Option<u32>,
    ) -> Result<Vec<f32>, WorkerError> {
        let start = Instant::now();
        let at_start = self.read_gauge();
        self.calls.fetch_add(1, Ordering::SeqCst);
        std::thread::sleep(self.delay);
        let at_end = self.read_gauge();
        let end = Instant::now();
        self.intervals.lock().unwrap().push((start, end));
        self.readings.lock().unwrap().push((at_start, at_end));
        Ok(vec![0.0; self.output_len])
    }
}

/// Always fails inference
pub struct FailingModel;

impl VoiceModel for FailingModel {
    fn convert(
        &self,
        _source: &[f32],
        _reference: &[f32],
        _sampling_steps: Option<u32>,
    ) -> Result<Vec<f32>, WorkerError> {
        Err(WorkerError::Inference("CUDA out of memory".to_string()))
    }
}
