use std::time::{Duration, Instant};

#[derive(Debug, Clone)]
pub struct ExponentialMovingAverage {
    alpha: f64,
    value: Option<f64>,
}

impl ExponentialMovingAverage {
    pub fn new(alpha: f64) -> Self {
        Self { alpha, value: None }
    }

    pub fn update(&mut self, sample: f64) -> f64 {
        let v = match self.value {
            Some(prev) => self.alpha * sample + (1.0 - self.alpha) * prev,
            None => sample,
        };
        self.value = Some(v);
        v
    }

    pub fn value(&self) -> Option<f64> {
        self.value
    }
}

/// Running statistics over optimizer steps.
#[derive(Debug)]
pub struct TrainingMetrics {
    step_timer: Instant,
    start_time: Instant,
    samples_processed: u64,
    loss_ema: ExponentialMovingAverage,
    throughput_ema: ExponentialMovingAverage,
}

impl Default for TrainingMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl TrainingMetrics {
    pub fn new() -> Self {
        let now = Instant::now();
        Self {
            step_timer: now,
            start_time: now,
            samples_processed: 0,
            loss_ema: ExponentialMovingAverage::new(0.1),
            throughput_ema: ExponentialMovingAverage::new(0.1),
        }
    }

    pub fn record_step(&mut self, samples: u64, loss: f64, accuracy: f64) -> StepSnapshot {
        let now = Instant::now();
        let step_duration = now.duration_since(self.step_timer);
        self.step_timer = now;

        self.samples_processed = self.samples_processed.saturating_add(samples);
        let step_samples_per_sec = if step_duration > Duration::ZERO {
            samples as f64 / step_duration.as_secs_f64()
        } else {
            0.0
        };

        StepSnapshot {
            loss: self.loss_ema.update(loss),
            step_loss: loss,
            accuracy,
            samples,
            samples_per_sec: self.throughput_ema.update(step_samples_per_sec),
            total_samples: self.samples_processed,
            wall_time: now.duration_since(self.start_time),
            step_duration,
        }
    }
}

#[derive(Debug, Clone)]
pub struct StepSnapshot {
    /// Smoothed loss.
    pub loss: f64,
    pub step_loss: f64,
    pub accuracy: f64,
    pub samples: u64,
    pub samples_per_sec: f64,
    pub total_samples: u64,
    pub wall_time: Duration,
    pub step_duration: Duration,
}

/// Accumulates per-batch results into sample-weighted averages.
#[derive(Debug, Default)]
pub struct EvaluationMetrics {
    loss_sum: f64,
    sample_count: u64,
    correct_samples: u64,
}

impl EvaluationMetrics {
    pub fn update(&mut self, loss: f64, samples: u64, correct: u64) {
        self.loss_sum += loss * samples as f64;
        self.sample_count += samples;
        self.correct_samples += correct;
    }

    pub fn finalize(self) -> Option<EvaluationSummary> {
        if self.sample_count == 0 {
            return None;
        }
        Some(EvaluationSummary {
            average_loss: self.loss_sum / self.sample_count as f64,
            accuracy: self.correct_samples as f64 / self.sample_count as f64,
            samples: self.sample_count,
        })
    }
}

#[derive(Debug, Clone)]
pub struct EvaluationSummary {
    pub average_loss: f64,
    pub accuracy: f64,
    pub samples: u64,
}
