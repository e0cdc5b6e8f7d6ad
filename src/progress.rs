use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::job::{Job, Phase};

/// Position of each phase on the 0-100 overall scale.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PhaseWeights {
    pub queued: f64,
    pub transcribing: f64,
    pub translating: f64,
    pub rendering: f64,
    pub uploading: f64,
    pub done: f64,
}

impl Default for PhaseWeights {
    fn default() -> Self {
        Self {
            queued: 0.0,
            transcribing: 25.0,
            translating: 50.0,
            rendering: 75.0,
            uploading: 90.0,
            done: 100.0,
        }
    }
}

impl PhaseWeights {
    pub fn weight(&self, phase: Phase) -> f64 {
        match phase {
            Phase::Queued => self.queued,
            Phase::Transcribing => self.transcribing,
            Phase::Translating => self.translating,
            Phase::Rendering => self.rendering,
            Phase::Uploading => self.uploading,
            Phase::Done => self.done,
        }
    }

    /// Width of the band owned by `phase`: next weight minus its own.
    pub fn band(&self, phase: Phase) -> f64 {
        match phase.next() {
            Some(next) => (self.weight(next) - self.weight(phase)).max(0.0),
            None => 0.0,
        }
    }
}

/// Output of the estimator; callers decide how to apply it.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ProgressEstimate {
    pub percentage: f64,
    pub phase_progress: f64,
    pub estimated_time_remaining_ms: u64,
}

/// Stateless mapping from (phase, progress within phase) to overall progress.
#[derive(Debug, Clone, Default)]
pub struct ProgressEstimator {
    weights: PhaseWeights,
}

impl ProgressEstimator {
    pub fn new(weights: PhaseWeights) -> Self {
        Self { weights }
    }

    pub fn weights(&self) -> &PhaseWeights {
        &self.weights
    }

    /// Overall percentage for a point `phase_progress` (0-100) through `phase`.
    pub fn overall_percentage(&self, phase: Phase, phase_progress: f64) -> f64 {
        let local = phase_progress.clamp(0.0, 100.0) / 100.0;
        let overall = self.weights.weight(phase) + self.weights.band(phase) * local;
        overall.clamp(0.0, 100.0)
    }

    /// Inverse of [`overall_percentage`](Self::overall_percentage): where an
    /// overall percentage falls inside the phase's band.
    pub fn phase_progress(&self, phase: Phase, overall_percentage: f64) -> f64 {
        let band = self.weights.band(phase);
        if band <= f64::EPSILON {
            return 100.0;
        }
        ((overall_percentage - self.weights.weight(phase)) / band * 100.0).clamp(0.0, 100.0)
    }

    /// Remaining time from the job's total estimate and its age.
    pub fn estimated_time_remaining_ms(&self, job: &Job, now: DateTime<Utc>) -> u64 {
        let elapsed = (now - job.created_at).num_milliseconds().max(0) as u64;
        job.metadata.total_estimated_time_ms.saturating_sub(elapsed)
    }

    pub fn estimate(&self, job: &Job, phase: Phase, phase_progress: f64, now: DateTime<Utc>) -> ProgressEstimate {
        let percentage = self.overall_percentage(phase, phase_progress);
        ProgressEstimate {
            percentage,
            phase_progress: self.phase_progress(phase, percentage),
            estimated_time_remaining_ms: self.estimated_time_remaining_ms(job, now),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::{JobInput, ProcessingStep};

    fn approx(a: f64, b: f64) -> bool {
        (a - b).abs() < 1e-9
    }

    #[test]
    fn test_rendering_midpoint() {
        let estimator = ProgressEstimator::default();

        let overall = estimator.overall_percentage(Phase::Rendering, 50.0);
        assert!(approx(overall, 82.5));
        assert!(approx(estimator.phase_progress(Phase::Rendering, overall), 50.0));
    }

    #[test]
    fn test_band_boundaries() {
        let estimator = ProgressEstimator::default();

        assert!(approx(estimator.overall_percentage(Phase::Queued, 0.0), 0.0));
        assert!(approx(estimator.overall_percentage(Phase::Transcribing, 100.0), 50.0));
        assert!(approx(estimator.overall_percentage(Phase::Uploading, 100.0), 100.0));
        assert!(approx(estimator.overall_percentage(Phase::Done, 0.0), 100.0));
        assert!(approx(estimator.weights().band(Phase::Translating), 25.0));
        assert!(approx(estimator.weights().band(Phase::Uploading), 10.0));
    }

    #[test]
    fn test_phase_progress_clamps_outside_band() {
        let estimator = ProgressEstimator::default();

        assert!(approx(estimator.phase_progress(Phase::Translating, 10.0), 0.0));
        assert!(approx(estimator.phase_progress(Phase::Translating, 95.0), 100.0));
        assert!(approx(estimator.phase_progress(Phase::Done, 100.0), 100.0));
    }

    #[test]
    fn test_overall_is_monotonic_across_pipeline() {
        let estimator = ProgressEstimator::default();
        let mut last = 0.0;
        for phase in Phase::PIPELINE {
            for step in [0.0, 25.0, 50.0, 75.0, 100.0] {
                let overall = estimator.overall_percentage(phase, step);
                assert!(overall >= last, "{} at {} went backwards", phase, step);
                last = overall;
            }
        }
    }

    #[test]
    fn test_time_remaining_never_negative() {
        let estimator = ProgressEstimator::default();
        let job = Job::new(
            JobInput::new("clip.mp4", "de"),
            vec![ProcessingStep::new(Phase::Transcribing, 10_000)],
            None,
        );

        let soon = job.created_at + chrono::Duration::seconds(4);
        assert_eq!(estimator.estimated_time_remaining_ms(&job, soon), 6_000);

        let late = job.created_at + chrono::Duration::minutes(5);
        assert_eq!(estimator.estimated_time_remaining_ms(&job, late), 0);
    }
}
