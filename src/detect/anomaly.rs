use crate::detect::DetectError;
use chrono::{DateTime, Utc};

/// A time-stamped series for trend analysis. Time is kept in seconds
/// relative to the first sample.
pub struct TimeSeries {
    points: Vec<(f64, f64)>,
}

impl TimeSeries {
    pub fn new(points: Vec<(f64, f64)>) -> Self {
        Self { points }
    }

    /// Build from `(timestamp, value)` samples, which must be sorted by time.
    pub fn from_samples(samples: &[(DateTime<Utc>, f64)]) -> Self {
        let origin = samples.first().map(|(t, _)| *t);
        let points = samples
            .iter()
            .map(|(t, v)| {
                let secs = origin
                    .map(|o| (*t - o).num_milliseconds() as f64 / 1000.0)
                    .unwrap_or(0.0);
                (secs, *v)
            })
            .collect();
        Self { points }
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    pub fn last(&self) -> Option<(f64, f64)> {
        self.points.last().copied()
    }

    pub fn mean(&self) -> f64 {
        if self.points.is_empty() {
            return 0.0;
        }
        self.points.iter().map(|(_, v)| v).sum::<f64>() / self.points.len() as f64
    }

    /// Least-squares slope in value units per second.
    pub fn slope(&self) -> Result<f64, DetectError> {
        if self.points.len() < 2 {
            return Err(DetectError::InsufficientSamples {
                needed: 2,
                have: self.points.len(),
            });
        }
        let n = self.points.len() as f64;
        let mean_t = self.points.iter().map(|(t, _)| t).sum::<f64>() / n;
        let mean_v = self.mean();
        let mut num = 0.0;
        let mut den = 0.0;
        for (t, v) in &self.points {
            num += (t - mean_t) * (v - mean_v);
            den += (t - mean_t).powi(2);
        }
        if den == 0.0 {
            return Err(DetectError::DegenerateTimeline);
        }
        Ok(num / den)
    }

    /// True when every step moves in the given direction (ties allowed)
    /// and the series is not flat.
    pub fn is_monotonic(&self, increasing: bool) -> bool {
        if self.points.len() < 2 {
            return false;
        }
        let stepwise = self.points.windows(2).all(|w| {
            if increasing {
                w[1].1 >= w[0].1
            } else {
                w[1].1 <= w[0].1
            }
        });
        let first = self.points[0].1;
        let last = self.points[self.points.len() - 1].1;
        stepwise && (last - first).abs() > f64::EPSILON
    }

    /// Seconds from the last sample until the linear trend reaches `target`,
    /// or `None` if the trend moves away from it. Zero if already there.
    pub fn seconds_until(&self, target: f64) -> Result<Option<f64>, DetectError> {
        let slope = self.slope()?;
        let (_, last) = self.last().ok_or(DetectError::InsufficientSamples { needed: 2, have: 0 })?;
        let gap = target - last;
        if gap == 0.0 {
            return Ok(Some(0.0));
        }
        if slope == 0.0 || gap.signum() != slope.signum() {
            return Ok(None);
        }
        Ok(Some(gap / slope))
    }
}
