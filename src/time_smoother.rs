/*
 *  Copyright (C) 2025 Michael Bachmann
 *
 *  This program is free software: you can redistribute it and/or modify
 *  it under the terms of the GNU Affero General Public License as published by
 *  the Free Software Foundation, either version 3 of the License, or
 *  (at your option) any later version.
 *
 *  This program is distributed in the hope that it will be useful,
 *  but WITHOUT ANY WARRANTY; without even the implied warranty of
 *  MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
 *  GNU Affero General Public License for more details.
 *
 *  You should have received a copy of the GNU Affero General Public License
 *  along with this program.  If not, see <https://www.gnu.org/licenses/>.
 */

//! Component E: maps wall-clock time to logical bytes written, smoothing out
//! the jitter in arrival times so the rate-retune step (section 4.F) sees a
//! stable estimate of how fast the remote sender is actually producing data.
//!
//! This is a windowed least-squares fit over `(wall_clock_us, bytes_written)`
//! samples, clamped to be monotonically non-decreasing. A full Kalman-style
//! smoother would track confidence explicitly; a short, regularly-refreshed
//! window over real-time samples gets the same practical behavior with far
//! less state.

use std::collections::VecDeque;
use tracing::debug;

/// How long a sample remains part of the fit before aging out.
const HISTORY_US: i64 = 5_000_000;

/// How far ahead an estimate is expected to be trustworthy. Not enforced as a
/// hard error; callers that query past this horizon get a linear
/// extrapolation still, but [`TimeSmoother::estimate`] logs it since the
/// estimate quality degrades the further past the newest sample it's asked
/// to reach.
pub const HORIZON_US: i64 = 2_000_000;

struct Sample {
    wall_us: i64,
    bytes: f64,
}

/// Monotone estimator of bytes-written as a function of wall-clock time.
pub struct TimeSmoother {
    samples: VecDeque<Sample>,
    last_estimate: f64,
    last_estimate_us: i64,
}

impl TimeSmoother {
    pub fn new(start_us: i64) -> Self {
        Self {
            samples: VecDeque::new(),
            last_estimate: 0.0,
            last_estimate_us: start_us,
        }
    }

    /// Records that `bytes` logical bytes had been written as of `wall_us`.
    pub fn put(&mut self, wall_us: i64, bytes: f64) {
        self.samples.push_back(Sample { wall_us, bytes });
        while let Some(front) = self.samples.front() {
            if wall_us - front.wall_us > HISTORY_US {
                self.samples.pop_front();
            } else {
                break;
            }
        }
    }

    /// Estimates bytes-written at `wall_us` via a least-squares line through
    /// the current sample window, clamped so the result never regresses
    /// below the last returned estimate.
    pub fn estimate(&mut self, wall_us: i64) -> f64 {
        if let Some(newest) = self.samples.back() {
            if wall_us - newest.wall_us > HORIZON_US {
                debug!(
                    past_newest_sample_us = wall_us - newest.wall_us,
                    "estimate queried beyond the trusted horizon"
                );
            }
        }

        let estimate = self.fit(wall_us).unwrap_or(self.last_estimate);
        let clamped = if wall_us >= self.last_estimate_us {
            estimate.max(self.last_estimate)
        } else {
            // Queries moving backward in time (shouldn't normally happen)
            // still get a monotone answer by holding at the last value.
            self.last_estimate
        };
        self.last_estimate = clamped;
        self.last_estimate_us = wall_us;
        clamped
    }

    /// Current estimated bytes-per-second slope, if enough samples exist.
    pub fn rate_bytes_per_sec(&self) -> Option<f64> {
        self.regression().map(|(slope, _)| slope * 1_000_000.0)
    }

    fn fit(&self, wall_us: i64) -> Option<f64> {
        let (slope, intercept) = self.regression()?;
        Some(slope * wall_us as f64 + intercept)
    }

    /// Ordinary least squares over the current window: `bytes = slope *
    /// wall_us + intercept`.
    fn regression(&self) -> Option<(f64, f64)> {
        let n = self.samples.len();
        if n < 2 {
            return self.samples.back().map(|s| (0.0, s.bytes - 0.0 * s.wall_us as f64));
        }

        let n_f = n as f64;
        let mut sum_x = 0.0;
        let mut sum_y = 0.0;
        let mut sum_xx = 0.0;
        let mut sum_xy = 0.0;

        for sample in &self.samples {
            let x = sample.wall_us as f64;
            let y = sample.bytes;
            sum_x += x;
            sum_y += y;
            sum_xx += x * x;
            sum_xy += x * y;
        }

        let denom = n_f * sum_xx - sum_x * sum_x;
        if denom.abs() < f64::EPSILON {
            // Degenerate: all samples share the same timestamp.
            return Some((0.0, sum_y / n_f));
        }

        let slope = (n_f * sum_xy - sum_x * sum_y) / denom;
        let intercept = (sum_y - slope * sum_x) / n_f;
        Some((slope, intercept))
    }
}
