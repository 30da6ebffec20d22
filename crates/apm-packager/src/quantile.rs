// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Streaming percentile estimation with the extended P² algorithm.
//!
//! For `m` target probabilities the estimator keeps `2m + 3` markers: the
//! minimum, the maximum, each target and the midpoints between neighbouring
//! targets. Each new observation shifts marker positions and adjusts heights
//! with a piecewise-parabolic prediction, so memory stays constant and no raw
//! sample is retained once the markers are seeded.
//!
//! Reference: R. Jain and I. Chlamtac, "The P² algorithm for dynamic
//! calculation of quantiles and histograms without storing observations",
//! CACM 28(10), 1985; multi-quantile extension by K. Raatikainen, 1987.

use tracing::debug;

#[derive(Debug, Clone, PartialEq)]
pub struct QuantileP2 {
    /// Target probabilities in (0, 1), ascending.
    probabilities: Vec<f64>,
    /// Marker heights.
    heights: Vec<f64>,
    /// Actual marker positions (1-based).
    positions: Vec<f64>,
    /// Desired marker positions.
    desired: Vec<f64>,
    /// Desired position increment per observation.
    increments: Vec<f64>,
    count: u64,
}

impl QuantileP2 {
    /// Builds an estimator for percentiles given in (0, 100), ascending.
    /// Callers validate the list through [`crate::config::Settings::validate`].
    pub fn new(percentiles: &[f64]) -> Self {
        let probabilities: Vec<f64> = percentiles.iter().map(|p| p / 100.0).collect();

        let mut increments = Vec::with_capacity(2 * probabilities.len() + 3);
        increments.push(0.0);
        let mut previous = 0.0;
        for p in &probabilities {
            increments.push((previous + p) / 2.0);
            increments.push(*p);
            previous = *p;
        }
        increments.push((previous + 1.0) / 2.0);
        increments.push(1.0);

        let markers = increments.len();
        QuantileP2 {
            probabilities,
            heights: Vec::with_capacity(markers),
            positions: (1..=markers).map(|i| i as f64).collect(),
            desired: increments
                .iter()
                .map(|dn| 1.0 + (markers as f64 - 1.0) * dn)
                .collect(),
            increments,
            count: 0,
        }
    }

    #[must_use]
    pub fn count(&self) -> u64 {
        self.count
    }

    fn marker_count(&self) -> usize {
        self.increments.len()
    }

    fn is_seeding(&self) -> bool {
        self.heights.len() < self.marker_count()
    }

    /// Adds one observation. Non-finite values are ignored.
    pub fn add(&mut self, value: f64) {
        if !value.is_finite() {
            debug!("Ignoring non-finite quantile sample {}", value);
            return;
        }
        self.count += 1;
        let markers = self.marker_count();

        // Cold start: collect the first observations, sorted, as seed heights.
        if self.heights.len() < markers {
            let at = self.heights.partition_point(|h| *h <= value);
            self.heights.insert(at, value);
            return;
        }

        let last = markers - 1;
        let cell = if value < self.heights[0] {
            self.heights[0] = value;
            0
        } else if value >= self.heights[last] {
            self.heights[last] = value;
            last - 1
        } else {
            // heights[0] <= value < heights[last]
            self.heights.partition_point(|h| *h <= value) - 1
        };

        for position in &mut self.positions[cell + 1..] {
            *position += 1.0;
        }
        for (desired, increment) in self.desired.iter_mut().zip(&self.increments) {
            *desired += increment;
        }

        for i in 1..last {
            let offset = self.desired[i] - self.positions[i];
            let room_above = self.positions[i + 1] - self.positions[i];
            let room_below = self.positions[i - 1] - self.positions[i];
            if (offset >= 1.0 && room_above > 1.0) || (offset <= -1.0 && room_below < -1.0) {
                let step = offset.signum();
                let candidate = self.parabolic(i, step);
                self.heights[i] = if self.heights[i - 1] < candidate && candidate < self.heights[i + 1]
                {
                    candidate
                } else {
                    self.linear(i, step)
                };
                self.positions[i] += step;
            }
        }
    }

    fn parabolic(&self, i: usize, step: f64) -> f64 {
        let (q, n) = (&self.heights, &self.positions);
        q[i] + step / (n[i + 1] - n[i - 1])
            * ((n[i] - n[i - 1] + step) * (q[i + 1] - q[i]) / (n[i + 1] - n[i])
                + (n[i + 1] - n[i] - step) * (q[i] - q[i - 1]) / (n[i] - n[i - 1]))
    }

    fn linear(&self, i: usize, step: f64) -> f64 {
        let neighbour = if step > 0.0 { i + 1 } else { i - 1 };
        let (q, n) = (&self.heights, &self.positions);
        q[i] + step * (q[neighbour] - q[i]) / (n[neighbour] - n[i])
    }

    /// Folds `other` into this estimator. Observations still held for seeding
    /// are replayed one by one; two seeded estimators are combined through
    /// their piecewise-linear distributions. The total count is kept.
    pub fn merge(&mut self, mut other: QuantileP2) {
        if self.probabilities != other.probabilities {
            debug!(
                "Dropping {} quantile samples estimated for other percentiles",
                other.count
            );
            return;
        }
        if self.is_seeding() && !other.is_seeding() {
            std::mem::swap(self, &mut other);
        }
        if other.is_seeding() {
            for value in other.heights {
                self.add(value);
            }
            return;
        }
        self.merge_seeded(&other);
    }

    fn merge_seeded(&mut self, other: &QuantileP2) {
        let total = self.count + other.count;
        let n = total as f64;

        let mut breakpoints: Vec<f64> = self
            .heights
            .iter()
            .chain(&other.heights)
            .copied()
            .collect();
        breakpoints.sort_by(f64::total_cmp);
        breakpoints.dedup();
        let ranks: Vec<f64> = breakpoints
            .iter()
            .map(|x| self.rank(*x) + other.rank(*x))
            .collect();

        let last = self.marker_count() - 1;
        let mut positions: Vec<f64> = Vec::with_capacity(last + 1);
        for (i, increment) in self.increments.iter().enumerate() {
            let desired = 1.0 + (n - 1.0) * increment;
            let floor = positions.last().map_or(1.0, |p| p + 1.0);
            let ceiling = n - (last - i) as f64;
            positions.push(desired.round().max(floor).min(ceiling));
        }

        self.heights = positions
            .iter()
            .map(|p| value_at_rank(&breakpoints, &ranks, *p))
            .collect();
        self.desired = self
            .increments
            .iter()
            .map(|increment| 1.0 + (n - 1.0) * increment)
            .collect();
        self.positions = positions;
        self.count = total;
    }

    /// Approximate number of observations at or below `x`.
    fn rank(&self, x: f64) -> f64 {
        let at = self.heights.partition_point(|h| *h <= x);
        if at == 0 {
            return 0.0;
        }
        let i = at - 1;
        if i == self.heights.len() - 1 {
            return self.positions[i];
        }
        // heights[i] <= x < heights[i + 1]
        let (q0, q1) = (self.heights[i], self.heights[i + 1]);
        let (n0, n1) = (self.positions[i], self.positions[i + 1]);
        n0 + (x - q0) / (q1 - q0) * (n1 - n0)
    }

    /// Current estimate for each configured percentile, in configuration
    /// order. Empty until the first observation.
    #[must_use]
    pub fn markers(&self) -> Vec<f64> {
        if self.heights.is_empty() {
            return Vec::new();
        }
        if self.heights.len() < self.marker_count() {
            // Still seeding: nearest rank over the retained observations.
            let last = (self.heights.len() - 1) as f64;
            return self
                .probabilities
                .iter()
                .map(|p| self.heights[(p * last).round() as usize])
                .collect();
        }
        (0..self.probabilities.len())
            .map(|j| self.heights[2 * j + 2])
            .collect()
    }
}

/// Inverse of the combined rank function; `ranks` is non-decreasing.
fn value_at_rank(breakpoints: &[f64], ranks: &[f64], rank: f64) -> f64 {
    let k = ranks.partition_point(|r| *r < rank);
    if k == 0 {
        return breakpoints[0];
    }
    if k == ranks.len() {
        return breakpoints[k - 1];
    }
    let (r0, r1) = (ranks[k - 1], ranks[k]);
    let (x0, x1) = (breakpoints[k - 1], breakpoints[k]);
    x0 + (rank - r0) / (r1 - r0) * (x1 - x0)
}
