//! Axis-aligned regions of coordinate space.

use std::fmt::{self, Display};

use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

use crate::error::ConfigurationError;

/// A half-open interval `[min, max)` along one dimension.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct Interval {
    pub min: f64,
    pub max: f64,
}

impl Interval {
    pub fn width(&self) -> f64 {
        self.max - self.min
    }

    /// The `k`th of `fan_out + 1` equally spaced boundaries.  The last
    /// boundary is exactly `max`, so sibling intervals tile their parent with
    /// no gap.
    fn boundary(&self, k: usize, fan_out: usize) -> f64 {
        if k == fan_out {
            self.max
        } else {
            self.min + self.width() * (k as f64 / fan_out as f64)
        }
    }

    /// Returns the slot, in `0..fan_out`, that `x` falls in.  Agrees exactly
    /// with the bounds produced by [`Interval::slice`].
    fn slot(&self, x: f64, fan_out: usize) -> usize {
        let guess = ((x - self.min) / self.width() * fan_out as f64).floor();
        let mut k = if guess.is_nan() || guess < 0.0 {
            0
        } else {
            (guess as usize).min(fan_out - 1)
        };
        while k > 0 && x < self.boundary(k, fan_out) {
            k -= 1;
        }
        while k + 1 < fan_out && x >= self.boundary(k + 1, fan_out) {
            k += 1;
        }
        k
    }

    fn slice(&self, k: usize, fan_out: usize) -> Interval {
        Interval {
            min: self.boundary(k, fan_out),
            max: self.boundary(k + 1, fan_out),
        }
    }
}

/// The region of space covered by a box: one [`Interval`] per dimension.
///
/// A point lies inside the extents when `min <= x < max` in every
/// dimension.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Extents(SmallVec<[Interval; 4]>);

impl Extents {
    /// Builds extents from `(min, max)` pairs.  Every bound must be finite and
    /// every interval non-empty.
    pub fn new<I>(bounds: I) -> Result<Self, ConfigurationError>
    where
        I: IntoIterator<Item = (f64, f64)>,
    {
        let intervals: SmallVec<[Interval; 4]> = bounds
            .into_iter()
            .map(|(min, max)| Interval { min, max })
            .collect();
        if intervals.is_empty() {
            return Err(ConfigurationError::InvalidExtents(
                "at least one dimension is required".into(),
            ));
        }
        for (d, interval) in intervals.iter().enumerate() {
            if !(interval.max - interval.min).is_finite() || interval.min >= interval.max {
                return Err(ConfigurationError::InvalidExtents(format!(
                    "dimension {d} has bounds [{}, {})",
                    interval.min, interval.max
                )));
            }
        }
        Ok(Self(intervals))
    }

    /// A cube spanning `[min, max)` in each of `dimensions` dimensions.
    pub fn cube(dimensions: usize, min: f64, max: f64) -> Result<Self, ConfigurationError> {
        Self::new((0..dimensions).map(|_| (min, max)))
    }

    pub fn dimensions(&self) -> usize {
        self.0.len()
    }

    pub fn intervals(&self) -> &[Interval] {
        &self.0
    }

    pub fn contains(&self, coordinates: &[f64]) -> bool {
        coordinates.len() == self.0.len()
            && self
                .0
                .iter()
                .zip(coordinates)
                .all(|(interval, &x)| interval.min <= x && x < interval.max)
    }

    /// Whether the two regions share any volume.
    pub fn intersects(&self, other: &Extents) -> bool {
        self.0.len() == other.0.len()
            && self
                .0
                .iter()
                .zip(other.0.iter())
                .all(|(a, b)| a.min < b.max && b.min < a.max)
    }

    /// Whether `other` lies entirely within `self`.
    pub fn contains_extents(&self, other: &Extents) -> bool {
        self.0.len() == other.0.len()
            && self
                .0
                .iter()
                .zip(other.0.iter())
                .all(|(a, b)| a.min <= b.min && b.max <= a.max)
    }

    pub fn volume(&self) -> f64 {
        self.0.iter().map(Interval::width).product()
    }

    /// Index of the child (out of `fan_out^dimensions`) whose region holds
    /// `coordinates`.  Children are numbered in row-major order with
    /// dimension 0 varying fastest.
    pub fn child_index(&self, coordinates: &[f64], fan_out: usize) -> usize {
        let mut index = 0;
        let mut stride = 1;
        for (interval, &x) in self.0.iter().zip(coordinates) {
            index += interval.slot(x, fan_out) * stride;
            stride *= fan_out;
        }
        index
    }

    /// Region of the child numbered `index`; see [`Extents::child_index`].
    pub fn child_extents(&self, mut index: usize, fan_out: usize) -> Extents {
        let mut intervals = SmallVec::with_capacity(self.0.len());
        for interval in &self.0 {
            intervals.push(interval.slice(index % fan_out, fan_out));
            index /= fan_out;
        }
        Extents(intervals)
    }

    /// Divides the region into `fan_out^dimensions` equal cells, in
    /// [`Extents::child_index`] order.
    pub fn partition(&self, fan_out: usize) -> Vec<Extents> {
        let count = fan_out.pow(self.0.len() as u32);
        (0..count).map(|i| self.child_extents(i, fan_out)).collect()
    }
}

impl Display for Extents {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (d, interval) in self.0.iter().enumerate() {
            if d > 0 {
                write!(f, " x ")?;
            }
            write!(f, "[{}, {})", interval.min, interval.max)?;
        }
        Ok(())
    }
}
