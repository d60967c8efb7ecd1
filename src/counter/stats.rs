use serde::{Deserialize, Serialize};

/// Single-pass online accumulator for count, sum, extrema and the first two
/// central moments.
///
/// Mean and second moment follow Welford's recurrence and are never
/// recomputed from the raw samples. With no samples, `min`, `max`, `mean`
/// and `m2` are NaN.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StatAccumulator {
    n: u64,
    sum: f64,
    min: f64,
    max: f64,
    m1: f64,
    m2: f64,
}

impl Default for StatAccumulator {
    fn default() -> Self {
        Self::new()
    }
}

impl StatAccumulator {
    pub const fn new() -> Self {
        Self {
            n: 0,
            sum: 0.0,
            min: f64::NAN,
            max: f64::NAN,
            m1: f64::NAN,
            m2: f64::NAN,
        }
    }

    /// Builds an accumulator from already-computed moments, as reported by
    /// a remote source.
    pub fn from_parts(n: u64, sum: f64, min: f64, max: f64, mean: f64, m2: f64) -> Self {
        if n == 0 {
            return Self::new();
        }
        Self {
            n,
            sum,
            min,
            max,
            m1: mean,
            m2,
        }
    }

    /// Adds one sample.
    pub fn add_value(&mut self, x: f64) {
        if self.n == 0 {
            self.m1 = 0.0;
            self.m2 = 0.0;
            self.min = x;
            self.max = x;
        }

        self.n += 1;
        self.sum += x;
        self.min = self.min.min(x);
        self.max = self.max.max(x);

        let delta = x - self.m1;
        self.m1 += delta / self.n as f64;
        self.m2 += delta * (x - self.m1);
    }

    /// Folds `other` into `self` so the result describes the union of both
    /// input streams.
    pub fn merge_from(&mut self, other: &StatAccumulator) {
        if other.n == 0 {
            return;
        }
        if self.n == 0 {
            *self = *other;
            return;
        }

        let n1 = self.n as f64;
        let n2 = other.n as f64;
        let n = self.n + other.n;
        let total = n as f64;
        let delta = other.m1 - self.m1;

        self.m1 += delta * n2 / total;
        self.m2 = self.m2 + other.m2 + delta * delta * n1 * n2 / total;
        self.n = n;
        self.sum += other.sum;
        self.min = self.min.min(other.min);
        self.max = self.max.max(other.max);
    }

    /// Returns the merge of `self` and `other` without modifying either.
    pub fn merge(&self, other: &StatAccumulator) -> StatAccumulator {
        let mut merged = *self;
        merged.merge_from(other);
        merged
    }

    /// The same samples multiplied by `factor`. Used to move a summary
    /// between units of one dimension.
    pub fn scaled(&self, factor: f64) -> StatAccumulator {
        StatAccumulator {
            n: self.n,
            sum: self.sum * factor,
            min: self.min * factor,
            max: self.max * factor,
            m1: self.m1 * factor,
            m2: self.m2 * factor * factor,
        }
    }

    pub fn clear(&mut self) {
        *self = Self::new();
    }

    pub fn hits(&self) -> u64 {
        self.n
    }

    pub fn sum(&self) -> f64 {
        self.sum
    }

    pub fn min(&self) -> f64 {
        self.min
    }

    pub fn max(&self) -> f64 {
        self.max
    }

    pub fn mean(&self) -> f64 {
        self.m1
    }

    /// Second central moment (sum of squared deviations from the mean).
    pub fn m2(&self) -> f64 {
        self.m2
    }

    /// Sample variance: NaN without samples, 0 for a single sample.
    pub fn variance(&self) -> f64 {
        match self.n {
            0 => f64::NAN,
            1 => 0.0,
            n => self.m2 / (n - 1) as f64,
        }
    }

    pub fn stddev(&self) -> f64 {
        self.variance().sqrt()
    }

    pub fn summary(&self) -> StatSummary {
        StatSummary {
            hits: self.n,
            sum: self.sum,
            min: self.min,
            max: self.max,
            mean: self.m1,
            variance: self.variance(),
            m2: self.m2,
        }
    }
}

/// Wire form of a [`StatAccumulator`]. NaN fields travel as JSON `null`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct StatSummary {
    #[serde(default)]
    pub hits: u64,
    #[serde(default, with = "nullable_f64")]
    pub sum: f64,
    #[serde(default = "nan", with = "nullable_f64")]
    pub min: f64,
    #[serde(default = "nan", with = "nullable_f64")]
    pub max: f64,
    #[serde(default = "nan", with = "nullable_f64")]
    pub mean: f64,
    #[serde(default = "nan", with = "nullable_f64")]
    pub variance: f64,
    #[serde(default = "nan", with = "nullable_f64")]
    pub m2: f64,
}

impl From<StatSummary> for StatAccumulator {
    fn from(s: StatSummary) -> Self {
        StatAccumulator::from_parts(s.hits, s.sum, s.min, s.max, s.mean, s.m2)
    }
}

fn nan() -> f64 {
    f64::NAN
}

mod nullable_f64 {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &f64, serializer: S) -> Result<S::Ok, S::Error> {
        if value.is_finite() {
            serializer.serialize_f64(*value)
        } else {
            serializer.serialize_none()
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<f64, D::Error> {
        Ok(Option::<f64>::deserialize(deserializer)?.unwrap_or(f64::NAN))
    }
}
