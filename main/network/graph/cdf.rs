//! Empirical cumulative distribution functions. Edge latencies and host
//! bandwidths are drawn from these.

use std::path::Path;

use anyhow::{bail, Context};
use rand::Rng;

/// A piecewise-linear CDF over nonnegative values. Points are kept sorted by
/// value with strictly nondecreasing cumulative probability ending at 1.0.
#[derive(Clone, Debug)]
pub struct Cdf {
    /// `(value, cumulative probability)` points.
    points: Vec<(f64, f64)>,
}

impl Cdf {
    /// Load from a file with one `<value>\t<cumulative-probability>` pair per
    /// line, sorted by value.
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Reading CDF file {}", path.display()))?;
        Self::parse(&text).with_context(|| format!("Parsing CDF file {}", path.display()))
    }

    pub fn parse(text: &str) -> anyhow::Result<Self> {
        let mut points = Vec::new();

        for (lineno, line) in text.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }

            let mut fields = line.split_whitespace();
            let (Some(value), Some(prob)) = (fields.next(), fields.next()) else {
                bail!("line {}: expected '<value>\\t<probability>'", lineno + 1);
            };

            let value: f64 = value
                .parse()
                .with_context(|| format!("line {}: bad value", lineno + 1))?;
            let prob: f64 = prob
                .parse()
                .with_context(|| format!("line {}: bad probability", lineno + 1))?;

            points.push((value, prob));
        }

        Self::from_points(points)
    }

    fn from_points(points: Vec<(f64, f64)>) -> anyhow::Result<Self> {
        if points.is_empty() {
            bail!("a CDF needs at least one point");
        }

        for pair in points.windows(2) {
            if pair[1].0 < pair[0].0 || pair[1].1 < pair[0].1 {
                bail!("CDF points must be sorted by value with nondecreasing probability");
            }
        }

        let last = points.last().unwrap();
        if !(0.999..=1.001).contains(&last.1) {
            bail!("a CDF must end with cumulative probability 1.0");
        }

        for (value, prob) in &points {
            if *value < 0.0 || !(0.0..=1.001).contains(prob) {
                bail!("CDF values must be nonnegative and probabilities in [0, 1]");
            }
        }

        Ok(Self { points })
    }

    /// A synthetic distribution with the given geometry: the bulk of the mass
    /// is within `base_width` of `center`, with an upper tail extending
    /// `tail_width` beyond.
    pub fn generate(center: f64, base_width: f64, tail_width: f64) -> anyhow::Result<Self> {
        if center <= 0.0 || base_width < 0.0 || tail_width < 0.0 || base_width > center {
            bail!("invalid CDF generate parameters (center {center}, base {base_width}, tail {tail_width})");
        }

        Self::from_points(vec![
            (center - base_width, 0.0),
            (center, 0.5),
            (center + base_width, 0.9),
            (center + base_width + tail_width, 1.0),
        ])
    }

    /// Draw a value from the distribution using inverse-transform sampling
    /// with linear interpolation between points.
    pub fn sample(&self, rng: &mut impl Rng) -> f64 {
        let q: f64 = rng.gen();

        let mut prev = self.points[0];
        if q <= prev.1 {
            return prev.0;
        }

        for point in &self.points[1..] {
            if q <= point.1 {
                let (v0, p0) = prev;
                let (v1, p1) = *point;
                if p1 <= p0 {
                    return v1;
                }
                return v0 + (v1 - v0) * (q - p0) / (p1 - p0);
            }
            prev = *point;
        }

        self.points.last().unwrap().0
    }

    /// The smallest value the distribution can produce.
    pub fn min_value(&self) -> f64 {
        self.points[0].0
    }

    /// The largest value the distribution can produce.
    pub fn max_value(&self) -> f64 {
        self.points.last().unwrap().0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;

    #[test]
    fn test_parse() {
        let cdf = Cdf::parse("10\t0.5\n20\t1.0\n").unwrap();
        assert_eq!(cdf.min_value(), 10.0);
        assert_eq!(cdf.max_value(), 20.0);
    }

    #[test]
    fn test_parse_rejects_unsorted() {
        assert!(Cdf::parse("20\t0.5\n10\t1.0\n").is_err());
        assert!(Cdf::parse("10\t0.9\n20\t0.5\n").is_err());
        assert!(Cdf::parse("10\t0.5\n").is_err());
        assert!(Cdf::parse("").is_err());
    }

    #[test]
    fn test_generate_bounds() {
        let cdf = Cdf::generate(50.0, 10.0, 30.0).unwrap();
        assert_eq!(cdf.min_value(), 40.0);
        assert_eq!(cdf.max_value(), 90.0);

        let mut rng = rand_xoshiro::Xoshiro256PlusPlus::seed_from_u64(1);
        for _ in 0..1000 {
            let value = cdf.sample(&mut rng);
            assert!((40.0..=90.0).contains(&value));
        }
    }

    #[test]
    fn test_fixed_distribution() {
        // a single point yields a constant
        let cdf = Cdf::parse("50\t1.0\n").unwrap();
        let mut rng = rand_xoshiro::Xoshiro256PlusPlus::seed_from_u64(2);
        for _ in 0..100 {
            assert_eq!(cdf.sample(&mut rng), 50.0);
        }
    }

    #[test]
    fn test_sampling_is_deterministic() {
        let cdf = Cdf::generate(100.0, 20.0, 50.0).unwrap();

        let sample = |seed| {
            let mut rng = rand_xoshiro::Xoshiro256PlusPlus::seed_from_u64(seed);
            (0..10).map(|_| cdf.sample(&mut rng)).collect::<Vec<_>>()
        };

        assert_eq!(sample(42), sample(42));
        assert_ne!(sample(42), sample(43));
    }
}
