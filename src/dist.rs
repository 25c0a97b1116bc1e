//! Fault distribution engine
//!
//! Resolves configured random-process models into live samplers that drive
//! artificial latency and bandwidth throttling. A spec that fails to
//! resolve is a configuration error surfaced at startup, never at sampling
//! time; the absence of a spec means "no fault of this kind".

use std::time::Duration;

use rand::distributions::{Distribution, Uniform};
use rand::rngs::{SmallRng, StdRng};
use rand::{Rng, SeedableRng};
use rand_distr::{
    Binomial, Cauchy, Exp, Gamma, Geometric, LogNormal, Normal, Pareto, Poisson, Triangular,
    Weibull,
};
use serde::Deserialize;
use thiserror::Error;

/// Errors raised while resolving a distribution spec into a sampler.
#[derive(Error, Debug)]
pub enum DistError {
    #[error("{family} expects {expected} parameter(s), got {got}")]
    WrongArity {
        family: &'static str,
        expected: usize,
        got: usize,
    },
    #[error("invalid parameters for {family}: {detail}")]
    BadParameters {
        family: &'static str,
        detail: String,
    },
}

/// The supported distribution families. Aliases accept the family names
/// used by the classic proxy configuration files.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
pub enum DistributionKind {
    #[serde(alias = "ContinuousUniform", alias = "uniform")]
    Uniform,
    #[default]
    #[serde(alias = "normal")]
    Normal,
    #[serde(alias = "logNormal")]
    LogNormal,
    #[serde(alias = "cauchy")]
    Cauchy,
    #[serde(alias = "exponential")]
    Exponential,
    #[serde(alias = "gamma")]
    Gamma,
    #[serde(alias = "pareto")]
    Pareto,
    #[serde(alias = "weibull")]
    Weibull,
    #[serde(alias = "triangular")]
    Triangular,
    #[serde(alias = "poisson")]
    Poisson,
    #[serde(alias = "binomial")]
    Binomial,
    #[serde(alias = "geometric")]
    Geometric,
}

/// Which random source feeds the sampler.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
pub enum RandomSourceKind {
    /// OS-entropy seeded standard generator
    #[default]
    #[serde(alias = "SystemRandomSource", alias = "system")]
    System,
    /// Small fast non-crypto generator
    #[serde(alias = "Xorshift", alias = "fast")]
    Fast,
    /// Fixed-seed standard generator for reproducible runs
    #[serde(alias = "seeded")]
    Seeded,
}

/// Configuration describing one random process.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DistributionSpec {
    #[serde(default, alias = "Distribution")]
    pub distribution: DistributionKind,
    #[serde(default, alias = "RandomSourceType")]
    pub random_source: RandomSourceKind,
    #[serde(default, alias = "DistributionParameters")]
    pub parameters: Vec<f64>,
    /// Seed for [`RandomSourceKind::Seeded`]
    #[serde(default)]
    pub seed: u64,
}

enum SourceRng {
    Std(StdRng),
    Small(SmallRng),
}

impl SourceRng {
    fn sample<D: Distribution<f64>>(&mut self, dist: &D) -> f64 {
        match self {
            SourceRng::Std(rng) => rng.sample(dist),
            SourceRng::Small(rng) => rng.sample(dist),
        }
    }

    fn sample_u64<D: Distribution<u64>>(&mut self, dist: &D) -> u64 {
        match self {
            SourceRng::Std(rng) => rng.sample(dist),
            SourceRng::Small(rng) => rng.sample(dist),
        }
    }
}

enum Family {
    Uniform(Uniform<f64>),
    Normal(Normal<f64>),
    LogNormal(LogNormal<f64>),
    Cauchy(Cauchy<f64>),
    Exponential(Exp<f64>),
    Gamma(Gamma<f64>),
    Pareto(Pareto<f64>),
    Weibull(Weibull<f64>),
    Triangular(Triangular<f64>),
    Poisson(Poisson<f64>),
    Binomial(Binomial),
    Geometric(Geometric),
}

/// A live sampler resolved from a [`DistributionSpec`]. Owned by one
/// plugin instance; the random source carries the only mutable state.
pub struct Sampler {
    family: Family,
    rng: SourceRng,
}

impl std::fmt::Debug for Sampler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Sampler").finish_non_exhaustive()
    }
}

fn params<const N: usize>(family: &'static str, given: &[f64]) -> Result<[f64; N], DistError> {
    <[f64; N]>::try_from(given).map_err(|_| DistError::WrongArity {
        family,
        expected: N,
        got: given.len(),
    })
}

fn bad(family: &'static str, err: impl std::fmt::Debug) -> DistError {
    DistError::BadParameters {
        family,
        detail: format!("{err:?}"),
    }
}

impl Sampler {
    /// Resolve a spec into a sampler. `None` resolves to no sampler, which
    /// all call sites must treat as zero delay / unlimited bandwidth.
    pub fn resolve(spec: Option<&DistributionSpec>) -> Result<Option<Sampler>, DistError> {
        let spec = match spec {
            Some(s) => s,
            None => return Ok(None),
        };

        let p = spec.parameters.as_slice();
        let family = match spec.distribution {
            DistributionKind::Uniform => {
                let [low, high] = params::<2>("Uniform", p)?;
                if !(low < high) {
                    return Err(bad("Uniform", "low must be < high"));
                }
                Family::Uniform(Uniform::new(low, high))
            }
            DistributionKind::Normal => {
                let [mean, std_dev] = params::<2>("Normal", p)?;
                // rand_distr accepts a negative std-dev and mirrors the
                // distribution; here it is a configuration mistake
                if !(std_dev >= 0.0) {
                    return Err(bad("Normal", "std_dev must be >= 0"));
                }
                Family::Normal(Normal::new(mean, std_dev).map_err(|e| bad("Normal", e))?)
            }
            DistributionKind::LogNormal => {
                let [mu, sigma] = params::<2>("LogNormal", p)?;
                if !(sigma >= 0.0) {
                    return Err(bad("LogNormal", "sigma must be >= 0"));
                }
                Family::LogNormal(LogNormal::new(mu, sigma).map_err(|e| bad("LogNormal", e))?)
            }
            DistributionKind::Cauchy => {
                let [median, scale] = params::<2>("Cauchy", p)?;
                Family::Cauchy(Cauchy::new(median, scale).map_err(|e| bad("Cauchy", e))?)
            }
            DistributionKind::Exponential => {
                let [lambda] = params::<1>("Exponential", p)?;
                Family::Exponential(Exp::new(lambda).map_err(|e| bad("Exponential", e))?)
            }
            DistributionKind::Gamma => {
                let [shape, scale] = params::<2>("Gamma", p)?;
                Family::Gamma(Gamma::new(shape, scale).map_err(|e| bad("Gamma", e))?)
            }
            DistributionKind::Pareto => {
                let [scale, shape] = params::<2>("Pareto", p)?;
                Family::Pareto(Pareto::new(scale, shape).map_err(|e| bad("Pareto", e))?)
            }
            DistributionKind::Weibull => {
                let [scale, shape] = params::<2>("Weibull", p)?;
                Family::Weibull(Weibull::new(scale, shape).map_err(|e| bad("Weibull", e))?)
            }
            DistributionKind::Triangular => {
                let [min, max, mode] = params::<3>("Triangular", p)?;
                Family::Triangular(
                    Triangular::new(min, max, mode).map_err(|e| bad("Triangular", e))?,
                )
            }
            DistributionKind::Poisson => {
                let [lambda] = params::<1>("Poisson", p)?;
                Family::Poisson(Poisson::new(lambda).map_err(|e| bad("Poisson", e))?)
            }
            DistributionKind::Binomial => {
                let [n, prob] = params::<2>("Binomial", p)?;
                if n < 0.0 || n.fract() != 0.0 {
                    return Err(bad("Binomial", "n must be a non-negative integer"));
                }
                Family::Binomial(Binomial::new(n as u64, prob).map_err(|e| bad("Binomial", e))?)
            }
            DistributionKind::Geometric => {
                let [prob] = params::<1>("Geometric", p)?;
                Family::Geometric(Geometric::new(prob).map_err(|e| bad("Geometric", e))?)
            }
        };

        let rng = match spec.random_source {
            RandomSourceKind::System => SourceRng::Std(StdRng::from_entropy()),
            RandomSourceKind::Fast => SourceRng::Small(SmallRng::from_entropy()),
            RandomSourceKind::Seeded => SourceRng::Std(StdRng::seed_from_u64(spec.seed)),
        };

        Ok(Some(Sampler { family, rng }))
    }

    /// Draw one value from the resolved process.
    pub fn sample(&mut self) -> f64 {
        match &self.family {
            Family::Uniform(d) => self.rng.sample(d),
            Family::Normal(d) => self.rng.sample(d),
            Family::LogNormal(d) => self.rng.sample(d),
            Family::Cauchy(d) => self.rng.sample(d),
            Family::Exponential(d) => self.rng.sample(d),
            Family::Gamma(d) => self.rng.sample(d),
            Family::Pareto(d) => self.rng.sample(d),
            Family::Weibull(d) => self.rng.sample(d),
            Family::Triangular(d) => self.rng.sample(d),
            Family::Poisson(d) => self.rng.sample(d),
            Family::Binomial(d) => self.rng.sample_u64(d) as f64,
            Family::Geometric(d) => self.rng.sample_u64(d) as f64,
        }
    }
}

/// One sample interpreted directly as milliseconds of latency. Negative or
/// zero samples (and the absent sampler) mean no delay.
pub fn latency_delay(sampler: Option<&mut Sampler>) -> Duration {
    let ms = sampler.map_or(0.0, Sampler::sample);
    if ms.is_finite() && ms > 0.0 {
        // Samples past the representable range saturate instead of panicking
        Duration::try_from_secs_f64(ms / 1000.0).unwrap_or(Duration::MAX)
    } else {
        Duration::ZERO
    }
}

/// One sample interpreted as kilobits/second of available bandwidth for
/// `bytes` bytes of transfer. A sample at or below zero (and the absent
/// sampler) means unlimited.
pub fn transfer_delay(sampler: Option<&mut Sampler>, bytes: usize) -> Duration {
    let kbps = sampler.map_or(0.0, Sampler::sample);
    if !kbps.is_finite() || kbps <= 0.0 {
        return Duration::ZERO;
    }
    let bytes_per_sec = kbps / 8.0 * 1024.0;
    Duration::try_from_secs_f64(bytes as f64 / bytes_per_sec).unwrap_or(Duration::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(distribution: DistributionKind, parameters: &[f64]) -> DistributionSpec {
        DistributionSpec {
            distribution,
            random_source: RandomSourceKind::Seeded,
            parameters: parameters.to_vec(),
            seed: 7,
        }
    }

    #[test]
    fn test_null_spec_resolves_to_no_sampler() {
        assert!(Sampler::resolve(None).unwrap().is_none());
        assert_eq!(latency_delay(None), Duration::ZERO);
        assert_eq!(transfer_delay(None, 4096), Duration::ZERO);
    }

    #[test]
    fn test_all_families_sample_finite() {
        let cases = [
            spec(DistributionKind::Uniform, &[1.0, 10.0]),
            spec(DistributionKind::Normal, &[50.0, 10.0]),
            spec(DistributionKind::LogNormal, &[1.0, 0.5]),
            spec(DistributionKind::Cauchy, &[10.0, 1.0]),
            spec(DistributionKind::Exponential, &[0.5]),
            spec(DistributionKind::Gamma, &[2.0, 2.0]),
            spec(DistributionKind::Pareto, &[1.0, 2.0]),
            spec(DistributionKind::Weibull, &[1.0, 1.5]),
            spec(DistributionKind::Triangular, &[0.0, 100.0, 30.0]),
            spec(DistributionKind::Poisson, &[4.0]),
            spec(DistributionKind::Binomial, &[20.0, 0.5]),
            spec(DistributionKind::Geometric, &[0.3]),
        ];
        for case in cases {
            let mut sampler = Sampler::resolve(Some(&case)).unwrap().unwrap();
            for _ in 0..200 {
                let value = sampler.sample();
                assert!(value.is_finite(), "{:?} produced {}", case.distribution, value);
            }
        }
    }

    #[test]
    fn test_wrong_arity_is_config_error() {
        let err = Sampler::resolve(Some(&spec(DistributionKind::Normal, &[1.0])))
            .expect_err("should reject one parameter");
        assert!(matches!(err, DistError::WrongArity { expected: 2, got: 1, .. }));
    }

    #[test]
    fn test_invalid_parameters_are_config_errors() {
        assert!(Sampler::resolve(Some(&spec(DistributionKind::Uniform, &[5.0, 5.0]))).is_err());
        assert!(Sampler::resolve(Some(&spec(DistributionKind::Normal, &[0.0, -1.0]))).is_err());
        assert!(Sampler::resolve(Some(&spec(DistributionKind::LogNormal, &[0.0, -0.5]))).is_err());
        assert!(Sampler::resolve(Some(&spec(DistributionKind::Binomial, &[2.5, 0.5]))).is_err());
    }

    #[test]
    fn test_latency_delay_saturates_on_huge_samples() {
        let mut sampler = Sampler::resolve(Some(&spec(
            DistributionKind::Uniform,
            &[1e30, 1e31],
        )))
        .unwrap()
        .unwrap();
        assert_eq!(latency_delay(Some(&mut sampler)), Duration::MAX);
    }

    #[test]
    fn test_transfer_delay_saturates_on_tiny_bandwidth() {
        let mut sampler = Sampler::resolve(Some(&spec(
            DistributionKind::Uniform,
            &[1e-300, 2e-300],
        )))
        .unwrap()
        .unwrap();
        assert_eq!(transfer_delay(Some(&mut sampler), 1 << 20), Duration::MAX);
    }

    #[test]
    fn test_latency_delay_clamps_nonpositive() {
        // A normal centered far below zero essentially always samples negative
        let mut sampler = Sampler::resolve(Some(&spec(
            DistributionKind::Normal,
            &[-1000.0, 0.001],
        )))
        .unwrap()
        .unwrap();
        assert_eq!(latency_delay(Some(&mut sampler)), Duration::ZERO);
    }

    #[test]
    fn test_latency_delay_interprets_milliseconds() {
        let mut sampler = Sampler::resolve(Some(&spec(
            DistributionKind::Uniform,
            &[100.0, 100.000001],
        )))
        .unwrap()
        .unwrap();
        let delay = latency_delay(Some(&mut sampler));
        assert!(delay >= Duration::from_millis(99) && delay <= Duration::from_millis(101));
    }

    #[test]
    fn test_transfer_delay_math() {
        // 8 Kbps == 1024 bytes/sec, so 2048 bytes take ~2 seconds
        let mut sampler = Sampler::resolve(Some(&spec(
            DistributionKind::Uniform,
            &[8.0, 8.000001],
        )))
        .unwrap()
        .unwrap();
        let delay = transfer_delay(Some(&mut sampler), 2048);
        assert!(delay >= Duration::from_millis(1990) && delay <= Duration::from_millis(2010));
    }

    #[test]
    fn test_seeded_source_is_reproducible() {
        let s = spec(DistributionKind::Normal, &[10.0, 2.0]);
        let mut a = Sampler::resolve(Some(&s)).unwrap().unwrap();
        let mut b = Sampler::resolve(Some(&s)).unwrap().unwrap();
        for _ in 0..16 {
            assert_eq!(a.sample(), b.sample());
        }
    }

    #[test]
    fn test_spec_deserializes_classic_field_names() {
        let json = r#"{
            "Distribution": "Poisson",
            "RandomSourceType": "SystemRandomSource",
            "DistributionParameters": [3.5]
        }"#;
        let parsed: DistributionSpec = serde_json::from_str(json).unwrap();
        assert_eq!(parsed.distribution, DistributionKind::Poisson);
        assert_eq!(parsed.random_source, RandomSourceKind::System);
        assert_eq!(parsed.parameters, vec![3.5]);
    }
}
