use serde::{Deserialize, Serialize};
use statrs::distribution::{Continuous, ContinuousCDF, LogNormal, Normal, Uniform, Weibull};

use crate::{
    error::{RareEventError, Result},
    math::{std_normal_cdf, std_normal_quantile},
};

/// Family and shape parameters of an uncertain model input.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "distribution", rename_all = "snake_case")]
pub enum DistributionKind {
    Normal { mean: f64, std_dev: f64 },
    Uniform { lower: f64, upper: f64 },
    LogNormal { location: f64, scale: f64 },
    Weibull { shape: f64, scale: f64 },
}

/// Serialized form of a [`Parameter`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParameterSpec {
    pub name: String,
    #[serde(flatten)]
    pub kind: DistributionKind,
}

#[derive(Debug, Clone)]
enum Family {
    Normal(Normal),
    Uniform(Uniform),
    LogNormal(LogNormal),
    Weibull(Weibull),
}

/// An immutable, named parameter distribution.
///
/// Every chain operates on standardized coordinates `z = Φ⁻¹(cdf(x))`;
/// [`Parameter::standardize`] and [`Parameter::destandardize`] move between
/// the two spaces.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(try_from = "ParameterSpec", into = "ParameterSpec")]
pub struct Parameter {
    name: String,
    kind: DistributionKind,
    family: Family,
}

fn invalid(name: &str, err: impl std::fmt::Display) -> RareEventError {
    RareEventError::Configuration(format!("parameter '{name}': {err}"))
}

impl Parameter {
    pub fn new(name: impl Into<String>, kind: DistributionKind) -> Result<Self> {
        let name = name.into();
        let family = match kind {
            DistributionKind::Normal { mean, std_dev } => {
                Family::Normal(Normal::new(mean, std_dev).map_err(|e| invalid(&name, e))?)
            }
            DistributionKind::Uniform { lower, upper } => {
                Family::Uniform(Uniform::new(lower, upper).map_err(|e| invalid(&name, e))?)
            }
            DistributionKind::LogNormal { location, scale } => Family::LogNormal(
                LogNormal::new(location, scale).map_err(|e| invalid(&name, e))?,
            ),
            DistributionKind::Weibull { shape, scale } => {
                Family::Weibull(Weibull::new(shape, scale).map_err(|e| invalid(&name, e))?)
            }
        };
        Ok(Self { name, kind, family })
    }

    pub fn normal(name: impl Into<String>, mean: f64, std_dev: f64) -> Result<Self> {
        Self::new(name, DistributionKind::Normal { mean, std_dev })
    }

    pub fn uniform(name: impl Into<String>, lower: f64, upper: f64) -> Result<Self> {
        Self::new(name, DistributionKind::Uniform { lower, upper })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> DistributionKind {
        self.kind
    }

    pub fn cdf(&self, x: f64) -> f64 {
        match &self.family {
            Family::Normal(d) => d.cdf(x),
            Family::Uniform(d) => d.cdf(x),
            Family::LogNormal(d) => d.cdf(x),
            Family::Weibull(d) => d.cdf(x),
        }
    }

    /// Inverse of [`Parameter::cdf`] for `p` in `[0, 1]`.
    pub fn quantile(&self, p: f64) -> f64 {
        match self.kind {
            DistributionKind::Normal { mean, std_dev } => mean + std_dev * std_normal_quantile(p),
            DistributionKind::Uniform { lower, upper } => lower + p * (upper - lower),
            DistributionKind::LogNormal { location, scale } => {
                (location + scale * std_normal_quantile(p)).exp()
            }
            DistributionKind::Weibull { shape, scale } => {
                scale * (-(-p).ln_1p()).powf(shape.recip())
            }
        }
    }

    pub fn pdf(&self, x: f64) -> f64 {
        match &self.family {
            Family::Normal(d) => d.pdf(x),
            Family::Uniform(d) => d.pdf(x),
            Family::LogNormal(d) => d.pdf(x),
            Family::Weibull(d) => d.pdf(x),
        }
    }

    /// Map a physical value to its standard-normal coordinate.
    #[inline]
    pub fn standardize(&self, x: f64) -> f64 {
        std_normal_quantile(self.cdf(x))
    }

    /// Map a standard-normal coordinate back to a physical value.
    #[inline]
    pub fn destandardize(&self, z: f64) -> f64 {
        self.quantile(std_normal_cdf(z))
    }
}

impl TryFrom<ParameterSpec> for Parameter {
    type Error = RareEventError;

    fn try_from(spec: ParameterSpec) -> Result<Self> {
        Parameter::new(spec.name, spec.kind)
    }
}

impl From<Parameter> for ParameterSpec {
    fn from(parameter: Parameter) -> Self {
        ParameterSpec {
            name: parameter.name,
            kind: parameter.kind,
        }
    }
}

/// Standardize a whole parameter vector.
pub(crate) fn standardize_all(parameters: &[Parameter], inputs: &[f64]) -> Vec<f64> {
    parameters
        .iter()
        .zip(inputs)
        .map(|(param, &x)| param.standardize(x))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::{assert_abs_diff_eq, assert_relative_eq};
    use pretty_assertions::assert_eq;
    use proptest::prelude::*;

    fn families() -> Vec<Parameter> {
        vec![
            Parameter::normal("load", 10., 2.).unwrap(),
            Parameter::uniform("width", -1., 3.).unwrap(),
            Parameter::new(
                "strength",
                DistributionKind::LogNormal {
                    location: 0.5,
                    scale: 0.3,
                },
            )
            .unwrap(),
            Parameter::new(
                "life",
                DistributionKind::Weibull {
                    shape: 1.7,
                    scale: 4.,
                },
            )
            .unwrap(),
        ]
    }

    proptest! {
        #[test]
        fn quantile_inverts_cdf(u in 0.001f64..0.999) {
            for param in families() {
                let x = param.quantile(u);
                let back = param.quantile(param.cdf(x));
                prop_assert!(
                    (back - x).abs() <= 1e-7 * x.abs().max(1.),
                    "{}: {} vs {}",
                    param.name(),
                    x,
                    back
                );
            }
        }

        #[test]
        fn standardization_round_trips(z in -5f64..5.) {
            for param in families() {
                let x = param.destandardize(z);
                let back = param.standardize(x);
                prop_assert!((back - z).abs() < 1e-6, "{}: {} vs {}", param.name(), z, back);
            }
        }
    }

    #[test]
    fn standard_normal_is_identity_in_standardized_space() {
        let param = Parameter::normal("x", 0., 1.).unwrap();
        for x in [-3.2, -1., 0., 0.4, 2.7] {
            assert_abs_diff_eq!(param.standardize(x), x, epsilon = 1e-7);
        }
    }

    #[test]
    fn pdf_matches_family() {
        let params = families();
        assert_relative_eq!(params[0].pdf(10.), 0.19947114020071635, epsilon = 1e-14);
        assert_relative_eq!(params[1].pdf(0.), 0.25, epsilon = 1e-14);
        assert_eq!(params[1].pdf(5.), 0.);
    }

    #[test]
    fn invalid_shape_is_a_configuration_error() {
        let err = Parameter::normal("bad", 0., -1.).unwrap_err();
        assert!(matches!(err, RareEventError::Configuration(_)));
        assert!(Parameter::uniform("bad", 2., 1.).is_err());
    }

    #[test]
    fn parameters_deserialize_from_tagged_specs() {
        let json = r#"[
            {"name": "load", "distribution": "normal", "mean": 10.0, "std_dev": 2.0},
            {"name": "life", "distribution": "weibull", "shape": 1.7, "scale": 4.0}
        ]"#;
        let params: Vec<Parameter> = serde_json::from_str(json).unwrap();
        assert_eq!(params.len(), 2);
        assert_eq!(params[0].name(), "load");
        assert_eq!(
            params[1].kind(),
            DistributionKind::Weibull {
                shape: 1.7,
                scale: 4.
            }
        );

        let bad = r#"[{"name": "x", "distribution": "normal", "mean": 0.0, "std_dev": 0.0}]"#;
        assert!(serde_json::from_str::<Vec<Parameter>>(bad).is_err());
    }
}
