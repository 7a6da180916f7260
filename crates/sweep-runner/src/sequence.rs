//! Sweep specifications and the value sequences they produce.
//!
//! A sweep is parsed once into a [`SweepSpec`] and turned into a [`Sequence`]
//! either for a per-setting axis ([`generator_from_config`], bounded by the
//! number of settings) or for the outer process-count axis
//! ([`scale_up_generator`], possibly unbounded).

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{SweepError, SweepResult};

/// A single swept value. Numbers keep their integer/float distinction so they
/// format the way they were written.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Scalar {
    Int(i64),
    Float(f64),
    Bool(bool),
    Str(String),
}

impl Scalar {
    pub fn from_value(value: &Value) -> Option<Scalar> {
        match value {
            Value::Bool(b) => Some(Scalar::Bool(*b)),
            Value::Number(n) => n
                .as_i64()
                .map(Scalar::Int)
                .or_else(|| n.as_f64().map(Scalar::Float)),
            Value::String(s) => Some(Scalar::Str(s.clone())),
            _ => None,
        }
    }

    pub fn to_value(&self) -> Value {
        match self {
            Scalar::Int(i) => Value::from(*i),
            Scalar::Float(f) => Value::from(*f),
            Scalar::Bool(b) => Value::Bool(*b),
            Scalar::Str(s) => Value::String(s.clone()),
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Scalar::Int(i) => Some(*i),
            Scalar::Float(f) if f.fract() == 0.0 => Some(*f as i64),
            _ => None,
        }
    }

    pub fn is_numeric(&self) -> bool {
        matches!(self, Scalar::Int(_) | Scalar::Float(_))
    }

    fn as_f64(&self) -> f64 {
        match self {
            Scalar::Int(i) => *i as f64,
            Scalar::Float(f) => *f,
            _ => 0.0,
        }
    }

    fn add(&self, other: &Scalar) -> Scalar {
        match (self, other) {
            (Scalar::Int(a), Scalar::Int(b)) => Scalar::Int(a.saturating_add(*b)),
            _ => Scalar::Float(self.as_f64() + other.as_f64()),
        }
    }

    fn mul(&self, other: &Scalar) -> Scalar {
        match (self, other) {
            (Scalar::Int(a), Scalar::Int(b)) => Scalar::Int(a.saturating_mul(*b)),
            _ => Scalar::Float(self.as_f64() * other.as_f64()),
        }
    }
}

impl fmt::Display for Scalar {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Scalar::Int(i) => write!(f, "{}", i),
            Scalar::Float(x) => write!(f, "{}", x),
            Scalar::Bool(b) => write!(f, "{}", b),
            Scalar::Str(s) => f.write_str(s),
        }
    }
}

impl From<i64> for Scalar {
    fn from(value: i64) -> Self {
        Scalar::Int(value)
    }
}

impl From<&str> for Scalar {
    fn from(value: &str) -> Self {
        Scalar::Str(value.to_string())
    }
}

/// How one value varies across settings. Decided once, at parse time.
#[derive(Debug, Clone, PartialEq)]
pub enum SweepSpec {
    Constant(Scalar),
    Arithmetic {
        start: Scalar,
        step: Scalar,
        num_steps: Option<usize>,
    },
    Geometric {
        start: Scalar,
        factor: Scalar,
        num_steps: usize,
    },
    List(Vec<Scalar>),
}

impl SweepSpec {
    /// Parses the configuration form of a sweep:
    /// a scalar, a list, `{start, step[, num_steps]}` or
    /// `{start, step_factor, num_steps}`.
    pub fn parse(name: &str, value: &Value) -> SweepResult<SweepSpec> {
        match value {
            Value::Object(map) => {
                let numeric = |key: &str| -> SweepResult<Option<Scalar>> {
                    match map.get(key) {
                        None => Ok(None),
                        Some(v) => match Scalar::from_value(v) {
                            Some(s) if s.is_numeric() => Ok(Some(s)),
                            _ => Err(invalid(name, format!("'{}' must be a number", key))),
                        },
                    }
                };
                let num_steps = match map.get("num_steps") {
                    None => None,
                    Some(v) => Some(
                        v.as_u64()
                            .ok_or_else(|| invalid(name, "'num_steps' must be a non-negative integer"))?
                            as usize,
                    ),
                };
                let start = numeric("start")?
                    .ok_or_else(|| invalid(name, "stepper needs a 'start' value"))?;
                if let Some(factor) = numeric("step_factor")? {
                    let num_steps = num_steps
                        .ok_or_else(|| invalid(name, "'step_factor' requires 'num_steps'"))?;
                    return Ok(SweepSpec::Geometric {
                        start,
                        factor,
                        num_steps,
                    });
                }
                let step = numeric("step")?
                    .ok_or_else(|| invalid(name, "stepper needs 'step' or 'step_factor'"))?;
                Ok(SweepSpec::Arithmetic {
                    start,
                    step,
                    num_steps,
                })
            }
            Value::Array(items) => items
                .iter()
                .map(|v| {
                    Scalar::from_value(v)
                        .ok_or_else(|| invalid(name, "list entries must be scalars"))
                })
                .collect::<SweepResult<Vec<_>>>()
                .map(SweepSpec::List),
            Value::Null => Err(invalid(name, "missing value")),
            other => Scalar::from_value(other)
                .map(SweepSpec::Constant)
                .ok_or_else(|| invalid(name, "unsupported value")),
        }
    }
}

fn invalid(name: &str, reason: impl Into<String>) -> SweepError {
    SweepError::InvalidSweep {
        name: name.to_string(),
        reason: reason.into(),
    }
}

#[derive(Debug, Clone)]
enum Source {
    Repeat(Scalar),
    Step { next: Scalar, step: Scalar },
    Scale { next: Scalar, factor: Scalar },
    Items(std::vec::IntoIter<Scalar>),
}

/// Lazy producer of sweep values.
#[derive(Debug, Clone)]
pub struct Sequence {
    source: Source,
    remaining: Option<usize>,
}

impl Sequence {
    fn new(source: Source, remaining: Option<usize>) -> Self {
        Self { source, remaining }
    }

    /// False for sequences that never run dry on their own (constants and
    /// open-ended steppers).
    pub fn is_bounded(&self) -> bool {
        self.remaining.is_some() || matches!(self.source, Source::Items(_))
    }
}

impl Iterator for Sequence {
    type Item = Scalar;

    fn next(&mut self) -> Option<Scalar> {
        if self.remaining == Some(0) {
            return None;
        }
        let value = match &mut self.source {
            Source::Repeat(value) => Some(value.clone()),
            Source::Step { next, step } => {
                let value = next.clone();
                *next = next.add(step);
                Some(value)
            }
            Source::Scale { next, factor } => {
                let value = next.clone();
                *next = next.mul(factor);
                Some(value)
            }
            Source::Items(items) => items.next(),
        };
        if let (Some(remaining), Some(_)) = (self.remaining.as_mut(), value.as_ref()) {
            *remaining -= 1;
        }
        value
    }
}

/// Sequence for a per-setting axis (an argument or environment variable).
/// Steppers are bounded to `num_settings` terms; lists must hold at least
/// that many entries.
pub fn generator_from_config(
    name: &str,
    spec: &SweepSpec,
    num_settings: usize,
) -> SweepResult<Sequence> {
    let sequence = match spec {
        SweepSpec::Constant(value) => Sequence::new(Source::Repeat(value.clone()), None),
        SweepSpec::Arithmetic { start, step, .. } => Sequence::new(
            Source::Step {
                next: start.clone(),
                step: step.clone(),
            },
            Some(num_settings),
        ),
        SweepSpec::Geometric { start, factor, .. } => Sequence::new(
            Source::Scale {
                next: start.clone(),
                factor: factor.clone(),
            },
            Some(num_settings),
        ),
        SweepSpec::List(items) => {
            if items.len() < num_settings {
                return Err(SweepError::InsufficientValues {
                    name: name.to_string(),
                    needed: num_settings,
                    found: items.len(),
                });
            }
            Sequence::new(Source::Items(items.clone().into_iter()), Some(num_settings))
        }
    };
    Ok(sequence)
}

/// Sequence for the outer process-count axis. Arithmetic steppers without
/// `num_steps` and constants are unbounded; the caller bounds the loop.
pub fn scale_up_generator(spec: &SweepSpec) -> Sequence {
    match spec {
        SweepSpec::Constant(value) => Sequence::new(Source::Repeat(value.clone()), None),
        SweepSpec::Arithmetic {
            start,
            step,
            num_steps,
        } => Sequence::new(
            Source::Step {
                next: start.clone(),
                step: step.clone(),
            },
            *num_steps,
        ),
        SweepSpec::Geometric {
            start,
            factor,
            num_steps,
        } => Sequence::new(
            Source::Scale {
                next: start.clone(),
                factor: factor.clone(),
            },
            Some(*num_steps),
        ),
        SweepSpec::List(items) => Sequence::new(Source::Items(items.clone().into_iter()), None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn arithmetic_yields_closed_form_terms() {
        let spec = SweepSpec::parse("a", &json!({"start": 3, "step": 4})).expect("parse");
        for n in [0usize, 1, 5, 9] {
            let values: Vec<_> = generator_from_config("a", &spec, n).expect("gen").collect();
            assert_eq!(values.len(), n);
            for (k, v) in values.iter().enumerate() {
                assert_eq!(*v, Scalar::Int(3 + 4 * k as i64));
            }
        }
    }

    #[test]
    fn geometric_yields_closed_form_terms() {
        let spec = SweepSpec::parse("n", &json!({"start": 2, "step_factor": 3, "num_steps": 5}))
            .expect("parse");
        let values: Vec<_> = scale_up_generator(&spec).collect();
        assert_eq!(
            values,
            (0..5).map(|k| Scalar::Int(2 * 3i64.pow(k))).collect::<Vec<_>>()
        );
    }

    #[test]
    fn float_step_promotes_to_float() {
        let spec = SweepSpec::parse("x", &json!({"start": 1, "step": 0.5})).expect("parse");
        let values: Vec<_> = generator_from_config("x", &spec, 3).expect("gen").collect();
        assert_eq!(
            values,
            vec![Scalar::Int(1), Scalar::Float(1.5), Scalar::Float(2.0)]
        );
    }

    #[test]
    fn short_list_fails_before_producing_values() {
        let spec = SweepSpec::parse("arg0", &json!(["a", "b"])).expect("parse");
        let err = generator_from_config("arg0", &spec, 3).expect_err("must fail");
        match err {
            SweepError::InsufficientValues {
                name,
                needed,
                found,
            } => {
                assert_eq!(name, "arg0");
                assert_eq!(needed, 3);
                assert_eq!(found, 2);
            }
            other => panic!("unexpected error: {}", other),
        }
    }

    #[test]
    fn list_yields_first_n_items_in_order() {
        let spec = SweepSpec::parse("arg0", &json!(["a", 2, "c", "d"])).expect("parse");
        let values: Vec<_> = generator_from_config("arg0", &spec, 3).expect("gen").collect();
        assert_eq!(
            values,
            vec![Scalar::from("a"), Scalar::Int(2), Scalar::from("c")]
        );
    }

    #[test]
    fn constant_repeats_forever() {
        let spec = SweepSpec::parse("c", &json!("x")).expect("parse");
        let seq = generator_from_config("c", &spec, 1).expect("gen");
        assert!(!seq.is_bounded());
        assert!(seq.take(100).all(|v| v == Scalar::from("x")));
    }

    #[test]
    fn scale_up_stepper_without_bound_is_open_ended() {
        let spec = SweepSpec::parse("scaleup", &json!({"start": 1, "step": 1})).expect("parse");
        let seq = scale_up_generator(&spec);
        assert!(!seq.is_bounded());
        let first: Vec<_> = seq.take(4).collect();
        assert_eq!(
            first,
            vec![Scalar::Int(1), Scalar::Int(2), Scalar::Int(3), Scalar::Int(4)]
        );
    }

    #[test]
    fn scale_up_list_yields_each_item() {
        let spec = SweepSpec::parse("scaleup", &json!([1, 2])).expect("parse");
        let seq = scale_up_generator(&spec);
        assert!(seq.is_bounded());
        assert_eq!(seq.collect::<Vec<_>>(), vec![Scalar::Int(1), Scalar::Int(2)]);
    }

    #[test]
    fn parse_rejects_malformed_steppers() {
        assert!(SweepSpec::parse("s", &json!({"step": 1})).is_err());
        assert!(SweepSpec::parse("s", &json!({"start": 1})).is_err());
        assert!(SweepSpec::parse("s", &json!({"start": 1, "step_factor": 2})).is_err());
        assert!(SweepSpec::parse("s", &json!({"start": "a", "step": 1})).is_err());
        assert!(SweepSpec::parse("s", &json!([[1]])).is_err());
    }
}
