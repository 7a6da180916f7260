//! Conditional overrides: `lhs OP rhs` comparisons against the resolved
//! scheduler namespace, and the deep merge applied when one holds.

use serde_json::Value;

use crate::error::{SweepError, SweepResult};
use crate::namespace::{ResolvedNamespace, KEY_NODES, KEY_PROCS};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Op {
    Eq,
    Ne,
    Lt,
    Gt,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Operand {
    Literal(i64),
    Procs,
    Nodes,
}

/// A parsed comparison such as `n > 4` or `N != 1`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Condition {
    expression: String,
    lhs: Operand,
    op: Op,
    rhs: Operand,
}

impl Condition {
    pub fn parse(expression: &str) -> SweepResult<Condition> {
        let bad = |reason: &str| SweepError::BadCondition {
            expression: expression.to_string(),
            reason: reason.to_string(),
        };
        let pos = expression
            .find(['=', '!', '<', '>'])
            .ok_or_else(|| bad("expected one of =, !=, <, >"))?;
        let rest = &expression[pos..];
        let (op, width) = if rest.starts_with("!=") {
            (Op::Ne, 2)
        } else if rest.starts_with("==") {
            (Op::Eq, 2)
        } else if rest.starts_with('=') {
            (Op::Eq, 1)
        } else if rest.starts_with('<') {
            (Op::Lt, 1)
        } else if rest.starts_with('>') {
            (Op::Gt, 1)
        } else {
            return Err(bad("'!' must be followed by '='"));
        };
        let lhs = expression[..pos].trim();
        let rhs = expression[pos + width..].trim();
        if lhs.is_empty() || rhs.is_empty() {
            return Err(bad("expected lhs OP rhs"));
        }
        if rhs.contains(['=', '!', '<', '>']) {
            return Err(bad("more than one operator"));
        }
        Ok(Condition {
            expression: expression.to_string(),
            lhs: parse_operand(lhs).ok_or_else(|| bad(&format!("unknown operand '{}'", lhs)))?,
            op,
            rhs: parse_operand(rhs).ok_or_else(|| bad(&format!("unknown operand '{}'", rhs)))?,
        })
    }

    pub fn evaluate(&self, namespace: &ResolvedNamespace) -> SweepResult<bool> {
        let lhs = self.operand_value(&self.lhs, namespace)?;
        let rhs = self.operand_value(&self.rhs, namespace)?;
        Ok(match self.op {
            Op::Eq => lhs == rhs,
            Op::Ne => lhs != rhs,
            Op::Lt => lhs < rhs,
            Op::Gt => lhs > rhs,
        })
    }

    pub fn expression(&self) -> &str {
        &self.expression
    }

    fn operand_value(&self, operand: &Operand, namespace: &ResolvedNamespace) -> SweepResult<i64> {
        let key = match operand {
            Operand::Literal(v) => return Ok(*v),
            Operand::Procs => KEY_PROCS,
            Operand::Nodes => KEY_NODES,
        };
        namespace
            .get(key)
            .and_then(|v| v.as_i64())
            .ok_or_else(|| SweepError::BadCondition {
                expression: self.expression.clone(),
                reason: format!("'{}' is not an integer", key),
            })
    }
}

fn parse_operand(token: &str) -> Option<Operand> {
    match token {
        KEY_PROCS => Some(Operand::Procs),
        KEY_NODES => Some(Operand::Nodes),
        other => other.parse::<i64>().ok().map(Operand::Literal),
    }
}

/// Override block applied to the benchmark template when its condition holds.
#[derive(Debug, Clone, PartialEq)]
pub struct ConditionalOverride {
    pub condition: Condition,
    pub benchmarks: Value,
}

impl ConditionalOverride {
    pub fn from_value(value: &Value) -> SweepResult<ConditionalOverride> {
        let expression = value
            .get("condition")
            .and_then(|v| v.as_str())
            .ok_or_else(|| SweepError::config("conditional entry needs a 'condition' string"))?;
        let benchmarks = value.get("benchmarks").cloned().unwrap_or(Value::Null);
        if !benchmarks.is_object() {
            return Err(SweepError::config(format!(
                "conditional '{}' needs a 'benchmarks' table",
                expression
            )));
        }
        Ok(ConditionalOverride {
            condition: Condition::parse(expression)?,
            benchmarks,
        })
    }
}

/// Returns `template` with every holding override merged in, in order.
pub fn apply_conditionals(
    template: &Value,
    overrides: &[ConditionalOverride],
    namespace: &ResolvedNamespace,
) -> SweepResult<Value> {
    let mut merged = template.clone();
    for o in overrides {
        if o.condition.evaluate(namespace)? {
            tracing::debug!(condition = o.condition.expression(), "conditional override applies");
            deep_merge(&mut merged, &o.benchmarks);
        }
    }
    Ok(merged)
}

/// Merges `overlay` into `base`. Tables merge key by key, anything else in
/// `overlay` replaces what `base` had.
pub fn deep_merge(base: &mut Value, overlay: &Value) {
    match (base, overlay) {
        (Value::Object(base_map), Value::Object(overlay_map)) => {
            for (key, value) in overlay_map {
                let nested = value.is_object()
                    && base_map.get(key).map(|v| v.is_object()).unwrap_or(false);
                if !nested {
                    base_map.insert(key.clone(), value.clone());
                } else if let Some(existing) = base_map.get_mut(key) {
                    deep_merge(existing, value);
                }
            }
        }
        (base, overlay) => *base = overlay.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::namespace::Namespace;
    use serde_json::json;

    fn namespace(procs: u64) -> ResolvedNamespace {
        ResolvedNamespace::resolve(&Namespace::new(), procs, 4, "SBATCH_").expect("namespace")
    }

    #[test]
    fn evaluates_against_process_and_node_counts() {
        let ns = namespace(8);
        assert!(Condition::parse("n > 4").unwrap().evaluate(&ns).unwrap());
        assert!(Condition::parse("N=2").unwrap().evaluate(&ns).unwrap());
        assert!(Condition::parse("N == 2").unwrap().evaluate(&ns).unwrap());
        assert!(!Condition::parse("n != 8").unwrap().evaluate(&ns).unwrap());
        assert!(Condition::parse("1 < N").unwrap().evaluate(&ns).unwrap());
        assert!(!Condition::parse("n < n").unwrap().evaluate(&ns).unwrap());
    }

    #[test]
    fn malformed_expressions_are_bad_conditions() {
        for expr in ["n", "n >", "> 4", "n >= 4", "x > 4", "n ! 4", "n > 4 > 2", "n = 4.5"] {
            match Condition::parse(expr) {
                Err(SweepError::BadCondition { expression, .. }) => assert_eq!(expression, expr),
                other => panic!("{} should be a bad condition, got {:?}", expr, other),
            }
        }
    }

    #[test]
    fn holding_overrides_merge_in_declaration_order() {
        let template = json!({
            "workdir": "run",
            "num_settings": 1,
            "env_vars": { "OMP_NUM_THREADS": 1, "KEEP": "yes" }
        });
        let overrides = vec![
            ConditionalOverride::from_value(&json!({
                "condition": "n > 4",
                "benchmarks": { "num_settings": 2, "env_vars": { "OMP_NUM_THREADS": 2 } }
            }))
            .unwrap(),
            ConditionalOverride::from_value(&json!({
                "condition": "N = 1",
                "benchmarks": { "workdir": "single" }
            }))
            .unwrap(),
            ConditionalOverride::from_value(&json!({
                "condition": "N > 1",
                "benchmarks": { "workdir": "multi" }
            }))
            .unwrap(),
        ];
        let merged = apply_conditionals(&template, &overrides, &namespace(8)).unwrap();
        assert_eq!(
            merged,
            json!({
                "workdir": "multi",
                "num_settings": 2,
                "env_vars": { "OMP_NUM_THREADS": 2, "KEEP": "yes" }
            })
        );
        let untouched = apply_conditionals(&template, &overrides[..1], &namespace(2)).unwrap();
        assert_eq!(untouched, template);
    }

    #[test]
    fn conditional_entry_requires_benchmarks_table() {
        assert!(ConditionalOverride::from_value(&json!({"condition": "n > 1"})).is_err());
        assert!(ConditionalOverride::from_value(&json!({"benchmarks": {}})).is_err());
    }
}
