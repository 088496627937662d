//! # Formula evaluation
//!
//! Expression-derived out-edges compute their outflow from a user-supplied formula. The engine
//! only depends on the [`FormulaEvaluator`] trait, so the expression engine behind it can be
//! swapped. [`EvalexprEvaluator`] is the default implementation.
//!
//! Names visible to a formula, later entries shadowing earlier ones:
//! - `pi`, `e` - mathematical constants
//! - `N` - total population across all compartments
//! - `t` - calendar time of the iteration being computed (`step * time_step`)
//! - `step` - index of the iteration being computed
//! - every model parameter
//! - every compartment, by name, holding its population at the end of the previous iteration
//!
//! Arithmetic uses `+ - * / % ^` (`**` is accepted for `^`). Mathematical functions such as
//! `exp`, `ln`, `log` (natural), `sqrt`, `sin`, `abs` or `pow` can be written without the
//! `math::` prefix that evalexpr expects; `min`, `max`, `floor`, `ceil`, `round` and `if` are
//! built in.

use std::cell::RefCell;

use evalexpr::{build_operator_tree, ContextWithMutableVariables, HashMapContext, Node, Value};
use indexmap::IndexMap;

use crate::error::StageflowError;
use crate::HashMap;

const SPECIAL_VAR_N: &str = "N";
const SPECIAL_VAR_STEP: &str = "step";
const SPECIAL_VAR_T: &str = "t";
const SPECIAL_VAR_PI: &str = "pi";
const SPECIAL_VAR_E: &str = "e";

// Longer names first so that `asin` is not read as `sin`.
const MATH_FUNCTIONS: &[&str] = &[
    "asinh", "acosh", "atanh", "asin", "acos", "atan2", "atan", "sinh", "cosh", "tanh", "sin",
    "cos", "tan", "log10", "log2", "ln", "cbrt", "sqrt", "hypot", "exp", "abs", "pow",
];

/// The values a formula can read during one iteration.
#[derive(Debug, Clone, Copy)]
pub struct Scope<'a> {
    pub parameters: &'a IndexMap<String, f64>,
    /// Compartment populations at the end of the previous iteration.
    pub compartments: &'a HashMap<String, f64>,
    pub step: usize,
    pub time: f64,
}

impl Scope<'_> {
    /// Total population across all compartments.
    #[must_use]
    pub fn total_population(&self) -> f64 {
        self.compartments.values().sum()
    }
}

/// Evaluates a formula to a number.
pub trait FormulaEvaluator {
    /// # Errors
    ///
    /// Returns `StageflowError::EvaluationError` if `expression` is malformed, references a name
    /// that is not in `scope`, or does not produce a finite number.
    fn evaluate(&self, expression: &str, scope: &Scope) -> Result<f64, StageflowError>;

    /// Checks `expression` before a run starts, given the names that will be in scope.
    ///
    /// # Errors
    ///
    /// Returns `StageflowError::EvaluationError` if the expression cannot be parsed or uses a
    /// name outside `names` and the special variables.
    fn validate(&self, expression: &str, names: &[&str]) -> Result<(), StageflowError>;
}

/// The default evaluator, backed by the evalexpr crate.
///
/// Each formula is parsed once, on first use, and its operator tree reused for every later
/// iteration.
#[derive(Debug, Default)]
pub struct EvalexprEvaluator {
    // Keyed by the formula as written, before preprocessing.
    trees: RefCell<HashMap<String, Node>>,
}

impl EvalexprEvaluator {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn with_tree<T>(
        &self,
        expression: &str,
        f: impl FnOnce(&Node) -> Result<T, StageflowError>,
    ) -> Result<T, StageflowError> {
        if let Some(tree) = self.trees.borrow().get(expression) {
            return f(tree);
        }
        let tree = build_operator_tree(&preprocess_formula(expression))
            .map_err(|e| evaluation_error(expression, e))?;
        let result = f(&tree);
        self.trees.borrow_mut().insert(expression.to_string(), tree);
        result
    }

    /// Number of distinct formulas parsed so far.
    #[must_use]
    pub fn parsed_formulas(&self) -> usize {
        self.trees.borrow().len()
    }
}

impl FormulaEvaluator for EvalexprEvaluator {
    fn evaluate(&self, expression: &str, scope: &Scope) -> Result<f64, StageflowError> {
        let mut context = HashMapContext::new();
        #[allow(clippy::cast_precision_loss)]
        let specials = [
            (SPECIAL_VAR_PI, std::f64::consts::PI),
            (SPECIAL_VAR_E, std::f64::consts::E),
            (SPECIAL_VAR_N, scope.total_population()),
            (SPECIAL_VAR_T, scope.time),
            (SPECIAL_VAR_STEP, scope.step as f64),
        ];
        let named = scope.parameters.iter().chain(scope.compartments.iter());
        for (name, value) in specials
            .into_iter()
            .chain(named.map(|(name, value)| (name.as_str(), *value)))
        {
            context
                .set_value(name.to_string(), Value::Float(value))
                .map_err(|e| evaluation_error(expression, e))?;
        }
        let value = match self.with_tree(expression, |tree| {
            tree.eval_with_context(&context)
                .map_err(|e| evaluation_error(expression, e))
        })? {
            Value::Float(value) => value,
            #[allow(clippy::cast_precision_loss)]
            Value::Int(value) => value as f64,
            other => {
                return Err(evaluation_error(
                    expression,
                    format!("evaluates to {other} instead of a number"),
                ))
            }
        };
        if !value.is_finite() {
            return Err(evaluation_error(expression, format!("evaluates to {value}")));
        }
        Ok(value)
    }

    fn validate(&self, expression: &str, names: &[&str]) -> Result<(), StageflowError> {
        // Evaluating against placeholder values catches incomplete expressions, which parsing
        // alone does not. The placeholder result itself is meaningless.
        let mut context = HashMapContext::new();
        let specials = [
            SPECIAL_VAR_PI,
            SPECIAL_VAR_E,
            SPECIAL_VAR_N,
            SPECIAL_VAR_T,
            SPECIAL_VAR_STEP,
        ];
        for name in specials.iter().chain(names.iter()) {
            context
                .set_value((*name).to_string(), Value::Float(1.0))
                .map_err(|e| evaluation_error(expression, e))?;
        }
        self.with_tree(expression, |tree| {
            tree.eval_with_context(&context)
                .map_err(|e| evaluation_error(expression, e))
        })?;
        Ok(())
    }
}

fn evaluation_error(expression: &str, error: impl std::fmt::Display) -> StageflowError {
    StageflowError::EvaluationError(format!("`{expression}`: {error}"))
}

/// Rewrites a formula into evalexpr syntax: `**` becomes `^`, `log(` becomes the natural
/// logarithm, and bare mathematical function calls get their `math::` prefix.
fn preprocess_formula(formula: &str) -> String {
    let formula = formula.replace("**", "^");
    let mut result = String::with_capacity(formula.len() + 16);
    let mut identifier = String::new();

    let flush = |identifier: &mut String, result: &mut String, is_call: bool| {
        if is_call && identifier == "log" {
            result.push_str("math::ln");
        } else if is_call && MATH_FUNCTIONS.contains(&identifier.as_str()) {
            result.push_str("math::");
            result.push_str(identifier);
        } else {
            result.push_str(identifier);
        }
        identifier.clear();
    };

    let mut chars = formula.chars().peekable();
    while let Some(c) = chars.next() {
        // `::` keeps already-qualified names such as `math::sin` in one identifier.
        if c.is_alphanumeric() || c == '_' || c == ':' || (c == '.' && !identifier.is_empty()) {
            identifier.push(c);
            continue;
        }
        if !identifier.is_empty() {
            let is_call = c == '(' || (c.is_whitespace() && chars.peek() == Some(&'('));
            flush(&mut identifier, &mut result, is_call);
        }
        result.push(c);
    }
    if !identifier.is_empty() {
        flush(&mut identifier, &mut result, false);
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::assert_almost_eq;

    fn scope_values() -> (IndexMap<String, f64>, HashMap<String, f64>) {
        let parameters = IndexMap::from([("beta".to_string(), 0.3), ("gamma".to_string(), 0.1)]);
        let compartments = HashMap::from_iter([
            ("S".to_string(), 900.0),
            ("I".to_string(), 100.0),
            ("R".to_string(), 0.0),
        ]);
        (parameters, compartments)
    }

    #[test]
    fn evaluates_parameters_and_compartments() {
        let (parameters, compartments) = scope_values();
        let scope = Scope {
            parameters: &parameters,
            compartments: &compartments,
            step: 3,
            time: 1.5,
        };
        let evaluator = EvalexprEvaluator::new();
        let value = evaluator.evaluate("beta * S * I / N", &scope).unwrap();
        assert_almost_eq!(value, 0.3 * 900.0 * 100.0 / 1000.0, 1e-9);
        assert_almost_eq!(evaluator.evaluate("t * step", &scope).unwrap(), 4.5, 1e-12);
        assert_almost_eq!(evaluator.evaluate("gamma * I", &scope).unwrap(), 10.0, 1e-9);
    }

    #[test]
    fn bare_math_functions_are_prefixed() {
        let (parameters, compartments) = scope_values();
        let scope = Scope {
            parameters: &parameters,
            compartments: &compartments,
            step: 0,
            time: 0.0,
        };
        let evaluator = EvalexprEvaluator::new();
        assert_almost_eq!(evaluator.evaluate("sqrt(I)", &scope).unwrap(), 10.0, 1e-12);
        assert_almost_eq!(evaluator.evaluate("exp(0.0) + log(e)", &scope).unwrap(), 2.0, 1e-12);
        assert_almost_eq!(evaluator.evaluate("I ** 2.0", &scope).unwrap(), 10_000.0, 1e-9);
        assert_almost_eq!(evaluator.evaluate("max(S, I)", &scope).unwrap(), 900.0, 0.0);
    }

    #[test]
    fn preprocessing_leaves_identifiers_alone() {
        assert_eq!(preprocess_formula("sin(x)"), "math::sin(x)");
        assert_eq!(preprocess_formula("asin(x) + sin (y)"), "math::asin(x) + math::sin (y)");
        assert_eq!(preprocess_formula("cos_rate * exp_decay"), "cos_rate * exp_decay");
        assert_eq!(preprocess_formula("math::sqrt(x)"), "math::sqrt(x)");
        assert_eq!(preprocess_formula("log(x)"), "math::ln(x)");
        assert_eq!(preprocess_formula("2 ** 3"), "2 ^ 3");
    }

    #[test]
    fn unknown_names_fail() {
        let (parameters, compartments) = scope_values();
        let scope = Scope {
            parameters: &parameters,
            compartments: &compartments,
            step: 0,
            time: 0.0,
        };
        let result = EvalexprEvaluator::new().evaluate("delta * I", &scope);
        assert!(matches!(result, Err(StageflowError::EvaluationError(_))));
    }

    #[test]
    fn malformed_expressions_fail() {
        let (parameters, compartments) = scope_values();
        let scope = Scope {
            parameters: &parameters,
            compartments: &compartments,
            step: 0,
            time: 0.0,
        };
        let evaluator = EvalexprEvaluator::new();
        assert!(evaluator.evaluate("beta * (S", &scope).is_err());
        assert!(evaluator.evaluate("beta *", &scope).is_err());
        assert!(evaluator.evaluate("S > I", &scope).is_err());
    }

    #[test]
    fn validate_checks_names() {
        let evaluator = EvalexprEvaluator::new();
        assert!(evaluator.validate("beta * S * I / N", &["beta", "S", "I"]).is_ok());
        assert!(evaluator.validate("beta * S * X", &["beta", "S"]).is_err());
        assert!(evaluator.validate("beta * ", &["beta"]).is_err());
    }

    #[test]
    fn formulas_are_parsed_once() {
        let (parameters, mut compartments) = scope_values();
        let evaluator = EvalexprEvaluator::new();
        evaluator.validate("beta * S * I / N", &["beta", "S", "I"]).unwrap();
        assert_eq!(evaluator.parsed_formulas(), 1);

        for step in 0..3 {
            let scope = Scope {
                parameters: &parameters,
                compartments: &compartments,
                step,
                time: 0.0,
            };
            let (s, i) = (compartments["S"], compartments["I"]);
            let value = evaluator.evaluate("beta * S * I / N", &scope).unwrap();
            assert_almost_eq!(value, 0.3 * s * i / 1000.0, 1e-9);
            compartments.insert("S".to_string(), s - 10.0);
            compartments.insert("I".to_string(), i + 10.0);
        }
        assert_eq!(evaluator.parsed_formulas(), 1);

        let scope = Scope {
            parameters: &parameters,
            compartments: &compartments,
            step: 0,
            time: 0.0,
        };
        evaluator.evaluate("gamma * I", &scope).unwrap();
        assert_eq!(evaluator.parsed_formulas(), 2);
    }
}
