//! Condition evaluation.
//!
//! The engine only needs a [`ConditionResult`]; how a condition is written is
//! up to the [`ConditionEvaluator`]. The default,
//! [`ExpressionConditionEvaluator`], runs `evalexpr` expressions over named
//! process data.

use evalexpr::{build_operator_tree, Context, ContextWithMutableVariables, DefaultNumericTypes, HashMapContext};
use serde_json::Value;
use thiserror::Error;

use messaging::ProcessData;

use crate::models::Condition;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConditionResult {
    True,
    False,
    /// The condition holds only if no sibling's condition holds.
    Otherwise,
}

impl From<bool> for ConditionResult {
    fn from(value: bool) -> Self {
        if value {
            Self::True
        } else {
            Self::False
        }
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConditionError {
    #[error("cannot parse condition '{expr}': {message}")]
    Parse { expr: String, message: String },

    #[error("cannot evaluate condition '{expr}': {message}")]
    Eval { expr: String, message: String },

    #[error("cannot expose '{name}' to conditions: {message}")]
    Data { name: String, message: String },
}

/// What a condition can see: named data, nearest first. When two entries
/// share a name the first one wins.
#[derive(Debug, Clone, Copy)]
pub struct ConditionContext<'a> {
    pub data: &'a [ProcessData],
}

pub trait ConditionEvaluator: Send + Sync {
    fn evaluate(&self, condition: &Condition, ctx: &ConditionContext<'_>) -> Result<ConditionResult, ConditionError>;
}

/// Evaluates [`Condition::Expression`] with `evalexpr`.
///
/// Each process data entry becomes a variable. UTF-8 content that parses as
/// a JSON number or boolean is exposed as one; any other UTF-8 content is a
/// string. Binary content is not visible to expressions.
#[derive(Debug, Clone, Copy, Default)]
pub struct ExpressionConditionEvaluator;

impl ExpressionConditionEvaluator {
    fn context(data: &[ProcessData]) -> Result<HashMapContext<DefaultNumericTypes>, ConditionError> {
        let mut eval_ctx = HashMapContext::<DefaultNumericTypes>::new();
        for item in data {
            let Some(text) = item.as_text() else {
                continue;
            };
            if eval_ctx.get_value(&item.name).is_some() {
                // Shadowed by a nearer entry.
                continue;
            }
            let value = match serde_json::from_str::<Value>(text) {
                Ok(Value::Bool(b)) => evalexpr::Value::Boolean(b),
                Ok(Value::Number(n)) => match (n.as_i64(), n.as_f64()) {
                    (Some(i), _) => evalexpr::Value::Int(i),
                    (None, Some(f)) => evalexpr::Value::Float(f),
                    (None, None) => evalexpr::Value::String(text.to_string()),
                },
                Ok(Value::String(s)) => evalexpr::Value::String(s),
                _ => evalexpr::Value::String(text.to_string()),
            };
            eval_ctx
                .set_value(item.name.clone(), value)
                .map_err(|e| ConditionError::Data { name: item.name.clone(), message: e.to_string() })?;
        }
        Ok(eval_ctx)
    }
}

impl ConditionEvaluator for ExpressionConditionEvaluator {
    fn evaluate(&self, condition: &Condition, ctx: &ConditionContext<'_>) -> Result<ConditionResult, ConditionError> {
        let expr = match condition {
            Condition::Otherwise => return Ok(ConditionResult::Otherwise),
            Condition::Expression(expr) => expr,
        };
        let compiled = build_operator_tree::<DefaultNumericTypes>(expr).map_err(|e| ConditionError::Parse {
            expr: expr.clone(),
            message: e.to_string(),
        })?;
        let eval_ctx = Self::context(ctx.data)?;
        compiled
            .eval_boolean_with_context(&eval_ctx)
            .map(ConditionResult::from)
            .map_err(|e| ConditionError::Eval { expr: expr.clone(), message: e.to_string() })
    }
}
