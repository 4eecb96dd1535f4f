// ironlinq-core/src/translate/grouping.rs
// Aggregates over group members → accumulators on the latest $group stage

use super::{lambda_parts, Translator};
use crate::error::{LinqError, Result};
use crate::expr::{Declaring, Expr};
use crate::pipeline::StageKind;
use serde_json::{json, Value};

/// Sequence operators that can run as group accumulators
const GROUP_ACCUMULATED: &[&str] = &[
    "Count",
    "LongCount",
    "Sum",
    "Min",
    "Max",
    "Average",
    "First",
    "FirstOrDefault",
    "Last",
    "LastOrDefault",
    "Select",
];

impl Translator {
    /// `g.Sum(..)`, `g.Count()`, `g.Select(..)` ... where `g` is a grouping
    pub(crate) fn is_grouping_aggregate(expr: &Expr) -> bool {
        match expr {
            Expr::Call {
                declaring: Declaring::Enumerable,
                method,
                args,
                ..
            } => {
                GROUP_ACCUMULATED.contains(&method.as_str())
                    && args.first().map_or(false, |source| source.ty().is_grouping())
            }
            _ => false,
        }
    }

    /// Add an accumulator for the aggregate to the latest group stage and return the
    /// name of the field it writes.
    pub(crate) fn grouping_aggregate(&mut self, expr: &Expr) -> Result<String> {
        let (method, args) = match expr {
            Expr::Call { method, args, .. } => (method.as_str(), args.as_slice()),
            other => {
                return Err(LinqError::contract(format!(
                    "grouping aggregate on {}",
                    other.kind_name()
                )))
            }
        };
        let argument = args.get(1);

        let accumulator = match method {
            "Count" | "LongCount" => match argument {
                None => json!({ "$sum": 1 }),
                Some(predicate) => {
                    // Keeps the pipeline portable to stores without a filtered $count
                    let test = self.member_value(Some(predicate))?;
                    json!({ "$sum": { "$cond": [test, 1, 0] } })
                }
            },
            "Sum" => json!({ "$sum": self.member_value(argument)? }),
            "Min" => json!({ "$min": self.member_value(argument)? }),
            "Max" => json!({ "$max": self.member_value(argument)? }),
            "Average" => json!({ "$avg": self.member_value(argument)? }),
            "First" | "FirstOrDefault" if argument.is_none() => {
                json!({ "$first": self.member_value(None)? })
            }
            "Last" | "LastOrDefault" if argument.is_none() => {
                json!({ "$last": self.member_value(None)? })
            }
            "Select" => {
                let selector = argument
                    .ok_or_else(|| LinqError::contract("Select over a grouping without selector"))?;
                json!({ "$push": self.member_value(Some(selector))? })
            }
            other => {
                return Err(LinqError::unsupported(format!(
                    "method {} with {} arguments on a grouping",
                    other,
                    args.len()
                )))
            }
        };

        let field = self.pipeline.temp_name("_agg");
        self.pipeline
            .last_stage_mut(StageKind::Group)?
            .body_object_mut()?
            .insert(field.clone(), accumulator);
        Ok(field)
    }

    /// A group member, or a lambda applied to it, as seen by the group stage's input rows
    fn member_value(&mut self, lambda: Option<&Expr>) -> Result<Value> {
        let input = self.group_input;
        self.with_param_envelope(input, |t| match lambda {
            None => Ok(Value::String(t.unbound_param_expression())),
            Some(lambda) => {
                let (_, body) = lambda_parts(lambda, 1)?;
                t.translate_value(body)
            }
        })
    }
}
