// ironlinq-core/src/translate/mod.rs
//! Expression tree → aggregation pipeline
//!
//! [`translate`] walks the query-operator chain from its source collection outwards and
//! emits pipeline stages for each operator (see `stages`). Lambda bodies are lowered by
//! three cooperating translators:
//!
//! - `field`: member chains → document field paths
//! - `predicate`: boolean lambdas → match-dialect filters (with `$expr` fallback)
//! - `value`: everything else → aggregation expressions
//!
//! Aggregates over group members are rewritten into accumulators by `grouping`, and
//! joins become `$lookup` + `$unwind` in `join`.

mod field;
mod grouping;
mod join;
mod predicate;
mod stages;
mod value;

use crate::error::{LinqError, Result};
use crate::expr::{Expr, ExprType};
use crate::pipeline::{Envelope, FieldRef, PipelineBuilder, TranslatedQuery};
use crate::log_debug;

/// Translate a query expression into a pipeline plus result shape
pub fn translate(expr: &Expr) -> Result<TranslatedQuery> {
    let (collection, item_type) = expr.root_collection().ok_or_else(|| {
        LinqError::unsupported(format!("{} as query source", expr.kind_name()))
    })?;
    let mut translator = Translator::new(collection, item_type.clone());
    translator.emit(expr)?;
    let query = translator.pipeline.finish()?;
    log_debug!("{} => {}", expr, query);
    Ok(query)
}

pub(crate) struct Translator {
    pipeline: PipelineBuilder,
    root_type: ExprType,
    /// Envelope that unbound lambda parameters resolve against
    param_envelope: Envelope,
    /// Envelope of the rows that entered the latest group-by
    group_input: Envelope,
}

impl Translator {
    fn new(collection: &str, root_type: ExprType) -> Self {
        Translator {
            pipeline: PipelineBuilder::new(collection),
            root_type,
            param_envelope: Envelope::Document,
            group_input: Envelope::Document,
        }
    }

    /// Run `f` with lambda parameters bound to field prefixes; previous bindings come
    /// back afterwards whether or not `f` succeeds.
    fn scoped<R>(
        &mut self,
        bindings: Vec<(String, FieldRef)>,
        f: impl FnOnce(&mut Self) -> Result<R>,
    ) -> Result<R> {
        let previous: Vec<(String, Option<FieldRef>)> = bindings
            .into_iter()
            .map(|(param, prefix)| {
                let shadowed = self.pipeline.bind(&param, prefix);
                (param, shadowed)
            })
            .collect();
        let result = f(self);
        for (param, shadowed) in previous.into_iter().rev() {
            self.pipeline.restore(&param, shadowed);
        }
        result
    }

    fn with_param_envelope<R>(
        &mut self,
        envelope: Envelope,
        f: impl FnOnce(&mut Self) -> Result<R>,
    ) -> Result<R> {
        let previous = std::mem::replace(&mut self.param_envelope, envelope);
        let result = f(self);
        self.param_envelope = previous;
        result
    }

    /// Bind the single parameter of an array-operator lambda to a fresh variable and
    /// translate inside that scope. `f` gets the variable name and the lambda body.
    fn with_lambda_var<R>(
        &mut self,
        lambda: &Expr,
        f: impl FnOnce(&mut Self, &str, &Expr) -> Result<R>,
    ) -> Result<R> {
        let (params, body) = lambda_parts(lambda, 1)?;
        let var = self.pipeline.temp_name("v");
        self.scoped(
            vec![(params[0].clone(), FieldRef::Variable(var.clone()))],
            |t| f(t, &var, body),
        )
    }
}

/// Parameters and body of a lambda argument with the expected arity
pub(crate) fn lambda_parts(expr: &Expr, arity: usize) -> Result<(&[String], &Expr)> {
    match expr.as_lambda() {
        Some((params, body)) if params.len() == arity => Ok((params, body)),
        Some((params, _)) => Err(LinqError::unsupported(format!(
            "lambda with {} parameters where {} expected",
            params.len(),
            arity
        ))),
        None => Err(LinqError::contract(format!(
            "expected a lambda argument, found {}",
            expr.kind_name()
        ))),
    }
}

/// True if `body` is just the lambda's own parameter (`x => x`)
pub(crate) fn is_identity(params: &[String], body: &Expr) -> bool {
    matches!(body, Expr::Parameter { name, .. } if params.first() == Some(name))
}

/// Escape a literal for use inside a regular expression
pub(crate) fn escape_regex(literal: &str) -> String {
    regex::escape(literal)
}
