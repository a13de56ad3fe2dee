//! Template rendering and expression evaluation over envelopes
//!
//! Templates and expressions see the envelope as `input` (the payload),
//! `variables`, and `meta`. Used by transform, if, switch and for_each.

use mel_engine::{Envelope, NodeError};
use minijinja::{context, Environment};

fn envelope_context(envelope: &Envelope) -> minijinja::Value {
    context! {
        input => minijinja::Value::from_serialize(&envelope.data),
        variables => minijinja::Value::from_serialize(&envelope.variables),
        meta => minijinja::Value::from_serialize(&envelope.meta),
    }
}

/// Render a template against the envelope.
pub fn render(template: &str, envelope: &Envelope) -> Result<String, NodeError> {
    let env = Environment::new();
    env.render_str(template, envelope_context(envelope))
        .map_err(|e| NodeError::validation(format!("template error: {e}")))
}

/// Evaluate an expression against the envelope.
pub fn eval(expression: &str, envelope: &Envelope) -> Result<serde_json::Value, NodeError> {
    let env = Environment::new();
    let compiled = env
        .compile_expression(expression)
        .map_err(|e| NodeError::validation(format!("expression error: {e}")))?;
    let value = compiled
        .eval(envelope_context(envelope))
        .map_err(|e| NodeError::validation(format!("expression error: {e}")))?;
    serde_json::to_value(&value)
        .map_err(|e| NodeError::validation(format!("expression produced unserializable value: {e}")))
}

/// Evaluate an expression to a boolean (minijinja truthiness).
pub fn eval_bool(expression: &str, envelope: &Envelope) -> Result<bool, NodeError> {
    let env = Environment::new();
    let compiled = env
        .compile_expression(expression)
        .map_err(|e| NodeError::validation(format!("expression error: {e}")))?;
    let value = compiled
        .eval(envelope_context(envelope))
        .map_err(|e| NodeError::validation(format!("expression error: {e}")))?;
    Ok(value.is_true())
}
