//! The declarative rule language local providers are written in.
//!
//! A rule is a JSON tree evaluated against the dataset. Strings beginning
//! with `$` are dotted-path dataset references, single-key `$directive`
//! objects are built-in functions, and everything else evaluates to itself
//! element-wise. The evaluator is deliberately small: providers that need
//! real logic run behind the remote HTTP driver instead.

use serde_json::{Map, Value};
use thiserror::Error;
use uuid::Uuid;

use stagehand_domain::Dataset;

use crate::encrypt;

#[derive(Debug, Error)]
pub enum RuleError {
    #[error("unknown rule directive {0:?}")]
    UnknownDirective(String),

    #[error("directive {directive:?} is malformed: {message}")]
    Malformed { directive: String, message: String },

    #[error("$encrypt used without an encryption key configured")]
    NoEncryptionKey,
}

/// Evaluates rule trees against a dataset.
#[derive(Debug, Clone, Default)]
pub struct Evaluator {
    /// Key for the `$encrypt` directive. Sealing without it is an error.
    pub encryption_key: Option<String>,
}

impl Evaluator {
    pub fn new(encryption_key: Option<String>) -> Self {
        Evaluator { encryption_key }
    }

    /// Evaluate `node` against `dataset`, producing a plain JSON value.
    ///
    /// Unresolvable dataset references evaluate to `null`; rules use that to
    /// express "nothing here" (an empty availability list, a failed step).
    pub fn eval(&self, node: &Value, dataset: &Dataset) -> Result<Value, RuleError> {
        match node {
            Value::String(s) => Ok(self.eval_string(s, dataset)),
            Value::Array(items) => items
                .iter()
                .map(|item| self.eval(item, dataset))
                .collect::<Result<Vec<_>, _>>()
                .map(Value::Array),
            Value::Object(map) => self.eval_object(map, dataset),
            other => Ok(other.clone()),
        }
    }

    fn eval_string(&self, s: &str, dataset: &Dataset) -> Value {
        if let Some(literal) = s.strip_prefix("$$") {
            return Value::String(format!("${literal}"));
        }
        if let Some(path) = s.strip_prefix('$') {
            return dataset.get_path(path).cloned().unwrap_or(Value::Null);
        }
        Value::String(s.to_string())
    }

    fn eval_object(&self, map: &Map<String, Value>, dataset: &Dataset) -> Result<Value, RuleError> {
        if map.len() == 1 {
            if let Some((key, argument)) = map.iter().next() {
                if let Some(directive) = key.strip_prefix('$') {
                    // $decrypt envelopes are data, not directives; they pass
                    // through for the consuming side to open.
                    if directive != "decrypt" {
                        return self.apply(directive, argument, dataset);
                    }
                }
            }
        }
        let mut evaluated = Map::with_capacity(map.len());
        for (key, value) in map {
            evaluated.insert(key.clone(), self.eval(value, dataset)?);
        }
        Ok(Value::Object(evaluated))
    }

    fn apply(
        &self,
        directive: &str,
        argument: &Value,
        dataset: &Dataset,
    ) -> Result<Value, RuleError> {
        match directive {
            "uuid" | "uuid_generate" => Ok(Value::String(Uuid::new_v4().to_string())),
            "join" => {
                let argument = self.eval(argument, dataset)?;
                let values = argument.get("values").and_then(Value::as_array).ok_or_else(|| {
                    RuleError::Malformed {
                        directive: "join".into(),
                        message: "expected an object with a 'values' list".into(),
                    }
                })?;
                let separator =
                    argument.get("separator").and_then(Value::as_str).unwrap_or_default();
                let parts: Vec<String> = values.iter().map(stringify).collect();
                Ok(Value::String(parts.join(separator)))
            }
            "json_dumps" => {
                let inner = self.eval(argument, dataset)?;
                serde_json::to_string(&inner).map(Value::String).map_err(|e| {
                    RuleError::Malformed { directive: "json_dumps".into(), message: e.to_string() }
                })
            }
            "encrypt" => {
                let argument = self.eval(argument, dataset)?;
                let plain = argument.get("value").map(stringify).ok_or_else(|| {
                    RuleError::Malformed {
                        directive: "encrypt".into(),
                        message: "expected an object with a 'value'".into(),
                    }
                })?;
                let key = self.encryption_key.as_deref().ok_or(RuleError::NoEncryptionKey)?;
                let sealed = encrypt::seal(&plain, key).map_err(|e| RuleError::Malformed {
                    directive: "encrypt".into(),
                    message: e.to_string(),
                })?;
                Ok(encrypt::envelope(sealed))
            }
            "expand" => {
                let value = argument.get("value").ok_or_else(|| RuleError::Malformed {
                    directive: "expand".into(),
                    message: "expected an object with 'value' and 'to'".into(),
                })?;
                let to = self
                    .eval(argument.get("to").unwrap_or(&Value::Null), dataset)?
                    .as_u64()
                    .ok_or_else(|| RuleError::Malformed {
                        directive: "expand".into(),
                        message: "'to' must be a non-negative integer".into(),
                    })?;
                let mut items = Vec::with_capacity(to as usize);
                for _ in 0..to {
                    items.push(self.eval(value, dataset)?);
                }
                Ok(Value::Array(items))
            }
            other => Err(RuleError::UnknownDirective(other.to_string())),
        }
    }
}

fn stringify(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// The falsiness rules step results are judged by: null, false, zero and
/// empty containers all fail a step.
pub fn is_falsy(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::Bool(b) => !b,
        Value::Number(n) => n.as_f64() == Some(0.0),
        Value::String(s) => s.is_empty(),
        Value::Array(items) => items.is_empty(),
        Value::Object(map) => map.is_empty(),
    }
}
