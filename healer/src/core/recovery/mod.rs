//! Structured output recovery.
//!
//! [`validate`] turns raw model text into a record that satisfies an
//! [`OutputSchema`]. The primary path isolates the first JSON object in the
//! trimmed text, applies light coercion and validates against the schema. Only
//! if that fails is a markdown fence wrapping the whole response removed and
//! the parse retried, so backticks inside string values are never touched.
//! When both fail and the schema names a salvage field, the field is extracted
//! from the raw text and returned as a partial record. Salvage never
//! fills in other fields; they are reported in [`Validated::absent`].
//!
//! The function is pure: the same text and schema always give the same result.

pub mod salvage;
pub mod schema;

use std::sync::LazyLock;

use regex::Regex;
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};
use thiserror::Error;

pub use schema::{OutputSchema, SchemaKind};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RecoveryError {
    #[error("{kind} output is not valid json: {message}")]
    Parse { kind: SchemaKind, message: String },
    #[error("{kind} output violates schema: {}", .violations.join("; "))]
    Schema {
        kind: SchemaKind,
        violations: Vec<String>,
    },
    #[error("{kind} record could not be decoded: {message}")]
    Decode { kind: SchemaKind, message: String },
}

/// A record accepted by [`validate`].
#[derive(Debug, Clone, PartialEq)]
pub struct Validated {
    pub kind: SchemaKind,
    pub record: Map<String, Value>,
    /// True when the record came from salvage rather than a full parse.
    pub salvaged: bool,
    /// Required fields missing from a salvaged record.
    pub absent: Vec<String>,
}

impl Validated {
    pub fn str_field(&self, name: &str) -> Option<&str> {
        self.record.get(name).and_then(Value::as_str)
    }

    pub fn is_partial(&self) -> bool {
        !self.absent.is_empty()
    }

    /// Decode a complete record into its typed form.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, RecoveryError> {
        serde_json::from_value(Value::Object(self.record.clone())).map_err(|err| {
            RecoveryError::Decode {
                kind: self.kind,
                message: err.to_string(),
            }
        })
    }
}

/// Parse `raw` against `schema`, falling back to salvage of the schema's
/// salvage field.
pub fn validate(raw: &str, schema: &OutputSchema) -> Result<Validated, RecoveryError> {
    let trimmed = raw.trim();
    let primary = parse_primary(trimmed, schema).or_else(|err| match unwrap_fence(trimmed) {
        Some(inner) => parse_primary(inner, schema),
        None => Err(err),
    });
    let err = match primary {
        Ok(record) => {
            return Ok(Validated {
                kind: schema.kind,
                record,
                salvaged: false,
                absent: Vec::new(),
            });
        }
        Err(err) => err,
    };

    let Some(field) = schema.salvage_field else {
        return Err(err);
    };
    let Some(value) = salvage::salvage_string_field(raw, field) else {
        return Err(err);
    };

    tracing::warn!(kind = %schema.kind, field, error = %err, "recovered partial record via salvage");
    let mut record = Map::new();
    record.insert(field.to_string(), Value::String(value));
    let absent = schema
        .required_fields()
        .into_iter()
        .filter(|name| name != field)
        .collect();
    Ok(Validated {
        kind: schema.kind,
        record,
        salvaged: true,
        absent,
    })
}

fn parse_primary(text: &str, schema: &OutputSchema) -> Result<Map<String, Value>, RecoveryError> {
    let extracted = extract_json_object(text);
    let mut value: Value =
        serde_json::from_str(&extracted).map_err(|err| RecoveryError::Parse {
            kind: schema.kind,
            message: err.to_string(),
        })?;

    coerce(&mut value, &schema.json, false);

    let violations = schema.violations(&value);
    if !violations.is_empty() {
        return Err(RecoveryError::Schema {
            kind: schema.kind,
            violations,
        });
    }
    match value {
        Value::Object(map) => Ok(map),
        _ => Err(RecoveryError::Schema {
            kind: schema.kind,
            violations: vec!["expected a json object".to_string()],
        }),
    }
}

/// Inner text of a ```json ... ``` fence that wraps all of `text`.
fn unwrap_fence(text: &str) -> Option<&str> {
    static FENCE_RE: LazyLock<Regex> =
        LazyLock::new(|| Regex::new(r"(?is)\A```(?:json)?\s*(.*)\s*```\z").unwrap());
    FENCE_RE
        .captures(text)
        .and_then(|caps| caps.get(1))
        .map(|inner| inner.as_str().trim())
}

/// Return the first balanced `{...}` object in `text` (or the unterminated
/// tail starting at the first `{`). Raw control characters inside strings are
/// escaped so that literal newlines in code do not break the parse.
fn extract_json_object(text: &str) -> String {
    let Some(start) = text.find('{') else {
        return text.to_string();
    };

    let mut out = String::with_capacity(text.len() - start);
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;

    for ch in text[start..].chars() {
        if in_string {
            if escaped {
                escaped = false;
                out.push(ch);
                continue;
            }
            match ch {
                '\\' => {
                    escaped = true;
                    out.push(ch);
                }
                '"' => {
                    in_string = false;
                    out.push(ch);
                }
                '\n' => out.push_str("\\n"),
                '\r' => out.push_str("\\r"),
                '\t' => out.push_str("\\t"),
                c if (c as u32) < 0x20 => out.push_str(&format!("\\u{:04x}", c as u32)),
                c => out.push(c),
            }
            continue;
        }

        out.push(ch);
        match ch {
            '"' => in_string = true,
            '{' => depth += 1,
            '}' => {
                depth = depth.saturating_sub(1);
                if depth == 0 {
                    break;
                }
            }
            _ => {}
        }
    }
    out
}

/// Light, schema-directed coercion applied before validation:
///
/// - numeric-looking strings become numbers for `number`/`integer` fields,
/// - enum strings are normalized (`"Edge Case"` → `"edge_case"`),
/// - containers under `string` fields become their JSON text,
/// - inside array items, numbers and booleans under `string` fields become text,
/// - a lone string under an `array` of strings is wrapped.
fn coerce(value: &mut Value, schema: &Value, nested: bool) {
    let (Some(obj), Some(props)) = (
        value.as_object_mut(),
        schema.get("properties").and_then(Value::as_object),
    ) else {
        return;
    };

    for (name, prop) in props {
        let Some(field) = obj.get_mut(name) else {
            continue;
        };
        match prop.get("type").and_then(Value::as_str) {
            Some("number") | Some("integer") => {
                if let Some(text) = field.as_str()
                    && let Ok(parsed) = text.trim().parse::<f64>()
                    && let Some(number) = serde_json::Number::from_f64(parsed)
                {
                    *field = if prop.get("type").and_then(Value::as_str) == Some("integer")
                        && parsed.fract() == 0.0
                    {
                        Value::from(parsed as i64)
                    } else {
                        Value::Number(number)
                    };
                }
            }
            Some("string") => {
                if let Some(allowed) = prop.get("enum").and_then(Value::as_array)
                    && let Some(text) = field.as_str()
                {
                    let normalized = normalize_enum(text);
                    if allowed.iter().any(|v| v.as_str() == Some(normalized.as_str())) {
                        *field = Value::String(normalized);
                    }
                }
                let stringify = matches!(field, Value::Object(_) | Value::Array(_))
                    || (nested && matches!(field, Value::Number(_) | Value::Bool(_)));
                if stringify {
                    *field = Value::String(field.to_string());
                }
            }
            Some("array") => {
                if let Some(text) = field.as_str() {
                    *field = Value::Array(vec![Value::String(text.to_string())]);
                }
                if let (Some(items), Some(item_schema)) = (field.as_array_mut(), prop.get("items"))
                {
                    for item in items {
                        coerce(item, item_schema, true);
                    }
                }
            }
            _ => {}
        }
    }
}

fn normalize_enum(text: &str) -> String {
    text.trim()
        .to_lowercase()
        .chars()
        .map(|c| if c == ' ' || c == '-' { '_' } else { c })
        .collect()
}
