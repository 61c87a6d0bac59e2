//! Output schemas for each model-backed step.

use std::fmt;
use std::sync::LazyLock;

use jsonschema::{Draft, Validator};
use serde::{Deserialize, Serialize};
use serde_json::Value;

const GENERATION_SCHEMA: &str = include_str!("../../../schemas/generation.schema.json");
const TESTS_SCHEMA: &str = include_str!("../../../schemas/tests.schema.json");
const DIAGNOSIS_SCHEMA: &str = include_str!("../../../schemas/diagnosis.schema.json");
const SUMMARY_SCHEMA: &str = include_str!("../../../schemas/summary.schema.json");

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SchemaKind {
    Generation,
    Tests,
    Diagnosis,
    Summary,
}

impl SchemaKind {
    pub fn as_str(self) -> &'static str {
        match self {
            SchemaKind::Generation => "generation",
            SchemaKind::Tests => "tests",
            SchemaKind::Diagnosis => "diagnosis",
            SchemaKind::Summary => "summary",
        }
    }

    pub fn schema(self) -> &'static OutputSchema {
        match self {
            SchemaKind::Generation => &GENERATION,
            SchemaKind::Tests => &TESTS,
            SchemaKind::Diagnosis => &DIAGNOSIS,
            SchemaKind::Summary => &SUMMARY,
        }
    }
}

impl fmt::Display for SchemaKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A compiled output schema plus its salvage rule.
pub struct OutputSchema {
    pub kind: SchemaKind,
    pub json: Value,
    /// The one free-text field salvage may recover. `None` forbids partial records.
    pub salvage_field: Option<&'static str>,
    validator: Validator,
}

impl fmt::Debug for OutputSchema {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OutputSchema")
            .field("kind", &self.kind)
            .field("salvage_field", &self.salvage_field)
            .finish_non_exhaustive()
    }
}

impl OutputSchema {
    fn compile(kind: SchemaKind, raw: &str, salvage_field: Option<&'static str>) -> Self {
        let json: Value = serde_json::from_str(raw).expect("embedded schema should be valid json");
        let validator = jsonschema::options()
            .with_draft(Draft::Draft202012)
            .build(&json)
            .expect("embedded schema should compile");
        Self {
            kind,
            json,
            salvage_field,
            validator,
        }
    }

    /// Required top-level field names, in declaration order.
    pub fn required_fields(&self) -> Vec<String> {
        self.json
            .get("required")
            .and_then(Value::as_array)
            .map(|fields| {
                fields
                    .iter()
                    .filter_map(Value::as_str)
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Schema violations for `instance`; empty when valid.
    pub fn violations(&self, instance: &Value) -> Vec<String> {
        self.validator
            .iter_errors(instance)
            .map(|err| err.to_string())
            .collect()
    }
}

static GENERATION: LazyLock<OutputSchema> =
    LazyLock::new(|| OutputSchema::compile(SchemaKind::Generation, GENERATION_SCHEMA, Some("code")));
static TESTS: LazyLock<OutputSchema> =
    LazyLock::new(|| OutputSchema::compile(SchemaKind::Tests, TESTS_SCHEMA, None));
static DIAGNOSIS: LazyLock<OutputSchema> = LazyLock::new(|| {
    OutputSchema::compile(SchemaKind::Diagnosis, DIAGNOSIS_SCHEMA, Some("root_cause"))
});
static SUMMARY: LazyLock<OutputSchema> =
    LazyLock::new(|| OutputSchema::compile(SchemaKind::Summary, SUMMARY_SCHEMA, None));
