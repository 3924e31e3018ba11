//! Field: one column's metadata.

use crate::error::AppError;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

const IDENTIFIER_PATTERN: &str = r"^[A-Za-z_][A-Za-z0-9_]{0,62}$";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldType {
    Text,
    Number,
    Date,
    Float,
    Boolean,
}

impl FieldType {
    pub fn as_str(&self) -> &'static str {
        match self {
            FieldType::Text => "text",
            FieldType::Number => "number",
            FieldType::Date => "date",
            FieldType::Float => "float",
            FieldType::Boolean => "boolean",
        }
    }
}

impl std::fmt::Display for FieldType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

fn default_true() -> bool {
    true
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Field {
    pub name: String,
    #[serde(rename = "type")]
    pub field_type: FieldType,
    #[serde(default)]
    pub primary: bool,
    #[serde(default)]
    pub unique: bool,
    #[serde(default)]
    pub required: bool,
    #[serde(default)]
    pub default: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_value: Option<Value>,
    #[serde(default)]
    pub auto_increment: bool,
    #[serde(default = "default_true")]
    pub read: bool,
    #[serde(default = "default_true")]
    pub write: bool,
    /// Set when the field only exists to carry a belongsTo foreign key.
    #[serde(default)]
    pub is_relation: bool,
}

impl Field {
    pub fn new(name: impl Into<String>, field_type: FieldType) -> Self {
        Field {
            name: name.into(),
            field_type,
            primary: false,
            unique: false,
            required: false,
            default: false,
            default_value: None,
            auto_increment: false,
            read: true,
            write: true,
            is_relation: false,
        }
    }

    pub fn primary(mut self) -> Self {
        self.primary = true;
        self
    }

    pub fn unique(mut self) -> Self {
        self.unique = true;
        self
    }

    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }

    pub fn auto_increment(mut self) -> Self {
        self.auto_increment = true;
        self
    }

    pub fn with_default(mut self, value: Value) -> Self {
        self.default = true;
        self.default_value = if value.is_null() { None } else { Some(value) };
        self
    }

    pub fn relation_field(mut self) -> Self {
        self.is_relation = true;
        self
    }

    /// NOT NULL in the database: explicit `required` or primary key membership.
    pub fn not_null(&self) -> bool {
        self.required || self.primary
    }

    pub fn validate(&self) -> Result<(), AppError> {
        validate_identifier("field", &self.name)?;
        if self.auto_increment && !(self.primary && self.field_type == FieldType::Number) {
            return Err(AppError::Validation(format!(
                "field '{}': autoIncrement requires a primary number field",
                self.name
            )));
        }
        if self.default_value.is_some() && !self.default {
            return Err(AppError::Validation(format!(
                "field '{}': defaultValue set without default",
                self.name
            )));
        }
        Ok(())
    }
}

/// Identifiers end up quoted in DDL, but keep them portable across engines.
pub fn validate_identifier(kind: &str, name: &str) -> Result<(), AppError> {
    let re = Regex::new(IDENTIFIER_PATTERN)
        .map_err(|_| AppError::Validation(format!("invalid identifier pattern for {}", kind)))?;
    if !re.is_match(name) {
        return Err(AppError::Validation(format!("invalid {} name '{}'", kind, name)));
    }
    Ok(())
}

/// Partial update of a field. Only the keys that are set are applied.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FieldPatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, rename = "type", skip_serializing_if = "Option::is_none")]
    pub field_type: Option<FieldType>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub primary: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unique: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub required: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auto_increment: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<bool>,
    /// `null` clears the default value.
    #[serde(default, deserialize_with = "present_value", skip_serializing_if = "Option::is_none")]
    pub default_value: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub read: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub write: Option<bool>,
}

/// Keeps an explicit `null` as `Some(Value::Null)` instead of collapsing it to `None`.
fn present_value<'de, D>(deserializer: D) -> Result<Option<Value>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    Value::deserialize(deserializer).map(Some)
}

impl FieldPatch {
    pub fn is_empty(&self) -> bool {
        *self == FieldPatch::default()
    }

    /// Keys on which `to` differs from `from`, carrying `to`'s values.
    pub fn between(from: &Field, to: &Field) -> FieldPatch {
        let mut patch = FieldPatch::default();
        if from.name != to.name {
            patch.name = Some(to.name.clone());
        }
        if from.field_type != to.field_type {
            patch.field_type = Some(to.field_type);
        }
        if from.primary != to.primary {
            patch.primary = Some(to.primary);
        }
        if from.unique != to.unique {
            patch.unique = Some(to.unique);
        }
        if from.required != to.required {
            patch.required = Some(to.required);
        }
        if from.auto_increment != to.auto_increment {
            patch.auto_increment = Some(to.auto_increment);
        }
        if from.default != to.default {
            patch.default = Some(to.default);
        }
        if from.default_value != to.default_value {
            patch.default_value = Some(to.default_value.clone().unwrap_or(Value::Null));
        }
        if from.read != to.read {
            patch.read = Some(to.read);
        }
        if from.write != to.write {
            patch.write = Some(to.write);
        }
        patch
    }

    pub fn apply(&self, field: &mut Field) {
        if let Some(name) = &self.name {
            field.name = name.clone();
        }
        if let Some(t) = self.field_type {
            field.field_type = t;
        }
        if let Some(v) = self.primary {
            field.primary = v;
        }
        if let Some(v) = self.unique {
            field.unique = v;
        }
        if let Some(v) = self.required {
            field.required = v;
        }
        if let Some(v) = self.auto_increment {
            field.auto_increment = v;
        }
        if let Some(v) = self.default {
            field.default = v;
        }
        if let Some(v) = &self.default_value {
            field.default_value = if v.is_null() { None } else { Some(v.clone()) };
        }
        if let Some(v) = self.read {
            field.read = v;
        }
        if let Some(v) = self.write {
            field.write = v;
        }
    }

    /// Whether applying this patch changes the column in the database
    /// (read/write exposure is model-only).
    pub fn touches_column(&self) -> bool {
        let mut column_only = self.clone();
        column_only.read = None;
        column_only.write = None;
        !column_only.is_empty()
    }
}
