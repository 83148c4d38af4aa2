//! Cell value helpers.
//!
//! Cells are stored as JSON values. This module defines the link-cell
//! shape (`{id, title}` or an array thereof), the error marker stored by
//! failed derived evaluations, and type validation of written cells.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::error::{Error, Result};
use crate::field::{ConcreteType, FieldKind, FieldSchema};
use crate::id::RecordId;

/// Key of the error marker object stored by failed derived evaluations.
pub const ERROR_KEY: &str = "error";

/// Error marker stored on division by zero.
pub const ERROR_DIV_BY_ZERO: &str = "#DIV/0!";

/// Error marker stored on any other evaluation failure.
pub const ERROR_GENERIC: &str = "#ERROR!";

/// One entry of a link cell: the authoritative record id and the cached
/// title projected from the foreign lookup field.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinkCell {
    pub id: RecordId,
    #[serde(default)]
    pub title: String,
}

impl LinkCell {
    /// Creates a link cell entry.
    pub fn new(id: impl Into<RecordId>, title: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            title: title.into(),
        }
    }

    /// Renders this entry as a JSON object.
    pub fn to_value(&self) -> Value {
        json!({ "id": self.id, "title": self.title })
    }
}

/// Parses a link cell value into its entries.
///
/// Accepts `null` (no links), a single `{id, title}` object, or an array
/// of such objects. Entries without an `id` are ignored.
pub fn parse_link_cell(value: &Value) -> Vec<LinkCell> {
    fn one(value: &Value) -> Option<LinkCell> {
        let id = value.get("id")?.as_str()?;
        let title = value
            .get("title")
            .and_then(Value::as_str)
            .unwrap_or_default();
        Some(LinkCell::new(id, title))
    }

    match value {
        Value::Array(items) => items.iter().filter_map(one).collect(),
        Value::Object(_) => one(value).into_iter().collect(),
        _ => Vec::new(),
    }
}

/// Renders link entries back into a cell value of the right cardinality.
///
/// Multi-valued cells are always arrays (empty when no links remain);
/// single-valued cells are a lone object or `null`.
pub fn link_cell_value(entries: &[LinkCell], multi: bool) -> Value {
    if multi {
        Value::Array(entries.iter().map(LinkCell::to_value).collect())
    } else {
        entries
            .first()
            .map(LinkCell::to_value)
            .unwrap_or(Value::Null)
    }
}

/// Builds a derived-cell error marker.
pub fn error_value(code: &str) -> Value {
    json!({ ERROR_KEY: code })
}

/// Returns true if the value is a derived-cell error marker.
pub fn is_error_value(value: &Value) -> bool {
    matches!(value, Value::Object(map) if map.len() == 1 && map.contains_key(ERROR_KEY))
}

/// Validates a written cell value against the field's declared type.
///
/// Derived fields are rejected outright; they are computed, never written.
pub fn validate_cell(field: &FieldSchema, value: &Value) -> Result<()> {
    if field.is_computed() {
        return Err(Error::type_mismatch(
            &field.id,
            "computed fields cannot be written",
        ));
    }
    if value.is_null() {
        if field.required {
            return Err(Error::required_field(&field.id));
        }
        return Ok(());
    }
    match &field.kind {
        FieldKind::Concrete { data_type } => validate_concrete(field, *data_type, value),
        FieldKind::Link { link } => {
            let valid_shape = match value {
                Value::Object(_) => !link.is_multi(),
                Value::Array(items) => {
                    link.is_multi() && items.iter().all(|item| item.is_object())
                }
                _ => false,
            };
            if !valid_shape {
                return Err(Error::type_mismatch(
                    &field.id,
                    if link.is_multi() {
                        "expected an array of {id, title} objects"
                    } else {
                        "expected a single {id, title} object"
                    },
                ));
            }
            let entries = parse_link_cell(value);
            let declared = match value {
                Value::Array(items) => items.len(),
                _ => 1,
            };
            if entries.len() != declared {
                return Err(Error::type_mismatch(&field.id, "link entry without an id"));
            }
            Ok(())
        }
        _ => unreachable!("derived kinds rejected above"),
    }
}

fn validate_concrete(field: &FieldSchema, data_type: ConcreteType, value: &Value) -> Result<()> {
    let ok = match data_type {
        ConcreteType::Text | ConcreteType::SingleSelect => value.is_string(),
        ConcreteType::Number => value.is_number(),
        ConcreteType::Date => value.is_number() || value.is_string(),
        ConcreteType::Checkbox => value.is_boolean(),
        ConcreteType::MultiSelect => {
            matches!(value, Value::Array(items) if items.iter().all(Value::is_string))
        }
        ConcreteType::Attachment => {
            matches!(value, Value::Array(items) if items.iter().all(Value::is_object))
        }
        ConcreteType::User => value.is_object(),
    };
    if ok {
        Ok(())
    } else {
        Err(Error::type_mismatch(
            &field.id,
            format!("value does not match {:?}", data_type),
        ))
    }
}
