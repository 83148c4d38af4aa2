//! Table schemas.
//!
//! A table schema is an ordered list of field definitions. The builder
//! validates what can be validated locally: duplicate ids and names, link
//! descriptors, and derived fields whose inputs must be sibling fields.
//! Cross-table checks (and cycle detection) happen where all schemas are
//! visible, in the dependency graph.

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::field::{FieldKind, FieldSchema, Relationship};
use crate::id::{FieldId, TableId};

/// Schema of one user-defined table.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TableSchema {
    pub id: TableId,
    pub name: String,
    pub fields: Vec<FieldSchema>,
}

impl TableSchema {
    /// Returns a field by id.
    pub fn field(&self, field_id: &str) -> Option<&FieldSchema> {
        self.fields.iter().find(|f| f.id == field_id)
    }

    /// Returns a field by id, or an error naming table and field.
    pub fn require_field(&self, field_id: &str) -> Result<&FieldSchema> {
        self.field(field_id)
            .ok_or_else(|| Error::field_not_found(&self.id, field_id))
    }

    /// Returns all field ids in declaration order.
    pub fn field_ids(&self) -> impl Iterator<Item = &FieldId> {
        self.fields.iter().map(|f| &f.id)
    }

    /// Returns all link fields.
    pub fn link_fields(&self) -> impl Iterator<Item = &FieldSchema> {
        self.fields.iter().filter(|f| f.as_link().is_some())
    }

    /// Returns all derived fields.
    pub fn derived_fields(&self) -> impl Iterator<Item = &FieldSchema> {
        self.fields.iter().filter(|f| f.is_computed())
    }
}

/// Builder for [`TableSchema`] with per-field validation.
#[derive(Debug)]
pub struct TableSchemaBuilder {
    id: TableId,
    name: String,
    fields: Vec<FieldSchema>,
}

impl TableSchemaBuilder {
    /// Starts a schema for the given table id and display name.
    pub fn new(id: impl Into<TableId>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            fields: Vec::new(),
        }
    }

    /// Adds a field, validating it against the fields added so far.
    pub fn add_field(mut self, field: FieldSchema) -> Result<Self> {
        if field.id.is_empty() {
            return Err(Error::invalid_schema("field id must not be empty"));
        }
        if self.fields.iter().any(|f| f.id == field.id) {
            return Err(Error::invalid_schema(format!(
                "duplicate field id: {}",
                field.id
            )));
        }
        if self.fields.iter().any(|f| f.name == field.name) {
            return Err(Error::invalid_schema(format!(
                "duplicate field name: {}",
                field.name
            )));
        }
        validate_field(&field)?;
        self.fields.push(field);
        Ok(self)
    }

    /// Finishes the schema, validating derived fields' local references.
    pub fn build(self) -> Result<TableSchema> {
        let schema = TableSchema {
            id: self.id,
            name: self.name,
            fields: self.fields,
        };
        for field in &schema.fields {
            if let Some(link_field_id) = field.kind.via_link_field() {
                let link = schema.field(link_field_id).ok_or_else(|| {
                    Error::invalid_schema(format!(
                        "field {} reads through unknown link field {}",
                        field.id, link_field_id
                    ))
                })?;
                if link.as_link().is_none() {
                    return Err(Error::invalid_schema(format!(
                        "field {} reads through {}, which is not a link field",
                        field.id, link_field_id
                    )));
                }
            }
        }
        Ok(schema)
    }
}

/// Validates one field definition in isolation.
pub fn validate_field(field: &FieldSchema) -> Result<()> {
    match &field.kind {
        FieldKind::Link { link } => {
            if link.foreign_table_id.is_empty() {
                return Err(Error::invalid_schema(format!(
                    "link field {} has no foreign table",
                    field.id
                )));
            }
            if link.self_key_name.is_empty() || link.foreign_key_name.is_empty() {
                return Err(Error::invalid_schema(format!(
                    "link field {} is missing key column names",
                    field.id
                )));
            }
            match link.relationship {
                Relationship::ManyMany => {
                    if link.fk_host_table_name.is_none() {
                        return Err(Error::invalid_schema(format!(
                            "manyMany link field {} needs a junction table name",
                            field.id
                        )));
                    }
                }
                Relationship::ManyOne | Relationship::OneMany | Relationship::OneOne => {
                    if link.symmetric_field_id.is_none() {
                        return Err(Error::invalid_schema(format!(
                            "{:?} link field {} needs a symmetric field",
                            link.relationship, field.id
                        )));
                    }
                    if link.fk_host_table_name.is_some() {
                        return Err(Error::invalid_schema(format!(
                            "scalar link field {} must not declare a junction table",
                            field.id
                        )));
                    }
                }
            }
        }
        FieldKind::Formula { expression } => {
            if expression.trim().is_empty() {
                return Err(Error::invalid_schema(format!(
                    "formula field {} has an empty expression",
                    field.id
                )));
            }
        }
        _ => {}
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::field::{Aggregation, ConcreteType, LinkDescriptor};

    fn many_many_link(id: &str) -> FieldSchema {
        FieldSchema::new(
            id,
            format!("Link {}", id),
            FieldKind::Link {
                link: LinkDescriptor {
                    relationship: Relationship::ManyMany,
                    foreign_table_id: "tblB".into(),
                    symmetric_field_id: Some("fldSym".into()),
                    self_key_name: "__fk_self".into(),
                    foreign_key_name: "__fk_foreign".into(),
                    fk_host_table_name: Some("jct_x".into()),
                    lookup_field_id: "fldTitle".into(),
                },
            },
        )
    }

    #[test]
    fn test_builder_rejects_duplicates() {
        let builder = TableSchemaBuilder::new("tblA", "A")
            .add_field(FieldSchema::concrete("fld1", "Name", ConcreteType::Text))
            .unwrap();
        let err = builder
            .add_field(FieldSchema::concrete("fld1", "Other", ConcreteType::Text))
            .unwrap_err();
        assert!(err.to_string().contains("duplicate field id"));
    }

    #[test]
    fn test_builder_rejects_unknown_link_reference() {
        let err = TableSchemaBuilder::new("tblA", "A")
            .add_field(FieldSchema::new(
                "fldC",
                "Count",
                FieldKind::Count {
                    link_field_id: "fldMissing".into(),
                },
            ))
            .unwrap()
            .build()
            .unwrap_err();
        assert!(err.to_string().contains("unknown link field"));
    }

    #[test]
    fn test_builder_accepts_rollup_through_link() {
        let schema = TableSchemaBuilder::new("tblA", "A")
            .add_field(many_many_link("fldL"))
            .unwrap()
            .add_field(FieldSchema::new(
                "fldR",
                "Total",
                FieldKind::Rollup {
                    link_field_id: "fldL".into(),
                    foreign_field_id: "fldAmount".into(),
                    aggregation: Aggregation::Sum,
                },
            ))
            .unwrap()
            .build()
            .unwrap();
        assert_eq!(schema.derived_fields().count(), 1);
        assert_eq!(schema.link_fields().count(), 1);
    }

    #[test]
    fn test_many_many_requires_junction() {
        let mut field = many_many_link("fldL");
        if let FieldKind::Link { link } = &mut field.kind {
            link.fk_host_table_name = None;
        }
        assert!(validate_field(&field).is_err());
    }

    #[test]
    fn test_scalar_link_requires_symmetric() {
        let mut field = many_many_link("fldL");
        if let FieldKind::Link { link } = &mut field.kind {
            link.relationship = Relationship::ManyOne;
            link.fk_host_table_name = None;
            link.symmetric_field_id = None;
        }
        assert!(validate_field(&field).is_err());
    }
}
