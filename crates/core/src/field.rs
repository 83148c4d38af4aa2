//! Field descriptors.
//!
//! A field is a typed column on a table. Concrete fields store what the
//! user typed; link fields encode a relationship to a foreign table;
//! derived fields (formula, lookup, rollup, count) are computed from
//! other fields and are never written directly.

use serde::{Deserialize, Serialize};

use crate::id::{FieldId, TableId};

/// Cell types of concrete (user-entered) fields.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ConcreteType {
    /// UTF-8 text.
    Text,
    /// Floating-point number.
    Number,
    /// Date stored as Unix timestamp in milliseconds.
    Date,
    /// Boolean checkbox.
    Checkbox,
    /// One option out of a fixed set.
    SingleSelect,
    /// Several options out of a fixed set.
    MultiSelect,
    /// Attachment references.
    Attachment,
    /// A collaborator reference.
    User,
}

/// Cardinality of a relationship between two tables.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Relationship {
    ManyMany,
    ManyOne,
    OneMany,
    OneOne,
}

impl Relationship {
    /// Returns true when the owning side's cell holds an array of links.
    pub fn is_multi(self) -> bool {
        matches!(self, Relationship::ManyMany | Relationship::OneMany)
    }

    /// Returns the relationship as seen from the foreign table.
    pub fn symmetric(self) -> Relationship {
        match self {
            Relationship::ManyMany => Relationship::ManyMany,
            Relationship::ManyOne => Relationship::OneMany,
            Relationship::OneMany => Relationship::ManyOne,
            Relationship::OneOne => Relationship::OneOne,
        }
    }

    /// Returns true when the owning row carries a scalar foreign-key column.
    pub fn fk_on_self(self) -> bool {
        matches!(self, Relationship::ManyOne | Relationship::OneOne)
    }

    /// Returns true when the foreign rows carry the scalar foreign-key column.
    pub fn fk_on_foreign(self) -> bool {
        matches!(self, Relationship::OneMany)
    }
}

/// Declaration of a link field's relationship and physical storage.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LinkDescriptor {
    /// Cardinality of the relationship, seen from the declaring table.
    pub relationship: Relationship,
    /// The table on the other side.
    pub foreign_table_id: TableId,
    /// The peer link field on the foreign table, kept in lockstep.
    /// Absent for one-way manyMany links.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub symmetric_field_id: Option<FieldId>,
    /// Column holding this side's key (junction column, or the scalar FK
    /// column on whichever row carries it).
    pub self_key_name: String,
    /// Column holding the other side's key.
    pub foreign_key_name: String,
    /// Junction table name; present exactly for manyMany.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fk_host_table_name: Option<String>,
    /// Field on the foreign table whose value is cached as the link title.
    pub lookup_field_id: FieldId,
}

impl LinkDescriptor {
    /// Returns true when cells of this field hold arrays.
    pub fn is_multi(&self) -> bool {
        self.relationship.is_multi()
    }
}

/// Aggregations available to rollup fields.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Aggregation {
    Sum,
    Avg,
    Count,
    Min,
    Max,
    And,
    Or,
    Concat,
}

/// What kind of field this is and how its value comes to be.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum FieldKind {
    /// A stored, user-entered value.
    #[serde(rename_all = "camelCase")]
    Concrete { data_type: ConcreteType },
    /// A relationship to a foreign table.
    Link {
        #[serde(flatten)]
        link: LinkDescriptor,
    },
    /// Computed from an expression over sibling fields.
    #[serde(rename_all = "camelCase")]
    Formula { expression: String },
    /// Projects a field from the linked record(s).
    #[serde(rename_all = "camelCase")]
    Lookup {
        link_field_id: FieldId,
        foreign_field_id: FieldId,
    },
    /// Aggregates a field over the linked record(s).
    #[serde(rename_all = "camelCase")]
    Rollup {
        link_field_id: FieldId,
        foreign_field_id: FieldId,
        aggregation: Aggregation,
    },
    /// Cardinality of a link field's cell.
    #[serde(rename_all = "camelCase")]
    Count { link_field_id: FieldId },
}

impl FieldKind {
    /// Returns true when values of this field are computed, not written.
    pub fn is_derived(&self) -> bool {
        matches!(
            self,
            FieldKind::Formula { .. }
                | FieldKind::Lookup { .. }
                | FieldKind::Rollup { .. }
                | FieldKind::Count { .. }
        )
    }

    /// Returns the link field this derived field reads through, if any.
    pub fn via_link_field(&self) -> Option<&FieldId> {
        match self {
            FieldKind::Lookup { link_field_id, .. }
            | FieldKind::Rollup { link_field_id, .. }
            | FieldKind::Count { link_field_id } => Some(link_field_id),
            _ => None,
        }
    }
}

/// A field (column) definition on a table.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FieldSchema {
    pub id: FieldId,
    pub name: String,
    #[serde(flatten)]
    pub kind: FieldKind,
    #[serde(default)]
    pub required: bool,
}

impl FieldSchema {
    /// Creates a field definition.
    pub fn new(id: impl Into<FieldId>, name: impl Into<String>, kind: FieldKind) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            kind,
            required: false,
        }
    }

    /// Creates a concrete field definition.
    pub fn concrete(
        id: impl Into<FieldId>,
        name: impl Into<String>,
        data_type: ConcreteType,
    ) -> Self {
        Self::new(id, name, FieldKind::Concrete { data_type })
    }

    /// Marks the field as required.
    pub fn with_required(mut self) -> Self {
        self.required = true;
        self
    }

    /// Returns true when this field is computed.
    pub fn is_computed(&self) -> bool {
        self.kind.is_derived()
    }

    /// Returns the link descriptor if this is a link field.
    pub fn as_link(&self) -> Option<&LinkDescriptor> {
        match &self.kind {
            FieldKind::Link { link } => Some(link),
            _ => None,
        }
    }
}
