//! Mapping metadata derived from [`Entity`] implementations.
//!
//! [`EntityMetadata`] is the resolved, validated form of an entity's
//! `fields()`: column positions, key columns, foreign keys and concurrency
//! tokens. It is built once per type and cached in a [`MetadataRegistry`].

use crate::error::TrackerError;
use crate::identity::{EntityKey, IdentityKey};
use crate::entry::EntryId;
use rowtrack_core::{Entity, FieldInfo, Generated, Value};
use std::any::TypeId;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, RwLock};

/// A resolved foreign key reference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForeignKey {
    /// Position of the dependent column in the entity's fields.
    pub column: usize,
    /// Table of the principal.
    pub principal_table: &'static str,
    /// Referenced column of the principal.
    pub principal_column: &'static str,
}

/// Validated mapping metadata for one entity type.
pub struct EntityMetadata {
    pub table: &'static str,
    pub type_name: &'static str,
    pub(crate) type_id: TypeId,
    pub fields: &'static [FieldInfo],
    /// Positions of the primary key columns, in declaration order.
    pub key: Vec<usize>,
    pub foreign_keys: Vec<ForeignKey>,
    /// Positions of the concurrency token columns.
    pub concurrency_tokens: Vec<usize>,
}

impl EntityMetadata {
    /// Build and validate metadata for `E`.
    pub fn of<E: Entity>() -> Result<Self, TrackerError> {
        let table = E::TABLE_NAME;
        let fields = E::fields();

        let mut key = Vec::new();
        let mut foreign_keys = Vec::new();
        let mut concurrency_tokens = Vec::new();

        for (idx, field) in fields.iter().enumerate() {
            if fields[..idx]
                .iter()
                .any(|other| other.column_name == field.column_name)
            {
                return Err(TrackerError::mapping(
                    table,
                    format!("column '{}' is mapped twice", field.column_name),
                ));
            }
            if field.generated != Generated::Never && !field.sql_type.can_be_generated() {
                return Err(TrackerError::mapping(
                    table,
                    format!(
                        "column '{}' of type {} cannot be database-generated",
                        field.column_name,
                        field.sql_type.sql_name()
                    ),
                ));
            }
            if field.primary_key {
                key.push(idx);
            }
            if field.concurrency_token {
                concurrency_tokens.push(idx);
            }
            if let Some((principal_table, principal_column)) = field.foreign_key_target() {
                foreign_keys.push(ForeignKey {
                    column: idx,
                    principal_table,
                    principal_column,
                });
            }
        }

        if key.is_empty() {
            return Err(TrackerError::mapping(table, "entity has no primary key"));
        }

        tracing::debug!(
            table = table,
            columns = fields.len(),
            key_columns = key.len(),
            foreign_keys = foreign_keys.len(),
            "Resolved entity metadata"
        );

        Ok(Self {
            table,
            type_name: std::any::type_name::<E>(),
            type_id: TypeId::of::<E>(),
            fields,
            key,
            foreign_keys,
            concurrency_tokens,
        })
    }

    /// Position of a column by name.
    pub fn index_of(&self, column: &str) -> Option<usize> {
        self.fields.iter().position(|f| f.column_name == column)
    }

    pub fn column_name(&self, index: usize) -> &'static str {
        self.fields[index].column_name
    }

    /// Read an instance's values in field order.
    pub fn read_values<E: Entity>(&self, entity: &E) -> Result<Vec<Value>, TrackerError> {
        let mut values: Vec<Option<Value>> = vec![None; self.fields.len()];
        for (column, value) in entity.to_row() {
            let Some(idx) = self.index_of(column) else {
                return Err(TrackerError::mapping(
                    self.table,
                    format!("to_row produced unmapped column '{column}'"),
                ));
            };
            values[idx] = Some(value);
        }
        values
            .into_iter()
            .enumerate()
            .map(|(idx, value)| {
                value.ok_or_else(|| {
                    TrackerError::mapping(
                        self.table,
                        format!("to_row is missing column '{}'", self.column_name(idx)),
                    )
                })
            })
            .collect()
    }

    /// Key column values out of a full value vector.
    pub fn key_values(&self, values: &[Value]) -> Vec<Value> {
        self.key.iter().map(|&idx| values[idx].clone()).collect()
    }

    /// Whether any generated key column still holds an unassigned value.
    pub fn has_unassigned_key(&self, values: &[Value]) -> bool {
        self.key.iter().any(|&idx| {
            self.fields[idx].generated != Generated::Never && values[idx].is_unassigned_key()
        })
    }

    /// Resolve the identity an entry with these values holds.
    pub fn resolve_key(&self, values: &[Value], entry: EntryId) -> EntityKey {
        if self.has_unassigned_key(values) {
            EntityKey::Temporary {
                table: self.table,
                entry,
            }
        } else {
            EntityKey::Persistent(self.identity_of(values))
        }
    }

    pub fn identity_of(&self, values: &[Value]) -> IdentityKey {
        IdentityKey::new(self.table, &self.key_values(values))
    }
}

impl fmt::Debug for EntityMetadata {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EntityMetadata")
            .field("table", &self.table)
            .field("type_name", &self.type_name)
            .field("columns", &self.fields.len())
            .field("key", &self.key)
            .field("foreign_keys", &self.foreign_keys)
            .finish()
    }
}

/// Cache of resolved metadata, keyed by entity type.
///
/// Shareable between contexts through [`ContextConfig::registry`](crate::ContextConfig::registry).
#[derive(Debug, Default)]
pub struct MetadataRegistry {
    entries: RwLock<HashMap<TypeId, Arc<EntityMetadata>>>,
}

impl MetadataRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Metadata for `E`, resolving and caching it on first use.
    pub fn get<E: Entity>(&self) -> Result<Arc<EntityMetadata>, TrackerError> {
        let type_id = TypeId::of::<E>();
        {
            let entries = match self.entries.read() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            if let Some(meta) = entries.get(&type_id) {
                return Ok(Arc::clone(meta));
            }
        }

        let meta = Arc::new(EntityMetadata::of::<E>()?);
        let mut entries = match self.entries.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        Ok(Arc::clone(entries.entry(type_id).or_insert(meta)))
    }

    pub fn len(&self) -> usize {
        match self.entries.read() {
            Ok(guard) => guard.len(),
            Err(poisoned) => poisoned.into_inner().len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
