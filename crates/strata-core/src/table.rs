//! Table definitions: a [`Resource`] bound to a storage name, plus secondary
//! indexes, legacy-row defaults, nested-resource joins, and aggregation
//! rules.
//!
//! Table definitions are constructed once at startup and are immutable:
//! every builder method consumes the definition and returns a new value, so
//! definitions are safely shareable across threads.

use serde::Serialize;
use serde_json::Value;
use tracing::error;

use crate::error::{Error, QueryError, Result};
use crate::query::Filter;
use crate::resource::{FieldKind, Resource};

/// The aggregation operation kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AggregateOp {
    Count,
}

/// A rule maintaining a denormalized counter on a target table.
///
/// Before and after every mutation the rule is evaluated as a boolean
/// membership predicate (static filter matches and every key-mapped source
/// attribute is non-null). The signed difference between after/before
/// membership drives a plus-or-minus-one update to the target counter,
/// executed in the same transaction as the primary mutation.
#[derive(Debug, Clone)]
pub struct Aggregation {
    /// Storage name of the table holding the counter.
    pub target: String,
    pub op: AggregateOp,
    /// The numeric counter field on the target.
    pub field: String,
    /// Mapping from this table's attributes to the target's identity keys,
    /// in the target's identity-key order.
    pub key: Vec<(String, String)>,
    /// Static membership filter evaluated against this table's rows.
    pub filter: Vec<(String, Filter)>,
}

/// A single counter adjustment produced by re-evaluating an [`Aggregation`]
/// against old/new row images.
#[derive(Debug, Clone, PartialEq)]
pub struct AggregationUpdate {
    pub target: String,
    pub field: String,
    /// Target identity key values, in the aggregation's declared order.
    pub key: Vec<(String, Value)>,
    pub delta: i64,
}

/// A join against a nested sub-resource, selected through a LEFT OUTER JOIN
/// and decoded as a nested object (or `null` when the related row is absent).
#[derive(Debug, Clone)]
pub struct Join {
    pub alias: String,
    /// Storage name of the joined table.
    pub table: String,
    pub resource: Resource,
    /// Attribute on this table.
    pub local_key: String,
    /// Attribute on the joined table.
    pub foreign_key: String,
}

/// A resource bound to backend storage.
#[derive(Debug, Clone)]
pub struct TableDef {
    resource: Resource,
    storage_name: String,
    indexes: Vec<Vec<String>>,
    defaults: Vec<(String, Value)>,
    joins: Vec<Join>,
    aggregations: Vec<Aggregation>,
}

impl TableDef {
    pub fn new(storage_name: &str, resource: Resource) -> Self {
        Self {
            resource,
            storage_name: storage_name.to_string(),
            indexes: Vec::new(),
            defaults: Vec::new(),
            joins: Vec::new(),
            aggregations: Vec::new(),
        }
    }

    pub fn resource(&self) -> &Resource {
        &self.resource
    }

    pub fn storage_name(&self) -> &str {
        &self.storage_name
    }

    pub fn indexes(&self) -> &[Vec<String>] {
        &self.indexes
    }

    pub fn defaults(&self) -> &[(String, Value)] {
        &self.defaults
    }

    pub fn joins(&self) -> &[Join] {
        &self.joins
    }

    /// Aggregations, sorted by target table name. The deterministic order
    /// avoids lock-ordering deadlocks across concurrent transactions
    /// touching the same pair of tables.
    pub fn aggregations(&self) -> &[Aggregation] {
        &self.aggregations
    }

    /// Declare a secondary index over the given attribute sequence.
    pub fn index(mut self, keys: &[&str]) -> Result<Self> {
        for key in keys {
            if self.resource.field(key).is_none() {
                return Err(QueryError::UnknownColumn {
                    table: self.storage_name.clone(),
                    column: (*key).to_string(),
                }
                .into());
            }
        }
        self.indexes.push(keys.iter().map(|k| k.to_string()).collect());
        Ok(self)
    }

    /// Declare a default used to backfill rows written before a schema
    /// migration added the attribute.
    pub fn migrate_default(mut self, attribute: &str, value: Value) -> Result<Self> {
        if self.resource.field(attribute).is_none() {
            return Err(QueryError::UnknownColumn {
                table: self.storage_name.clone(),
                column: attribute.to_string(),
            }
            .into());
        }
        self.defaults.push((attribute.to_string(), value));
        Ok(self)
    }

    /// Declare an aggregation rule. Rules are kept sorted by target name.
    pub fn aggregate(mut self, aggregation: Aggregation) -> Self {
        self.aggregations.push(aggregation);
        self.aggregations.sort_by(|a, b| a.target.cmp(&b.target));
        self
    }

    /// Declare a nested sub-resource join.
    pub fn join(mut self, join: Join) -> Result<Self> {
        if self.resource.field(&join.local_key).is_none() {
            return Err(QueryError::UnknownColumn {
                table: self.storage_name.clone(),
                column: join.local_key,
            }
            .into());
        }
        if join.resource.field(&join.foreign_key).is_none() {
            return Err(QueryError::UnknownColumn {
                table: join.table,
                column: join.foreign_key,
            }
            .into());
        }
        self.joins.push(join);
        Ok(self)
    }

    /// Resolve an attribute reference (`"attr"` or `"alias.attr"`) to the
    /// field kind it names, walking the join graph for qualified names.
    /// Unknown names are a build-time error, never a runtime one.
    pub fn resolve_column(&self, name: &str) -> Result<FieldKind> {
        match name.split_once('.') {
            None => self
                .resource
                .field(name)
                .map(|f| f.kind)
                .ok_or_else(|| {
                    QueryError::UnknownColumn {
                        table: self.storage_name.clone(),
                        column: name.to_string(),
                    }
                    .into()
                }),
            Some((alias, attr)) => {
                let join = self
                    .joins
                    .iter()
                    .find(|j| j.alias == alias)
                    .ok_or_else(|| {
                        Error::from(QueryError::UnknownAlias {
                            table: self.storage_name.clone(),
                            alias: alias.to_string(),
                        })
                    })?;
                join.resource.field(attr).map(|f| f.kind).ok_or_else(|| {
                    QueryError::UnknownColumn {
                        table: join.table.clone(),
                        column: attr.to_string(),
                    }
                    .into()
                })
            }
        }
    }

    /// Backfill declared defaults into a decoded row, then validate it.
    ///
    /// A row that still fails validation after defaulting is dropped with a
    /// logged error rather than raised: corrupt legacy rows are treated as
    /// "not visible" instead of crashing the caller.
    pub fn finalize_row(&self, mut row: Value) -> Option<Value> {
        if let Some(obj) = row.as_object_mut() {
            for (name, default) in &self.defaults {
                let missing = obj.get(name).map(Value::is_null).unwrap_or(true);
                if missing {
                    obj.insert(name.clone(), default.clone());
                }
            }
            // Joined sub-objects live outside the base resource schema;
            // detach them for validation and put them back afterwards.
            let mut nested = Vec::new();
            for join in &self.joins {
                if let Some(value) = obj.remove(&join.alias) {
                    nested.push((join.alias.clone(), value));
                }
            }
            match self.resource.validate(&row) {
                Ok(()) => {
                    if let Some(obj) = row.as_object_mut() {
                        for (alias, value) in nested {
                            obj.insert(alias, value);
                        }
                    }
                    Some(row)
                }
                Err(err) => {
                    error!(
                        table = %self.storage_name,
                        %err,
                        "dropping row that fails validation after defaulting"
                    );
                    None
                }
            }
        } else {
            error!(table = %self.storage_name, "dropping non-object row");
            None
        }
    }

    /// Evaluate every aggregation rule against old/new row images and
    /// return the counter adjustments the mutation implies, in target-name
    /// order. When the key-mapped target identity itself changed, the old
    /// target is decremented and the new one incremented.
    pub fn aggregation_deltas(
        &self,
        old: Option<&Value>,
        new: Option<&Value>,
    ) -> Vec<AggregationUpdate> {
        let mut updates = Vec::new();
        for agg in &self.aggregations {
            let before = membership(agg, old);
            let after = membership(agg, new);
            match (before, after) {
                (None, None) => {}
                (Some(key), None) => updates.push(adjustment(agg, key, -1)),
                (None, Some(key)) => updates.push(adjustment(agg, key, 1)),
                (Some(old_key), Some(new_key)) => {
                    if old_key != new_key {
                        updates.push(adjustment(agg, old_key, -1));
                        updates.push(adjustment(agg, new_key, 1));
                    }
                }
            }
        }
        updates
    }

    /// Declarative schema description for diffing tooling.
    pub fn state(&self) -> TableState {
        let primary_keys = self
            .resource
            .identity_keys()
            .iter()
            .filter_map(|name| {
                self.resource.field(name).map(|f| ColumnState {
                    name: name.clone(),
                    column_type: f.kind.type_name().to_string(),
                })
            })
            .collect();
        let columns = self
            .resource
            .fields()
            .iter()
            .map(|(name, field)| ColumnState {
                name: name.clone(),
                column_type: field.kind.type_name().to_string(),
            })
            .collect();
        let indexes = self
            .indexes
            .iter()
            .map(|keys| IndexState { keys: keys.clone() })
            .collect();
        TableState {
            name: self.storage_name.clone(),
            primary_keys,
            columns,
            indexes,
        }
    }
}

/// If the row is a member of the aggregation's subset, its target identity
/// key values; otherwise `None`. Membership requires the static filter to
/// match and every key-mapped source attribute to be non-null.
fn membership(agg: &Aggregation, row: Option<&Value>) -> Option<Vec<(String, Value)>> {
    let row = row?;
    for (name, filter) in &agg.filter {
        if !filter.matches(row.get(name)) {
            return None;
        }
    }
    let mut key = Vec::with_capacity(agg.key.len());
    for (source, target) in &agg.key {
        match row.get(source) {
            Some(v) if !v.is_null() => key.push((target.clone(), v.clone())),
            _ => return None,
        }
    }
    Some(key)
}

fn adjustment(agg: &Aggregation, key: Vec<(String, Value)>, delta: i64) -> AggregationUpdate {
    AggregationUpdate {
        target: agg.target.clone(),
        field: agg.field.clone(),
        key,
        delta,
    }
}

/// Declarative table description: primary keys, columns with types, and
/// index key lists. The shape is a contract schema-diffing tooling depends
/// on and must be preserved.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TableState {
    pub name: String,
    #[serde(rename = "primaryKeys")]
    pub primary_keys: Vec<ColumnState>,
    pub columns: Vec<ColumnState>,
    pub indexes: Vec<IndexState>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ColumnState {
    pub name: String,
    #[serde(rename = "type")]
    pub column_type: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IndexState {
    pub keys: Vec<String>,
}
