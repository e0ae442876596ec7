//! Hosted attribute-value store backend.
//!
//! The store holds string-only attribute pairs per named item within a
//! domain, reachable over the network through the [`AttributeApi`] trait.
//! Items are addressed by the derived composite identity string; values go
//! through the resource's lossless string encoding on the way in and out.
//!
//! Conditional writes ([`Expected`]) stand in for transactions: every
//! mutation is a read followed by a compare-and-set on the version attribute
//! (or on an identity attribute for unversioned resources). A failed
//! condition means a concurrent writer got there first and surfaces the same
//! way a missing row does.
//!
//! This backend cannot update two items atomically, so it reports no
//! aggregation support; tables with aggregation rules are rejected at model
//! construction time.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use tracing::debug;

use crate::backend::{Backend, FetchResult, InsertOutcome};
use crate::error::Result;
use crate::query::{Filter, Query, WriteSet, apply_write_set};
use crate::resource::Identity;
use crate::table::TableDef;

/// A conditional-write precondition on a single attribute. `value: None`
/// requires the attribute to be absent (which holds when the whole item is
/// absent).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Expected {
    pub name: String,
    pub value: Option<String>,
}

/// The wire surface of the hosted store: string attributes per named item,
/// with conditional puts and deletes. Conditional operations return whether
/// the condition held; transport failures are errors.
#[async_trait]
pub trait AttributeApi: Send + Sync {
    async fn get(&self, domain: &str, item: &str) -> Result<Option<Vec<(String, String)>>>;

    /// Replace the item's attributes wholesale. With `expected`, only when
    /// the condition holds.
    async fn put(
        &self,
        domain: &str,
        item: &str,
        attrs: &[(String, String)],
        expected: Option<&Expected>,
    ) -> Result<bool>;

    async fn delete(&self, domain: &str, item: &str, expected: Option<&Expected>) -> Result<bool>;

    /// Every item in the domain. Listing consistency is the store's, not
    /// ours: concurrent writers may or may not be visible.
    async fn scan(&self, domain: &str) -> Result<Vec<(String, Vec<(String, String)>)>>;
}

/// In-process [`AttributeApi`] with the hosted store's conditional-write
/// semantics. The test double for everything above the wire.
#[derive(Default)]
pub struct InMemoryAttributeApi {
    domains: Mutex<HashMap<String, BTreeMap<String, BTreeMap<String, String>>>>,
}

impl InMemoryAttributeApi {
    pub fn new() -> Self {
        Self::default()
    }

    fn condition_holds(
        items: &BTreeMap<String, BTreeMap<String, String>>,
        item: &str,
        expected: &Expected,
    ) -> bool {
        let current = items.get(item).and_then(|attrs| attrs.get(&expected.name));
        current.map(String::as_str) == expected.value.as_deref()
    }
}

#[async_trait]
impl AttributeApi for InMemoryAttributeApi {
    async fn get(&self, domain: &str, item: &str) -> Result<Option<Vec<(String, String)>>> {
        let domains = self.domains.lock();
        Ok(domains.get(domain).and_then(|items| {
            items
                .get(item)
                .map(|attrs| attrs.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
        }))
    }

    async fn put(
        &self,
        domain: &str,
        item: &str,
        attrs: &[(String, String)],
        expected: Option<&Expected>,
    ) -> Result<bool> {
        let mut domains = self.domains.lock();
        let items = domains.entry(domain.to_string()).or_default();
        if let Some(expected) = expected {
            if !Self::condition_holds(items, item, expected) {
                return Ok(false);
            }
        }
        items.insert(
            item.to_string(),
            attrs.iter().map(|(k, v)| (k.clone(), v.clone())).collect(),
        );
        Ok(true)
    }

    async fn delete(&self, domain: &str, item: &str, expected: Option<&Expected>) -> Result<bool> {
        let mut domains = self.domains.lock();
        let items = match domains.get_mut(domain) {
            Some(items) => items,
            None => return Ok(expected.is_none()),
        };
        if let Some(expected) = expected {
            if !Self::condition_holds(items, item, expected) {
                return Ok(false);
            }
        }
        items.remove(item);
        Ok(true)
    }

    async fn scan(&self, domain: &str) -> Result<Vec<(String, Vec<(String, String)>)>> {
        let domains = self.domains.lock();
        Ok(domains
            .get(domain)
            .map(|items| {
                items
                    .iter()
                    .map(|(name, attrs)| {
                        (
                            name.clone(),
                            attrs.iter().map(|(k, v)| (k.clone(), v.clone())).collect(),
                        )
                    })
                    .collect()
            })
            .unwrap_or_default())
    }
}

/// Backend over one attribute-store domain.
pub struct AttributeBackend {
    api: Arc<dyn AttributeApi>,
    domain: String,
}

impl AttributeBackend {
    pub fn new(api: Arc<dyn AttributeApi>, domain: &str) -> Self {
        Self {
            api,
            domain: domain.to_string(),
        }
    }

    async fn read_raw(&self, table: &TableDef, item: &str) -> Result<Option<Value>> {
        let attrs = self.api.get(&self.domain, item).await?;
        Ok(attrs.map(|attrs| {
            table
                .resource()
                .decode_item(attrs.iter().map(|(k, v)| (k.as_str(), v.as_str())))
        }))
    }

    /// The compare-and-set guard for a mutation of an existing item: the
    /// version attribute's current encoded value, falling back to the first
    /// identity attribute for unversioned resources.
    fn guard(table: &TableDef, current: &Value) -> Option<Expected> {
        let resource = table.resource();
        let attribute = resource
            .version_key()
            .or_else(|| resource.identity_keys().first().map(String::as_str))?;
        let field = resource.field(attribute)?;
        let value = current
            .get(attribute)
            .filter(|v| !v.is_null())
            .map(|v| field.encode(v));
        Some(Expected {
            name: attribute.to_string(),
            value,
        })
    }
}

#[async_trait]
impl Backend for AttributeBackend {
    fn supports_aggregation(&self) -> bool {
        false
    }

    async fn get(&self, table: &TableDef, identity: &Identity) -> Result<Option<Value>> {
        let item = identity.composite(table.resource());
        Ok(self
            .read_raw(table, &item)
            .await?
            .filter(|doc| identity.matches(doc))
            .and_then(|doc| table.finalize_row(doc)))
    }

    async fn insert(
        &self,
        table: &TableDef,
        item: &Value,
        update: Option<&WriteSet>,
    ) -> Result<InsertOutcome> {
        let resource = table.resource();
        let name = resource.identity_of(item)?.composite(resource);

        match self.read_raw(table, &name).await? {
            None => {
                // Condition on the first identity attribute being absent so
                // two concurrent creates cannot both win.
                let must_not_exist = Expected {
                    name: resource.identity_keys()[0].clone(),
                    value: None,
                };
                let attrs = resource.encode_item(item);
                if self
                    .api
                    .put(&self.domain, &name, &attrs, Some(&must_not_exist))
                    .await?
                {
                    Ok(InsertOutcome::Inserted)
                } else {
                    debug!(domain = %self.domain, "create lost conditional put");
                    Ok(InsertOutcome::Existed)
                }
            }
            Some(existing) => match update {
                None => Ok(InsertOutcome::Existed),
                Some(changes) => {
                    let guard = Self::guard(table, &existing);
                    let mut new = existing;
                    apply_write_set(&mut new, changes);
                    let attrs = resource.encode_item(&new);
                    if self
                        .api
                        .put(&self.domain, &name, &attrs, guard.as_ref())
                        .await?
                    {
                        Ok(InsertOutcome::Updated)
                    } else {
                        Ok(InsertOutcome::Existed)
                    }
                }
            },
        }
    }

    async fn update(
        &self,
        table: &TableDef,
        identity: &Identity,
        changes: &WriteSet,
    ) -> Result<Option<Value>> {
        let item = identity.composite(table.resource());
        let existing = match self.read_raw(table, &item).await? {
            Some(doc) if identity.matches(&doc) => doc,
            _ => return Ok(None),
        };

        let guard = Self::guard(table, &existing);
        let mut new = existing;
        apply_write_set(&mut new, changes);
        let attrs = table.resource().encode_item(&new);
        if !self
            .api
            .put(&self.domain, &item, &attrs, guard.as_ref())
            .await?
        {
            // Lost the compare-and-set: a concurrent writer changed the
            // item between our read and write.
            return Ok(None);
        }
        Ok(Some(table.finalize_row(new.clone()).unwrap_or(new)))
    }

    async fn delete(&self, table: &TableDef, identity: &Identity) -> Result<bool> {
        let item = identity.composite(table.resource());
        let existing = match self.read_raw(table, &item).await? {
            Some(doc) if identity.matches(&doc) => doc,
            _ => return Ok(false),
        };
        let guard = Self::guard(table, &existing);
        self.api.delete(&self.domain, &item, guard.as_ref()).await
    }

    async fn fetch(&self, table: &TableDef, query: &Query, limit: usize) -> Result<FetchResult> {
        let resource = table.resource();
        let mut matched: Vec<Value> = self
            .api
            .scan(&self.domain)
            .await?
            .into_iter()
            .map(|(_, attrs)| {
                resource.decode_item(attrs.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            })
            .filter_map(|doc| table.finalize_row(doc))
            .filter(|doc| query.admits(doc))
            .collect();
        query.sort(&mut matched);
        let exhausted = matched.len() <= limit;
        matched.truncate(limit);
        Ok(FetchResult {
            rows: matched,
            exhausted,
        })
    }

    async fn count(&self, table: &TableDef, filters: &[(String, Filter)]) -> Result<u64> {
        let resource = table.resource();
        let count = self
            .api
            .scan(&self.domain)
            .await?
            .into_iter()
            .map(|(_, attrs)| {
                resource.decode_item(attrs.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            })
            .filter_map(|doc| table.finalize_row(doc))
            .filter(|doc| filters.iter().all(|(name, f)| f.matches(doc.get(name))))
            .count();
        Ok(count as u64)
    }

    async fn batch(
        &self,
        table: &TableDef,
        identities: &[Identity],
    ) -> Result<Vec<Option<Value>>> {
        let mut out = Vec::with_capacity(identities.len());
        for identity in identities {
            out.push(self.get(table, identity).await?);
        }
        Ok(out)
    }
}
