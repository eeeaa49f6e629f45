//! Referential-integrity lookups materialized before any source row is read.

use crate::db_types::{ColumnReader, CompositeKey};
use crate::error::MigrationError;
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};

/// Extracts the key from one lookup row. `Ok(None)` skips rows with null keys.
pub type KeyExtractor = fn(&dyn ColumnReader) -> Result<Option<CompositeKey>, String>;
/// Extracts a `(key, resolved id)` pair from one lookup row.
pub type EntryExtractor = fn(&dyn ColumnReader) -> Result<Option<(CompositeKey, i32)>, String>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LookupOrigin {
    /// Already-migrated tables in PostgreSQL.
    Target,
    /// Legacy cross-reference tables read from SQL Server.
    Source,
}

#[derive(Clone, Copy)]
pub enum LookupShape {
    Set(KeyExtractor),
    Map(EntryExtractor),
}

#[derive(Clone, Copy)]
pub struct LookupSpec {
    pub name: &'static str,
    pub origin: LookupOrigin,
    pub query: &'static str,
    pub shape: LookupShape,
}

impl LookupSpec {
    pub const fn target_set(name: &'static str, query: &'static str, key: KeyExtractor) -> Self {
        Self {
            name,
            origin: LookupOrigin::Target,
            query,
            shape: LookupShape::Set(key),
        }
    }

    pub const fn target_map(name: &'static str, query: &'static str, entry: EntryExtractor) -> Self {
        Self {
            name,
            origin: LookupOrigin::Target,
            query,
            shape: LookupShape::Map(entry),
        }
    }

    pub const fn source_map(name: &'static str, query: &'static str, entry: EntryExtractor) -> Self {
        Self {
            name,
            origin: LookupOrigin::Source,
            query,
            shape: LookupShape::Map(entry),
        }
    }
}

// --- Common Extractors ---

pub fn int_key(row: &dyn ColumnReader) -> Result<Option<CompositeKey>, String> {
    Ok(row.get_i32(0)?.map(CompositeKey::from))
}

pub fn int_pair_entry(row: &dyn ColumnReader) -> Result<Option<(CompositeKey, i32)>, String> {
    match (row.get_i32(0)?, row.get_i32(1)?) {
        (Some(key), Some(value)) => Ok(Some((CompositeKey::from(key), value))),
        _ => Ok(None),
    }
}

// --- Store Access ---

/// A connection that can run a lookup query and hand every row to a visitor.
#[async_trait]
pub trait LookupStore: Send {
    async fn visit_rows(
        &mut self,
        query: &str,
        visit: &mut (dyn for<'r> FnMut(&'r dyn ColumnReader) -> Result<(), String> + Send),
    ) -> Result<u64, String>;
}

// --- Materialized Context ---

/// Immutable for the duration of a run once built.
#[derive(Debug, Default, Clone)]
pub struct LookupContext {
    sets: HashMap<&'static str, HashSet<CompositeKey>>,
    maps: HashMap<&'static str, HashMap<CompositeKey, i32>>,
}

impl LookupContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, name: &str, key: &CompositeKey) -> bool {
        self.sets
            .get(name)
            .map(|set| set.contains(key))
            .unwrap_or(false)
    }

    pub fn resolve(&self, name: &str, key: &CompositeKey) -> Option<i32> {
        self.maps.get(name).and_then(|map| map.get(key)).copied()
    }

    pub fn len_of(&self, name: &str) -> usize {
        self.sets
            .get(name)
            .map(HashSet::len)
            .or_else(|| self.maps.get(name).map(HashMap::len))
            .unwrap_or(0)
    }

    pub fn with_set<K, I>(mut self, name: &'static str, keys: I) -> Self
    where
        K: Into<CompositeKey>,
        I: IntoIterator<Item = K>,
    {
        self.sets
            .entry(name)
            .or_default()
            .extend(keys.into_iter().map(Into::into));
        self
    }

    /// Adds map entries; an existing key keeps its first value.
    pub fn with_map<K, I>(mut self, name: &'static str, entries: I) -> Self
    where
        K: Into<CompositeKey>,
        I: IntoIterator<Item = (K, i32)>,
    {
        let map = self.maps.entry(name).or_default();
        for (key, value) in entries {
            map.entry(key.into()).or_insert(value);
        }
        self
    }
}

/// Runs every lookup query to completion. An empty table yields an empty
/// set; any query or extraction failure aborts the whole build.
pub async fn build_lookups(
    specs: &[LookupSpec],
    target: &mut dyn LookupStore,
    source: &mut dyn LookupStore,
) -> Result<LookupContext, MigrationError> {
    let mut context = LookupContext::new();

    for spec in specs {
        let store: &mut dyn LookupStore = match spec.origin {
            LookupOrigin::Target => &mut *target,
            LookupOrigin::Source => &mut *source,
        };

        match spec.shape {
            LookupShape::Set(extract) => {
                let mut keys = HashSet::new();
                store
                    .visit_rows(spec.query, &mut |row: &dyn ColumnReader| {
                        if let Some(key) = extract(row)? {
                            keys.insert(key);
                        }
                        Ok(())
                    })
                    .await
                    .map_err(|e| MigrationError::lookup(spec.name, e))?;
                log::info!("Built {} lookup with {} keys", spec.name, keys.len());
                context.sets.insert(spec.name, keys);
            }
            LookupShape::Map(extract) => {
                let mut entries: HashMap<CompositeKey, i32> = HashMap::new();
                store
                    .visit_rows(spec.query, &mut |row: &dyn ColumnReader| {
                        if let Some((key, value)) = extract(row)? {
                            entries.entry(key).or_insert(value);
                        }
                        Ok(())
                    })
                    .await
                    .map_err(|e| MigrationError::lookup(spec.name, e))?;
                log::info!("Built {} lookup with {} entries", spec.name, entries.len());
                context.maps.insert(spec.name, entries);
            }
        }
    }

    Ok(context)
}
