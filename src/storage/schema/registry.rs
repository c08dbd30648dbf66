//! Persisted schema catalog with a per-instance cache.
//!
//! Definitions live in the schema store as JSON under `[ELEMENT_ROW] + id`;
//! names resolve through `[NAME_ROW] + name`. Each instance caches what it
//! reads. A peer's change stays invisible to this instance until the
//! management log delivers an eviction for the changed ids; that delay is the
//! staleness window between instances.

use std::collections::BTreeSet;
use std::sync::Arc;

use parking_lot::lock_api::ArcMutexGuard;
use parking_lot::{Mutex, RawMutex, RwLock};
use rustc_hash::FxHashMap;
use tracing::{debug, trace};

use super::defs::{IndexDef, SchemaElement};
use super::types::SchemaStatus;
use crate::primitives::bytes::ord::get_u64_be;
use crate::primitives::kcv::{Entry, KeyColumnValueStore};
use crate::types::{PenumbraError, Result, SchemaId};

const ELEMENT_ROW: u8 = 0x01;
const NAME_ROW: u8 = 0x02;
const DEF_COLUMN: &[u8] = b"def";
const ID_COLUMN: &[u8] = b"id";

/// Guard serializing writers of one schema element within the process.
pub type ElementGuard = ArcMutexGuard<RawMutex, ()>;

/// A definition to persist, with the name it was stored under before.
#[derive(Clone, Debug)]
pub struct SchemaWrite {
    pub element: SchemaElement,
    pub previous_name: Option<String>,
}

#[derive(Default)]
struct SchemaCache {
    by_id: FxHashMap<SchemaId, Arc<SchemaElement>>,
    by_name: FxHashMap<String, SchemaId>,
    index_ids: Option<BTreeSet<SchemaId>>,
}

/// Schema catalog shared by the transactions of one instance.
pub struct SchemaRegistry {
    store: Arc<dyn KeyColumnValueStore>,
    cache: RwLock<SchemaCache>,
    element_locks: Mutex<FxHashMap<SchemaId, Arc<Mutex<()>>>>,
}

impl SchemaRegistry {
    /// Opens the catalog over `store`.
    pub fn new(store: Arc<dyn KeyColumnValueStore>) -> Self {
        Self {
            store,
            cache: RwLock::new(SchemaCache::default()),
            element_locks: Mutex::new(FxHashMap::default()),
        }
    }

    /// Backing store.
    pub fn store(&self) -> &Arc<dyn KeyColumnValueStore> {
        &self.store
    }

    /// Row key of an element definition.
    pub fn element_key(id: SchemaId) -> Vec<u8> {
        let mut key = Vec::with_capacity(9);
        key.push(ELEMENT_ROW);
        key.extend_from_slice(&id.0.to_be_bytes());
        key
    }

    /// Column holding an element definition.
    pub fn definition_column() -> &'static [u8] {
        DEF_COLUMN
    }

    /// Row key of a name entry.
    pub fn name_key(name: &str) -> Vec<u8> {
        name_key(name)
    }

    /// Column holding the id a name resolves to.
    pub fn name_column() -> &'static [u8] {
        ID_COLUMN
    }

    /// Element named `name` read from the store, bypassing the cache, with its
    /// serialized form.
    pub fn load_by_name(&self, name: &str) -> Result<Option<(SchemaElement, Vec<u8>)>> {
        let Some(raw_id) = self.store.get(&name_key(name), ID_COLUMN)? else {
            return Ok(None);
        };
        let id = SchemaId(get_u64_be(&raw_id)?);
        let Some(raw) = self.read_raw(id)? else {
            return Ok(None);
        };
        let element: SchemaElement = serde_json::from_slice(&raw)?;
        if element.name() != name {
            return Ok(None);
        }
        Ok(Some((element, raw)))
    }

    /// Element by id, from cache or store.
    pub fn get(&self, id: SchemaId) -> Result<Option<Arc<SchemaElement>>> {
        if let Some(hit) = self.cache.read().by_id.get(&id) {
            trace!(id = id.0, "schema.cache.hit");
            return Ok(Some(Arc::clone(hit)));
        }
        let Some(raw) = self.read_raw(id)? else {
            return Ok(None);
        };
        let element: SchemaElement = serde_json::from_slice(&raw)?;
        Ok(Some(self.cache_element(element)))
    }

    /// Element by name.
    pub fn get_by_name(&self, name: &str) -> Result<Option<Arc<SchemaElement>>> {
        let cached = self.cache.read().by_name.get(name).copied();
        let id = match cached {
            Some(id) => id,
            None => match self.store.get(&name_key(name), ID_COLUMN)? {
                Some(raw) => SchemaId(get_u64_be(&raw)?),
                None => return Ok(None),
            },
        };
        match self.get(id)? {
            Some(element) if element.name() == name => Ok(Some(element)),
            _ => Ok(None),
        }
    }

    /// Element by id, failing when absent.
    pub fn require(&self, id: SchemaId) -> Result<Arc<SchemaElement>> {
        self.get(id)?
            .ok_or_else(|| PenumbraError::NotFound(format!("schema element {id}")))
    }

    /// Serialized definition exactly as stored; used as the expected value when
    /// locking a definition.
    pub fn read_raw(&self, id: SchemaId) -> Result<Option<Vec<u8>>> {
        self.store.get(&Self::element_key(id), DEF_COLUMN)
    }

    /// Every index known to this instance.
    pub fn indexes(&self) -> Result<Vec<Arc<SchemaElement>>> {
        let known = self.cache.read().index_ids.clone();
        let ids = match known {
            Some(ids) => ids,
            None => {
                let ids = self.scan_index_ids()?;
                self.cache.write().index_ids = Some(ids.clone());
                ids
            }
        };
        let mut out = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(element) = self.get(id)? {
                if element.as_index().is_some() {
                    out.push(element);
                }
            }
        }
        Ok(out)
    }

    /// Indexes covering `key`.
    pub fn indexes_on(&self, key: SchemaId) -> Result<Vec<Arc<SchemaElement>>> {
        Ok(self
            .indexes()?
            .into_iter()
            .filter(|e| e.as_index().map_or(false, |i| i.field_keys().contains(&key)))
            .collect())
    }

    /// Status of `field` in `index` as currently seen by this instance.
    pub fn status(&self, index: SchemaId, field: SchemaId) -> Result<SchemaStatus> {
        let element = self.require(index)?;
        let def = element
            .as_index()
            .ok_or_else(|| PenumbraError::NotFound(format!("index {index}")))?;
        def.status(field)
            .ok_or_else(|| PenumbraError::NotFound(format!("field {field} of index {}", def.name())))
    }

    /// Persists definitions and refreshes this instance's cache.
    pub fn write(&self, writes: &[SchemaWrite]) -> Result<()> {
        for write in writes {
            let id = write.element.id();
            let raw = serde_json::to_vec(&write.element)?;
            self.store
                .mutate(&Self::element_key(id), vec![Entry::new(DEF_COLUMN, raw)], &[])?;
            if let Some(old) = &write.previous_name {
                if old != write.element.name() {
                    self.store.mutate(&name_key(old), Vec::new(), &[ID_COLUMN.to_vec()])?;
                }
            }
            self.store.mutate(
                &name_key(write.element.name()),
                vec![Entry::new(ID_COLUMN, id.0.to_be_bytes().to_vec())],
                &[],
            )?;
            debug!(id = id.0, name = write.element.name(), "schema.registry.write");
        }
        let ids: Vec<SchemaId> = writes.iter().map(|w| w.element.id()).collect();
        self.expire(&ids);
        Ok(())
    }

    /// Drops cached definitions so the next read goes to the store.
    pub fn expire(&self, ids: &[SchemaId]) {
        let mut cache = self.cache.write();
        for id in ids {
            if let Some(old) = cache.by_id.remove(id) {
                cache.by_name.remove(old.name());
            }
        }
        cache.by_name.retain(|_, id| !ids.contains(id));
        cache.index_ids = None;
        debug!(count = ids.len(), "schema.cache.expired");
    }

    /// Drops the whole cache.
    pub fn expire_all(&self) {
        *self.cache.write() = SchemaCache::default();
    }

    /// Locks the given elements for writing, in id order.
    pub fn lock_elements(&self, ids: &BTreeSet<SchemaId>) -> Vec<ElementGuard> {
        let mutexes: Vec<Arc<Mutex<()>>> = {
            let mut locks = self.element_locks.lock();
            ids.iter()
                .map(|id| Arc::clone(locks.entry(*id).or_default()))
                .collect()
        };
        mutexes.iter().map(|m| m.lock_arc()).collect()
    }

    fn cache_element(&self, element: SchemaElement) -> Arc<SchemaElement> {
        let element = Arc::new(element);
        let mut cache = self.cache.write();
        cache.by_name.insert(element.name().to_owned(), element.id());
        cache.by_id.insert(element.id(), Arc::clone(&element));
        element
    }

    fn scan_index_ids(&self) -> Result<BTreeSet<SchemaId>> {
        let mut ids = BTreeSet::new();
        for key in self.store.keys()? {
            if key.first() != Some(&ELEMENT_ROW) {
                continue;
            }
            let id = SchemaId(get_u64_be(&key[1..])?);
            let Some(raw) = self.store.get(&key, DEF_COLUMN)? else {
                continue;
            };
            let element: SchemaElement = serde_json::from_slice(&raw)?;
            if matches!(element, SchemaElement::Index(_)) {
                ids.insert(id);
            }
        }
        Ok(ids)
    }
}

fn name_key(name: &str) -> Vec<u8> {
    let mut key = Vec::with_capacity(1 + name.len());
    key.push(NAME_ROW);
    key.extend_from_slice(name.as_bytes());
    key
}

/// Index definition from an element, failing for other kinds.
pub fn expect_index<'a>(element: &'a SchemaElement, name: &str) -> Result<&'a IndexDef> {
    element
        .as_index()
        .ok_or_else(|| PenumbraError::SchemaViolation(format!("{name} is not an index")))
}
