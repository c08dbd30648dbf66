//! Builders that define relation types, vertex labels and indexes inside a
//! management transaction.
//!
//! An index over keys or a label created in the same transaction starts
//! ENABLED, since no data can exist for it yet. Otherwise it starts INSTALLED
//! and registers itself once every open instance has acknowledged it.

use std::time::Duration;

use tracing::debug;

use super::management::{ttl_secs, violation, ManagementSystem};
use crate::storage::ids::IdCategory;
use crate::storage::mgmt::StatusUpdate;
use crate::storage::schema::{
    Cardinality, CompositeIndexDef, ConsistencyModifier, DataType, EdgeLabelDef, ElementCategory,
    IndexDef, IndexField, MixedIndexDef, Multiplicity, Order, PropertyKeyDef, RelationIndexDef,
    SchemaElement, SchemaStatus, VertexLabelDef,
};
use crate::types::{Direction, PenumbraError, Result, SchemaId};

impl ManagementSystem {
    /// Starts defining a property key.
    pub fn make_property_key(&mut self, name: &str) -> PropertyKeyMaker<'_> {
        PropertyKeyMaker {
            mgmt: self,
            name: name.to_owned(),
            data_type: DataType::String,
            cardinality: Cardinality::Single,
            consistency: ConsistencyModifier::Default,
            ttl: Duration::ZERO,
        }
    }

    /// Starts defining an edge label.
    pub fn make_edge_label(&mut self, name: &str) -> EdgeLabelMaker<'_> {
        EdgeLabelMaker {
            mgmt: self,
            name: name.to_owned(),
            multiplicity: Multiplicity::Multi,
            consistency: ConsistencyModifier::Default,
            ttl: Duration::ZERO,
            signature: Vec::new(),
            sort_key: Vec::new(),
            sort_order: Order::Asc,
        }
    }

    /// Starts defining a vertex label.
    pub fn make_vertex_label(&mut self, name: &str) -> VertexLabelMaker<'_> {
        VertexLabelMaker {
            mgmt: self,
            name: name.to_owned(),
            partitioned: false,
            is_static: false,
            ttl: Duration::ZERO,
        }
    }

    /// Starts defining a composite or mixed index over `category` elements.
    pub fn build_index(&mut self, name: &str, category: ElementCategory) -> IndexBuilder<'_> {
        IndexBuilder {
            mgmt: self,
            name: name.to_owned(),
            category,
            keys: Vec::new(),
            unique: false,
            consistency: ConsistencyModifier::Default,
            label: None,
        }
    }

    /// Defines a vertex-centric index over the edges of `label`, sorted by
    /// `sort_keys`.
    pub fn build_edge_index(
        &mut self,
        label: &str,
        name: &str,
        direction: Direction,
        sort_keys: &[&str],
        order: Order,
    ) -> Result<IndexDef> {
        self.ensure_open()?;
        let base = self.require(label)?;
        let Some(base) = base.as_edge_label().cloned() else {
            return Err(violation(format!("{label} is not an edge label")));
        };
        if sort_keys.is_empty() {
            return Err(violation(format!("edge index {name} needs at least one sort key")));
        }
        let sort_key = self.property_keys(sort_keys)?;
        self.ensure_name_free(name)?;
        let status = self.index_status(Some(base.id), &[base.id]);
        let def = IndexDef::Relation(RelationIndexDef {
            id: self.allocate(IdCategory::GenericSchema)?,
            name: name.to_owned(),
            base_type: base.id,
            direction,
            sort_key: sort_key.into_iter().map(|k| k.id).collect(),
            order,
            status,
        });
        self.create_index(def.clone(), status);
        Ok(def)
    }

    /// Adds `key` to a mixed index. The new field starts ENABLED when the key
    /// is new in this transaction and INSTALLED otherwise.
    pub fn add_index_key(&mut self, index: &str, key: &str) -> Result<()> {
        self.ensure_open()?;
        let element = self.require(index)?;
        let Some(IndexDef::Mixed(mut def)) = element.as_index().cloned() else {
            return Err(violation(format!("keys can only be added to mixed indexes, not {index}")));
        };
        if def.fields.iter().all(|f| f.status == SchemaStatus::Removed) {
            return Err(violation(format!("index {index} was removed")));
        }
        let key = self.property_keys(&[key])?.remove(0);
        if def.fields.iter().any(|f| f.key == key.id) {
            return Err(violation(format!("{} is already indexed by {index}", key.name)));
        }
        let status = if self.is_new(key.id) {
            SchemaStatus::Enabled
        } else {
            SchemaStatus::Installed
        };
        def.fields.push(IndexField {
            key: key.id,
            status,
        });
        if status == SchemaStatus::Installed {
            self.triggers.push(StatusUpdate {
                index: def.id,
                fields: vec![key.id],
                from: SchemaStatus::Installed,
                to: SchemaStatus::Registered,
            });
        }
        debug!(index, key = %key.name, %status, "mgmt.index.key_added");
        self.stage(SchemaElement::Index(IndexDef::Mixed(def)))
    }

    fn property_keys(&mut self, names: &[&str]) -> Result<Vec<PropertyKeyDef>> {
        let mut keys: Vec<PropertyKeyDef> = Vec::with_capacity(names.len());
        for name in names {
            let element = self.require(name)?;
            let Some(key) = element.as_property_key().cloned() else {
                return Err(violation(format!("{name} is not a property key")));
            };
            if keys.iter().any(|k| k.id == key.id) {
                return Err(violation(format!("property key {name} is listed twice")));
            }
            keys.push(key);
        }
        Ok(keys)
    }

    fn index_status(&self, label: Option<SchemaId>, keys: &[SchemaId]) -> SchemaStatus {
        if label.map_or(false, |l| self.is_new(l)) || keys.iter().all(|k| self.is_new(*k)) {
            SchemaStatus::Enabled
        } else {
            SchemaStatus::Installed
        }
    }

    /// Keys and label constraint of a new graph index named `name`.
    fn index_targets(
        &mut self,
        name: &str,
        category: ElementCategory,
        keys: &[String],
        label: Option<&str>,
    ) -> Result<(Vec<PropertyKeyDef>, Option<SchemaId>)> {
        if keys.is_empty() {
            return Err(violation(format!("index {name} needs at least one key")));
        }
        let names: Vec<&str> = keys.iter().map(String::as_str).collect();
        let keys = self.property_keys(&names)?;
        let label = match label {
            None => None,
            Some(label) => {
                let element = self.require(label)?;
                let fits = match category {
                    ElementCategory::Vertex => element.as_vertex_label().is_some(),
                    ElementCategory::Edge => element.as_edge_label().is_some(),
                    ElementCategory::Property => false,
                };
                if !fits {
                    return Err(violation(format!(
                        "{} {label} cannot constrain index {name}",
                        element.kind_name()
                    )));
                }
                Some(element.id())
            }
        };
        self.ensure_name_free(name)?;
        Ok((keys, label))
    }

    fn create_index(&mut self, def: IndexDef, status: SchemaStatus) {
        if status == SchemaStatus::Installed {
            self.triggers.push(StatusUpdate {
                index: def.id(),
                fields: Vec::new(),
                from: SchemaStatus::Installed,
                to: SchemaStatus::Registered,
            });
        }
        self.create(SchemaElement::Index(def));
    }
}

/// Defines a property key.
pub struct PropertyKeyMaker<'a> {
    mgmt: &'a mut ManagementSystem,
    name: String,
    data_type: DataType,
    cardinality: Cardinality,
    consistency: ConsistencyModifier,
    ttl: Duration,
}

impl PropertyKeyMaker<'_> {
    /// Type of the values; defaults to String.
    pub fn data_type(mut self, data_type: DataType) -> Self {
        self.data_type = data_type;
        self
    }

    /// SINGLE, SET or LIST; defaults to SINGLE.
    pub fn cardinality(mut self, cardinality: Cardinality) -> Self {
        self.cardinality = cardinality;
        self
    }

    /// Conflict policy for concurrent writers.
    pub fn consistency(mut self, consistency: ConsistencyModifier) -> Self {
        self.consistency = consistency;
        self
    }

    /// Expiry of written values; zero keeps them forever.
    pub fn ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    /// Stages the key; it becomes visible at commit.
    pub fn make(self) -> Result<PropertyKeyDef> {
        let mgmt = self.mgmt;
        mgmt.ensure_open()?;
        mgmt.ensure_name_free(&self.name)?;
        if self.consistency == ConsistencyModifier::Fork && self.cardinality != Cardinality::List {
            return Err(violation(format!(
                "FORK on property key {} requires LIST cardinality",
                self.name
            )));
        }
        let def = PropertyKeyDef {
            id: mgmt.allocate(IdCategory::PropertyKey)?,
            name: self.name.clone(),
            data_type: self.data_type,
            cardinality: self.cardinality,
            consistency: self.consistency,
            ttl_secs: ttl_secs(&self.name, self.ttl)?,
        };
        mgmt.create(SchemaElement::PropertyKey(def.clone()));
        Ok(def)
    }
}

/// Defines an edge label.
pub struct EdgeLabelMaker<'a> {
    mgmt: &'a mut ManagementSystem,
    name: String,
    multiplicity: Multiplicity,
    consistency: ConsistencyModifier,
    ttl: Duration,
    signature: Vec<String>,
    sort_key: Vec<String>,
    sort_order: Order,
}

impl EdgeLabelMaker<'_> {
    /// Edge constraint; defaults to MULTI.
    pub fn multiplicity(mut self, multiplicity: Multiplicity) -> Self {
        self.multiplicity = multiplicity;
        self
    }

    /// Conflict policy for concurrent writers.
    pub fn consistency(mut self, consistency: ConsistencyModifier) -> Self {
        self.consistency = consistency;
        self
    }

    /// Expiry of written values; zero keeps them forever.
    pub fn ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    /// Property keys stored inline with each edge.
    pub fn signature(mut self, keys: &[&str]) -> Self {
        self.signature = keys.iter().map(|k| (*k).to_owned()).collect();
        self
    }

    /// Property keys incident edges are sorted by.
    pub fn sort_key(mut self, keys: &[&str]) -> Self {
        self.sort_key = keys.iter().map(|k| (*k).to_owned()).collect();
        self
    }

    /// Direction of the sort key order.
    pub fn sort_order(mut self, order: Order) -> Self {
        self.sort_order = order;
        self
    }

    /// Stages the label; it becomes visible at commit.
    pub fn make(self) -> Result<EdgeLabelDef> {
        let mgmt = self.mgmt;
        mgmt.ensure_open()?;
        mgmt.ensure_name_free(&self.name)?;
        let name = &self.name;
        if self.consistency == ConsistencyModifier::Fork && self.multiplicity != Multiplicity::Multi {
            return Err(violation(format!(
                "FORK on edge label {name} requires MULTI multiplicity"
            )));
        }
        if !self.sort_key.is_empty() && self.multiplicity.is_unique(Direction::Out) {
            return Err(violation(format!(
                "edge label {name} has unique out-edges and cannot define a sort key"
            )));
        }
        if self.sort_key.iter().any(|k| self.signature.contains(k)) {
            return Err(violation(format!(
                "signature and sort key of edge label {name} must be disjoint"
            )));
        }
        let names: Vec<&str> = self.signature.iter().map(String::as_str).collect();
        let signature = mgmt.property_keys(&names)?;
        let names: Vec<&str> = self.sort_key.iter().map(String::as_str).collect();
        let sort_key = mgmt.property_keys(&names)?;
        let def = EdgeLabelDef {
            id: mgmt.allocate(IdCategory::EdgeLabel)?,
            name: name.clone(),
            multiplicity: self.multiplicity,
            consistency: self.consistency,
            ttl_secs: ttl_secs(name, self.ttl)?,
            signature: signature.into_iter().map(|k| k.id).collect(),
            sort_key: sort_key.into_iter().map(|k| k.id).collect(),
            sort_order: self.sort_order,
        };
        mgmt.create(SchemaElement::EdgeLabel(def.clone()));
        Ok(def)
    }
}

/// Defines a vertex label.
pub struct VertexLabelMaker<'a> {
    mgmt: &'a mut ManagementSystem,
    name: String,
    partitioned: bool,
    is_static: bool,
    ttl: Duration,
}

impl VertexLabelMaker<'_> {
    /// Spreads vertices of the label over all partitions.
    pub fn partition(mut self) -> Self {
        self.partitioned = true;
        self
    }

    /// Forbids modifying vertices after the creating transaction.
    pub fn set_static(mut self) -> Self {
        self.is_static = true;
        self
    }

    /// Expiry of the vertices; requires a static label.
    pub fn ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    /// Stages the label; it becomes visible at commit.
    pub fn make(self) -> Result<VertexLabelDef> {
        let mgmt = self.mgmt;
        mgmt.ensure_open()?;
        mgmt.ensure_name_free(&self.name)?;
        let ttl_secs = ttl_secs(&self.name, self.ttl)?;
        if ttl_secs > 0 && !self.is_static {
            return Err(violation(format!(
                "TTL on vertex label {} requires a static label",
                self.name
            )));
        }
        let def = VertexLabelDef {
            id: mgmt.allocate(IdCategory::VertexLabel)?,
            name: self.name.clone(),
            partitioned: self.partitioned,
            is_static: self.is_static,
            ttl_secs,
        };
        mgmt.create(SchemaElement::VertexLabel(def.clone()));
        Ok(def)
    }
}

/// Defines a composite or mixed index.
pub struct IndexBuilder<'a> {
    mgmt: &'a mut ManagementSystem,
    name: String,
    category: ElementCategory,
    keys: Vec<String>,
    unique: bool,
    consistency: ConsistencyModifier,
    label: Option<String>,
}

impl IndexBuilder<'_> {
    /// Adds an indexed key.
    pub fn add_key(mut self, key: &str) -> Self {
        self.keys.push(key.to_owned());
        self
    }

    /// At most one vertex per value combination; composite vertex indexes only.
    pub fn unique(mut self) -> Self {
        self.unique = true;
        self
    }

    /// DEFAULT or LOCK; composite indexes only.
    pub fn consistency(mut self, consistency: ConsistencyModifier) -> Self {
        self.consistency = consistency;
        self
    }

    /// Restricts the index to elements with `label`.
    pub fn indexed_only_for(mut self, label: &str) -> Self {
        self.label = Some(label.to_owned());
        self
    }

    /// Stages an exact-match index kept in the graph index store.
    pub fn build_composite_index(self) -> Result<IndexDef> {
        let IndexBuilder {
            mgmt,
            name,
            category,
            keys,
            unique,
            consistency,
            label,
        } = self;
        mgmt.ensure_open()?;
        if consistency == ConsistencyModifier::Fork {
            return Err(violation(format!("index {name} supports DEFAULT or LOCK only")));
        }
        if unique && category != ElementCategory::Vertex {
            return Err(violation(format!("unique index {name} must cover vertices")));
        }
        if category == ElementCategory::Property && (keys.len() != 1 || label.is_some()) {
            return Err(violation(format!(
                "property index {name} must have exactly one key and no label constraint"
            )));
        }
        let (keys, label) = mgmt.index_targets(&name, category, &keys, label.as_deref())?;
        if unique && consistency == ConsistencyModifier::Lock {
            if let Some(key) = keys.iter().find(|k| k.consistency == ConsistencyModifier::Fork) {
                return Err(violation(format!(
                    "unique LOCK index {name} cannot cover FORK property key {}",
                    key.name
                )));
            }
        }
        let key_ids: Vec<SchemaId> = keys.iter().map(|k| k.id).collect();
        let status = mgmt.index_status(label, &key_ids);
        let def = IndexDef::Composite(CompositeIndexDef {
            id: mgmt.allocate(IdCategory::GenericSchema)?,
            name,
            element: category,
            fields: key_ids.into_iter().map(|key| IndexField { key, status }).collect(),
            unique,
            consistency,
            label_constraint: label,
        });
        mgmt.create_index(def.clone(), status);
        Ok(def)
    }

    /// Stages an index kept by the external indexing provider `backing`.
    pub fn build_mixed_index(self, backing: &str) -> Result<IndexDef> {
        let IndexBuilder {
            mgmt,
            name,
            category,
            keys,
            unique,
            consistency,
            label,
        } = self;
        mgmt.ensure_open()?;
        if unique {
            return Err(violation(format!("mixed index {name} cannot be unique")));
        }
        if consistency != ConsistencyModifier::Default {
            return Err(violation(format!(
                "mixed index {name} does not take a consistency modifier"
            )));
        }
        if backing.is_empty() {
            return Err(PenumbraError::Config(format!(
                "mixed index {name} needs a backing index name"
            )));
        }
        let (keys, label) = mgmt.index_targets(&name, category, &keys, label.as_deref())?;
        let key_ids: Vec<SchemaId> = keys.iter().map(|k| k.id).collect();
        let status = mgmt.index_status(label, &key_ids);
        let def = IndexDef::Mixed(MixedIndexDef {
            id: mgmt.allocate(IdCategory::GenericSchema)?,
            name,
            element: category,
            backing: backing.to_owned(),
            fields: key_ids.into_iter().map(|key| IndexField { key, status }).collect(),
            label_constraint: label,
        });
        mgmt.create_index(def.clone(), status);
        Ok(def)
    }
}
