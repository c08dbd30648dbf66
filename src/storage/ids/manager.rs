//! Bit layout of element ids.
//!
//! Vertex ids pack `count | partition | type suffix`, relation ids pack
//! `count | partition`, and schema ids pack `count | schema suffix` without a
//! partition. Only the low 63 bits are used.

use crate::types::{PartitionId, PenumbraError, Result};

/// Usable id bits.
pub const TOTAL_BITS: u32 = 63;
/// Widest supported partition field.
pub const MAX_PARTITION_BITS: u32 = 16;
/// Width of the vertex type suffix.
pub const VERTEX_TYPE_BITS: u32 = 3;

/// Kinds of ids the manager can construct and recognize.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum IdKind {
    /// Ordinary vertex living in one partition.
    NormalVertex,
    /// Vertex of a partitioned label, spread over all partitions.
    PartitionedVertex,
    /// Vertex of a static label; immutable after creation.
    UnmodifiableVertex,
    /// User-defined property key.
    PropertyKey,
    /// User-defined edge label.
    EdgeLabel,
    /// Vertex label.
    VertexLabel,
    /// Any other schema element (indexes).
    GenericSchema,
}

impl IdKind {
    const fn offset(self) -> u32 {
        match self {
            IdKind::NormalVertex | IdKind::PartitionedVertex | IdKind::UnmodifiableVertex => {
                VERTEX_TYPE_BITS
            }
            IdKind::PropertyKey | IdKind::EdgeLabel => 6,
            IdKind::VertexLabel => 5,
            IdKind::GenericSchema => 4,
        }
    }

    const fn suffix(self) -> u64 {
        match self {
            IdKind::NormalVertex => 0b000,
            IdKind::PartitionedVertex => 0b010,
            IdKind::UnmodifiableVertex => 0b100,
            IdKind::PropertyKey => 0b000101,
            IdKind::EdgeLabel => 0b010101,
            IdKind::VertexLabel => 0b01101,
            IdKind::GenericSchema => 0b1001,
        }
    }

    /// Whether the kind names a vertex.
    pub const fn is_vertex(self) -> bool {
        matches!(
            self,
            IdKind::NormalVertex | IdKind::PartitionedVertex | IdKind::UnmodifiableVertex
        )
    }

    /// Whether `id` carries this kind's suffix.
    pub fn matches(self, id: u64) -> bool {
        let mask = (1u64 << self.offset()) - 1;
        id & mask == self.suffix()
    }

    const ALL: [IdKind; 7] = [
        IdKind::NormalVertex,
        IdKind::PartitionedVertex,
        IdKind::UnmodifiableVertex,
        IdKind::PropertyKey,
        IdKind::EdgeLabel,
        IdKind::VertexLabel,
        IdKind::GenericSchema,
    ];
}

/// Components of a decoded id.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct IdInfo {
    /// Recognized kind.
    pub kind: IdKind,
    /// Partition field (vertices only).
    pub partition: Option<PartitionId>,
    /// Count within the partition or schema space.
    pub count: u64,
}

/// Encodes and decodes ids for a fixed partition width.
#[derive(Copy, Clone, Debug)]
pub struct IdManager {
    partition_bits: u32,
    custom_ids: bool,
}

impl IdManager {
    /// Creates a manager for `partition_bits` wide partitions.
    pub fn new(partition_bits: u32, custom_ids: bool) -> Result<Self> {
        if partition_bits > MAX_PARTITION_BITS {
            return Err(PenumbraError::Config(format!(
                "partition bits {partition_bits} exceed the maximum of {MAX_PARTITION_BITS}"
            )));
        }
        Ok(Self {
            partition_bits,
            custom_ids,
        })
    }

    /// Partition field width.
    pub fn partition_bits(&self) -> u32 {
        self.partition_bits
    }

    /// Number of partitions.
    pub fn partition_bound(&self) -> u32 {
        1 << self.partition_bits
    }

    /// Whether vertex ids are supplied by callers.
    pub fn custom_ids(&self) -> bool {
        self.custom_ids
    }

    /// Exclusive upper bound of vertex counts per partition.
    pub fn vertex_count_bound(&self) -> u64 {
        1u64 << (TOTAL_BITS - self.partition_bits - VERTEX_TYPE_BITS)
    }

    /// Exclusive upper bound of relation counts per partition.
    pub fn relation_count_bound(&self) -> u64 {
        1u64 << (TOTAL_BITS - self.partition_bits)
    }

    /// Exclusive upper bound of schema counts.
    pub fn schema_count_bound(&self, kind: IdKind) -> u64 {
        1u64 << (TOTAL_BITS - kind.offset())
    }

    /// Builds a vertex id.
    pub fn vertex_id(&self, kind: IdKind, count: u64, partition: PartitionId) -> Result<u64> {
        if !kind.is_vertex() {
            return Err(PenumbraError::InvalidId(format!("{kind:?} is not a vertex kind")));
        }
        self.check_partition(partition)?;
        if count == 0 || count >= self.vertex_count_bound() {
            return Err(PenumbraError::InvalidId(format!(
                "vertex count {count} outside (0, {})",
                self.vertex_count_bound()
            )));
        }
        let base = (count << self.partition_bits) | u64::from(partition.0);
        Ok((base << VERTEX_TYPE_BITS) | kind.suffix())
    }

    /// Builds a relation id.
    pub fn relation_id(&self, count: u64, partition: PartitionId) -> Result<u64> {
        self.check_partition(partition)?;
        if count == 0 || count >= self.relation_count_bound() {
            return Err(PenumbraError::InvalidId(format!(
                "relation count {count} outside (0, {})",
                self.relation_count_bound()
            )));
        }
        Ok((count << self.partition_bits) | u64::from(partition.0))
    }

    /// Builds a schema id.
    pub fn schema_id(&self, kind: IdKind, count: u64) -> Result<u64> {
        if kind.is_vertex() {
            return Err(PenumbraError::InvalidId(format!("{kind:?} is not a schema kind")));
        }
        if count == 0 || count >= self.schema_count_bound(kind) {
            return Err(PenumbraError::InvalidId(format!("schema count {count} out of range")));
        }
        Ok((count << kind.offset()) | kind.suffix())
    }

    /// Canonical id of a partitioned vertex; its partition is derived from the count.
    pub fn partitioned_vertex_id(&self, count: u64) -> Result<u64> {
        let partition = PartitionId(self.partition_hash(count));
        self.vertex_id(IdKind::PartitionedVertex, count, partition)
    }

    /// Decodes a schema or vertex id.
    pub fn decode(&self, id: u64) -> Result<IdInfo> {
        if id == 0 || id >> TOTAL_BITS != 0 {
            return Err(PenumbraError::InvalidId(format!("Not a valid id: {id}")));
        }
        let kind = IdKind::ALL
            .into_iter()
            .find(|k| k.matches(id))
            .ok_or_else(|| PenumbraError::InvalidId(format!("Not a valid id: {id}")))?;
        if kind.is_vertex() {
            let base = id >> VERTEX_TYPE_BITS;
            let mask = (1u64 << self.partition_bits) - 1;
            Ok(IdInfo {
                kind,
                partition: Some(PartitionId((base & mask) as u32)),
                count: base >> self.partition_bits,
            })
        } else {
            Ok(IdInfo {
                kind,
                partition: None,
                count: id >> kind.offset(),
            })
        }
    }

    /// Whether `id` is a vertex id this manager could have produced.
    pub fn is_user_vertex_id(&self, id: u64) -> bool {
        matches!(self.decode(id), Ok(info) if info.kind.is_vertex() && info.count > 0)
    }

    /// Maps a positive user long into the vertex id space.
    pub fn to_vertex_id(&self, user: u64) -> Result<u64> {
        if user == 0 || user >= self.vertex_count_bound() {
            return Err(PenumbraError::InvalidId(format!(
                "Vertex id must be positive and less than {}: {user}",
                self.vertex_count_bound()
            )));
        }
        Ok(user << (self.partition_bits + VERTEX_TYPE_BITS))
    }

    /// Inverse of [`IdManager::to_vertex_id`].
    pub fn from_vertex_id(&self, id: u64) -> Result<u64> {
        let info = self.decode(id);
        let Ok(info) = info else {
            return Err(PenumbraError::InvalidId(format!("Not a valid vertex id: {id}")));
        };
        if info.kind != IdKind::NormalVertex || info.count == 0 {
            return Err(PenumbraError::InvalidId(format!("Not a valid vertex id: {id}")));
        }
        // Partition bits must be clear, as `to_vertex_id` leaves them.
        if self.to_vertex_id(info.count).ok() != Some(id) {
            return Err(PenumbraError::InvalidId(format!("Not a valid vertex id: {id}")));
        }
        Ok(info.count)
    }

    /// Storage partition of a numeric vertex id.
    ///
    /// With custom ids the partition field is always zero, so the partition is
    /// hashed from the count instead.
    pub fn partition_of(&self, id: u64) -> Result<PartitionId> {
        let info = self.decode(id)?;
        match (self.custom_ids, info.kind) {
            (true, IdKind::NormalVertex) => Ok(PartitionId(self.partition_hash(info.count))),
            (_, k) if k.is_vertex() => info
                .partition
                .ok_or_else(|| PenumbraError::InvalidId(format!("Not a valid vertex id: {id}"))),
            _ => Err(PenumbraError::InvalidId(format!("Not a valid vertex id: {id}"))),
        }
    }

    /// XOR-fold of `value` into the partition width.
    pub fn partition_hash(&self, value: u64) -> u32 {
        if self.partition_bits == 0 {
            return 0;
        }
        let mask = (1u64 << self.partition_bits) - 1;
        let mut result = 0u64;
        let mut offset = 0;
        while offset < u64::BITS {
            result ^= (value >> offset) & mask;
            offset += self.partition_bits;
        }
        result as u32
    }

    /// Row key of a numeric vertex id: the partition moves to the top bits so a
    /// partition's rows are contiguous.
    pub fn row_key(&self, id: u64) -> Result<u64> {
        let partition = self.partition_of(id)?;
        let info = self.decode(id)?;
        let rest = (info.count << VERTEX_TYPE_BITS) | (id & ((1 << VERTEX_TYPE_BITS) - 1));
        Ok((u64::from(partition.0) << (TOTAL_BITS - self.partition_bits)) | rest)
    }

    /// Inverse of [`IdManager::row_key`].
    pub fn id_from_row_key(&self, key: u64) -> Result<u64> {
        let rest_bits = TOTAL_BITS - self.partition_bits;
        let partition = key >> rest_bits;
        let rest = key & ((1u64 << rest_bits) - 1);
        let suffix = rest & ((1 << VERTEX_TYPE_BITS) - 1);
        let count = rest >> VERTEX_TYPE_BITS;
        let field = if self.custom_ids && suffix == IdKind::NormalVertex.suffix() {
            0
        } else {
            partition
        };
        let id = (((count << self.partition_bits) | field) << VERTEX_TYPE_BITS) | suffix;
        if !self.is_user_vertex_id(id) {
            return Err(PenumbraError::Serialization(format!("invalid vertex row key {key}")));
        }
        Ok(id)
    }

    fn check_partition(&self, partition: PartitionId) -> Result<()> {
        if partition.0 >= self.partition_bound() {
            return Err(PenumbraError::InvalidId(format!(
                "partition {partition} outside [0, {})",
                self.partition_bound()
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mgr() -> IdManager {
        IdManager::new(5, false).unwrap()
    }

    #[test]
    fn vertex_ids_roundtrip_components() -> Result<()> {
        let m = mgr();
        let id = m.vertex_id(IdKind::NormalVertex, 77, PartitionId(9))?;
        let info = m.decode(id)?;
        assert_eq!(info.kind, IdKind::NormalVertex);
        assert_eq!(info.partition, Some(PartitionId(9)));
        assert_eq!(info.count, 77);
        assert_eq!(m.partition_of(id)?, PartitionId(9));
        Ok(())
    }

    #[test]
    fn schema_ids_never_look_like_vertices() -> Result<()> {
        let m = mgr();
        for kind in [
            IdKind::PropertyKey,
            IdKind::EdgeLabel,
            IdKind::VertexLabel,
            IdKind::GenericSchema,
        ] {
            let id = m.schema_id(kind, 3)?;
            assert_eq!(m.decode(id)?.kind, kind);
            assert!(!m.is_user_vertex_id(id));
        }
        Ok(())
    }

    #[test]
    fn partition_out_of_range_is_rejected() {
        let m = mgr();
        assert!(m.vertex_id(IdKind::NormalVertex, 1, PartitionId(32)).is_err());
        assert!(m.relation_id(1, PartitionId(32)).is_err());
    }

    #[test]
    fn user_long_bijection_and_raw_rejection() -> Result<()> {
        let m = mgr();
        let id = m.to_vertex_id(42)?;
        assert_eq!(m.from_vertex_id(id)?, 42);
        let err = m.from_vertex_id(1).unwrap_err();
        assert!(err.to_string().contains("Not a valid vertex id: 1"));
        assert!(!m.is_user_vertex_id(1));
        assert!(m.to_vertex_id(0).is_err());
        assert!(m.to_vertex_id(m.vertex_count_bound()).is_err());
        Ok(())
    }

    #[test]
    fn user_longs_with_partition_bits_are_not_inverted() -> Result<()> {
        let m = mgr();
        let id = m.to_vertex_id(1)?;
        let shadow = id | (1 << VERTEX_TYPE_BITS);
        assert_eq!(m.decode(shadow)?.count, 1);
        let err = m.from_vertex_id(shadow).unwrap_err();
        assert!(err.to_string().contains("Not a valid vertex id"));
        assert_eq!(m.from_vertex_id(id)?, 1);
        Ok(())
    }

    #[test]
    fn row_keys_group_by_partition_and_invert() -> Result<()> {
        let m = mgr();
        let a = m.vertex_id(IdKind::NormalVertex, 1000, PartitionId(1))?;
        let b = m.vertex_id(IdKind::NormalVertex, 1, PartitionId(2))?;
        assert!(m.row_key(a)? < m.row_key(b)?);
        assert_eq!(m.id_from_row_key(m.row_key(a)?)?, a);
        let p = m.partitioned_vertex_id(12345)?;
        assert_eq!(m.id_from_row_key(m.row_key(p)?)?, p);
        Ok(())
    }

    #[test]
    fn custom_ids_hash_partitions() -> Result<()> {
        let m = IdManager::new(5, true)?;
        let id = m.to_vertex_id(0b1_00011)?;
        assert_eq!(m.partition_of(id)?, PartitionId(0b00011 ^ 0b1));
        assert_eq!(m.id_from_row_key(m.row_key(id)?)?, id);
        Ok(())
    }

    #[test]
    fn unpartitioned_layout() -> Result<()> {
        let m = IdManager::new(0, false)?;
        assert_eq!(m.partition_hash(u64::MAX), 0);
        let id = m.vertex_id(IdKind::NormalVertex, 5, PartitionId(0))?;
        assert_eq!(m.row_key(id)?, id);
        Ok(())
    }
}
