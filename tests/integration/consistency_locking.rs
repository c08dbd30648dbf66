#![allow(missing_docs)]

mod common;

use std::collections::BTreeSet;
use std::sync::Arc;

use penumbra::primitives::kcv::{InMemoryStoreManager, LockingMode};
use penumbra::storage::schema::{
    Cardinality, ConsistencyModifier, DataType, ElementCategory, Multiplicity,
};
use penumbra::{Direction, Graph, PenumbraError, PropertyValue, Result};

fn unique_uid_index(graph: &Graph) -> Result<()> {
    let mut mgmt = graph.open_management()?;
    mgmt.make_property_key("uid").data_type(DataType::Long).make()?;
    mgmt.build_index("byUid", ElementCategory::Vertex)
        .add_key("uid")
        .unique()
        .consistency(ConsistencyModifier::Lock)
        .build_composite_index()?;
    mgmt.commit()?;
    Ok(())
}

#[test]
fn locked_unique_index_rejects_the_junior_writer() -> Result<()> {
    let backend = common::backend();
    let a = common::open(&backend, "a")?;
    unique_uid_index(&a)?;
    let b = common::open(&backend, "b")?;

    let mut first = a.new_transaction()?;
    let va = first.add_vertex()?;
    first.set_property(&va, "uid", 1i64)?;
    let mut second = b.new_transaction()?;
    let vb = second.add_vertex()?;
    second.set_property(&vb, "uid", 1i64)?;
    assert_eq!(first.lock_count(), 1);
    assert_eq!(second.lock_count(), 1);

    first.commit()?;
    let err = second.commit().unwrap_err();
    assert!(matches!(err, PenumbraError::ExpectedValueMismatch { .. }), "{err}");
    assert!(err.is_retryable());

    let tx = b.new_transaction()?;
    assert_eq!(tx.query().has("uid", 1i64).vertices()?, vec![va.clone()]);
    assert!(!tx.vertex_exists(&vb)?);

    // A later writer sees the stored owner before locking anything.
    let mut third = b.new_transaction()?;
    let vc = third.add_vertex()?;
    let err = third.set_property(&vc, "uid", 1i64).unwrap_err();
    assert!(matches!(err, PenumbraError::SchemaViolation(_)), "{err}");
    a.close()?;
    b.close()
}

#[test]
fn transactions_of_one_process_contend_locally() -> Result<()> {
    let backend = common::backend();
    let a = common::open(&backend, "a")?;
    unique_uid_index(&a)?;

    let mut first = a.new_transaction()?;
    let v1 = first.add_vertex()?;
    first.set_property(&v1, "uid", 7i64)?;
    let mut second = a.new_transaction()?;
    let v2 = second.add_vertex()?;
    let err = second.set_property(&v2, "uid", 7i64).unwrap_err();
    assert!(matches!(err, PenumbraError::LocalLockContention { .. }), "{err}");
    assert!(err.is_retryable());
    second.rollback()?;

    // Releasing the lock through rollback lets the value be claimed again.
    first.rollback()?;
    let mut third = a.new_transaction()?;
    let v3 = third.add_vertex()?;
    third.set_property(&v3, "uid", 7i64)?;
    assert!(third.commit()?.is_clean());
    a.close()
}

#[test]
fn separate_mediator_groups_fall_through_to_backend_locks() -> Result<()> {
    let backend = common::backend();
    let a = common::open(&backend, "a")?;
    let mut mgmt = a.open_management()?;
    mgmt.make_property_key("balance")
        .data_type(DataType::Long)
        .consistency(ConsistencyModifier::Lock)
        .make()?;
    mgmt.commit()?;
    let mut tx = a.new_transaction()?;
    let v = tx.add_vertex()?;
    tx.set_property(&v, "balance", 10i64)?;
    tx.commit()?;
    let b = common::open(&backend, "b")?;

    let mut first = a.new_transaction()?;
    let mut second = b.new_transaction()?;
    first.set_property(&v, "balance", 20i64)?;
    second.set_property(&v, "balance", 30i64)?;

    // The junior claim loses while the senior one is still held.
    let err = second.commit().unwrap_err();
    assert!(matches!(err, PenumbraError::ExpectedValueMismatch { .. }), "{err}");
    first.commit()?;

    let tx = b.new_transaction()?;
    assert_eq!(tx.value(&v, "balance")?, Some(PropertyValue::Long(20)));
    a.close()?;
    b.close()
}

#[test]
fn default_consistency_takes_no_locks() -> Result<()> {
    let backend = common::backend();
    let a = common::open(&backend, "a")?;
    let b = common::open(&backend, "b")?;
    let mut tx = a.new_transaction()?;
    let v = tx.add_vertex()?;
    tx.set_property(&v, "score", 1i64)?;
    tx.commit()?;

    let mut first = a.new_transaction()?;
    let mut second = b.new_transaction()?;
    first.set_property(&v, "score", 2i64)?;
    second.set_property(&v, "score", 3i64)?;
    assert_eq!(first.lock_count() + second.lock_count(), 0);
    first.commit()?;
    second.commit()?;

    // Last writer wins; SINGLE keeps one value per transaction's view.
    let tx = a.new_transaction()?;
    let values: BTreeSet<i64> = tx
        .properties(&v, "score")?
        .into_iter()
        .filter_map(|p| match p.value {
            PropertyValue::Long(n) => Some(n),
            _ => None,
        })
        .collect();
    assert!(values.contains(&3));
    assert!(!values.contains(&1));
    a.close()?;
    b.close()
}

#[test]
fn forked_edges_replace_the_original_for_later_readers() -> Result<()> {
    let backend = common::backend();
    let a = common::open(&backend, "a")?;
    let mut mgmt = a.open_management()?;
    mgmt.make_edge_label("follows")
        .consistency(ConsistencyModifier::Fork)
        .make()?;
    mgmt.commit()?;
    let b = common::open(&backend, "b")?;

    let mut tx = a.new_transaction()?;
    let v1 = tx.add_vertex()?;
    let v2 = tx.add_vertex()?;
    let edge = tx.add_edge(&v1, "follows", &v2)?;
    tx.commit()?;

    let reader = a.new_transaction()?;
    let mut first = a.new_transaction()?;
    let mut second = b.new_transaction()?;
    let fork_a = first.set_edge_property(&edge, "since", 2020i64)?;
    let fork_b = second.set_edge_property(&edge, "since", 2021i64)?;
    assert_ne!(fork_a.id, edge.id);
    assert_ne!(fork_b.id, edge.id);
    assert_eq!(first.lock_count() + second.lock_count(), 0);

    // Repeated changes in one transaction keep updating the same fork.
    let again = first.set_edge_property(&fork_a, "since", 2022i64)?;
    assert_eq!(again.id, fork_a.id);
    first.commit()?;
    second.commit()?;

    let before: Vec<_> = reader
        .edges(&v1, Direction::Out, Some("follows"))?
        .into_iter()
        .map(|e| e.id)
        .collect();
    assert_eq!(before, vec![edge.id]);

    // Both concurrent forks survive; the original is gone.
    let tx = b.new_transaction()?;
    let after = tx.edges(&v1, Direction::Out, Some("follows"))?;
    let ids: BTreeSet<_> = after.iter().map(|e| e.id).collect();
    assert_eq!(ids, BTreeSet::from([fork_a.id, fork_b.id]));
    let mine = after
        .iter()
        .find(|e| e.id == fork_a.id)
        .expect("fork of instance a");
    assert_eq!(mine.property("since"), Some(&PropertyValue::Long(2022)));
    let incoming = tx.edges(&v2, Direction::In, Some("follows"))?;
    assert_eq!(incoming.len(), 2);
    a.close()?;
    b.close()
}

#[test]
fn forked_properties_get_new_ids() -> Result<()> {
    let backend = common::backend();
    let a = common::open(&backend, "a")?;
    let mut mgmt = a.open_management()?;
    mgmt.make_property_key("alias")
        .cardinality(Cardinality::List)
        .consistency(ConsistencyModifier::Fork)
        .make()?;
    mgmt.commit()?;

    let mut tx = a.new_transaction()?;
    let v = tx.add_vertex()?;
    let original = tx.set_property(&v, "alias", "rover")?;
    // Still owned by the creating transaction: updated in place.
    assert_eq!(tx.update_property(&v, original, "rex")?, original);
    tx.commit()?;

    let reader = a.new_transaction()?;
    let mut tx = a.new_transaction()?;
    let forked = tx.update_property(&v, original, "max")?;
    assert_ne!(forked, original);
    assert_eq!(tx.update_property(&v, original, "maximus")?, forked);
    tx.commit()?;

    assert_eq!(reader.value(&v, "alias")?, Some(PropertyValue::from("rex")));
    let tx = a.new_transaction()?;
    let props = tx.properties(&v, "alias")?;
    assert_eq!(props.len(), 1);
    assert_eq!(props[0].id, forked);
    assert_eq!(props[0].value, PropertyValue::from("maximus"));
    a.close()
}

#[test]
fn locked_multiplicity_allows_one_outgoing_edge() -> Result<()> {
    let backend = common::backend();
    let a = common::open(&backend, "a")?;
    let mut mgmt = a.open_management()?;
    mgmt.make_edge_label("mother")
        .multiplicity(Multiplicity::Many2One)
        .consistency(ConsistencyModifier::Lock)
        .make()?;
    mgmt.commit()?;
    let mut tx = a.new_transaction()?;
    let child = tx.add_vertex()?;
    let m1 = tx.add_vertex()?;
    let m2 = tx.add_vertex()?;
    tx.commit()?;
    let b = common::open(&backend, "b")?;

    let mut first = a.new_transaction()?;
    let mut second = b.new_transaction()?;
    first.add_edge(&child, "mother", &m1)?;
    second.add_edge(&child, "mother", &m2)?;
    let err = second.commit().unwrap_err();
    assert!(matches!(err, PenumbraError::ExpectedValueMismatch { .. }), "{err}");
    first.commit()?;

    let mut late = b.new_transaction()?;
    let err = late.add_edge(&child, "mother", &m2).unwrap_err();
    assert!(matches!(err, PenumbraError::SchemaViolation(_)), "{err}");
    let tx = b.new_transaction()?;
    let edges = tx.edges(&child, Direction::Out, Some("mother"))?;
    assert_eq!(edges.len(), 1);
    assert_eq!(edges[0].inv, m1);
    a.close()?;
    b.close()
}

#[test]
fn backend_native_locks_fail_at_acquisition() -> Result<()> {
    let backend = Arc::new(InMemoryStoreManager::with_locking(LockingMode::Pessimistic));
    let a = common::open(&backend, "a")?;
    unique_uid_index(&a)?;
    let b = common::open(&backend, "b")?;

    let mut first = a.new_transaction()?;
    let va = first.add_vertex()?;
    first.set_property(&va, "uid", 9i64)?;
    let mut second = b.new_transaction()?;
    let vb = second.add_vertex()?;
    let err = second.set_property(&vb, "uid", 9i64).unwrap_err();
    assert!(matches!(err, PenumbraError::ExpectedValueMismatch { .. }), "{err}");
    second.rollback()?;
    first.commit()?;
    a.close()?;
    b.close()
}
