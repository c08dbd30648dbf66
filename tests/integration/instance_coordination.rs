#![allow(missing_docs)]

mod common;

use std::time::Duration;

use penumbra::graph::TxLogEntry;
use penumbra::storage::mgmt::{LogId, ALLOW_CUSTOM_VERTEX_IDS, ALLOW_CUSTOM_VERTEX_ID_TYPES};
use penumbra::storage::schema::{Cardinality, ConsistencyModifier};
use penumbra::{Graph, PenumbraError, PropertyValue, Result};

const WAIT: Duration = Duration::from_secs(5);

#[test]
fn renames_reach_other_instances_through_eviction() -> Result<()> {
    let backend = common::backend();
    let a = common::open(&backend, "a")?;
    let b = common::open(&backend, "b")?;
    let mut tx = a.new_transaction()?;
    let v = tx.add_vertex()?;
    tx.set_property(&v, "name", "pluto")?;
    tx.commit()?;

    let tx = b.new_transaction()?;
    assert_eq!(tx.value(&v, "name")?, Some(PropertyValue::from("pluto")));
    drop(tx);

    let mut mgmt = a.open_management()?;
    let key = mgmt.get_property_key("name")?.expect("name key");
    mgmt.change_name("name", "fullname")?;
    mgmt.commit()?;

    let converged = common::eventually(WAIT, || {
        let tx = b.new_transaction()?;
        Ok(tx.value(&v, "name")?.is_none() && tx.value(&v, "fullname")?.is_some())
    })?;
    assert!(converged, "instance b kept the stale name");
    let mut mgmt = b.open_management()?;
    assert_eq!(mgmt.get_property_key("fullname")?.map(|k| k.id), Some(key.id));
    mgmt.rollback()?;
    a.close()?;
    b.close()
}

#[test]
fn concurrent_schema_edits_from_two_instances_conflict() -> Result<()> {
    let backend = common::backend();
    let a = common::open(&backend, "a")?;
    let b = common::open(&backend, "b")?;
    let mut mgmt = a.open_management()?;
    mgmt.make_property_key("tags").cardinality(Cardinality::List).make()?;
    mgmt.commit()?;

    let mut first = a.open_management()?;
    let mut second = b.open_management()?;
    first.set_consistency("tags", ConsistencyModifier::Lock)?;
    second.set_consistency("tags", ConsistencyModifier::Fork)?;
    first.commit()?;
    let err = second.commit().unwrap_err();
    assert!(matches!(err, PenumbraError::ExpectedValueMismatch { .. }));
    assert!(err.is_retryable());

    let mut mgmt = b.open_management()?;
    assert_eq!(
        mgmt.get_property_key("tags")?.map(|k| k.consistency),
        Some(ConsistencyModifier::Lock)
    );

    // Same name created on both sides.
    let mut other = a.open_management()?;
    mgmt.make_property_key("color").make()?;
    other.make_property_key("color").make()?;
    other.commit()?;
    let err = mgmt.commit().unwrap_err();
    assert!(matches!(err, PenumbraError::ExpectedValueMismatch { .. }));
    a.close()?;
    b.close()
}

#[test]
fn force_close_refuses_current_unknown_and_newer_instances() -> Result<()> {
    let backend = common::backend();
    let a = common::open(&backend, "a")?;
    let mut mgmt = a.open_management()?;
    let err = mgmt.force_close_instance("a").unwrap_err();
    assert!(matches!(err, PenumbraError::LifecyclePrecondition(_)));
    let err = mgmt.force_close_instance("ghost").unwrap_err();
    assert!(matches!(err, PenumbraError::NotFound(_)));

    let late = common::open(&backend, "late")?;
    let err = mgmt.force_close_instance("late").unwrap_err();
    assert!(matches!(err, PenumbraError::LifecyclePrecondition(_)));
    mgmt.rollback()?;

    let mut mgmt = a.open_management()?;
    mgmt.force_close_instance("late")?;
    assert_eq!(mgmt.get_open_instances()?, vec!["a(current)".to_owned()]);
    mgmt.commit()?;
    let evicted = common::eventually(WAIT, || Ok(late.is_evicted()))?;
    assert!(evicted, "poller never noticed the force-close");
    assert!(matches!(
        late.open_management().map(|_| ()).unwrap_err(),
        PenumbraError::InstanceEvicted(_)
    ));
    late.close()?;

    // The id is free again once force-closed.
    let again = common::open(&backend, "late")?;
    again.close()?;
    a.close()
}

#[test]
fn rolled_back_force_close_keeps_the_instance_registered() -> Result<()> {
    let backend = common::backend();
    let a = common::open(&backend, "a")?;
    let b = common::open(&backend, "b")?;
    let mut mgmt = a.open_management()?;
    mgmt.force_close_instance("b")?;
    assert_eq!(mgmt.get_open_instances()?, vec!["a(current)".to_owned()]);
    mgmt.rollback()?;

    let mgmt = a.open_management()?;
    let mut open = mgmt.get_open_instances()?;
    open.sort();
    assert_eq!(open, vec!["a(current)".to_owned(), "b".to_owned()]);
    mgmt.rollback()?;
    b.poll_management_log()?;
    assert!(!b.is_evicted());
    b.new_transaction()?.rollback()?;
    a.close()?;
    b.close()
}

#[test]
fn instance_ids_are_exclusive_until_closed() -> Result<()> {
    let backend = common::backend();
    let a = common::open(&backend, "a")?;
    let err = common::open(&backend, "a").map(|_| ()).unwrap_err();
    assert!(matches!(err, PenumbraError::Config(_)));
    a.close()?;
    let a = common::open(&backend, "a")?;
    assert!(a.is_open());
    a.close()?;
    assert!(matches!(
        a.new_transaction().map(|_| ()).unwrap_err(),
        PenumbraError::Closed(_)
    ));
    Ok(())
}

#[test]
fn global_options_change_on_next_open_and_are_validated() -> Result<()> {
    let backend = common::backend();
    let a = common::open(&backend, "a")?;
    let mut mgmt = a.open_management()?;
    mgmt.set_option(ALLOW_CUSTOM_VERTEX_ID_TYPES, true)?;
    let err = mgmt.commit().unwrap_err();
    assert!(matches!(err, PenumbraError::Config(_)));

    let mut mgmt = a.open_management()?;
    let err = mgmt.set_option("graph.no-such-option", true).unwrap_err();
    assert!(matches!(err, PenumbraError::Config(_)));
    mgmt.set_option(ALLOW_CUSTOM_VERTEX_IDS, true)?;
    assert!(mgmt.get_option(ALLOW_CUSTOM_VERTEX_IDS)?);
    mgmt.commit()?;
    assert!(!a.options().allow_custom_vertex_ids);
    a.close()?;

    let b = common::open(&backend, "b")?;
    assert!(b.options().allow_custom_vertex_ids);
    assert!(!b.options().allow_custom_vertex_id_types);
    b.close()
}

#[test]
fn user_and_transaction_logs_record_commits() -> Result<()> {
    let backend = common::backend();
    let mut cfg = common::config("a");
    cfg.log.transaction_log = true;
    let a = Graph::open(backend.clone(), cfg)?;

    let mut tx = a.new_transaction_with_log("audit")?;
    let v = tx.add_vertex()?;
    tx.set_property(&v, "name", "io")?;
    let report = tx.commit()?;
    assert!(report.is_clean());

    for log in [LogId::User("audit".into()), LogId::Transaction] {
        let messages = a.read_log(&log, 0)?;
        assert_eq!(messages.len(), 1, "log {log}");
        assert_eq!(messages[0].sender, "a");
        let entry: TxLogEntry = serde_json::from_slice(&messages[0].payload)?;
        assert_eq!(entry.instance_id, "a");
        assert_eq!(entry.vertices, vec![v.clone()]);
        assert_eq!(entry.commit_ts, report.commit_ts);
    }
    a.close()
}

#[test]
fn ttl_types_expire_their_data_for_every_instance() -> Result<()> {
    let backend = common::backend();
    let a = common::open(&backend, "a")?;
    let mut mgmt = a.open_management()?;
    mgmt.make_property_key("token")
        .ttl(Duration::from_secs(1))
        .make()?;
    mgmt.make_vertex_label("session")
        .set_static()
        .ttl(Duration::from_secs(1))
        .make()?;
    mgmt.make_vertex_label("user").make()?;
    let err = mgmt
        .make_property_key("blink")
        .ttl(Duration::from_millis(10))
        .make()
        .unwrap_err();
    assert!(matches!(err, PenumbraError::SchemaViolation(_)));
    mgmt.commit()?;

    let mut mgmt = a.open_management()?;
    let err = mgmt.set_ttl("user", Duration::from_secs(5)).unwrap_err();
    assert!(matches!(err, PenumbraError::SchemaViolation(_)));
    mgmt.rollback()?;

    let mut tx = a.new_transaction()?;
    let holder = tx.add_vertex()?;
    tx.set_property(&holder, "token", "abc")?;
    let session = tx.add_labeled_vertex("session")?;
    tx.commit()?;

    let b = common::open(&backend, "b")?;
    let tx = b.new_transaction()?;
    assert_eq!(tx.value(&holder, "token")?, Some(PropertyValue::from("abc")));
    assert!(tx.vertex_exists(&session)?);
    drop(tx);

    std::thread::sleep(Duration::from_millis(1200));
    let tx = b.new_transaction()?;
    assert!(tx.vertex_exists(&holder)?);
    assert_eq!(tx.value(&holder, "token")?, None);
    assert!(!tx.vertex_exists(&session)?);
    drop(tx);
    a.close()?;
    b.close()
}
