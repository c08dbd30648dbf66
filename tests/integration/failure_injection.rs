#![allow(missing_docs)]

mod common;

use std::time::Duration;

use penumbra::graph::TxLogEntry;
use penumbra::storage::layout::{EDGESTORE, GRAPHINDEX, SCHEMA, SYSTEMLOG};
use penumbra::storage::mgmt::LogId;
use penumbra::storage::schema::{
    ConsistencyModifier, DataType, ElementCategory, SchemaAction, SchemaStatus,
};
use penumbra::{Graph, ManagementSystem, PenumbraError, PropertyValue, Result};

const WAIT: Duration = Duration::from_secs(5);

#[test]
fn failed_log_appends_do_not_undo_the_commit() -> Result<()> {
    let backend = common::backend();
    let mut cfg = common::config("a");
    cfg.log.transaction_log = true;
    let a = Graph::open(backend.clone(), cfg)?;
    let mut mgmt = a.open_management()?;
    mgmt.make_property_key("name").make()?;
    mgmt.commit()?;

    backend.fail_writes(SYSTEMLOG, 0);
    let mut tx = a.new_transaction_with_log("audit")?;
    let v = tx.add_vertex()?;
    tx.set_property(&v, "name", "kept")?;
    let report = tx.commit()?;
    assert!(!report.is_clean());
    let logs: Vec<&str> = report
        .secondary_failures
        .iter()
        .map(|f| f.log.as_str())
        .collect();
    assert_eq!(logs, vec!["txlog", "ulog_audit"]);
    backend.heal(SYSTEMLOG);

    let tx = a.new_transaction()?;
    assert_eq!(tx.value(&v, "name")?, Some(PropertyValue::from("kept")));
    drop(tx);
    assert!(a.read_log(&LogId::Transaction, 0)?.is_empty());

    let mut tx = a.new_transaction()?;
    tx.set_property(&v, "name", "logged")?;
    assert!(tx.commit()?.is_clean());
    let messages = a.read_log(&LogId::Transaction, 0)?;
    assert_eq!(messages.len(), 1);
    let entry: TxLogEntry = serde_json::from_slice(&messages[0].payload)?;
    assert_eq!(entry.vertices, vec![v]);
    a.close()
}

#[test]
fn failed_eviction_is_reported_after_the_schema_change() -> Result<()> {
    let backend = common::backend();
    let a = common::open(&backend, "a")?;
    let mut mgmt = a.open_management()?;
    mgmt.make_property_key("name").make()?;
    mgmt.commit()?;

    backend.fail_writes(SYSTEMLOG, 0);
    let mut mgmt = a.open_management()?;
    mgmt.change_name("name", "label_text")?;
    let report = mgmt.commit()?;
    backend.heal(SYSTEMLOG);
    assert_eq!(report.changed.len(), 1);
    assert!(report.eviction_id.is_none());
    let reason = report.secondary_failure.expect("eviction failure");
    assert!(reason.contains("injected write failure"), "{reason}");

    let mut mgmt = a.open_management()?;
    assert!(mgmt.get_property_key("label_text")?.is_some());
    assert!(mgmt.get_property_key("name")?.is_none());
    mgmt.rollback()?;
    a.close()
}

#[test]
fn failed_primary_write_rolls_the_transaction_back() -> Result<()> {
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
    tx.set_property(&v, "balance", 1i64)?;
    tx.commit()?;

    backend.fail_writes(EDGESTORE, 0);
    let mut tx = a.new_transaction()?;
    tx.set_property(&v, "balance", 2i64)?;
    let err = tx.commit().unwrap_err();
    assert!(matches!(err, PenumbraError::Backend(_)), "{err}");
    assert_eq!(err.kind(), penumbra::ErrorKind::Backend);
    backend.heal(EDGESTORE);
    assert_eq!(a.open_transactions(), 0);

    // The lock went with the failed transaction.
    let mut tx = a.new_transaction()?;
    assert_eq!(tx.value(&v, "balance")?, Some(PropertyValue::Long(1)));
    tx.set_property(&v, "balance", 3i64)?;
    tx.commit()?;
    let tx = a.new_transaction()?;
    assert_eq!(tx.value(&v, "balance")?, Some(PropertyValue::Long(3)));
    drop(tx);
    a.close()
}

#[test]
fn failed_reindex_keeps_the_index_registered() -> Result<()> {
    let backend = common::backend();
    let a = common::open(&backend, "a")?;
    let mut mgmt = a.open_management()?;
    mgmt.make_property_key("name").make()?;
    mgmt.commit()?;
    let mut tx = a.new_transaction()?;
    for i in 0..5 {
        let v = tx.add_vertex()?;
        tx.set_property(&v, "name", format!("v{i}"))?;
    }
    tx.commit()?;

    let mut mgmt = a.open_management()?;
    mgmt.build_index("byName", ElementCategory::Vertex)
        .add_key("name")
        .build_composite_index()?;
    mgmt.commit()?;
    ManagementSystem::await_index_status(&a, "byName", SchemaStatus::Registered, WAIT)?;

    backend.fail_writes(GRAPHINDEX, 0);
    let mut mgmt = a.open_management()?;
    let job = mgmt.update_index("byName", SchemaAction::Reindex)?;
    mgmt.commit()?;
    let err = job.get(WAIT).unwrap_err();
    assert!(matches!(err, PenumbraError::ScanFailed { .. }), "{err}");
    assert_eq!(err.kind(), penumbra::ErrorKind::ScanFailed);
    backend.heal(GRAPHINDEX);

    let mut mgmt = a.open_management()?;
    assert!(mgmt.get_index_status("byName")?.all(SchemaStatus::Registered));
    let job = mgmt.update_index("byName", SchemaAction::Reindex)?;
    mgmt.commit()?;
    let progress = job.get(WAIT)?;
    assert_eq!(progress.records_added, 5);
    ManagementSystem::await_index_status(&a, "byName", SchemaStatus::Enabled, WAIT)?;
    let tx = a.new_transaction()?;
    assert_eq!(tx.query().has("name", "v3").vertices()?.len(), 1);
    drop(tx);
    a.close()
}

#[test]
fn failed_status_update_is_retried_by_a_later_poll() -> Result<()> {
    let backend = common::backend();
    // Polled by hand only.
    let a = Graph::open(backend.clone(), common::config("a").log_timing(3_600_000, 10))?;
    let mut mgmt = a.open_management()?;
    mgmt.make_property_key("name").make()?;
    mgmt.commit()?;
    let mut tx = a.new_transaction()?;
    let v = tx.add_vertex()?;
    tx.set_property(&v, "name", "kept")?;
    tx.commit()?;

    let mut mgmt = a.open_management()?;
    mgmt.build_index("byName", ElementCategory::Vertex)
        .add_key("name")
        .build_composite_index()?;
    mgmt.commit()?;

    backend.fail_writes(SCHEMA, 0);
    let failed = common::eventually(WAIT, || match a.poll_management_log() {
        Ok(_) => Ok(false),
        Err(PenumbraError::Backend(_)) => Ok(true),
        Err(err) => Err(err),
    })?;
    assert!(failed, "registration was never attempted");
    let mut mgmt = a.open_management()?;
    assert!(mgmt.get_index_status("byName")?.all(SchemaStatus::Installed));
    mgmt.rollback()?;

    backend.heal(SCHEMA);
    let outcome = a.poll_management_log()?;
    assert_eq!(outcome.ready.len(), 1);
    let mut mgmt = a.open_management()?;
    assert!(mgmt.get_index_status("byName")?.all(SchemaStatus::Registered));
    mgmt.rollback()?;
    a.close()
}
