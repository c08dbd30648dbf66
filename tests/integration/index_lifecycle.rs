#![allow(missing_docs)]

mod common;

use std::thread;
use std::time::Duration;

use penumbra::graph::{EdgePlan, QueryPlan};
use penumbra::storage::schema::{
    is_legal_transition, plan, ActionPlan, DataType, ElementCategory, Order, SchemaAction,
    SchemaStatus,
};
use penumbra::{Direction, ManagementSystem, PenumbraError, PropertyValue, Result};
use proptest::prelude::*;

const WAIT: Duration = Duration::from_secs(5);

#[test]
fn registration_waits_for_open_transactions_on_every_instance() -> Result<()> {
    let backend = common::backend();
    let a = common::open(&backend, "a")?;
    let b = common::open(&backend, "b")?;
    let mut mgmt = a.open_management()?;
    mgmt.make_property_key("name").make()?;
    mgmt.commit()?;

    let long_running = b.new_transaction()?;
    let mut mgmt = a.open_management()?;
    mgmt.build_index("byName", ElementCategory::Vertex)
        .add_key("name")
        .build_composite_index()?;
    let report = mgmt.commit()?;
    assert!(report.eviction_id.is_some());
    assert!(report.secondary_failure.is_none());

    thread::sleep(Duration::from_millis(150));
    let mut mgmt = a.open_management()?;
    assert!(mgmt.get_index_status("byName")?.all(SchemaStatus::Installed));
    let err = mgmt.update_index("byName", SchemaAction::EnableIndex).unwrap_err();
    assert!(matches!(err, PenumbraError::LifecyclePrecondition(_)), "{err}");
    mgmt.rollback()?;

    long_running.rollback()?;
    ManagementSystem::await_index_status(&a, "byName", SchemaStatus::Registered, WAIT)?;
    let mut mgmt = a.open_management()?;
    assert!(mgmt.update_index("byName", SchemaAction::EnableIndex)?.is_done());
    mgmt.commit()?;
    let mut mgmt = a.open_management()?;
    assert!(mgmt.get_index_status("byName")?.all(SchemaStatus::Enabled));
    mgmt.rollback()?;
    a.close()?;
    b.close()
}

#[test]
fn enable_without_reindex_only_covers_writes_after_registration() -> Result<()> {
    let backend = common::backend();
    let a = common::open(&backend, "a")?;
    let b = common::open(&backend, "b")?;
    let mut mgmt = a.open_management()?;
    mgmt.make_property_key("name").make()?;
    mgmt.commit()?;
    let mut tx = a.new_transaction()?;
    let early = tx.add_vertex()?;
    tx.set_property(&early, "name", "early")?;
    tx.commit()?;

    let mut mgmt = a.open_management()?;
    mgmt.build_index("byName", ElementCategory::Vertex)
        .add_key("name")
        .build_composite_index()?;
    mgmt.commit()?;
    ManagementSystem::await_index_status(&a, "byName", SchemaStatus::Registered, WAIT)?;
    b.poll_management_log()?;

    let mut tx = b.new_transaction()?;
    let late = tx.add_vertex()?;
    tx.set_property(&late, "name", "late")?;
    tx.commit()?;

    let mut mgmt = a.open_management()?;
    assert!(mgmt.update_index("byName", SchemaAction::EnableIndex)?.is_done());
    mgmt.commit()?;

    let tx = a.new_transaction()?;
    let query = tx.query().has("name", "late");
    assert_eq!(
        query.plan()?,
        QueryPlan::IndexFitted {
            index: "byName".into()
        }
    );
    assert_eq!(query.vertices()?, vec![late.clone()]);
    assert!(tx.query().has("name", "early").vertices()?.is_empty());
    drop(tx);

    let mut mgmt = a.open_management()?;
    let job = mgmt.update_index("byName", SchemaAction::Reindex)?;
    mgmt.commit()?;
    job.get(WAIT)?;
    let tx = a.new_transaction()?;
    assert_eq!(tx.query().has("name", "early").vertices()?, vec![early]);
    drop(tx);
    a.close()?;
    b.close()
}

#[test]
fn force_closing_a_stuck_instance_unblocks_registration() -> Result<()> {
    let backend = common::backend();
    let a = common::open(&backend, "a")?;
    let stuck = penumbra::Graph::open(
        backend.clone(),
        common::config("stuck").log_timing(3_600_000, 10),
    )?;
    let mut mgmt = a.open_management()?;
    mgmt.make_property_key("uid").data_type(DataType::Long).make()?;
    mgmt.commit()?;
    let mut mgmt = a.open_management()?;
    mgmt.build_index("byUid", ElementCategory::Vertex)
        .add_key("uid")
        .build_composite_index()?;
    mgmt.commit()?;

    let err = ManagementSystem::await_index_status(
        &a,
        "byUid",
        SchemaStatus::Registered,
        Duration::from_millis(200),
    )
    .unwrap_err();
    assert!(matches!(err, PenumbraError::Timeout { .. }));

    let mut mgmt = a.open_management()?;
    let mut open = mgmt.get_open_instances()?;
    open.sort();
    assert_eq!(open, vec!["a(current)".to_owned(), "stuck".to_owned()]);
    let err = mgmt.update_index("byUid", SchemaAction::EnableIndex).unwrap_err();
    assert!(matches!(err, PenumbraError::LifecyclePrecondition(_)), "{err}");
    mgmt.force_close_instance("stuck")?;
    mgmt.commit()?;
    ManagementSystem::await_index_status(&a, "byUid", SchemaStatus::Registered, WAIT)?;
    let mut mgmt = a.open_management()?;
    assert!(mgmt.update_index("byUid", SchemaAction::EnableIndex)?.is_done());
    mgmt.commit()?;
    ManagementSystem::await_index_status(&a, "byUid", SchemaStatus::Enabled, WAIT)?;

    let err = stuck.poll_management_log().unwrap_err();
    assert!(matches!(err, PenumbraError::InstanceEvicted(_)));
    assert!(stuck.is_evicted());
    assert!(matches!(
        stuck.new_transaction().map(|_| ()).unwrap_err(),
        PenumbraError::InstanceEvicted(_)
    ));
    stuck.close()?;
    a.close()
}

#[test]
fn mixed_index_fields_added_later_register_independently() -> Result<()> {
    let backend = common::backend();
    let a = common::open(&backend, "a")?;
    let mut mgmt = a.open_management()?;
    mgmt.make_property_key("name").make()?;
    mgmt.make_property_key("age").data_type(DataType::Long).make()?;
    mgmt.build_index("search", ElementCategory::Vertex)
        .add_key("name")
        .build_mixed_index("search")?;
    mgmt.commit()?;

    let mut mgmt = a.open_management()?;
    mgmt.add_index_key("search", "age")?;
    let err = mgmt.add_index_key("search", "age").unwrap_err();
    assert!(matches!(err, PenumbraError::SchemaViolation(_)));
    mgmt.commit()?;

    let mut ready = false;
    for _ in 0..500 {
        let mut mgmt = a.open_management()?;
        let report = mgmt.get_index_status("search")?;
        mgmt.rollback()?;
        assert!(report.fields.contains(&("name".to_owned(), SchemaStatus::Enabled)));
        if report.fields.contains(&("age".to_owned(), SchemaStatus::Registered)) {
            ready = true;
            break;
        }
        thread::sleep(Duration::from_millis(10));
    }
    assert!(ready, "age field never registered");

    let mut tx = a.new_transaction()?;
    let v = tx.add_vertex_with(None, &[("name", "ada".into()), ("age", 36i64.into())])?;
    tx.commit()?;
    let tx = a.new_transaction()?;
    assert_eq!(
        tx.query().has("name", "ada").plan()?,
        QueryPlan::IndexFitted {
            index: "search".into()
        }
    );
    assert_eq!(tx.query().has("age", 36i64).plan()?, QueryPlan::FullScan);
    assert_eq!(tx.query().has("age", 36i64).vertices()?, vec![v]);
    drop(tx);
    a.close()
}

#[test]
fn vertex_centric_index_is_rebuilt_and_used() -> Result<()> {
    let backend = common::backend();
    let a = common::open(&backend, "a")?;
    let mut mgmt = a.open_management()?;
    mgmt.make_property_key("stars").data_type(DataType::Long).make()?;
    mgmt.make_edge_label("rated").make()?;
    mgmt.commit()?;

    let mut tx = a.new_transaction()?;
    let user = tx.add_vertex()?;
    for stars in 1..=5i64 {
        let movie = tx.add_vertex()?;
        tx.add_edge_with(&user, "rated", &movie, &[("stars", stars.into())])?;
    }
    tx.commit()?;

    let mut mgmt = a.open_management()?;
    mgmt.build_edge_index("rated", "ratedByStars", Direction::Out, &["stars"], Order::Desc)?;
    mgmt.commit()?;
    ManagementSystem::await_index_status(&a, "ratedByStars", SchemaStatus::Registered, WAIT)?;
    let mut mgmt = a.open_management()?;
    let job = mgmt.update_index("ratedByStars", SchemaAction::Reindex)?;
    mgmt.commit()?;
    let progress = job.get(WAIT)?;
    assert_eq!(progress.records_added, 5);

    let tx = a.new_transaction()?;
    let query = tx
        .vertex_query(&user)
        .direction(Direction::Out)
        .label("rated")
        .has("stars", 4i64);
    assert_eq!(
        query.plan()?,
        EdgePlan::RelationIndex {
            index: "ratedByStars".into()
        }
    );
    let edges = query.edges()?;
    assert_eq!(edges.len(), 1);
    assert_eq!(edges[0].property("stars"), Some(&PropertyValue::Long(4)));
    drop(tx);
    a.close()
}

#[test]
fn removed_index_stays_retired_across_instances() -> Result<()> {
    let backend = common::backend();
    let a = common::open(&backend, "a")?;
    let b = common::open(&backend, "b")?;
    let mut mgmt = a.open_management()?;
    mgmt.make_property_key("uid").data_type(DataType::Long).make()?;
    mgmt.build_index("byUid", ElementCategory::Vertex)
        .add_key("uid")
        .unique()
        .build_composite_index()?;
    mgmt.commit()?;
    let mut tx = a.new_transaction()?;
    let v = tx.add_vertex()?;
    tx.set_property(&v, "uid", 7i64)?;
    tx.commit()?;

    let mut mgmt = a.open_management()?;
    mgmt.update_index("byUid", SchemaAction::DisableIndex)?;
    mgmt.commit()?;
    let mut mgmt = a.open_management()?;
    let job = mgmt.update_index("byUid", SchemaAction::RemoveIndex)?;
    mgmt.commit()?;
    let progress = job.get(WAIT)?;
    assert_eq!(progress.records_deleted, 1);

    let mut mgmt = b.open_management()?;
    assert!(mgmt.get_index_status("byUid")?.all(SchemaStatus::Removed));
    assert!(mgmt.contains_type("byUid")?);
    let err = mgmt.update_index("byUid", SchemaAction::Reindex).unwrap_err();
    assert!(matches!(err, PenumbraError::SchemaViolation(_)));
    mgmt.rollback()?;

    // Uniqueness is no longer enforced once the index is gone.
    b.poll_management_log()?;
    let mut tx = b.new_transaction()?;
    let w = tx.add_vertex()?;
    tx.set_property(&w, "uid", 7i64)?;
    tx.commit()?;
    a.close()?;
    b.close()
}

fn action() -> impl Strategy<Value = SchemaAction> {
    prop_oneof![
        Just(SchemaAction::RegisterIndex),
        Just(SchemaAction::Reindex),
        Just(SchemaAction::EnableIndex),
        Just(SchemaAction::DisableIndex),
        Just(SchemaAction::RemoveIndex),
    ]
}

proptest! {
    #[test]
    fn lifecycle_only_moves_forward(actions in prop::collection::vec(action(), 1..24)) {
        let rank = |s: SchemaStatus| match s {
            SchemaStatus::Installed => 0,
            SchemaStatus::Registered => 1,
            SchemaStatus::Enabled => 2,
            SchemaStatus::Disabled => 3,
            SchemaStatus::Removed => 4,
        };
        let mut status = SchemaStatus::Installed;
        for action in actions {
            let next = match plan(action, status, "idx") {
                Ok(ActionPlan::NoOp) => status,
                Ok(ActionPlan::Immediate(to) | ActionPlan::AfterAcks(to) | ActionPlan::AfterScan(to)) => {
                    prop_assert!(to == status || is_legal_transition(status, to));
                    to
                }
                Err(PenumbraError::LifecyclePrecondition(_)) => status,
                Err(PenumbraError::SchemaViolation(_)) => {
                    prop_assert_eq!(status, SchemaStatus::Removed);
                    status
                }
                Err(other) => return Err(TestCaseError::fail(other.to_string())),
            };
            prop_assert!(rank(next) >= rank(status));
            status = next;
        }
    }
}
