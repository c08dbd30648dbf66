#![allow(missing_docs)]

mod common;

use std::collections::BTreeSet;
use std::thread;

use penumbra::storage::ids::IdKind;
use penumbra::storage::ids::{vertex_row_key, LONG_KEY_LEN, VERTEX_TYPE_BITS};
use penumbra::{Direction, PenumbraError, PropertyValue, Result, VertexId};

fn numeric(id: &VertexId) -> u64 {
    match id {
        VertexId::Long(id) => *id,
        VertexId::Str(s) => panic!("unexpected string id {s}"),
    }
}

#[test]
fn concurrent_instances_never_share_vertex_ids() -> Result<()> {
    let backend = common::backend();
    let graphs = [common::open(&backend, "a")?, common::open(&backend, "b")?];
    let handles: Vec<_> = graphs
        .iter()
        .cloned()
        .map(|graph| {
            thread::spawn(move || -> Result<Vec<u64>> {
                let mut ids = Vec::new();
                for _ in 0..5 {
                    let mut tx = graph.new_transaction()?;
                    for _ in 0..60 {
                        ids.push(numeric(&tx.add_vertex()?));
                    }
                    tx.commit()?;
                }
                Ok(ids)
            })
        })
        .collect();
    let mut seen = BTreeSet::new();
    for handle in handles {
        for id in handle.join().expect("allocating thread")? {
            assert!(seen.insert(id), "id {id} allocated twice");
        }
    }
    assert_eq!(seen.len(), 600);
    let manager = *graphs[0].id_manager();
    for id in &seen {
        let info = manager.decode(*id)?;
        assert_eq!(info.kind, IdKind::NormalVertex);
        assert!(info.partition.expect("vertex partition").0 < 8);
    }
    for graph in graphs {
        graph.close()?;
    }
    Ok(())
}

#[test]
fn partitioned_and_static_labels_get_their_own_id_kinds() -> Result<()> {
    let backend = common::backend();
    let graph = common::open(&backend, "a")?;
    let mut mgmt = graph.open_management()?;
    mgmt.make_vertex_label("hub").partition().make()?;
    mgmt.make_vertex_label("event").set_static().make()?;
    mgmt.commit()?;

    let mut tx = graph.new_transaction()?;
    let hub = tx.add_labeled_vertex("hub")?;
    let event = tx.add_labeled_vertex("event")?;
    tx.set_property(&event, "kind", "created")?;
    tx.commit()?;
    let manager = graph.id_manager();
    assert_eq!(manager.decode(numeric(&hub))?.kind, IdKind::PartitionedVertex);
    assert_eq!(manager.decode(numeric(&event))?.kind, IdKind::UnmodifiableVertex);

    let mut tx = graph.new_transaction()?;
    let err = tx.set_property(&event, "kind", "changed").unwrap_err();
    assert!(matches!(err, PenumbraError::SchemaViolation(_)));
    assert_eq!(tx.vertex_label(&event)?.as_deref(), Some("event"));
    tx.rollback()?;
    graph.close()
}

#[test]
fn custom_numeric_ids_are_required_once_enabled() -> Result<()> {
    let backend = common::backend();
    let graph = penumbra::Graph::open(
        backend.clone(),
        common::config("a").custom_vertex_ids(true, false),
    )?;
    let ids = *graph.id_manager();
    let mut tx = graph.new_transaction()?;
    let err = tx.add_vertex().unwrap_err();
    assert_eq!(err.to_string(), "invalid id: Must provide vertex id");

    let id = ids.to_vertex_id(42)?;
    let v = tx.add_vertex_with_id(id, None)?;
    assert_eq!(ids.from_vertex_id(numeric(&v))?, 42);
    let err = tx.add_vertex_with_id(id, None).unwrap_err();
    assert!(matches!(err, PenumbraError::SchemaViolation(_)));
    let err = tx.add_vertex_with_id(43u64, None).unwrap_err();
    assert_eq!(err.to_string(), "invalid id: Not a valid vertex id: 43");
    // Same count with a partition bit set would share the row of `id`.
    let shadow = id | 0b1000;
    let err = tx.add_vertex_with_id(shadow, None).unwrap_err();
    assert_eq!(err.to_string(), format!("invalid id: Not a valid vertex id: {shadow}"));
    let err = tx.add_vertex_with_id("alice", None).unwrap_err();
    assert!(err
        .to_string()
        .contains("Vertex does not support user supplied identifiers of this type"));
    tx.commit()?;
    graph.close()?;

    // Persisted options outlive the config of later opens.
    let graph = common::open(&backend, "b")?;
    assert!(graph.options().allow_custom_vertex_ids);
    let tx = graph.new_transaction()?;
    assert!(tx.vertex_exists(&VertexId::Long(id))?);
    drop(tx);
    graph.close()
}

#[test]
fn custom_string_ids_reject_reserved_characters() -> Result<()> {
    let backend = common::backend();
    let graph = penumbra::Graph::open(
        backend.clone(),
        common::config("a").custom_vertex_ids(true, true),
    )?;
    let mut tx = graph.new_transaction()?;
    let alice = tx.add_vertex_with_id("alice", None)?;
    assert_eq!(alice, VertexId::Str("alice".into()));
    let err = tx.add_vertex_with_id("al-ice", None).unwrap_err();
    assert!(err.to_string().contains("reserved string (-)"));
    let err = tx.add_vertex_with_id("al\u{7}ice", None).unwrap_err();
    assert!(err.to_string().contains("non-ascii or non-printable"));
    let bob = tx.add_vertex_with_id("bob", None)?;
    tx.add_edge(&alice, "knows", &bob)?;
    tx.commit()?;

    let tx = graph.new_transaction()?;
    let out = tx.edges(&alice, penumbra::Direction::Out, Some("knows"))?;
    assert_eq!(out.len(), 1);
    assert_eq!(out[0].inv, bob);
    drop(tx);
    graph.close()
}

#[test]
fn seven_and_eight_byte_string_ids_survive_storage() -> Result<()> {
    let backend = common::backend();
    let graph = penumbra::Graph::open(
        backend.clone(),
        common::config("a").custom_vertex_ids(true, true),
    )?;
    let ids = *graph.id_manager();
    // Below the partition bits its row key spells "abcdefg\0".
    let raw = u64::from_be_bytes(*b"abcdefg\0");
    let count = (raw >> VERTEX_TYPE_BITS) % ids.vertex_count_bound();
    let number = VertexId::Long(ids.to_vertex_id(count)?);
    assert_eq!(vertex_row_key(&ids, &number)?.len(), LONG_KEY_LEN);

    let mut tx = graph.new_transaction()?;
    let seven = tx.add_vertex_with_id("abcdefg", None)?;
    let eight = tx.add_vertex_with_id("abcdefgh", None)?;
    let n = tx.add_vertex_with_id(number.clone(), None)?;
    for (v, name) in [(&seven, "seven"), (&eight, "eight"), (&n, "number")] {
        tx.set_property(v, "name", name)?;
    }
    tx.add_edge(&seven, "next", &eight)?;
    tx.add_edge(&eight, "next", &n)?;
    tx.commit()?;

    let tx = graph.new_transaction()?;
    for (v, name) in [(&seven, "seven"), (&eight, "eight"), (&n, "number")] {
        assert_eq!(tx.value(v, "name")?, Some(PropertyValue::from(name)));
        assert_eq!(tx.query().has("name", name).vertices()?, vec![v.clone()]);
    }
    let out = tx.edges(&seven, Direction::Out, Some("next"))?;
    assert_eq!(out.len(), 1);
    assert_eq!(out[0].inv, VertexId::Str("abcdefgh".into()));
    let into_number = tx.edges(&number, Direction::In, Some("next"))?;
    assert_eq!(into_number.len(), 1);
    assert_eq!(into_number[0].out, eight);
    assert_eq!(tx.edges(&eight, Direction::Both, None)?.len(), 2);
    drop(tx);
    graph.close()
}

#[test]
fn schema_ids_never_carry_a_partition() -> Result<()> {
    let backend = common::backend();
    let graph = common::open(&backend, "a")?;
    let mut mgmt = graph.open_management()?;
    let key = mgmt.make_property_key("name").make()?;
    let label = mgmt.make_edge_label("knows").make()?;
    let vlabel = mgmt.make_vertex_label("person").make()?;
    mgmt.commit()?;
    let manager = graph.id_manager();
    assert_eq!(manager.decode(key.id.0)?.kind, IdKind::PropertyKey);
    assert_eq!(manager.decode(label.id.0)?.kind, IdKind::EdgeLabel);
    assert_eq!(manager.decode(vlabel.id.0)?.kind, IdKind::VertexLabel);
    assert!(manager.decode(key.id.0)?.partition.is_none());
    graph.close()
}
