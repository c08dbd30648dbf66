#![forbid(unsafe_code)]

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use penumbra::config::{GraphConfig, PlacementKind};
use penumbra::primitives::kcv::{InMemoryStoreManager, StoreManager};
use penumbra::storage::ids::{CustomIdPolicy, IdAssigner, IdManager, PlacementHint};
use penumbra::storage::layout::IDS;
use penumbra::storage::IdCategory;

const IDS_PER_ITER: u64 = 256;

fn micro_ids(c: &mut Criterion) {
    let mut group = c.benchmark_group("micro/ids");
    group.sample_size(25);
    for placement in [PlacementKind::Default, PlacementKind::Bulk] {
        let cfg = GraphConfig::default()
            .placement(placement)
            .block_size(10_000);
        let manager = InMemoryStoreManager::new();
        let ids = IdManager::new(cfg.partition_bits(), false).expect("id manager");
        let assigner = IdAssigner::new(
            ids,
            manager.open_store(IDS).expect("ids store"),
            "bench",
            &cfg.ids,
            CustomIdPolicy::default(),
        );
        group.throughput(Throughput::Elements(IDS_PER_ITER));
        group.bench_with_input(
            BenchmarkId::new("allocate_vertex", format!("{placement:?}")),
            &placement,
            |b, _| {
                b.iter(|| {
                    for _ in 0..IDS_PER_ITER {
                        assigner
                            .allocate(IdCategory::Vertex, &PlacementHint::default())
                            .expect("allocate");
                    }
                });
            },
        );
        assigner.close();
    }

    let ids = IdManager::new(5, true).expect("id manager");
    group.throughput(Throughput::Elements(IDS_PER_ITER));
    group.bench_function("custom_id_bijection", |b| {
        b.iter(|| {
            for user in 1..=IDS_PER_ITER {
                let id = ids.to_vertex_id(user).expect("to");
                assert_eq!(ids.from_vertex_id(id).expect("from"), user);
            }
        });
    });
    group.finish();
}

criterion_group!(benches, micro_ids);
criterion_main!(benches);
