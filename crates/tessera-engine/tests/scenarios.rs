//! End-to-end dispatcher and lifecycle scenarios.

use std::sync::Arc;

use tessera_core::{ChunkPos, InstanceId, PartitionKey, TickId, TickStart, UnitKind};
use tessera_engine::{
    EngineConfig, LifecycleError, LifecycleState, Server, ServerError, ThreadDispatcher,
};
use tessera_test_utils::{CollectingSink, CountingUnit, TestDomain};

fn keys(n: usize) -> Vec<PartitionKey> {
    let instance = InstanceId::next();
    (0..n)
        .map(|i| PartitionKey::new(instance, ChunkPos::new(i as i32, 0)))
        .collect()
}

fn dispatcher(workers: usize) -> (ThreadDispatcher<TestDomain>, Arc<CollectingSink>) {
    let sink = Arc::new(CollectingSink::new());
    let config = EngineConfig {
        worker_count: Some(workers),
        ..EngineConfig::default()
    };
    (ThreadDispatcher::new(&config, sink.clone()).unwrap(), sink)
}

// ── Scenario A ───────────────────────────────────────────────────

#[test]
fn four_workers_eight_partitions_all_updated_once() {
    let (mut d, sink) = dispatcher(4);
    let chunks: Vec<_> = keys(8)
        .into_iter()
        .map(|k| d.create_partition(k, CountingUnit::new()).unwrap())
        .collect();

    let stats = d.update_and_await(TickStart::new(TickId(1), 0));

    assert_eq!(stats.partitions, 8);
    for chunk in &chunks {
        assert_eq!(chunk.sync(|c| c.updates), 1);
    }
    let owners: std::collections::BTreeSet<_> = chunks.iter().filter_map(|c| c.owner()).collect();
    assert_eq!(owners.len(), 4, "round robin uses every worker");
    assert!(sink.is_empty());
}

// ── Scenario C ───────────────────────────────────────────────────

#[test]
fn second_start_is_rejected_and_state_stays_running() {
    let sink = Arc::new(CollectingSink::new());
    let config = EngineConfig {
        worker_count: Some(1),
        ..EngineConfig::default()
    };
    let server: Server<TestDomain> = Server::new(config, sink).unwrap();
    assert_eq!(server.start(), Ok(()));
    assert_eq!(
        server.start(),
        Err(ServerError::Lifecycle(LifecycleError::IllegalState {
            expected: LifecycleState::NotStarted,
            actual: LifecycleState::Running,
        }))
    );
    assert_eq!(server.state(), LifecycleState::Running);
}

// ── Scenario D ───────────────────────────────────────────────────

#[test]
fn one_failing_partition_is_reported_once_and_isolated() {
    let (mut d, sink) = dispatcher(4);
    let k = keys(8);
    let q = k[5];
    let chunks: Vec<_> = k
        .iter()
        .map(|key| {
            let unit = if *key == q {
                CountingUnit::failing()
            } else {
                CountingUnit::new()
            };
            d.create_partition(*key, unit).unwrap()
        })
        .collect();

    let stats = d.update_and_await(TickStart::new(TickId(1), 0));

    assert_eq!(stats.failures, 1);
    assert_eq!(sink.len(), 1);
    assert_eq!(sink.unit_failures(), vec![UnitKind::Partition(q)]);
    for (key, chunk) in k.iter().zip(&chunks) {
        let expected = if *key == q { 0 } else { 1 };
        assert_eq!(chunk.sync(|c| c.updates), expected, "{key}");
    }
}

#[test]
fn panicking_partition_is_isolated_like_an_error() {
    let (mut d, sink) = dispatcher(2);
    let k = keys(4);
    let bad = d.create_partition(k[0], CountingUnit::panicking()).unwrap();
    let good: Vec<_> = k[1..]
        .iter()
        .map(|key| d.create_partition(*key, CountingUnit::new()).unwrap())
        .collect();

    for n in 1..=3 {
        let stats = d.update_and_await(TickStart::new(TickId(n), 0));
        assert_eq!(stats.workers_lost, 0);
    }

    assert_eq!(bad.sync(|c| c.updates), 0);
    for chunk in &good {
        assert_eq!(chunk.sync(|c| c.updates), 3);
    }
    assert_eq!(sink.unit_failures(), vec![UnitKind::Partition(k[0]); 3]);
}
