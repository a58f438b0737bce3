//! Partition-to-worker assignment and between-tick rebalancing.
//!
//! New partitions are placed by an [`AssignmentPolicy`]. After each
//! barrier, [`PartitionAssigner::plan_rebalance`] may propose a small set
//! of [`Migration`]s from the most-loaded worker towards the least-loaded
//! one, using each partition's smoothed callback cost. Migrations only
//! take effect from the next tick.

use std::fmt;
use std::time::Duration;

use smallvec::SmallVec;
use tessera_core::{PartitionKey, WorkerId};

use crate::config::{AssignmentStrategy, RebalanceConfig};

/// Load carried by one worker, as seen by an [`AssignmentPolicy`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct WorkerLoad {
    /// The worker.
    pub worker: WorkerId,
    /// Number of partitions it owns.
    pub partitions: usize,
    /// Sum of the smoothed costs of those partitions, in nanoseconds.
    pub cost_ns: u64,
}

/// One partition's owner and smoothed cost, input to rebalancing.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PartitionLoad {
    /// The partition.
    pub key: PartitionKey,
    /// Its current owner.
    pub owner: WorkerId,
    /// Smoothed callback cost in nanoseconds.
    pub cost_ns: u64,
}

/// A planned ownership change.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Migration {
    /// The partition to move.
    pub key: PartitionKey,
    /// Its owner before the move.
    pub from: WorkerId,
    /// Its owner from the next tick on.
    pub to: WorkerId,
}

/// Decides which worker receives a newly created partition.
///
/// `loads` always has one entry per worker, in worker order. A returned
/// worker outside the pool is wrapped into range.
pub trait AssignmentPolicy: Send {
    /// Short name for logs.
    fn name(&self) -> &'static str;

    /// Pick the owner of `key`.
    fn assign(&mut self, key: PartitionKey, loads: &[WorkerLoad]) -> WorkerId;

    /// Whether the dispatcher should also rebalance existing partitions.
    fn rebalances(&self) -> bool {
        false
    }
}

/// Hands partitions out to workers in turn, ignoring load.
///
/// Never migrates: a partition stays where it was first placed.
#[derive(Clone, Debug, Default)]
pub struct RoundRobin {
    next: usize,
}

impl AssignmentPolicy for RoundRobin {
    fn name(&self) -> &'static str {
        "round-robin"
    }

    fn assign(&mut self, _key: PartitionKey, loads: &[WorkerLoad]) -> WorkerId {
        let n = loads.len().max(1);
        let worker = WorkerId((self.next % n) as u32);
        self.next = self.next.wrapping_add(1);
        worker
    }
}

/// Places partitions on the cheapest worker, fewest partitions breaking
/// ties, and lets the dispatcher rebalance between ticks.
#[derive(Clone, Debug, Default)]
pub struct LeastLoaded;

impl AssignmentPolicy for LeastLoaded {
    fn name(&self) -> &'static str {
        "least-loaded"
    }

    fn assign(&mut self, _key: PartitionKey, loads: &[WorkerLoad]) -> WorkerId {
        loads
            .iter()
            .min_by_key(|l| (l.cost_ns, l.partitions, l.worker))
            .map_or(WorkerId(0), |l| l.worker)
    }

    fn rebalances(&self) -> bool {
        true
    }
}

impl AssignmentStrategy {
    /// Instantiate the policy this strategy names.
    pub fn into_policy(self) -> Box<dyn AssignmentPolicy> {
        match self {
            Self::RoundRobin => Box::new(RoundRobin::default()),
            Self::LeastLoaded => Box::new(LeastLoaded),
        }
    }
}

/// Sum partition loads per worker.
pub fn worker_loads(partitions: &[PartitionLoad], worker_count: usize) -> Vec<WorkerLoad> {
    let mut loads: Vec<WorkerLoad> = (0..worker_count)
        .map(|i| WorkerLoad {
            worker: WorkerId(i as u32),
            partitions: 0,
            cost_ns: 0,
        })
        .collect();
    for p in partitions {
        if let Some(load) = loads.get_mut(p.owner.index()) {
            load.partitions += 1;
            load.cost_ns = load.cost_ns.saturating_add(p.cost_ns);
        }
    }
    loads
}

/// Wraps an [`AssignmentPolicy`] with the rebalance settings.
pub struct PartitionAssigner {
    policy: Box<dyn AssignmentPolicy>,
    config: RebalanceConfig,
}

impl fmt::Debug for PartitionAssigner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PartitionAssigner")
            .field("policy", &self.policy.name())
            .field("config", &self.config)
            .finish()
    }
}

impl PartitionAssigner {
    /// Create an assigner from a policy and rebalance settings.
    pub fn new(policy: Box<dyn AssignmentPolicy>, config: RebalanceConfig) -> Self {
        Self { policy, config }
    }

    /// Name of the active policy.
    pub fn policy_name(&self) -> &'static str {
        self.policy.name()
    }

    /// Pick an owner for a new partition.
    pub fn assign(&mut self, key: PartitionKey, loads: &[WorkerLoad]) -> WorkerId {
        let picked = self.policy.assign(key, loads);
        let n = loads.len().max(1);
        WorkerId((picked.index() % n) as u32)
    }

    /// Plan migrations that flatten the per-worker cost distribution.
    ///
    /// Greedy: repeatedly moves the largest partition that fits strictly
    /// inside the gap between the most- and least-loaded worker, so each
    /// move lowers the sum of squared loads and never raises the maximum.
    /// Stops when `max / min <= imbalance_ratio`, when no partition fits,
    /// or after `max_migrations` moves. A partition moved twice appears
    /// once, with its final destination.
    pub fn plan_rebalance(
        &self,
        partitions: &[PartitionLoad],
        worker_count: usize,
        observed: Duration,
    ) -> SmallVec<[Migration; 8]> {
        let mut plan = SmallVec::new();
        if !self.policy.rebalances()
            || worker_count < 2
            || self.config.max_migrations == 0
            || observed < Duration::from_millis(self.config.min_tick_ms)
        {
            return plan;
        }

        let mut loads = vec![0u64; worker_count];
        let mut owners: Vec<WorkerId> = Vec::with_capacity(partitions.len());
        for p in partitions {
            let owner = if p.owner.index() < worker_count {
                p.owner
            } else {
                WorkerId(0)
            };
            loads[owner.index()] = loads[owner.index()].saturating_add(p.cost_ns);
            owners.push(owner);
        }

        for _ in 0..self.config.max_migrations {
            let (hi, lo) = extremes(&loads);
            if loads[hi] == 0 || loads[hi] as f64 <= loads[lo] as f64 * self.config.imbalance_ratio {
                break;
            }
            let gap = loads[hi] - loads[lo];
            let candidate = partitions
                .iter()
                .enumerate()
                .filter(|(i, p)| owners[*i].index() == hi && p.cost_ns > 0 && p.cost_ns < gap)
                .max_by_key(|(i, p)| (p.cost_ns, std::cmp::Reverse(*i)));
            let Some((i, p)) = candidate else {
                break;
            };
            owners[i] = WorkerId(lo as u32);
            loads[hi] -= p.cost_ns;
            loads[lo] += p.cost_ns;
        }

        for (p, owner) in partitions.iter().zip(&owners) {
            if *owner != p.owner && p.owner.index() < worker_count {
                plan.push(Migration {
                    key: p.key,
                    from: p.owner,
                    to: *owner,
                });
            }
        }
        plan
    }
}

/// Indices of the most- and least-loaded workers (lowest index on ties).
fn extremes(loads: &[u64]) -> (usize, usize) {
    let mut hi = 0;
    let mut lo = 0;
    for (i, &load) in loads.iter().enumerate() {
        if load > loads[hi] {
            hi = i;
        }
        if load < loads[lo] {
            lo = i;
        }
    }
    (hi, lo)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use tessera_core::{ChunkPos, InstanceId};

    fn keys(n: usize) -> Vec<PartitionKey> {
        let inst = InstanceId::next();
        (0..n)
            .map(|i| PartitionKey::new(inst, ChunkPos::new(i as i32, 0)))
            .collect()
    }

    fn rebalancing(max_migrations: usize) -> PartitionAssigner {
        PartitionAssigner::new(
            Box::new(LeastLoaded),
            RebalanceConfig {
                imbalance_ratio: 1.25,
                max_migrations,
                min_tick_ms: 0,
            },
        )
    }

    fn max_load(partitions: &[PartitionLoad], plan: &[Migration], workers: usize) -> u64 {
        let moved: Vec<PartitionLoad> = partitions
            .iter()
            .map(|p| {
                let owner = plan
                    .iter()
                    .find(|m| m.key == p.key)
                    .map_or(p.owner, |m| m.to);
                PartitionLoad { owner, ..*p }
            })
            .collect();
        worker_loads(&moved, workers)
            .iter()
            .map(|l| l.cost_ns)
            .max()
            .unwrap_or(0)
    }

    #[test]
    fn round_robin_cycles() {
        let mut rr = RoundRobin::default();
        let loads = worker_loads(&[], 3);
        let k = keys(1)[0];
        let picked: Vec<u32> = (0..7).map(|_| rr.assign(k, &loads).0).collect();
        assert_eq!(picked, vec![0, 1, 2, 0, 1, 2, 0]);
        assert!(!rr.rebalances());
    }

    #[test]
    fn least_loaded_prefers_cheap_then_sparse() {
        let mut ll = LeastLoaded;
        let k = keys(1)[0];
        let loads = [
            WorkerLoad { worker: WorkerId(0), partitions: 1, cost_ns: 0 },
            WorkerLoad { worker: WorkerId(1), partitions: 0, cost_ns: 0 },
            WorkerLoad { worker: WorkerId(2), partitions: 0, cost_ns: 5 },
        ];
        assert_eq!(ll.assign(k, &loads), WorkerId(1));
    }

    #[test]
    fn out_of_range_choice_is_wrapped() {
        struct Wild;
        impl AssignmentPolicy for Wild {
            fn name(&self) -> &'static str {
                "wild"
            }
            fn assign(&mut self, _: PartitionKey, _: &[WorkerLoad]) -> WorkerId {
                WorkerId(7)
            }
        }
        let mut a = PartitionAssigner::new(Box::new(Wild), RebalanceConfig::default());
        assert_eq!(a.assign(keys(1)[0], &worker_loads(&[], 4)), WorkerId(3));
    }

    #[test]
    fn round_robin_never_rebalances() {
        let a = PartitionAssigner::new(
            Box::new(RoundRobin::default()),
            RebalanceConfig {
                min_tick_ms: 0,
                ..RebalanceConfig::default()
            },
        );
        let ks = keys(4);
        let parts: Vec<PartitionLoad> = ks
            .iter()
            .map(|&key| PartitionLoad { key, owner: WorkerId(0), cost_ns: 100 })
            .collect();
        assert!(a.plan_rebalance(&parts, 2, Duration::from_secs(1)).is_empty());
    }

    #[test]
    fn short_ticks_skip_rebalance() {
        let a = PartitionAssigner::new(
            Box::new(LeastLoaded),
            RebalanceConfig {
                min_tick_ms: 50,
                ..RebalanceConfig::default()
            },
        );
        let ks = keys(2);
        let parts = [
            PartitionLoad { key: ks[0], owner: WorkerId(0), cost_ns: 100 },
            PartitionLoad { key: ks[1], owner: WorkerId(0), cost_ns: 100 },
        ];
        assert!(a.plan_rebalance(&parts, 2, Duration::from_millis(10)).is_empty());
        assert_eq!(a.plan_rebalance(&parts, 2, Duration::from_millis(60)).len(), 1);
    }

    #[test]
    fn pile_on_one_worker_spreads_out() {
        let a = rebalancing(8);
        let ks = keys(4);
        let parts: Vec<PartitionLoad> = ks
            .iter()
            .map(|&key| PartitionLoad { key, owner: WorkerId(0), cost_ns: 100 })
            .collect();
        let plan = a.plan_rebalance(&parts, 4, Duration::from_millis(100));
        assert_eq!(plan.len(), 3);
        assert_eq!(max_load(&parts, &plan, 4), 100);
        assert!(plan.iter().all(|m| m.from == WorkerId(0)));
    }

    #[test]
    fn single_heavy_partition_stays_put() {
        let a = rebalancing(8);
        let ks = keys(1);
        let parts = [PartitionLoad { key: ks[0], owner: WorkerId(1), cost_ns: 1_000 }];
        // Moving it would only shift the maximum to another worker.
        assert!(a.plan_rebalance(&parts, 2, Duration::from_millis(100)).is_empty());
    }

    #[test]
    fn migration_cap_is_respected() {
        let a = rebalancing(1);
        let ks = keys(6);
        let parts: Vec<PartitionLoad> = ks
            .iter()
            .map(|&key| PartitionLoad { key, owner: WorkerId(0), cost_ns: 10 })
            .collect();
        assert_eq!(a.plan_rebalance(&parts, 3, Duration::from_millis(100)).len(), 1);
    }

    proptest! {
        #[test]
        fn rebalance_invariants(
            costs in prop::collection::vec((0u32..4, 0u64..10_000), 0..40),
            workers in 1usize..5,
            max_migrations in 0usize..10,
        ) {
            let a = rebalancing(max_migrations);
            let ks = keys(costs.len());
            let parts: Vec<PartitionLoad> = costs
                .iter()
                .zip(&ks)
                .map(|(&(owner, cost_ns), &key)| PartitionLoad {
                    key,
                    owner: WorkerId(owner % workers as u32),
                    cost_ns,
                })
                .collect();

            let plan = a.plan_rebalance(&parts, workers, Duration::from_millis(100));

            prop_assert!(plan.len() <= max_migrations);
            prop_assert!(max_load(&parts, &plan, workers) <= max_load(&parts, &[], workers));
            for m in &plan {
                prop_assert_ne!(m.from, m.to);
                prop_assert!(m.to.index() < workers);
                let original = parts.iter().find(|p| p.key == m.key).map(|p| p.owner);
                prop_assert_eq!(original, Some(m.from));
            }
            let before: u64 = worker_loads(&parts, workers).iter().map(|l| l.cost_ns).sum();
            let after: u64 = {
                let moved: Vec<PartitionLoad> = parts
                    .iter()
                    .map(|p| PartitionLoad {
                        owner: plan.iter().find(|m| m.key == p.key).map_or(p.owner, |m| m.to),
                        ..*p
                    })
                    .collect();
                worker_loads(&moved, workers).iter().map(|l| l.cost_ns).sum()
            };
            prop_assert_eq!(before, after);
        }
    }
}
