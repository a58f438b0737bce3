//! Fixed-rate server example.
//!
//! Demonstrates: configure → register a world → start the tick thread →
//! feed an inbox from another thread → schedule a task → read snapshots →
//! stop.
//!
//! Run with `RUST_LOG=debug` for per-partition logging.

use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use tessera_bench::{populate, BenchDomain, Cell, Mob, Profile, Region};
use tessera_core::{EntityId, InstanceId, TickStart, UpdateError};
use tessera_engine::{
    inbox, outbound, CapturingUpdater, EngineConfig, LoggingSink, Schedule, SchedulePhase, Server, TickMonitor,
};
use tracing::info;
use tracing_subscriber::EnvFilter;

/// Heat to add to one chunk, submitted from outside the tick loop.
struct Warm {
    cell: usize,
    amount: u64,
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = EngineConfig {
        worker_count: Some(4),
        tick_rate_hz: Some(20.0),
        ..EngineConfig::default()
    }
    .from_env()
    .unwrap();
    let server: Arc<Server<BenchDomain>> = Arc::new(Server::new(config, Arc::new(LoggingSink)).unwrap());

    let profile = Profile {
        side: 8,
        mobs_per_chunk: 2,
        work: 64,
        cross_partition: true,
    };
    let deliveries = Arc::new(Mutex::new(Vec::new()));
    let delivered = Arc::clone(&deliveries);

    let (warm_tx, world) = server
        .execute(move |ticker| {
            let world = populate(ticker, &profile).unwrap();

            // Inbox: external input handed to the tick loop in phase 2.
            let cells = world.cells.clone();
            let (tx, rx) = inbox("warm", 256, 64, move |warm: Warm, _tick: TickStart| -> Result<(), UpdateError> {
                let cell = cells
                    .get(warm.cell)
                    .ok_or_else(|| UpdateError::failed(format!("no cell {}", warm.cell)))?;
                cell.with_safe(move |c: &mut Cell| c.heat += warm.amount);
                Ok(())
            });
            ticker.add_inbox(rx);

            // Outbound: per-tick heat reports released in the flush phase.
            let (writer, buffer) = outbound("heat-report", move |batch: Vec<u64>, tick: TickStart| {
                delivered.lock().unwrap().push((tick.tick, batch.iter().sum::<u64>()));
                Ok(())
            });
            ticker.add_flush(buffer);

            let cells = world.cells.clone();
            ticker
                .scheduler_mut()
                .schedule(SchedulePhase::TickEnd, Schedule::Every(10), move |_| {
                    let total: u64 = cells.iter().map(|c| c.sync(|c| c.heat)).sum();
                    writer.write(total);
                    Ok(())
                });

            ticker.add_observer(|m: &TickMonitor| {
                if m.tick.0 % 20 == 0 {
                    info!(tick = %m.tick, tick_ms = m.tick_time_ms, acquire_ms = m.acquisition_time_ms, "tick");
                }
            });

            (tx, world.instance)
        })
        .unwrap();

    server.start().unwrap();

    let producer = thread::spawn(move || {
        for i in 0..40 {
            if warm_tx.try_submit(Warm { cell: i % 64, amount: 5 }).is_err() {
                info!("warm inbox full, dropping input");
            }
            thread::sleep(Duration::from_millis(25));
        }
    });

    thread::sleep(Duration::from_secs(2));
    producer.join().unwrap();
    print_snapshot(&server, world);

    let report = server.stop().unwrap();
    println!("\nshutdown: {report:?}");
    for (tick, total) in deliveries.lock().unwrap().iter() {
        println!("  heat report at {tick}: {total}");
    }
}

fn print_snapshot(server: &Server<BenchDomain>, world: InstanceId) {
    let updater = CapturingUpdater::<BenchDomain, u64, u64>::new(
        |_, region: &Region| region.ticks,
        |_, mob: &Mob| mob.steps,
    );
    let snap = server.update_snapshot(updater).unwrap();
    thread::sleep(Duration::from_millis(200));

    println!("=== Snapshot at {} ===", snap.tick());
    println!("  region ticks: {:?}", snap.instance(world));
    println!("  entities: {}", snap.entity_count());
    let filled = snap.entities_of(world).filter(|(_, steps)| steps.is_some()).count();
    println!("  entity snapshots filled: {filled}");
    if let Some(steps) = snap.entity(EntityId(1)) {
        println!("  mob 1 steps: {steps}");
    }
}
