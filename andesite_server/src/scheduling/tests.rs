use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::ThreadId;
use std::time::{Duration, Instant};

use anyhow::{bail, Result};
use parking_lot::Mutex;

use crate::game_state::{
    ChunkPosition, InstanceRegistry, TickTime, TickableChunk, TickableEntity, TickableInstance,
};
use crate::server::{Server, ServerConfig};
use crate::ErrorSink;

use super::acquire::Acquirable;
use super::batch::{BatchGranularity, ThreadProvider, TickCosts};
use super::pool::TickThreadPool;

#[ctor::ctor]
fn init() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
}

#[derive(Default)]
struct Counter {
    ticks: AtomicU64,
}

impl Counter {
    fn count(&self) -> u64 {
        self.ticks.load(Ordering::SeqCst)
    }
    fn bump(&self) {
        self.ticks.fetch_add(1, Ordering::SeqCst);
    }
}

struct CountingInstance(Arc<Counter>);
impl TickableInstance for CountingInstance {
    fn tick(&self, _time: TickTime) -> Result<()> {
        self.0.bump();
        Ok(())
    }
}

struct CountingChunk(Arc<Counter>);
impl TickableChunk for CountingChunk {
    fn tick(&self, _time: TickTime, _instance: &dyn TickableInstance) -> Result<()> {
        self.0.bump();
        Ok(())
    }
}

struct CountingEntity(Arc<Counter>);
impl TickableEntity for CountingEntity {
    fn tick(&self, _time: TickTime) -> Result<()> {
        self.0.bump();
        Ok(())
    }
}

#[derive(Default)]
struct SlowState {
    started: AtomicBool,
    slept: AtomicBool,
    thread: Mutex<Option<ThreadId>>,
    ticks: AtomicU64,
}

/// Chunk that stalls its first tick for a configurable duration.
struct SlowChunk {
    state: Arc<SlowState>,
    stall: Duration,
}

impl TickableChunk for SlowChunk {
    fn tick(&self, _time: TickTime, _instance: &dyn TickableInstance) -> Result<()> {
        *self.state.thread.lock() = Some(std::thread::current().id());
        self.state.started.store(true, Ordering::SeqCst);
        if !self.state.slept.swap(true, Ordering::SeqCst) {
            std::thread::sleep(self.stall);
        }
        self.state.ticks.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

struct FailingEntity(Arc<Counter>);
impl TickableEntity for FailingEntity {
    fn tick(&self, _time: TickTime) -> Result<()> {
        self.0.bump();
        bail!("simulated entity failure")
    }
}

struct PanickingEntity;
impl TickableEntity for PanickingEntity {
    fn tick(&self, _time: TickTime) -> Result<()> {
        panic!("simulated entity panic")
    }
}

/// Entity whose tick runs a critical section against another entity.
struct AcquiringEntity {
    ticks: Arc<Counter>,
    callback_runs: Arc<Counter>,
    target: Acquirable<dyn TickableEntity>,
}

impl TickableEntity for AcquiringEntity {
    fn tick(&self, _time: TickTime) -> Result<()> {
        let callback_runs = self.callback_runs.clone();
        self.target.acquire(move |_target| {
            callback_runs.bump();
        });
        self.ticks.bump();
        Ok(())
    }
}

#[derive(Default)]
struct CollectingSink {
    errors: Mutex<Vec<String>>,
}

impl ErrorSink for CollectingSink {
    fn handle(&self, error: anyhow::Error) {
        self.errors.lock().push(format!("{error:#}"));
    }
}

impl CollectingSink {
    fn count(&self) -> usize {
        self.errors.lock().len()
    }
}

fn tick_time(tick: u64) -> TickTime {
    TickTime {
        start: Instant::now(),
        tick,
    }
}

fn test_pool(
    worker_count: usize,
    granularity: BatchGranularity,
) -> (Arc<TickThreadPool>, Arc<InstanceRegistry>, Arc<CollectingSink>) {
    let sink = Arc::new(CollectingSink::default());
    let provider = ThreadProvider::new(TickCosts::default(), granularity, None);
    let pool = Arc::new(TickThreadPool::new(worker_count, provider, sink.clone()));
    pool.start().unwrap();
    (pool, Arc::new(InstanceRegistry::new()), sink)
}

#[test]
fn steady_state_splits_cost_across_workers() {
    let (pool, registry, sink) = test_pool(2, BatchGranularity::PerChunk);
    let instance_ticks = Arc::new(Counter::default());
    let (instance, _) = registry.add_instance(CountingInstance(instance_ticks.clone()));
    let mut chunk_ticks = vec![];
    for x in 0..4 {
        let counter = Arc::new(Counter::default());
        registry
            .load_chunk(
                instance,
                ChunkPosition::new(x, 0),
                CountingChunk(counter.clone()),
            )
            .unwrap();
        chunk_ticks.push(counter);
    }

    for t in 0..10 {
        pool.tick(&registry, tick_time(t)).unwrap();
        let workers = pool.workers();
        // Per-tick counters are reset once the barrier releases.
        assert_eq!(workers[0].tick_cost(), 0);
        assert_eq!(workers[1].tick_cost(), 0);
        assert_eq!(
            workers[0].lifetime_cost() + workers[1].lifetime_cost(),
            25 * (t + 1)
        );
    }

    // 5 batches of cost 5 each tick, greedily spread over two workers:
    // the first worker ends each tick at 15, the second at 10.
    assert_eq!(pool.workers()[0].lifetime_cost(), 150);
    assert_eq!(pool.workers()[1].lifetime_cost(), 100);
    assert_eq!(instance_ticks.count(), 10);
    for counter in &chunk_ticks {
        assert_eq!(counter.count(), 10);
    }
    assert_eq!(sink.count(), 0);
}

#[test]
fn per_instance_granularity_keeps_an_instance_on_one_worker() {
    let (pool, registry, sink) = test_pool(2, BatchGranularity::PerInstance);
    let instance_ticks = Arc::new(Counter::default());
    let (instance, _) = registry.add_instance(CountingInstance(instance_ticks.clone()));
    for x in 0..3 {
        registry
            .load_chunk(
                instance,
                ChunkPosition::new(x, 0),
                CountingChunk(Arc::new(Counter::default())),
            )
            .unwrap();
    }

    pool.tick(&registry, tick_time(0)).unwrap();
    // One batch, so one worker got everything and the other stayed idle.
    let costs: Vec<u64> = pool.workers().iter().map(|w| w.lifetime_cost()).collect();
    assert_eq!(costs, vec![20, 0]);
    assert_eq!(instance_ticks.count(), 1);
    assert_eq!(sink.count(), 0);
}

#[test]
fn empty_instance_still_gets_an_instance_only_batch() {
    for granularity in [BatchGranularity::PerInstance, BatchGranularity::PerChunk] {
        let (pool, registry, _sink) = test_pool(1, granularity);
        let ticks = Arc::new(Counter::default());
        registry.add_instance(CountingInstance(ticks.clone()));
        pool.tick(&registry, tick_time(0)).unwrap();
        assert_eq!(ticks.count(), 1);
    }
}

#[test]
fn planner_balances_within_one_batch_cost() {
    let (pool, registry, _sink) = test_pool(3, BatchGranularity::PerChunk);
    let (instance, _) = registry.add_instance(CountingInstance(Arc::new(Counter::default())));
    for x in 0..7 {
        registry
            .load_chunk(
                instance,
                ChunkPosition::new(x, 0),
                CountingChunk(Arc::new(Counter::default())),
            )
            .unwrap();
    }
    pool.tick(&registry, tick_time(0)).unwrap();
    let costs: Vec<u64> = pool.workers().iter().map(|w| w.lifetime_cost()).collect();
    let max = *costs.iter().max().unwrap();
    let min = *costs.iter().min().unwrap();
    // Every batch this tick cost 5, so the greedy assignment can never
    // spread the pool wider than that.
    assert!(max - min <= 5, "unbalanced costs: {costs:?}");
    assert_eq!(costs.iter().sum::<u64>(), 40);
}

#[test]
fn full_workers_are_never_picked() {
    let (pool, registry, _sink) = test_pool(2, BatchGranularity::PerChunk);
    let (instance, _) = registry.add_instance(CountingInstance(Arc::new(Counter::default())));
    registry
        .load_chunk(
            instance,
            ChunkPosition::new(0, 0),
            CountingChunk(Arc::new(Counter::default())),
        )
        .unwrap();

    pool.workers()[0].testonly_mark_full();
    pool.tick(&registry, tick_time(0)).unwrap();
    assert_eq!(pool.workers()[0].lifetime_cost(), 0);
    assert_eq!(pool.workers()[1].lifetime_cost(), 10);
}

#[test]
fn ownership_is_published_to_every_element() {
    let (pool, registry, _sink) = test_pool(2, BatchGranularity::PerChunk);
    let (instance, instance_handle) =
        registry.add_instance(CountingInstance(Arc::new(Counter::default())));
    let chunk_handle = registry
        .load_chunk(
            instance,
            ChunkPosition::new(0, 0),
            CountingChunk(Arc::new(Counter::default())),
        )
        .unwrap();

    assert!(instance_handle.handler().current_worker().is_none());
    pool.tick(&registry, tick_time(0)).unwrap();
    let instance_owner = instance_handle.handler().current_worker().unwrap();
    let chunk_owner = chunk_handle.handler().current_worker().unwrap();
    assert!(instance_owner.index() < 2);
    assert!(chunk_owner.index() < 2);
}

#[test]
fn cross_worker_acquire_is_serialized_by_the_monitor() {
    let (pool, registry, sink) = test_pool(2, BatchGranularity::PerChunk);
    let (instance, _) = registry.add_instance(CountingInstance(Arc::new(Counter::default())));
    let chunk_a = ChunkPosition::new(0, 0);
    let chunk_b = ChunkPosition::new(1, 0);
    registry
        .load_chunk(instance, chunk_a, CountingChunk(Arc::new(Counter::default())))
        .unwrap();
    registry
        .load_chunk(instance, chunk_b, CountingChunk(Arc::new(Counter::default())))
        .unwrap();

    let y_ticks = Arc::new(Counter::default());
    let (_, y_handle) = registry
        .spawn_entity(instance, chunk_b, CountingEntity(y_ticks.clone()))
        .unwrap();

    let x_ticks = Arc::new(Counter::default());
    let callback_runs = Arc::new(Counter::default());
    registry
        .spawn_entity(
            instance,
            chunk_a,
            AcquiringEntity {
                ticks: x_ticks.clone(),
                callback_runs: callback_runs.clone(),
                target: y_handle.clone(),
            },
        )
        .unwrap();

    pool.tick(&registry, tick_time(0)).unwrap();

    // The two chunk batches always land on different workers, so the
    // acquire crossed threads and went through the monitor.
    let x_owner = registry
        .chunk_handle(instance, chunk_a)
        .unwrap()
        .handler()
        .current_worker()
        .unwrap()
        .index();
    let y_owner = registry
        .chunk_handle(instance, chunk_b)
        .unwrap()
        .handler()
        .current_worker()
        .unwrap()
        .index();
    assert_ne!(x_owner, y_owner);

    assert_eq!(x_ticks.count(), 1);
    assert_eq!(y_ticks.count(), 1);
    assert_eq!(callback_runs.count(), 1);
    assert_eq!(y_handle.monitor_acquisitions(), 1);
    assert_eq!(sink.count(), 0);
}

/// Entity that acquires itself mid-tick, exercising the same-thread fast
/// path.
struct SelfAcquiringEntity {
    state: Arc<SelfAcquireState>,
}

#[derive(Default)]
struct SelfAcquireState {
    ticks: Counter,
    callback_runs: Counter,
    myself: std::sync::OnceLock<Acquirable<dyn TickableEntity>>,
}

impl TickableEntity for SelfAcquiringEntity {
    fn tick(&self, _time: TickTime) -> Result<()> {
        if let Some(me) = self.state.myself.get() {
            let state = self.state.clone();
            me.acquire(move |_| {
                state.callback_runs.bump();
            });
        }
        self.state.ticks.bump();
        Ok(())
    }
}

#[test]
fn same_thread_acquire_skips_the_monitor() {
    let (pool, registry, sink) = test_pool(1, BatchGranularity::PerChunk);
    let (instance, _) = registry.add_instance(CountingInstance(Arc::new(Counter::default())));
    let pos = ChunkPosition::new(0, 0);
    registry
        .load_chunk(instance, pos, CountingChunk(Arc::new(Counter::default())))
        .unwrap();

    let state = Arc::new(SelfAcquireState::default());
    let handle = Acquirable::new_entity(SelfAcquiringEntity {
        state: state.clone(),
    });
    state.myself.set(handle.clone()).ok().unwrap();
    registry
        .spawn_entity_handle(instance, pos, handle.clone())
        .unwrap();

    for t in 0..3 {
        pool.tick(&registry, tick_time(t)).unwrap();
    }
    assert_eq!(state.ticks.count(), 3);
    assert_eq!(state.callback_runs.count(), 3);
    // Never contended: the owning worker took the fast path every time.
    assert_eq!(handle.monitor_acquisitions(), 0);
    assert_eq!(sink.count(), 0);
}

#[test]
fn scheduled_acquire_runs_on_the_owning_worker_before_the_barrier() {
    let (pool, registry, sink) = test_pool(1, BatchGranularity::PerChunk);
    let (instance, _) = registry.add_instance(CountingInstance(Arc::new(Counter::default())));
    let pos = ChunkPosition::new(0, 0);
    let slow = Arc::new(SlowState::default());
    registry
        .load_chunk(
            instance,
            pos,
            SlowChunk {
                state: slow.clone(),
                stall: Duration::from_millis(300),
            },
        )
        .unwrap();
    let (_, entity_handle) = registry
        .spawn_entity(instance, pos, CountingEntity(Arc::new(Counter::default())))
        .unwrap();

    let pool2 = pool.clone();
    let registry2 = registry.clone();
    let ticker = std::thread::spawn(move || pool2.tick(&registry2, tick_time(0)).unwrap());

    // Wait until the worker is mid-batch (stalled inside the chunk tick).
    while !slow.started.load(Ordering::SeqCst) {
        std::thread::sleep(Duration::from_millis(1));
    }

    let ran = Arc::new(AtomicBool::new(false));
    let ran_on = Arc::new(Mutex::new(None::<ThreadId>));
    {
        let ran = ran.clone();
        let ran_on = ran_on.clone();
        entity_handle.scheduled_acquire(move |_e| {
            *ran_on.lock() = Some(std::thread::current().id());
            ran.store(true, Ordering::SeqCst);
        });
    }
    // Non-blocking: the call returned while the worker is still stalled.
    assert!(!ran.load(Ordering::SeqCst));

    ticker.join().unwrap();
    // The barrier released, so the drain must already have happened, on
    // the worker's own thread.
    assert!(ran.load(Ordering::SeqCst));
    assert_eq!(*ran_on.lock(), *slow.thread.lock());
    assert_eq!(sink.count(), 0);
}

#[test]
fn scheduled_acquire_while_idle_waits_for_the_next_tick() {
    let (pool, registry, _sink) = test_pool(1, BatchGranularity::PerChunk);
    let (instance, _) = registry.add_instance(CountingInstance(Arc::new(Counter::default())));
    let pos = ChunkPosition::new(0, 0);
    registry
        .load_chunk(instance, pos, CountingChunk(Arc::new(Counter::default())))
        .unwrap();
    let (_, entity_handle) = registry
        .spawn_entity(instance, pos, CountingEntity(Arc::new(Counter::default())))
        .unwrap();

    // Publish an owner, then deposit while the worker sits idle between
    // ticks.
    pool.tick(&registry, tick_time(0)).unwrap();
    let runs = Arc::new(Counter::default());
    {
        let runs = runs.clone();
        entity_handle.scheduled_acquire(move |_e| runs.bump());
    }
    assert_eq!(runs.count(), 0);
    pool.tick(&registry, tick_time(1)).unwrap();
    assert_eq!(runs.count(), 1);
    // Exactly once; later ticks must not replay it.
    pool.tick(&registry, tick_time(2)).unwrap();
    assert_eq!(runs.count(), 1);
}

#[test]
fn scheduled_acquire_without_an_owner_runs_inline() {
    let runs = Arc::new(Counter::default());
    let handle = Acquirable::new_entity(CountingEntity(Arc::new(Counter::default())));
    {
        let runs = runs.clone();
        handle.scheduled_acquire(move |_e| runs.bump());
    }
    assert_eq!(runs.count(), 1);
}

/// Entity that drains its owning worker's acquisition queue from inside
/// its own tick.
struct MidTickDrainEntity {
    state: Arc<MidTickState>,
}

#[derive(Default)]
struct MidTickState {
    started: AtomicBool,
    deposited: AtomicBool,
    runs: Counter,
    drained_in_tick: AtomicBool,
    myself: std::sync::OnceLock<Acquirable<dyn TickableEntity>>,
}

impl TickableEntity for MidTickDrainEntity {
    fn tick(&self, _time: TickTime) -> Result<()> {
        self.state.started.store(true, Ordering::SeqCst);
        let deadline = Instant::now() + Duration::from_secs(2);
        while !self.state.deposited.load(Ordering::SeqCst) && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(1));
        }
        if let Some(me) = self.state.myself.get() {
            me.handler().acquisition_tick();
        }
        self.state
            .drained_in_tick
            .store(self.state.runs.count() == 1, Ordering::SeqCst);
        Ok(())
    }
}

#[test]
fn acquisition_tick_drains_mid_batch() {
    let (pool, registry, sink) = test_pool(1, BatchGranularity::PerChunk);
    let (instance, _) = registry.add_instance(CountingInstance(Arc::new(Counter::default())));
    let pos = ChunkPosition::new(0, 0);
    registry
        .load_chunk(instance, pos, CountingChunk(Arc::new(Counter::default())))
        .unwrap();

    let state = Arc::new(MidTickState::default());
    let handle = Acquirable::new_entity(MidTickDrainEntity {
        state: state.clone(),
    });
    assert!(state.myself.set(handle.clone()).is_ok());
    registry
        .spawn_entity_handle(instance, pos, handle.clone())
        .unwrap();

    let pool2 = pool.clone();
    let registry2 = registry.clone();
    let ticker = std::thread::spawn(move || pool2.tick(&registry2, tick_time(0)).unwrap());

    while !state.started.load(Ordering::SeqCst) {
        std::thread::sleep(Duration::from_millis(1));
    }
    {
        let state = state.clone();
        handle.scheduled_acquire(move |_e| state.runs.bump());
    }
    state.deposited.store(true, Ordering::SeqCst);

    ticker.join().unwrap();
    assert!(state.drained_in_tick.load(Ordering::SeqCst));
    assert_eq!(state.runs.count(), 1);
    assert_eq!(sink.count(), 0);
}

#[test]
fn item_failures_are_isolated() {
    let (pool, registry, sink) = test_pool(1, BatchGranularity::PerInstance);
    let instance_ticks = Arc::new(Counter::default());
    let (instance, _) = registry.add_instance(CountingInstance(instance_ticks.clone()));
    let pos = ChunkPosition::new(0, 0);
    let chunk_ticks = Arc::new(Counter::default());
    registry
        .load_chunk(instance, pos, CountingChunk(chunk_ticks.clone()))
        .unwrap();

    let before = Arc::new(Counter::default());
    let failing = Arc::new(Counter::default());
    let after = Arc::new(Counter::default());
    registry
        .spawn_entity(instance, pos, CountingEntity(before.clone()))
        .unwrap();
    registry
        .spawn_entity(instance, pos, FailingEntity(failing.clone()))
        .unwrap();
    registry
        .spawn_entity(instance, pos, CountingEntity(after.clone()))
        .unwrap();

    pool.tick(&registry, tick_time(0)).unwrap();

    assert_eq!(sink.count(), 1);
    assert_eq!(instance_ticks.count(), 1);
    assert_eq!(chunk_ticks.count(), 1);
    assert_eq!(before.count(), 1);
    assert_eq!(failing.count(), 1);
    assert_eq!(after.count(), 1);
}

#[test]
fn item_panics_are_isolated() {
    let (pool, registry, sink) = test_pool(1, BatchGranularity::PerChunk);
    let (instance, _) = registry.add_instance(CountingInstance(Arc::new(Counter::default())));
    let pos = ChunkPosition::new(0, 0);
    registry
        .load_chunk(instance, pos, CountingChunk(Arc::new(Counter::default())))
        .unwrap();
    let survivor = Arc::new(Counter::default());
    registry.spawn_entity(instance, pos, PanickingEntity).unwrap();
    registry
        .spawn_entity(instance, pos, CountingEntity(survivor.clone()))
        .unwrap();

    pool.tick(&registry, tick_time(0)).unwrap();
    assert_eq!(sink.count(), 1);
    assert_eq!(survivor.count(), 1);
    // The pool survives and can run the next tick.
    pool.tick(&registry, tick_time(1)).unwrap();
    assert_eq!(survivor.count(), 2);
}

#[test]
fn server_runs_at_cadence_and_shuts_down() {
    let mut config = ServerConfig::default();
    config.ticks_per_second = 20;
    config.worker_count = 2;
    let server = Server::builder().config(config).build().unwrap();

    let ticks = Arc::new(Counter::default());
    let (instance, _) = server
        .registry()
        .add_instance(CountingInstance(ticks.clone()));
    server
        .registry()
        .load_chunk(
            instance,
            ChunkPosition::new(0, 0),
            CountingChunk(Arc::new(Counter::default())),
        )
        .unwrap();

    server.start().unwrap();
    assert!(server.is_alive());
    std::thread::sleep(Duration::from_millis(550));
    server.stop();
    assert!(!server.is_alive());

    let total = server.stats().total_ticks();
    // ~11 ticks in 550 ms at 20 tps; leave slack for slow machines.
    assert!((5..=20).contains(&total), "unexpected tick count {total}");
    assert_eq!(server.stats().clock_resets(), 0);
    assert_eq!(ticks.count(), total);

    // Stopping twice is fine.
    server.stop();
}

#[test]
fn falling_behind_resets_the_tick_clock() {
    let mut config = ServerConfig::default();
    config.ticks_per_second = 20;
    config.max_tick_catch_up = 5;
    config.worker_count = 1;
    let server = Server::builder().config(config).build().unwrap();

    let (instance, _) = server
        .registry()
        .add_instance(CountingInstance(Arc::new(Counter::default())));
    let slow = Arc::new(SlowState::default());
    server
        .registry()
        .load_chunk(
            instance,
            ChunkPosition::new(0, 0),
            SlowChunk {
                state: slow.clone(),
                stall: Duration::from_secs(2),
            },
        )
        .unwrap();

    server.start().unwrap();
    // 2 s stall on the first tick blows through the 250 ms catch-up
    // budget; everything after runs on time.
    std::thread::sleep(Duration::from_millis(3000));
    server.stop();

    assert_eq!(server.stats().clock_resets(), 1);
    assert!(server.stats().total_ticks() > 1);
    assert!(slow.ticks.load(Ordering::SeqCst) > 1);
    assert!(server.stats().ticks_since_reset() < server.stats().total_ticks());
}
