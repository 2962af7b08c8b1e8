use std::cell::RefCell;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::thread::ThreadId;

use anyhow::{anyhow, Result};
use crossbeam_channel::{Receiver, Sender};
use tracy_client::span;

use crate::sync::Phaser;
use crate::{CachelineAligned, ErrorSink};

use super::acquire::QueuedAcquire;
use super::batch::{Batch, WorkItem};

thread_local! {
    // Set while this thread is executing a batch; consulted by the
    // acquisition protocol when the thread blocks on a foreign element.
    static CURRENT_TICK_PHASER: RefCell<Option<Arc<Phaser>>> = const { RefCell::new(None) };
}

pub(crate) fn current_tick_phaser() -> Option<Arc<Phaser>> {
    CURRENT_TICK_PHASER.with(|phaser| phaser.borrow().clone())
}

/// One tick's go-signal. The worker arrives at the phaser once its batch
/// queue is drained.
pub(crate) struct TickSignal {
    pub(crate) phaser: Arc<Phaser>,
}

/// Planner- and acquirer-facing half of a worker thread. Owns the sending
/// sides of the worker's queues and the cost counters the planner balances
/// on. The receiving side of the batch queue lives in [`BatchWorker`] on
/// the thread itself.
pub struct WorkerHandle {
    index: usize,
    thread_id: OnceLock<ThreadId>,
    stopping: AtomicBool,
    // Cost assigned this tick; reset by the pool after the barrier. The
    // planner reads this on every batch push, workers never touch it.
    tick_cost: CachelineAligned<AtomicU32>,
    // Monotonic sum of every batch cost ever assigned. Never reset.
    lifetime_cost: AtomicU64,
    batch_tx: Sender<Batch>,
    acquisition_tx: Sender<QueuedAcquire>,
    // Kept on the handle (not the thread) so that the queue can be drained
    // on the worker's behalf during shutdown hand-off.
    acquisition_rx: Receiver<QueuedAcquire>,
    error_sink: Arc<dyn ErrorSink>,
}

impl WorkerHandle {
    pub fn index(&self) -> usize {
        self.index
    }

    /// Cost assigned to this worker so far in the current tick.
    pub fn tick_cost(&self) -> u32 {
        self.tick_cost.load(Ordering::Acquire)
    }

    /// Total cost ever assigned to this worker.
    pub fn lifetime_cost(&self) -> u64 {
        self.lifetime_cost.load(Ordering::Acquire)
    }

    pub(crate) fn is_current_thread(&self) -> bool {
        self.thread_id
            .get()
            .is_some_and(|id| *id == std::thread::current().id())
    }

    pub(crate) fn add_batch(&self, batch: Batch) -> Result<()> {
        let cost = batch.cost;
        self.batch_tx
            .send(batch)
            .map_err(|_| anyhow!("Worker {} batch queue is closed", self.index))?;
        self.tick_cost.fetch_add(cost, Ordering::AcqRel);
        self.lifetime_cost
            .fetch_add(cost as u64, Ordering::Relaxed);
        Ok(())
    }

    /// Deposits a deferred acquisition. Fails (returning the request) when
    /// the worker is shutting down, in which case the caller runs it
    /// itself.
    pub(crate) fn queue_acquisition(
        &self,
        queued: QueuedAcquire,
    ) -> Result<(), QueuedAcquire> {
        if self.stopping.load(Ordering::Acquire) {
            return Err(queued);
        }
        self.acquisition_tx
            .send(queued)
            .map_err(|send_error| send_error.into_inner())?;
        // Shutdown race: if the worker stopped between the check and the
        // send, its final drain may already be over. Drain here so the
        // request still runs exactly once.
        if self.stopping.load(Ordering::Acquire) {
            self.process_queue();
        }
        Ok(())
    }

    /// Runs every acquisition currently waiting in the queue. Normally
    /// called by the worker thread between batches; also safe from other
    /// threads (the queued callbacks take the element monitor themselves).
    pub(crate) fn process_queue(&self) {
        while let Ok(queued) = self.acquisition_rx.try_recv() {
            if let Err(panic) =
                std::panic::catch_unwind(AssertUnwindSafe(|| queued.run()))
            {
                self.error_sink.handle(panic_to_error(panic));
            }
        }
    }

    pub(crate) fn set_stopping(&self) {
        self.stopping.store(true, Ordering::Release);
    }

    fn stopping(&self) -> bool {
        self.stopping.load(Ordering::Acquire)
    }

    pub(crate) fn reset_tick_cost(&self) {
        self.tick_cost.store(0, Ordering::Release);
    }

    /// Marks this worker as full (the planner's skip sentinel).
    #[cfg(test)]
    pub(crate) fn testonly_mark_full(&self) {
        self.tick_cost.store(u32::MAX, Ordering::Release);
    }
}

/// Thread-side half of a worker. Consumed by the spawned thread.
pub(crate) struct BatchWorker {
    shared: Arc<WorkerHandle>,
    batch_rx: Receiver<Batch>,
    signal_rx: Receiver<TickSignal>,
}

impl BatchWorker {
    pub(crate) fn new(
        index: usize,
        error_sink: Arc<dyn ErrorSink>,
    ) -> (Arc<WorkerHandle>, BatchWorker, Sender<TickSignal>) {
        let (batch_tx, batch_rx) = crossbeam_channel::unbounded();
        let (acquisition_tx, acquisition_rx) = crossbeam_channel::unbounded();
        let (signal_tx, signal_rx) = crossbeam_channel::unbounded();
        let shared = Arc::new(WorkerHandle {
            index,
            thread_id: OnceLock::new(),
            stopping: AtomicBool::new(false),
            tick_cost: CachelineAligned(AtomicU32::new(0)),
            lifetime_cost: AtomicU64::new(0),
            batch_tx,
            acquisition_tx,
            acquisition_rx,
            error_sink,
        });
        let worker = BatchWorker {
            shared: shared.clone(),
            batch_rx,
            signal_rx,
        };
        (shared, worker, signal_tx)
    }

    pub(crate) fn run(self) {
        let _ = self.shared.thread_id.set(std::thread::current().id());
        tracing::debug!("Worker {} running", self.shared.index);

        // Signal channel disconnect is the shutdown path; the pool drops
        // the senders after setting the stopping flag.
        while let Ok(signal) = self.signal_rx.recv() {
            self.shared.process_queue();
            while let Ok(batch) = self.batch_rx.try_recv() {
                self.execute_batch(&signal, batch);
                self.shared.process_queue();
                if self.shared.stopping() {
                    break;
                }
            }
            signal.phaser.arrive_and_deregister();
        }

        self.shared.set_stopping();
        self.shared.process_queue();
        tracing::debug!("Worker {} exiting", self.shared.index);
    }

    fn execute_batch(&self, signal: &TickSignal, batch: Batch) {
        let _span = span!("execute_batch");
        CURRENT_TICK_PHASER.with(|phaser| {
            *phaser.borrow_mut() = Some(signal.phaser.clone());
        });
        let time = batch.time;
        for item in batch.items {
            if let Err(error) = self.run_item(item, time) {
                self.shared.error_sink.handle(error);
            }
        }
        CURRENT_TICK_PHASER.with(|phaser| {
            *phaser.borrow_mut() = None;
        });
    }

    // Each element is ticked under its own monitor so that foreign
    // acquirers are serialized against the tick itself, not just against
    // each other. An item failure is reported and the batch continues.
    fn run_item(&self, item: WorkItem, time: crate::game_state::TickTime) -> Result<()> {
        let outcome = std::panic::catch_unwind(AssertUnwindSafe(|| match item {
            WorkItem::Instance { handle } => handle.with_monitor(|i| i.tick(time)),
            WorkItem::Chunk { handle, instance } => {
                handle.with_monitor(|c| c.tick(time, instance.unsafe_unwrap()))
            }
            WorkItem::Entity { handle } => handle.with_monitor(|e| e.tick(time)),
        }));
        match outcome {
            Ok(result) => result,
            Err(panic) => Err(panic_to_error(panic)),
        }
    }
}

fn panic_to_error(panic: Box<dyn std::any::Any + Send>) -> anyhow::Error {
    if let Some(message) = panic.downcast_ref::<&str>() {
        anyhow!("Tick panicked: {message}")
    } else if let Some(message) = panic.downcast_ref::<String>() {
        anyhow!("Tick panicked: {message}")
    } else {
        anyhow!("Tick panicked")
    }
}
