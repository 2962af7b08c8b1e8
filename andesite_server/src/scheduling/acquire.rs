// Copyright 2025 the andesite authors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.
//
// SPDX-License-Identifier: Apache-2.0

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{ReentrantMutex, RwLock};

use crate::game_state::elements::{TickableChunk, TickableEntity, TickableInstance};
use crate::sync::Phaser;

use super::worker::{self, WorkerHandle};

/// An element which can be acquired from any thread.
///
/// Cloning is cheap and yields another handle to the same element. There
/// is exactly one underlying control block per element, so ownership
/// published through one clone is visible through all of them.
///
/// The owning worker accesses the element directly while ticking it, under
/// the element's monitor. Foreign threads go through [`Acquirable::acquire`]
/// (blocking, monitor-guarded) or [`Acquirable::scheduled_acquire`]
/// (deferred to the owning worker's next inter-batch queue drain).
pub struct Acquirable<T: ?Sized + Send + Sync + 'static> {
    shared: Arc<AcquirableShared<T>>,
}

impl<T: ?Sized + Send + Sync + 'static> Clone for Acquirable<T> {
    fn clone(&self) -> Self {
        Acquirable {
            shared: self.shared.clone(),
        }
    }
}

impl<T: ?Sized + Send + Sync + 'static> std::fmt::Debug for Acquirable<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let owner = self.shared.handler.current_worker().map(|w| w.index());
        f.debug_struct("Acquirable").field("owner", &owner).finish()
    }
}

struct AcquirableShared<T: ?Sized + Send + Sync + 'static> {
    handler: AcquirableHandler,
    // Reentrant so that a queue drain reached from inside an element's own
    // tick (which already holds this monitor) cannot self-deadlock.
    monitor: ReentrantMutex<()>,
    contended_acquires: AtomicU64,
    // Unsized last field; Arc<AcquirableShared<Concrete>> coerces to
    // Arc<AcquirableShared<dyn Trait>> at the constructor sites below.
    value: T,
}

fn new_shared<T: Send + Sync + 'static>(value: T) -> Arc<AcquirableShared<T>> {
    Arc::new(AcquirableShared {
        handler: AcquirableHandler::new(),
        monitor: ReentrantMutex::new(()),
        contended_acquires: AtomicU64::new(0),
        value,
    })
}

impl<T: Send + Sync + 'static> Acquirable<T> {
    pub fn new(value: T) -> Acquirable<T> {
        Acquirable {
            shared: new_shared(value),
        }
    }
}

impl Acquirable<dyn TickableInstance> {
    pub fn new_instance<T: TickableInstance>(value: T) -> Self {
        Acquirable {
            shared: new_shared(value),
        }
    }
}

impl Acquirable<dyn TickableChunk> {
    pub fn new_chunk<T: TickableChunk>(value: T) -> Self {
        Acquirable {
            shared: new_shared(value),
        }
    }
}

impl Acquirable<dyn TickableEntity> {
    pub fn new_entity<T: TickableEntity>(value: T) -> Self {
        Acquirable {
            shared: new_shared(value),
        }
    }
}

impl<T: ?Sized + Send + Sync + 'static> Acquirable<T> {
    /// Returns the element without any synchronization.
    ///
    /// Valid to call from the worker that currently owns the element, or
    /// from inside an [`Acquirable::acquire`] callback. Anywhere else the
    /// reference is safe to hold but reads race with the owning worker's
    /// tick.
    pub fn unsafe_unwrap(&self) -> &T {
        &self.shared.value
    }

    pub fn handler(&self) -> &AcquirableHandler {
        &self.shared.handler
    }

    /// Number of times the monitor path was taken for this element. The
    /// same-thread fast path leaves this untouched.
    pub fn monitor_acquisitions(&self) -> u64 {
        self.shared.contended_acquires.load(Ordering::Relaxed)
    }

    /// Blocks until the element can be acquired and runs `callback` with
    /// exclusive access to it, returning the callback's result.
    ///
    /// When the calling thread is the worker that owns the element this
    /// tick, the callback runs directly with no locking. Otherwise the
    /// element's monitor is taken for the duration of the callback, which
    /// excludes the owning worker's tick of this element and every other
    /// foreign acquirer. Acquiring further elements from inside the
    /// callback is permitted; lock ordering across elements is then the
    /// caller's responsibility.
    pub fn acquire<R>(&self, callback: impl FnOnce(&T) -> R) -> R {
        let owner = self.shared.handler.current_worker();
        if owner
            .as_ref()
            .is_some_and(|worker| worker.is_current_thread())
        {
            return callback(&self.shared.value);
        }

        // Cross-worker case: tell the tick barrier that a worker is
        // momentarily blocked servicing a foreign element.
        let data = if owner.is_some() {
            AcquisitionData::register_cross_worker()
        } else {
            AcquisitionData::empty()
        };

        self.shared.contended_acquires.fetch_add(1, Ordering::Relaxed);
        let result = {
            let _monitor = self.shared.monitor.lock();
            callback(&self.shared.value)
        };
        data.arrive();
        result
    }

    /// Enqueues `callback` onto the owning worker's acquisition queue and
    /// returns immediately. The callback runs exactly once, under the
    /// element's monitor, at the worker's next inter-batch drain.
    ///
    /// If no owner has been published yet (the element was never planned
    /// into a tick) or the owning worker has shut down, the callback runs
    /// on the calling thread instead, still under the monitor.
    pub fn scheduled_acquire(&self, callback: impl FnOnce(&T) + Send + 'static) {
        let this = self.clone();
        let queued = QueuedAcquire::new(move || {
            let _monitor = this.shared.monitor.lock();
            callback(&this.shared.value);
        });
        match self.shared.handler.current_worker() {
            Some(worker) => {
                if let Err(rejected) = worker.queue_acquisition(queued) {
                    rejected.run();
                }
            }
            None => queued.run(),
        }
    }

    /// Locks the element's monitor for the duration of `f`. Used by the
    /// owning worker while ticking the element, so that foreign acquirers
    /// are excluded from the tick itself.
    pub(crate) fn with_monitor<R>(&self, f: impl FnOnce(&T) -> R) -> R {
        let _monitor = self.shared.monitor.lock();
        f(&self.shared.value)
    }
}

/// Control block publishing which worker owns the element this tick.
pub struct AcquirableHandler {
    owner: RwLock<Option<Arc<WorkerHandle>>>,
}

impl AcquirableHandler {
    fn new() -> AcquirableHandler {
        AcquirableHandler {
            owner: RwLock::new(None),
        }
    }

    /// The worker currently responsible for ticking this element. Stable
    /// from the moment the planner publishes assignments until the
    /// tick-complete barrier releases.
    pub fn current_worker(&self) -> Option<Arc<WorkerHandle>> {
        self.owner.read().clone()
    }

    /// Publishes the worker that will tick this element. Only the batch
    /// planner calls this, before the tick's batches are pushed.
    pub(crate) fn refresh_worker(&self, worker: Arc<WorkerHandle>) {
        *self.owner.write() = Some(worker);
    }

    /// Drains the owning worker's acquisition queue if the caller is that
    /// worker; no-op otherwise. Lets a long element tick service foreign
    /// requests without waiting for the batch boundary.
    pub fn acquisition_tick(&self) {
        if let Some(owner) = self.current_worker() {
            if owner.is_current_thread() {
                owner.process_queue();
            }
        }
    }
}

/// Per-call record for one cross-worker acquisition.
struct AcquisitionData {
    phaser: Option<Arc<Phaser>>,
}

impl AcquisitionData {
    fn empty() -> AcquisitionData {
        AcquisitionData { phaser: None }
    }

    /// Registers with the current tick's barrier when the caller is a
    /// worker in the middle of a batch; other callers get an empty record.
    fn register_cross_worker() -> AcquisitionData {
        match worker::current_tick_phaser() {
            Some(phaser) => {
                phaser.register();
                AcquisitionData {
                    phaser: Some(phaser),
                }
            }
            None => AcquisitionData::empty(),
        }
    }

    fn arrive(self) {
        if let Some(phaser) = self.phaser {
            phaser.arrive_and_deregister();
        }
    }
}

/// A deferred acquisition waiting in a worker's queue.
pub(crate) struct QueuedAcquire(Box<dyn FnOnce() + Send + 'static>);

impl QueuedAcquire {
    pub(crate) fn new(f: impl FnOnce() + Send + 'static) -> QueuedAcquire {
        QueuedAcquire(Box::new(f))
    }

    pub(crate) fn run(self) {
        (self.0)()
    }
}
