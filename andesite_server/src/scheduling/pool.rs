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

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use anyhow::{ensure, Context, Result};
use crossbeam_channel::Sender;
use log::warn;
use parking_lot::Mutex;
use tracy_client::span;

use crate::game_state::{InstanceRegistry, TickTime};
use crate::sync::Phaser;
use crate::ErrorSink;

use super::batch::ThreadProvider;
use super::worker::{BatchWorker, TickSignal, WorkerHandle};

/// Fixed-size pool of batch worker threads plus the per-tick barrier.
///
/// [`TickThreadPool::tick`] is the synchronous heart of a tick: it plans
/// batches, wakes every worker, and blocks until all of them have drained
/// their queues.
pub struct TickThreadPool {
    workers: Vec<Arc<WorkerHandle>>,
    provider: ThreadProvider,
    error_sink: Arc<dyn ErrorSink>,
    alive: AtomicBool,
    // Thread-side worker halves, waiting for start() to spawn them.
    pending: Mutex<Vec<BatchWorker>>,
    signal_txs: Mutex<Vec<Sender<TickSignal>>>,
    join_handles: Mutex<Vec<JoinHandle<()>>>,
}

impl TickThreadPool {
    pub(crate) fn new(
        worker_count: usize,
        provider: ThreadProvider,
        error_sink: Arc<dyn ErrorSink>,
    ) -> TickThreadPool {
        let mut workers = Vec::with_capacity(worker_count);
        let mut pending = Vec::with_capacity(worker_count);
        let mut signal_txs = Vec::with_capacity(worker_count);
        for index in 0..worker_count {
            let (handle, worker, signal_tx) = BatchWorker::new(index, error_sink.clone());
            workers.push(handle);
            pending.push(worker);
            signal_txs.push(signal_tx);
        }
        TickThreadPool {
            workers,
            provider,
            error_sink,
            alive: AtomicBool::new(false),
            pending: Mutex::new(pending),
            signal_txs: Mutex::new(signal_txs),
            join_handles: Mutex::new(Vec::with_capacity(worker_count)),
        }
    }

    pub fn start(&self) -> Result<()> {
        let mut pending = self.pending.lock();
        ensure!(
            !self.alive.load(Ordering::Acquire),
            "Thread pool is already running"
        );
        ensure!(!pending.is_empty(), "Thread pool was already started once");
        let mut join_handles = self.join_handles.lock();
        for worker in pending.drain(..) {
            let name = format!("tick-worker-{}", join_handles.len());
            let handle = std::thread::Builder::new()
                .name(name)
                .spawn(move || worker.run())
                .context("Spawning tick worker")?;
            join_handles.push(handle);
        }
        self.alive.store(true, Ordering::Release);
        log::info!("Started {} tick workers", self.workers.len());
        Ok(())
    }

    /// Stops the pool. Workers finish the batch they are on (not the whole
    /// tick's queue), run a final acquisition drain, and exit.
    pub fn stop(&self) {
        if !self.alive.swap(false, Ordering::AcqRel) {
            return;
        }
        for worker in &self.workers {
            worker.set_stopping();
        }
        // Disconnecting the signal channels is what actually wakes and
        // stops the workers.
        self.signal_txs.lock().clear();
        for handle in self.join_handles.lock().drain(..) {
            if handle.join().is_err() {
                warn!("A tick worker exited by panicking");
            }
        }
        log::info!("Thread pool stopped");
    }

    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Acquire)
    }

    pub(crate) fn workers(&self) -> &[Arc<WorkerHandle>] {
        &self.workers
    }

    /// Runs one full tick and blocks until every worker has finished every
    /// batch planned for it. On return, all per-tick cost counters are
    /// reset.
    pub fn tick(&self, registry: &InstanceRegistry, time: TickTime) -> Result<()> {
        let _span = span!("pool_tick");
        ensure!(self.is_alive(), "Thread pool is not running");

        let phaser = Arc::new(Phaser::new());
        phaser.bulk_register(self.workers.len());

        // Plan before signalling: every refresh_worker publication must be
        // visible before any worker starts executing.
        let plan_result = self.provider.update(registry, time, &self.workers);

        {
            let signal_txs = self.signal_txs.lock();
            for (index, tx) in signal_txs.iter().enumerate() {
                if tx
                    .send(TickSignal {
                        phaser: phaser.clone(),
                    })
                    .is_err()
                {
                    // The worker is gone; arrive on its behalf so the
                    // barrier still releases.
                    phaser.arrive_and_deregister();
                    self.error_sink.handle(anyhow::anyhow!(
                        "Worker {index} is not accepting tick signals"
                    ));
                }
            }
            // Workers that were stopped before this tick's signals went out
            // never arrive; release their barrier slots.
            for _ in signal_txs.len()..self.workers.len() {
                phaser.arrive_and_deregister();
            }
        }

        phaser.wait();

        for worker in &self.workers {
            worker.reset_tick_cost();
        }
        plan_result
    }
}

impl Drop for TickThreadPool {
    fn drop(&mut self) {
        self.stop();
    }
}
