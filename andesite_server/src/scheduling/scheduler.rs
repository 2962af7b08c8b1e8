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
use std::time::{Duration, Instant};

use log::warn;
use tokio_util::sync::CancellationToken;

use crate::game_state::{InstanceRegistry, TickTime};
use crate::ErrorSink;

use super::pool::TickThreadPool;

/// Raw tick-loop counters. All values are monotonic except
/// `ticks_since_reset`, which drops to zero at a catch-up reset.
pub struct TickStats {
    total_ticks: AtomicU64,
    ticks_since_reset: AtomicU64,
    clock_resets: AtomicU64,
    last_tick_nanos: AtomicU64,
}

impl TickStats {
    pub(crate) fn new() -> TickStats {
        TickStats {
            total_ticks: AtomicU64::new(0),
            ticks_since_reset: AtomicU64::new(0),
            clock_resets: AtomicU64::new(0),
            last_tick_nanos: AtomicU64::new(0),
        }
    }

    pub fn total_ticks(&self) -> u64 {
        self.total_ticks.load(Ordering::Acquire)
    }

    /// Tick count since the last catch-up reset (or since startup).
    pub fn ticks_since_reset(&self) -> u64 {
        self.ticks_since_reset.load(Ordering::Acquire)
    }

    /// How many times the loop has fallen far enough behind real time to
    /// discard its backlog.
    pub fn clock_resets(&self) -> u64 {
        self.clock_resets.load(Ordering::Acquire)
    }

    pub fn last_tick_duration(&self) -> Duration {
        Duration::from_nanos(self.last_tick_nanos.load(Ordering::Acquire))
    }
}

/// The wall-clock loop driving the whole simulation. Runs on its own
/// dedicated thread; one iteration per tick.
pub(crate) struct TickScheduler {
    pub(crate) pool: Arc<TickThreadPool>,
    pub(crate) registry: Arc<InstanceRegistry>,
    pub(crate) error_sink: Arc<dyn ErrorSink>,
    pub(crate) cancel: CancellationToken,
    pub(crate) stats: Arc<TickStats>,
    pub(crate) tick_nanos: u64,
    pub(crate) max_catch_up: u32,
    pub(crate) sleep_threshold: Duration,
}

impl TickScheduler {
    pub(crate) fn run(self) {
        let mut ticks: u64 = 0;
        let mut base_time = Instant::now();
        log::info!(
            "Tick scheduler running ({} ms per tick)",
            self.tick_nanos / 1_000_000
        );

        while !self.cancel.is_cancelled() && self.pool.is_alive() {
            let tick_start = Instant::now();
            let time = TickTime {
                start: tick_start,
                tick: self.stats.total_ticks(),
            };
            if let Err(error) = self.pool.tick(&self.registry, time) {
                self.error_sink.handle(error);
            }
            self.stats
                .last_tick_nanos
                .store(tick_start.elapsed().as_nanos() as u64, Ordering::Release);
            self.stats.total_ticks.fetch_add(1, Ordering::AcqRel);

            ticks += 1;
            self.stats.ticks_since_reset.store(ticks, Ordering::Release);

            let next_tick = base_time + Duration::from_nanos(ticks * self.tick_nanos);
            self.wait_until_next_tick(next_tick);

            // If the loop has fallen too far behind, drop the backlog
            // instead of trying to run an unbounded burst of catch-up
            // ticks.
            let behind_limit =
                next_tick + Duration::from_nanos(self.tick_nanos * self.max_catch_up as u64);
            if Instant::now() > behind_limit {
                warn!(
                    "Tick loop is more than {} ticks behind; resetting the tick clock",
                    self.max_catch_up
                );
                base_time = Instant::now();
                ticks = 0;
                self.stats.clock_resets.fetch_add(1, Ordering::AcqRel);
                self.stats.ticks_since_reset.store(0, Ordering::Release);
            }
        }
        log::info!("Tick scheduler exiting");
    }

    /// Hybrid wait: sleep in halves while the remainder is above the
    /// platform sleep threshold, then spin out the final stretch. Halving
    /// converges on the deadline without oversleeping on coarse timers.
    /// Cancellation is observed between sleeps.
    fn wait_until_next_tick(&self, deadline: Instant) {
        while !self.cancel.is_cancelled() {
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            let remaining = deadline - now;
            if remaining >= self.sleep_threshold {
                std::thread::sleep(remaining / 2);
            } else {
                std::hint::spin_loop();
            }
        }
    }
}
