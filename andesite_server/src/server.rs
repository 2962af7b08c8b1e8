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

use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use anyhow::{Context, Result};
use parking_lot::Mutex;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::game_state::InstanceRegistry;
use crate::scheduling::{
    BatchGranularity, EntityFilter, ThreadProvider, TickCosts, TickScheduler, TickStats,
    TickThreadPool,
};
use crate::{ErrorSink, LogErrorSink};

/// Some platforms cannot reliably sleep for less than ~16 ms at a time;
/// below the threshold the scheduler spins instead.
pub fn default_sleep_threshold() -> Duration {
    if cfg!(windows) {
        Duration::from_millis(17)
    } else {
        Duration::from_millis(2)
    }
}

#[derive(Clone, Debug)]
pub struct ServerConfig {
    /// Simulation rate. 20 gives the usual 50 ms tick.
    pub ticks_per_second: u32,
    /// How many ticks behind real time the scheduler may fall before it
    /// discards its backlog and resets the tick clock.
    pub max_tick_catch_up: u32,
    pub worker_count: usize,
    pub sleep_threshold: Duration,
    pub costs: TickCosts,
    pub granularity: BatchGranularity,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            ticks_per_second: 20,
            max_tick_catch_up: 5,
            worker_count: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(4),
            sleep_threshold: default_sleep_threshold(),
            costs: TickCosts::default(),
            granularity: BatchGranularity::default(),
        }
    }
}

impl ServerConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.ticks_per_second == 0 {
            return Err(ConfigError::ZeroTickRate);
        }
        if self.max_tick_catch_up == 0 {
            return Err(ConfigError::ZeroCatchUp);
        }
        if self.worker_count == 0 {
            return Err(ConfigError::ZeroWorkers);
        }
        if self.sleep_threshold.is_zero() {
            return Err(ConfigError::ZeroSleepThreshold);
        }
        if self.costs.instance == 0 || self.costs.chunk == 0 || self.costs.entity == 0 {
            return Err(ConfigError::NonPositiveCost);
        }
        Ok(())
    }

    pub(crate) fn tick_nanos(&self) -> u64 {
        1_000_000_000 / self.ticks_per_second as u64
    }
}

/// Fatal construction-time misconfiguration. Everything else the server
/// encounters at runtime goes through the [`ErrorSink`] instead.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("ticks_per_second must be positive")]
    ZeroTickRate,
    #[error("max_tick_catch_up must be positive")]
    ZeroCatchUp,
    #[error("worker_count must be positive")]
    ZeroWorkers,
    #[error("sleep_threshold must be positive")]
    ZeroSleepThreshold,
    #[error("element costs must be positive")]
    NonPositiveCost,
}

pub struct ServerBuilder {
    config: ServerConfig,
    entity_filter: Option<EntityFilter>,
    error_sink: Option<Arc<dyn ErrorSink>>,
}

impl ServerBuilder {
    pub fn new() -> ServerBuilder {
        ServerBuilder {
            config: ServerConfig::default(),
            entity_filter: None,
            error_sink: None,
        }
    }

    pub fn config(mut self, config: ServerConfig) -> ServerBuilder {
        self.config = config;
        self
    }

    pub fn config_mut(&mut self) -> &mut ServerConfig {
        &mut self.config
    }

    /// Installs a predicate deciding per tick which entities are scheduled
    /// at all. Entities filtered out are not ticked and receive no owner
    /// update.
    pub fn entity_filter(
        mut self,
        filter: impl Fn(&dyn crate::game_state::TickableEntity) -> bool + Send + Sync + 'static,
    ) -> ServerBuilder {
        self.entity_filter = Some(Box::new(filter));
        self
    }

    pub fn error_sink(mut self, sink: Arc<dyn ErrorSink>) -> ServerBuilder {
        self.error_sink = Some(sink);
        self
    }

    pub fn build(self) -> Result<Server, ConfigError> {
        self.config.validate()?;
        let error_sink = self.error_sink.unwrap_or_else(|| Arc::new(LogErrorSink));
        let provider = ThreadProvider::new(
            self.config.costs,
            self.config.granularity,
            self.entity_filter,
        );
        let pool = Arc::new(TickThreadPool::new(
            self.config.worker_count,
            provider,
            error_sink.clone(),
        ));
        Ok(Server {
            registry: Arc::new(InstanceRegistry::new()),
            pool,
            stats: Arc::new(TickStats::new()),
            cancel: CancellationToken::new(),
            scheduler_handle: Mutex::new(None),
            error_sink,
            config: self.config,
        })
    }
}

impl Default for ServerBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// The running simulation core: instance registry, worker pool, and the
/// tick scheduler thread.
pub struct Server {
    registry: Arc<InstanceRegistry>,
    pool: Arc<TickThreadPool>,
    stats: Arc<TickStats>,
    cancel: CancellationToken,
    scheduler_handle: Mutex<Option<JoinHandle<()>>>,
    error_sink: Arc<dyn ErrorSink>,
    config: ServerConfig,
}

impl Server {
    pub fn builder() -> ServerBuilder {
        ServerBuilder::new()
    }

    pub fn registry(&self) -> &Arc<InstanceRegistry> {
        &self.registry
    }

    pub fn stats(&self) -> &Arc<TickStats> {
        &self.stats
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Starts the worker pool and the tick scheduler thread. Ticking
    /// begins immediately.
    pub fn start(&self) -> Result<()> {
        self.pool.start()?;
        let scheduler = TickScheduler {
            pool: self.pool.clone(),
            registry: self.registry.clone(),
            error_sink: self.error_sink.clone(),
            cancel: self.cancel.clone(),
            stats: self.stats.clone(),
            tick_nanos: self.config.tick_nanos(),
            max_catch_up: self.config.max_tick_catch_up,
            sleep_threshold: self.config.sleep_threshold,
        };
        let handle = std::thread::Builder::new()
            .name("tick-scheduler".to_string())
            .spawn(move || scheduler.run())
            .context("Spawning tick scheduler")?;
        *self.scheduler_handle.lock() = Some(handle);
        Ok(())
    }

    /// Stops the scheduler (after its current tick) and then the pool
    /// (workers finish their current batch). Idempotent.
    pub fn stop(&self) {
        self.cancel.cancel();
        if let Some(handle) = self.scheduler_handle.lock().take() {
            if handle.join().is_err() {
                log::warn!("Tick scheduler exited by panicking");
            }
        }
        self.pool.stop();
    }

    pub fn is_alive(&self) -> bool {
        !self.cancel.is_cancelled() && self.pool.is_alive()
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        self.stop();
    }
}
