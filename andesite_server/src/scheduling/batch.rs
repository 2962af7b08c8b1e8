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

use anyhow::{bail, Result};
use tracy_client::span;

use crate::game_state::{
    InstanceRegistry, TickTime, TickableChunk, TickableEntity, TickableInstance,
};

use super::acquire::{Acquirable, AcquirableHandler};
use super::worker::WorkerHandle;

/// Cost estimates used to balance batches across workers. The absolute
/// values only matter relative to each other.
#[derive(Clone, Copy, Debug)]
pub struct TickCosts {
    pub instance: u32,
    pub chunk: u32,
    pub entity: u32,
}

impl Default for TickCosts {
    fn default() -> Self {
        TickCosts {
            instance: 5,
            chunk: 5,
            entity: 5,
        }
    }
}

/// How finely the element set is partitioned into batches.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum BatchGranularity {
    /// One batch per instance, covering the instance, all of its loaded
    /// chunks, and their entities. Everything in an instance lands on one
    /// worker.
    PerInstance,
    /// One instance-only batch, plus one batch per loaded chunk (the chunk
    /// and its resident entities). Spreads a single busy instance over the
    /// whole pool.
    #[default]
    PerChunk,
}

/// Optional predicate deciding whether an entity is ticked this tick. Runs
/// on the planner thread; must only read state that is safe to read
/// concurrently with the previous tick's owners.
pub type EntityFilter = Box<dyn Fn(&dyn TickableEntity) -> bool + Send + Sync>;

/// One schedulable unit of tick work.
pub(crate) enum WorkItem {
    Instance {
        handle: Acquirable<dyn TickableInstance>,
    },
    Chunk {
        handle: Acquirable<dyn TickableChunk>,
        // The chunk's tick receives its instance explicitly. The instance
        // may be ticking concurrently on another worker.
        instance: Acquirable<dyn TickableInstance>,
    },
    Entity {
        handle: Acquirable<dyn TickableEntity>,
    },
}

impl WorkItem {
    fn handler(&self) -> &AcquirableHandler {
        match self {
            WorkItem::Instance { handle } => handle.handler(),
            WorkItem::Chunk { handle, .. } => handle.handler(),
            WorkItem::Entity { handle } => handle.handler(),
        }
    }
}

/// An ordered run of work items owned by exactly one worker for one tick.
pub(crate) struct Batch {
    pub(crate) items: Vec<WorkItem>,
    pub(crate) cost: u32,
    pub(crate) time: TickTime,
}

/// Accumulates the items of one batch, then hands the batch to the
/// cheapest worker.
struct BatchSetup {
    items: Vec<WorkItem>,
    cost: u32,
}

impl BatchSetup {
    fn new() -> BatchSetup {
        BatchSetup {
            items: Vec::new(),
            cost: 0,
        }
    }

    fn add_instance(&mut self, handle: Acquirable<dyn TickableInstance>, costs: &TickCosts) {
        self.items.push(WorkItem::Instance { handle });
        self.cost += costs.instance;
    }

    fn add_chunk(
        &mut self,
        handle: Acquirable<dyn TickableChunk>,
        instance: Acquirable<dyn TickableInstance>,
        costs: &TickCosts,
    ) {
        self.items.push(WorkItem::Chunk { handle, instance });
        self.cost += costs.chunk;
    }

    fn add_entity(&mut self, handle: Acquirable<dyn TickableEntity>, costs: &TickCosts) {
        self.items.push(WorkItem::Entity { handle });
        self.cost += costs.entity;
    }

    /// Picks the worker with the smallest cost counter (lowest index wins
    /// ties), publishes it as the owner of every item in the batch, then
    /// pushes the batch. Publication must complete before the push so that
    /// acquisitions racing with the tick observe the new owner.
    fn push_to(self, workers: &[Arc<WorkerHandle>], time: TickTime) -> Result<()> {
        let mut fit: Option<&Arc<WorkerHandle>> = None;
        let mut min_cost = u32::MAX;
        for worker in workers {
            let cost = worker.tick_cost();
            // u32::MAX marks a worker as full; never assign to it.
            if cost == u32::MAX {
                continue;
            }
            if fit.is_none() || cost < min_cost {
                fit = Some(worker);
                min_cost = cost;
            }
        }
        let Some(worker) = fit else {
            bail!("No worker can take a batch: all {} are full", workers.len());
        };

        for item in &self.items {
            item.handler().refresh_worker(worker.clone());
        }

        worker.add_batch(Batch {
            items: self.items,
            cost: self.cost,
            time,
        })
    }
}

/// Walks the instance registry each tick and turns it into cost-balanced
/// batches.
pub struct ThreadProvider {
    costs: TickCosts,
    granularity: BatchGranularity,
    entity_filter: Option<EntityFilter>,
}

impl ThreadProvider {
    pub(crate) fn new(
        costs: TickCosts,
        granularity: BatchGranularity,
        entity_filter: Option<EntityFilter>,
    ) -> ThreadProvider {
        ThreadProvider {
            costs,
            granularity,
            entity_filter,
        }
    }

    /// Plans one tick: enumerates every instance, chunk, and resident
    /// entity, groups them into batches per the configured granularity,
    /// and assigns each batch to the cheapest worker.
    ///
    /// Runs under the registry read lock, so membership is frozen for the
    /// duration of planning. An instance with no chunks still contributes
    /// a single instance-only batch.
    pub fn update(
        &self,
        registry: &InstanceRegistry,
        time: TickTime,
        workers: &[Arc<WorkerHandle>],
    ) -> Result<()> {
        let _span = span!("plan_tick");
        let guard = registry.read();
        for slot in guard.values() {
            match self.granularity {
                BatchGranularity::PerInstance => {
                    let mut setup = BatchSetup::new();
                    setup.add_instance(slot.handle.clone(), &self.costs);
                    for chunk in slot.chunks.values() {
                        setup.add_chunk(
                            chunk.handle.clone(),
                            slot.handle.clone(),
                            &self.costs,
                        );
                        self.add_entities(&mut setup, chunk);
                    }
                    setup.push_to(workers, time)?;
                }
                BatchGranularity::PerChunk => {
                    let mut setup = BatchSetup::new();
                    setup.add_instance(slot.handle.clone(), &self.costs);
                    setup.push_to(workers, time)?;
                    for chunk in slot.chunks.values() {
                        let mut setup = BatchSetup::new();
                        setup.add_chunk(
                            chunk.handle.clone(),
                            slot.handle.clone(),
                            &self.costs,
                        );
                        self.add_entities(&mut setup, chunk);
                        setup.push_to(workers, time)?;
                    }
                }
            }
        }
        Ok(())
    }

    fn add_entities(&self, setup: &mut BatchSetup, chunk: &crate::game_state::ChunkSlot) {
        for entity in chunk.entities.values() {
            let should_tick = match &self.entity_filter {
                Some(filter) => filter(entity.unsafe_unwrap()),
                None => true,
            };
            if should_tick {
                setup.add_entity(entity.clone(), &self.costs);
            }
        }
    }
}
