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

pub mod elements;

use std::sync::atomic::{AtomicU64, Ordering};

use log::info;
use parking_lot::{RwLock, RwLockReadGuard};
use rustc_hash::FxHashMap;
use thiserror::Error;

use crate::scheduling::Acquirable;

pub use elements::{
    ChunkPosition, EntityId, InstanceId, TickTime, TickableChunk, TickableEntity,
    TickableInstance,
};

/// Arena-style storage for every tickable element on the server.
///
/// Instances own the positions of their loaded chunks; each chunk slot owns
/// the IDs of the entities resident in it. Back-references go through IDs,
/// never through ownership, so element payloads stay acyclic.
///
/// The batch planner enumerates elements under this registry's read lock.
/// All membership mutations (chunk load/unload, entity spawn/remove/switch)
/// take the write lock, so the planner can never observe a half-moved
/// entity. Callers are still expected to perform chunk switches only
/// between ticks on the owning worker; the registry does not enforce that
/// discipline.
pub struct InstanceRegistry {
    instances: RwLock<FxHashMap<InstanceId, InstanceSlot>>,
    next_instance_id: AtomicU64,
    next_entity_id: AtomicU64,
}

pub(crate) struct InstanceSlot {
    pub(crate) handle: Acquirable<dyn TickableInstance>,
    pub(crate) chunks: FxHashMap<ChunkPosition, ChunkSlot>,
    // Entity -> containing chunk, kept in lockstep with the chunk slots.
    entity_index: FxHashMap<EntityId, ChunkPosition>,
}

pub(crate) struct ChunkSlot {
    pub(crate) handle: Acquirable<dyn TickableChunk>,
    pub(crate) entities: FxHashMap<EntityId, Acquirable<dyn TickableEntity>>,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("Instance not found")]
    InstanceNotFound,
    #[error("Chunk {0} is not loaded")]
    ChunkNotLoaded(ChunkPosition),
    #[error("Chunk {0} is already loaded")]
    ChunkAlreadyLoaded(ChunkPosition),
    #[error("Entity not found")]
    EntityNotFound,
}

impl InstanceRegistry {
    pub fn new() -> InstanceRegistry {
        InstanceRegistry {
            instances: RwLock::new(FxHashMap::default()),
            next_instance_id: AtomicU64::new(1),
            next_entity_id: AtomicU64::new(1),
        }
    }

    pub fn add_instance(
        &self,
        instance: impl TickableInstance,
    ) -> (InstanceId, Acquirable<dyn TickableInstance>) {
        let id = InstanceId(self.next_instance_id.fetch_add(1, Ordering::Relaxed));
        let handle = Acquirable::new_instance(instance);
        self.instances.write().insert(
            id,
            InstanceSlot {
                handle: handle.clone(),
                chunks: FxHashMap::default(),
                entity_index: FxHashMap::default(),
            },
        );
        info!("Registered instance {}", id.as_u64());
        (id, handle)
    }

    pub fn remove_instance(&self, id: InstanceId) -> Result<(), RegistryError> {
        let slot = self
            .instances
            .write()
            .remove(&id)
            .ok_or(RegistryError::InstanceNotFound)?;
        info!(
            "Removed instance {} ({} chunks, {} entities)",
            id.as_u64(),
            slot.chunks.len(),
            slot.entity_index.len()
        );
        Ok(())
    }

    pub fn instance_handle(&self, id: InstanceId) -> Option<Acquirable<dyn TickableInstance>> {
        self.instances.read().get(&id).map(|s| s.handle.clone())
    }

    pub fn load_chunk(
        &self,
        instance: InstanceId,
        pos: ChunkPosition,
        chunk: impl TickableChunk,
    ) -> Result<Acquirable<dyn TickableChunk>, RegistryError> {
        let mut guard = self.instances.write();
        let slot = guard
            .get_mut(&instance)
            .ok_or(RegistryError::InstanceNotFound)?;
        if slot.chunks.contains_key(&pos) {
            return Err(RegistryError::ChunkAlreadyLoaded(pos));
        }
        let handle = Acquirable::new_chunk(chunk);
        slot.chunks.insert(
            pos,
            ChunkSlot {
                handle: handle.clone(),
                entities: FxHashMap::default(),
            },
        );
        Ok(handle)
    }

    /// Unloads a chunk, dropping its resident entities from the tick set.
    /// Returns how many entities went with it.
    pub fn unload_chunk(
        &self,
        instance: InstanceId,
        pos: ChunkPosition,
    ) -> Result<usize, RegistryError> {
        let mut guard = self.instances.write();
        let slot = guard
            .get_mut(&instance)
            .ok_or(RegistryError::InstanceNotFound)?;
        let chunk = slot
            .chunks
            .remove(&pos)
            .ok_or(RegistryError::ChunkNotLoaded(pos))?;
        for id in chunk.entities.keys() {
            slot.entity_index.remove(id);
        }
        if !chunk.entities.is_empty() {
            info!(
                "Unloaded chunk {} with {} resident entities",
                pos,
                chunk.entities.len()
            );
        }
        Ok(chunk.entities.len())
    }

    pub fn chunk_handle(
        &self,
        instance: InstanceId,
        pos: ChunkPosition,
    ) -> Option<Acquirable<dyn TickableChunk>> {
        self.instances
            .read()
            .get(&instance)
            .and_then(|s| s.chunks.get(&pos))
            .map(|c| c.handle.clone())
    }

    /// Spawns an entity into a loaded chunk. Spawning into an unloaded
    /// chunk is an error; entities have no existence outside a chunk.
    pub fn spawn_entity(
        &self,
        instance: InstanceId,
        pos: ChunkPosition,
        entity: impl TickableEntity,
    ) -> Result<(EntityId, Acquirable<dyn TickableEntity>), RegistryError> {
        let handle = Acquirable::new_entity(entity);
        let id = self.spawn_entity_handle(instance, pos, handle.clone())?;
        Ok((id, handle))
    }

    /// Like [`InstanceRegistry::spawn_entity`], but for a pre-built handle.
    /// Useful when the caller needs the handle before the entity is live
    /// (e.g. entities that reference themselves).
    pub fn spawn_entity_handle(
        &self,
        instance: InstanceId,
        pos: ChunkPosition,
        handle: Acquirable<dyn TickableEntity>,
    ) -> Result<EntityId, RegistryError> {
        let mut guard = self.instances.write();
        let slot = guard
            .get_mut(&instance)
            .ok_or(RegistryError::InstanceNotFound)?;
        let chunk = slot
            .chunks
            .get_mut(&pos)
            .ok_or(RegistryError::ChunkNotLoaded(pos))?;
        let id = EntityId(self.next_entity_id.fetch_add(1, Ordering::Relaxed));
        chunk.entities.insert(id, handle);
        slot.entity_index.insert(id, pos);
        Ok(id)
    }

    pub fn remove_entity(
        &self,
        instance: InstanceId,
        entity: EntityId,
    ) -> Result<(), RegistryError> {
        let mut guard = self.instances.write();
        let slot = guard
            .get_mut(&instance)
            .ok_or(RegistryError::InstanceNotFound)?;
        let pos = slot
            .entity_index
            .remove(&entity)
            .ok_or(RegistryError::EntityNotFound)?;
        if let Some(chunk) = slot.chunks.get_mut(&pos) {
            chunk.entities.remove(&entity);
        }
        Ok(())
    }

    pub fn entity_handle(
        &self,
        instance: InstanceId,
        entity: EntityId,
    ) -> Option<Acquirable<dyn TickableEntity>> {
        let guard = self.instances.read();
        let slot = guard.get(&instance)?;
        let pos = slot.entity_index.get(&entity)?;
        slot.chunks
            .get(pos)
            .and_then(|c| c.entities.get(&entity))
            .cloned()
    }

    /// Moves an entity's membership from its current chunk to `new_pos`,
    /// atomically with respect to the batch planner's enumeration. Must be
    /// called between ticks on the entity's owning worker (typically from
    /// a scheduled acquisition).
    pub fn switch_entity_chunk(
        &self,
        instance: InstanceId,
        entity: EntityId,
        new_pos: ChunkPosition,
    ) -> Result<(), RegistryError> {
        let mut guard = self.instances.write();
        let slot = guard
            .get_mut(&instance)
            .ok_or(RegistryError::InstanceNotFound)?;
        let old_pos = *slot
            .entity_index
            .get(&entity)
            .ok_or(RegistryError::EntityNotFound)?;
        if old_pos == new_pos {
            return Ok(());
        }
        if !slot.chunks.contains_key(&new_pos) {
            return Err(RegistryError::ChunkNotLoaded(new_pos));
        }
        let handle = slot
            .chunks
            .get_mut(&old_pos)
            .and_then(|c| c.entities.remove(&entity))
            .ok_or(RegistryError::EntityNotFound)?;
        slot.chunks
            .get_mut(&new_pos)
            .expect("chunk checked loaded under the same write lock")
            .entities
            .insert(entity, handle);
        slot.entity_index.insert(entity, new_pos);
        Ok(())
    }

    pub fn instance_count(&self) -> usize {
        self.instances.read().len()
    }

    pub(crate) fn read(
        &self,
    ) -> RwLockReadGuard<'_, FxHashMap<InstanceId, InstanceSlot>> {
        self.instances.read()
    }
}

impl Default for InstanceRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Result;

    struct Noop;
    impl TickableInstance for Noop {
        fn tick(&self, _time: TickTime) -> Result<()> {
            Ok(())
        }
    }
    impl TickableChunk for Noop {
        fn tick(&self, _time: TickTime, _instance: &dyn TickableInstance) -> Result<()> {
            Ok(())
        }
    }
    impl TickableEntity for Noop {
        fn tick(&self, _time: TickTime) -> Result<()> {
            Ok(())
        }
    }

    #[test]
    fn membership_lifecycle() {
        let registry = InstanceRegistry::new();
        let (instance, _) = registry.add_instance(Noop);
        let a = ChunkPosition::new(0, 0);
        let b = ChunkPosition::new(1, 0);
        registry.load_chunk(instance, a, Noop).unwrap();
        registry.load_chunk(instance, b, Noop).unwrap();
        assert_eq!(
            registry.load_chunk(instance, a, Noop).unwrap_err(),
            RegistryError::ChunkAlreadyLoaded(a)
        );

        let (entity, _) = registry.spawn_entity(instance, a, Noop).unwrap();
        registry.switch_entity_chunk(instance, entity, b).unwrap();
        assert!(registry.entity_handle(instance, entity).is_some());

        // Switching to an unloaded chunk fails and leaves membership alone.
        let missing = ChunkPosition::new(9, 9);
        assert_eq!(
            registry
                .switch_entity_chunk(instance, entity, missing)
                .unwrap_err(),
            RegistryError::ChunkNotLoaded(missing)
        );
        assert!(registry.entity_handle(instance, entity).is_some());

        assert_eq!(registry.unload_chunk(instance, b).unwrap(), 1);
        assert!(registry.entity_handle(instance, entity).is_none());
        assert_eq!(
            registry.remove_entity(instance, entity).unwrap_err(),
            RegistryError::EntityNotFound
        );
    }

    #[test]
    fn spawn_requires_loaded_chunk() {
        let registry = InstanceRegistry::new();
        let (instance, _) = registry.add_instance(Noop);
        let pos = ChunkPosition::new(3, -2);
        assert_eq!(
            registry.spawn_entity(instance, pos, Noop).unwrap_err(),
            RegistryError::ChunkNotLoaded(pos)
        );
    }
}
