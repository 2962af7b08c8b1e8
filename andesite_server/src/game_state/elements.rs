use std::time::Instant;

use anyhow::Result;

/// Wall-clock identity of one tick, passed to every element ticked during
/// it. `start` is the monotonic instant the scheduler sampled before
/// dispatch; all elements of one tick observe the same value.
#[derive(Clone, Copy, Debug)]
pub struct TickTime {
    pub start: Instant,
    /// Sequential tick number since server start. Unlike the scheduler's
    /// internal catch-up counter, this never resets.
    pub tick: u64,
}

/// A world. Owns a set of loaded chunks; ticked once per scheduler tick.
///
/// Implementations must be thread safe: the owning worker ticks the
/// instance while arbitrary threads may read it through the acquisition
/// protocol.
pub trait TickableInstance: Send + Sync + 'static {
    fn tick(&self, time: TickTime) -> Result<()>;
}

/// A loaded region of an instance. The instance the chunk belongs to is
/// passed explicitly; chunk and instance may be ticked concurrently on
/// different workers, so the chunk must not assume exclusive access to it.
pub trait TickableChunk: Send + Sync + 'static {
    fn tick(&self, time: TickTime, instance: &dyn TickableInstance) -> Result<()>;
}

/// An entity resident in a loaded chunk.
pub trait TickableEntity: Send + Sync + 'static {
    fn tick(&self, time: TickTime) -> Result<()>;
}

#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Debug)]
pub struct InstanceId(pub(crate) u64);

impl InstanceId {
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Debug)]
pub struct EntityId(pub(crate) u64);

impl EntityId {
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

/// Horizontal chunk coordinate within an instance.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct ChunkPosition {
    pub x: i32,
    pub z: i32,
}

impl ChunkPosition {
    pub fn new(x: i32, z: i32) -> ChunkPosition {
        ChunkPosition { x, z }
    }
}

impl std::fmt::Display for ChunkPosition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "({}, {})", self.x, self.z)
    }
}
