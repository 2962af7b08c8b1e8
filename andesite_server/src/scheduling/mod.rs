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

//! Tick execution: batch planning, the worker pool, the wall-clock
//! scheduler, and the cross-thread acquisition protocol.

pub mod acquire;
pub mod batch;
pub mod pool;
pub mod scheduler;
pub mod worker;

#[cfg(test)]
mod tests;

pub use acquire::{Acquirable, AcquirableHandler};
pub use batch::{BatchGranularity, EntityFilter, ThreadProvider, TickCosts};
pub use pool::TickThreadPool;
pub use scheduler::TickStats;
pub use worker::WorkerHandle;

pub(crate) use scheduler::TickScheduler;
