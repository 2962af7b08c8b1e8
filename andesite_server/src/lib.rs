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

//! Tick scheduling and element acquisition for the andesite game server.
//!
//! The server simulation advances in fixed-cadence ticks. Each tick, the
//! set of tickable elements (instances, their loaded chunks, and the
//! entities resident in those chunks) is partitioned into cost-weighted
//! batches and spread across a pool of worker threads. Any thread can run
//! a short critical section against an element it does not own through the
//! [`scheduling::Acquirable`] protocol.
//!
//! Entry point is [`server::ServerBuilder`]; the element registry lives in
//! [`game_state::InstanceRegistry`].

pub mod game_state;
pub mod scheduling;
pub mod server;

mod sync;

use std::fmt::Debug;

/// Receives errors that must not abort the tick loop: work item failures,
/// acquisition callback failures, and scheduler step failures.
///
/// Implementations must be cheap and must never block on the tick path.
pub trait ErrorSink: Send + Sync + 'static {
    fn handle(&self, error: anyhow::Error);
}

/// Default sink; reports through the `log` facade and drops the error.
pub struct LogErrorSink;

impl ErrorSink for LogErrorSink {
    fn handle(&self, error: anyhow::Error) {
        log::error!("Tick error: {error:#}");
    }
}

impl Debug for LogErrorSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("LogErrorSink")
    }
}

/// Wrapper to avoid false sharing on per-worker counters that the batch
/// planner polls while workers update them.
#[repr(align(64))]
pub(crate) struct CachelineAligned<T>(pub T);

impl<T> std::ops::Deref for CachelineAligned<T> {
    type Target = T;
    fn deref(&self) -> &T {
        &self.0
    }
}
