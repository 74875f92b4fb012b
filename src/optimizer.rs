// Copyright (c) 2023-2024 CMU Database Group
//
// Use of this source code is governed by an MIT-style license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT.

//! Session-wide context threaded through property derivation and cardinality estimation. The
//! memo itself never inspects either type.

use std::any::Any;

/// Opaque catalog information (table definitions, indexes, statistics sources). Owned by the
/// caller and passed by reference through [`crate::cascades::Context`]; property derivation
/// implementations downcast it to whatever concrete catalog they were built against.
pub struct Metadata(pub Box<dyn Any + Send + Sync + 'static>);

impl Metadata {
    pub fn new<M: Any + Send + Sync + 'static>(metadata: M) -> Self {
        Metadata(Box::new(metadata))
    }

    /// A metadata payload for callers that do not need one.
    pub fn empty() -> Self {
        Metadata(Box::new(()))
    }

    pub fn downcast_ref<M: Any>(&self) -> Option<&M> {
        self.0.downcast_ref()
    }
}

/// Debugging knobs for one optimization session. The iteration limit is consumed by the driver
/// above the memo, which checks it between rewrite-queue drains; the memo has no internal
/// cancellation.
#[derive(Clone, Debug)]
pub struct DebugInfo {
    debug_mode: bool,
    iteration_limit: Option<usize>,
}

impl DebugInfo {
    pub fn new(debug_mode: bool, iteration_limit: Option<usize>) -> Self {
        Self {
            debug_mode,
            iteration_limit,
        }
    }

    pub fn for_prod() -> Self {
        Self::new(false, None)
    }

    pub fn for_testing() -> Self {
        Self::new(true, Some(10_000))
    }

    pub fn is_debug_mode(&self) -> bool {
        self.debug_mode
    }

    pub fn iteration_limit(&self) -> Option<usize> {
        self.iteration_limit
    }
}
