// Copyright (c) 2023-2024 CMU Database Group
//
// Use of this source code is governed by an MIT-style license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT.

//! Rewrite rule tags and the per-group rewrite queues. The memo records which rule produced
//! each node and owns the queues; deciding what to enqueue and in which global order is the
//! scheduler's job.

use std::collections::VecDeque;
use std::fmt::{Display, Formatter};

use crate::cascades::LogicalNodeId;

/// The closed set of logical rewrites. Every logical node in the memo is tagged with the rule
/// that created it; `Root` marks nodes that came from the user-supplied input plan.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum LogicalRewriteType {
    Root,
    FilterMerge,
    FilterSplit,
    FilterProjectTranspose,
    FilterJoinPushDown,
    ProjectMerge,
    ProjectJoinTranspose,
    JoinCommute,
    JoinAssocLeft,
    JoinAssocRight,
    AggProjectTranspose,
    SortLimitMerge,
}

impl Display for LogicalRewriteType {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// The closed set of physical rewrites. Tags the winning (and rejected) physical plans in the
/// winner's circle with the implementation or enforcer rule that produced them.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default)]
pub enum PhysicalRewriteType {
    #[default]
    Uninitialized,
    TableScan,
    IndexScan,
    Filter,
    Project,
    NestedLoopJoin,
    HashJoin,
    SortMergeJoin,
    StreamingAgg,
    HashAgg,
    SortEnforcer,
    GatherEnforcer,
}

impl Display for PhysicalRewriteType {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// A pending logical rewrite: apply `rule` with `node_id` as the source node. Queue entries
/// reference nodes by id, never by view, so that `clear_logical_nodes` cannot leave a queue
/// holding dangling borrows.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LogicalRewriteEntry {
    pub rule: LogicalRewriteType,
    pub node_id: LogicalNodeId,
}

/// A pending physical rewrite: implement the logical node `node_id` with `rule` under the
/// physical properties of the owning optimization result.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PhysRewriteEntry {
    pub rule: PhysicalRewriteType,
    pub node_id: LogicalNodeId,
}

/// FIFO of pending logical rewrites, one per group.
pub type LogicalRewriteQueue = VecDeque<LogicalRewriteEntry>;

/// FIFO of pending physical rewrites, one per winner's circle entry.
pub type PhysRewriteQueue = VecDeque<PhysRewriteEntry>;
