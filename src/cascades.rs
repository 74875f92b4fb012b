// Copyright (c) 2023-2024 CMU Database Group
//
// Use of this source code is governed by an MIT-style license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT.

//! The memo table at the core of the cascades optimizer.

mod memo;

pub use memo::{
    node_addr, Context, Group, GroupId, GroupIdVector, InputGroupsToNodeIdMap, LogicalNodeId,
    Memo, MemoPlanNode, MemoPlanNodeRef, NodeIdSet, NodeIdToInputGroupsMap, NodeTargetGroupMap,
    OrderPreservingNodeSet, PhysNodeInfo, PhysNodes, PhysOptimizationResult, Stats,
};
