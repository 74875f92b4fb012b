use std::collections::{hash_map::Entry, BTreeSet, HashMap};
use std::sync::Arc;

use anyhow::Result;
use itertools::Itertools;
use tracing::trace;

use crate::cost::{CardinalityEstimator, Cost, CE};
use crate::logical_property::{LogicalProps, LogicalPropsBuilder, ProjectionSet};
use crate::nodes::{ArcPlanNode, ArcPredNode, NodeType, PlanNode, PlanNodeOrGroup};
use crate::optimizer::{DebugInfo, Metadata};
use crate::rules::{LogicalRewriteQueue, LogicalRewriteType, PhysRewriteQueue, PhysicalRewriteType};

/// Identifies an equivalence class of logically equal plan fragments. Dense: indexes into the
/// memo's group vector. Assigned at group creation and never reused.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Debug, Default, Hash)]
pub struct GroupId(pub(crate) usize);

impl std::fmt::Display for GroupId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "!{}", self.0)
    }
}

/// Identifies one logical node within a group. Stable for the lifetime of the memo: nodes are
/// never reordered, and only [`Memo::clear_logical_nodes`] invalidates the indices of a single
/// group.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Debug, Hash)]
pub struct LogicalNodeId {
    pub group_id: GroupId,
    pub index: usize,
}

impl std::fmt::Display for LogicalNodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}", self.group_id, self.index)
    }
}

pub type GroupIdVector = Vec<GroupId>;

/// Ordered by id, which coincides with insertion order per group, so iteration is
/// deterministic.
pub type NodeIdSet = BTreeSet<LogicalNodeId>;

/// Maps an ordered child-group tuple to every node consuming exactly that tuple. Exploration
/// rules (join reordering in particular) use this to find co-located nodes; the integrator uses
/// it as the candidate index for deduplication. Leaf nodes are recorded under the empty tuple.
pub type InputGroupsToNodeIdMap = HashMap<GroupIdVector, NodeIdSet>;

/// Inverse of [`InputGroupsToNodeIdMap`], kept for cleanup in
/// [`Memo::clear_logical_nodes`].
pub type NodeIdToInputGroupsMap = HashMap<LogicalNodeId, GroupIdVector>;

/// Pre-chosen target groups for specific node occurrences of a tree under integration, keyed by
/// node memory address. Rewrites use this to pin their result into the group that spawned them.
pub type NodeTargetGroupMap = HashMap<usize, GroupId>;

/// The address key of a node for [`NodeTargetGroupMap`]. Placement is per occurrence, not per
/// structure: two structurally equal subtrees are distinct keys.
pub fn node_addr<T: NodeType>(node: &ArcPlanNode<T>) -> usize {
    Arc::as_ptr(node) as usize
}

pub type MemoPlanNodeRef<T> = Arc<MemoPlanNode<T>>;

/// A plan node as stored in the memo: all children replaced by group references. Equivalent to
/// MExpr in Columbia/Cascades.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct MemoPlanNode<T: NodeType> {
    pub typ: T,
    pub children: GroupIdVector,
    pub predicates: Vec<ArcPredNode<T>>,
}

impl<T: NodeType> MemoPlanNode<T> {
    /// Rematerialize as a plan node whose children are group references.
    pub fn into_plan_node(self) -> PlanNode<T> {
        PlanNode {
            typ: self.typ,
            children: self
                .children
                .into_iter()
                .map(PlanNodeOrGroup::Group)
                .collect(),
            predicates: self.predicates,
        }
    }
}

impl<T: NodeType> std::fmt::Display for MemoPlanNode<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "({}", self.typ)?;
        for child in &self.children {
            write!(f, " {}", child)?;
        }
        for pred in &self.predicates {
            write!(f, " {}", pred)?;
        }
        write!(f, ")")
    }
}

/// An insertion-ordered interning set of memo plan nodes. The backing vector defines iteration
/// order and index assignment; the map keys on structural hash/equality and speeds up
/// deduplication. Indices are stable under further insertions.
pub struct OrderPreservingNodeSet<T: NodeType> {
    map: HashMap<MemoPlanNodeRef<T>, usize>,
    vector: Vec<MemoPlanNodeRef<T>>,
}

impl<T: NodeType> OrderPreservingNodeSet<T> {
    pub fn new() -> Self {
        Self {
            map: HashMap::new(),
            vector: Vec::new(),
        }
    }

    /// Returns the index of `node` and whether it was newly inserted. On a structural match the
    /// argument is discarded and the existing index returned.
    pub fn emplace_back(&mut self, node: MemoPlanNode<T>) -> (usize, bool) {
        if let Some(&index) = self.map.get(&node) {
            return (index, false);
        }
        let index = self.vector.len();
        let node = Arc::new(node);
        self.map.insert(node.clone(), index);
        self.vector.push(node);
        (index, true)
    }

    /// Appends `node` without deduplication. Lookups keep resolving to the first structurally
    /// equal occurrence.
    pub(crate) fn append_distinct(&mut self, node: MemoPlanNode<T>) -> usize {
        let index = self.vector.len();
        let node = Arc::new(node);
        self.map.entry(node.clone()).or_insert(index);
        self.vector.push(node);
        index
    }

    pub fn find(&self, node: &MemoPlanNode<T>) -> Option<usize> {
        self.map.get(node).copied()
    }

    pub fn at(&self, index: usize) -> &MemoPlanNodeRef<T> {
        &self.vector[index]
    }

    pub fn nodes(&self) -> &[MemoPlanNodeRef<T>] {
        &self.vector
    }

    pub fn len(&self) -> usize {
        self.vector.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vector.is_empty()
    }

    pub fn clear(&mut self) {
        self.map.clear();
        self.vector.clear();
    }
}

/// A materialized physical plan for a group under a specific required property set.
#[derive(Clone, Debug)]
pub struct PhysNodeInfo<T: NodeType> {
    pub node: ArcPlanNode<T>,
    /// Total cost for the entire subtree.
    pub cost: Cost,
    /// Operator cost, not including the subtree.
    pub local_cost: Cost,
    /// Cardinality adjusted for the physical properties in effect (repetition, limit-skip),
    /// used for display.
    pub adjusted_ce: CE,
    /// Rule that produced this plan.
    pub rule: PhysicalRewriteType,
}

/// One entry in a group's winner's circle: the physical optimization state for one required
/// property set. Once a winner is recorded the entry is optimized; the cost limit can no longer
/// be raised and further candidates must go through [`PhysOptimizationResult::reset`].
pub struct PhysOptimizationResult<T: NodeType> {
    index: usize,
    phys_props: T::PhysProps,
    cost_limit: Cost,
    node_info: Option<PhysNodeInfo<T>>,
    /// Candidates that were costed and lost.
    pub rejected_node_info: Vec<PhysNodeInfo<T>>,
    /// Index of the last logical node in the owning group already considered for
    /// implementation under these properties.
    pub last_implemented_node_pos: usize,
    /// Pending physical rewrites for this property set.
    pub queue: PhysRewriteQueue,
}

impl<T: NodeType> PhysOptimizationResult<T> {
    fn new(index: usize, phys_props: T::PhysProps, cost_limit: Cost) -> Self {
        Self {
            index,
            phys_props,
            cost_limit,
            node_info: None,
            rejected_node_info: Vec::new(),
            last_implemented_node_pos: 0,
            queue: PhysRewriteQueue::new(),
        }
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn phys_props(&self) -> &T::PhysProps {
        &self.phys_props
    }

    pub fn cost_limit(&self) -> Cost {
        self.cost_limit
    }

    pub fn is_optimized(&self) -> bool {
        self.node_info.is_some()
    }

    pub fn node_info(&self) -> Option<&PhysNodeInfo<T>> {
        self.node_info.as_ref()
    }

    /// Monotonically relax the pruning bound. Lowering the limit, or raising it after a winner
    /// was recorded, is a programmer error.
    pub fn raise_cost_limit(&mut self, cost_limit: Cost) {
        assert!(
            !self.is_optimized(),
            "cannot raise cost limit for properties {} after a winner was recorded",
            self.phys_props
        );
        assert!(
            cost_limit >= self.cost_limit,
            "cost limit cannot be lowered: {} < {}",
            cost_limit,
            self.cost_limit
        );
        self.cost_limit = cost_limit;
    }

    /// Record the winning plan. Its cost must respect the current limit.
    pub fn set_winner(&mut self, info: PhysNodeInfo<T>) {
        assert!(
            !self.is_optimized(),
            "a winner for properties {} is already recorded",
            self.phys_props
        );
        assert!(
            info.cost <= self.cost_limit,
            "winner cost {} exceeds cost limit {}",
            info.cost,
            self.cost_limit
        );
        self.node_info = Some(info);
    }

    pub fn reject(&mut self, info: PhysNodeInfo<T>) {
        self.rejected_node_info.push(info);
    }

    /// Discard the current winner (keeping it among the rejected candidates) and start a new
    /// optimization round under `cost_limit`. The explicit path for re-optimizing after new
    /// logical nodes appeared in the group.
    pub fn reset(&mut self, cost_limit: Cost) {
        if let Some(info) = self.node_info.take() {
            self.rejected_node_info.push(info);
        }
        self.cost_limit = cost_limit;
    }
}

/// The winner's circle of a group: physical optimization results keyed by required physical
/// properties. Entries are indexed densely in the order their property sets were first
/// requested.
pub struct PhysNodes<T: NodeType> {
    results: Vec<PhysOptimizationResult<T>>,
    props_to_index: HashMap<T::PhysProps, usize>,
}

impl<T: NodeType> PhysNodes<T> {
    pub fn new() -> Self {
        Self {
            results: Vec::new(),
            props_to_index: HashMap::new(),
        }
    }

    /// Returns the entry for `props`, allocating a fresh unoptimized one with the supplied cost
    /// limit if the property set was never requested before. An existing entry keeps its state;
    /// `cost_limit` is ignored for it.
    pub fn add_optimization_result(
        &mut self,
        props: T::PhysProps,
        cost_limit: Cost,
    ) -> &mut PhysOptimizationResult<T> {
        match self.props_to_index.entry(props) {
            Entry::Occupied(entry) => &mut self.results[*entry.get()],
            Entry::Vacant(entry) => {
                let index = self.results.len();
                let result = PhysOptimizationResult::new(index, entry.key().clone(), cost_limit);
                entry.insert(index);
                self.results.push(result);
                self.results.last_mut().unwrap()
            }
        }
    }

    pub fn find(&self, props: &T::PhysProps) -> Option<usize> {
        self.props_to_index.get(props).copied()
    }

    pub fn at(&self, index: usize) -> &PhysOptimizationResult<T> {
        &self.results[index]
    }

    pub fn at_mut(&mut self, index: usize) -> &mut PhysOptimizationResult<T> {
        &mut self.results[index]
    }

    pub fn results(&self) -> &[PhysOptimizationResult<T>] {
        &self.results
    }

    pub fn len(&self) -> usize {
        self.results.len()
    }

    pub fn is_empty(&self) -> bool {
        self.results.is_empty()
    }
}

/// An equivalence class of logically equal plan fragments over the same output projections.
pub struct Group<T: NodeType> {
    pub(crate) logical_nodes: OrderPreservingNodeSet<T>,
    /// Rule that produced each logical node, index-aligned with `logical_nodes`.
    pub(crate) rules: Vec<LogicalRewriteType>,
    /// The projections this group produces. Fixed at group creation.
    projections: ProjectionSet,
    pub(crate) logical_props: Option<LogicalProps>,
    /// Pending logical rewrites for this group.
    pub logical_rewrite_queue: LogicalRewriteQueue,
    physical_nodes: PhysNodes<T>,
}

impl<T: NodeType> Group<T> {
    fn new(projections: ProjectionSet) -> Self {
        Self {
            logical_nodes: OrderPreservingNodeSet::new(),
            rules: Vec::new(),
            projections,
            logical_props: None,
            logical_rewrite_queue: LogicalRewriteQueue::new(),
            physical_nodes: PhysNodes::new(),
        }
    }

    pub fn logical_nodes(&self) -> &OrderPreservingNodeSet<T> {
        &self.logical_nodes
    }

    pub fn rules(&self) -> &[LogicalRewriteType] {
        &self.rules
    }

    pub fn projections(&self) -> &ProjectionSet {
        &self.projections
    }

    /// `None` until the first node was inserted and its properties derived.
    pub fn logical_props(&self) -> Option<&LogicalProps> {
        self.logical_props.as_ref()
    }

    pub fn physical_nodes(&self) -> &PhysNodes<T> {
        &self.physical_nodes
    }

    pub fn physical_nodes_mut(&mut self) -> &mut PhysNodes<T> {
        &mut self.physical_nodes
    }
}

/// External collaborators for one memo operation: catalog metadata, debug knobs, and the two
/// derivation interfaces. All borrowed; the implementations must be pure or replay determinism
/// is lost.
pub struct Context<'a, T: NodeType> {
    pub metadata: &'a Metadata,
    pub debug_info: &'a DebugInfo,
    pub logical_props_builder: &'a dyn LogicalPropsBuilder<T>,
    pub ce_estimator: &'a dyn CardinalityEstimator<T>,
}

impl<'a, T: NodeType> Context<'a, T> {
    pub fn new(
        metadata: &'a Metadata,
        debug_info: &'a DebugInfo,
        logical_props_builder: &'a dyn LogicalPropsBuilder<T>,
        ce_estimator: &'a dyn CardinalityEstimator<T>,
    ) -> Self {
        Self {
            metadata,
            debug_info,
            logical_props_builder,
            ce_estimator,
        }
    }
}

#[derive(Default, Debug, Clone)]
pub struct Stats {
    /// Number of calls to [`Memo::integrate`].
    pub num_integrations: usize,
    /// Number of recursive physical optimization calls, counted by the physical rewriter.
    pub phys_plan_exploration_count: usize,
    /// Number of winner's circle lookups, counted by the physical rewriter.
    pub phys_memo_check_count: usize,
}

/// The memo: a forest of groups with per-level deduplication of the plan fragments inserted
/// into it. Groups reference each other only through [`GroupId`]s carried inside nodes, so the
/// group graph is a DAG owned by a single dense vector. Single-threaded; one optimizer task
/// drives all access.
pub struct Memo<T: NodeType> {
    groups: Vec<Group<T>>,

    // Indexes.
    input_groups_to_node_id: InputGroupsToNodeIdMap,
    node_id_to_input_groups: NodeIdToInputGroupsMap,

    stats: Stats,
}

impl<T: NodeType> Memo<T> {
    pub fn new() -> Self {
        Self {
            groups: Vec::new(),
            input_groups_to_node_id: InputGroupsToNodeIdMap::new(),
            node_id_to_input_groups: NodeIdToInputGroupsMap::new(),
            stats: Stats::default(),
        }
    }

    pub fn get_group(&self, group_id: GroupId) -> &Group<T> {
        self.groups
            .get(group_id.0)
            .unwrap_or_else(|| panic!("group {} does not exist", group_id))
    }

    pub fn get_group_mut(&mut self, group_id: GroupId) -> &mut Group<T> {
        self.groups
            .get_mut(group_id.0)
            .unwrap_or_else(|| panic!("group {} does not exist", group_id))
    }

    pub fn get_group_count(&self) -> usize {
        self.groups.len()
    }

    pub fn get_all_group_ids(&self) -> Vec<GroupId> {
        (0..self.groups.len()).map(GroupId).collect_vec()
    }

    pub fn find_node_in_group(&self, group_id: GroupId, node: &MemoPlanNode<T>) -> Option<usize> {
        self.get_group(group_id).logical_nodes.find(node)
    }

    pub fn get_node(&self, node_id: LogicalNodeId) -> MemoPlanNodeRef<T> {
        self.node_ref(node_id).clone()
    }

    pub fn get_logical_node_count(&self) -> usize {
        self.groups
            .iter()
            .map(|group| group.logical_nodes.len())
            .sum()
    }

    pub fn get_physical_node_count(&self) -> usize {
        self.groups
            .iter()
            .map(|group| group.physical_nodes.len())
            .sum()
    }

    pub fn input_groups_to_node_id_map(&self) -> &InputGroupsToNodeIdMap {
        &self.input_groups_to_node_id
    }

    pub fn stats(&self) -> &Stats {
        &self.stats
    }

    pub fn stats_mut(&mut self) -> &mut Stats {
        &mut self.stats
    }

    /// Derive the logical properties and cardinality estimate of a group, using its first node
    /// as the representative. A no-op if the group already has an estimate.
    pub fn estimate_ce(&mut self, ctx: &Context<'_, T>, group_id: GroupId) -> Result<()> {
        {
            let group = self.get_group(group_id);
            if group
                .logical_props
                .as_ref()
                .is_some_and(|props| props.cardinality.is_some())
            {
                return Ok(());
            }
            assert!(
                !group.logical_nodes.is_empty(),
                "cannot derive properties of group {} without logical nodes",
                group_id
            );
        }
        let node = self.get_node(LogicalNodeId { group_id, index: 0 });
        let props = {
            let children = self.child_props(&node.children);
            ctx.logical_props_builder
                .derive_props(ctx.metadata, &node, &children)?
        };
        assert!(
            props.projections == self.get_group(group_id).projections,
            "group {} projections [{}] do not match derived projections [{}]",
            group_id,
            self.get_group(group_id).projections.iter().join(", "),
            props.projections.iter().join(", ")
        );
        let ce = ctx.ce_estimator.derive_ce(ctx.metadata, self, &props, &node)?;
        trace!(event = "estimate_ce", group_id = %group_id, ce = %ce);
        self.groups[group_id.0].logical_props = Some(LogicalProps {
            cardinality: Some(ce),
            ..props
        });
        Ok(())
    }

    /// Single-level insert of a memoized node, used by the integrator. `props` are the node's
    /// derived logical properties; with no target group a fresh group seeded with their
    /// projections is created and its properties derived on the spot. Newly inserted node ids
    /// are added to `inserted_node_ids` and both indexes are updated.
    #[allow(clippy::too_many_arguments)]
    pub fn add_node(
        &mut self,
        ctx: &Context<'_, T>,
        child_groups: GroupIdVector,
        props: LogicalProps,
        target_group_id: Option<GroupId>,
        inserted_node_ids: &mut NodeIdSet,
        node: MemoPlanNode<T>,
        rule: LogicalRewriteType,
    ) -> Result<LogicalNodeId> {
        self.add_node_inner(
            ctx,
            child_groups,
            props,
            target_group_id,
            inserted_node_ids,
            node,
            rule,
            false,
        )
    }

    /// Insert a plan tree, deduplicating each level against the memo, and return the group
    /// owning the tree's root. Child subtrees are integrated first and replaced by group
    /// references. `target_group_map` pins specific node occurrences into pre-chosen groups;
    /// `add_existing_node_with_new_child` forces the root to be appended even when a
    /// structurally equal node already exists.
    pub fn integrate(
        &mut self,
        ctx: &Context<'_, T>,
        node: &ArcPlanNode<T>,
        target_group_map: NodeTargetGroupMap,
        inserted_node_ids: &mut NodeIdSet,
        rule: LogicalRewriteType,
        add_existing_node_with_new_child: bool,
    ) -> Result<GroupId> {
        trace!(event = "integrate", node = %node, rule = %rule);
        self.stats.num_integrations += 1;
        let group_id = self.integrate_inner(
            ctx,
            node,
            &target_group_map,
            inserted_node_ids,
            rule,
            add_existing_node_with_new_child,
        )?;
        if cfg!(debug_assertions) {
            self.verify_integrity();
        }
        Ok(group_id)
    }

    /// Drop the logical members of one group and their index entries, keeping projections,
    /// logical properties and all physical state. Pending logical rewrites are dropped with the
    /// nodes they reference. Used when restarting exploration for the group.
    pub fn clear_logical_nodes(&mut self, group_id: GroupId) {
        trace!(event = "clear_logical_nodes", group_id = %group_id);
        let group = self.get_group_mut(group_id);
        group.logical_nodes.clear();
        group.rules.clear();
        group.logical_rewrite_queue.clear();

        let stale = self
            .node_id_to_input_groups
            .iter()
            .filter(|(node_id, _)| node_id.group_id == group_id)
            .map(|(node_id, children)| (*node_id, children.clone()))
            .collect_vec();
        for (node_id, children) in stale {
            if let Some(ids) = self.input_groups_to_node_id.get_mut(&children) {
                ids.remove(&node_id);
                if ids.is_empty() {
                    self.input_groups_to_node_id.remove(&children);
                }
            }
            self.node_id_to_input_groups.remove(&node_id);
        }
        if cfg!(debug_assertions) {
            self.verify_integrity();
        }
    }

    /// Full reset: groups, indexes and statistics.
    pub fn clear(&mut self) {
        self.groups.clear();
        self.input_groups_to_node_id.clear();
        self.node_id_to_input_groups.clear();
        self.stats = Stats::default();
    }

    fn node_ref(&self, node_id: LogicalNodeId) -> &MemoPlanNodeRef<T> {
        self.get_group(node_id.group_id)
            .logical_nodes
            .at(node_id.index)
    }

    fn child_props(&self, children: &[GroupId]) -> Vec<&LogicalProps> {
        children
            .iter()
            .map(|group_id| {
                self.get_group(*group_id)
                    .logical_props
                    .as_ref()
                    .unwrap_or_else(|| {
                        panic!("group {} has no derived logical properties", group_id)
                    })
            })
            .collect_vec()
    }

    fn add_group(&mut self, projections: ProjectionSet) -> GroupId {
        let group_id = GroupId(self.groups.len());
        self.groups.push(Group::new(projections));
        trace!(event = "add_group", group_id = %group_id);
        group_id
    }

    /// Find a node structurally equal to `node` among the candidates consuming the same child
    /// tuple. Candidates are visited in id order; the first match wins.
    fn find_node(&self, children: &GroupIdVector, node: &MemoPlanNode<T>) -> Option<LogicalNodeId> {
        let candidates = self.input_groups_to_node_id.get(children)?;
        candidates
            .iter()
            .copied()
            .find(|node_id| self.node_ref(*node_id).as_ref() == node)
    }

    fn integrate_inner(
        &mut self,
        ctx: &Context<'_, T>,
        node: &ArcPlanNode<T>,
        target_group_map: &NodeTargetGroupMap,
        inserted_node_ids: &mut NodeIdSet,
        rule: LogicalRewriteType,
        force_new_node: bool,
    ) -> Result<GroupId> {
        let mut child_groups = GroupIdVector::with_capacity(node.children.len());
        for child in &node.children {
            let group_id = match child {
                PlanNodeOrGroup::Group(group_id) => {
                    assert!(
                        group_id.0 < self.groups.len(),
                        "integrated node {} references non-existent group {}",
                        node,
                        group_id
                    );
                    *group_id
                }
                // Forced insertion applies to the root of the integrated tree only; subtrees
                // deduplicate normally.
                PlanNodeOrGroup::PlanNode(child) => self.integrate_inner(
                    ctx,
                    child,
                    target_group_map,
                    inserted_node_ids,
                    rule,
                    false,
                )?,
            };
            child_groups.push(group_id);
        }
        let memo_node = MemoPlanNode {
            typ: node.typ.clone(),
            children: child_groups.clone(),
            predicates: node.predicates.clone(),
        };

        let existing = self.find_node(&child_groups, &memo_node);
        if let Some(node_id) = existing {
            if !force_new_node {
                return Ok(node_id.group_id);
            }
        }
        let target_group_id = target_group_map
            .get(&node_addr(node))
            .copied()
            .or_else(|| existing.map(|node_id| node_id.group_id));

        let props = {
            let children = self.child_props(&child_groups);
            ctx.logical_props_builder
                .derive_props(ctx.metadata, &memo_node, &children)?
        };
        let node_id = self.add_node_inner(
            ctx,
            child_groups,
            props,
            target_group_id,
            inserted_node_ids,
            memo_node,
            rule,
            force_new_node,
        )?;
        Ok(node_id.group_id)
    }

    #[allow(clippy::too_many_arguments)]
    fn add_node_inner(
        &mut self,
        ctx: &Context<'_, T>,
        child_groups: GroupIdVector,
        props: LogicalProps,
        target_group_id: Option<GroupId>,
        inserted_node_ids: &mut NodeIdSet,
        node: MemoPlanNode<T>,
        rule: LogicalRewriteType,
        force_new_node: bool,
    ) -> Result<LogicalNodeId> {
        assert!(
            node.typ.is_logical(),
            "cannot add physical node {} to the memo",
            node
        );
        debug_assert_eq!(node.children, child_groups);
        for group_id in &child_groups {
            assert!(
                group_id.0 < self.groups.len(),
                "node {} references non-existent group {}",
                node,
                group_id
            );
        }

        let (group_id, fresh_group) = match target_group_id {
            Some(group_id) => {
                let group = self.get_group(group_id);
                assert!(
                    group.projections == props.projections,
                    "cannot add node {} to group {}: projections [{}] do not match group \
                     projections [{}]",
                    node,
                    group_id,
                    props.projections.iter().join(", "),
                    group.projections.iter().join(", ")
                );
                (group_id, false)
            }
            None => (self.add_group(props.projections.clone()), true),
        };
        assert!(
            !child_groups.contains(&group_id),
            "group {} cannot contain a node referencing itself",
            group_id
        );

        let group = &mut self.groups[group_id.0];
        let (index, inserted) = if force_new_node {
            (group.logical_nodes.append_distinct(node), true)
        } else {
            group.logical_nodes.emplace_back(node)
        };
        let node_id = LogicalNodeId { group_id, index };
        if inserted {
            group.rules.push(rule);
            debug_assert_eq!(group.rules.len(), group.logical_nodes.len());
            self.input_groups_to_node_id
                .entry(child_groups.clone())
                .or_default()
                .insert(node_id);
            self.node_id_to_input_groups.insert(node_id, child_groups);
            inserted_node_ids.insert(node_id);
            trace!(event = "add_node", group_id = %group_id, node_id = %node_id, node = %self.node_ref(node_id), rule = %rule);
        }
        if fresh_group {
            debug_assert!(inserted);
            if let Err(err) = self.estimate_ce(ctx, group_id) {
                self.rollback_new_group(node_id, inserted_node_ids);
                return Err(err);
            }
        }
        Ok(node_id)
    }

    /// Unwind a group created for a node whose property derivation failed. Groups created by
    /// already-completed recursive integrations stay; the memo remains in a legal, partially
    /// populated state.
    fn rollback_new_group(&mut self, node_id: LogicalNodeId, inserted_node_ids: &mut NodeIdSet) {
        debug_assert_eq!(node_id.group_id.0 + 1, self.groups.len());
        if let Some(children) = self.node_id_to_input_groups.remove(&node_id) {
            if let Some(ids) = self.input_groups_to_node_id.get_mut(&children) {
                ids.remove(&node_id);
                if ids.is_empty() {
                    self.input_groups_to_node_id.remove(&children);
                }
            }
        }
        inserted_node_ids.remove(&node_id);
        self.groups.pop();
    }

    fn verify_integrity(&self) {
        let mut total_nodes = 0;
        for (group_index, group) in self.groups.iter().enumerate() {
            let group_id = GroupId(group_index);
            assert_eq!(
                group.rules.len(),
                group.logical_nodes.len(),
                "rule tags misaligned in group {}",
                group_id
            );
            total_nodes += group.logical_nodes.len();
            for (index, node) in group.logical_nodes.nodes().iter().enumerate() {
                let node_id = LogicalNodeId { group_id, index };
                for child in &node.children {
                    assert!(child.0 < self.groups.len());
                    assert_ne!(*child, group_id, "group {} references itself", group_id);
                }
                let children = self
                    .node_id_to_input_groups
                    .get(&node_id)
                    .unwrap_or_else(|| panic!("node {} missing from inverse index", node_id));
                assert_eq!(children, &node.children);
                assert!(
                    self.input_groups_to_node_id
                        .get(children)
                        .is_some_and(|ids| ids.contains(&node_id)),
                    "node {} missing from reverse index",
                    node_id
                );
            }
        }
        assert_eq!(total_nodes, self.node_id_to_input_groups.len());
        assert_eq!(
            total_nodes,
            self.input_groups_to_node_id
                .values()
                .map(|ids| ids.len())
                .sum::<usize>()
        );

        // Group references must form a DAG.
        let mut state = vec![0u8; self.groups.len()];
        for group_index in 0..self.groups.len() {
            self.verify_acyclic(GroupId(group_index), &mut state);
        }
    }

    fn verify_acyclic(&self, group_id: GroupId, state: &mut [u8]) {
        match state[group_id.0] {
            1 => panic!("cycle detected through group {}", group_id),
            2 => return,
            _ => {}
        }
        state[group_id.0] = 1;
        for node in self.groups[group_id.0].logical_nodes.nodes() {
            for child in &node.children {
                self.verify_acyclic(*child, state);
            }
        }
        state[group_id.0] = 2;
    }
}
