// Copyright (c) 2023-2024 CMU Database Group
//
// Use of this source code is governed by an MIT-style license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT.

use std::collections::BTreeSet;
use std::sync::Arc;

use anyhow::{bail, ensure, Result};

use crate::cascades::{Context, GroupId, LogicalNodeId, Memo, MemoPlanNode, PhysNodeInfo};
use crate::cost::{CardinalityEstimator, Cost, CE};
use crate::logical_property::{LogicalProps, LogicalPropsBuilder, ProjectionName, ProjectionSet};
use crate::nodes::{
    ArcPlanNode, ArcPredNode, NodeType, PlanNode, PlanNodeOrGroup, PredNode, Value,
};
use crate::optimizer::{DebugInfo, Metadata};
use crate::rules::PhysicalRewriteType;

#[allow(dead_code)]
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub(crate) enum MemoTestRelTyp {
    Join,
    Project,
    Scan,
    Sort,
    Filter,
    PhysicalNestedLoopJoin,
    PhysicalProject,
    PhysicalFilter,
    PhysicalScan,
    PhysicalSort,
}

#[allow(dead_code)]
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub(crate) enum MemoTestPredTyp {
    List,
    Expr,
    TableName,
    ColumnRef,
}

impl std::fmt::Display for MemoTestRelTyp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

impl std::fmt::Display for MemoTestPredTyp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// Required physical properties for the test vocabulary: either nothing, or sorted on one
/// column.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub(crate) enum TestPhysProps {
    #[default]
    Any,
    Sorted(ProjectionName),
}

impl std::fmt::Display for TestPhysProps {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Any => write!(f, "any"),
            Self::Sorted(name) => write!(f, "sorted({})", name),
        }
    }
}

impl NodeType for MemoTestRelTyp {
    type PredType = MemoTestPredTyp;
    type PhysProps = TestPhysProps;

    fn is_logical(&self) -> bool {
        matches!(
            self,
            Self::Project | Self::Scan | Self::Join | Self::Sort | Self::Filter
        )
    }
}

pub(crate) fn join(
    left: impl Into<PlanNodeOrGroup<MemoTestRelTyp>>,
    right: impl Into<PlanNodeOrGroup<MemoTestRelTyp>>,
    cond: ArcPredNode<MemoTestRelTyp>,
) -> ArcPlanNode<MemoTestRelTyp> {
    Arc::new(PlanNode {
        typ: MemoTestRelTyp::Join,
        children: vec![left.into(), right.into()],
        predicates: vec![cond],
    })
}

pub(crate) fn scan(table: &str) -> ArcPlanNode<MemoTestRelTyp> {
    Arc::new(PlanNode {
        typ: MemoTestRelTyp::Scan,
        children: vec![],
        predicates: vec![table_name(table)],
    })
}

pub(crate) fn filter(
    input: impl Into<PlanNodeOrGroup<MemoTestRelTyp>>,
    cond: ArcPredNode<MemoTestRelTyp>,
) -> ArcPlanNode<MemoTestRelTyp> {
    Arc::new(PlanNode {
        typ: MemoTestRelTyp::Filter,
        children: vec![input.into()],
        predicates: vec![cond],
    })
}

pub(crate) fn project(
    input: impl Into<PlanNodeOrGroup<MemoTestRelTyp>>,
    expr_list: ArcPredNode<MemoTestRelTyp>,
) -> ArcPlanNode<MemoTestRelTyp> {
    Arc::new(PlanNode {
        typ: MemoTestRelTyp::Project,
        children: vec![input.into()],
        predicates: vec![expr_list],
    })
}

pub(crate) fn group(group_id: GroupId) -> PlanNodeOrGroup<MemoTestRelTyp> {
    PlanNodeOrGroup::Group(group_id)
}

pub(crate) fn table_name(table: &str) -> ArcPredNode<MemoTestRelTyp> {
    Arc::new(PredNode {
        typ: MemoTestPredTyp::TableName,
        children: vec![],
        data: Some(Value::String(table.to_string().into())),
    })
}

pub(crate) fn column_ref(column: &str) -> ArcPredNode<MemoTestRelTyp> {
    Arc::new(PredNode {
        typ: MemoTestPredTyp::ColumnRef,
        children: vec![],
        data: Some(Value::String(column.to_string().into())),
    })
}

pub(crate) fn col_list(columns: &[&str]) -> ArcPredNode<MemoTestRelTyp> {
    Arc::new(PredNode {
        typ: MemoTestPredTyp::List,
        children: columns.iter().map(|column| column_ref(column)).collect(),
        data: None,
    })
}

pub(crate) fn expr(data: Value) -> ArcPredNode<MemoTestRelTyp> {
    Arc::new(PredNode {
        typ: MemoTestPredTyp::Expr,
        children: vec![],
        data: Some(data),
    })
}

pub(crate) fn node_id(group: usize, index: usize) -> LogicalNodeId {
    LogicalNodeId {
        group_id: GroupId(group),
        index,
    }
}

pub(crate) fn projection_set(names: &[&str]) -> ProjectionSet {
    names.iter().map(|name| Arc::from(*name)).collect()
}

/// A winner candidate for the winner's circle tests.
pub(crate) fn phys_scan_info(cost: Cost) -> PhysNodeInfo<MemoTestRelTyp> {
    PhysNodeInfo {
        node: Arc::new(PlanNode {
            typ: MemoTestRelTyp::PhysicalScan,
            children: vec![],
            predicates: vec![table_name("c")],
        }),
        cost,
        local_cost: cost,
        adjusted_ce: CE::new(1000.0),
        rule: PhysicalRewriteType::TableScan,
    }
}

/// The catalog payload carried through [`Metadata`] in tests.
pub(crate) struct TestCatalog {
    tables: BTreeSet<String>,
}

/// Derives projections per operator: scans produce a projection named after the table, joins
/// union their inputs, projects rebind to their column list.
pub(crate) struct TestPropsBuilder;

impl LogicalPropsBuilder<MemoTestRelTyp> for TestPropsBuilder {
    fn derive_props(
        &self,
        metadata: &Metadata,
        node: &MemoPlanNode<MemoTestRelTyp>,
        children: &[&LogicalProps],
    ) -> Result<LogicalProps> {
        match node.typ {
            MemoTestRelTyp::Scan => {
                let catalog = metadata
                    .downcast_ref::<TestCatalog>()
                    .expect("metadata is not a test catalog");
                let table = node.predicates[0].unwrap_data().as_str();
                ensure!(
                    catalog.tables.contains(table.as_ref()),
                    "table {} does not exist",
                    table
                );
                Ok(LogicalProps::new(BTreeSet::from([table])))
            }
            MemoTestRelTyp::Filter | MemoTestRelTyp::Sort => {
                Ok(LogicalProps::new(children[0].projections.clone()))
            }
            MemoTestRelTyp::Project => {
                let projections = node.predicates[0]
                    .children
                    .iter()
                    .map(|column| column.unwrap_data().as_str())
                    .collect();
                Ok(LogicalProps::new(projections))
            }
            MemoTestRelTyp::Join => {
                let mut projections = children[0].projections.clone();
                projections.extend(children[1].projections.iter().cloned());
                Ok(LogicalProps::new(projections))
            }
            _ => bail!("cannot derive logical properties for {}", node.typ),
        }
    }
}

/// A fixed-selectivity estimator: scans return 1000 rows, filters keep 30%, joins retain 10%
/// of the cross product. The table `nostats` exists in the catalog but has no statistics, so
/// estimating it fails.
pub(crate) struct TestCeEstimator;

impl TestCeEstimator {
    fn child_ce(memo: &Memo<MemoTestRelTyp>, group_id: GroupId) -> CE {
        memo.get_group(group_id)
            .logical_props()
            .expect("child group without logical properties")
            .cardinality
            .expect("child group without cardinality estimate")
    }
}

impl CardinalityEstimator<MemoTestRelTyp> for TestCeEstimator {
    fn derive_ce(
        &self,
        _metadata: &Metadata,
        memo: &Memo<MemoTestRelTyp>,
        _props: &LogicalProps,
        node: &MemoPlanNode<MemoTestRelTyp>,
    ) -> Result<CE> {
        match node.typ {
            MemoTestRelTyp::Scan => {
                let table = node.predicates[0].unwrap_data().as_str();
                if table.as_ref() == "nostats" {
                    bail!("no statistics for table {}", table);
                }
                Ok(CE::new(1000.0))
            }
            MemoTestRelTyp::Filter => {
                let input = Self::child_ce(memo, node.children[0]);
                Ok(CE::new(input.value() * 0.3))
            }
            MemoTestRelTyp::Project | MemoTestRelTyp::Sort => {
                Ok(Self::child_ce(memo, node.children[0]))
            }
            MemoTestRelTyp::Join => {
                let left = Self::child_ce(memo, node.children[0]);
                let right = Self::child_ce(memo, node.children[1]);
                Ok(CE::new(left.value() * right.value() * 0.1))
            }
            _ => bail!("cannot estimate cardinality for {}", node.typ),
        }
    }
}

/// Bundles the collaborators a [`Context`] borrows, so tests can build one in a single line.
pub(crate) struct TestEnv {
    metadata: Metadata,
    debug_info: DebugInfo,
    props_builder: TestPropsBuilder,
    ce_estimator: TestCeEstimator,
}

impl TestEnv {
    pub(crate) fn new() -> Self {
        Self::with_tables(&["a", "c", "t1", "t2", "nostats"])
    }

    pub(crate) fn with_tables(tables: &[&str]) -> Self {
        let catalog = TestCatalog {
            tables: tables.iter().map(|table| table.to_string()).collect(),
        };
        Self {
            metadata: Metadata::new(catalog),
            debug_info: DebugInfo::for_testing(),
            props_builder: TestPropsBuilder,
            ce_estimator: TestCeEstimator,
        }
    }

    pub(crate) fn ctx(&self) -> Context<'_, MemoTestRelTyp> {
        Context::new(
            &self.metadata,
            &self.debug_info,
            &self.props_builder,
            &self.ce_estimator,
        )
    }
}
