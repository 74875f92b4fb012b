// Copyright (c) 2023-2024 CMU Database Group
//
// Use of this source code is governed by an MIT-style license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT.

use std::collections::BTreeSet;
use std::sync::Arc;

use anyhow::Result;

use crate::cascades::MemoPlanNode;
use crate::cost::CE;
use crate::nodes::NodeType;
use crate::optimizer::Metadata;

/// The name of an output column produced by a plan fragment.
pub type ProjectionName = Arc<str>;

/// The set of output columns of a plan fragment. A `BTreeSet` so that iteration and display
/// order are deterministic.
pub type ProjectionSet = BTreeSet<ProjectionName>;

/// The logical properties shared by every member of a memo group. Derived once per group from
/// the first node inserted into it; the cardinality slot is filled in by the cardinality
/// estimator afterwards.
#[derive(Clone, Debug, PartialEq)]
pub struct LogicalProps {
    pub projections: ProjectionSet,
    pub cardinality: Option<CE>,
}

impl LogicalProps {
    pub fn new(projections: ProjectionSet) -> Self {
        Self {
            projections,
            cardinality: None,
        }
    }
}

/// Derives the logical properties of a single plan node from the properties of its child
/// groups. Implementations must be pure: the same node and child properties always produce the
/// same result, and no state about the memo may be retained across calls.
pub trait LogicalPropsBuilder<T: NodeType>: 'static + Send + Sync {
    /// `children` is index-aligned with `node.children`.
    fn derive_props(
        &self,
        metadata: &Metadata,
        node: &MemoPlanNode<T>,
        children: &[&LogicalProps],
    ) -> Result<LogicalProps>;
}
