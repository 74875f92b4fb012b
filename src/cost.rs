// Copyright (c) 2023-2024 CMU Database Group
//
// Use of this source code is governed by an MIT-style license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT.

use anyhow::Result;
use ordered_float::OrderedFloat;

use crate::cascades::{Memo, MemoPlanNode};
use crate::logical_property::LogicalProps;
use crate::nodes::NodeType;
use crate::optimizer::Metadata;

/// The total or per-operator cost of a physical plan fragment. A lower value means a better
/// plan. Backed by an ordered float so costs can be compared, hashed, and used as pruning
/// bounds.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Cost(pub OrderedFloat<f64>);

impl Cost {
    pub fn new(value: f64) -> Self {
        assert!(!value.is_nan(), "cost cannot be NaN");
        Cost(OrderedFloat(value))
    }

    /// The unbounded cost limit: every finite plan cost is below it.
    pub fn infinite() -> Self {
        Cost(OrderedFloat(f64::INFINITY))
    }

    pub fn is_finite(&self) -> bool {
        self.0 .0.is_finite()
    }

    pub fn value(&self) -> f64 {
        self.0 .0
    }
}

impl std::fmt::Display for Cost {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.is_finite() {
            write!(f, "{}", self.0 .0)
        } else {
            write!(f, "{{inf}}")
        }
    }
}

/// A cardinality estimate: the expected number of rows a plan fragment returns. Always
/// non-negative.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct CE(pub OrderedFloat<f64>);

impl CE {
    pub fn new(value: f64) -> Self {
        assert!(value >= 0.0, "cardinality estimate cannot be negative");
        CE(OrderedFloat(value))
    }

    pub fn value(&self) -> f64 {
        self.0 .0
    }
}

impl std::fmt::Display for CE {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0 .0)
    }
}

/// Estimates the cardinality of a memo group given its logical properties and a representative
/// node. Implementations may look up child groups in the memo but must be pure with respect to
/// it, or replay determinism is lost.
pub trait CardinalityEstimator<T: NodeType>: 'static + Send + Sync {
    fn derive_ce(
        &self,
        metadata: &Metadata,
        memo: &Memo<T>,
        props: &LogicalProps,
        node: &MemoPlanNode<T>,
    ) -> Result<CE>;
}
