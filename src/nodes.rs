// Copyright (c) 2023-2024 CMU Database Group
//
// Use of this source code is governed by an MIT-style license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT.

//! The plan node is the basic data structure of the memo. It is dynamically typed over a
//! user-supplied operator vocabulary and is the internal representation of algebraic plan
//! fragments.

use std::fmt::{Debug, Display};
use std::hash::Hash;
use std::sync::Arc;

use ordered_float::OrderedFloat;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::cascades::GroupId;

#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SerializableOrderedF64(pub OrderedFloat<f64>);

impl Serialize for SerializableOrderedF64 {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        // Directly serialize the inner f64 value of the OrderedFloat
        self.0 .0.serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for SerializableOrderedF64 {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let float = f64::deserialize(deserializer)?;
        Ok(SerializableOrderedF64(OrderedFloat(float)))
    }
}

/// A literal carried by a predicate leaf.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize, PartialOrd, Ord)]
pub enum Value {
    UInt64(u64),
    Int32(i32),
    Int64(i64),
    Float(SerializableOrderedF64),
    String(Arc<str>),
    Bool(bool),
    Serialized(Arc<[u8]>),
}

impl std::fmt::Display for Value {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::UInt64(x) => write!(f, "{x}(u64)"),
            Self::Int32(x) => write!(f, "{x}(i32)"),
            Self::Int64(x) => write!(f, "{x}(i64)"),
            Self::Float(x) => write!(f, "{}(float)", x.0),
            Self::String(x) => write!(f, "\"{x}\""),
            Self::Bool(x) => write!(f, "{x}"),
            Self::Serialized(x) => write!(f, "<len:{}>", x.len()),
        }
    }
}

/// The `as_*()` functions do not perform conversions.
impl Value {
    pub fn as_u64(&self) -> u64 {
        match self {
            Value::UInt64(i) => *i,
            _ => panic!("Value is not an u64"),
        }
    }

    pub fn as_i32(&self) -> i32 {
        match self {
            Value::Int32(i) => *i,
            _ => panic!("Value is not an i32"),
        }
    }

    pub fn as_i64(&self) -> i64 {
        match self {
            Value::Int64(i) => *i,
            _ => panic!("Value is not an i64"),
        }
    }

    pub fn as_f64(&self) -> f64 {
        match self {
            Value::Float(i) => *i.0,
            _ => panic!("Value is not an f64"),
        }
    }

    pub fn as_bool(&self) -> bool {
        match self {
            Value::Bool(i) => *i,
            _ => panic!("Value is not a bool"),
        }
    }

    pub fn as_str(&self) -> Arc<str> {
        match self {
            Value::String(i) => i.clone(),
            _ => panic!("Value is not a string"),
        }
    }

    pub fn as_slice(&self) -> Arc<[u8]> {
        match self {
            Value::Serialized(i) => i.clone(),
            _ => panic!("Value is not a serialized"),
        }
    }
}

/// The operator vocabulary the memo is instantiated with. Structural hash and equality of
/// everything stored in the memo bottom out in these associated types.
pub trait NodeType:
    PartialEq + Eq + Hash + Clone + 'static + Display + Debug + Send + Sync
{
    type PredType: PartialEq + Eq + Hash + Clone + 'static + Display + Debug + Send + Sync;

    /// The required physical property set used to key the winner's circle. The `Default` value
    /// represents "no requirement".
    type PhysProps: PartialEq
        + Eq
        + Hash
        + Clone
        + Default
        + 'static
        + Display
        + Debug
        + Send
        + Sync;

    fn is_logical(&self) -> bool;
}

/// A pointer to a plan node
pub type ArcPlanNode<T> = Arc<PlanNode<T>>;

/// A pointer to a predicate node
pub type ArcPredNode<T> = Arc<PredNode<T>>;

/// A child of a plan node: either a materialized subtree, or a reference to a memo group that
/// stands in for every equivalent subtree.
#[derive(Clone, Debug, Hash, PartialEq, Eq)]
pub enum PlanNodeOrGroup<T: NodeType> {
    PlanNode(ArcPlanNode<T>),
    Group(GroupId),
}

impl<T: NodeType> PlanNodeOrGroup<T> {
    pub fn is_materialized(&self) -> bool {
        match self {
            PlanNodeOrGroup::PlanNode(_) => true,
            PlanNodeOrGroup::Group(_) => false,
        }
    }

    pub fn unwrap_plan_node(&self) -> ArcPlanNode<T> {
        match self {
            PlanNodeOrGroup::PlanNode(node) => node.clone(),
            PlanNodeOrGroup::Group(_) => panic!("Expected PlanNode, found Group"),
        }
    }

    pub fn unwrap_group(&self) -> GroupId {
        match self {
            PlanNodeOrGroup::PlanNode(_) => panic!("Expected Group, found PlanNode"),
            PlanNodeOrGroup::Group(group_id) => *group_id,
        }
    }
}

impl<T: NodeType> std::fmt::Display for PlanNodeOrGroup<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PlanNodeOrGroup::PlanNode(node) => write!(f, "{}", node),
            PlanNodeOrGroup::Group(group_id) => write!(f, "{}", group_id),
        }
    }
}

#[derive(Clone, Debug, Hash, PartialEq, Eq)]
pub struct PlanNode<T: NodeType> {
    /// A generic plan node type
    pub typ: T,
    /// Child plan nodes, which may be materialized or placeholder group IDs
    /// based on how this node was initialized
    pub children: Vec<PlanNodeOrGroup<T>>,
    /// Predicate nodes, which are always materialized
    pub predicates: Vec<ArcPredNode<T>>,
}

impl<T: NodeType> std::fmt::Display for PlanNode<T> {
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

impl<T: NodeType> PlanNode<T> {
    pub fn child(&self, idx: usize) -> PlanNodeOrGroup<T> {
        self.children[idx].clone()
    }

    pub fn child_rel(&self, idx: usize) -> ArcPlanNode<T> {
        self.child(idx).unwrap_plan_node()
    }

    pub fn predicate(&self, idx: usize) -> ArcPredNode<T> {
        self.predicates[idx].clone()
    }
}

impl<T: NodeType> From<PlanNode<T>> for PlanNodeOrGroup<T> {
    fn from(value: PlanNode<T>) -> Self {
        Self::PlanNode(value.into())
    }
}

impl<T: NodeType> From<ArcPlanNode<T>> for PlanNodeOrGroup<T> {
    fn from(value: ArcPlanNode<T>) -> Self {
        Self::PlanNode(value)
    }
}

impl<T: NodeType> From<GroupId> for PlanNodeOrGroup<T> {
    fn from(value: GroupId) -> Self {
        Self::Group(value)
    }
}

#[derive(Clone, Debug, Hash, PartialEq, Eq)]
pub struct PredNode<T: NodeType> {
    /// A generic predicate node type
    pub typ: T::PredType,
    /// Child predicate nodes, always materialized
    pub children: Vec<ArcPredNode<T>>,
    /// Data associated with the predicate, if any
    pub data: Option<Value>,
}

impl<T: NodeType> std::fmt::Display for PredNode<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "({}", self.typ)?;
        for child in &self.children {
            write!(f, " {}", child)?;
        }
        if let Some(data) = &self.data {
            write!(f, " {}", data)?;
        }
        write!(f, ")")
    }
}

impl<T: NodeType> PredNode<T> {
    pub fn child(&self, idx: usize) -> ArcPredNode<T> {
        self.children[idx].clone()
    }

    pub fn unwrap_data(&self) -> Value {
        self.data.clone().unwrap()
    }
}
