//! Pipeline analysis for the tessera autoscheduler.
//!
//! This crate builds the [`FunctionDAG`]: a frozen representation of an
//! image-processing pipeline with everything the schedule search needs
//! precomputed up front. That includes:
//!
//! - [`expr`] - a minimal symbolic affine-interval algebra for bounds
//! - [`span`] / [`bounds`] - concrete bounds and their pooled storage
//! - [`rational`] / [`jacobian`] - the memory-dependence analysis
//! - [`pipeline`] - the front-end description the DAG is built from
//! - [`features`] - the per-stage featurization handed to cost models
//! - [`dag`] - the DAG itself: nodes, stages, edges, and bounds queries
//!
//! The DAG is constructed once and never mutated afterwards. Everything in
//! here is single-threaded by design; bounds objects use `Rc` and a
//! non-thread-safe memory pool.

pub mod bounds;
pub mod dag;
pub mod error;
pub mod expr;
pub mod features;
pub mod jacobian;
pub mod pipeline;
pub mod rational;
pub mod span;

#[cfg(test)]
pub mod test;

pub use bounds::{Bound, BoundContents, Layout};
pub use dag::{BoundInfo, Edge, FunctionDAG, Loop, Node, RegionComputedInfo, Stage, StageRef, SymbolicInterval};
pub use error::{Error, Result};
pub use expr::{Expr, Interval, VarId};
pub use features::{HEAD1_H, HEAD1_W, OpClass, PipelineFeatures};
pub use jacobian::LoadJacobian;
pub use pipeline::{ComputedBounds, Func, FuncId, Pipeline, ScalarType, StageDef, Target, ValueExpr};
pub use rational::OptionalRational;
pub use span::Span;

/// Dense node index within one [`FunctionDAG`].
pub type NodeId = usize;

/// Dense stage index across all stages of one [`FunctionDAG`].
pub type StageId = usize;

/// Dense edge index within one [`FunctionDAG`].
pub type EdgeId = usize;
