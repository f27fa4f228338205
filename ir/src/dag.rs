//! The function DAG: a frozen representation of the pipeline.
//!
//! Nodes are functions, stages are definitions, and edges are
//! producer-to-consumer-stage relationships. Everything the schedule search
//! asks repeatedly - symbolic bounds relationships, affine fast paths, load
//! jacobians, per-stage featurization, dependency bitvectors - is computed
//! once here, before the search starts, and never mutated afterwards.
//!
//! Nodes and edges are stored in reverse realization order: iterating
//! in order walks consumers before producers.

use std::collections::HashMap;
use std::rc::Rc;

use smallvec::SmallVec;

use crate::bounds::{BoundContents, Layout};
use crate::error::{
    CoordinateVarOutOfRangeSnafu, LoadArityMismatchSnafu, MissingEstimateSnafu, NoOutputsSnafu, NoPureDefinitionSnafu,
    PipelineCycleSnafu, Result,
};
use crate::expr::{Expr, Interval, VarId};
use crate::features::{OpClass, PipelineFeatures};
use crate::jacobian::LoadJacobian;
use crate::pipeline::{ComputedBounds, Func, FuncId, Pipeline, ScalarType, StageDef, Target, ValueExpr};
use crate::span::Span;
use crate::{EdgeId, NodeId, StageId};

/// The pair of symbolic variables denoting one dimension of a region.
#[derive(Debug, Clone, Copy)]
pub struct SymbolicInterval {
    pub min_var: VarId,
    pub max_var: VarId,
}

/// The region computed of one dimension, in terms of the region required.
///
/// For simple funcs this is identical to the region required, but computing
/// one output of a scan requires computing its whole row, and a boundary
/// condition is defined over a fixed footprint. The flags accelerate the
/// common cases.
#[derive(Debug, Clone)]
pub struct RegionComputedInfo {
    /// The min and max in their full symbolic glory, over the node's region
    /// variables. Used in the general case.
    pub interval: Interval,
    pub equals_required: bool,
    pub equals_union_of_required_with_constants: bool,
    pub c_min: i64,
    pub c_max: i64,
}

/// Metadata about one symbolic loop in a stage's default loop nest.
#[derive(Debug, Clone)]
pub struct Loop {
    pub var: String,
    pub pure: bool,
    pub rvar: bool,
    /// Bounds over the owning node's region variables.
    pub min: Expr,
    pub max: Expr,
    /// Which pure dimension this loop corresponds to. `None` for rvars.
    pub pure_dim: Option<usize>,
    /// The pipeline-local variable id this loop iterates.
    pub local_var: usize,

    /// The loop bounds are just the region computed in the given dimension.
    pub equals_region_computed: bool,
    pub region_computed_dim: usize,
    /// The loop bounds are constants.
    pub bounds_are_constant: bool,
    pub c_min: i64,
    pub c_max: i64,

    /// A persistent fragment of source for getting this var from its owner
    /// func, used when printing schedules.
    pub accessor: String,
}

/// One stage of a func.
#[derive(Debug)]
pub struct Stage {
    pub node: NodeId,
    /// Which stage of the func this is. 0 = pure.
    pub index: usize,
    /// The loop nest that computes this stage, innermost first.
    pub loops: SmallVec<[Loop; 4]>,
    pub loop_nest_all_common_cases: bool,
    /// Natural vectorization width for the narrowest type used.
    pub vector_size: usize,
    pub features: PipelineFeatures,
    /// The name for scheduling, e.g. `blur.update(0)`.
    pub name: String,
    pub sanitized_name: String,
    /// Dense id for perfect hashing on stages.
    pub id: StageId,
    pub max_id: usize,
    /// Jacobian of this stage's store coordinates.
    pub store_jacobian: Option<LoadJacobian>,
    pub incoming_edges: Vec<EdgeId>,
    /// `dependencies[n]` iff this stage is transitively downstream of node `n`.
    pub dependencies: Vec<bool>,
    /// Symbolic `(min, max)` variable pair for loop `j` lives at
    /// `loop_var_base + 2*j` / `+ 2*j + 1`.
    pub loop_var_base: VarId,
}

impl Stage {
    pub fn downstream_of(&self, node: NodeId) -> bool {
        self.dependencies[node]
    }

    pub fn loop_index_of_var(&self, var: &str) -> Option<usize> {
        self.loops.iter().position(|l| l.var == var)
    }

    pub fn loop_min_var(&self, j: usize) -> VarId {
        self.loop_var_base + 2 * j
    }

    pub fn loop_max_var(&self, j: usize) -> VarId {
        self.loop_var_base + 2 * j + 1
    }
}

/// A node represents a single func.
#[derive(Debug)]
pub struct Node {
    pub func: FuncId,
    pub name: String,
    pub bytes_per_point: usize,
    pub dimensions: usize,

    /// The symbolic variables denoting a region of this func. Bound to
    /// required spans by [`Node::required_to_computed`] and to computed spans
    /// by [`Node::loop_nest_for_region`].
    pub region_required: Vec<SymbolicInterval>,
    pub region_var_base: VarId,

    /// A concrete region from the user's bounds estimates. Only populated
    /// for outputs.
    pub estimated_region_required: Option<Vec<Span>>,

    pub region_computed: Vec<RegionComputedInfo>,
    pub region_computed_all_common_cases: bool,

    pub stages: Vec<Stage>,
    pub outgoing_edges: Vec<EdgeId>,

    /// Max vector size across the stages.
    pub vector_size: usize,

    pub id: NodeId,
    pub max_id: usize,

    /// A single pointwise call to another func.
    pub is_wrapper: bool,
    /// Input buffers are represented as nodes but never scheduled.
    pub is_input: bool,
    pub is_output: bool,
    /// Only uses pointwise calls.
    pub is_pointwise: bool,
    /// Only uses pointwise calls plus clamping on the indices.
    pub is_boundary_condition: bool,

    pub bounds_memory_layout: Rc<Layout>,
}

impl Node {
    pub fn make_bound(&self) -> BoundContents {
        self.bounds_memory_layout.make()
    }

    fn region_env<'a>(&self, spans: &'a [Span]) -> impl Fn(VarId) -> i64 + 'a {
        let base = self.region_var_base;
        let dims = self.dimensions;
        move |v: VarId| {
            assert!(v >= base && v < base + 2 * dims, "expression references a foreign variable");
            let j = (v - base) / 2;
            if (v - base) % 2 == 0 { spans[j].min() } else { spans[j].max() }
        }
    }

    /// Expand a region required into a region computed.
    pub fn required_to_computed(&self, required: &[Span], computed: &mut [Span]) {
        assert_eq!(required.len(), self.dimensions);
        assert_eq!(computed.len(), self.dimensions);
        for (d, info) in self.region_computed.iter().enumerate() {
            if info.equals_required {
                computed[d] = required[d];
            } else if info.equals_union_of_required_with_constants {
                computed[d] = Span::new(
                    required[d].min().min(info.c_min),
                    required[d].max().max(info.c_max),
                    required[d].constant_extent(),
                );
            } else {
                let env = self.region_env(required);
                let lo = info.interval.min.evaluate(&env);
                let hi = info.interval.max.evaluate(&env);
                let ce = info.interval.min.is_constant() && info.interval.max.is_constant();
                computed[d] = Span::new(lo, hi, ce);
            }
        }
    }

    /// Get the loop nest shape of a stage as a function of the region
    /// computed.
    pub fn loop_nest_for_region(&self, stage_idx: usize, computed: &[Span], loops: &mut [Span]) {
        let stage = &self.stages[stage_idx];
        assert_eq!(loops.len(), stage.loops.len());
        for (j, l) in stage.loops.iter().enumerate() {
            if l.equals_region_computed {
                loops[j] = computed[l.region_computed_dim];
            } else if l.bounds_are_constant {
                loops[j] = Span::new(l.c_min, l.c_max, true);
            } else {
                let env = self.region_env(computed);
                let lo = l.min.evaluate(&env);
                let hi = l.max.evaluate(&env);
                loops[j] = Span::new(lo, hi, l.min.is_constant() && l.max.is_constant());
            }
        }
    }
}

/// Identifies one stage of one node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StageRef {
    pub node: NodeId,
    pub stage_index: usize,
}

/// One bound expression of an edge, with the analysis used to evaluate it
/// quickly.
#[derive(Debug, Clone)]
pub struct BoundInfo {
    /// Over the consumer stage's loop variables.
    pub expr: Expr,
    pub coeff: i64,
    pub constant: i64,
    pub consumer_dim: usize,
    pub affine: bool,
    pub uses_max: bool,
}

impl BoundInfo {
    fn new(expr: Expr, consumer: &Stage) -> BoundInfo {
        let mut vars = Vec::with_capacity(2 * consumer.loops.len());
        for j in 0..consumer.loops.len() {
            vars.push(consumer.loop_min_var(j));
            vars.push(consumer.loop_max_var(j));
        }
        match expr.affine_decompose(&vars) {
            Some(a) => {
                let (consumer_dim, uses_max) = match a.var {
                    Some(idx) => (idx / 2, idx % 2 == 1),
                    None => (0, false),
                };
                BoundInfo { expr, coeff: a.coeff, constant: a.constant, consumer_dim, affine: true, uses_max }
            }
            None => BoundInfo { expr, coeff: 0, constant: 0, consumer_dim: 0, affine: false, uses_max: false },
        }
    }
}

/// A producer-consumer relationship.
#[derive(Debug)]
pub struct Edge {
    pub producer: NodeId,
    pub consumer: StageRef,

    /// Memory footprint on the producer required by the consumer, one
    /// `(min, max)` pair per producer dimension.
    pub bounds: Vec<(BoundInfo, BoundInfo)>,

    /// Producer accesses per point in the consumer's loop nest.
    pub calls: i64,

    pub all_bounds_affine: bool,

    pub load_jacobians: Vec<LoadJacobian>,

    /// Copied from the consumer stage so footprints can be expanded without
    /// chasing the stage.
    loop_var_base: VarId,
    loop_count: usize,
}

impl Edge {
    pub fn all_load_jacobian_coeffs_exist(&self) -> bool {
        self.load_jacobians.iter().all(|j| j.all_coeffs_exist())
    }

    fn add_load_jacobian(&mut self, j: LoadJacobian) {
        for existing in &mut self.load_jacobians {
            if existing.merge(&j) {
                return;
            }
        }
        self.load_jacobians.push(j);
    }

    fn loop_env<'a>(&self, consumer_loop: &'a [Span]) -> impl Fn(VarId) -> i64 + 'a {
        let base = self.loop_var_base;
        let count = self.loop_count;
        move |v: VarId| {
            assert!(v >= base && v < base + 2 * count, "bound expression references a foreign variable");
            let j = (v - base) / 2;
            if (v - base) % 2 == 0 { consumer_loop[j].min() } else { consumer_loop[j].max() }
        }
    }

    /// Given the consumer stage's loop nest, expand a region required of the
    /// producer to include every point this edge touches. Widening the
    /// consumer loop can only widen the result.
    pub fn expand_footprint(&self, consumer_loop: &[Span], producer_required: &mut [Span]) {
        assert_eq!(consumer_loop.len(), self.loop_count, "consumer loop span count mismatch");
        for (d, (lo, hi)) in self.bounds.iter().enumerate() {
            let span = if lo.affine && hi.affine {
                let pick = |b: &BoundInfo| {
                    if b.coeff == 0 {
                        b.constant
                    } else {
                        let s = &consumer_loop[b.consumer_dim];
                        b.coeff * (if b.uses_max { s.max() } else { s.min() }) + b.constant
                    }
                };
                let ce = lo.coeff == hi.coeff
                    && lo.consumer_dim == hi.consumer_dim
                    && (lo.coeff == 0 || consumer_loop[lo.consumer_dim].constant_extent());
                Span::new(pick(lo), pick(hi), ce)
            } else {
                let env = self.loop_env(consumer_loop);
                Span::new(
                    lo.expr.evaluate(&env),
                    hi.expr.evaluate(&env),
                    lo.expr.is_constant() && hi.expr.is_constant(),
                )
            };
            producer_required[d].union_with(&span);
        }
    }
}

/// The function DAG. Frozen after construction.
#[derive(Debug)]
pub struct FunctionDAG {
    pub nodes: Vec<Node>,
    pub edges: Vec<Edge>,
    pub num_non_input_nodes: usize,
    stage_id_to_ref: Vec<StageRef>,
}

impl FunctionDAG {
    /// Analyze the pipeline and build the DAG. This is done once up front,
    /// before the tree search.
    pub fn new(pipeline: &Pipeline, outputs: &[FuncId], target: &Target) -> Result<FunctionDAG> {
        if outputs.is_empty() {
            return NoOutputsSnafu.fail();
        }
        let order = realization_order(pipeline, outputs)?;

        let mut next_var: VarId = 0;
        let mut next_stage_id: StageId = 0;
        let mut stage_id_to_ref = Vec::new();
        let mut nodes = Vec::with_capacity(order.len());

        // Reverse realization order: consumers first.
        let mut node_of_func: HashMap<FuncId, NodeId> = HashMap::new();
        for (id, &func_id) in order.iter().rev().enumerate() {
            node_of_func.insert(func_id, id);
        }

        for (id, &func_id) in order.iter().rev().enumerate() {
            let func = pipeline.func_def(func_id);
            let is_output = outputs.contains(&func_id);

            let region_var_base = next_var;
            next_var += 2 * func.dimensions;
            let region_required: Vec<SymbolicInterval> = (0..func.dimensions)
                .map(|d| SymbolicInterval { min_var: region_var_base + 2 * d, max_var: region_var_base + 2 * d + 1 })
                .collect();

            let estimated_region_required = if is_output {
                let mut spans = Vec::with_capacity(func.dimensions);
                for est in &func.estimates {
                    let (min, extent) =
                        est.ok_or_else(|| MissingEstimateSnafu { func: func.name.clone() }.build())?;
                    spans.push(Span::new(min, min + extent - 1, true));
                }
                Some(spans)
            } else {
                None
            };

            let (region_computed, region_computed_all_common_cases) =
                analyze_region_computed(func, &region_required);

            let mut stages = Vec::with_capacity(func.stages.len());
            for (index, stage_def) in func.stages.iter().enumerate() {
                let loops = build_loops(func, stage_def, &region_required);
                let loop_nest_all_common_cases =
                    loops.iter().all(|l| l.equals_region_computed || l.bounds_are_constant);
                let loop_var_base = next_var;
                next_var += 2 * loops.len();

                let name = if index == 0 {
                    func.name.clone()
                } else {
                    format!("{}.update({})", func.name, index - 1)
                };

                stages.push(Stage {
                    node: id,
                    index,
                    loop_nest_all_common_cases,
                    vector_size: stage_vector_size(pipeline, func, stage_def, target),
                    features: featurize_stage(pipeline, func, stage_def, &loops),
                    sanitized_name: sanitize_names(&name),
                    name,
                    id: next_stage_id,
                    max_id: 0, // patched once all stages are counted
                    store_jacobian: Some(store_jacobian(func, &loops)),
                    incoming_edges: Vec::new(),
                    dependencies: Vec::new(),
                    loop_var_base,
                    loops,
                });
                stage_id_to_ref.push(StageRef { node: id, stage_index: index });
                next_stage_id += 1;
            }

            let flags = analyze_call_flags(func);
            let layout = Layout::for_node(func.dimensions, &stages.iter().map(|s| s.loops.len()).collect::<Vec<_>>());

            nodes.push(Node {
                func: func_id,
                name: func.name.clone(),
                bytes_per_point: func.scalar_type.bytes(),
                dimensions: func.dimensions,
                region_required,
                region_var_base,
                estimated_region_required,
                region_computed,
                region_computed_all_common_cases,
                vector_size: stages.iter().map(|s| s.vector_size).max().unwrap_or(1),
                stages,
                outgoing_edges: Vec::new(),
                id,
                max_id: order.len(),
                is_wrapper: flags.wrapper,
                is_input: func.is_input,
                is_output,
                is_pointwise: flags.pointwise,
                is_boundary_condition: flags.boundary_condition,
                bounds_memory_layout: layout,
            });
        }

        let num_stages = stage_id_to_ref.len();
        for node in &mut nodes {
            for stage in &mut node.stages {
                stage.max_id = num_stages;
            }
        }

        let mut dag = FunctionDAG {
            nodes,
            edges: Vec::new(),
            num_non_input_nodes: 0,
            stage_id_to_ref,
        };
        dag.num_non_input_nodes = dag.nodes.iter().filter(|n| !n.is_input).count();
        dag.build_edges(pipeline, &node_of_func);
        dag.compute_dependencies();
        Ok(dag)
    }

    fn build_edges(&mut self, pipeline: &Pipeline, node_of_func: &HashMap<FuncId, NodeId>) {
        for node_id in 0..self.nodes.len() {
            let func_id = self.nodes[node_id].func;
            let func = pipeline.func_def(func_id);
            for stage_index in 0..self.nodes[node_id].stages.len() {
                let stage_def = &func.stages[stage_index];

                // Group call sites by producer, first occurrence first.
                let mut sites: Vec<(FuncId, Vec<Vec<Expr>>)> = Vec::new();
                stage_def.body.for_each_load(&mut |producer, coords| {
                    // A stage reading its own func is the reduction itself,
                    // not a producer-consumer edge.
                    if producer == func_id {
                        return;
                    }
                    match sites.iter_mut().find(|(p, _)| *p == producer) {
                        Some((_, list)) => list.push(coords.to_vec()),
                        None => sites.push((producer, vec![coords.to_vec()])),
                    }
                });

                for (producer_func, calls) in sites {
                    let producer_id = node_of_func[&producer_func];
                    let edge = self.build_edge(node_id, stage_index, producer_id, &calls);
                    let edge_id = self.edges.len();
                    self.edges.push(edge);
                    self.nodes[node_id].stages[stage_index].incoming_edges.push(edge_id);
                    self.nodes[producer_id].outgoing_edges.push(edge_id);
                }
            }
        }
    }

    fn build_edge(
        &self,
        consumer_node: NodeId,
        stage_index: usize,
        producer_id: NodeId,
        calls: &[Vec<Expr>],
    ) -> Edge {
        let stage = &self.nodes[consumer_node].stages[stage_index];
        let producer_dims = self.nodes[producer_id].dimensions;

        // Map a pipeline-local variable to its loop's symbolic bound vars.
        let local_to_loop: HashMap<usize, usize> =
            stage.loops.iter().enumerate().map(|(j, l)| (l.local_var, j)).collect();
        let lo = |v: VarId| Expr::var(stage.loop_min_var(local_to_loop[&v]));
        let hi = |v: VarId| Expr::var(stage.loop_max_var(local_to_loop[&v]));

        let mut bounds = Vec::with_capacity(producer_dims);
        for d in 0..producer_dims {
            let mut min_expr: Option<Expr> = None;
            let mut max_expr: Option<Expr> = None;
            for coords in calls {
                let (e_lo, e_hi) = coords[d].bounds_exprs(&lo, &hi);
                min_expr = Some(match min_expr {
                    Some(m) => Expr::min(&m, &e_lo),
                    None => e_lo,
                });
                max_expr = Some(match max_expr {
                    Some(m) => Expr::max(&m, &e_hi),
                    None => e_hi,
                });
            }
            let min_expr = min_expr.unwrap_or_else(|| Expr::constant(0));
            let max_expr = max_expr.unwrap_or_else(|| Expr::constant(0));
            bounds.push((BoundInfo::new(min_expr, stage), BoundInfo::new(max_expr, stage)));
        }
        let all_bounds_affine = bounds.iter().all(|(a, b)| a.affine && b.affine);

        let mut edge = Edge {
            producer: producer_id,
            consumer: StageRef { node: consumer_node, stage_index },
            bounds,
            calls: calls.len() as i64,
            all_bounds_affine,
            load_jacobians: Vec::new(),
            loop_var_base: stage.loop_var_base,
            loop_count: stage.loops.len(),
        };
        for coords in calls {
            let mut j = LoadJacobian::new(producer_dims, stage.loops.len(), 1);
            for (i, coord) in coords.iter().enumerate() {
                for (col, l) in stage.loops.iter().enumerate() {
                    j.set(i, col, coord.stride(l.local_var));
                }
            }
            edge.add_load_jacobian(j);
        }
        edge
    }

    /// One pass suffices because producers have higher ids than all their
    /// consumers.
    fn compute_dependencies(&mut self) {
        let n = self.nodes.len();
        for id in (0..n).rev() {
            for stage_index in 0..self.nodes[id].stages.len() {
                let mut deps = vec![false; n];
                // An update is downstream of whatever the earlier stages of
                // its func are downstream of.
                if stage_index > 0 {
                    deps.clone_from(&self.nodes[id].stages[stage_index - 1].dependencies);
                }
                for &e in &self.nodes[id].stages[stage_index].incoming_edges {
                    let producer = self.edges[e].producer;
                    deps[producer] = true;
                    for pstage in &self.nodes[producer].stages {
                        for (i, &d) in pstage.dependencies.iter().enumerate() {
                            deps[i] = deps[i] || d;
                        }
                    }
                }
                self.nodes[id].stages[stage_index].dependencies = deps;
            }
        }
    }

    pub fn stage(&self, r: StageRef) -> &Stage {
        &self.nodes[r.node].stages[r.stage_index]
    }

    /// Total number of stages across all nodes.
    pub fn num_stages(&self) -> usize {
        self.stage_id_to_ref.len()
    }

    pub fn stage_by_id(&self, id: StageId) -> &Stage {
        self.stage(self.stage_id_to_ref[id])
    }

    pub fn stage_id_to_node(&self, id: StageId) -> &Node {
        &self.nodes[self.stage_id_to_ref[id].node]
    }

    /// Write the whole analysis through the structured log, for debugging.
    pub fn dump(&self) {
        for node in &self.nodes {
            tracing::debug!(
                node = %node.name,
                id = node.id,
                dims = node.dimensions,
                input = node.is_input,
                output = node.is_output,
                pointwise = node.is_pointwise,
                boundary = node.is_boundary_condition,
                wrapper = node.is_wrapper,
                "dag node"
            );
            for stage in &node.stages {
                tracing::debug!(
                    stage = %stage.name,
                    id = stage.id,
                    loops = stage.loops.len(),
                    vector_size = stage.vector_size,
                    common_cases = stage.loop_nest_all_common_cases,
                    "dag stage"
                );
            }
        }
        for (i, e) in self.edges.iter().enumerate() {
            tracing::debug!(
                edge = i,
                producer = %self.nodes[e.producer].name,
                consumer = %self.stage(e.consumer).name,
                calls = e.calls,
                affine = e.all_bounds_affine,
                jacobians = e.load_jacobians.len(),
                "dag edge"
            );
        }
    }
}

/// DFS postorder from the outputs: producers before consumers. Also runs the
/// per-call validation.
fn realization_order(pipeline: &Pipeline, outputs: &[FuncId]) -> Result<Vec<FuncId>> {
    #[derive(Clone, Copy, PartialEq)]
    enum Mark {
        White,
        Grey,
        Black,
    }

    fn visit(pipeline: &Pipeline, f: FuncId, marks: &mut Vec<Mark>, order: &mut Vec<FuncId>) -> Result<()> {
        let func = pipeline.func_def(f);
        match marks[f] {
            Mark::Black => return Ok(()),
            Mark::Grey => return PipelineCycleSnafu { func: func.name.clone() }.fail(),
            Mark::White => {}
        }
        if !func.is_input && func.stages.is_empty() {
            return NoPureDefinitionSnafu { func: func.name.clone() }.fail();
        }
        marks[f] = Mark::Grey;

        let mut callees: Vec<FuncId> = Vec::new();
        let mut load_error = None;
        for stage in &func.stages {
            let num_vars = func.dimensions + stage.rvars.len();
            stage.body.for_each_load(&mut |callee, coords| {
                let producer = pipeline.func_def(callee);
                if coords.len() != producer.dimensions && load_error.is_none() {
                    load_error = Some(
                        LoadArityMismatchSnafu {
                            producer: producer.name.clone(),
                            expected: producer.dimensions,
                            got: coords.len(),
                        }
                        .build(),
                    );
                }
                for coord in coords {
                    coord.for_each_var(&mut |v| {
                        if v >= num_vars && load_error.is_none() {
                            load_error = Some(
                                CoordinateVarOutOfRangeSnafu { func: func.name.clone(), var: v, limit: num_vars }
                                    .build(),
                            );
                        }
                    });
                }
                if callee != f && !callees.contains(&callee) {
                    callees.push(callee);
                }
            });
        }
        if let Some(e) = load_error {
            return Err(e);
        }
        for callee in callees {
            visit(pipeline, callee, marks, order)?;
        }
        marks[f] = Mark::Black;
        order.push(f);
        Ok(())
    }

    let mut marks = vec![Mark::White; pipeline.funcs().len()];
    let mut order = Vec::new();
    for &out in outputs {
        visit(pipeline, out, &mut marks, &mut order)?;
    }
    Ok(order)
}

fn analyze_region_computed(
    func: &Func,
    region_required: &[SymbolicInterval],
) -> (Vec<RegionComputedInfo>, bool) {
    let mut infos = Vec::with_capacity(func.dimensions);
    for d in 0..func.dimensions {
        let rv = region_required[d];
        let min_var = Expr::var(rv.min_var);
        let max_var = Expr::var(rv.max_var);
        let (min, max) = match func.computed[d] {
            ComputedBounds::SameAsRequired => (min_var.clone(), max_var.clone()),
            ComputedBounds::UnionWith { c_min, c_max } => (
                Expr::min(&min_var, &Expr::constant(c_min)),
                Expr::max(&max_var, &Expr::constant(c_max)),
            ),
            ComputedBounds::PaddedBy { before, after } => (
                Expr::sub(&min_var, &Expr::constant(before)),
                Expr::add(&max_var, &Expr::constant(after)),
            ),
        };

        // Detect the fast paths from the expressions themselves; zero
        // padding folds back to the required variables.
        let equals_required = min.as_var() == Some(rv.min_var) && max.as_var() == Some(rv.max_var);
        let mut union_consts = None;
        if !equals_required
            && let Some((a, b)) = min.as_min()
            && let Some((c, d2)) = max.as_max()
        {
            let lo = match (a.as_var(), b.as_const(), b.as_var(), a.as_const()) {
                (Some(v), Some(c0), _, _) if v == rv.min_var => Some(c0),
                (_, _, Some(v), Some(c0)) if v == rv.min_var => Some(c0),
                _ => None,
            };
            let hi = match (c.as_var(), d2.as_const(), d2.as_var(), c.as_const()) {
                (Some(v), Some(c1), _, _) if v == rv.max_var => Some(c1),
                (_, _, Some(v), Some(c1)) if v == rv.max_var => Some(c1),
                _ => None,
            };
            if let (Some(lo), Some(hi)) = (lo, hi) {
                union_consts = Some((lo, hi));
            }
        }

        infos.push(RegionComputedInfo {
            interval: Interval { min, max },
            equals_required,
            equals_union_of_required_with_constants: union_consts.is_some(),
            c_min: union_consts.map(|(lo, _)| lo).unwrap_or(0),
            c_max: union_consts.map(|(_, hi)| hi).unwrap_or(0),
        });
    }
    let all = infos.iter().all(|i| i.equals_required || i.equals_union_of_required_with_constants);
    (infos, all)
}

fn build_loops(func: &Func, stage_def: &StageDef, region_required: &[SymbolicInterval]) -> SmallVec<[Loop; 4]> {
    let mut loops = SmallVec::new();
    // Reduction variables are innermost.
    for (k, &(min, max)) in stage_def.rvars.iter().enumerate() {
        loops.push(Loop {
            var: format!("r{k}"),
            pure: false,
            rvar: true,
            min: Expr::constant(min),
            max: Expr::constant(max),
            pure_dim: None,
            local_var: func.dimensions + k,
            equals_region_computed: false,
            region_computed_dim: 0,
            bounds_are_constant: true,
            c_min: min,
            c_max: max,
            accessor: format!("{}.rvar({k})", func.name),
        });
    }
    for d in 0..func.dimensions {
        let min = Expr::var(region_required[d].min_var);
        let max = Expr::var(region_required[d].max_var);
        let equals_region_computed =
            min.as_var() == Some(region_required[d].min_var) && max.as_var() == Some(region_required[d].max_var);
        loops.push(Loop {
            var: format!("v{d}"),
            pure: true,
            rvar: false,
            min,
            max,
            pure_dim: Some(d),
            local_var: d,
            equals_region_computed,
            region_computed_dim: d,
            bounds_are_constant: false,
            c_min: 0,
            c_max: 0,
            accessor: format!("{}.dim({d})", func.name),
        });
    }
    loops
}

fn store_jacobian(func: &Func, loops: &[Loop]) -> LoadJacobian {
    let mut j = LoadJacobian::new(func.dimensions, loops.len(), 1);
    for (col, l) in loops.iter().enumerate() {
        for row in 0..func.dimensions {
            let stride = if l.pure_dim == Some(row) {
                crate::rational::OptionalRational::new(1, 1)
            } else {
                crate::rational::OptionalRational::zero()
            };
            j.set(row, col, stride);
        }
    }
    j
}

struct CallFlags {
    wrapper: bool,
    pointwise: bool,
    boundary_condition: bool,
}

/// Strip clamp layers (min/max against loop-invariant bounds) off a
/// coordinate expression, reporting whether any were present.
fn strip_clamps(e: &Expr) -> (&Expr, bool) {
    let mut cur = e;
    let mut clamped = false;
    loop {
        let inner = match (cur.as_min(), cur.as_max()) {
            (Some((a, b)), _) | (_, Some((a, b))) => {
                if b.is_constant() {
                    Some(a)
                } else if a.is_constant() {
                    Some(b)
                } else {
                    None
                }
            }
            _ => None,
        };
        match inner {
            Some(i) => {
                clamped = true;
                cur = i;
            }
            None => return (cur, clamped),
        }
    }
}

fn analyze_call_flags(func: &Func) -> CallFlags {
    if func.is_input {
        return CallFlags { wrapper: false, pointwise: false, boundary_condition: false };
    }

    let mut any_load = false;
    let mut all_identity = true;
    let mut all_identity_modulo_clamps = true;
    let mut any_clamp = false;
    for stage in &func.stages {
        stage.body.for_each_load(&mut |_, coords| {
            any_load = true;
            for (d, coord) in coords.iter().enumerate() {
                let identity = coord.as_var() == Some(d);
                let (stripped, clamped) = strip_clamps(coord);
                let stripped_identity = stripped.as_var() == Some(d);
                any_clamp = any_clamp || clamped;
                all_identity = all_identity && identity;
                all_identity_modulo_clamps = all_identity_modulo_clamps && stripped_identity;
            }
        });
    }

    // A func with no loads at all is vacuously pointwise; it can be inlined
    // anywhere.
    let pointwise = all_identity;
    let boundary_condition = any_load && all_identity_modulo_clamps && any_clamp;
    let wrapper = func.stages.len() == 1
        && pointwise
        && any_load
        && matches!(&func.stages[0].body, ValueExpr::Load { .. });
    CallFlags { wrapper, pointwise, boundary_condition }
}

fn narrowest_type_bytes(pipeline: &Pipeline, func: &Func, e: &ValueExpr) -> usize {
    match e {
        ValueExpr::Const(_) | ValueExpr::Param(_) | ValueExpr::Coord(_) => func.scalar_type.bytes(),
        ValueExpr::Cast(ty, a) => ty.bytes().min(narrowest_type_bytes(pipeline, func, a)),
        ValueExpr::Sqrt(a) | ValueExpr::Exp(a) => narrowest_type_bytes(pipeline, func, a),
        ValueExpr::Add(a, b)
        | ValueExpr::Sub(a, b)
        | ValueExpr::Mul(a, b)
        | ValueExpr::Div(a, b)
        | ValueExpr::Min(a, b)
        | ValueExpr::Max(a, b) => {
            narrowest_type_bytes(pipeline, func, a).min(narrowest_type_bytes(pipeline, func, b))
        }
        ValueExpr::Select(c, t, f) => narrowest_type_bytes(pipeline, func, c)
            .min(narrowest_type_bytes(pipeline, func, t))
            .min(narrowest_type_bytes(pipeline, func, f)),
        ValueExpr::Load { func: p, .. } => pipeline.func_def(*p).scalar_type.bytes(),
    }
}

fn stage_vector_size(pipeline: &Pipeline, func: &Func, stage_def: &StageDef, target: &Target) -> usize {
    let narrowest = narrowest_type_bytes(pipeline, func, &stage_def.body).min(func.scalar_type.bytes());
    (target.vector_bits / (8 * narrowest)).max(1)
}

fn featurize_stage(pipeline: &Pipeline, func: &Func, stage_def: &StageDef, loops: &[Loop]) -> PipelineFeatures {
    let mut features = PipelineFeatures::default();
    walk_value(pipeline, &stage_def.body, func.scalar_type, loops, &mut features);
    // The stage stores one value per loop point.
    features.bump_op(OpClass::Store, func.scalar_type.class_index());
    features.store_pointwise[func.scalar_type.class_index()] += 1;
    features
}

fn walk_value(
    pipeline: &Pipeline,
    e: &ValueExpr,
    ty: ScalarType,
    loops: &[Loop],
    out: &mut PipelineFeatures,
) {
    let class = ty.class_index();
    match e {
        ValueExpr::Const(_) => out.bump_op(OpClass::Const, class),
        ValueExpr::Param(_) => out.bump_op(OpClass::Param, class),
        ValueExpr::Coord(_) => {}
        ValueExpr::Cast(t, a) => {
            out.bump_op(OpClass::Cast, t.class_index());
            walk_value(pipeline, a, *t, loops, out);
        }
        ValueExpr::Add(a, b) => {
            out.bump_op(OpClass::Add, class);
            walk_value(pipeline, a, ty, loops, out);
            walk_value(pipeline, b, ty, loops, out);
        }
        ValueExpr::Sub(a, b) => {
            out.bump_op(OpClass::Sub, class);
            walk_value(pipeline, a, ty, loops, out);
            walk_value(pipeline, b, ty, loops, out);
        }
        ValueExpr::Mul(a, b) => {
            out.bump_op(OpClass::Mul, class);
            walk_value(pipeline, a, ty, loops, out);
            walk_value(pipeline, b, ty, loops, out);
        }
        ValueExpr::Div(a, b) => {
            out.bump_op(OpClass::Div, class);
            walk_value(pipeline, a, ty, loops, out);
            walk_value(pipeline, b, ty, loops, out);
        }
        ValueExpr::Min(a, b) => {
            out.bump_op(OpClass::Min, class);
            walk_value(pipeline, a, ty, loops, out);
            walk_value(pipeline, b, ty, loops, out);
        }
        ValueExpr::Max(a, b) => {
            out.bump_op(OpClass::Max, class);
            walk_value(pipeline, a, ty, loops, out);
            walk_value(pipeline, b, ty, loops, out);
        }
        ValueExpr::Select(c, t, f) => {
            out.bump_op(OpClass::Select, class);
            walk_value(pipeline, c, ty, loops, out);
            walk_value(pipeline, t, ty, loops, out);
            walk_value(pipeline, f, ty, loops, out);
        }
        ValueExpr::Sqrt(a) => {
            out.bump_op(OpClass::Sqrt, class);
            walk_value(pipeline, a, ty, loops, out);
        }
        ValueExpr::Exp(a) => {
            out.bump_op(OpClass::Exp, class);
            walk_value(pipeline, a, ty, loops, out);
        }
        ValueExpr::Load { func: p, coords } => {
            let producer_class = pipeline.func_def(*p).scalar_type.class_index();
            out.bump_op(OpClass::Load, producer_class);
            match classify_access(coords, loops) {
                Access::Pointwise => out.load_pointwise[producer_class] += 1,
                Access::Strided => out.load_strided[producer_class] += 1,
                Access::Gather => out.load_gather[producer_class] += 1,
            }
        }
    }
}

enum Access {
    Pointwise,
    Strided,
    Gather,
}

fn classify_access(coords: &[Expr], loops: &[Loop]) -> Access {
    let vars: Vec<VarId> = loops.iter().map(|l| l.local_var).collect();
    let mut pointwise = true;
    for (d, coord) in coords.iter().enumerate() {
        match coord.affine_decompose(&vars) {
            Some(a) => {
                let identity = a.coeff == 1
                    && a.constant == 0
                    && a.var.map(|idx| vars[idx] == d).unwrap_or(false);
                pointwise = pointwise && identity;
            }
            None => return Access::Gather,
        }
    }
    if pointwise { Access::Pointwise } else { Access::Strided }
}

/// Replace everything that isn't a letter, digit or underscore.
pub fn sanitize_names(name: &str) -> String {
    name.chars().map(|c| if c.is_ascii_alphanumeric() || c == '_' { c } else { '_' }).collect()
}
