//! Search states.
//!
//! A [`State`] is an immutable handle on a partially-built schedule: a root
//! [`LoopNest`], a link to the parent state, the accumulated cost, and a
//! decisions counter. Two decisions are made per node - where to compute it,
//! then how to tile it - so a state is terminal once
//! `num_decisions_made == 2 * nodes`.
//!
//! Costs live behind `Cell`/`RefCell` because the cost model fills them in
//! batches after states are created, and penalization scales them lazily.
//! The search is single-threaded; nothing here is `Sync`.

use std::cell::{Cell, Ref, RefCell};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::hash::Hasher;
use std::rc::Rc;
use std::time::Instant;

use smallvec::SmallVec;
use tessera_ir::{FunctionDAG, LoadJacobian, Node, NodeId, Span};

use crate::config::SearchParams;
use crate::cost::{CostModel, ScheduleFeatures};
use crate::loop_nest::{LoopNest, TILING_FACTORS, compute_dag_bounds};
use crate::stats::Statistics;

/// Hash depth that captures the full tree, used for featurization
/// memoization.
const FULL_HASH_DEPTH: i32 = 16;

/// Nodes whose roles were frozen by the pre-pass: either forced inline or
/// pinned to stored compute-root loop nests.
#[derive(Debug, Clone, Default)]
pub struct FreezeMaps {
    pub inlined_nodes: HashSet<NodeId>,
    pub compute_root_nodes: HashMap<NodeId, Vec<Rc<LoopNest>>>,
}

impl FreezeMaps {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.inlined_nodes.is_empty() && self.compute_root_nodes.is_empty()
    }

    pub fn num_frozen(&self) -> usize {
        self.inlined_nodes.len() + self.compute_root_nodes.len()
    }
}

/// One state in the beam search.
#[derive(Debug)]
pub struct State {
    pub root: Rc<LoopNest>,
    pub parent: Option<Rc<State>>,
    cost: Cell<f64>,
    cost_per_stage: RefCell<Vec<f64>>,
    pub num_decisions_made: usize,
    penalized: Cell<bool>,
}

impl State {
    /// The initial state: empty root loop nest, no decisions made.
    pub fn new_root() -> Rc<State> {
        Rc::new(State {
            root: LoopNest::new_root(),
            parent: None,
            cost: Cell::new(0.0),
            cost_per_stage: RefCell::new(Vec::new()),
            num_decisions_made: 0,
            penalized: Cell::new(false),
        })
    }

    pub fn cost(&self) -> f64 {
        self.cost.get()
    }

    pub fn set_cost(&self, cost: f64) {
        self.cost.set(cost);
    }

    pub fn cost_per_stage(&self) -> Ref<'_, Vec<f64>> {
        self.cost_per_stage.borrow()
    }

    pub fn set_cost_per_stage(&self, costs: Vec<f64>) {
        *self.cost_per_stage.borrow_mut() = costs;
    }

    pub fn penalized(&self) -> bool {
        self.penalized.get()
    }

    pub fn set_penalized(&self, p: bool) {
        self.penalized.set(p);
    }

    /// Multiply the total cost and every per-stage cost.
    pub fn apply_penalty(&self, factor: f64) {
        self.cost.set(self.cost.get() * factor);
        for c in self.cost_per_stage.borrow_mut().iter_mut() {
            *c *= factor;
        }
    }

    pub fn is_terminal(&self, dag: &FunctionDAG) -> bool {
        self.num_decisions_made == 2 * dag.nodes.len()
    }

    /// Hash of the tree shape at the given granularity.
    pub fn structural_hash(&self, depth: i32) -> u64 {
        let mut h = std::hash::DefaultHasher::new();
        self.root.structural_hash(depth, &mut h);
        h.finish()
    }

    fn child(self: &Rc<Self>, root: Rc<LoopNest>, dag: &FunctionDAG) -> Rc<State> {
        Rc::new(State {
            root,
            parent: Some(Rc::clone(self)),
            cost: Cell::new(0.0),
            cost_per_stage: RefCell::new(vec![0.0; dag.num_stages()]),
            num_decisions_made: self.num_decisions_made + 1,
            penalized: Cell::new(false),
        })
    }

    fn passthrough_child(self: &Rc<Self>, dag: &FunctionDAG) -> Rc<State> {
        self.child(Rc::clone(&self.root), dag)
    }

    fn with_new_root_child(self: &Rc<Self>, nest: Rc<LoopNest>, dag: &FunctionDAG) -> Rc<State> {
        let mut children = self.root.children.clone();
        children.push(nest);
        self.child(
            Rc::new(LoopNest {
                node: None,
                size: SmallVec::new(),
                children,
                inlined: self.root.inlined.clone(),
                innermost: false,
            }),
            dag,
        )
    }

    fn inline_child(self: &Rc<Self>, dag: &FunctionDAG, node: &Node) -> Rc<State> {
        let calls: i64 = node.outgoing_edges.iter().map(|&e| dag.edges[e].calls).sum();
        let mut inlined = self.root.inlined.clone();
        inlined.insert(node.id, calls);
        self.child(
            Rc::new(LoopNest {
                node: None,
                size: SmallVec::new(),
                children: self.root.children.clone(),
                inlined,
                innermost: false,
            }),
            dag,
        )
    }

    fn retile_child(self: &Rc<Self>, node: NodeId, replacement: LoopNest, dag: &FunctionDAG) -> Rc<State> {
        let children = self
            .root
            .children
            .iter()
            .map(|c| if c.node == Some(node) { Rc::new(replacement.clone()) } else { Rc::clone(c) })
            .collect();
        self.child(
            Rc::new(LoopNest {
                node: None,
                size: SmallVec::new(),
                children,
                inlined: self.root.inlined.clone(),
                innermost: false,
            }),
            dag,
        )
    }

    /// Generate the successor states of this state and hand each one to
    /// `enqueue` after featurizing it into the cost model.
    #[allow(clippy::too_many_arguments)]
    pub fn generate_children(
        self: &Rc<Self>,
        dag: &FunctionDAG,
        params: &SearchParams,
        cost_model: &mut dyn CostModel,
        freeze: &FreezeMaps,
        memo: &mut FeaturizationMemo,
        stats: &mut Statistics,
        enqueue: &mut dyn FnMut(Rc<State>),
    ) {
        let node_idx = self.num_decisions_made / 2;
        assert!(node_idx < dag.nodes.len(), "generate_children called on a terminal state");
        let node = &dag.nodes[node_idx];
        let deciding_tiling = self.num_decisions_made % 2 == 1;

        let mut children: Vec<Rc<State>> = Vec::new();
        if node.is_input {
            // Inputs are represented but never scheduled; burn the decision.
            children.push(self.passthrough_child(dag));
        } else if !deciding_tiling {
            // Decision one: where to compute the node.
            if let Some(frozen) = freeze.compute_root_nodes.get(&node.id) {
                for nest in frozen {
                    children.push(self.with_new_root_child(Rc::clone(nest), dag));
                }
            } else if freeze.inlined_nodes.contains(&node.id) {
                children.push(self.inline_child(dag, node));
            } else {
                if can_inline(node) {
                    children.push(self.inline_child(dag, node));
                }
                let bounds = compute_dag_bounds(dag);
                children.push(self.with_new_root_child(Rc::new(LoopNest::compute_root(dag, node.id, &bounds)), dag));
            }
        } else {
            // Decision two: how to tile it.
            let tileable = self
                .root
                .find_child(node.id)
                .filter(|c| c.innermost && !freeze.compute_root_nodes.contains_key(&node.id))
                .cloned();
            match tileable {
                Some(child) => {
                    // Leaving it untiled is always an option.
                    children.push(self.passthrough_child(dag));
                    if !params.no_subtiling {
                        for &factor in TILING_FACTORS.iter() {
                            if child.size.iter().any(|&e| e > factor) {
                                children.push(self.retile_child(node.id, child.tiled(factor), dag));
                            }
                        }
                    }
                }
                // Inlined and frozen nodes have no tiling choice to make.
                None => children.push(self.passthrough_child(dag)),
            }
        }

        for child in children {
            let features = memo.get_or_compute(&child, dag, stats);
            let t0 = Instant::now();
            cost_model.enqueue_state(&child, &features);
            stats.enqueue_time += t0.elapsed();
            stats.num_schedules_enqueued += 1;
            enqueue(child);
        }
    }

    /// Extract per-stage schedule features by walking the DAG bounds for the
    /// funcs this state has placed so far.
    pub fn compute_featurization(&self, dag: &FunctionDAG) -> ScheduleFeatures {
        let bounds = compute_dag_bounds(dag);
        let mut feats = ScheduleFeatures::new(dag.num_stages());

        for child in &self.root.children {
            let Some(node_id) = child.node else { continue };
            let node = &dag.nodes[node_id];
            let Some(b) = &bounds[node_id] else { continue };
            let computed_points: f64 = b.region_computed_all().iter().map(|s| s.extent() as f64).product();

            for (si, stage) in node.stages.iter().enumerate() {
                let loops = b.loops_all(si);
                let points: f64 = loops.iter().map(|s| s.extent() as f64).product();

                // Tile spans shrink the footprint queries when a tiling was
                // chosen; only the pure stage's loops are tiled.
                let tile_spans: Vec<Span> = if si == 0 && !child.innermost {
                    let inner = child.innermost_size();
                    loops
                        .iter()
                        .zip(inner)
                        .map(|(s, &t)| Span::new(s.min(), s.min() + t.min(s.extent()) - 1, true))
                        .collect()
                } else {
                    loops.to_vec()
                };
                let tile_points: f64 = tile_spans.iter().map(|s| s.extent() as f64).product();
                let mut working_set = tile_points * node.bytes_per_point as f64;

                let mut load_bytes = 0.0;
                let mut load_multiplicity = 0.0;
                let mut inlined_calls = 0.0;
                let mut stride_class: f64 = 0.0;
                for &e_id in &stage.incoming_edges {
                    let edge = &dag.edges[e_id];
                    let producer = &dag.nodes[edge.producer];
                    if self.root.inlined.contains_key(&edge.producer) {
                        inlined_calls += edge.calls as f64 * points;
                        // Look through the inlined producer at what it loads.
                        for j_edge in &edge.load_jacobians {
                            for &pe in &producer.stages[0].incoming_edges {
                                let grand = &dag.edges[pe];
                                for j_prod in &grand.load_jacobians {
                                    let chained = j_prod.compose(j_edge);
                                    load_multiplicity += chained.count() as f64;
                                    stride_class = stride_class.max(access_class(&chained));
                                    load_bytes += points
                                        * chained.count() as f64
                                        * dag.nodes[grand.producer].bytes_per_point as f64;
                                }
                            }
                        }
                    } else {
                        let mut fp = vec![Span::empty(); producer.dimensions];
                        edge.expand_footprint(loops, &mut fp);
                        let fp_points: f64 = fp.iter().map(|s| s.extent() as f64).product();
                        load_bytes += fp_points * producer.bytes_per_point as f64;

                        let mut tile_fp = vec![Span::empty(); producer.dimensions];
                        edge.expand_footprint(&tile_spans, &mut tile_fp);
                        let tile_fp_points: f64 = tile_fp.iter().map(|s| s.extent() as f64).product();
                        working_set += tile_fp_points * producer.bytes_per_point as f64;

                        for j in &edge.load_jacobians {
                            load_multiplicity += j.count() as f64;
                            stride_class = stride_class.max(access_class(j));
                        }
                    }
                }

                let f = &mut feats.per_stage[stage.id];
                f.points_computed = points;
                f.op_count = stage.features.total_ops() as f64 * points;
                f.vector_size = stage.vector_size as f64;
                f.innermost_extent = loops.first().map(|s| s.extent() as f64).unwrap_or(1.0);
                if si == 0 {
                    f.bytes_at_production = computed_points * node.bytes_per_point as f64;
                }
                f.load_bytes = load_bytes;
                f.load_multiplicity = load_multiplicity;
                f.inlined_calls = inlined_calls;
                f.load_stride_class = stride_class;
                f.working_set_bytes = working_set;
            }
        }

        // Inlined funcs do their work at the consumer sites.
        for &node_id in self.root.inlined.keys() {
            let node = &dag.nodes[node_id];
            let stage = &node.stages[0];
            let mut total_calls = 0.0;
            for &e_id in &node.outgoing_edges {
                let edge = &dag.edges[e_id];
                if let Some(cb) = &bounds[edge.consumer.node] {
                    let pts: f64 =
                        cb.loops_all(edge.consumer.stage_index).iter().map(|s| s.extent() as f64).product();
                    total_calls += pts * edge.calls as f64;
                }
            }
            let f = &mut feats.per_stage[stage.id];
            f.inlined_calls = total_calls;
            f.op_count = stage.features.total_ops() as f64 * total_calls;
            f.vector_size = stage.vector_size as f64;
        }

        feats
    }

    pub fn dump(&self, dag: &FunctionDAG) {
        tracing::debug!(
            decisions = self.num_decisions_made,
            cost = self.cost(),
            nest = %self.root.display(dag),
            "state"
        );
    }
}

fn can_inline(node: &Node) -> bool {
    !node.is_output && !node.outgoing_edges.is_empty() && node.is_pointwise && node.stages.len() == 1
}

fn access_class(j: &LoadJacobian) -> f64 {
    if j.is_empty() || j.consumer_loop_dims() == 0 {
        return 0.0;
    }
    let mut class: f64 = 0.0;
    for i in 0..j.producer_storage_dims() {
        let s = j.get(i, 0);
        if !s.exists() {
            return 2.0;
        }
        let contiguous = if i == 0 { s >= -1 && s <= 1 } else { s == 0 };
        if !contiguous {
            class = 1.0;
        }
    }
    class
}

/// Cache of featurizations keyed by full-depth structural hash. Sibling
/// states that converge on the same tree share one computation.
#[derive(Default)]
pub struct FeaturizationMemo {
    cache: HashMap<(u64, usize), Rc<ScheduleFeatures>>,
}

impl FeaturizationMemo {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get_or_compute(&mut self, state: &State, dag: &FunctionDAG, stats: &mut Statistics) -> Rc<ScheduleFeatures> {
        let key = (state.structural_hash(FULL_HASH_DEPTH), state.num_decisions_made);
        if let Some(f) = self.cache.get(&key) {
            stats.num_memoization_hits += 1;
            return Rc::clone(f);
        }
        stats.num_memoization_misses += 1;
        let t0 = Instant::now();
        let features = Rc::new(state.compute_featurization(dag));
        stats.featurization_time += t0.elapsed();
        stats.num_featurizations += 1;
        self.cache.insert(key, Rc::clone(&features));
        features
    }
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "state: {} decisions, cost {:.4}", self.num_decisions_made, self.cost())?;
        write!(f, "{}", self.root)
    }
}
