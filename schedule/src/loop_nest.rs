//! The search-state tree.
//!
//! A [`LoopNest`] node is one tile/loop level of a schedule under
//! construction. The root holds one child per compute-root func plus the map
//! of inlined funcs; a func's subtree is either a single innermost level or
//! an outer tile level with one inner child. Trees are shared across sibling
//! search states through non-atomic `Rc`s, so every mutation builds a fresh
//! spine and reuses untouched subtrees.

use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::hash::{Hash, Hasher};
use std::rc::Rc;

use once_cell::sync::Lazy;
use smallvec::SmallVec;
use tessera_ir::{Bound, FunctionDAG, NodeId, Span};

/// Tile factors considered for every tileable loop nest.
pub static TILING_FACTORS: Lazy<Vec<i64>> = Lazy::new(|| (1..=6).map(|i| 1i64 << i).collect());

/// One node in the loop-nest tree.
#[derive(Debug, Clone)]
pub struct LoopNest {
    /// The func computed at this level. `None` only at the root.
    pub node: Option<NodeId>,
    /// Loop extents at this level, innermost first. For a tiled level these
    /// are tile counts; for the innermost level, point counts.
    pub size: SmallVec<[i64; 4]>,
    pub children: Vec<Rc<LoopNest>>,
    /// Funcs inlined into their consumers, with total call counts. Only
    /// populated at the root.
    pub inlined: BTreeMap<NodeId, i64>,
    pub innermost: bool,
}

impl LoopNest {
    pub fn new_root() -> Rc<LoopNest> {
        Rc::new(LoopNest {
            node: None,
            size: SmallVec::new(),
            children: Vec::new(),
            inlined: BTreeMap::new(),
            innermost: false,
        })
    }

    /// An untiled compute-root loop nest for `node`, sized from its stage-0
    /// loop bounds.
    pub fn compute_root(dag: &FunctionDAG, node: NodeId, bounds: &[Option<Bound>]) -> LoopNest {
        let b = bounds[node].as_ref().unwrap_or_else(|| panic!("no bounds computed for node {node}"));
        let size = b.loops_all(0).iter().map(Span::extent).collect();
        LoopNest { node: Some(node), size, children: Vec::new(), inlined: BTreeMap::new(), innermost: true }
    }

    /// Split this (untiled) level by `factor`: an outer level of tile counts
    /// over an inner level of tile extents.
    pub fn tiled(&self, factor: i64) -> LoopNest {
        assert!(self.innermost, "only an innermost level can be split");
        let outer: SmallVec<[i64; 4]> = self.size.iter().map(|&e| (e + factor - 1) / factor).collect();
        let inner: SmallVec<[i64; 4]> = self.size.iter().map(|&e| e.min(factor)).collect();
        LoopNest {
            node: self.node,
            size: outer,
            children: vec![Rc::new(LoopNest {
                node: self.node,
                size: inner,
                children: Vec::new(),
                inlined: BTreeMap::new(),
                innermost: true,
            })],
            inlined: BTreeMap::new(),
            innermost: false,
        }
    }

    /// Extents of the innermost level beneath this one.
    pub fn innermost_size(&self) -> &[i64] {
        let mut cur = self;
        while !cur.innermost {
            match cur.children.first() {
                Some(c) if c.node == cur.node => cur = c,
                _ => break,
            }
        }
        &cur.size
    }

    pub fn find_child(&self, node: NodeId) -> Option<&Rc<LoopNest>> {
        self.children.iter().find(|c| c.node == Some(node))
    }

    /// Hash the tree shape. Higher `depth` discriminates more: negative
    /// depths see only what is placed where, depth 1 adds the tree
    /// structure, depth 2 and beyond add tile sizes level by level.
    pub fn structural_hash<H: Hasher>(&self, depth: i32, h: &mut H) {
        self.node.hash(h);
        for node in self.inlined.keys() {
            node.hash(h);
        }
        if depth >= 2 {
            self.size.hash(h);
        }
        if depth >= 1 {
            self.children.len().hash(h);
            for c in &self.children {
                c.structural_hash(depth - 1, h);
            }
        } else {
            // Coarse granularity sees placements only, not tile levels.
            for c in &self.children {
                if c.node != self.node {
                    c.node.hash(h);
                }
            }
        }
    }

    /// Structurally copy the tree, applying `mutate` to every copied node.
    pub fn deep_copy_with(&self, mutate: &dyn Fn(&mut LoopNest)) -> Rc<LoopNest> {
        let mut copy = LoopNest {
            node: self.node,
            size: self.size.clone(),
            children: self.children.iter().map(|c| c.deep_copy_with(mutate)).collect(),
            inlined: self.inlined.clone(),
            innermost: self.innermost,
        };
        mutate(&mut copy);
        Rc::new(copy)
    }

    /// Record which of `frozen` appear in this tree's inlined maps.
    pub fn collect_nodes_that_should_be_inlined(&self, frozen: &HashSet<NodeId>, out: &mut HashSet<NodeId>) {
        for node in self.inlined.keys() {
            if frozen.contains(node) {
                out.insert(*node);
            }
        }
        for c in &self.children {
            c.collect_nodes_that_should_be_inlined(frozen, out);
        }
    }

    fn fmt_indented(&self, f: &mut fmt::Formatter<'_>, dag: Option<&FunctionDAG>, indent: usize) -> fmt::Result {
        let pad = "  ".repeat(indent);
        match self.node {
            None => writeln!(f, "{pad}root")?,
            Some(id) => {
                let name = dag.map(|d| d.nodes[id].name.clone()).unwrap_or_else(|| format!("n{id}"));
                writeln!(f, "{pad}{name} {:?}{}", self.size, if self.innermost { " (innermost)" } else { "" })?;
            }
        }
        for (node, calls) in &self.inlined {
            let name = dag.map(|d| d.nodes[*node].name.clone()).unwrap_or_else(|| format!("n{node}"));
            writeln!(f, "{pad}  inlined: {name} (x{calls})")?;
        }
        for c in &self.children {
            c.fmt_indented(f, dag, indent + 1)?;
        }
        Ok(())
    }
}

// Display without a DAG at hand falls back to node ids.
impl fmt::Display for LoopNest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.fmt_indented(f, None, 0)
    }
}

/// Renders a loop nest with func names resolved through the DAG.
pub struct LoopNestDisplay<'a> {
    nest: &'a LoopNest,
    dag: &'a FunctionDAG,
}

impl LoopNest {
    pub fn display<'a>(&'a self, dag: &'a FunctionDAG) -> LoopNestDisplay<'a> {
        LoopNestDisplay { nest: self, dag }
    }
}

impl fmt::Display for LoopNestDisplay<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.nest.fmt_indented(f, Some(self.dag), 0)
    }
}

/// Compute required, computed, and loop bounds for every node of the DAG,
/// walking consumers before producers and expanding producer footprints
/// along every edge. This is the hot path the bounds pool exists for.
pub fn compute_dag_bounds(dag: &FunctionDAG) -> Vec<Option<Bound>> {
    let n = dag.nodes.len();
    let mut required: Vec<Option<Vec<Span>>> = vec![None; n];
    for node in &dag.nodes {
        if node.is_output {
            let est = node
                .estimated_region_required
                .as_ref()
                .unwrap_or_else(|| panic!("output {} has no estimated region", node.name));
            required[node.id] = Some(est.clone());
        }
    }

    let mut bounds: Vec<Option<Bound>> = vec![None; n];
    for node in &dag.nodes {
        let Some(req) = required[node.id].take() else { continue };

        let mut b = node.make_bound();
        b.region_required_mut().copy_from_slice(&req);
        let mut computed = vec![Span::empty(); node.dimensions];
        node.required_to_computed(&req, &mut computed);
        b.region_computed_mut().copy_from_slice(&computed);
        for (si, stage) in node.stages.iter().enumerate() {
            let mut loops = vec![Span::empty(); stage.loops.len()];
            node.loop_nest_for_region(si, &computed, &mut loops);
            b.loops_mut(si).copy_from_slice(&loops);

            for &e in &stage.incoming_edges {
                let edge = &dag.edges[e];
                let producer = &dag.nodes[edge.producer];
                let slot = required[edge.producer]
                    .get_or_insert_with(|| vec![Span::empty(); producer.dimensions]);
                edge.expand_footprint(&loops, slot);
            }
        }
        bounds[node.id] = Some(b.freeze());
    }
    bounds
}
