//! Pooled storage for concrete bounds.
//!
//! Bounds objects are created and destroyed very frequently while exploring
//! scheduling options, so each DAG node owns a [`Layout`] with a free list of
//! span arrays. A [`BoundContents`] holds one such array partitioned into
//! three regions: region required (one span per dimension), region computed
//! (same width), and the loop spans of each stage. Contents are treated as
//! immutable once populated and wrapped in a [`Bound`]; mutation goes through
//! [`BoundContents::make_copy`].
//!
//! The pool is single-threaded. Dropping a `BoundContents` returns its span
//! array to the layout that produced it; keeping the layout alive through an
//! `Rc` makes a release to the wrong pool unrepresentable.

use std::cell::{Cell, RefCell};
use std::rc::Rc;

use crate::span::Span;

/// Smallest number of span arrays added to a pool per refill.
const MIN_POOL_GROWTH: usize = 32;

/// A shared, immutable set of bounds for one node.
pub type Bound = Rc<BoundContents>;

/// The memory layout of bounds for one node, plus the free-list pool of
/// span arrays with that layout.
///
/// Figuring the layout out once per node ahead of time keeps each individual
/// bounds object a single flat allocation.
#[derive(Debug)]
pub struct Layout {
    /// Number of spans in each array.
    total_size: usize,
    /// `region_computed` starts at this index; `region_required` starts at 0.
    computed_offset: usize,
    /// The loop spans of stage `i` start at `loop_offset[i]`.
    loop_offset: Vec<usize>,

    /// Free span arrays, ready for reuse.
    pool: RefCell<Vec<Box<[Span]>>>,
    /// Arrays handed out and not yet returned.
    num_live: Cell<usize>,
    /// Total arrays ever allocated; drives geometric pool growth.
    num_allocated: Cell<usize>,
}

impl Layout {
    /// Layout for a node with `dimensions` dims and the given per-stage loop
    /// counts.
    pub fn for_node(dimensions: usize, stage_loop_counts: &[usize]) -> Rc<Layout> {
        let mut loop_offset = Vec::with_capacity(stage_loop_counts.len());
        let mut next = 2 * dimensions;
        for &count in stage_loop_counts {
            loop_offset.push(next);
            next += count;
        }
        Rc::new(Layout {
            total_size: next,
            computed_offset: dimensions,
            loop_offset,
            pool: RefCell::new(Vec::new()),
            num_live: Cell::new(0),
            num_allocated: Cell::new(0),
        })
    }

    pub fn total_size(&self) -> usize {
        self.total_size
    }

    /// Grab a bounds object from the pool. The spans hold whatever the
    /// previous user left there; callers populate every field they read.
    pub fn make(self: &Rc<Self>) -> BoundContents {
        let popped = self.pool.borrow_mut().pop();
        let spans = match popped {
            Some(spans) => spans,
            None => {
                self.allocate_some_more();
                self.pool
                    .borrow_mut()
                    .pop()
                    .unwrap_or_else(|| panic!("bounds pool refill produced no entries"))
            }
        };
        self.num_live.set(self.num_live.get() + 1);
        BoundContents { layout: Rc::clone(self), spans }
    }

    fn allocate_some_more(&self) {
        let grown = self.num_allocated.get().max(MIN_POOL_GROWTH);
        tracing::trace!(total_size = self.total_size, grown, "growing bounds pool");
        let mut pool = self.pool.borrow_mut();
        pool.reserve(grown);
        for _ in 0..grown {
            pool.push(vec![Span::empty(); self.total_size].into_boxed_slice());
        }
        self.num_allocated.set(self.num_allocated.get() + grown);
    }

    fn release(&self, spans: Box<[Span]>) {
        let live = self.num_live.get();
        assert!(live > 0, "bounds released to a pool with no live entries");
        self.num_live.set(live - 1);
        self.pool.borrow_mut().push(spans);
    }

    #[cfg(test)]
    pub(crate) fn num_live(&self) -> usize {
        self.num_live.get()
    }
}

impl Drop for Layout {
    fn drop(&mut self) {
        debug_assert_eq!(self.num_live.get(), 0, "layout dropped with live bounds");
    }
}

/// A flat span array partitioned by its [`Layout`].
#[derive(Debug)]
pub struct BoundContents {
    layout: Rc<Layout>,
    spans: Box<[Span]>,
}

impl BoundContents {
    pub fn layout(&self) -> &Rc<Layout> {
        &self.layout
    }

    pub fn region_required(&self, i: usize) -> &Span {
        &self.spans[i]
    }

    pub fn region_required_mut(&mut self) -> &mut [Span] {
        let computed = self.layout.computed_offset;
        &mut self.spans[..computed]
    }

    pub fn region_required_all(&self) -> &[Span] {
        &self.spans[..self.layout.computed_offset]
    }

    pub fn region_computed(&self, i: usize) -> &Span {
        &self.spans[self.layout.computed_offset + i]
    }

    pub fn region_computed_all(&self) -> &[Span] {
        let start = self.layout.computed_offset;
        &self.spans[start..start + self.layout.computed_offset]
    }

    pub fn region_computed_mut(&mut self) -> &mut [Span] {
        let start = self.layout.computed_offset;
        &mut self.spans[start..start + self.layout.computed_offset]
    }

    pub fn loops(&self, stage: usize, i: usize) -> &Span {
        &self.spans[self.layout.loop_offset[stage] + i]
    }

    pub fn loops_all(&self, stage: usize) -> &[Span] {
        let start = self.layout.loop_offset[stage];
        let end = self.layout.loop_offset.get(stage + 1).copied().unwrap_or(self.layout.total_size);
        &self.spans[start..end]
    }

    pub fn loops_mut(&mut self, stage: usize) -> &mut [Span] {
        let start = self.layout.loop_offset[stage];
        let end = self.layout.loop_offset.get(stage + 1).copied().unwrap_or(self.layout.total_size);
        &mut self.spans[start..end]
    }

    /// Bitwise copy of the span array into a fresh pool entry.
    pub fn make_copy(&self) -> BoundContents {
        let mut copy = self.layout.make();
        copy.spans.copy_from_slice(&self.spans);
        copy
    }

    /// Freeze into a shared handle.
    pub fn freeze(self) -> Bound {
        Rc::new(self)
    }
}

impl Drop for BoundContents {
    fn drop(&mut self) {
        let spans = std::mem::take(&mut self.spans);
        self.layout.release(spans);
    }
}
