//! The pipeline description the DAG is built from.
//!
//! This is the stand-in for a compiler front end: pure functions over integer
//! coordinate grids, each with a pure definition and optional updates. Bodies
//! are scalar value expressions; producer accesses are [`ValueExpr::Load`]
//! nodes whose coordinates are symbolic [`Expr`]s over the consumer's
//! variables.
//!
//! Variable convention inside a stage: `Expr::var(d)` for `d < dimensions` is
//! the function's pure coordinate `d`; `Expr::var(dimensions + k)` is the
//! stage's `k`-th reduction variable.

use crate::error::{
    DimensionOutOfRangeSnafu, DuplicatePureDefinitionSnafu, InputWithDefinitionSnafu, NoPureDefinitionSnafu, Result,
};
use crate::expr::Expr;

/// Index of a function within its [`Pipeline`].
pub type FuncId = usize;

/// Scalar element types, one per featurization type class.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScalarType {
    Bool,
    Int8,
    Int16,
    Int32,
    Int64,
    Float32,
    Float64,
}

impl ScalarType {
    pub fn bytes(self) -> usize {
        match self {
            ScalarType::Bool | ScalarType::Int8 => 1,
            ScalarType::Int16 => 2,
            ScalarType::Int32 | ScalarType::Float32 => 4,
            ScalarType::Int64 | ScalarType::Float64 => 8,
        }
    }

    /// Column of this type in the featurization histograms.
    pub fn class_index(self) -> usize {
        self as usize
    }
}

/// Description of the machine being scheduled for. Only the natural vector
/// width matters to the analysis; everything else is a cost-model concern.
#[derive(Debug, Clone, Copy)]
pub struct Target {
    pub vector_bits: usize,
}

impl Default for Target {
    fn default() -> Self {
        Self { vector_bits: 128 }
    }
}

/// How a function's computed region relates to its required region, per
/// dimension.
///
/// Most functions compute exactly what is asked of them. Some compute more:
/// a scan must produce every point of the row containing a requested point,
/// and a boundary condition is defined over a fixed footprint it gets
/// unioned with.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ComputedBounds {
    #[default]
    SameAsRequired,
    /// Computed = union(required, `[c_min, c_max]`).
    UnionWith { c_min: i64, c_max: i64 },
    /// Computed = `[required.min - before, required.max + after]`.
    PaddedBy { before: i64, after: i64 },
}

/// One definition of a function: the pure definition or an update.
#[derive(Debug, Clone)]
pub struct StageDef {
    /// Constant `(min, max)` bounds of the reduction variables, innermost
    /// first. Empty for the pure definition.
    pub rvars: Vec<(i64, i64)>,
    pub body: ValueExpr,
}

/// A scalar value expression: the body of a stage.
#[derive(Debug, Clone)]
pub enum ValueExpr {
    Const(f64),
    /// A scalar runtime parameter, by name.
    Param(String),
    /// The value of loop coordinate `d` (same numbering as `Expr::var`).
    Coord(usize),
    Cast(ScalarType, Box<ValueExpr>),
    Add(Box<ValueExpr>, Box<ValueExpr>),
    Sub(Box<ValueExpr>, Box<ValueExpr>),
    Mul(Box<ValueExpr>, Box<ValueExpr>),
    Div(Box<ValueExpr>, Box<ValueExpr>),
    Min(Box<ValueExpr>, Box<ValueExpr>),
    Max(Box<ValueExpr>, Box<ValueExpr>),
    Select(Box<ValueExpr>, Box<ValueExpr>, Box<ValueExpr>),
    Sqrt(Box<ValueExpr>),
    Exp(Box<ValueExpr>),
    /// A point access into a producer function.
    Load { func: FuncId, coords: Vec<Expr> },
}

impl ValueExpr {
    pub fn load(func: FuncId, coords: Vec<Expr>) -> ValueExpr {
        ValueExpr::Load { func, coords }
    }

    pub fn add(a: ValueExpr, b: ValueExpr) -> ValueExpr {
        ValueExpr::Add(Box::new(a), Box::new(b))
    }

    pub fn sub(a: ValueExpr, b: ValueExpr) -> ValueExpr {
        ValueExpr::Sub(Box::new(a), Box::new(b))
    }

    pub fn mul(a: ValueExpr, b: ValueExpr) -> ValueExpr {
        ValueExpr::Mul(Box::new(a), Box::new(b))
    }

    pub fn div(a: ValueExpr, b: ValueExpr) -> ValueExpr {
        ValueExpr::Div(Box::new(a), Box::new(b))
    }

    pub fn min(a: ValueExpr, b: ValueExpr) -> ValueExpr {
        ValueExpr::Min(Box::new(a), Box::new(b))
    }

    pub fn max(a: ValueExpr, b: ValueExpr) -> ValueExpr {
        ValueExpr::Max(Box::new(a), Box::new(b))
    }

    pub fn select(c: ValueExpr, t: ValueExpr, f: ValueExpr) -> ValueExpr {
        ValueExpr::Select(Box::new(c), Box::new(t), Box::new(f))
    }

    pub fn sqrt(a: ValueExpr) -> ValueExpr {
        ValueExpr::Sqrt(Box::new(a))
    }

    pub fn exp(a: ValueExpr) -> ValueExpr {
        ValueExpr::Exp(Box::new(a))
    }

    pub fn cast(ty: ScalarType, a: ValueExpr) -> ValueExpr {
        ValueExpr::Cast(ty, Box::new(a))
    }

    /// Visit every load in the expression, in a deterministic order.
    pub fn for_each_load(&self, f: &mut impl FnMut(FuncId, &[Expr])) {
        match self {
            ValueExpr::Const(_) | ValueExpr::Param(_) | ValueExpr::Coord(_) => {}
            ValueExpr::Cast(_, a) | ValueExpr::Sqrt(a) | ValueExpr::Exp(a) => a.for_each_load(f),
            ValueExpr::Add(a, b)
            | ValueExpr::Sub(a, b)
            | ValueExpr::Mul(a, b)
            | ValueExpr::Div(a, b)
            | ValueExpr::Min(a, b)
            | ValueExpr::Max(a, b) => {
                a.for_each_load(f);
                b.for_each_load(f);
            }
            ValueExpr::Select(c, t, e) => {
                c.for_each_load(f);
                t.for_each_load(f);
                e.for_each_load(f);
            }
            ValueExpr::Load { func, coords } => f(*func, coords),
        }
    }
}

/// One pure function in the pipeline.
#[derive(Debug, Clone)]
pub struct Func {
    pub name: String,
    pub dimensions: usize,
    pub scalar_type: ScalarType,
    pub is_input: bool,
    pub stages: Vec<StageDef>,
    /// Optional `(min, extent)` estimate per dimension.
    pub estimates: Vec<Option<(i64, i64)>>,
    pub computed: Vec<ComputedBounds>,
}

/// A pipeline under construction: the input handed to DAG analysis.
#[derive(Debug, Clone, Default)]
pub struct Pipeline {
    funcs: Vec<Func>,
}

impl Pipeline {
    pub fn new() -> Self {
        Self::default()
    }

    /// Declare an input buffer. Inputs are represented as nodes but never
    /// scheduled.
    pub fn input(&mut self, name: &str, dimensions: usize, scalar_type: ScalarType) -> FuncId {
        self.push(name, dimensions, scalar_type, true)
    }

    /// Declare a function to be defined later.
    pub fn func(&mut self, name: &str, dimensions: usize, scalar_type: ScalarType) -> FuncId {
        self.push(name, dimensions, scalar_type, false)
    }

    fn push(&mut self, name: &str, dimensions: usize, scalar_type: ScalarType, is_input: bool) -> FuncId {
        self.funcs.push(Func {
            name: name.to_owned(),
            dimensions,
            scalar_type,
            is_input,
            stages: Vec::new(),
            estimates: vec![None; dimensions],
            computed: vec![ComputedBounds::SameAsRequired; dimensions],
        });
        self.funcs.len() - 1
    }

    /// Give a function its pure definition.
    pub fn define(&mut self, func: FuncId, body: ValueExpr) -> Result<()> {
        let f = &mut self.funcs[func];
        if f.is_input {
            return InputWithDefinitionSnafu { func: f.name.clone() }.fail();
        }
        if !f.stages.is_empty() {
            return DuplicatePureDefinitionSnafu { func: f.name.clone() }.fail();
        }
        f.stages.push(StageDef { rvars: Vec::new(), body });
        Ok(())
    }

    /// Add an update definition with the given reduction-variable bounds.
    pub fn update(&mut self, func: FuncId, rvars: Vec<(i64, i64)>, body: ValueExpr) -> Result<()> {
        let f = &mut self.funcs[func];
        if f.is_input {
            return InputWithDefinitionSnafu { func: f.name.clone() }.fail();
        }
        if f.stages.is_empty() {
            return NoPureDefinitionSnafu { func: f.name.clone() }.fail();
        }
        f.stages.push(StageDef { rvars, body });
        Ok(())
    }

    /// Record a user bounds estimate `(min, extent)`. Required on every
    /// dimension of every output.
    pub fn set_estimate(&mut self, func: FuncId, dim: usize, min: i64, extent: i64) -> Result<()> {
        let f = &mut self.funcs[func];
        if dim >= f.dimensions {
            return DimensionOutOfRangeSnafu { func: f.name.clone(), dim, dims: f.dimensions }.fail();
        }
        f.estimates[dim] = Some((min, extent));
        Ok(())
    }

    /// Override how the computed region relates to the required region.
    pub fn set_computed_bounds(&mut self, func: FuncId, dim: usize, bounds: ComputedBounds) -> Result<()> {
        let f = &mut self.funcs[func];
        if dim >= f.dimensions {
            return DimensionOutOfRangeSnafu { func: f.name.clone(), dim, dims: f.dimensions }.fail();
        }
        f.computed[dim] = bounds;
        Ok(())
    }

    pub fn funcs(&self) -> &[Func] {
        &self.funcs
    }

    pub fn func_def(&self, id: FuncId) -> &Func {
        &self.funcs[id]
    }
}
