//! A minimal symbolic affine-interval algebra.
//!
//! The front end of a full compiler would hand us opaque expression handles
//! plus bounds-inference and simplification services. This module is the
//! small algebra the DAG analysis actually needs: integer expressions over
//! named variables, interval evaluation, affine decomposition for the edge
//! fast paths, and rational derivatives for load jacobians.
//!
//! Expressions are immutable `Rc` trees with light constant folding at
//! construction.

use std::fmt;
use std::rc::Rc;

use crate::rational::OptionalRational;

/// Identifier of a symbolic variable. Allocation is up to the caller; the
/// DAG hands out dense ids.
pub type VarId = usize;

/// A symbolic interval `[min, max]`.
#[derive(Debug, Clone)]
pub struct Interval {
    pub min: Expr,
    pub max: Expr,
}

/// Result of [`Expr::affine_decompose`]: `coeff * var + constant`, where
/// `var` indexes the caller's variable list (`None` for a constant
/// expression).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Affine {
    pub coeff: i64,
    pub constant: i64,
    pub var: Option<usize>,
}

#[derive(Debug)]
enum Node {
    Var(VarId),
    Const(i64),
    Add(Expr, Expr),
    Sub(Expr, Expr),
    Mul(Expr, Expr),
    Div(Expr, Expr),
    Min(Expr, Expr),
    Max(Expr, Expr),
}

/// An immutable integer expression.
#[derive(Debug, Clone)]
pub struct Expr(Rc<Node>);

impl Expr {
    pub fn var(v: VarId) -> Expr {
        Expr(Rc::new(Node::Var(v)))
    }

    pub fn constant(c: i64) -> Expr {
        Expr(Rc::new(Node::Const(c)))
    }

    pub fn add(a: &Expr, b: &Expr) -> Expr {
        match (a.as_const(), b.as_const()) {
            (Some(x), Some(y)) => Expr::constant(x + y),
            (Some(0), _) => b.clone(),
            (_, Some(0)) => a.clone(),
            _ => Expr(Rc::new(Node::Add(a.clone(), b.clone()))),
        }
    }

    pub fn sub(a: &Expr, b: &Expr) -> Expr {
        match (a.as_const(), b.as_const()) {
            (Some(x), Some(y)) => Expr::constant(x - y),
            (_, Some(0)) => a.clone(),
            _ => Expr(Rc::new(Node::Sub(a.clone(), b.clone()))),
        }
    }

    pub fn mul(a: &Expr, b: &Expr) -> Expr {
        match (a.as_const(), b.as_const()) {
            (Some(x), Some(y)) => Expr::constant(x * y),
            (Some(0), _) | (_, Some(0)) => Expr::constant(0),
            (Some(1), _) => b.clone(),
            (_, Some(1)) => a.clone(),
            _ => Expr(Rc::new(Node::Mul(a.clone(), b.clone()))),
        }
    }

    /// Euclidean division (rounds toward negative infinity for positive
    /// divisors), matching coordinate-split semantics.
    pub fn div(a: &Expr, b: &Expr) -> Expr {
        match (a.as_const(), b.as_const()) {
            (Some(x), Some(y)) if y != 0 => Expr::constant(x.div_euclid(y)),
            (_, Some(1)) => a.clone(),
            _ => Expr(Rc::new(Node::Div(a.clone(), b.clone()))),
        }
    }

    pub fn min(a: &Expr, b: &Expr) -> Expr {
        if let Some((ca, cb)) = parallel_linear(a, b) {
            return if ca <= cb { a.clone() } else { b.clone() };
        }
        match (a.as_const(), b.as_const()) {
            (Some(x), Some(y)) => Expr::constant(x.min(y)),
            _ => Expr(Rc::new(Node::Min(a.clone(), b.clone()))),
        }
    }

    pub fn max(a: &Expr, b: &Expr) -> Expr {
        if let Some((ca, cb)) = parallel_linear(a, b) {
            return if ca >= cb { a.clone() } else { b.clone() };
        }
        match (a.as_const(), b.as_const()) {
            (Some(x), Some(y)) => Expr::constant(x.max(y)),
            _ => Expr(Rc::new(Node::Max(a.clone(), b.clone()))),
        }
    }

    /// Decompose into `coeff * var + constant` over whichever single
    /// variable occurs, if any.
    fn linear_parts(&self) -> Option<(i64, i64, Option<VarId>)> {
        match &*self.0 {
            Node::Const(c) => Some((0, *c, None)),
            Node::Var(v) => Some((1, 0, Some(*v))),
            Node::Add(a, b) | Node::Sub(a, b) => {
                let sign = if matches!(&*self.0, Node::Sub(..)) { -1 } else { 1 };
                let (ca, ka, va) = a.linear_parts()?;
                let (cb, kb, vb) = b.linear_parts()?;
                let var = match (va, vb) {
                    (Some(x), Some(y)) if x != y => return None,
                    (Some(x), _) => Some(x),
                    (None, y) => y,
                };
                Some((ca + sign * cb, ka + sign * kb, var))
            }
            Node::Mul(a, b) => {
                if let Some(c) = b.as_const() {
                    let (ca, ka, va) = a.linear_parts()?;
                    Some((ca * c, ka * c, va))
                } else if let Some(c) = a.as_const() {
                    let (cb, kb, vb) = b.linear_parts()?;
                    Some((cb * c, kb * c, vb))
                } else {
                    None
                }
            }
            Node::Div(..) | Node::Min(..) | Node::Max(..) => None,
        }
    }

    pub fn as_const(&self) -> Option<i64> {
        match &*self.0 {
            Node::Const(c) => Some(*c),
            _ => None,
        }
    }

    pub fn as_var(&self) -> Option<VarId> {
        match &*self.0 {
            Node::Var(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_min(&self) -> Option<(&Expr, &Expr)> {
        match &*self.0 {
            Node::Min(a, b) => Some((a, b)),
            _ => None,
        }
    }

    pub fn as_max(&self) -> Option<(&Expr, &Expr)> {
        match &*self.0 {
            Node::Max(a, b) => Some((a, b)),
            _ => None,
        }
    }

    /// Visit every variable occurrence.
    pub fn for_each_var(&self, f: &mut impl FnMut(VarId)) {
        match &*self.0 {
            Node::Var(v) => f(*v),
            Node::Const(_) => {}
            Node::Add(a, b)
            | Node::Sub(a, b)
            | Node::Mul(a, b)
            | Node::Div(a, b)
            | Node::Min(a, b)
            | Node::Max(a, b) => {
                a.for_each_var(f);
                b.for_each_var(f);
            }
        }
    }

    /// True when no variable occurs in the expression.
    pub fn is_constant(&self) -> bool {
        match &*self.0 {
            Node::Var(_) => false,
            Node::Const(_) => true,
            Node::Add(a, b)
            | Node::Sub(a, b)
            | Node::Mul(a, b)
            | Node::Div(a, b)
            | Node::Min(a, b)
            | Node::Max(a, b) => a.is_constant() && b.is_constant(),
        }
    }

    pub fn evaluate(&self, env: &dyn Fn(VarId) -> i64) -> i64 {
        match &*self.0 {
            Node::Var(v) => env(*v),
            Node::Const(c) => *c,
            Node::Add(a, b) => a.evaluate(env) + b.evaluate(env),
            Node::Sub(a, b) => a.evaluate(env) - b.evaluate(env),
            Node::Mul(a, b) => a.evaluate(env) * b.evaluate(env),
            Node::Div(a, b) => {
                let d = b.evaluate(env);
                assert!(d != 0, "division by zero while evaluating a bound expression");
                a.evaluate(env).div_euclid(d)
            }
            Node::Min(a, b) => a.evaluate(env).min(b.evaluate(env)),
            Node::Max(a, b) => a.evaluate(env).max(b.evaluate(env)),
        }
    }

    /// Concrete interval of the expression when each variable ranges over
    /// `env(v) = (lo, hi)`.
    ///
    /// Division assumes the divisor interval does not span zero; pipeline
    /// coordinate expressions only divide by constants.
    pub fn interval_eval(&self, env: &dyn Fn(VarId) -> (i64, i64)) -> (i64, i64) {
        match &*self.0 {
            Node::Var(v) => env(*v),
            Node::Const(c) => (*c, *c),
            Node::Add(a, b) => {
                let (al, ah) = a.interval_eval(env);
                let (bl, bh) = b.interval_eval(env);
                (al + bl, ah + bh)
            }
            Node::Sub(a, b) => {
                let (al, ah) = a.interval_eval(env);
                let (bl, bh) = b.interval_eval(env);
                (al - bh, ah - bl)
            }
            Node::Mul(a, b) => {
                let (al, ah) = a.interval_eval(env);
                let (bl, bh) = b.interval_eval(env);
                let c = [al * bl, al * bh, ah * bl, ah * bh];
                (c.iter().copied().min().unwrap_or(0), c.iter().copied().max().unwrap_or(0))
            }
            Node::Div(a, b) => {
                let (al, ah) = a.interval_eval(env);
                let (bl, bh) = b.interval_eval(env);
                assert!(bl != 0 && bh != 0, "divisor interval spans zero");
                let c = [al.div_euclid(bl), al.div_euclid(bh), ah.div_euclid(bl), ah.div_euclid(bh)];
                (c.iter().copied().min().unwrap_or(0), c.iter().copied().max().unwrap_or(0))
            }
            Node::Min(a, b) => {
                let (al, ah) = a.interval_eval(env);
                let (bl, bh) = b.interval_eval(env);
                (al.min(bl), ah.min(bh))
            }
            Node::Max(a, b) => {
                let (al, ah) = a.interval_eval(env);
                let (bl, bh) = b.interval_eval(env);
                (al.max(bl), ah.max(bh))
            }
        }
    }

    /// Symbolic lower and upper bound expressions given per-variable lower
    /// and upper bound substitutions. Used to turn a call-site coordinate
    /// into footprint bound expressions over a stage's loop variables.
    pub fn bounds_exprs(&self, lo: &dyn Fn(VarId) -> Expr, hi: &dyn Fn(VarId) -> Expr) -> (Expr, Expr) {
        match &*self.0 {
            Node::Var(v) => (lo(*v), hi(*v)),
            Node::Const(c) => (Expr::constant(*c), Expr::constant(*c)),
            Node::Add(a, b) => {
                let (al, ah) = a.bounds_exprs(lo, hi);
                let (bl, bh) = b.bounds_exprs(lo, hi);
                (Expr::add(&al, &bl), Expr::add(&ah, &bh))
            }
            Node::Sub(a, b) => {
                let (al, ah) = a.bounds_exprs(lo, hi);
                let (bl, bh) = b.bounds_exprs(lo, hi);
                (Expr::sub(&al, &bh), Expr::sub(&ah, &bl))
            }
            Node::Mul(a, b) => {
                let (al, ah) = a.bounds_exprs(lo, hi);
                let (bl, bh) = b.bounds_exprs(lo, hi);
                if let Some(c) = b.as_const() {
                    if c >= 0 {
                        (Expr::mul(&al, b), Expr::mul(&ah, b))
                    } else {
                        (Expr::mul(&ah, b), Expr::mul(&al, b))
                    }
                } else if let Some(c) = a.as_const() {
                    if c >= 0 {
                        (Expr::mul(a, &bl), Expr::mul(a, &bh))
                    } else {
                        (Expr::mul(a, &bh), Expr::mul(a, &bl))
                    }
                } else {
                    let cands = [Expr::mul(&al, &bl), Expr::mul(&al, &bh), Expr::mul(&ah, &bl), Expr::mul(&ah, &bh)];
                    (min_of(&cands), max_of(&cands))
                }
            }
            Node::Div(a, b) => {
                let (al, ah) = a.bounds_exprs(lo, hi);
                if let Some(c) = b.as_const() {
                    if c > 0 {
                        (Expr::div(&al, b), Expr::div(&ah, b))
                    } else {
                        (Expr::div(&ah, b), Expr::div(&al, b))
                    }
                } else {
                    let (bl, bh) = b.bounds_exprs(lo, hi);
                    let cands = [Expr::div(&al, &bl), Expr::div(&al, &bh), Expr::div(&ah, &bl), Expr::div(&ah, &bh)];
                    (min_of(&cands), max_of(&cands))
                }
            }
            Node::Min(a, b) => {
                let (al, ah) = a.bounds_exprs(lo, hi);
                let (bl, bh) = b.bounds_exprs(lo, hi);
                (Expr::min(&al, &bl), Expr::min(&ah, &bh))
            }
            Node::Max(a, b) => {
                let (al, ah) = a.bounds_exprs(lo, hi);
                let (bl, bh) = b.bounds_exprs(lo, hi);
                (Expr::max(&al, &bl), Expr::max(&ah, &bh))
            }
        }
    }

    /// Decompose into `coeff * var + constant` where `var` is drawn from
    /// `vars`. Returns `None` for anything non-affine in those variables.
    pub fn affine_decompose(&self, vars: &[VarId]) -> Option<Affine> {
        match &*self.0 {
            Node::Const(c) => Some(Affine { coeff: 0, constant: *c, var: None }),
            Node::Var(v) => {
                let idx = vars.iter().position(|x| x == v)?;
                Some(Affine { coeff: 1, constant: 0, var: Some(idx) })
            }
            Node::Add(a, b) => combine_affine(a.affine_decompose(vars)?, b.affine_decompose(vars)?, 1),
            Node::Sub(a, b) => combine_affine(a.affine_decompose(vars)?, b.affine_decompose(vars)?, -1),
            Node::Mul(a, b) => {
                if let Some(c) = b.as_const() {
                    let d = a.affine_decompose(vars)?;
                    Some(Affine { coeff: d.coeff * c, constant: d.constant * c, var: d.var })
                } else if let Some(c) = a.as_const() {
                    let d = b.affine_decompose(vars)?;
                    Some(Affine { coeff: d.coeff * c, constant: d.constant * c, var: d.var })
                } else {
                    None
                }
            }
            Node::Div(..) | Node::Min(..) | Node::Max(..) => None,
        }
    }

    /// The rational derivative of the expression with respect to `var`.
    ///
    /// Affine expressions produce exact rationals (divisions by constants
    /// yield fractional strides); min/max and other non-affine forms with
    /// diverging branch strides produce the unknown rational.
    pub fn stride(&self, var: VarId) -> OptionalRational {
        match &*self.0 {
            Node::Const(_) => OptionalRational::zero(),
            Node::Var(v) => {
                if *v == var {
                    OptionalRational::new(1, 1)
                } else {
                    OptionalRational::zero()
                }
            }
            Node::Add(a, b) => {
                let mut s = a.stride(var);
                s += b.stride(var);
                s
            }
            Node::Sub(a, b) => {
                let mut s = a.stride(var);
                s += b.stride(var) * -1;
                s
            }
            Node::Mul(a, b) => {
                if let Some(c) = b.as_const() {
                    a.stride(var) * c
                } else if let Some(c) = a.as_const() {
                    b.stride(var) * c
                } else {
                    OptionalRational::unknown()
                }
            }
            Node::Div(a, b) => match b.as_const() {
                Some(c) if c != 0 => a.stride(var) * OptionalRational::new(1, c),
                _ => OptionalRational::unknown(),
            },
            // Both branches moving in lockstep is the only case with a
            // well-defined derivative.
            Node::Min(a, b) | Node::Max(a, b) => {
                let sa = a.stride(var);
                let sb = b.stride(var);
                if sa.exists() && sa == sb { sa } else { OptionalRational::unknown() }
            }
        }
    }
}

/// When both expressions are linear in the same variable with the same
/// coefficient, they never cross; min/max reduce to comparing the
/// constants, which this returns.
fn parallel_linear(a: &Expr, b: &Expr) -> Option<(i64, i64)> {
    let (ca, ka, va) = a.linear_parts()?;
    let (cb, kb, vb) = b.linear_parts()?;
    if ca == cb && (va == vb || ca == 0) { Some((ka, kb)) } else { None }
}

fn combine_affine(a: Affine, b: Affine, sign: i64) -> Option<Affine> {
    let var = match (a.var, b.var) {
        (Some(x), Some(y)) if x != y => return None,
        (Some(x), Some(_)) | (Some(x), None) => Some(x),
        (None, y) => y,
    };
    Some(Affine { coeff: a.coeff + sign * b.coeff, constant: a.constant + sign * b.constant, var })
}

fn min_of(exprs: &[Expr]) -> Expr {
    let mut it = exprs.iter();
    let first = it.next().cloned().unwrap_or_else(|| Expr::constant(0));
    it.fold(first, |acc, e| Expr::min(&acc, e))
}

fn max_of(exprs: &[Expr]) -> Expr {
    let mut it = exprs.iter();
    let first = it.next().cloned().unwrap_or_else(|| Expr::constant(0));
    it.fold(first, |acc, e| Expr::max(&acc, e))
}

impl fmt::Display for Expr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &*self.0 {
            Node::Var(v) => write!(f, "v{v}"),
            Node::Const(c) => write!(f, "{c}"),
            Node::Add(a, b) => write!(f, "({a} + {b})"),
            Node::Sub(a, b) => write!(f, "({a} - {b})"),
            Node::Mul(a, b) => write!(f, "({a}*{b})"),
            Node::Div(a, b) => write!(f, "({a}/{b})"),
            Node::Min(a, b) => write!(f, "min({a}, {b})"),
            Node::Max(a, b) => write!(f, "max({a}, {b})"),
        }
    }
}
