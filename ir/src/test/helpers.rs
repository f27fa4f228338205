//! Pipeline builders shared by the analysis tests.

use crate::expr::Expr;
use crate::pipeline::{ComputedBounds, FuncId, Pipeline, ScalarType, ValueExpr};

pub fn v(d: usize) -> Expr {
    Expr::var(d)
}

fn clamp(e: Expr, lo: i64, hi: i64) -> Expr {
    Expr::max(&Expr::min(&e, &Expr::constant(hi)), &Expr::constant(lo))
}

/// input -> clamped boundary condition -> horizontal blur -> vertical blur.
pub fn blur_pipeline() -> (Pipeline, Vec<FuncId>) {
    let mut p = Pipeline::new();
    let input = p.input("input", 2, ScalarType::Float32);

    let clamped = p.func("clamped", 2, ScalarType::Float32);
    p.define(clamped, ValueExpr::load(input, vec![clamp(v(0), 0, 1023), clamp(v(1), 0, 767)])).unwrap();
    p.set_computed_bounds(clamped, 0, ComputedBounds::UnionWith { c_min: 0, c_max: 1023 }).unwrap();
    p.set_computed_bounds(clamped, 1, ComputedBounds::UnionWith { c_min: 0, c_max: 767 }).unwrap();

    let blur_x = p.func("blur_x", 2, ScalarType::Float32);
    p.define(
        blur_x,
        ValueExpr::div(
            ValueExpr::add(
                ValueExpr::add(
                    ValueExpr::load(clamped, vec![Expr::sub(&v(0), &Expr::constant(1)), v(1)]),
                    ValueExpr::load(clamped, vec![v(0), v(1)]),
                ),
                ValueExpr::load(clamped, vec![Expr::add(&v(0), &Expr::constant(1)), v(1)]),
            ),
            ValueExpr::Const(3.0),
        ),
    )
    .unwrap();

    let blur_y = p.func("blur_y", 2, ScalarType::Float32);
    p.define(
        blur_y,
        ValueExpr::div(
            ValueExpr::add(
                ValueExpr::add(
                    ValueExpr::load(blur_x, vec![v(0), Expr::sub(&v(1), &Expr::constant(1))]),
                    ValueExpr::load(blur_x, vec![v(0), v(1)]),
                ),
                ValueExpr::load(blur_x, vec![v(0), Expr::add(&v(1), &Expr::constant(1))]),
            ),
            ValueExpr::Const(3.0),
        ),
    )
    .unwrap();
    p.set_estimate(blur_y, 0, 0, 1024).unwrap();
    p.set_estimate(blur_y, 1, 0, 768).unwrap();

    (p, vec![blur_y])
}

/// A single generator func with no inputs.
pub fn single_pointwise() -> (Pipeline, Vec<FuncId>) {
    let mut p = Pipeline::new();
    let f = p.func("f", 2, ScalarType::Float32);
    p.define(f, ValueExpr::Const(1.0)).unwrap();
    p.set_estimate(f, 0, 0, 256).unwrap();
    p.set_estimate(f, 1, 0, 256).unwrap();
    (p, vec![f])
}

/// generator -> pointwise consumer (the consumer is the output).
pub fn producer_consumer() -> (Pipeline, Vec<FuncId>) {
    let mut p = Pipeline::new();
    let g = p.func("g", 2, ScalarType::Float32);
    p.define(g, ValueExpr::Const(2.0)).unwrap();
    let out = p.func("out", 2, ScalarType::Float32);
    p.define(out, ValueExpr::mul(ValueExpr::load(g, vec![v(0), v(1)]), ValueExpr::Const(3.0))).unwrap();
    p.set_estimate(out, 0, 0, 512).unwrap();
    p.set_estimate(out, 1, 0, 512).unwrap();
    (p, vec![out])
}

/// base feeding two pointwise branches joined by a sink.
pub fn diamond() -> (Pipeline, Vec<FuncId>) {
    let mut p = Pipeline::new();
    let base = p.func("base", 2, ScalarType::Float32);
    p.define(base, ValueExpr::Const(1.0)).unwrap();
    let left = p.func("left", 2, ScalarType::Float32);
    p.define(left, ValueExpr::add(ValueExpr::load(base, vec![v(0), v(1)]), ValueExpr::Const(1.0))).unwrap();
    let right = p.func("right", 2, ScalarType::Float32);
    p.define(right, ValueExpr::mul(ValueExpr::load(base, vec![v(0), v(1)]), ValueExpr::Const(2.0))).unwrap();
    let sink = p.func("sink", 2, ScalarType::Float32);
    p.define(
        sink,
        ValueExpr::add(ValueExpr::load(left, vec![v(0), v(1)]), ValueExpr::load(right, vec![v(0), v(1)])),
    )
    .unwrap();
    p.set_estimate(sink, 0, 0, 128).unwrap();
    p.set_estimate(sink, 1, 0, 128).unwrap();
    (p, vec![sink])
}

/// 1-d producer read at a half-rate and a strided coordinate.
pub fn resample() -> (Pipeline, Vec<FuncId>) {
    let mut p = Pipeline::new();
    let g = p.func("g", 1, ScalarType::Float32);
    p.define(g, ValueExpr::Const(1.0)).unwrap();
    let out = p.func("out", 1, ScalarType::Float32);
    p.define(
        out,
        ValueExpr::add(
            ValueExpr::load(g, vec![Expr::div(&v(0), &Expr::constant(2))]),
            ValueExpr::load(g, vec![Expr::add(&Expr::mul(&v(0), &Expr::constant(3)), &Expr::constant(1))]),
        ),
    )
    .unwrap();
    p.set_estimate(out, 0, 0, 100).unwrap();
    (p, vec![out])
}

/// A func with a pure definition and one reduction update reading another
/// func over the reduction domain.
pub fn reduction() -> (Pipeline, Vec<FuncId>) {
    let mut p = Pipeline::new();
    let g = p.func("g", 1, ScalarType::Float32);
    p.define(g, ValueExpr::Const(1.0)).unwrap();
    let f = p.func("f", 1, ScalarType::Float32);
    p.define(f, ValueExpr::Const(0.0)).unwrap();
    // f(x) = f(x) + g(r), r in [0, 9]. Var 1 is the rvar of this stage.
    p.update(
        f,
        vec![(0, 9)],
        ValueExpr::add(ValueExpr::load(f, vec![v(0)]), ValueExpr::load(g, vec![v(1)])),
    )
    .unwrap();
    p.set_estimate(f, 0, 0, 64).unwrap();
    (p, vec![f])
}
