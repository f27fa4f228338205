use crate::dag::FunctionDAG;
use crate::error::Error;
use crate::expr::Expr;
use crate::pipeline::{ComputedBounds, Pipeline, ScalarType, Target, ValueExpr};
use crate::span::Span;
use crate::test::helpers::{blur_pipeline, diamond, producer_consumer, reduction, resample, v};

fn build(p: &Pipeline, outputs: &[usize]) -> FunctionDAG {
    FunctionDAG::new(p, outputs, &Target::default()).expect("pipeline should analyze")
}

#[test]
fn ids_are_dense_and_reverse_realization_ordered() {
    let (p, outs) = blur_pipeline();
    let dag = build(&p, &outs);

    assert_eq!(dag.nodes.len(), 4);
    for (i, node) in dag.nodes.iter().enumerate() {
        assert_eq!(node.id, i);
        assert_eq!(node.max_id, 4);
    }
    // Outputs first, inputs last.
    assert_eq!(dag.nodes[0].name, "blur_y");
    assert!(dag.nodes[0].is_output);
    assert!(dag.nodes[3].is_input);

    // Dense stage ids, and the stage map is total.
    assert_eq!(dag.num_stages(), 3);
    for id in 0..dag.num_stages() {
        let stage = dag.stage_by_id(id);
        assert_eq!(stage.id, id);
        assert_eq!(stage.max_id, 3);
        assert_eq!(dag.stage_id_to_node(id).id, stage.node);
    }

    // Consumers come strictly before producers.
    for e in &dag.edges {
        assert!(e.consumer.node < e.producer, "edge must point backward in realization order");
    }
}

#[test]
fn dependencies_are_transitively_closed() {
    let (p, outs) = blur_pipeline();
    let dag = build(&p, &outs);

    for e in &dag.edges {
        let consumer = dag.stage(e.consumer);
        assert!(consumer.downstream_of(e.producer));
        for pstage in &dag.nodes[e.producer].stages {
            for (n, &dep) in pstage.dependencies.iter().enumerate() {
                if dep {
                    assert!(consumer.downstream_of(n), "dependencies must be transitively closed");
                }
            }
        }
    }

    // The output is downstream of everything else.
    let out_stage = &dag.nodes[0].stages[0];
    for n in 1..dag.nodes.len() {
        assert!(out_stage.downstream_of(n));
    }
    assert!(!out_stage.downstream_of(0));
}

#[test]
fn call_analysis_flags() {
    let (p, outs) = blur_pipeline();
    let dag = build(&p, &outs);

    let clamped = dag.nodes.iter().find(|n| n.name == "clamped").unwrap();
    assert!(clamped.is_boundary_condition);
    assert!(!clamped.is_pointwise);

    let blur_x = dag.nodes.iter().find(|n| n.name == "blur_x").unwrap();
    assert!(!blur_x.is_pointwise);
    assert!(!blur_x.is_boundary_condition);

    let (p, outs) = producer_consumer();
    let dag = build(&p, &outs);
    let out = &dag.nodes[0];
    assert!(out.is_pointwise);
    assert!(!out.is_wrapper); // multiplies, so more than a bare call

    // A bare identity call is a wrapper.
    let mut p = Pipeline::new();
    let g = p.func("g", 1, ScalarType::Float32);
    p.define(g, ValueExpr::Const(1.0)).unwrap();
    let w = p.func("w", 1, ScalarType::Float32);
    p.define(w, ValueExpr::load(g, vec![v(0)])).unwrap();
    p.set_estimate(w, 0, 0, 16).unwrap();
    let dag = build(&p, &[w]);
    assert!(dag.nodes[0].is_wrapper);
    assert!(dag.nodes[0].is_pointwise);
}

#[test]
fn region_computed_fast_paths() {
    let (p, outs) = blur_pipeline();
    let dag = build(&p, &outs);

    let clamped = dag.nodes.iter().find(|n| n.name == "clamped").unwrap();
    assert!(clamped.region_computed_all_common_cases);
    let info = &clamped.region_computed[0];
    assert!(info.equals_union_of_required_with_constants);
    assert_eq!((info.c_min, info.c_max), (0, 1023));

    // Union with the recorded constants, exactly.
    let required = [Span::new(10, 20, true), Span::new(5, 6, false)];
    let mut computed = [Span::empty(); 2];
    clamped.required_to_computed(&required, &mut computed);
    assert_eq!(computed[0], Span::new(0, 1023, true));
    assert_eq!(computed[1], Span::new(0, 767, false));

    let blur_x = dag.nodes.iter().find(|n| n.name == "blur_x").unwrap();
    assert!(blur_x.region_computed[0].equals_required);
}

#[test]
fn region_computed_general_path() {
    let mut p = Pipeline::new();
    let scan = p.func("scan", 1, ScalarType::Float32);
    p.define(scan, ValueExpr::Const(0.0)).unwrap();
    p.set_computed_bounds(scan, 0, ComputedBounds::PaddedBy { before: 2, after: 3 }).unwrap();
    let out = p.func("out", 1, ScalarType::Float32);
    p.define(out, ValueExpr::load(scan, vec![v(0)])).unwrap();
    p.set_estimate(out, 0, 0, 10).unwrap();
    let dag = build(&p, &[out]);

    let scan = dag.nodes.iter().find(|n| n.name == "scan").unwrap();
    let info = &scan.region_computed[0];
    assert!(!info.equals_required);
    assert!(!info.equals_union_of_required_with_constants);
    assert!(!scan.region_computed_all_common_cases);

    let mut computed = [Span::empty(); 1];
    scan.required_to_computed(&[Span::new(0, 9, true)], &mut computed);
    assert_eq!((computed[0].min(), computed[0].max()), (-2, 12));
}

#[test]
fn loop_metadata_and_rvars() {
    let (p, outs) = reduction();
    let dag = build(&p, &outs);

    let f = &dag.nodes[0];
    assert_eq!(f.stages.len(), 2);
    assert_eq!(f.stages[1].name, "f.update(0)");
    assert_eq!(f.stages[1].sanitized_name, "f_update_0_");

    // Update loops: rvar innermost, then the pure dim.
    let update = &f.stages[1];
    assert_eq!(update.loops.len(), 2);
    assert!(update.loops[0].rvar);
    assert!(update.loops[0].bounds_are_constant);
    assert_eq!((update.loops[0].c_min, update.loops[0].c_max), (0, 9));
    assert!(update.loops[1].pure);
    assert_eq!(update.loops[1].pure_dim, Some(0));
    assert!(update.loops[1].equals_region_computed);

    assert_eq!(update.loop_index_of_var("r0"), Some(0));
    assert_eq!(update.loop_index_of_var("v0"), Some(1));
    assert_eq!(update.loop_index_of_var("nope"), None);

    let computed = [Span::new(0, 63, true)];
    let mut loops = [Span::empty(); 2];
    f.loop_nest_for_region(1, &computed, &mut loops);
    assert_eq!(loops[0], Span::new(0, 9, true));
    assert_eq!(loops[1], Span::new(0, 63, true));

    // The self-load is the reduction, not an edge.
    for &e in &update.incoming_edges {
        assert_ne!(dag.edges[e].producer, f.id);
    }

    // The update is downstream of everything its pure stage is.
    let g = dag.nodes.iter().find(|n| n.name == "g").unwrap();
    assert!(update.downstream_of(g.id));
}

#[test]
fn stencil_edges_are_affine_and_merge_jacobians() {
    let (p, outs) = blur_pipeline();
    let dag = build(&p, &outs);

    let blur_x = dag.nodes.iter().find(|n| n.name == "blur_x").unwrap();
    let edge = &dag.edges[blur_x.stages[0].incoming_edges[0]];
    assert_eq!(dag.nodes[edge.producer].name, "clamped");

    assert_eq!(edge.calls, 3);
    assert!(edge.all_bounds_affine);
    // Three call sites with identical strides share one jacobian.
    assert_eq!(edge.load_jacobians.len(), 1);
    let j = &edge.load_jacobians[0];
    assert_eq!(j.count(), 3);
    assert_eq!(j.get(0, 0), 1);
    assert_eq!(j.get(0, 1), 0);
    assert_eq!(j.get(1, 1), 1);
    assert!(edge.all_load_jacobian_coeffs_exist());

    let (min0, max0) = &edge.bounds[0];
    assert!(min0.affine && max0.affine);
    assert_eq!(min0.coeff, 1);
    assert_eq!(min0.constant, -1);
    assert!(!min0.uses_max);
    assert_eq!(max0.constant, 1);
    assert!(max0.uses_max);
}

#[test]
fn expand_footprint_stencil_and_monotonicity() {
    let (p, outs) = blur_pipeline();
    let dag = build(&p, &outs);

    let blur_x = dag.nodes.iter().find(|n| n.name == "blur_x").unwrap();
    let edge = &dag.edges[blur_x.stages[0].incoming_edges[0]];

    let consumer_loop = [Span::new(0, 99, true), Span::new(0, 49, true)];
    let mut required = [Span::empty(); 2];
    edge.expand_footprint(&consumer_loop, &mut required);
    assert_eq!((required[0].min(), required[0].max()), (-1, 100));
    assert_eq!((required[1].min(), required[1].max()), (0, 49));

    // Widening the consumer loop only widens the footprint.
    let wider = [Span::new(-10, 199, true), Span::new(0, 49, true)];
    let mut wider_required = required;
    edge.expand_footprint(&wider, &mut wider_required);
    assert!(wider_required[0].min() <= required[0].min());
    assert!(wider_required[0].max() >= required[0].max());
}

#[test]
fn fractional_and_strided_jacobians() {
    let (p, outs) = resample();
    let dag = build(&p, &outs);

    let out = &dag.nodes[0];
    let edge = &dag.edges[out.stages[0].incoming_edges[0]];
    assert_eq!(edge.calls, 2);
    // x/2 and 3x+1 have different strides, so they don't merge.
    assert_eq!(edge.load_jacobians.len(), 2);
    let strides: Vec<_> = edge.load_jacobians.iter().map(|j| j.get(0, 0)).collect();
    assert!(strides.contains(&crate::rational::OptionalRational::new(1, 2)));
    assert!(strides.contains(&crate::rational::OptionalRational::new(3, 1)));

    // Division defeats the affine analysis; the general path still evaluates.
    assert!(!edge.all_bounds_affine);
    let consumer_loop = [Span::new(0, 99, true)];
    let mut required = [Span::empty(); 1];
    edge.expand_footprint(&consumer_loop, &mut required);
    assert_eq!((required[0].min(), required[0].max()), (0, 298));
}

#[test]
fn store_jacobian_is_the_identity_on_pure_dims() {
    let (p, outs) = reduction();
    let dag = build(&p, &outs);
    let f = &dag.nodes[0];

    let pure = f.stages[0].store_jacobian.as_ref().unwrap();
    assert_eq!(pure.get(0, 0), 1);

    // Update stage: storage dim 0 varies with the pure loop, not the rvar.
    let update = f.stages[1].store_jacobian.as_ref().unwrap();
    assert_eq!(update.get(0, 0), 0);
    assert_eq!(update.get(0, 1), 1);
}

#[test]
fn vector_sizes_follow_the_narrowest_type() {
    let (p, outs) = producer_consumer();
    let dag = FunctionDAG::new(&p, &outs, &Target { vector_bits: 256 }).unwrap();
    // f32 on a 256-bit target.
    assert_eq!(dag.nodes[0].vector_size, 8);
}

#[test]
fn diamond_has_two_consumers_of_the_producer() {
    let (p, outs) = diamond();
    let dag = build(&p, &outs);
    assert_eq!(dag.nodes.len(), 4);
    assert_eq!(dag.num_non_input_nodes, 4);

    let base = dag.nodes.iter().find(|n| n.name == "base").unwrap();
    assert_eq!(base.outgoing_edges.len(), 2);
    let consumers: Vec<_> =
        base.outgoing_edges.iter().map(|&e| dag.nodes[dag.edges[e].consumer.node].name.clone()).collect();
    assert!(consumers.contains(&"left".to_string()));
    assert!(consumers.contains(&"right".to_string()));
}

#[test]
fn featurization_counts_ops_by_class() {
    use crate::features::OpClass;

    let (p, outs) = producer_consumer();
    let dag = build(&p, &outs);
    let out_features = &dag.nodes[0].stages[0].features;
    let f32_class = ScalarType::Float32.class_index();

    assert_eq!(out_features.op_histogram[OpClass::Mul.index()][f32_class], 1);
    assert_eq!(out_features.op_histogram[OpClass::Load.index()][f32_class], 1);
    assert_eq!(out_features.op_histogram[OpClass::Store.index()][f32_class], 1);
    assert_eq!(out_features.load_pointwise[f32_class], 1);
    assert_eq!(out_features.load_strided[f32_class], 0);
    assert_eq!(out_features.types_in_use[f32_class], 1);

    // Strided loads classify away from pointwise.
    let (p, outs) = resample();
    let dag = build(&p, &outs);
    let out_features = &dag.nodes[0].stages[0].features;
    assert_eq!(out_features.load_pointwise[f32_class], 0);
    assert_eq!(out_features.load_strided[f32_class] + out_features.load_gather[f32_class], 2);
}

#[test]
fn construction_errors() {
    // No outputs.
    let p = Pipeline::new();
    assert!(matches!(FunctionDAG::new(&p, &[], &Target::default()), Err(Error::NoOutputs)));

    // Output without estimates.
    let mut p = Pipeline::new();
    let f = p.func("f", 1, ScalarType::Float32);
    p.define(f, ValueExpr::Const(0.0)).unwrap();
    assert!(matches!(FunctionDAG::new(&p, &[f], &Target::default()), Err(Error::MissingEstimate { .. })));

    // Called but never defined.
    let mut p = Pipeline::new();
    let ghost = p.func("ghost", 1, ScalarType::Float32);
    let out = p.func("out", 1, ScalarType::Float32);
    p.define(out, ValueExpr::load(ghost, vec![v(0)])).unwrap();
    p.set_estimate(out, 0, 0, 8).unwrap();
    assert!(matches!(FunctionDAG::new(&p, &[out], &Target::default()), Err(Error::NoPureDefinition { .. })));

    // A cycle through two funcs.
    let mut p = Pipeline::new();
    let a = p.func("a", 1, ScalarType::Float32);
    let b = p.func("b", 1, ScalarType::Float32);
    p.define(a, ValueExpr::load(b, vec![v(0)])).unwrap();
    p.define(b, ValueExpr::load(a, vec![v(0)])).unwrap();
    p.set_estimate(a, 0, 0, 8).unwrap();
    assert!(matches!(FunctionDAG::new(&p, &[a], &Target::default()), Err(Error::PipelineCycle { .. })));

    // Wrong load arity.
    let mut p = Pipeline::new();
    let g = p.func("g", 2, ScalarType::Float32);
    p.define(g, ValueExpr::Const(0.0)).unwrap();
    let out = p.func("out", 1, ScalarType::Float32);
    p.define(out, ValueExpr::load(g, vec![Expr::var(0)])).unwrap();
    p.set_estimate(out, 0, 0, 8).unwrap();
    assert!(matches!(FunctionDAG::new(&p, &[out], &Target::default()), Err(Error::LoadArityMismatch { .. })));
}
