//! The cost-model interface.
//!
//! The search treats cost models as black boxes behind [`CostModel`]: reset,
//! receive the per-pipeline featurization once per pass, accept states in
//! batches, and populate each state's cost on [`CostModel::evaluate_costs`].
//! One reference implementation, [`FootprintCostModel`], ships with the
//! crate so the engine and its tests have a deterministic model to run
//! against; real deployments slot in a learned model behind the same trait.

use std::rc::Rc;

use tessera_ir::{FunctionDAG, HEAD1_H, HEAD1_W};

use crate::config::MachineParams;
use crate::error::Result;
use crate::state::State;

/// Per-stage features of one schedule, indexed by global stage id. Stages of
/// unscheduled or input nodes stay zeroed.
#[derive(Debug, Clone, Copy, Default)]
pub struct StageScheduleFeatures {
    /// Total points computed across the stage's loop nest.
    pub points_computed: f64,
    /// Bytes written when producing the computed region.
    pub bytes_at_production: f64,
    /// Bytes pulled in from non-inlined producers over the whole loop nest.
    pub load_bytes: f64,
    /// Bytes touched per tile (footprints over one tile's loop spans).
    pub working_set_bytes: f64,
    /// Worst access pattern across load jacobians: 0 contiguous, 1 strided,
    /// 2 gather.
    pub load_stride_class: f64,
    /// Sum of jacobian counts, including loads composed through inlined
    /// producers.
    pub load_multiplicity: f64,
    /// Calls to this stage made at consumer sites because the func is
    /// inlined.
    pub inlined_calls: f64,
    /// Total ops executed (per-point ops times points).
    pub op_count: f64,
    pub vector_size: f64,
    pub innermost_extent: f64,
}

/// Features for every stage of the DAG.
#[derive(Debug, Clone, Default)]
pub struct ScheduleFeatures {
    pub per_stage: Vec<StageScheduleFeatures>,
}

impl ScheduleFeatures {
    pub fn new(num_stages: usize) -> Self {
        Self { per_stage: vec![StageScheduleFeatures::default(); num_stages] }
    }
}

/// The pipeline featurization tensor: `HEAD1_W x HEAD1_H` per non-input
/// stage.
#[derive(Debug, Clone)]
pub struct PipelineFeatureTensor {
    data: Vec<f32>,
    num_stages: usize,
}

impl PipelineFeatureTensor {
    pub fn new(num_stages: usize) -> Self {
        Self { data: vec![0.0; HEAD1_W * HEAD1_H * num_stages], num_stages }
    }

    pub fn num_stages(&self) -> usize {
        self.num_stages
    }

    pub fn at(&self, w: usize, h: usize, stage: usize) -> f32 {
        self.data[(stage * HEAD1_W + w) * HEAD1_H + h]
    }

    fn stage_block_mut(&mut self, stage: usize) -> &mut [f32] {
        let len = HEAD1_W * HEAD1_H;
        &mut self.data[stage * len..(stage + 1) * len]
    }
}

/// The interface a cost model exposes to the search.
pub trait CostModel {
    /// Discard any prior pipeline state.
    fn reset(&mut self);

    /// Called once per pass, before any state is enqueued.
    fn set_pipeline_features(&mut self, features: &PipelineFeatureTensor, parallelism: i32);

    /// Record a pending evaluation. Costs must not be read before
    /// [`CostModel::evaluate_costs`] runs.
    fn enqueue_state(&mut self, state: &Rc<State>, features: &ScheduleFeatures);

    /// Batch call that populates `cost` and `cost_per_stage` on every state
    /// enqueued since the last evaluation.
    fn evaluate_costs(&mut self) -> Result<()>;
}

/// Fill the pipeline feature tensor from the DAG and hand it to the model.
/// The leading type-mask fields of each stage's featurization are skipped;
/// stages of one node are visited update-first, matching the stage order the
/// per-schedule features use.
pub fn configure_pipeline_features(dag: &FunctionDAG, machine: &MachineParams, cost_model: &mut dyn CostModel) {
    cost_model.reset();
    let num_stages: usize = dag.nodes.iter().filter(|n| !n.is_input).map(|n| n.stages.len()).sum();
    let mut tensor = PipelineFeatureTensor::new(num_stages);
    let mut stage = 0;
    for node in &dag.nodes {
        if node.is_input {
            continue;
        }
        for s in node.stages.iter().rev() {
            s.features.flatten_without_type_mask(tensor.stage_block_mut(stage));
            stage += 1;
        }
    }
    assert_eq!(stage, num_stages, "stage count drifted while building the feature tensor");
    cost_model.set_pipeline_features(&tensor, machine.parallelism);
}

/// A deterministic analytic cost model: compute cost plus memory traffic,
/// weighted by access pattern and how the working set sits in cache.
#[derive(Debug, Default)]
pub struct FootprintCostModel {
    parallelism: i32,
    queued: Vec<(Rc<State>, ScheduleFeatures)>,
}

impl FootprintCostModel {
    pub fn new() -> Self {
        Self::default()
    }

    fn stage_cost(&self, f: &StageScheduleFeatures) -> f64 {
        if f.points_computed == 0.0 && f.inlined_calls == 0.0 {
            return 0.0;
        }
        let compute = (f.op_count + f.inlined_calls) / f.vector_size.max(1.0);
        let stride_penalty = match f.load_stride_class as i64 {
            0 => 1.0,
            1 => 4.0,
            _ => 16.0,
        };
        let memory = f.load_bytes * stride_penalty * f.load_multiplicity.max(1.0) + f.bytes_at_production;
        let cache_factor = if f.working_set_bytes > 512.0 * 1024.0 {
            2.0
        } else if f.working_set_bytes > 0.0 && f.working_set_bytes < 4096.0 {
            1.5
        } else {
            1.0
        };
        (compute + memory) * cache_factor / self.parallelism.max(1) as f64
    }
}

impl CostModel for FootprintCostModel {
    fn reset(&mut self) {
        self.queued.clear();
    }

    fn set_pipeline_features(&mut self, _features: &PipelineFeatureTensor, parallelism: i32) {
        self.parallelism = parallelism;
    }

    fn enqueue_state(&mut self, state: &Rc<State>, features: &ScheduleFeatures) {
        self.queued.push((Rc::clone(state), features.clone()));
    }

    fn evaluate_costs(&mut self) -> Result<()> {
        let queued = std::mem::take(&mut self.queued);
        for (state, features) in queued {
            let per_stage: Vec<f64> = features.per_stage.iter().map(|f| self.stage_cost(f)).collect();
            state.set_cost(per_stage.iter().sum());
            state.set_cost_per_stage(per_stage);
        }
        Ok(())
    }
}
