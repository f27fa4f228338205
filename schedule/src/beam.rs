//! The coarse-to-fine beam search.
//!
//! [`optimal_schedule_pass`] runs one pass of beam search over the sequence
//! of scheduling decisions; [`optimal_schedule`] drives the coarse-to-fine
//! passes, the optional freeze pre-pass, and best-of-passes tracking;
//! [`find_best_schedule`] is the library entry point that seeds the RNG and
//! reports statistics.
//!
//! Expansion is strictly depth-by-decision: every state at decision level
//! `d` is expanded and scored before any state at level `d + 1` is popped.

use std::collections::{HashMap, HashSet};
use std::rc::Rc;
use std::time::Instant;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tessera_ir::{FunctionDAG, NodeId};

use crate::config::{MachineParams, SearchParams};
use crate::cost::{CostModel, configure_pipeline_features};
use crate::error::Result;
use crate::interactive::SelectionPolicy;
use crate::queue::StateQueue;
use crate::state::{FeaturizationMemo, FreezeMaps, State};
use crate::stats::Statistics;

// ============================================================================
// RANDOM DROPOUT
// ============================================================================

/// Decide whether to drop a beam state. The configured percentage is the
/// chance of never rejecting any state, so it is amortized across the number
/// of decisions a complete schedule needs.
fn random_dropout(rng: &mut StdRng, params: &SearchParams, num_decisions: usize) -> bool {
    let threshold = params.random_dropout_percent.max(0.0);
    if threshold >= 100.0 {
        return false;
    }
    let t = (threshold / 100.0).powf(1.0 / num_decisions.max(1) as f64) * 100.0;
    let r = rng.random_range(0..100u32) as f64;
    r >= t
}

// ============================================================================
// PROGRESS
// ============================================================================

/// Rate-limited progress ticker. The original draws a terminal bar; a
/// library reports through the structured log instead.
#[derive(Debug, Default)]
pub struct ProgressBar {
    counter: u32,
}

impl ProgressBar {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, progress: f64) {
        self.counter += 1;
        if self.counter & 0x3ff != 0 {
            return;
        }
        tracing::trace!(progress = format!("{:.1}%", progress * 100.0), "beam search progress");
    }

    pub fn clear(&mut self) {
        self.counter = 0;
    }
}

// ============================================================================
// SINGLE PASS
// ============================================================================

/// A single pass of coarse-to-fine beam search. Returns the pass winner: the
/// first terminal state popped off the queue, which the heap ordering makes
/// the cheapest one.
///
/// Panics on total mortality (no legal states left) unless
/// `double_beam_on_mortality` is set, in which case the pass restarts with
/// twice the beam.
#[allow(clippy::too_many_arguments)]
pub fn optimal_schedule_pass(
    dag: &FunctionDAG,
    params: &SearchParams,
    machine: &MachineParams,
    cost_model: &mut dyn CostModel,
    rng: &mut StdRng,
    beam_size: usize,
    pass_idx: i32,
    num_passes: usize,
    tick: &mut ProgressBar,
    permitted_hashes: &mut HashSet<u64>,
    stats: &mut Statistics,
    freeze: &FreezeMaps,
    memo: &mut FeaturizationMemo,
    mut selector: Option<&mut dyn SelectionPolicy>,
) -> Result<Rc<State>> {
    let mut beam_size = beam_size;
    'pass: loop {
        configure_pipeline_features(dag, machine, cost_model);

        let mut q = StateQueue::new();
        let mut pending = StateQueue::new();
        q.emplace(State::new_root());

        // Beam search over the sequence of decisions to make.
        loop {
            let mut hashes: HashMap<u64, usize> = HashMap::new();
            q.swap(&mut pending);

            if pending.is_empty() {
                if params.double_beam_on_mortality && beam_size < 1000 {
                    // Total mortality. Restart with a wider beam.
                    tracing::warn!(beam_size, "total mortality, doubling the beam size");
                    beam_size *= 2;
                    continue 'pass;
                }
                panic!("ran out of legal states with beam size {beam_size}");
            }

            if pending.len() > beam_size * 10_000 {
                tracing::warn!(states = pending.len(), "huge number of states generated");
            }

            let mut expanded = 0;
            while expanded < beam_size {
                let Some(state) = pending.pop() else { break };

                if beam_size > 1 && num_passes > 1 && pass_idx >= 0 && !state.penalized() {
                    // Coarse-to-fine hashing: lazily penalize the cost of a
                    // state proportionately to how many states with the same
                    // structural hash this step has already seen.
                    let h1 = state.structural_hash(pass_idx + 1);
                    let h0 = state.structural_hash(pass_idx - 1);
                    let seen = hashes.entry(h1).or_insert(0);
                    *seen += 1;
                    let mut penalty = *seen;
                    if pass_idx > 0 && !permitted_hashes.contains(&h0) {
                        // The coarse hash wasn't blessed by the previous
                        // pass. Heavily penalized, but left in the beam: the
                        // blessed states may all have been quick-rejected
                        // for reasons the hash doesn't capture.
                        penalty += params.impermissible_penalty;
                    }
                    if penalty > 1 {
                        state.set_penalized(true);
                        state.apply_penalty(penalty as f64);
                        // If the state is no longer the best, defer it. The
                        // penalized flag keeps it from being penalized and
                        // deferred again.
                        if let Some(top) = pending.top()
                            && state.cost() > top.cost()
                        {
                            pending.emplace(state);
                            continue;
                        }
                    }
                }

                if pending.len() > 1 && random_dropout(rng, params, dag.nodes.len() * 2) {
                    continue;
                }

                if state.is_terminal(dag) {
                    // The end of the pass. The first state off the priority
                    // queue is the best.
                    let best = Rc::clone(&state);

                    // Bless the reasonable states in the beam as permissible
                    // to revisit in the next pass.
                    if pass_idx >= 0 && ((pass_idx + 1) as usize) < num_passes {
                        let mut blessed = 0;
                        let mut cur = state;
                        while cur.cost() <= (1.0 + params.bless_margin) * best.cost() && blessed < beam_size {
                            let mut walker: Option<&State> = Some(&cur);
                            while let Some(s) = walker {
                                permitted_hashes.insert(s.structural_hash(pass_idx));
                                walker = s.parent.as_deref();
                            }
                            match pending.pop() {
                                Some(next) => cur = next,
                                None => break,
                            }
                            blessed += 1;
                        }
                    }
                    return Ok(best);
                }

                let t0 = Instant::now();
                let mut added = 0u64;
                let mut enqueue = |child: Rc<State>| {
                    let parent_decisions = child.parent.as_ref().map(|p| p.num_decisions_made).unwrap_or(0);
                    assert_eq!(
                        child.num_decisions_made,
                        parent_decisions + 1,
                        "each child must have one more decision than its parent"
                    );
                    let progress = (child.num_decisions_made * beam_size + expanded) as f64
                        / (dag.nodes.len() * beam_size * 2) as f64;
                    tick.set(progress);
                    child.set_penalized(false);
                    added += 1;
                    q.emplace(child);
                };
                state.generate_children(dag, params, cost_model, freeze, memo, stats, &mut enqueue);
                stats.generate_children_time += t0.elapsed();
                stats.num_states_added += added;
                expanded += 1;
            }

            // Drop the rest of the level unconsidered.
            pending.clear();

            let t0 = Instant::now();
            cost_model.evaluate_costs()?;
            stats.cost_model_evaluation_time += t0.elapsed();
            q.resort();

            for j in 0..q.len() {
                if q[j].cost().is_infinite() {
                    tracing::debug!(cost = q[j].cost(), "infinite cost on intermediate state");
                    q[j].dump(dag);
                }
            }

            if let Some(sel) = selector.as_deref_mut() {
                // The user navigates the search space by hand: discard
                // everything except the chosen option.
                let states: Vec<Rc<State>> = q.iter().cloned().collect();
                let choice = sel.select(dag, &states);
                let chosen = Rc::clone(&states[choice]);
                tracing::info!(choice, cost = chosen.cost(), "interactive selection");
                q.clear();
                q.emplace(chosen);
            }
        }
    }
}

// ============================================================================
// FREEZING
// ============================================================================

/// Sort nodes by summed per-stage cost and freeze all but the most
/// expensive `log2(n)` of them into the roles the pre-pass winner gave
/// them: inlined, or pinned compute-root with the chosen loop nest.
pub fn freeze_lowest_cost_stages(dag: &FunctionDAG, best: &State, freeze: &mut FreezeMaps) {
    let mut node_costs: HashMap<NodeId, f64> = HashMap::new();
    {
        let per_stage = best.cost_per_stage();
        for stage_id in 0..dag.num_stages() {
            let node = dag.stage_id_to_node(stage_id);
            if node.is_input {
                continue;
            }
            *node_costs.entry(node.id).or_insert(0.0) += per_stage.get(stage_id).copied().unwrap_or(0.0);
        }
    }

    let mut ids_and_costs: Vec<(NodeId, f64)> = node_costs.into_iter().collect();
    ids_and_costs.sort_by(|a, b| a.1.total_cmp(&b.1).then(a.0.cmp(&b.0)));

    let num_nodes = dag.num_non_input_nodes.max(1);
    let num_to_freeze = num_nodes - num_nodes.ilog2() as usize;
    let mut frozen: HashSet<NodeId> = HashSet::new();
    for &(id, cost) in ids_and_costs.iter().take(num_to_freeze) {
        tracing::info!(node = %dag.nodes[id].name, cost, "freezing node");
        frozen.insert(id);
    }

    best.root.collect_nodes_that_should_be_inlined(&frozen, &mut freeze.inlined_nodes);

    for child in &best.root.children {
        if let Some(id) = child.node
            && frozen.contains(&id)
        {
            let copy = child.deep_copy_with(&|n| n.inlined.clear());
            freeze.compute_root_nodes.entry(id).or_default().push(copy);
            tracing::info!(node = %dag.nodes[id].name, "freezing as compute_root");
        }
    }
}

/// Reborrow the selector for one call without tying its lifetime to the
/// enclosing `Option`'s own (loop-spanning) lifetime.
fn reborrow_selector<'s>(
    selector: &'s mut Option<&mut dyn SelectionPolicy>,
) -> Option<&'s mut dyn SelectionPolicy> {
    match selector {
        Some(s) => Some(&mut **s),
        None => None,
    }
}

// ============================================================================
// COARSE-TO-FINE DRIVER
// ============================================================================

/// Run the coarse-to-fine beam search and return the best state found
/// across all passes (not necessarily the final one).
pub fn optimal_schedule(
    dag: &FunctionDAG,
    params: &SearchParams,
    machine: &MachineParams,
    cost_model: &mut dyn CostModel,
    rng: &mut StdRng,
    stats: &mut Statistics,
    mut selector: Option<&mut dyn SelectionPolicy>,
) -> Result<Rc<State>> {
    let mut permitted_hashes: HashSet<u64> = HashSet::new();
    let mut num_passes = params.effective_num_passes();

    let use_pre_pass = params.freeze_inline_compute_root;
    let mut pass_idx: i32 = if use_pre_pass { -1 } else { 0 };
    if use_pre_pass && num_passes > 1 {
        num_passes -= 1;
    }

    let mut freeze = FreezeMaps::new();
    let mut memo = FeaturizationMemo::new();
    let mut best: Option<Rc<State>> = None;

    while pass_idx < num_passes as i32 {
        let mut tick = ProgressBar::new();
        let pass = optimal_schedule_pass(
            dag,
            params,
            machine,
            cost_model,
            rng,
            params.beam_size,
            pass_idx,
            num_passes,
            &mut tick,
            &mut permitted_hashes,
            stats,
            &freeze,
            &mut memo,
            reborrow_selector(&mut selector),
        )?;
        tick.clear();
        tracing::info!(pass = pass_idx + 1, total = num_passes, cost = pass.cost(), "pass complete");

        if pass_idx == -1 {
            freeze_lowest_cost_stages(dag, &pass, &mut freeze);
        }

        // Track which pass produced the lowest-cost state; it's not
        // necessarily the final one.
        if pass_idx >= 0 && best.as_ref().is_none_or(|b| pass.cost() < b.cost()) {
            best = Some(pass);
        }
        pass_idx += 1;
    }

    let best = best.unwrap_or_else(|| panic!("no search pass produced a state"));
    tracing::info!(cost = best.cost(), "best cost");
    Ok(best)
}

/// The top-level entry point: seed the RNG, run the passes, log and return
/// the statistics together with the winner.
pub fn find_best_schedule(
    dag: &FunctionDAG,
    params: &SearchParams,
    machine: &MachineParams,
    cost_model: &mut dyn CostModel,
    selector: Option<&mut dyn SelectionPolicy>,
) -> Result<(Rc<State>, Statistics)> {
    let start = Instant::now();
    tracing::info!(seed = params.random_seed, beam_size = params.beam_size, "starting schedule search");
    dag.dump();

    let mut rng = StdRng::seed_from_u64(params.random_seed);
    let mut stats = Statistics::default();

    // Interactive mode with no policy supplied drives the terminal.
    let best = if params.interactive && selector.is_none() {
        let mut stdin_selector = crate::interactive::StdinSelector;
        optimal_schedule(dag, params, machine, cost_model, &mut rng, &mut stats, Some(&mut stdin_selector))?
    } else {
        optimal_schedule(dag, params, machine, cost_model, &mut rng, &mut stats, selector)?
    };

    stats.log_summary();
    tracing::info!(elapsed_ms = start.elapsed().as_secs_f64() * 1e3, "schedule search finished");
    Ok((best, stats))
}
