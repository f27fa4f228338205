use std::collections::HashSet;
use std::rc::Rc;

use rand::SeedableRng;
use rand::rngs::StdRng;

use crate::beam::{ProgressBar, find_best_schedule, optimal_schedule_pass};
use crate::config::{MachineParams, SearchParams};
use crate::cost::FootprintCostModel;
use crate::error::Error;
use crate::interactive::ScriptedSelector;
use crate::state::{FeaturizationMemo, FreezeMaps};
use crate::stats::Statistics;
use crate::test::helpers::{EvenChildPoisonModel, FailingCostModel, ancestor_chain, diamond, single_node, two_node};

#[test]
fn greedy_single_node_terminates_in_two_decisions() {
    let dag = single_node();
    let params = SearchParams::builder().beam_size(1).build();
    let mut model = FootprintCostModel::new();

    let (best, stats) = find_best_schedule(&dag, &params, &MachineParams::default(), &mut model, None).unwrap();
    assert_eq!(best.num_decisions_made, 2);
    assert!(best.is_terminal(&dag));
    assert!(best.cost() > 0.0);
    assert!(stats.num_states_added > 0);
    assert!(stats.num_schedules_enqueued > 0);
}

#[test]
fn pass_winners_do_not_get_worse_across_passes() {
    let dag = two_node();
    let params = SearchParams::builder().beam_size(8).num_passes(5).build();
    let machine = MachineParams::default();
    let mut model = FootprintCostModel::new();
    let mut rng = StdRng::seed_from_u64(0);
    let mut permitted = HashSet::new();
    let mut stats = Statistics::default();
    let mut memo = FeaturizationMemo::new();
    let freeze = FreezeMaps::new();

    let mut costs = Vec::new();
    for pass_idx in 0..5 {
        let mut tick = ProgressBar::new();
        let winner = optimal_schedule_pass(
            &dag,
            &params,
            &machine,
            &mut model,
            &mut rng,
            params.beam_size,
            pass_idx,
            5,
            &mut tick,
            &mut permitted,
            &mut stats,
            &freeze,
            &mut memo,
            None,
        )
        .unwrap();
        assert!(winner.is_terminal(&dag));
        costs.push(winner.cost());
    }
    for w in costs.windows(2) {
        assert!(w[1] <= w[0] + 1e-9, "pass winners must not get worse: {costs:?}");
    }
}

#[test]
fn interactive_diamond_runs_one_pass_to_a_terminal() {
    let dag = diamond();
    let params = SearchParams::builder().interactive(true).beam_size(8).build();
    assert_eq!(params.effective_num_passes(), 1);

    let mut model = FootprintCostModel::new();
    let mut selector = ScriptedSelector::always(0);
    let (best, _) =
        find_best_schedule(&dag, &params, &MachineParams::default(), &mut model, Some(&mut selector)).unwrap();
    assert!(best.is_terminal(&dag));
    assert_eq!(best.num_decisions_made, 2 * dag.nodes.len());
}

#[test]
fn poisoned_even_children_never_reach_the_winner_chain() {
    let dag = two_node();
    let params = SearchParams::builder().beam_size(2).num_passes(1).build();
    let mut model = EvenChildPoisonModel::default();

    let (best, _) = find_best_schedule(&dag, &params, &MachineParams::default(), &mut model, None).unwrap();
    assert!(best.cost().is_finite());

    for ancestor in ancestor_chain(&best) {
        let (index, siblings) = model.index_and_siblings(&ancestor).expect("every state was enqueued");
        if siblings >= 2 {
            assert_eq!(index % 2, 1, "a poisoned even-indexed child survived into the winner chain");
        }
    }
}

#[test]
fn full_dropout_still_terminates() {
    let dag = two_node();
    let params = SearchParams::builder().beam_size(2).random_dropout_percent(0.0).random_seed(7).build();
    let mut model = FootprintCostModel::new();

    let (best, _) = find_best_schedule(&dag, &params, &MachineParams::default(), &mut model, None).unwrap();
    assert!(best.is_terminal(&dag));
}

#[test]
fn wider_beams_do_not_lose_to_greedy() {
    let dag = two_node();
    let machine = MachineParams::default();

    let params = SearchParams::builder().beam_size(1).build();
    let mut model = FootprintCostModel::new();
    let (greedy, _) = find_best_schedule(&dag, &params, &machine, &mut model, None).unwrap();

    let params = SearchParams::builder().beam_size(8).num_passes(1).build();
    let mut model = FootprintCostModel::new();
    let (wide, _) = find_best_schedule(&dag, &params, &machine, &mut model, None).unwrap();

    assert!(wide.cost() <= greedy.cost() + 1e-9);
}

#[test]
fn fixed_seed_makes_the_search_deterministic() {
    let dag = two_node();
    let machine = MachineParams::default();
    let params = SearchParams::builder().beam_size(4).random_dropout_percent(50.0).random_seed(42).build();

    let mut model = FootprintCostModel::new();
    let (a, _) = find_best_schedule(&dag, &params, &machine, &mut model, None).unwrap();
    let mut model = FootprintCostModel::new();
    let (b, _) = find_best_schedule(&dag, &params, &machine, &mut model, None).unwrap();

    assert_eq!(a.cost().to_bits(), b.cost().to_bits());
    assert_eq!(a.structural_hash(16), b.structural_hash(16));
    assert_eq!(a.num_decisions_made, b.num_decisions_made);
}

#[test]
fn cost_model_failure_aborts_the_search() {
    let dag = single_node();
    let params = SearchParams::builder().beam_size(2).build();
    let mut model = FailingCostModel;

    let result = find_best_schedule(&dag, &params, &MachineParams::default(), &mut model, None);
    assert!(matches!(result, Err(Error::CostModel { .. })));
}

#[test]
fn multi_pass_beam_search_completes_with_penalization() {
    let dag = diamond();
    let params = SearchParams::builder().beam_size(4).num_passes(3).build();
    let mut model = FootprintCostModel::new();

    let (best, stats) = find_best_schedule(&dag, &params, &MachineParams::default(), &mut model, None).unwrap();
    assert!(best.is_terminal(&dag));
    assert!(best.cost().is_finite());
    // Later passes reuse featurizations of structures seen earlier.
    assert!(stats.num_memoization_hits > 0);

    // Every state in the winner chain makes exactly one more decision.
    let chain = ancestor_chain(&best);
    assert_eq!(chain.len(), 2 * dag.nodes.len());
    for pair in chain.windows(2) {
        assert_eq!(pair[0].num_decisions_made, pair[1].num_decisions_made + 1);
    }
}
