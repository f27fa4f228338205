use std::collections::HashSet;

use rand::SeedableRng;
use rand::rngs::StdRng;

use crate::beam::{ProgressBar, find_best_schedule, freeze_lowest_cost_stages, optimal_schedule_pass};
use crate::config::{MachineParams, SearchParams};
use crate::cost::FootprintCostModel;
use crate::state::{FeaturizationMemo, FreezeMaps};
use crate::stats::Statistics;
use crate::test::helpers::four_node_chain;

#[test]
fn pre_pass_freezes_all_but_log2_nodes() {
    let dag = four_node_chain();
    let params = SearchParams::builder().beam_size(4).build();
    let machine = MachineParams::default();
    let mut model = FootprintCostModel::new();
    let mut rng = StdRng::seed_from_u64(0);
    let mut permitted = HashSet::new();
    let mut stats = Statistics::default();
    let mut memo = FeaturizationMemo::new();
    let empty_freeze = FreezeMaps::new();

    let mut tick = ProgressBar::new();
    let winner = optimal_schedule_pass(
        &dag,
        &params,
        &machine,
        &mut model,
        &mut rng,
        params.beam_size,
        -1,
        5,
        &mut tick,
        &mut permitted,
        &mut stats,
        &empty_freeze,
        &mut memo,
        None,
    )
    .unwrap();
    assert!(winner.is_terminal(&dag));

    let mut freeze = FreezeMaps::new();
    freeze_lowest_cost_stages(&dag, &winner, &mut freeze);

    // 4 nodes: freeze 4 - log2(4) = 2 of them.
    assert_eq!(freeze.num_frozen(), 2);

    // A frozen node has exactly one role.
    for node in &freeze.inlined_nodes {
        assert!(!freeze.compute_root_nodes.contains_key(node));
    }
    for nests in freeze.compute_root_nodes.values() {
        for nest in nests {
            assert!(nest.inlined.is_empty(), "frozen compute_root nests have inlined cleared");
        }
    }
}

#[test]
fn freeze_pre_pass_drives_the_remaining_passes() {
    let dag = four_node_chain();
    let params =
        SearchParams::builder().beam_size(4).num_passes(3).freeze_inline_compute_root(true).build();
    let mut model = FootprintCostModel::new();

    let (best, _) = find_best_schedule(&dag, &params, &MachineParams::default(), &mut model, None).unwrap();
    assert!(best.is_terminal(&dag));
    assert!(best.cost().is_finite());
}
