use classe_rs::history::parse_simmap;
use classe_rs::utils::new_rng;
use classe_rs::{
    CharacterData, CladogeneticEventMap, ProcessAge, ProcessConfig, RateMatrix, RateModel, SpeciationRates,
    SseError, SseProcess, TipState, Tree, TreeNode,
};

fn approx_eq(a: f64, b: f64, eps: f64) -> bool {
    (a - b).abs() <= eps * (1.0 + a.abs().max(b.abs()))
}

fn five_tip_tree() -> Tree {
    Tree::new(vec![
        TreeNode::internal(2.5, None),
        TreeNode::internal(1.6, Some(0)),
        TreeNode::tip("A", 0.0, 1),
        TreeNode::internal(0.7, Some(1)),
        TreeNode::tip("B", 0.0, 3),
        TreeNode::tip("C", 0.0, 3),
        TreeNode::internal(1.1, Some(0)),
        TreeNode::tip("D", 0.0, 6),
        TreeNode::tip("E", 0.0, 6),
    ])
    .expect("valid tree")
}

fn rates() -> RateModel {
    RateModel::constant(vec![0.2, 0.4], SpeciationRates::Flat(vec![1.2, 0.8]))
        .with_anagenetic(RateMatrix::try_from(vec![vec![0.0, 0.5], vec![0.4, 0.0]]).expect("valid matrix"))
}

fn observed(states: &[(&str, usize)]) -> CharacterData {
    states
        .iter()
        .map(|&(t, s)| (t.to_string(), TipState::Observed(s)))
        .collect()
}

fn mapped_process(seed: u64) -> SseProcess {
    let mut p = SseProcess::new(
        five_tip_tree(),
        rates(),
        ProcessConfig::new(ProcessAge::Root(2.5)).with_time_slices(200),
    )
    .expect("process builds");
    let data = observed(&[("A", 0), ("B", 1), ("C", 1), ("D", 0), ("E", 0)]);
    let mut rng = new_rng(seed);
    p.clamp_character_data(data, &mut rng).expect("map drawn");
    p
}

#[test]
fn segment_durations_cover_each_branch() {
    let p = mapped_process(5);
    let tree = p.tree();
    let history = p.character_history();
    for node in 0..tree.n_nodes() {
        if tree.is_root(node) {
            continue;
        }
        let total: f64 = history.segments[node].iter().map(|(_, d)| d).sum();
        assert!(approx_eq(total, tree.branch_length(node), 1e-12), "node {node}");
        assert!(history.segments[node].iter().all(|(s, d)| *s < 2 && *d >= 0.0));
    }
    let tree_length: f64 = (0..tree.n_nodes()).map(|i| tree.branch_length(i)).sum();
    let in_states: f64 = p.time_in_states().iter().sum();
    assert!(approx_eq(in_states, tree_length, 1e-10));
}

#[test]
fn tip_segments_end_in_observed_states() {
    let p = mapped_process(9);
    for (taxon, state) in [("A", 0), ("B", 1), ("C", 1), ("D", 0), ("E", 0)] {
        let tip = p.tree().tip_index(taxon).expect("tip exists");
        let first = p.character_history().segments[tip][0];
        assert_eq!(first.0, state, "tip {taxon}");
    }
}

#[test]
fn shift_counts_match_segments() {
    let p = mapped_process(13);
    let history = p.character_history();
    for node in 0..p.tree().n_nodes() {
        if p.tree().is_root(node) {
            continue;
        }
        let segs = &history.segments[node];
        let changes = segs.windows(2).filter(|w| w[0].0 != w[1].0).count();
        assert_eq!(history.num_shifts[node], changes);
        assert!(p.average_speciation_rates()[node] >= 0.8 - 1e-12);
        assert!(p.average_speciation_rates()[node] <= 1.2 + 1e-12);
    }
}

#[test]
fn simmap_newick_annotates_every_branch() {
    let p = mapped_process(21);
    let newick = p.simmap_newick();
    assert!(newick.ends_with(';'));
    let annotated = newick.matches("[&character_history={").count();
    assert_eq!(annotated, p.tree().n_nodes());
    let a = p.tree().tip_index("A").expect("tip A");
    let parsed = parse_simmap(&p.character_history().simmap(a)).expect("valid simmap");
    assert_eq!(parsed.len(), p.character_history().segments[a].len());
}

#[test]
fn ancestral_draw_respects_observed_tips() {
    let mut p = mapped_process(2);
    let mut rng = new_rng(77);
    for _ in 0..20 {
        let states = p.draw_joint_conditional_ancestral_states(&mut rng).expect("draw");
        for (taxon, state) in [("A", 0), ("B", 1), ("D", 0)] {
            let tip = p.tree().tip_index(taxon).expect("tip exists");
            assert_eq!(states.end[tip], state);
        }
        let root = p.tree().root();
        assert_eq!(states.start[root], states.end[root]);
    }
}

#[test]
fn forbidden_cladogenetic_outcomes_never_appear() {
    // A state-0 ancestor can only split into (0, 1).
    let mut map = CladogeneticEventMap::new();
    map.insert(0, 0, 1, 1.0);
    map.insert(1, 1, 1, 1.0);
    let rates = RateModel::constant(vec![0.1, 0.1], SpeciationRates::Cladogenetic(map))
        .with_anagenetic(RateMatrix::try_from(vec![vec![0.0, 0.0], vec![0.3, 0.0]]).expect("valid matrix"));
    let tree = Tree::new(vec![
        TreeNode::internal(1.0, None),
        TreeNode::tip("A", 0.0, 0),
        TreeNode::tip("B", 0.0, 0),
    ])
    .expect("cherry");
    let mut p = SseProcess::new(tree, rates, ProcessConfig::new(ProcessAge::Root(1.0))).expect("builds");
    let mut rng = new_rng(4);
    for _ in 0..10 {
        let states = p.draw_joint_conditional_ancestral_states(&mut rng).expect("draw");
        let root = p.tree().root();
        let [l, r] = [p.tree().children(root)[0], p.tree().children(root)[1]];
        if states.end[root] == 0 {
            assert_eq!((states.start[l], states.start[r]), (0, 1));
        } else {
            assert_eq!((states.start[l], states.start[r]), (1, 1));
        }
    }
}

#[test]
fn clamping_needs_every_tip() {
    let mut p = SseProcess::new(five_tip_tree(), rates(), ProcessConfig::new(ProcessAge::Root(2.5)))
        .expect("process builds");
    let data = observed(&[("A", 0), ("B", 1), ("C", 1), ("D", 0)]);
    let mut rng = new_rng(1);
    let err = p.clamp_character_data(data, &mut rng).expect_err("E is missing");
    assert!(matches!(err, SseError::TaxonMismatch { ref taxon } if taxon == "E"));
}

#[test]
fn origin_mapping_covers_branches() {
    let mut p = SseProcess::new(
        five_tip_tree(),
        rates(),
        ProcessConfig::new(ProcessAge::Origin(3.0)).with_time_slices(100),
    )
    .expect("process builds");
    let data = observed(&[("A", 0), ("B", 1), ("C", 1), ("D", 0), ("E", 1)]);
    let mut rng = new_rng(31);
    p.clamp_character_data(data, &mut rng).expect("map drawn");
    let tree = p.tree();
    for node in 0..tree.n_nodes() {
        if tree.is_root(node) {
            continue;
        }
        let total: f64 = p.character_history().segments[node].iter().map(|(_, d)| d).sum();
        assert!(approx_eq(total, tree.branch_length(node), 1e-12));
    }
}
