use classe_rs::utils::new_rng;
use classe_rs::{
    CharacterData, CladogeneticEventMap, Condition, EpochRates, ProcessAge, ProcessConfig, RateMatrix, RateModel,
    SpeciationRates, SseProcess, TipState, Tree, TreeNode,
};

fn approx_eq(a: f64, b: f64, eps: f64) -> bool {
    (a - b).abs() <= eps * (1.0 + a.abs().max(b.abs()))
}

fn four_tip_tree() -> Tree {
    Tree::new(vec![
        TreeNode::internal(3.0, None),
        TreeNode::internal(1.8, Some(0)),
        TreeNode::tip("A", 0.0, 1),
        TreeNode::tip("B", 0.0, 1),
        TreeNode::internal(1.0, Some(0)),
        TreeNode::tip("C", 0.0, 4),
        TreeNode::tip("D", 0.0, 4),
    ])
    .expect("valid tree")
}

fn q() -> RateMatrix {
    RateMatrix::try_from(vec![vec![0.0, 0.3], vec![0.2, 0.0]]).expect("valid rate matrix")
}

fn flat_rates() -> RateModel {
    RateModel::constant(vec![0.3, 0.1], SpeciationRates::Flat(vec![1.0, 0.6])).with_anagenetic(q())
}

fn tip_data() -> CharacterData {
    [
        ("A", TipState::Observed(0)),
        ("B", TipState::Observed(1)),
        ("C", TipState::Observed(0)),
        ("D", TipState::Ambiguous(vec![0, 1])),
    ]
    .into_iter()
    .map(|(t, s)| (t.to_string(), s))
    .collect()
}

fn process_with(rates: RateModel, data: CharacterData) -> SseProcess {
    let mut p = SseProcess::new(four_tip_tree(), rates, ProcessConfig::new(ProcessAge::Root(3.0)))
        .expect("process builds");
    p.set_data(data);
    p
}

#[test]
fn partials_hold_two_values_per_state() {
    let mut p = process_with(flat_rates(), tip_data());
    let ln = p.ln_probability().expect("likelihood");
    assert!(ln.is_finite());
    for node in 0..p.tree().n_nodes() {
        let x = p.cache().partial(node);
        assert_eq!(x.len(), 4);
        assert!(x.iter().all(|v| v.is_finite() && *v >= 0.0), "node {node}: {x:?}");
    }
}

#[test]
fn repeated_evaluation_is_idempotent() {
    let mut p = process_with(flat_rates(), tip_data());
    let a = p.ln_probability().expect("first");
    let b = p.ln_probability().expect("second");
    assert_eq!(a.to_bits(), b.to_bits());
}

#[test]
fn incremental_update_matches_fresh_engine() {
    let mut p = process_with(flat_rates(), tip_data());
    p.ln_probability().expect("initial");
    p.keep();
    p.set_tip_state("B", TipState::Observed(0)).expect("known taxon");
    let incremental = p.ln_probability().expect("after change");

    let mut data = tip_data();
    data.insert("B", TipState::Observed(0));
    let mut fresh = process_with(flat_rates(), data);
    let full = fresh.ln_probability().expect("fresh");
    assert!(approx_eq(incremental, full, 1e-12), "{incremental} vs {full}");
}

#[test]
fn restore_brings_back_accepted_partials() {
    let mut p = process_with(flat_rates(), tip_data());
    p.ln_probability().expect("initial");
    p.keep();
    let n = p.tree().n_nodes();
    let before: Vec<(Vec<f64>, f64, usize)> = (0..n)
        .map(|i| (p.cache().partial(i).to_vec(), p.cache().scale(i), p.cache().active_index(i)))
        .collect();

    p.set_tip_state("C", TipState::Observed(1)).expect("known taxon");
    p.ln_probability().expect("proposal");
    assert!(p.cache().is_changed(p.tree().tip_index("C").expect("tip C")));
    p.restore();

    for (i, (x, s, slot)) in before.iter().enumerate() {
        let after = p.cache().partial(i);
        assert!(x.iter().zip(after).all(|(a, b)| a.to_bits() == b.to_bits()), "node {i}");
        assert_eq!(s.to_bits(), p.cache().scale(i).to_bits());
        assert_eq!(*slot, p.cache().active_index(i));
        assert!(!p.cache().is_dirty(i));
    }
}

#[test]
fn rate_change_then_restore_recovers_likelihood() {
    let mut p = process_with(flat_rates(), tip_data());
    let accepted = p.ln_probability().expect("initial");
    p.keep();
    let mut faster = flat_rates();
    faster.unpack_params(&[0.3, 0.1, 2.0, 0.6, 1.0]).expect("five parameters");
    p.set_rates(faster).expect("same state count");
    let proposed = p.ln_probability().expect("proposal");
    assert!((proposed - accepted).abs() > 1e-6);
    p.restore();
    p.set_rates(flat_rates()).expect("same state count");
    let back = p.ln_probability().expect("restored");
    assert!(approx_eq(back, accepted, 1e-12));
}

#[test]
fn flat_rates_equal_degenerate_cladogenetic_map() {
    let clado = RateModel::constant(
        vec![0.3, 0.1],
        SpeciationRates::Cladogenetic(CladogeneticEventMap::from_flat(&[1.0, 0.6])),
    )
    .with_anagenetic(q());
    let a = process_with(flat_rates(), tip_data()).ln_probability().expect("flat");
    let b = process_with(clado, tip_data()).ln_probability().expect("clado");
    assert!(approx_eq(a, b, 1e-9), "{a} vs {b}");
}

#[test]
fn identical_epochs_match_constant_rates() {
    let epoch = || EpochRates::new(vec![0.3, 0.1], SpeciationRates::Flat(vec![1.0, 0.6])).with_anagenetic(q());
    let varying = RateModel::time_varying(vec![0.7, 2.1], vec![epoch(), epoch(), epoch()]);
    let a = process_with(flat_rates(), tip_data()).ln_probability().expect("constant");
    let b = process_with(varying, tip_data()).ln_probability().expect("epochs");
    assert!(approx_eq(a, b, 1e-6), "{a} vs {b}");
}

#[test]
fn scaling_and_conditioning_behave() {
    let mut scaled = process_with(flat_rates(), tip_data());
    let mut unscaled = process_with(flat_rates(), tip_data());
    unscaled.set_use_scaling(false);
    let a = scaled.ln_probability().expect("scaled");
    let b = unscaled.ln_probability().expect("unscaled");
    assert!(approx_eq(a, b, 1e-10));

    let mut raw = SseProcess::new(
        four_tip_tree(),
        flat_rates(),
        ProcessConfig::new(ProcessAge::Root(3.0)).with_condition(Condition::None),
    )
    .expect("process builds");
    raw.set_data(tip_data());
    let unconditioned = raw.ln_probability().expect("no conditioning");
    let p_survive = raw.p_survival(0.0, 3.0).expect("survival");
    assert!(p_survive > 0.0 && p_survive < 1.0);
    assert!(approx_eq(a, unconditioned - 2.0 * p_survive.ln(), 1e-10));
}

#[test]
fn origin_adds_a_stem_branch() {
    let mut root = process_with(flat_rates(), tip_data());
    let mut origin = SseProcess::new(four_tip_tree(), flat_rates(), ProcessConfig::new(ProcessAge::Origin(4.0)))
        .expect("process builds");
    origin.set_data(tip_data());
    let a = root.ln_probability().expect("root");
    let b = origin.ln_probability().expect("origin");
    assert!(a.is_finite() && b.is_finite());
    assert!((a - b).abs() > 1e-9);
}

#[test]
fn tip_older_than_parent_is_rejected() {
    let tree = Tree::new(vec![
        TreeNode::internal(1.0, None),
        TreeNode::tip("A", 0.0, 0),
        TreeNode::fossil("B", 1.5, 0),
    ])
    .expect("structurally valid");
    let mut p = SseProcess::new(tree, flat_rates(), ProcessConfig::new(ProcessAge::Root(1.0))).expect("builds");
    assert_eq!(p.ln_probability().expect("scored"), f64::NEG_INFINITY);
}

#[test]
fn sampled_ancestor_needs_zero_branch_length() {
    let fossil_rates = flat_rates().with_serial_sampling(vec![0.2, 0.2]);
    let tree = |sa_age: f64| {
        Tree::new(vec![
            TreeNode::internal(2.0, None),
            TreeNode::internal(1.0, Some(0)),
            TreeNode::sampled_ancestor("S", sa_age, 1),
            TreeNode::tip("B", 0.0, 1),
            TreeNode::tip("A", 0.0, 0),
        ])
        .expect("structurally valid")
    };
    let config = ProcessConfig::new(ProcessAge::Origin(3.0));
    let mut bad = SseProcess::new(tree(0.7), fossil_rates.clone(), config.clone()).expect("builds");
    assert_eq!(bad.ln_probability().expect("scored"), f64::NEG_INFINITY);
    let mut good = SseProcess::new(tree(1.0), fossil_rates, config).expect("builds");
    assert!(good.ln_probability().expect("scored").is_finite());
}

#[test]
fn unknown_taxon_is_reported() {
    let mut p = process_with(flat_rates(), tip_data());
    let err = p.set_tip_state("Z", TipState::Observed(0)).expect_err("no such tip");
    assert!(matches!(err, classe_rs::SseError::TaxonMismatch { .. }));
}

#[test]
fn replacing_the_tree_moves_the_subscription() {
    let mut p = process_with(flat_rates(), tip_data());
    let first = p.ln_probability().expect("initial");
    let tree = Tree::new(vec![
        TreeNode::internal(2.0, None),
        TreeNode::tip("A", 0.0, 0),
        TreeNode::tip("B", 0.0, 0),
    ])
    .expect("cherry");
    p.set_value(tree).expect("swap tree");
    assert!(p.tree().events().is_subscribed(p.listener()));
    assert_eq!(p.tree().events().n_listeners(), 1);
    let second = p.ln_probability().expect("new tree");
    assert!(second.is_finite());
    assert!((first - second).abs() > 1e-9);

    let tree = p.into_tree();
    assert_eq!(tree.events().n_listeners(), 0);
}

#[test]
fn changing_a_node_age_invalidates_its_path() {
    let mut p = process_with(flat_rates(), tip_data());
    p.ln_probability().expect("initial");
    p.keep();
    p.tree_mut().set_age(4, 1.2);
    let moved = p.ln_probability().expect("after age change");

    let mut nodes: Vec<TreeNode> = four_tip_tree().nodes().to_vec();
    nodes[4].age = 1.2;
    let mut fresh = SseProcess::new(
        Tree::new(nodes).expect("valid tree"),
        flat_rates(),
        ProcessConfig::new(ProcessAge::Root(3.0)),
    )
    .expect("builds");
    fresh.set_data(tip_data());
    assert!(approx_eq(moved, fresh.ln_probability().expect("fresh"), 1e-12));
}

#[test]
fn renaming_a_tip_invalidates_its_path() {
    let mut data = tip_data();
    data.insert("E", TipState::Observed(0));
    let mut p = process_with(flat_rates(), data.clone());
    p.ln_probability().expect("initial");
    p.keep();
    let b = p.tree().tip_index("B").expect("tip B");
    p.tree_mut().set_name(b, "E");
    let renamed = p.ln_probability().expect("after rename");

    let mut nodes: Vec<TreeNode> = four_tip_tree().nodes().to_vec();
    nodes[b] = TreeNode::tip("E", 0.0, 1);
    let mut fresh = SseProcess::new(
        Tree::new(nodes).expect("valid tree"),
        flat_rates(),
        ProcessConfig::new(ProcessAge::Root(3.0)),
    )
    .expect("builds");
    fresh.set_data(data);
    assert!(approx_eq(renamed, fresh.ln_probability().expect("fresh"), 1e-12));
}

#[test]
fn restore_after_replacing_the_tree_recomputes_everything() {
    let mut p = process_with(flat_rates(), tip_data());
    p.ln_probability().expect("initial");
    p.keep();
    let cherry = || {
        Tree::new(vec![
            TreeNode::internal(2.0, None),
            TreeNode::tip("A", 0.0, 0),
            TreeNode::tip("B", 0.0, 0),
        ])
        .expect("cherry")
    };
    p.set_value(cherry()).expect("swap tree");
    p.restore();
    for i in 0..p.tree().n_nodes() {
        assert!(p.cache().is_dirty(i), "node {i}");
    }
    let swapped = p.ln_probability().expect("after restore");

    let mut fresh = SseProcess::new(cherry(), flat_rates(), ProcessConfig::new(ProcessAge::Root(2.0))).expect("builds");
    let expected = fresh.ln_probability().expect("fresh");
    assert!(swapped.is_finite());
    assert!(approx_eq(swapped, expected, 1e-12));
}

#[test]
fn drawing_a_character_map_leaves_the_scored_cache_alone() {
    let mut p = process_with(flat_rates(), tip_data());
    let before = p.ln_probability().expect("initial");
    p.keep();
    let mut rng = new_rng(11);
    p.draw_stochastic_character_map(&mut rng).expect("map drawn");
    let after = p.ln_probability().expect("after map");
    assert_eq!(before.to_bits(), after.to_bits());
    for i in 0..p.tree().n_nodes() {
        assert!(!p.cache().is_dirty(i) && !p.cache().is_changed(i), "node {i}");
    }
}
