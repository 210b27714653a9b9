use graphmc::{
    sample_parallel, ChainRng, EdgePrior, OmrfModel, RunControl, SamplerKind, SamplerSettings,
};
use nalgebra::DMatrix;

/// Ordinal pseudo-data with a mild positive association between the first
/// two variables.
fn correlated_ordinal_data(n: usize, p: usize, cats: usize, seed: u64) -> DMatrix<i64> {
    let mut rng = ChainRng::seed_from(seed);
    DMatrix::from_fn(n, p, |_, j| {
        let u = rng.uniform();
        let shift = if j < 2 { 0.1 } else { 0.0 };
        (((u + shift) * (cats as f64 + 1.0)) as i64).min(cats as i64)
    })
}

fn ordinal_model(n: usize, p: usize, cats: usize, edge_selection: bool, seed: u64) -> OmrfModel {
    let obs = correlated_ordinal_data(n, p, cats, seed);
    let inclusion = DMatrix::from_element(p, p, 0.5);
    let mut indicators = DMatrix::from_element(p, p, 1u8);
    indicators.fill_diagonal(0);
    OmrfModel::new(
        obs,
        vec![cats; p],
        inclusion,
        indicators,
        vec![true; p],
        vec![0; p],
        1.0,
        1.0,
        2.5,
        edge_selection,
    )
    .unwrap()
}

#[test]
fn nuts_chain_produces_diagnostics_and_fixed_size_samples() {
    let p = 3;
    let cats = 2;
    let model = ordinal_model(500, p, cats, false, 7);
    let prior = EdgePrior::bernoulli();
    let settings = SamplerSettings {
        sampler: SamplerKind::Nuts,
        no_warmup: 400,
        no_iter: 300,
        seed: 7,
        ..SamplerSettings::default()
    };

    let control = RunControl::new();
    let chains = sample_parallel(&model, &prior, &settings, 1, 1, &control).unwrap();
    let chain = &chains[0];
    assert!(!chain.error, "{}", chain.error_msg);

    // num_main = p * cats, num_pairwise = p (p - 1) / 2.
    let full_dim = p * cats + p * (p - 1) / 2;
    assert_eq!(chain.samples.nrows(), full_dim);
    assert_eq!(chain.samples.ncols(), 300);
    assert!(chain.samples.iter().all(|v| v.is_finite()));

    let depths = chain.tree_depth.as_ref().unwrap();
    let divergent = chain.divergent.as_ref().unwrap();
    let energy = chain.energy.as_ref().unwrap();
    assert_eq!(depths.len(), 300);
    assert!(depths.iter().all(|&d| d <= 10));
    assert!(energy.iter().all(|e| e.is_finite()));

    // After warmup, divergences should be rare for this small posterior.
    let divergence_rate =
        divergent.iter().filter(|&&d| d).count() as f64 / divergent.len() as f64;
    assert!(divergence_rate < 0.2, "divergence rate {divergence_rate}");
}

#[test]
fn hmc_and_nuts_agree_on_posterior_location() {
    let p = 2;
    let cats = 2;
    let model = ordinal_model(300, p, cats, false, 11);
    let prior = EdgePrior::bernoulli();
    let control = RunControl::new();

    let mean_of = |kind: SamplerKind| -> f64 {
        let settings = SamplerSettings {
            sampler: kind,
            no_warmup: 400,
            no_iter: 600,
            seed: 11,
            num_leapfrogs: 10,
            ..SamplerSettings::default()
        };
        let chains = sample_parallel(&model, &prior, &settings, 1, 1, &control).unwrap();
        assert!(!chains[0].error, "{}", chains[0].error_msg);
        // Mean of the first main-effect parameter across draws.
        let row = chains[0].samples.row(0);
        row.iter().sum::<f64>() / row.len() as f64
    };

    let nuts = mean_of(SamplerKind::Nuts);
    let hmc = mean_of(SamplerKind::Hmc);
    let mh = mean_of(SamplerKind::Mh);
    assert!((nuts - hmc).abs() < 0.3, "nuts {nuts} vs hmc {hmc}");
    assert!((nuts - mh).abs() < 0.3, "nuts {nuts} vs mh {mh}");
}

#[test]
fn edge_selection_with_block_prior_records_allocations() {
    let p = 4;
    let cats = 2;
    let model = ordinal_model(120, p, cats, true, 23);
    let prior = EdgePrior::stochastic_block(1.0, 1.0, 1.0, 1.0, 1.0, 1.0).unwrap();
    let settings = SamplerSettings {
        sampler: SamplerKind::Mh,
        no_warmup: 300,
        no_iter: 150,
        edge_selection: true,
        seed: 5,
        ..SamplerSettings::default()
    };

    let control = RunControl::new();
    let chains = sample_parallel(&model, &prior, &settings, 1, 1, &control).unwrap();
    let chain = &chains[0];
    assert!(!chain.error, "{}", chain.error_msg);

    let ind = chain.indicator_samples.as_ref().unwrap();
    assert_eq!(ind.nrows(), p * (p - 1) / 2);
    assert!(ind.iter().all(|&x| x <= 1));

    let alloc = chain.allocation_samples.as_ref().unwrap();
    assert_eq!(alloc.nrows(), p);
    assert_eq!(alloc.ncols(), 150);
    assert!(alloc.iter().all(|&label| (label as usize) < p));

    // Inactive edges must store zero pairwise effects: the pairwise block
    // of the sample vector is zero wherever the indicator is zero.
    let num_main = p * cats;
    for t in 0..150 {
        for e in 0..ind.nrows() {
            if ind[(e, t)] == 0 {
                assert_eq!(chain.samples[(num_main + e, t)], 0.0);
            }
        }
    }
}

#[test]
fn missing_data_imputation_runs_cleanly() {
    let p = 3;
    let cats = 2;
    let mut model = ordinal_model(80, p, cats, false, 31);
    model
        .set_missing_data(vec![(0, 0), (5, 1), (17, 2), (40, 0)])
        .unwrap();
    let prior = EdgePrior::bernoulli();
    let settings = SamplerSettings {
        sampler: SamplerKind::Mh,
        no_warmup: 100,
        no_iter: 100,
        na_impute: true,
        seed: 3,
        ..SamplerSettings::default()
    };

    let control = RunControl::new();
    let chains = sample_parallel(&model, &prior, &settings, 2, 2, &control).unwrap();
    for chain in &chains {
        assert!(!chain.error, "{}", chain.error_msg);
        assert!(chain.samples.iter().all(|v| v.is_finite()));
    }
}

#[test]
fn mixed_variable_chain_runs_with_selection() {
    // One ordinal (3 categories) and one Blume-Capel variable (4
    // categories, baseline 1), as in a small cross-sectional survey.
    let n = 100;
    let num_categories = vec![2usize, 3];
    let mut rng = ChainRng::seed_from(13);
    let obs = DMatrix::from_fn(n, 2, |_, j| {
        let u = rng.uniform();
        ((u * (num_categories[j] as f64 + 1.0)) as i64).min(num_categories[j] as i64)
    });
    let inclusion = DMatrix::from_element(2, 2, 0.5);
    let mut indicators = DMatrix::from_element(2, 2, 1u8);
    indicators.fill_diagonal(0);
    let model = OmrfModel::new(
        obs,
        num_categories,
        inclusion,
        indicators,
        vec![true, false],
        vec![0, 1],
        1.0,
        1.0,
        2.5,
        true,
    )
    .unwrap();

    let prior = EdgePrior::beta_bernoulli(1.0, 1.0).unwrap();
    let settings = SamplerSettings {
        sampler: SamplerKind::Mh,
        no_warmup: 200,
        no_iter: 200,
        edge_selection: true,
        seed: 13,
        ..SamplerSettings::default()
    };

    let control = RunControl::new();
    let chains = sample_parallel(&model, &prior, &settings, 1, 1, &control).unwrap();
    let chain = &chains[0];
    assert!(!chain.error, "{}", chain.error_msg);
    // 2 ordinal thresholds + 2 Blume-Capel effects + 1 pairwise slot.
    assert_eq!(chain.samples.nrows(), 5);
    assert!(chain.samples.iter().all(|v| v.is_finite()));
}

#[test]
fn nuts_with_edge_selection_handles_dimension_changes() {
    // Indicator flips change the active parameter count between
    // iterations; the stored samples keep their fixed size throughout.
    let model = ordinal_model(100, 3, 2, true, 17);
    let prior = EdgePrior::beta_bernoulli(1.0, 1.0).unwrap();
    let settings = SamplerSettings {
        sampler: SamplerKind::Nuts,
        no_warmup: 300,
        no_iter: 150,
        edge_selection: true,
        seed: 19,
        ..SamplerSettings::default()
    };

    let control = RunControl::new();
    let chains = sample_parallel(&model, &prior, &settings, 1, 1, &control).unwrap();
    let chain = &chains[0];
    assert!(!chain.error, "{}", chain.error_msg);
    assert_eq!(chain.samples.nrows(), 3 * 2 + 3);
    assert_eq!(chain.samples.ncols(), 150);
    assert!(chain.samples.iter().all(|v| v.is_finite()));
    assert!(chain.indicator_samples.is_some());
}

#[test]
fn zero_warmup_still_samples() {
    let model = ordinal_model(50, 3, 2, false, 41);
    let prior = EdgePrior::bernoulli();
    let settings = SamplerSettings {
        sampler: SamplerKind::Nuts,
        no_warmup: 0,
        no_iter: 50,
        seed: 2,
        initial_step_size: 0.05,
        ..SamplerSettings::default()
    };
    let control = RunControl::new();
    let chains = sample_parallel(&model, &prior, &settings, 1, 1, &control).unwrap();
    assert!(!chains[0].error);
    assert_eq!(chains[0].samples.ncols(), 50);
}
