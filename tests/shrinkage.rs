//! End-to-end shrinkage through the public API: model bundle in, results table out

use rust_lfcshrink::prelude::*;
use rust_lfcshrink::shrinkage::{resolve_coefficient, ShrinkTarget};
use tempfile::NamedTempFile;

const N_FEATURES: usize = 40;

/// Deterministic counts: every fifth feature up 3x in B, every seventh down 3x,
/// feature 11 all zero
fn bundle_json(with_matrix: bool) -> String {
    let mut rows = Vec::new();
    for i in 0..N_FEATURES {
        let base = 20.0 + ((i * 37) % 23) as f64 * 15.0;
        let fold = if i % 5 == 0 {
            3.0
        } else if i % 7 == 0 {
            1.0 / 3.0
        } else {
            1.0
        };
        let row: Vec<String> = (0..6)
            .map(|j| {
                if i == 11 {
                    return "0".to_string();
                }
                let jitter = [0.95, 1.0, 1.07][j % 3];
                let mean = if j >= 3 { base * fold } else { base };
                format!("{}", (mean * jitter).round())
            })
            .collect();
        rows.push(format!("[{}]", row.join(",")));
    }
    let ids: Vec<String> = (0..N_FEATURES).map(|i| format!("\"feature{}\"", i)).collect();
    let design = if with_matrix {
        r#""design_matrix": {
            "column_names": ["Intercept", "treated"],
            "rows": [[1,0],[1,0],[1,0],[1,1],[1,1],[1,1]]
        }"#
    } else {
        r#""metadata": {
            "sample_ids": ["s1","s2","s3","s4","s5","s6"],
            "conditions": {"condition": ["A","A","A","B","B","B"]}
        },
        "design": {"main_effect": "condition"}"#
    };
    format!(
        r#"{{
            "feature_ids": [{}],
            "sample_ids": ["s1","s2","s3","s4","s5","s6"],
            "counts": [{}],
            {},
            "size_factors": [0.9, 1.0, 1.1, 1.05, 0.95, 1.0],
            "dispersions": [{}]
        }}"#,
        ids.join(","),
        rows.join(","),
        design,
        vec!["0.04"; N_FEATURES].join(",")
    )
}

fn load(with_matrix: bool) -> FittedModel {
    let bundle: ModelBundle = serde_json::from_str(&bundle_json(with_matrix)).unwrap();
    let model = bundle.into_model().unwrap();
    fit_mle(&model, &IrlsRidgeFitter::default()).unwrap()
}

fn options(estimator: EstimatorType) -> ShrinkOptions {
    ShrinkOptions {
        coefficient: Some(CoefficientRef::Index(2)),
        estimator,
        ..Default::default()
    }
}

fn mle_effects(model: &FittedModel) -> Vec<f64> {
    let coef = resolve_coefficient(model.coefficient_names(), &CoefficientRef::Index(2)).unwrap();
    WaldResultsProvider
        .results(model, &ShrinkTarget::Coefficient(coef))
        .unwrap()
        .values(ColumnKind::EffectSize)
        .unwrap()
        .to_vec()
}

#[test]
fn every_estimator_keeps_rows_and_shrinks() {
    let model = load(false);
    let mle = mle_effects(&model);

    for estimator in [
        EstimatorType::Normal,
        EstimatorType::ExternalParametric,
        EstimatorType::ExternalNonparametric,
    ] {
        let out = lfc_shrink(&model, None, &options(estimator), &ShrinkServices::builtin()).unwrap();
        assert_eq!(out.table.feature_ids(), model.feature_ids(), "{}", estimator);

        let lfc = out.table.values(ColumnKind::EffectSize).unwrap();
        let mut total_shrunk = 0.0;
        let mut total_mle = 0.0;
        for i in (0..N_FEATURES).filter(|&i| i != 11) {
            assert!(lfc[i].is_finite(), "{} row {}", estimator, i);
            total_shrunk += lfc[i].abs();
            total_mle += mle[i].abs();
        }
        assert!(total_shrunk < total_mle, "{} did not shrink", estimator);

        // the 3x features keep a clear positive effect
        assert!(lfc[10] > 0.5, "{}: {}", estimator, lfc[10]);
        assert_eq!(out.table.prior_info().unwrap().estimator_type, estimator);
    }
}

#[test]
fn svalues_replace_pvalues() {
    let model = load(false);
    for estimator in [EstimatorType::ExternalParametric, EstimatorType::ExternalNonparametric] {
        let with = ShrinkOptions {
            use_svalues: true,
            ..options(estimator)
        };
        let out = lfc_shrink(&model, None, &with, &ShrinkServices::builtin()).unwrap();
        assert!(out.table.values(ColumnKind::PValue).is_none());
        assert!(out.table.values(ColumnKind::AdjPValue).is_none());
        let s = out.table.values(ColumnKind::SValue).unwrap();
        assert!(s.iter().filter(|v| !v.is_nan()).all(|&v| (0.0..=1.0).contains(&v)));

        let without = lfc_shrink(&model, None, &options(estimator), &ShrinkServices::builtin()).unwrap();
        assert!(without.table.values(ColumnKind::SValue).is_none());
        assert!(without.table.values(ColumnKind::PValue).is_some());
    }
}

#[test]
fn parallel_matches_serial() {
    let model = load(false);
    let services = ShrinkServices::builtin().with_pool(WorkerPool::new(4).unwrap());
    for estimator in [EstimatorType::Normal, EstimatorType::ExternalParametric] {
        let serial = lfc_shrink(&model, None, &options(estimator), &ShrinkServices::builtin()).unwrap();
        let parallel = lfc_shrink(
            &model,
            None,
            &ShrinkOptions {
                parallel: true,
                chunk_multiplier: 3,
                ..options(estimator)
            },
            &services,
        )
        .unwrap();
        let a = serial.table.values(ColumnKind::EffectSize).unwrap();
        let b = parallel.table.values(ColumnKind::EffectSize).unwrap();
        for i in 0..N_FEATURES {
            assert!(
                (a[i] - b[i]).abs() < 1e-10 || (a[i].is_nan() && b[i].is_nan()),
                "{} row {}: {} vs {}",
                estimator,
                i,
                a[i],
                b[i]
            );
        }
    }
}

#[test]
fn results_file_round_trip_feeds_ashr() {
    let model = load(false);
    let shrunk = lfc_shrink(
        &model,
        None,
        &options(EstimatorType::Normal),
        &ShrinkServices::builtin(),
    )
    .unwrap();
    let file = NamedTempFile::new().unwrap();
    write_results(file.path(), &shrunk.table).unwrap();
    let back = read_results(file.path()).unwrap();
    assert_eq!(back.feature_ids(), model.feature_ids());
    assert_eq!(back.kinds(), shrunk.table.kinds());

    // an unshrunken table produced elsewhere, shrunk without naming a coefficient
    let coef = resolve_coefficient(model.coefficient_names(), &CoefficientRef::Index(2)).unwrap();
    let base = WaldResultsProvider
        .results(&model, &ShrinkTarget::Coefficient(coef))
        .unwrap();
    write_results(file.path(), &base).unwrap();
    let base = read_results(file.path()).unwrap();
    let out = lfc_shrink(
        &model,
        Some(&base),
        &ShrinkOptions {
            estimator: EstimatorType::ExternalNonparametric,
            ..Default::default()
        },
        &ShrinkServices::builtin(),
    )
    .unwrap();
    assert_eq!(out.table.n_rows(), N_FEATURES);
    assert_eq!(
        out.table.column(ColumnKind::EffectSize).unwrap().description,
        "log2 fold change (posterior mean)"
    );
}

#[test]
fn user_supplied_design_matrix() {
    let model = load(true);
    assert!(model.is_user_supplied_design());
    for estimator in [EstimatorType::Normal, EstimatorType::ExternalParametric] {
        let out = lfc_shrink(&model, None, &options(estimator), &ShrinkServices::builtin()).unwrap();
        assert_eq!(out.table.n_rows(), N_FEATURES);
        assert!(out.table.values(ColumnKind::EffectSize).unwrap()[10] > 0.5);
    }
}

#[test]
fn contrast_rules_per_estimator() {
    let model = load(false);
    let contrast = Contrast::Levels {
        factor: "condition".to_string(),
        numerator: "B".to_string(),
        denominator: "A".to_string(),
    };
    let with_contrast = |estimator| ShrinkOptions {
        contrast: Some(contrast.clone()),
        estimator,
        ..Default::default()
    };

    let err = lfc_shrink(
        &model,
        None,
        &with_contrast(EstimatorType::ExternalParametric),
        &ShrinkServices::builtin(),
    )
    .unwrap_err();
    assert!(matches!(err, ShrinkError::UnsupportedContrast { .. }));

    // B vs A is the coefficient itself, so normal shrinkage agrees in sign
    let by_coef = lfc_shrink(&model, None, &options(EstimatorType::Normal), &ShrinkServices::builtin()).unwrap();
    let by_contrast = lfc_shrink(
        &model,
        None,
        &with_contrast(EstimatorType::Normal),
        &ShrinkServices::builtin(),
    )
    .unwrap();
    let a = by_coef.table.values(ColumnKind::EffectSize).unwrap();
    let b = by_contrast.table.values(ColumnKind::EffectSize).unwrap();
    for i in [0, 5, 10, 14] {
        assert_eq!(a[i].signum(), b[i].signum(), "row {}", i);
    }

    let ashr = lfc_shrink(
        &model,
        None,
        &with_contrast(EstimatorType::ExternalNonparametric),
        &ShrinkServices::builtin(),
    )
    .unwrap();
    assert_eq!(ashr.table.n_rows(), N_FEATURES);
}
