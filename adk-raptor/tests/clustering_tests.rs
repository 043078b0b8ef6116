//! Property tests for dimensionality reduction and soft clustering.

use adk_raptor::{ClusteringConfig, DimensionReducer, ReductionConfig, SoftClusterer};
use ndarray::Array2;
use proptest::prelude::*;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::Normal;

/// `per_blob` points around each centre, seeded.
fn gaussian_blobs(centers: &[Vec<f32>], per_blob: usize, std_dev: f32, seed: u64) -> Vec<Vec<f32>> {
    let mut rng = StdRng::seed_from_u64(seed);
    let noise = Normal::new(0.0f32, std_dev).unwrap();
    centers
        .iter()
        .flat_map(|c| (0..per_blob).map(|_| c.clone()).collect::<Vec<_>>())
        .map(|c| c.into_iter().map(|x| x + rng.sample(noise)).collect())
        .collect()
}

fn to_array(points: &[Vec<f32>]) -> Array2<f64> {
    let dim = points.first().map_or(0, Vec::len);
    Array2::from_shape_fn((points.len(), dim), |(i, j)| f64::from(points[i][j]))
}

/// **Feature: adk-raptor, Property 4: Every point is claimed**
/// *For any* point set and membership threshold, every point SHALL belong to
/// at least one cluster, including the degenerate single-cluster fallback.
mod prop_soft_membership {
    use super::*;

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(50))]

        #[test]
        fn every_point_belongs_to_a_cluster(
            points in proptest::collection::vec(
                proptest::collection::vec(-5.0f32..5.0f32, 2),
                0..24,
            ),
            threshold in 0.0f64..0.999,
            max_k in 1usize..6,
            seed in any::<u64>(),
        ) {
            let config = ClusteringConfig {
                max_k,
                membership_threshold: threshold,
                n_init: 1,
                ..ClusteringConfig::default()
            };
            let outcome =
                SoftClusterer::new(config).with_seed(Some(seed)).cluster(&to_array(&points));

            prop_assert_eq!(outcome.responsibilities.len(), points.len());
            for point in 0..points.len() {
                prop_assert!(!outcome.memberships(point).is_empty(), "point {} unclaimed", point);
            }
            for cluster in &outcome.clusters {
                prop_assert!(!cluster.is_empty());
                prop_assert!(cluster.members.windows(2).all(|w| w[0] < w[1]));
            }
            for row in &outcome.responsibilities {
                let total: f64 = row.iter().sum();
                prop_assert!((total - 1.0).abs() < 1e-6);
            }
        }

        #[test]
        fn bic_scores_every_candidate(
            per_blob in 4usize..10,
            max_k in 2usize..6,
            seed in any::<u64>(),
        ) {
            let centers = vec![vec![0.0, 0.0], vec![12.0, 0.0], vec![0.0, 12.0]];
            let points = gaussian_blobs(&centers, per_blob, 0.5, seed);
            let config = ClusteringConfig { max_k, n_init: 1, ..ClusteringConfig::default() };
            let clusterer = SoftClusterer::new(config).with_seed(Some(seed));

            let outcome = clusterer.cluster(&to_array(&points));
            let selection = outcome.selection.expect("enough points to cluster");

            let expected: Vec<usize> = (1..=clusterer.effective_max_k(points.len())).collect();
            let evaluated: Vec<usize> = selection.scores.iter().map(|(k, _)| *k).collect();
            prop_assert_eq!(evaluated, expected);

            let best = selection
                .scores
                .iter()
                .map(|(_, bic)| *bic)
                .fold(f64::INFINITY, f64::min);
            let first_best = selection.scores.iter().find(|(_, bic)| *bic == best).unwrap().0;
            prop_assert_eq!(selection.chosen, first_best);
        }
    }
}

#[test]
fn reduction_keeps_blobs_separable() {
    let centers: Vec<Vec<f32>> = (0..4)
        .map(|c| (0..16).map(|d| if d / 4 == c { 1.0 } else { 0.0 }).collect())
        .collect();
    let points = gaussian_blobs(&centers, 10, 0.05, 11);
    let reduced =
        DimensionReducer::new(ReductionConfig { target_dim: 2, ..ReductionConfig::default() })
            .with_seed(Some(5))
            .reduce(&points);
    assert_eq!(reduced.dim(), (40, 2));

    let config = ClusteringConfig { max_k: 6, ..ClusteringConfig::default() };
    let outcome = SoftClusterer::new(config).with_seed(Some(5)).cluster(&reduced);

    assert!((3..=5).contains(&outcome.n_components), "chose {} components", outcome.n_components);
    // blobs are never merged: no cluster's hard members span two blobs
    for cluster in &outcome.clusters {
        let dominant: Vec<usize> = cluster
            .members
            .iter()
            .zip(&cluster.responsibilities)
            .filter(|(_, r)| **r > 0.9)
            .map(|(m, _)| m / 10)
            .collect();
        if let Some(first) = dominant.first() {
            assert!(dominant.iter().all(|b| b == first), "cluster mixes blobs: {dominant:?}");
        }
    }
}

#[test]
fn default_reduction_does_not_overfit_component_count() {
    let centers: Vec<Vec<f32>> = (0..4)
        .map(|c| (0..64).map(|d| if d / 16 == c { 1.0 } else { 0.0 }).collect())
        .collect();
    for seed in [1, 2, 3, 42] {
        let points = gaussian_blobs(&centers, 10, 0.05, seed);
        let reduced = DimensionReducer::new(ReductionConfig::default())
            .with_seed(Some(seed))
            .reduce(&points);
        assert_eq!(reduced.dim(), (40, ReductionConfig::default().target_dim));

        let config = ClusteringConfig { max_k: 6, ..ClusteringConfig::default() };
        let outcome = SoftClusterer::new(config).with_seed(Some(seed)).cluster(&reduced);
        assert!(
            (3..=5).contains(&outcome.n_components),
            "seed {seed}: chose {} components, scores {:?}",
            outcome.n_components,
            outcome.selection.map(|s| s.scores)
        );
    }
}

#[test]
fn random_vectors_do_not_break_reduction() {
    let mut rng = StdRng::seed_from_u64(99);
    let points: Vec<Vec<f32>> =
        (0..30).map(|_| (0..12).map(|_| rng.random_range(-1.0..1.0)).collect()).collect();
    let reduced =
        DimensionReducer::new(ReductionConfig { target_dim: 3, ..ReductionConfig::default() })
            .with_seed(Some(1))
            .reduce(&points);
    assert!(reduced.iter().all(|v| v.is_finite()));
}
