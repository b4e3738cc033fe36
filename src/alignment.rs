//! Rigid-body-plus-scale alignment of the model to the data.

use std::collections::BTreeMap;

use argmin::core::observers::ObserverMode;
use argmin::core::{
    Error, Executor, Jacobian, Operator, State, TerminationReason, TerminationStatus,
};
use argmin::solver::gaussnewton::GaussNewtonLS;
use argmin::solver::linesearch::MoreThuenteLineSearch;
use argmin_observer_slog::SlogLogger;
use kiddo::{KdTree, SquaredEuclidean};
use nalgebra::{DMatrix, DVector, Vector3};

use crate::datatypes::{normalize_name, MarkerCorrespondence};
use crate::diagnostics::Diagnostics;
use crate::error::{FitResult, FitterError};
use crate::mesh::Mesh;
use crate::point_cloud::PointCloud;
use crate::transform::SimilarityTransform;

/// Fewest marker correspondences that determine rotation, scale and
/// translation
pub const MIN_MARKERS: usize = 3;

const TARGET_COST: f64 = 1e-24;
const COST_TOLERANCE: f64 = 1e-14;
const MAX_SOLVER_ITERATIONS: u64 = 200;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AlignmentOutcome {
    pub transform: SimilarityTransform,
    /// Root mean square distance between transformed model and data
    pub rms: f64,
    /// Correspondence updates used; 1 for marker alignment
    pub iterations: usize,
    pub correspondences: usize,
}

/// Controls iterative point-set alignment
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PointSetSettings {
    pub max_iterations: usize,
    /// Stop when the RMS distance changes by less than this fraction
    pub tolerance: f64,
    /// Use every n-th model sample
    pub sample_stride: usize,
    /// Penalise scales whose factor away from 1 exceeds this
    pub scale_threshold: Option<f64>,
    pub scale_penalty_weight: f64,
    /// Start by translating the model centroid onto the data centroid
    pub match_centroids: bool,
}

impl Default for PointSetSettings {
    fn default() -> PointSetSettings {
        PointSetSettings {
            max_iterations: 50,
            tolerance: 1e-9,
            sample_stride: 1,
            scale_threshold: None,
            scale_penalty_weight: 1.0,
            match_centroids: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
struct ScalePenalty {
    weight: f64,
    threshold: f64,
}

/// Least squares residuals `s R x_i + t - y_i` over fixed pairs, with
/// parameters laid out as in [`SimilarityTransform::to_parameters`].
struct SimilarityProblem<'a> {
    source: &'a [Vector3<f64>],
    target: &'a [Vector3<f64>],
    penalty: Option<ScalePenalty>,
}

impl SimilarityProblem<'_> {
    fn rows(&self) -> usize {
        3 * self.source.len() + usize::from(self.penalty.is_some())
    }

    fn residuals(&self, parameters: &DVector<f64>) -> DVector<f64> {
        let transform = SimilarityTransform::from_parameters(parameters);
        let mut residuals = DVector::zeros(self.rows());
        for (i, (x, y)) in self.source.iter().zip(self.target).enumerate() {
            let r = transform.apply_point(x) - y;
            residuals.fixed_rows_mut::<3>(3 * i).copy_from(&r);
        }
        if let Some(penalty) = self.penalty {
            let s = transform.scale;
            let excess = s.max(1.0 / s) - penalty.threshold;
            if excess > 0.0 {
                residuals[3 * self.source.len()] = penalty.weight * excess;
            }
        }
        residuals
    }

    fn jacobian_matrix(&self, parameters: &DVector<f64>) -> DMatrix<f64> {
        let transform = SimilarityTransform::from_parameters(parameters);
        let rotation = transform.rotation_matrix();
        let derivatives = transform.rotation_derivatives();
        let s = transform.scale;
        let mut jacobian = DMatrix::zeros(self.rows(), 7);
        for (i, x) in self.source.iter().enumerate() {
            let row = 3 * i;
            for (k, derivative) in derivatives.iter().enumerate() {
                jacobian
                    .fixed_view_mut::<3, 1>(row, k)
                    .copy_from(&(s * (derivative * x)));
            }
            jacobian
                .fixed_view_mut::<3, 1>(row, 3)
                .copy_from(&(s * (rotation * x)));
            for c in 0..3 {
                jacobian[(row + c, 4 + c)] = 1.0;
            }
        }
        if let Some(penalty) = self.penalty {
            if s.max(1.0 / s) > penalty.threshold {
                let slope = if s >= 1.0 { s } else { -1.0 / s };
                jacobian[(3 * self.source.len(), 3)] = penalty.weight * slope;
            }
        }
        jacobian
    }
}

impl Operator for SimilarityProblem<'_> {
    type Param = DVector<f64>;
    type Output = DVector<f64>;

    fn apply(&self, p: &Self::Param) -> Result<Self::Output, Error> {
        Ok(self.residuals(p))
    }
}

impl Jacobian for SimilarityProblem<'_> {
    type Param = DVector<f64>;
    type Jacobian = DMatrix<f64>;

    fn jacobian(&self, p: &Self::Param) -> Result<Self::Jacobian, Error> {
        Ok(self.jacobian_matrix(p))
    }
}

/// Solves one least squares similarity problem from a starting transform
fn solve_similarity(
    problem: SimilarityProblem<'_>,
    initial: &SimilarityTransform,
    diagnostics: &Diagnostics,
) -> FitResult<SimilarityTransform> {
    let start = initial.to_parameters();
    let residuals = problem.residuals(&start);
    let cost = residuals.norm_squared();
    let gradient = problem.jacobian_matrix(&start).transpose() * &residuals;
    if cost <= TARGET_COST || gradient.norm() <= 1e-14 * (1.0 + cost) {
        return Ok(*initial);
    }

    let solver = GaussNewtonLS::new(MoreThuenteLineSearch::new())
        .with_tolerance(COST_TOLERANCE)
        .map_err(|e| FitterError::Solver(format!("Align: {e}")))?;
    let mut executor = Executor::new(problem, solver).configure(|state| {
        state
            .param(start)
            .max_iters(MAX_SOLVER_ITERATIONS)
            .target_cost(TARGET_COST)
    });
    if diagnostics.solver_reports() {
        executor = executor.add_observer(SlogLogger::term(), ObserverMode::Always);
    }

    let res = executor
        .run()
        .map_err(|e| FitterError::Solver(format!("Align: {e}")))?;

    match res.state().get_termination_status() {
        TerminationStatus::Terminated(TerminationReason::SolverConverged)
        | TerminationStatus::Terminated(TerminationReason::TargetCostReached) => {}
        status => {
            return Err(FitterError::Solver(format!(
                "Align: transformation solve did not converge ({status:?})"
            )))
        }
    }

    let best = res
        .state()
        .get_best_param()
        .ok_or_else(|| FitterError::Solver("Align: solver returned no parameters".to_owned()))?;
    let transform = SimilarityTransform::from_parameters(best);
    if !transform.scale.is_finite() || !best.iter().all(|v| v.is_finite()) {
        return Err(FitterError::Solver(
            "Align: solver produced a non-finite transformation".to_owned(),
        ));
    }
    Ok(transform)
}

fn rms_distance(transform: &SimilarityTransform, source: &[Vector3<f64>], target: &[Vector3<f64>]) -> f64 {
    if source.is_empty() {
        return 0.0;
    }
    let sum: f64 = source
        .iter()
        .zip(target)
        .map(|(x, y)| (transform.apply_point(x) - y).norm_squared())
        .sum();
    (sum / source.len() as f64).sqrt()
}

/// Pairs model marker positions with data marker label centres by name.
/// Model markers sharing a name are averaged.
pub fn marker_correspondences(
    mesh: &Mesh,
    data: &PointCloud,
    marker_group: &str,
    diagnostics: &Diagnostics,
) -> FitResult<Vec<MarkerCorrespondence>> {
    let mut model: BTreeMap<String, (Vector3<f64>, usize)> = BTreeMap::new();
    for (name, position) in mesh.marker_positions(marker_group)? {
        let entry = model
            .entry(normalize_name(&name))
            .or_insert((Vector3::zeros(), 0));
        entry.0 += position;
        entry.1 += 1;
    }

    let centres = data.label_centres(marker_group);
    let correspondences: Vec<MarkerCorrespondence> = centres
        .iter()
        .filter_map(|(name, position)| {
            model
                .get(&normalize_name(name))
                .map(|(sum, count)| MarkerCorrespondence {
                    name: name.clone(),
                    model: sum / *count as f64,
                    data: *position,
                })
        })
        .collect();

    if correspondences.len() < centres.len() {
        diagnostics.warning(
            "align",
            format_args!(
                "Only {} of {} data markers have model locations",
                correspondences.len(),
                centres.len()
            ),
        );
    }
    Ok(correspondences)
}

/// Transform taking model marker positions onto data marker positions in
/// the least squares sense.
///
/// # Arguments
/// * `correspondences` - Named model/data position pairs, at least three
/// * `diagnostics` - Solver iterations are logged at level 2
///
/// # Returns
/// The transform and the RMS marker distance after applying it
pub fn align_markers(
    correspondences: &[MarkerCorrespondence],
    diagnostics: &Diagnostics,
) -> FitResult<AlignmentOutcome> {
    if correspondences.len() < MIN_MARKERS {
        return Err(FitterError::Precondition(format!(
            "Align: Only {} markers - need at least {MIN_MARKERS}",
            correspondences.len()
        )));
    }
    let source: Vec<Vector3<f64>> = correspondences.iter().map(|c| c.model).collect();
    let target: Vec<Vector3<f64>> = correspondences.iter().map(|c| c.data).collect();
    if !source.iter().chain(&target).all(|p| p.iter().all(|v| v.is_finite())) {
        return Err(FitterError::Precondition(
            "Align: marker positions must be finite".to_owned(),
        ));
    }

    let problem = SimilarityProblem {
        source: &source,
        target: &target,
        penalty: None,
    };
    let transform = solve_similarity(problem, &SimilarityTransform::identity(), diagnostics)?;
    let rms = rms_distance(&transform, &source, &target);
    diagnostics.info(format_args!(
        "Aligned {} markers, RMS distance {rms:.6e}",
        source.len()
    ));

    Ok(AlignmentOutcome {
        transform,
        rms,
        iterations: 1,
        correspondences: source.len(),
    })
}

/// Iteratively pairs each model sample with its nearest data point and
/// solves for the transform, until the RMS distance stops changing.
///
/// # Arguments
/// * `source` - Model surface samples
/// * `target` - Data point positions
/// * `settings` - Iteration limits, sampling and scale penalty
pub fn align_point_sets(
    source: &[Vector3<f64>],
    target: &[Vector3<f64>],
    settings: &PointSetSettings,
    diagnostics: &Diagnostics,
) -> FitResult<AlignmentOutcome> {
    let stride = settings.sample_stride.max(1);
    let samples: Vec<Vector3<f64>> = source.iter().step_by(stride).copied().collect();
    if samples.len() < MIN_MARKERS || target.len() < MIN_MARKERS {
        return Err(FitterError::Precondition(format!(
            "Align: point cloud alignment needs at least {MIN_MARKERS} model samples and data points, got {} and {}",
            samples.len(),
            target.len()
        )));
    }
    if !samples.iter().chain(target).all(|p| p.iter().all(|v| v.is_finite())) {
        return Err(FitterError::Precondition(
            "Align: point cloud positions must be finite".to_owned(),
        ));
    }
    if let Some(threshold) = settings.scale_threshold {
        if threshold < 1.0 || settings.scale_penalty_weight < 0.0 {
            return Err(FitterError::Configuration(format!(
                "Align: scale threshold {threshold} must be at least 1 with a non-negative weight"
            )));
        }
    }

    let mut tree: KdTree<f64, 3> = KdTree::with_capacity(target.len());
    for (i, p) in target.iter().enumerate() {
        tree.add(&[p.x, p.y, p.z], i as u64);
    }

    let centroid = |points: &[Vector3<f64>]| points.iter().sum::<Vector3<f64>>() / points.len() as f64;
    let target_centre = centroid(target);
    let mut transform = SimilarityTransform::identity();
    if settings.match_centroids {
        transform.translation = target_centre - centroid(&samples);
    }

    // weight the scale row like one sample residual of the data's size
    let extent = target
        .iter()
        .map(|p| (p - target_centre).norm())
        .fold(0.0, f64::max);
    let penalty = settings.scale_threshold.map(|threshold| ScalePenalty {
        weight: settings.scale_penalty_weight * extent.max(1.0) * (samples.len() as f64).sqrt(),
        threshold,
    });

    let mut previous_rms: Option<f64> = None;
    let mut iterations = 0;
    let mut matched: Vec<Vector3<f64>> = Vec::with_capacity(samples.len());
    for _ in 0..settings.max_iterations {
        matched.clear();
        for x in &samples {
            let p = transform.apply_point(x);
            let nearest = tree.nearest_one::<SquaredEuclidean>(&[p.x, p.y, p.z]);
            matched.push(target[nearest.item as usize]);
        }
        let rms = rms_distance(&transform, &samples, &matched);
        if let Some(previous) = previous_rms {
            if (previous - rms).abs() <= settings.tolerance * (1.0 + previous) {
                break;
            }
        }
        previous_rms = Some(rms);
        iterations += 1;

        let problem = SimilarityProblem {
            source: &samples,
            target: &matched,
            penalty,
        };
        transform = solve_similarity(problem, &transform, diagnostics)?;
        diagnostics.report(format_args!("point cloud alignment iteration {iterations}: RMS {rms:.6e}"));
    }

    let rms = rms_distance(&transform, &samples, &matched);
    diagnostics.info(format_args!(
        "Aligned {} model samples to {} data points in {iterations} iterations, RMS distance {rms:.6e}",
        samples.len(),
        target.len()
    ));
    Ok(AlignmentOutcome {
        transform,
        rms,
        iterations,
        correspondences: samples.len(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn correspondences(points: &[Vector3<f64>], transform: &SimilarityTransform) -> Vec<MarkerCorrespondence> {
        points
            .iter()
            .enumerate()
            .map(|(i, p)| MarkerCorrespondence {
                name: format!("m{i}"),
                model: *p,
                data: transform.apply_point(p),
            })
            .collect()
    }

    fn ellipsoid(count: usize) -> Vec<Vector3<f64>> {
        let golden = std::f64::consts::PI * (3.0 - 5f64.sqrt());
        (0..count)
            .map(|i| {
                let z = 1.0 - 2.0 * (i as f64 + 0.5) / count as f64;
                let r = (1.0 - z * z).sqrt();
                let theta = golden * i as f64;
                Vector3::new(r * theta.cos(), 0.7 * r * theta.sin(), 0.4 * z)
            })
            .collect()
    }

    #[test]
    fn markers_recover_known_transform() {
        let expected = SimilarityTransform::new(
            Vector3::new(0.3, -0.2, 0.5),
            1.3,
            Vector3::new(1.0, 2.0, -0.5),
        );
        let points = [
            Vector3::new(0.0, 0.0, 0.0),
            Vector3::new(1.0, 0.0, 0.0),
            Vector3::new(0.0, 1.0, 0.0),
            Vector3::new(0.0, 0.0, 1.0),
        ];
        let outcome = align_markers(&correspondences(&points, &expected), &Diagnostics::silent()).unwrap();
        assert_relative_eq!(outcome.transform.scale, 1.3, epsilon = 1e-8);
        assert_relative_eq!(
            outcome.transform.rotation_matrix(),
            expected.rotation_matrix(),
            epsilon = 1e-8
        );
        assert_relative_eq!(outcome.transform.translation, expected.translation, epsilon = 1e-8);
        assert!(outcome.rms < 1e-8);
    }

    #[test]
    fn three_coplanar_markers_keep_positive_scale() {
        let expected = SimilarityTransform::new(Vector3::new(-0.4, 0.1, 0.2), 0.8, Vector3::new(0.0, 0.5, 0.0));
        let points = [
            Vector3::new(0.0, 0.0, 0.0),
            Vector3::new(2.0, 0.0, 0.0),
            Vector3::new(0.0, 1.0, 0.0),
        ];
        let outcome = align_markers(&correspondences(&points, &expected), &Diagnostics::silent()).unwrap();
        assert_relative_eq!(outcome.transform.scale, 0.8, epsilon = 1e-8);
        for p in &points {
            assert_relative_eq!(
                outcome.transform.apply_point(p),
                expected.apply_point(p),
                epsilon = 1e-8
            );
        }
    }

    #[test]
    fn aligned_markers_need_no_solve() {
        let points = [Vector3::x(), Vector3::y(), Vector3::z()];
        let outcome = align_markers(
            &correspondences(&points, &SimilarityTransform::identity()),
            &Diagnostics::silent(),
        )
        .unwrap();
        assert!(outcome.transform.is_identity());
    }

    #[test]
    fn too_few_markers_is_a_precondition_error() {
        let points = [Vector3::x(), Vector3::y()];
        let err = align_markers(
            &correspondences(&points, &SimilarityTransform::identity()),
            &Diagnostics::silent(),
        )
        .unwrap_err();
        assert_eq!(
            err,
            FitterError::Precondition("Align: Only 2 markers - need at least 3".to_owned())
        );
    }

    #[test]
    fn point_sets_align_by_nearest_neighbours() {
        let source = ellipsoid(400);
        let expected = SimilarityTransform::new(
            Vector3::new(0.1, -0.05, 0.08),
            1.05,
            Vector3::new(0.3, -0.2, 0.1),
        );
        let target: Vec<Vector3<f64>> = source.iter().map(|p| expected.apply_point(p)).collect();
        let outcome = align_point_sets(&source, &target, &PointSetSettings::default(), &Diagnostics::silent())
            .unwrap();
        assert!(outcome.rms < 1e-6, "rms {}", outcome.rms);
        assert_relative_eq!(outcome.transform.scale, 1.05, epsilon = 1e-6);
        assert_relative_eq!(outcome.transform.translation, expected.translation, epsilon = 1e-6);
    }

    #[test]
    fn scale_penalty_limits_growth() {
        let source = ellipsoid(300);
        let expected = SimilarityTransform::new(Vector3::zeros(), 2.0, Vector3::zeros());
        let target: Vec<Vector3<f64>> = source.iter().map(|p| expected.apply_point(p)).collect();
        let free = align_point_sets(&source, &target, &PointSetSettings::default(), &Diagnostics::silent())
            .unwrap();
        let settings = PointSetSettings {
            scale_threshold: Some(1.2),
            scale_penalty_weight: 10.0,
            ..PointSetSettings::default()
        };
        let limited = align_point_sets(&source, &target, &settings, &Diagnostics::silent()).unwrap();
        assert!(limited.transform.scale < free.transform.scale);
        assert!(limited.transform.scale > 1.0);
    }

    #[test]
    fn sparse_point_sets_are_rejected() {
        let source = ellipsoid(10);
        let settings = PointSetSettings {
            sample_stride: 5,
            ..PointSetSettings::default()
        };
        assert!(matches!(
            align_point_sets(&source, &source, &settings, &Diagnostics::silent()),
            Err(FitterError::Precondition(_))
        ));
    }
}
