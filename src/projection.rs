//! Nearest-point correspondence between data points and the mesh.

use std::collections::{BTreeSet, HashMap};

use nalgebra::{DMatrix, DVector, Vector3};

use crate::datatypes::{normalize_name, MeshLocation, Projection};
use crate::diagnostics::Diagnostics;
use crate::error::{FitResult, FitterError};
use crate::mesh::{combine, Mesh};
use crate::point_cloud::PointCloud;

/// Grid subdivisions per element direction used to seed the search
pub const SEED_SUBDIVISIONS: usize = 4;
/// Elements refined per point, closest seeds first
pub const REFINE_CANDIDATES: usize = 4;
const MAX_REFINE_ITERATIONS: usize = 50;
const XI_TOLERANCE: f64 = 1e-13;

/// Deactivates suspicious points after each group is projected
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct OutlierRejection {
    /// Fraction in (0, 1]; points whose error exceeds this quantile of their
    /// group's errors are deactivated
    pub error_percentile: Option<f64>,
    /// Points projected onto a surface whose residual direction has an
    /// absolute cosine to the surface normal below this are deactivated
    pub normal_cosine_threshold: Option<f64>,
}

impl OutlierRejection {
    pub fn is_enabled(&self) -> bool {
        self.error_percentile.is_some() || self.normal_cosine_threshold.is_some()
    }

    pub fn validate(&self) -> FitResult<()> {
        if let Some(p) = self.error_percentile {
            if !(p > 0.0 && p <= 1.0) {
                return Err(FitterError::Configuration(format!(
                    "Outlier error percentile {p} must be in (0, 1]"
                )));
            }
        }
        if let Some(c) = self.normal_cosine_threshold {
            if !(0.0..=1.0).contains(&c) {
                return Err(FitterError::Configuration(format!(
                    "Outlier normal cosine threshold {c} must be in [0, 1]"
                )));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct ProjectionReport {
    pub projected: usize,
    /// Active points left without a projection
    pub unprojected: usize,
    pub deactivated: usize,
    pub skipped_groups: Vec<String>,
    pub failures: Vec<FitterError>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct NearestPoint {
    pub location: MeshLocation,
    pub position: Vector3<f64>,
    pub distance: f64,
}

/// Seed grid over a set of elements, reused for every point of a group
pub struct ElementSamples {
    elements: Vec<(usize, usize)>,
    samples: Vec<Vec<([f64; 3], Vector3<f64>)>>,
}

impl ElementSamples {
    pub fn new(mesh: &Mesh, elements: &[usize]) -> FitResult<ElementSamples> {
        let mut resolved = Vec::with_capacity(elements.len());
        let mut samples = Vec::with_capacity(elements.len());
        for id in elements {
            let dimension = mesh
                .element(*id)
                .map(|e| e.dimension)
                .ok_or_else(|| FitterError::Configuration(format!("Unknown element {id}")))?;
            let mut element_samples = Vec::new();
            for xi in seed_grid(dimension) {
                let terms = mesh.slot_terms(*id, &xi)?;
                let position = combine(&terms, mesh.current_slots(), dimension).position;
                element_samples.push((xi, position));
            }
            resolved.push((*id, dimension));
            samples.push(element_samples);
        }
        Ok(ElementSamples {
            elements: resolved,
            samples,
        })
    }

    pub fn contains(&self, element: usize) -> bool {
        self.elements.iter().any(|(id, _)| *id == element)
    }

    /// All seed positions, e.g. as a source set for point-set alignment
    pub fn positions(&self) -> Vec<Vector3<f64>> {
        self.samples
            .iter()
            .flat_map(|s| s.iter().map(|(_, p)| *p))
            .collect()
    }

    /// Nearest point on any of the elements.
    ///
    /// # Arguments
    /// * `mesh` - The mesh the samples were built from
    /// * `point` - Query position
    /// * `hint` - Previous location; replaces the seeded answer only when it
    ///   refines to a strictly closer point
    ///
    /// # Returns
    /// None when the point is not finite or there are no elements
    pub fn nearest(
        &self,
        mesh: &Mesh,
        point: &Vector3<f64>,
        hint: Option<&MeshLocation>,
    ) -> FitResult<Option<NearestPoint>> {
        if !point.iter().all(|v| v.is_finite()) || self.elements.is_empty() {
            return Ok(None);
        }

        let mut seeds: Vec<(f64, usize, [f64; 3])> = self
            .samples
            .iter()
            .enumerate()
            .filter_map(|(index, samples)| {
                samples
                    .iter()
                    .map(|(xi, p)| ((p - point).norm_squared(), *xi))
                    .min_by(|a, b| a.0.total_cmp(&b.0))
                    .map(|(d, xi)| (d, index, xi))
            })
            .collect();
        seeds.sort_by(|a, b| a.0.total_cmp(&b.0).then(a.1.cmp(&b.1)));

        let mut best: Option<NearestPoint> = None;
        for (_, index, xi) in seeds.iter().take(REFINE_CANDIDATES) {
            let (id, dimension) = self.elements[*index];
            let candidate = refine(mesh, id, dimension, point, *xi)?;
            if best.map_or(true, |b| candidate.distance < b.distance) {
                best = Some(candidate);
            }
        }

        if let (Some(hint), Some(current)) = (hint, best) {
            if let Some((id, dimension)) = self.elements.iter().find(|(id, _)| *id == hint.element) {
                let candidate = refine(mesh, *id, *dimension, point, hint.xi)?;
                if candidate.distance < current.distance - 1e-12 * (1.0 + current.distance) {
                    best = Some(candidate);
                }
            }
        }

        Ok(best)
    }
}

/// Regular grid of element coordinates including the element boundary
fn seed_grid(dimension: usize) -> Vec<[f64; 3]> {
    let steps = SEED_SUBDIVISIONS + 1;
    let count = steps.pow(dimension as u32);
    (0..count)
        .map(|mut index| {
            let mut xi = [0.0; 3];
            for value in xi.iter_mut().take(dimension) {
                *value = (index % steps) as f64 / SEED_SUBDIVISIONS as f64;
                index /= steps;
            }
            xi
        })
        .collect()
}

/// Gauss-Newton on element coordinates, clamped to the element and
/// backtracking so the distance never increases from the seed.
fn refine(
    mesh: &Mesh,
    element: usize,
    dimension: usize,
    point: &Vector3<f64>,
    start: [f64; 3],
) -> FitResult<NearestPoint> {
    let evaluate = |xi: &[f64; 3]| -> FitResult<(Vector3<f64>, [Vector3<f64>; 3])> {
        let terms = mesh.slot_terms(element, xi)?;
        let sample = combine(&terms, mesh.current_slots(), dimension);
        Ok((sample.position, sample.derivatives))
    };

    let mut xi = start;
    let (mut position, mut derivatives) = evaluate(&xi)?;
    let mut distance_squared = (position - point).norm_squared();

    for _ in 0..MAX_REFINE_ITERATIONS {
        let residual = position - point;
        let hessian = DMatrix::from_fn(dimension, dimension, |a, b| {
            derivatives[a].dot(&derivatives[b])
        });
        let gradient = DVector::from_fn(dimension, |a, _| derivatives[a].dot(&residual));
        let Some(step) = hessian.lu().solve(&(-gradient)) else {
            break;
        };

        let mut factor = 1.0;
        let mut accepted = false;
        for _ in 0..20 {
            let mut trial = xi;
            for a in 0..dimension {
                trial[a] = (xi[a] + factor * step[a]).clamp(0.0, 1.0);
            }
            let (trial_position, trial_derivatives) = evaluate(&trial)?;
            let trial_distance = (trial_position - point).norm_squared();
            if trial_distance <= distance_squared {
                let moved = (0..dimension).map(|a| (trial[a] - xi[a]).abs()).fold(0.0, f64::max);
                xi = trial;
                position = trial_position;
                derivatives = trial_derivatives;
                distance_squared = trial_distance;
                accepted = moved > XI_TOLERANCE;
                break;
            }
            factor *= 0.5;
        }
        if !accepted {
            break;
        }
    }

    Ok(NearestPoint {
        location: MeshLocation::new(element, &xi[..dimension]),
        position,
        distance: distance_squared.sqrt(),
    })
}

/// Elements of a mesh group used for projection: its faces, or its lines
/// when it has no faces
fn projection_elements(mesh: &Mesh, group: &str) -> Option<(usize, Vec<usize>)> {
    let group = mesh.group(group)?;
    [2, 1].into_iter().find_map(|dimension| {
        let elements: Vec<usize> = group
            .elements
            .iter()
            .copied()
            .filter(|id| mesh.element(*id).map(|e| e.dimension) == Some(dimension))
            .collect();
        (!elements.is_empty()).then_some((dimension, elements))
    })
}

/// Projects every active point of every data group onto the matching mesh
/// group. Failures are confined to their group and collected in the report.
pub fn project_data(
    mesh: &Mesh,
    data: &mut PointCloud,
    outliers: &OutlierRejection,
    diagnostics: &Diagnostics,
) -> ProjectionReport {
    let mut report = ProjectionReport::default();
    let revision = mesh.revision();

    let hints: HashMap<usize, MeshLocation> = data
        .points()
        .iter()
        .filter_map(|p| p.projection.map(|projection| (p.id, projection.location)))
        .collect();
    for point in data.points_mut().iter_mut().filter(|p| p.active) {
        point.projection = None;
    }

    let group_names: Vec<String> = data.groups().iter().map(|g| g.name.clone()).collect();
    for name in group_names {
        let Some((dimension, elements)) = projection_elements(mesh, &name) else {
            diagnostics.warning(
                "projection",
                format_args!("Cannot project data for group {name} as no matching mesh group"),
            );
            report.skipped_groups.push(name);
            continue;
        };

        match project_group(mesh, data, &name, dimension, &elements, &hints, revision) {
            Ok(count) => {
                report.projected += count;
                if outliers.is_enabled() {
                    match reject_outliers(mesh, data, &name, outliers) {
                        Ok(deactivated) => report.deactivated += deactivated,
                        Err(err) => report.failures.push(err),
                    }
                }
            }
            Err(err) => {
                diagnostics.warning("projection", format_args!("{err}"));
                let members: Vec<usize> = data.group_points(&name).iter().map(|p| p.id).collect();
                for id in members {
                    if let Some(point) = data.point_mut(id) {
                        point.projection = None;
                    }
                }
                report.failures.push(err);
            }
        }
    }

    report.unprojected = data
        .points()
        .iter()
        .filter(|p| p.active && p.projection.is_none())
        .count();
    if report.unprojected > 0 {
        diagnostics.warning(
            "projection",
            format_args!("{} active data points were not projected", report.unprojected),
        );
    }
    if report.deactivated > 0 {
        diagnostics.info(format_args!("Deactivated {} outlier data points", report.deactivated));
    }

    report
}

fn project_group(
    mesh: &Mesh,
    data: &mut PointCloud,
    name: &str,
    dimension: usize,
    elements: &[usize],
    hints: &HashMap<usize, MeshLocation>,
    revision: u64,
) -> FitResult<usize> {
    let samples = ElementSamples::new(mesh, elements)?;
    let mut results = Vec::new();

    for point in data.group_points(name).into_iter().filter(|p| p.active) {
        let hint = hints.get(&point.id).filter(|h| samples.contains(h.element));
        let nearest = samples.nearest(mesh, &point.position, hint)?.ok_or_else(|| {
            FitterError::Projection(format!(
                "Group {name}: no valid mesh location for data point {}",
                point.id
            ))
        })?;
        let residual = nearest.position - point.position;
        let direction = if nearest.distance > 0.0 {
            residual / nearest.distance
        } else {
            Vector3::zeros()
        };
        results.push((
            point.id,
            Projection {
                location: nearest.location,
                dimension,
                residual,
                error: nearest.distance,
                direction,
                revision,
            },
        ));
    }

    let count = results.len();
    for (id, projection) in results {
        if let Some(point) = data.point_mut(id) {
            point.projection = Some(projection);
        }
    }
    Ok(count)
}

fn reject_outliers(
    mesh: &Mesh,
    data: &mut PointCloud,
    name: &str,
    outliers: &OutlierRejection,
) -> FitResult<usize> {
    let projected: Vec<(usize, Projection)> = data
        .group_points(name)
        .into_iter()
        .filter(|p| p.active)
        .filter_map(|p| p.projection.map(|projection| (p.id, projection)))
        .collect();
    let mut rejected: BTreeSet<usize> = BTreeSet::new();

    if let Some(percentile) = outliers.error_percentile {
        let mut errors: Vec<f64> = projected.iter().map(|(_, p)| p.error).collect();
        errors.sort_by(|a, b| a.total_cmp(b));
        if !errors.is_empty() {
            let rank = ((percentile * errors.len() as f64).ceil() as usize).clamp(1, errors.len());
            let threshold = errors[rank - 1];
            rejected.extend(
                projected
                    .iter()
                    .filter(|(_, p)| p.error > threshold)
                    .map(|(id, _)| *id),
            );
        }
    }

    if let Some(threshold) = outliers.normal_cosine_threshold {
        for (id, projection) in &projected {
            if projection.dimension != 2 || projection.error <= 0.0 {
                continue;
            }
            let sample = mesh.evaluate(&projection.location)?;
            let normal = sample.derivatives[0].cross(&sample.derivatives[1]);
            let length = normal.norm();
            if length > 0.0 && (projection.direction.dot(&normal) / length).abs() < threshold {
                rejected.insert(*id);
            }
        }
    }

    for id in &rejected {
        data.set_active(*id, false)?;
    }
    Ok(rejected.len())
}

/// Counts from matching marker data to model markers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MarkerLocationReport {
    pub located: usize,
    pub data_markers: usize,
    pub model_markers: usize,
}

/// Gives each marker data point the mesh location of the model marker with
/// the same name. Only names carried by exactly one data point and exactly one
/// model marker are located.
pub fn locate_marker_data(
    mesh: &Mesh,
    data: &mut PointCloud,
    marker_group: &str,
    diagnostics: &Diagnostics,
) -> MarkerLocationReport {
    for point in data.points_mut() {
        point.marker_location = None;
    }
    let markers = mesh
        .group(marker_group)
        .map(|g| g.markers.clone())
        .unwrap_or_default();
    let labelled: Vec<(usize, String)> = data
        .group_points(marker_group)
        .into_iter()
        .filter_map(|p| p.label.as_deref().map(|l| (p.id, normalize_name(l))))
        .collect();

    let mut report = MarkerLocationReport {
        located: 0,
        data_markers: data.group_points(marker_group).len(),
        model_markers: markers.len(),
    };
    for (id, name) in &labelled {
        if labelled.iter().filter(|(_, other)| other == name).count() != 1 {
            continue;
        }
        let mut matching = markers.iter().filter(|m| normalize_name(&m.name) == *name);
        let (Some(marker), None) = (matching.next(), matching.next()) else {
            continue;
        };
        if let Some(point) = data.point_mut(*id) {
            point.marker_location = Some(marker.location);
            report.located += 1;
        }
    }

    if report.located < report.data_markers {
        diagnostics.warning(
            "markers",
            format_args!(
                "Only {} of {} marker data points have model locations",
                report.located, report.data_markers
            ),
        );
    }
    if report.located < report.model_markers {
        diagnostics.warning(
            "markers",
            format_args!(
                "Only {} of {} marker model locations used",
                report.located, report.model_markers
            ),
        );
    }
    report
}
