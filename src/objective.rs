//! Least squares terms of the deformation fit.
//!
//! Every term is linear in the node parameters once projections and the
//! reference state are fixed, so the whole objective is assembled as one
//! sparse system `r = J p - b`.

use std::fmt;

use nalgebra::{DVector, Matrix3, Vector3};
use nalgebra_sparse::{CooMatrix, CsrMatrix};

use crate::basis::quadrature;
use crate::datatypes::MeshLocation;
use crate::error::{FitResult, FitterError};
use crate::mesh::{combine, FieldSample, Mesh, SlotTerm, QUADRATURE_POINTS};
use crate::point_cloud::PointCloud;

const DEGENERATE_MEASURE: f64 = 1e-12;

/// Weights of the optional objective terms; zero disables a term
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct ObjectiveWeights {
    pub marker: f64,
    pub strain: f64,
    pub curvature: f64,
    pub edge_discontinuity: f64,
}

impl ObjectiveWeights {
    pub fn validate(&self) -> FitResult<()> {
        let named = [
            ("marker", self.marker),
            ("strain penalty", self.strain),
            ("curvature penalty", self.curvature),
            ("edge discontinuity penalty", self.edge_discontinuity),
        ];
        for (name, weight) in named {
            if !weight.is_finite() || weight < 0.0 {
                return Err(FitterError::Configuration(format!(
                    "Fit: {name} weight {weight} must be finite and non-negative"
                )));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Term {
    LineData,
    SurfaceData,
    Marker,
    Strain,
    Curvature,
    EdgeDiscontinuity,
}

/// Value of each objective term
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct ObjectiveTerms {
    pub line_data: f64,
    pub surface_data: f64,
    pub marker: f64,
    pub strain: f64,
    pub curvature: f64,
    pub edge_discontinuity: f64,
}

impl ObjectiveTerms {
    pub fn total(&self) -> f64 {
        self.line_data
            + self.surface_data
            + self.marker
            + self.strain
            + self.curvature
            + self.edge_discontinuity
    }

    fn add(&mut self, term: Term, value: f64) {
        match term {
            Term::LineData => self.line_data += value,
            Term::SurfaceData => self.surface_data += value,
            Term::Marker => self.marker += value,
            Term::Strain => self.strain += value,
            Term::Curvature => self.curvature += value,
            Term::EdgeDiscontinuity => self.edge_discontinuity += value,
        }
    }
}

impl fmt::Display for ObjectiveTerms {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "data 1D {:.6e}, data 2D {:.6e}, marker {:.6e}, strain {:.6e}, curvature {:.6e}, edge {:.6e}, total {:.6e}",
            self.line_data,
            self.surface_data,
            self.marker,
            self.strain,
            self.curvature,
            self.edge_discontinuity,
            self.total()
        )
    }
}

/// Three residual rows sharing one set of slot coefficients, one row per
/// coordinate component: `scale * (sum_i c_i P_i - target)`
struct ResidualBlock {
    term: Term,
    coefficients: Vec<(usize, f64)>,
    target: Vector3<f64>,
    scale: f64,
}

impl ResidualBlock {
    /// Block penalising the change of a linear functional from its value in
    /// the reference state
    fn displacement(term: Term, coefficients: Vec<(usize, f64)>, reference: &[Vector3<f64>], scale: f64) -> ResidualBlock {
        let target: Vector3<f64> = coefficients
            .iter()
            .map(|(slot, c)| *c * reference[*slot])
            .sum();
        ResidualBlock {
            term,
            coefficients,
            target,
            scale,
        }
    }
}

/// The assembled objective `|J p - b|^2`
pub struct LinearResiduals {
    jacobian: CsrMatrix<f64>,
    targets: DVector<f64>,
    row_terms: Vec<Term>,
}

impl LinearResiduals {
    /// Builds every enabled term from the current projections and the
    /// reference state of the mesh.
    ///
    /// # Arguments
    /// * `mesh` - Geometry whose node parameters are the unknowns
    /// * `data` - Active projected points form the data term; points with a
    ///   marker location form the marker term
    /// * `weights` - Term weights, already validated
    ///
    /// # Returns
    /// The sparse system, possibly with no rows
    pub fn assemble(mesh: &Mesh, data: &PointCloud, weights: &ObjectiveWeights) -> FitResult<LinearResiduals> {
        let mut blocks = Vec::new();
        data_blocks(mesh, data, &mut blocks)?;
        if weights.marker > 0.0 {
            marker_blocks(mesh, data, weights.marker, &mut blocks)?;
        }
        if weights.strain > 0.0 || weights.curvature > 0.0 {
            deformation_blocks(mesh, weights, &mut blocks)?;
        }
        if weights.edge_discontinuity > 0.0 {
            edge_blocks(mesh, weights.edge_discontinuity, &mut blocks)?;
        }

        let rows = 3 * blocks.len();
        let mut coo = CooMatrix::new(rows, mesh.parameter_count());
        let mut targets = DVector::zeros(rows);
        let mut row_terms = Vec::with_capacity(rows);
        for (b, block) in blocks.iter().enumerate() {
            for k in 0..3 {
                let row = 3 * b + k;
                for (slot, c) in &block.coefficients {
                    if *c != 0.0 {
                        coo.push(row, 3 * slot + k, block.scale * c);
                    }
                }
                targets[row] = block.scale * block.target[k];
                row_terms.push(block.term);
            }
        }

        Ok(LinearResiduals {
            jacobian: CsrMatrix::from(&coo),
            targets,
            row_terms,
        })
    }

    pub fn is_empty(&self) -> bool {
        self.row_terms.is_empty()
    }

    pub fn jacobian(&self) -> &CsrMatrix<f64> {
        &self.jacobian
    }

    pub fn residuals(&self, parameters: &DVector<f64>) -> DVector<f64> {
        &self.jacobian * parameters - &self.targets
    }

    /// Splits a residual vector into the term values
    pub fn terms(&self, residuals: &DVector<f64>) -> ObjectiveTerms {
        let mut terms = ObjectiveTerms::default();
        for (term, r) in self.row_terms.iter().zip(residuals.iter()) {
            terms.add(*term, r * r);
        }
        terms
    }

    pub fn evaluate(&self, parameters: &DVector<f64>) -> ObjectiveTerms {
        self.terms(&self.residuals(parameters))
    }
}

/// Objective of the mesh's current state
pub fn evaluate_objective(mesh: &Mesh, data: &PointCloud, weights: &ObjectiveWeights) -> FitResult<ObjectiveTerms> {
    Ok(LinearResiduals::assemble(mesh, data, weights)?.evaluate(&mesh.parameters()))
}

fn values(terms: &[SlotTerm]) -> Vec<(usize, f64)> {
    terms.iter().map(|t| (t.slot, t.value)).collect()
}

fn data_blocks(mesh: &Mesh, data: &PointCloud, blocks: &mut Vec<ResidualBlock>) -> FitResult<()> {
    for point in data.points().iter().filter(|p| p.active) {
        let Some(projection) = point.projection else {
            continue;
        };
        let terms = mesh.slot_terms(projection.location.element, &projection.location.xi)?;
        blocks.push(ResidualBlock {
            term: if projection.dimension == 1 {
                Term::LineData
            } else {
                Term::SurfaceData
            },
            coefficients: values(&terms),
            target: point.position,
            scale: 1.0,
        });
    }
    Ok(())
}

fn marker_blocks(mesh: &Mesh, data: &PointCloud, weight: f64, blocks: &mut Vec<ResidualBlock>) -> FitResult<()> {
    for point in data.points().iter().filter(|p| p.active) {
        let Some(location) = point.marker_location else {
            continue;
        };
        let terms = mesh.slot_terms(location.element, &location.xi)?;
        blocks.push(ResidualBlock {
            term: Term::Marker,
            coefficients: values(&terms),
            target: point.position,
            scale: weight.sqrt(),
        });
    }
    Ok(())
}

/// Strain and curvature of the displacement from the reference state,
/// integrated over the highest dimension elements
fn deformation_blocks(mesh: &Mesh, weights: &ObjectiveWeights, blocks: &mut Vec<ResidualBlock>) -> FitResult<()> {
    let dimension = mesh.highest_dimension();
    if dimension == 0 {
        return Ok(());
    }
    let rule = quadrature(dimension, QUADRATURE_POINTS);
    let reference = mesh.reference_slots();

    for element in mesh.elements_of_dimension(dimension) {
        for (xi, qw) in &rule {
            let terms = mesh.slot_terms(element.id, &xi[..dimension])?;
            let sample = combine(&terms, reference, dimension);
            let penalties = if dimension == 3 {
                volume_penalties(&terms, &sample)
            } else {
                manifold_penalties(&terms, &sample, dimension)
            };
            let Some((measure, strain, curvature)) = penalties else {
                continue;
            };
            if weights.strain > 0.0 {
                let scale = (weights.strain * qw * measure).sqrt();
                for coefficients in strain {
                    blocks.push(ResidualBlock::displacement(Term::Strain, coefficients, reference, scale));
                }
            }
            if weights.curvature > 0.0 {
                let scale = (weights.curvature * qw * measure).sqrt();
                for coefficients in curvature {
                    blocks.push(ResidualBlock::displacement(Term::Curvature, coefficients, reference, scale));
                }
            }
        }
    }
    Ok(())
}

type Coefficients = Vec<(usize, f64)>;

/// Gradient and Hessian with respect to reference coordinates of a volume
/// element. Returns the Jacobian determinant with one coefficient set per
/// gradient component and per Hessian entry; None where the reference
/// element is degenerate.
fn volume_penalties(terms: &[SlotTerm], sample: &FieldSample) -> Option<(f64, Vec<Coefficients>, Vec<Coefficients>)> {
    let jacobian = Matrix3::from_columns(&sample.derivatives);
    let determinant = jacobian.determinant();
    if !(determinant.abs() > DEGENERATE_MEASURE) {
        return None;
    }
    let inverse = jacobian.try_inverse()?;
    // derivative of the inverse Jacobian along each element direction
    let inverse_derivatives: Vec<Matrix3<f64>> = (0..3)
        .map(|b| {
            let derivative = Matrix3::from_columns(&[
                sample.second[0][b],
                sample.second[1][b],
                sample.second[2][b],
            ]);
            -(inverse * derivative * inverse)
        })
        .collect();

    let strain: Vec<Coefficients> = (0..3)
        .map(|c| {
            terms
                .iter()
                .map(|t| (t.slot, (0..3).map(|a| t.first[a] * inverse[(a, c)]).sum::<f64>()))
                .collect()
        })
        .collect();

    let mut curvature: Vec<Coefficients> = Vec::with_capacity(9);
    for c in 0..3 {
        for e in 0..3 {
            curvature.push(
                terms
                    .iter()
                    .map(|t| {
                        let value: f64 = (0..3)
                            .map(|b| {
                                let inner: f64 = (0..3)
                                    .map(|a| {
                                        t.second[a][b] * inverse[(a, c)]
                                            + t.first[a] * inverse_derivatives[b][(a, c)]
                                    })
                                    .sum();
                                inverse[(b, e)] * inner
                            })
                            .sum();
                        (t.slot, value)
                    })
                    .collect(),
            );
        }
    }

    Some((determinant.abs(), strain, curvature))
}

/// Gradient and Hessian along each element direction of a surface or curve,
/// per unit reference arc length
fn manifold_penalties(
    terms: &[SlotTerm],
    sample: &FieldSample,
    dimension: usize,
) -> Option<(f64, Vec<Coefficients>, Vec<Coefficients>)> {
    let lengths: Vec<f64> = (0..dimension).map(|a| sample.derivatives[a].norm()).collect();
    if lengths.iter().any(|s| !(*s > DEGENERATE_MEASURE)) {
        return None;
    }
    let measure = if dimension == 2 {
        sample.derivatives[0].cross(&sample.derivatives[1]).norm()
    } else {
        lengths[0]
    };
    if !(measure > DEGENERATE_MEASURE) {
        return None;
    }

    let strain: Vec<Coefficients> = (0..dimension)
        .map(|a| terms.iter().map(|t| (t.slot, t.first[a] / lengths[a])).collect())
        .collect();

    let mut curvature: Vec<Coefficients> = Vec::with_capacity(dimension * dimension);
    for a in 0..dimension {
        for b in 0..dimension {
            // rate of change of the arc length along a, moving along b
            let stretch = sample.derivatives[a].dot(&sample.second[a][b]) / lengths[a];
            curvature.push(
                terms
                    .iter()
                    .map(|t| {
                        let value = (t.second[a][b] / lengths[a]
                            - t.first[a] * stretch / (lengths[a] * lengths[a]))
                            / lengths[b];
                        (t.slot, value)
                    })
                    .collect(),
            );
        }
    }

    Some((measure, strain, curvature))
}

/// Sum of the inward cross derivatives of the two faces meeting at each
/// line, integrated along the line
fn edge_blocks(mesh: &Mesh, weight: f64, blocks: &mut Vec<ResidualBlock>) -> FitResult<()> {
    let rule = quadrature(1, QUADRATURE_POINTS);
    for adjacency in mesh.line_adjacency() {
        if adjacency.sides.len() != 2 {
            continue;
        }
        for (xi, qw) in &rule {
            let t = xi[0];
            let line = mesh.evaluate_reference(&MeshLocation::new(adjacency.line, &[t]))?;
            let length = line.derivatives[0].norm();
            if !(length > DEGENERATE_MEASURE) {
                continue;
            }
            let mut coefficients = Vec::new();
            for side in &adjacency.sides {
                let mut face_xi = [0.0; 2];
                face_xi[side.axis] = side.at;
                face_xi[1 - side.axis] = if side.reversed { 1.0 - t } else { t };
                let inward = if side.at == 0.0 { 1.0 } else { -1.0 };
                let terms = mesh.slot_terms(side.face, &face_xi)?;
                coefficients.extend(terms.iter().map(|term| (term.slot, inward * term.first[side.axis])));
            }
            blocks.push(ResidualBlock {
                term: Term::EdgeDiscontinuity,
                coefficients,
                target: Vector3::zeros(),
                scale: (weight * qw * length).sqrt(),
            });
        }
    }
    Ok(())
}
