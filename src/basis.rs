//! Tensor-product interpolation bases and Gauss quadrature.
//!
//! An element of dimension `d` has `2^d` corner nodes ordered with the first
//! element direction varying fastest. Along each direction the field is either
//! linear Lagrange (value only) or cubic Hermite (value and derivative).

use crate::datatypes::ValueLabel;
use crate::error::{FitResult, FitterError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BasisFunction {
    LinearLagrange,
    CubicHermite,
}

/// Contribution of one node parameter to the interpolated field.
///
/// Derivatives are taken with respect to element coordinates; only the first
/// `dimension` entries are meaningful.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BasisTerm {
    pub corner: usize,
    pub label: ValueLabel,
    pub value: f64,
    pub first: [f64; 3],
    pub second: [[f64; 3]; 3],
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Basis {
    functions: Vec<BasisFunction>,
}

impl Basis {
    pub fn new(functions: Vec<BasisFunction>) -> FitResult<Basis> {
        if functions.is_empty() || functions.len() > 3 {
            return Err(FitterError::Configuration(format!(
                "Basis must have 1 to 3 directions, got {}",
                functions.len()
            )));
        }
        Ok(Basis { functions })
    }

    /// Linear Lagrange in every direction: line, bilinear quad, trilinear hex
    pub fn linear_lagrange(dimension: usize) -> FitResult<Basis> {
        Basis::new(vec![BasisFunction::LinearLagrange; dimension])
    }

    /// Cubic Hermite in every direction
    pub fn cubic_hermite(dimension: usize) -> FitResult<Basis> {
        Basis::new(vec![BasisFunction::CubicHermite; dimension])
    }

    pub fn dimension(&self) -> usize {
        self.functions.len()
    }

    pub fn corner_count(&self) -> usize {
        1 << self.functions.len()
    }

    pub fn functions(&self) -> &[BasisFunction] {
        &self.functions
    }

    /// Bit mask of the directions interpolated with cubic Hermite
    fn hermite_mask(&self) -> usize {
        self.functions
            .iter()
            .enumerate()
            .filter(|(_, f)| **f == BasisFunction::CubicHermite)
            .fold(0, |mask, (axis, _)| mask | (1 << axis))
    }

    /// Node parameter labels this basis reads at every corner
    pub fn labels(&self) -> Vec<ValueLabel> {
        let hermite = self.hermite_mask();
        (0..8)
            .filter(|mask| mask & !hermite == 0)
            .filter_map(ValueLabel::from_mask)
            .collect()
    }

    /// Evaluates every basis term at `xi`.
    ///
    /// # Arguments
    /// * `xi` - Element coordinates, at least `dimension` entries
    ///
    /// # Returns
    /// One term per (corner, label) pair, corners in tensor order
    pub fn evaluate(&self, xi: &[f64]) -> Vec<BasisTerm> {
        let dimension = self.dimension();
        let labels = self.labels();
        let mut terms = Vec::with_capacity(self.corner_count() * labels.len());

        for corner in 0..self.corner_count() {
            for label in &labels {
                // value, first and second derivative along each direction
                let mut factors = [[1.0, 0.0, 0.0]; 3];
                for axis in 0..dimension {
                    let node_bit = (corner >> axis) & 1;
                    let derivative_bit = (label.mask() >> axis) & 1;
                    factors[axis] =
                        shape_1d(self.functions[axis], node_bit, derivative_bit, xi[axis]);
                }

                let product = |skip: &[usize]| -> f64 {
                    (0..dimension)
                        .filter(|axis| !skip.contains(axis))
                        .map(|axis| factors[axis][0])
                        .product()
                };

                let mut term = BasisTerm {
                    corner,
                    label: *label,
                    value: product(&[]),
                    first: [0.0; 3],
                    second: [[0.0; 3]; 3],
                };
                for a in 0..dimension {
                    term.first[a] = factors[a][1] * product(&[a]);
                    for b in 0..dimension {
                        term.second[a][b] = if a == b {
                            factors[a][2] * product(&[a])
                        } else {
                            factors[a][1] * factors[b][1] * product(&[a, b])
                        };
                    }
                }
                terms.push(term);
            }
        }

        terms
    }
}

/// One dimensional shape function with its first and second derivatives.
///
/// # Arguments
/// * `function` - Interpolation along this direction
/// * `node` - 0 for the node at xi = 0, 1 for the node at xi = 1
/// * `derivative` - 1 selects the Hermite derivative function
/// * `xi` - Element coordinate
fn shape_1d(function: BasisFunction, node: usize, derivative: usize, xi: f64) -> [f64; 3] {
    match (function, node, derivative) {
        (BasisFunction::LinearLagrange, 0, _) => [1.0 - xi, -1.0, 0.0],
        (BasisFunction::LinearLagrange, _, _) => [xi, 1.0, 0.0],
        (BasisFunction::CubicHermite, 0, 0) => [
            1.0 - 3.0 * xi * xi + 2.0 * xi * xi * xi,
            -6.0 * xi + 6.0 * xi * xi,
            -6.0 + 12.0 * xi,
        ],
        (BasisFunction::CubicHermite, 0, _) => [
            xi - 2.0 * xi * xi + xi * xi * xi,
            1.0 - 4.0 * xi + 3.0 * xi * xi,
            -4.0 + 6.0 * xi,
        ],
        (BasisFunction::CubicHermite, _, 0) => [
            3.0 * xi * xi - 2.0 * xi * xi * xi,
            6.0 * xi - 6.0 * xi * xi,
            6.0 - 12.0 * xi,
        ],
        (BasisFunction::CubicHermite, _, _) => [
            xi * xi * xi - xi * xi,
            3.0 * xi * xi - 2.0 * xi,
            6.0 * xi - 2.0,
        ],
    }
}

/// Gauss-Legendre points and weights on [0, 1]
pub fn gauss_points(count: usize) -> Vec<(f64, f64)> {
    let rule: &[(f64, f64)] = match count {
        0 | 1 => &[(0.0, 2.0)],
        2 => &[(-0.577_350_269_189_625_8, 1.0), (0.577_350_269_189_625_8, 1.0)],
        3 => &[
            (-0.774_596_669_241_483_4, 0.555_555_555_555_555_6),
            (0.0, 0.888_888_888_888_888_9),
            (0.774_596_669_241_483_4, 0.555_555_555_555_555_6),
        ],
        _ => &[
            (-0.861_136_311_594_052_6, 0.347_854_845_137_453_9),
            (-0.339_981_043_584_856_3, 0.652_145_154_862_546_1),
            (0.339_981_043_584_856_3, 0.652_145_154_862_546_1),
            (0.861_136_311_594_052_6, 0.347_854_845_137_453_9),
        ],
    };
    rule.iter()
        .map(|(x, w)| (0.5 * (x + 1.0), 0.5 * w))
        .collect()
}

/// Tensor-product Gauss rule over the unit element of `dimension`
pub fn quadrature(dimension: usize, count: usize) -> Vec<([f64; 3], f64)> {
    let points = gauss_points(count);
    let mut rule = vec![([0.0; 3], 1.0)];
    for axis in 0..dimension {
        rule = rule
            .into_iter()
            .flat_map(|(xi, weight)| {
                points.iter().map(move |(x, w)| {
                    let mut next = xi;
                    next[axis] = *x;
                    (next, weight * w)
                })
            })
            .collect();
    }
    rule
}
