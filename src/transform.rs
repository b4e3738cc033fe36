use std::f64::consts::{FRAC_PI_2, PI};

use nalgebra::{DVector, Matrix3, Vector3};

/// Rotation, uniform scale and translation applied as `x' = s R x + t`.
///
/// `rotation` holds Euler angles `[azimuth, elevation, roll]`: azimuth about
/// z, then elevation about the rotated y, then roll about the rotated x, so
/// `R = Rz(azimuth) Ry(elevation) Rx(roll)`. The parametrization degenerates
/// at elevation = +/- pi/2.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SimilarityTransform {
    pub rotation: Vector3<f64>,
    pub scale: f64,
    pub translation: Vector3<f64>,
}

impl Default for SimilarityTransform {
    fn default() -> SimilarityTransform {
        SimilarityTransform::identity()
    }
}

impl SimilarityTransform {
    pub fn new(rotation: Vector3<f64>, scale: f64, translation: Vector3<f64>) -> SimilarityTransform {
        SimilarityTransform {
            rotation,
            scale,
            translation,
        }
    }

    pub fn identity() -> SimilarityTransform {
        SimilarityTransform::new(Vector3::zeros(), 1.0, Vector3::zeros())
    }

    pub fn is_identity(&self) -> bool {
        self.rotation == Vector3::zeros() && self.scale == 1.0 && self.translation == Vector3::zeros()
    }

    pub fn rotation_matrix(&self) -> Matrix3<f64> {
        let (sa, ca) = self.rotation[0].sin_cos();
        let (se, ce) = self.rotation[1].sin_cos();
        let (sr, cr) = self.rotation[2].sin_cos();
        Matrix3::new(
            ca * ce, ca * se * sr - sa * cr, ca * se * cr + sa * sr,
            sa * ce, sa * se * sr + ca * cr, sa * se * cr - ca * sr,
            -se, ce * sr, ce * cr,
        )
    }

    /// Derivatives of the rotation matrix with respect to azimuth, elevation
    /// and roll
    pub fn rotation_derivatives(&self) -> [Matrix3<f64>; 3] {
        let (sa, ca) = self.rotation[0].sin_cos();
        let (se, ce) = self.rotation[1].sin_cos();
        let (sr, cr) = self.rotation[2].sin_cos();

        let rz = Matrix3::new(ca, -sa, 0.0, sa, ca, 0.0, 0.0, 0.0, 1.0);
        let ry = Matrix3::new(ce, 0.0, se, 0.0, 1.0, 0.0, -se, 0.0, ce);
        let rx = Matrix3::new(1.0, 0.0, 0.0, 0.0, cr, -sr, 0.0, sr, cr);
        let drz = Matrix3::new(-sa, -ca, 0.0, ca, -sa, 0.0, 0.0, 0.0, 0.0);
        let dry = Matrix3::new(-se, 0.0, ce, 0.0, 0.0, 0.0, -ce, 0.0, -se);
        let drx = Matrix3::new(0.0, 0.0, 0.0, 0.0, -sr, -cr, 0.0, cr, -sr);

        [drz * ry * rx, rz * dry * rx, rz * ry * drx]
    }

    pub fn apply_point(&self, point: &Vector3<f64>) -> Vector3<f64> {
        self.scale * (self.rotation_matrix() * point) + self.translation
    }

    /// Transforms a direction or derivative: rotated and scaled, never
    /// translated
    pub fn apply_vector(&self, vector: &Vector3<f64>) -> Vector3<f64> {
        self.scale * (self.rotation_matrix() * vector)
    }

    /// Solver parameters `[azimuth, elevation, roll, ln(scale), tx, ty, tz]`.
    /// Scale is solved in log form so it stays positive.
    pub fn to_parameters(&self) -> DVector<f64> {
        DVector::from_vec(vec![
            self.rotation[0],
            self.rotation[1],
            self.rotation[2],
            self.scale.ln(),
            self.translation[0],
            self.translation[1],
            self.translation[2],
        ])
    }

    pub fn from_parameters(parameters: &DVector<f64>) -> SimilarityTransform {
        SimilarityTransform::new(
            Vector3::new(parameters[0], parameters[1], parameters[2]),
            parameters[3].exp(),
            Vector3::new(parameters[4], parameters[5], parameters[6]),
        )
    }

    /// Equivalent angles with azimuth and roll in (-pi, pi] and elevation in
    /// [-pi/2, pi/2]
    pub fn canonical(&self) -> SimilarityTransform {
        let mut azimuth = wrap_angle(self.rotation[0]);
        let mut elevation = wrap_angle(self.rotation[1]);
        let mut roll = wrap_angle(self.rotation[2]);
        if elevation.abs() > FRAC_PI_2 {
            elevation = wrap_angle(PI - elevation);
            azimuth = wrap_angle(azimuth + PI);
            roll = wrap_angle(roll + PI);
        }
        SimilarityTransform::new(Vector3::new(azimuth, elevation, roll), self.scale, self.translation)
    }
}

fn wrap_angle(angle: f64) -> f64 {
    let wrapped = angle.rem_euclid(2.0 * PI);
    if wrapped > PI {
        wrapped - 2.0 * PI
    } else {
        wrapped
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use nalgebra::Rotation3;
    use std::f64::consts::{FRAC_PI_4, FRAC_PI_8};

    #[test]
    fn rotation_is_azimuth_then_elevation_then_roll() {
        let t = SimilarityTransform::new(Vector3::new(0.3, -0.7, 1.1), 1.0, Vector3::zeros());
        let expected = Rotation3::from_axis_angle(&Vector3::z_axis(), 0.3)
            * Rotation3::from_axis_angle(&Vector3::y_axis(), -0.7)
            * Rotation3::from_axis_angle(&Vector3::x_axis(), 1.1);
        assert_relative_eq!(t.rotation_matrix(), *expected.matrix(), epsilon = 1e-14);
    }

    #[test]
    fn rotate_then_scale_then_translate() {
        let t = SimilarityTransform::new(
            Vector3::new(FRAC_PI_2, 0.0, 0.0),
            2.0,
            Vector3::new(0.0, 0.0, 1.0),
        );
        assert_relative_eq!(
            t.apply_point(&Vector3::new(1.0, 0.0, 0.0)),
            Vector3::new(0.0, 2.0, 1.0),
            epsilon = 1e-14
        );
        assert_relative_eq!(
            t.apply_vector(&Vector3::new(1.0, 0.0, 0.0)),
            Vector3::new(0.0, 2.0, 0.0),
            epsilon = 1e-14
        );
    }

    #[test]
    fn rotation_derivatives_match_finite_differences() {
        let t = SimilarityTransform::new(Vector3::new(FRAC_PI_4, FRAC_PI_8, FRAC_PI_2), 1.1, Vector3::zeros());
        let derivatives = t.rotation_derivatives();
        let h = 1e-6;
        for (axis, derivative) in derivatives.iter().enumerate() {
            let mut plus = t;
            let mut minus = t;
            plus.rotation[axis] += h;
            minus.rotation[axis] -= h;
            let numeric = (plus.rotation_matrix() - minus.rotation_matrix()) / (2.0 * h);
            assert_relative_eq!(*derivative, numeric, epsilon = 1e-8);
        }
    }

    #[test]
    fn parameters_round_trip() {
        let t = SimilarityTransform::new(Vector3::new(0.1, 0.2, 0.3), 1.1, Vector3::new(0.1, -0.2, 0.3));
        let back = SimilarityTransform::from_parameters(&t.to_parameters());
        assert_relative_eq!(back.scale, 1.1, epsilon = 1e-15);
        assert_eq!(back.rotation, t.rotation);
        assert_eq!(back.translation, t.translation);
    }

    #[test]
    fn canonical_angles_describe_the_same_rotation() {
        let t = SimilarityTransform::new(Vector3::new(0.4 + PI, PI - 0.2, -0.5 + PI), 1.0, Vector3::zeros());
        let canonical = t.canonical();
        assert_relative_eq!(canonical.rotation, Vector3::new(0.4, 0.2, -0.5), epsilon = 1e-12);
        assert_relative_eq!(canonical.rotation_matrix(), t.rotation_matrix(), epsilon = 1e-12);
    }
}
