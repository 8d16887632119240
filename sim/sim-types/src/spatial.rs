//! Spatial algebra for 6D motion and force vectors.
//!
//! Every spatial quantity is laid out `[angular; linear]`:
//! - Motion vectors: `[ω; v]` (angular velocity, linear velocity of a point)
//! - Force vectors: `[τ; f]` (moment about a point, force)
//!
//! Quantities are taken about a named point (usually a body origin) and
//! expressed in the ground frame unless stated otherwise. Functions here are
//! pure math with no tree or state dependencies.

use nalgebra::{Matrix3, Matrix6, Vector3, Vector6};

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// 6D spatial vector: `[angular (3); linear (3)]`.
pub type SpatialVector = Vector6<f64>;

/// 6×6 spatial matrix operating on [`SpatialVector`]s.
pub type SpatialMatrix = Matrix6<f64>;

/// Assemble a spatial vector from its angular and linear halves.
#[inline]
#[must_use]
pub fn spatial_vector(angular: &Vector3<f64>, linear: &Vector3<f64>) -> SpatialVector {
    SpatialVector::new(
        angular.x, angular.y, angular.z, linear.x, linear.y, linear.z,
    )
}

/// Angular half of a spatial vector.
#[inline]
#[must_use]
pub fn angular(v: &SpatialVector) -> Vector3<f64> {
    Vector3::new(v[0], v[1], v[2])
}

/// Linear half of a spatial vector.
#[inline]
#[must_use]
pub fn linear(v: &SpatialVector) -> Vector3<f64> {
    Vector3::new(v[3], v[4], v[5])
}

/// Skew-symmetric cross-product matrix: `cross_matrix(a) * b == a × b`.
#[inline]
#[must_use]
pub fn cross_matrix(a: &Vector3<f64>) -> Matrix3<f64> {
    Matrix3::new(0.0, -a.z, a.y, a.z, 0.0, -a.x, -a.y, a.x, 0.0)
}

/// Spatial inertia of a rigid body about its origin, in ground.
///
/// `com` is the vector from the body origin to the center of mass and
/// `inertia_origin` the rotational inertia about the body origin, both
/// already expressed in ground.
///
/// ```text
/// M = [ I_O      m [c]× ]
///     [ -m [c]×  m E    ]
/// ```
#[must_use]
pub fn spatial_inertia(mass: f64, com: &Vector3<f64>, inertia_origin: &Matrix3<f64>) -> SpatialMatrix {
    let mc = cross_matrix(com) * mass;
    let mut m = SpatialMatrix::zeros();
    m.fixed_view_mut::<3, 3>(0, 0).copy_from(inertia_origin);
    m.fixed_view_mut::<3, 3>(0, 3).copy_from(&mc);
    m.fixed_view_mut::<3, 3>(3, 0).copy_from(&(-mc));
    m.fixed_view_mut::<3, 3>(3, 3)
        .copy_from(&(Matrix3::identity() * mass));
    m
}

/// Rigid-body shift operator between a body origin and its parent's origin.
///
/// `l` is the vector from the parent origin P to the body origin B, in
/// ground. As a matrix
///
/// ```text
/// Φ = [ E  [l]× ]
///     [ 0   E   ]
/// ```
///
/// `Φ` moves a spatial force from B to P and `Φᵀ` moves a spatial velocity
/// from P to B. Only `l` is stored; the products are evaluated directly.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct PhiMatrix {
    /// Offset from the parent origin to the body origin, in ground.
    pub l: Vector3<f64>,
}

impl Default for PhiMatrix {
    fn default() -> Self {
        Self::identity()
    }
}

impl PhiMatrix {
    /// Shift over the given offset.
    #[must_use]
    pub const fn new(l: Vector3<f64>) -> Self {
        Self { l }
    }

    /// Zero-length shift.
    #[must_use]
    pub fn identity() -> Self {
        Self { l: Vector3::zeros() }
    }

    /// `Φ·F`: re-express a spatial force about the parent origin.
    #[inline]
    #[must_use]
    pub fn shift_force(&self, f: &SpatialVector) -> SpatialVector {
        let force = linear(f);
        spatial_vector(&(angular(f) + self.l.cross(&force)), &force)
    }

    /// `Φᵀ·V`: carry a parent spatial velocity (or acceleration) to the body origin.
    #[inline]
    #[must_use]
    pub fn shift_motion(&self, v: &SpatialVector) -> SpatialVector {
        let w = angular(v);
        spatial_vector(&w, &(linear(v) + w.cross(&self.l)))
    }

    /// `Φ·M·Φᵀ`: re-express a spatial inertia about the parent origin.
    #[must_use]
    pub fn shift_inertia(&self, m: &SpatialMatrix) -> SpatialMatrix {
        let phi = self.to_matrix();
        phi * m * phi.transpose()
    }

    /// Dense 6×6 form.
    #[must_use]
    pub fn to_matrix(&self) -> SpatialMatrix {
        let mut phi = SpatialMatrix::identity();
        phi.fixed_view_mut::<3, 3>(0, 3)
            .copy_from(&cross_matrix(&self.l));
        phi
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_cross_matrix_matches_cross_product() {
        let a = Vector3::new(1.0, -2.0, 0.5);
        let b = Vector3::new(0.3, 4.0, -1.0);
        assert_relative_eq!(cross_matrix(&a) * b, a.cross(&b), epsilon = 1e-12);
    }

    #[test]
    fn test_split_and_join() {
        let v = spatial_vector(&Vector3::new(1.0, 2.0, 3.0), &Vector3::new(4.0, 5.0, 6.0));
        assert_relative_eq!(angular(&v), Vector3::new(1.0, 2.0, 3.0));
        assert_relative_eq!(linear(&v), Vector3::new(4.0, 5.0, 6.0));
    }

    #[test]
    fn test_phi_products_match_dense_matrix() {
        let phi = PhiMatrix::new(Vector3::new(0.2, -1.0, 3.0));
        let dense = phi.to_matrix();
        let v = SpatialVector::new(1.0, -0.5, 2.0, 0.1, 0.7, -3.0);

        assert_relative_eq!(phi.shift_force(&v), dense * v, epsilon = 1e-12);
        assert_relative_eq!(phi.shift_motion(&v), dense.transpose() * v, epsilon = 1e-12);
    }

    #[test]
    fn test_shift_motion_is_rigid_velocity_transfer() {
        // Parent spinning about z at the origin, child origin one unit along x
        let phi = PhiMatrix::new(Vector3::x());
        let v_parent = spatial_vector(&Vector3::z(), &Vector3::zeros());
        let v_child = phi.shift_motion(&v_parent);
        assert_relative_eq!(linear(&v_child), Vector3::y(), epsilon = 1e-12);
    }

    #[test]
    fn test_shift_force_adds_moment() {
        // Unit force along y applied at a point one unit along x
        let phi = PhiMatrix::new(Vector3::x());
        let f = spatial_vector(&Vector3::zeros(), &Vector3::y());
        let shifted = phi.shift_force(&f);
        assert_relative_eq!(angular(&shifted), Vector3::z(), epsilon = 1e-12);
        assert_relative_eq!(linear(&shifted), Vector3::y(), epsilon = 1e-12);
    }

    #[test]
    fn test_shifted_point_mass_inertia() {
        // Point mass at the body origin, body origin at l from the parent
        let l = Vector3::new(1.0, 2.0, 0.0);
        let m = spatial_inertia(2.0, &Vector3::zeros(), &Matrix3::zeros());
        let shifted = PhiMatrix::new(l).shift_inertia(&m);

        // Same body viewed with its mass offset by l from the new origin
        let i_o = (Matrix3::identity() * l.norm_squared() - l * l.transpose()) * 2.0;
        let expected = spatial_inertia(2.0, &l, &i_o);
        assert_relative_eq!(shifted, expected, epsilon = 1e-12);
    }

    #[test]
    fn test_spatial_inertia_momentum() {
        // Momentum of a point mass at c moving with body velocity [ω; v]
        let c = Vector3::new(0.0, 1.0, 0.0);
        let mass = 3.0;
        let i_o = (Matrix3::identity() * c.norm_squared() - c * c.transpose()) * mass;
        let m = spatial_inertia(mass, &c, &i_o);

        let w = Vector3::new(0.0, 0.0, 2.0);
        let v = Vector3::new(1.0, 0.0, 0.0);
        let h = m * spatial_vector(&w, &v);

        let v_com = v + w.cross(&c);
        assert_relative_eq!(linear(&h), v_com * mass, epsilon = 1e-12);
        assert_relative_eq!(angular(&h), c.cross(&(v_com * mass)), epsilon = 1e-12);
    }
}
