//! Zero-dof mobilizers.

use nalgebra::{Isometry3, Matrix6xX};
use sim_types::{Result, SpatialVector};

use super::{JointSpeeds, JointType, Mobilizer};

/// The root of every tree.
///
/// Ground has no inboard joint, so only the transform and the empty subspace
/// are defined; every joint-space capability is unsupported.
#[derive(Debug, Clone, Copy, Default)]
pub struct Ground;

impl Mobilizer for Ground {
    fn joint_type(&self) -> JointType {
        JointType::Ground
    }

    fn calc_cross_joint_transform(&self, _q: &[f64]) -> Isometry3<f64> {
        Isometry3::identity()
    }

    fn velocity_subspace(&self) -> Matrix6xX<f64> {
        Matrix6xX::zeros(0)
    }
}

/// Rigid attachment to the parent.
#[derive(Debug, Clone, Copy, Default)]
pub struct Weld;

impl Mobilizer for Weld {
    fn joint_type(&self) -> JointType {
        JointType::Weld
    }

    fn calc_cross_joint_transform(&self, _q: &[f64]) -> Isometry3<f64> {
        Isometry3::identity()
    }

    fn velocity_subspace(&self) -> Matrix6xX<f64> {
        Matrix6xX::zeros(0)
    }

    fn calc_qdot(&self, _q: &[f64], _u: &[f64], _qdot: &mut [f64]) -> Result<()> {
        Ok(())
    }

    fn calc_qdotdot(
        &self,
        _q: &[f64],
        _u: &[f64],
        _udot: &[f64],
        _qdotdot: &mut [f64],
    ) -> Result<()> {
        Ok(())
    }

    fn set_vel_from_svel(&self, _v_jbj: &SpatialVector) -> Result<JointSpeeds> {
        Ok(JointSpeeds::new())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_ground_capabilities_unsupported() {
        let mut out = [0.0; 0];
        assert!(Ground.calc_qdot(&[], &[], &mut out).unwrap_err().is_unsupported());
        assert!(Ground
            .calc_qdotdot(&[], &[], &[], &mut out)
            .unwrap_err()
            .is_unsupported());
        assert!(Ground
            .set_vel_from_svel(&SpatialVector::zeros())
            .unwrap_err()
            .is_unsupported());
    }

    #[test]
    fn test_weld_is_identity() {
        assert_eq!(Weld.calc_cross_joint_transform(&[]), Isometry3::identity());
        let mut out = [0.0; 0];
        assert!(Weld.calc_qdot(&[], &[], &mut out).is_ok());
        assert!(Weld
            .set_vel_from_svel(&SpatialVector::repeat(1.0))
            .unwrap()
            .is_empty());
    }
}
