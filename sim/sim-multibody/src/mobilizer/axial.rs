//! Single-axis mobilizers.

use nalgebra::{Isometry3, Matrix6xX, Translation3, UnitQuaternion, Vector3};
use sim_types::{Result, SpatialVector};

use super::{JointSpeeds, JointType, Mobilizer};

/// Rotation about the common z axis of Jb and J.
#[derive(Debug, Clone, Copy, Default)]
pub struct Pin {
    reversed: bool,
}

impl Pin {
    /// Pin joint; a reversed pin turns the other way for the same q.
    #[must_use]
    pub const fn new(reversed: bool) -> Self {
        Self { reversed }
    }

    fn sign(self) -> f64 {
        if self.reversed {
            -1.0
        } else {
            1.0
        }
    }
}

impl Mobilizer for Pin {
    fn joint_type(&self) -> JointType {
        JointType::Pin
    }

    fn is_reversed(&self) -> bool {
        self.reversed
    }

    fn calc_cross_joint_transform(&self, q: &[f64]) -> Isometry3<f64> {
        let angle = self.sign() * q[0];
        Isometry3::from_parts(
            Translation3::identity(),
            UnitQuaternion::from_axis_angle(&Vector3::z_axis(), angle),
        )
    }

    fn velocity_subspace(&self) -> Matrix6xX<f64> {
        let mut h = Matrix6xX::zeros(1);
        h[(2, 0)] = self.sign();
        h
    }

    fn calc_qdot(&self, _q: &[f64], u: &[f64], qdot: &mut [f64]) -> Result<()> {
        qdot[0] = u[0];
        Ok(())
    }

    fn calc_qdotdot(
        &self,
        _q: &[f64],
        _u: &[f64],
        udot: &[f64],
        qdotdot: &mut [f64],
    ) -> Result<()> {
        qdotdot[0] = udot[0];
        Ok(())
    }

    fn set_vel_from_svel(&self, v_jbj: &SpatialVector) -> Result<JointSpeeds> {
        Ok(JointSpeeds::from_slice(&[self.sign() * v_jbj[2]]))
    }
}

/// Translation along the common x axis of Jb and J.
#[derive(Debug, Clone, Copy, Default)]
pub struct Slider {
    reversed: bool,
}

impl Slider {
    /// Slider joint; a reversed slider moves the other way for the same q.
    #[must_use]
    pub const fn new(reversed: bool) -> Self {
        Self { reversed }
    }

    fn sign(self) -> f64 {
        if self.reversed {
            -1.0
        } else {
            1.0
        }
    }
}

impl Mobilizer for Slider {
    fn joint_type(&self) -> JointType {
        JointType::Slider
    }

    fn is_reversed(&self) -> bool {
        self.reversed
    }

    fn calc_cross_joint_transform(&self, q: &[f64]) -> Isometry3<f64> {
        Isometry3::translation(self.sign() * q[0], 0.0, 0.0)
    }

    fn velocity_subspace(&self) -> Matrix6xX<f64> {
        let mut h = Matrix6xX::zeros(1);
        h[(3, 0)] = self.sign();
        h
    }

    fn calc_qdot(&self, _q: &[f64], u: &[f64], qdot: &mut [f64]) -> Result<()> {
        qdot[0] = u[0];
        Ok(())
    }

    fn calc_qdotdot(
        &self,
        _q: &[f64],
        _u: &[f64],
        udot: &[f64],
        qdotdot: &mut [f64],
    ) -> Result<()> {
        qdotdot[0] = udot[0];
        Ok(())
    }

    fn set_vel_from_svel(&self, v_jbj: &SpatialVector) -> Result<JointSpeeds> {
        Ok(JointSpeeds::from_slice(&[self.sign() * v_jbj[3]]))
    }
}
