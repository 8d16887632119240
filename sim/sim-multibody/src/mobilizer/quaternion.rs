//! Quaternion-parameterized mobilizers.
//!
//! Orientation coordinates are a quaternion `[w, x, y, z]` for `R_JbJ`. The
//! angular generalized speeds are the angular velocity of J in Jb, expressed
//! in Jb, so the quaternion rates are
//!
//! ```text
//! q̇ = ½ (0, ω) ⊗ q
//! q̈ = ½ [(0, ω̇) ⊗ q + (0, ω) ⊗ q̇]
//! ```
//!
//! The quaternion is not kept at unit length by the kinematics; drivers call
//! [`Mobilizer::enforce_quaternion_constraints`] after each step.

use nalgebra::{Isometry3, Matrix6xX, Quaternion, Translation3, UnitQuaternion, Vector3};
use sim_types::{Result, SpatialVector};

use super::{JointSpeeds, JointType, Mobilizer};

/// Deviation from unit length that triggers renormalization.
const QUATERNION_NORM_TOL: f64 = 1e-14;

fn quaternion(q: &[f64]) -> Quaternion<f64> {
    Quaternion::new(q[0], q[1], q[2], q[3])
}

fn write_quaternion(quat: &Quaternion<f64>, out: &mut [f64]) {
    out[0] = quat.w;
    out[1] = quat.i;
    out[2] = quat.j;
    out[3] = quat.k;
}

fn pure(v: &[f64]) -> Quaternion<f64> {
    Quaternion::new(0.0, v[0], v[1], v[2])
}

fn rotation(q: &[f64]) -> UnitQuaternion<f64> {
    UnitQuaternion::from_quaternion(quaternion(q))
}

fn quaternion_rate(q: &[f64], w: &[f64], qdot: &mut [f64]) {
    write_quaternion(&((pure(w) * quaternion(q)) * 0.5), qdot);
}

fn quaternion_accel(q: &[f64], w: &[f64], wdot: &[f64], qdotdot: &mut [f64]) {
    let q4 = quaternion(q);
    let qdot = (pure(w) * q4) * 0.5;
    write_quaternion(&((pure(wdot) * q4 + pure(w) * qdot) * 0.5), qdotdot);
}

fn normalize(q: &mut [f64]) -> bool {
    let quat = quaternion(q);
    let norm = quat.norm();
    if norm == 0.0 {
        q[..4].copy_from_slice(&[1.0, 0.0, 0.0, 0.0]);
        return true;
    }
    if (norm - 1.0).abs() <= QUATERNION_NORM_TOL {
        return false;
    }
    write_quaternion(&(quat / norm), q);
    true
}

/// Spherical joint: three rotations about the common origin of Jb and J.
#[derive(Debug, Clone, Copy, Default)]
pub struct Ball;

impl Mobilizer for Ball {
    fn joint_type(&self) -> JointType {
        JointType::Ball
    }

    fn calc_cross_joint_transform(&self, q: &[f64]) -> Isometry3<f64> {
        Isometry3::from_parts(Translation3::identity(), rotation(q))
    }

    fn velocity_subspace(&self) -> Matrix6xX<f64> {
        let mut h = Matrix6xX::zeros(3);
        for i in 0..3 {
            h[(i, i)] = 1.0;
        }
        h
    }

    fn set_default_configuration_values(&self, q: &mut [f64]) {
        q[..4].copy_from_slice(&[1.0, 0.0, 0.0, 0.0]);
    }

    fn calc_qdot(&self, q: &[f64], u: &[f64], qdot: &mut [f64]) -> Result<()> {
        quaternion_rate(q, u, qdot);
        Ok(())
    }

    fn calc_qdotdot(&self, q: &[f64], u: &[f64], udot: &[f64], qdotdot: &mut [f64]) -> Result<()> {
        quaternion_accel(q, u, udot, qdotdot);
        Ok(())
    }

    fn set_vel_from_svel(&self, v_jbj: &SpatialVector) -> Result<JointSpeeds> {
        Ok(JointSpeeds::from_slice(&v_jbj.as_slice()[0..3]))
    }

    fn enforce_quaternion_constraints(&self, q: &mut [f64]) -> bool {
        normalize(q)
    }
}

/// Unrestricted joint: quaternion orientation plus translation of J in Jb.
///
/// `q = [w, x, y, z, px, py, pz]`, `u = [ω; v]` with `v` the velocity of the
/// J origin in Jb, expressed in Jb.
#[derive(Debug, Clone, Copy, Default)]
pub struct Free;

impl Mobilizer for Free {
    fn joint_type(&self) -> JointType {
        JointType::Free
    }

    fn calc_cross_joint_transform(&self, q: &[f64]) -> Isometry3<f64> {
        Isometry3::from_parts(
            Translation3::from(Vector3::new(q[4], q[5], q[6])),
            rotation(q),
        )
    }

    fn velocity_subspace(&self) -> Matrix6xX<f64> {
        let mut h = Matrix6xX::zeros(6);
        for i in 0..6 {
            h[(i, i)] = 1.0;
        }
        h
    }

    fn set_default_configuration_values(&self, q: &mut [f64]) {
        q[..7].copy_from_slice(&[1.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0]);
    }

    fn calc_qdot(&self, q: &[f64], u: &[f64], qdot: &mut [f64]) -> Result<()> {
        quaternion_rate(q, &u[0..3], qdot);
        qdot[4..7].copy_from_slice(&u[3..6]);
        Ok(())
    }

    fn calc_qdotdot(&self, q: &[f64], u: &[f64], udot: &[f64], qdotdot: &mut [f64]) -> Result<()> {
        quaternion_accel(q, &u[0..3], &udot[0..3], qdotdot);
        qdotdot[4..7].copy_from_slice(&udot[3..6]);
        Ok(())
    }

    fn set_vel_from_svel(&self, v_jbj: &SpatialVector) -> Result<JointSpeeds> {
        Ok(JointSpeeds::from_slice(v_jbj.as_slice()))
    }

    fn enforce_quaternion_constraints(&self, q: &mut [f64]) -> bool {
        normalize(q)
    }
}
