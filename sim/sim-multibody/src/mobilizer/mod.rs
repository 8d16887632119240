//! Joint (mobilizer) variants.
//!
//! A mobilizer describes how a body's joint frame J moves relative to the
//! parent's attachment frame Jb. It supplies
//!
//! - the cross-joint transform `X_JbJ(q)`,
//! - the velocity subspace: the spatial velocity of J in Jb per unit of each
//!   generalized speed, expressed in Jb and taken about the J origin,
//! - the kinematic relations between q and u.
//!
//! Every velocity subspace here is constant in Jb. The tree's Coriolis terms
//! rely on that.
//!
//! Capabilities a joint type has no meaning for return
//! [`SimError::Unsupported`].

mod axial;
mod quaternion;
mod simple;

pub use axial::{Pin, Slider};
pub use quaternion::{Ball, Free};
pub use simple::{Ground, Weld};

use nalgebra::{Isometry3, Matrix6xX};
use sim_types::{Result, SimError, SpatialVector};
use smallvec::SmallVec;
use std::fmt;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// Generalized speeds of one joint (at most six).
pub type JointSpeeds = SmallVec<[f64; 6]>;

/// Joint type tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum JointType {
    /// The immobile root of the tree.
    Ground,
    /// Rigid attachment, no degrees of freedom.
    Weld,
    /// One rotation about the joint z axis.
    Pin,
    /// One translation along the joint x axis.
    Slider,
    /// Three rotations, quaternion coordinates.
    Ball,
    /// Three rotations and three translations, quaternion coordinates.
    Free,
}

impl JointType {
    /// Lower-case name used in diagnostics.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Ground => "ground",
            Self::Weld => "weld",
            Self::Pin => "pin",
            Self::Slider => "slider",
            Self::Ball => "ball",
            Self::Free => "free",
        }
    }

    /// Number of generalized speeds.
    #[must_use]
    pub const fn dof(self) -> usize {
        match self {
            Self::Ground | Self::Weld => 0,
            Self::Pin | Self::Slider => 1,
            Self::Ball => 3,
            Self::Free => 6,
        }
    }

    /// Number of generalized coordinates.
    #[must_use]
    pub const fn max_nq(self) -> usize {
        match self {
            Self::Ground | Self::Weld => 0,
            Self::Pin | Self::Slider => 1,
            Self::Ball => 4,
            Self::Free => 7,
        }
    }
}

impl fmt::Display for JointType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Per-joint-type kinematics.
///
/// `q`, `u` and their derivatives are the joint's own slices of the global
/// state vectors, of length [`max_nq`](Mobilizer::max_nq) and
/// [`dof`](Mobilizer::dof).
pub trait Mobilizer: fmt::Debug + Send + Sync {
    /// The type tag.
    fn joint_type(&self) -> JointType;

    /// Whether the joint was defined child-to-parent.
    fn is_reversed(&self) -> bool {
        false
    }

    /// Number of generalized speeds.
    fn dof(&self) -> usize {
        self.joint_type().dof()
    }

    /// Number of generalized coordinates.
    fn max_nq(&self) -> usize {
        self.joint_type().max_nq()
    }

    /// Coordinates in use for the given q; never more than `max_nq`.
    fn nq(&self, _q: &[f64]) -> usize {
        self.max_nq()
    }

    /// `X_JbJ` for the given coordinates.
    fn calc_cross_joint_transform(&self, q: &[f64]) -> Isometry3<f64>;

    /// Velocity subspace in Jb about the J origin (6 × dof).
    fn velocity_subspace(&self) -> Matrix6xX<f64>;

    /// Write the coordinates of the reference configuration.
    fn set_default_configuration_values(&self, _q: &mut [f64]) {}

    /// Write the default generalized speeds.
    fn set_default_motion_values(&self, _u: &mut [f64]) {}

    /// `q̇` from `q` and `u`.
    fn calc_qdot(&self, _q: &[f64], _u: &[f64], _qdot: &mut [f64]) -> Result<()> {
        Err(self.unsupported("calc_qdot"))
    }

    /// `q̈` from `q`, `u` and `u̇`.
    fn calc_qdotdot(
        &self,
        _q: &[f64],
        _u: &[f64],
        _udot: &[f64],
        _qdotdot: &mut [f64],
    ) -> Result<()> {
        Err(self.unsupported("calc_qdotdot"))
    }

    /// Generalized speeds reproducing a cross-joint spatial velocity.
    ///
    /// `v_jbj` is the velocity of J in Jb, expressed in Jb about the J
    /// origin. Components outside the joint's subspace are dropped.
    fn set_vel_from_svel(&self, _v_jbj: &SpatialVector) -> Result<JointSpeeds> {
        Err(self.unsupported("set_vel_from_svel"))
    }

    /// Renormalize quaternion coordinates; returns whether anything changed.
    fn enforce_quaternion_constraints(&self, _q: &mut [f64]) -> bool {
        false
    }

    /// Error for a capability this joint type lacks.
    fn unsupported(&self, operation: &'static str) -> SimError {
        SimError::unsupported(self.joint_type().name(), operation)
    }
}

/// Build the mobilizer for a joint type.
///
/// Reversal is only meaningful for the single-axis joints; reversed ball and
/// free joints are rejected.
pub fn create_mobilizer(joint_type: JointType, is_reversed: bool) -> Result<Box<dyn Mobilizer>> {
    let mobilizer: Box<dyn Mobilizer> = match joint_type {
        JointType::Ground => Box::new(Ground),
        JointType::Weld => Box::new(Weld),
        JointType::Pin => Box::new(Pin::new(is_reversed)),
        JointType::Slider => Box::new(Slider::new(is_reversed)),
        JointType::Ball if is_reversed => {
            return Err(SimError::unsupported("ball", "reversed mobilizer"))
        }
        JointType::Free if is_reversed => {
            return Err(SimError::unsupported("free", "reversed mobilizer"))
        }
        JointType::Ball => Box::new(Ball),
        JointType::Free => Box::new(Free),
    };
    Ok(mobilizer)
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_joint_type_counts() {
        for jt in [
            JointType::Ground,
            JointType::Weld,
            JointType::Pin,
            JointType::Slider,
            JointType::Ball,
            JointType::Free,
        ] {
            let mob = create_mobilizer(jt, false).unwrap();
            assert_eq!(mob.joint_type(), jt);
            assert_eq!(mob.dof(), jt.dof());
            assert_eq!(mob.max_nq(), jt.max_nq());
            assert_eq!(mob.nq(&[0.0; 7]), jt.max_nq());
            assert_eq!(mob.velocity_subspace().ncols(), jt.dof());
        }
    }

    #[test]
    fn test_reversed_quaternion_joints_rejected() {
        assert!(create_mobilizer(JointType::Ball, true)
            .unwrap_err()
            .is_unsupported());
        assert!(create_mobilizer(JointType::Free, true)
            .unwrap_err()
            .is_unsupported());
        assert!(create_mobilizer(JointType::Pin, true).unwrap().is_reversed());
    }

    #[test]
    fn test_joint_type_display() {
        assert_eq!(JointType::Slider.to_string(), "slider");
    }
}
