//! Core types for multibody simulation.
//!
//! This crate provides the shared vocabulary of the multibody engine:
//!
//! - [`SpatialVector`], [`SpatialMatrix`], [`PhiMatrix`] - 6D spatial algebra
//! - [`MassProperties`] - Mass, center of mass, inertia about the COM
//! - [`NodeId`] - Stable index of a body in the tree
//! - [`Stage`] - Realization stages that gate cache access
//! - [`SimulationConfig`], [`Gravity`] - Step-level settings
//! - [`SimError`] - Error type shared by every crate in the workspace
//!
//! # Design Philosophy
//!
//! These types are **pure data** plus the small amount of math that has no
//! state dependency. The tree recursion lives in `sim-multibody` and the
//! impulse solver in `sim-constraint`; both speak in terms of these types.
//!
//! # Conventions
//!
//! - Spatial vectors are `[angular; linear]`.
//! - Per-body recursion quantities are expressed in the ground frame.
//! - Transforms compose as `X_AC = X_AB * X_BC` (matching inner labels).
//!
//! # Example
//!
//! ```
//! use sim_types::{spatial_vector, PhiMatrix};
//! use nalgebra::Vector3;
//!
//! // Parent spinning about z; child origin one unit along x
//! let phi = PhiMatrix::new(Vector3::x());
//! let v_parent = spatial_vector(&Vector3::z(), &Vector3::zeros());
//! let v_child = phi.shift_motion(&v_parent);
//!
//! assert!((v_child[4] - 1.0).abs() < 1e-12);
//! ```

#![deny(clippy::unwrap_used, clippy::expect_used)]
#![warn(missing_docs)]
// Allow certain clippy lints that are overly pedantic for type definitions
#![allow(
    clippy::missing_const_for_fn,     // Many methods can't be const due to nalgebra
    clippy::suboptimal_flops,          // mul_add style changes aren't always clearer
    clippy::cast_precision_loss,       // usize to f64 is fine for counts
    clippy::missing_errors_doc,        // Error docs added where non-obvious
)]

mod body;
mod config;
mod dynamics;
mod error;
pub mod spatial;
mod stage;

pub use body::{MassProperties, NodeId};
pub use config::SimulationConfig;
pub use dynamics::Gravity;
pub use error::SimError;
pub use spatial::{
    angular, cross_matrix, linear, spatial_inertia, spatial_vector, PhiMatrix, SpatialMatrix,
    SpatialVector,
};
pub use stage::Stage;

// Re-export math types for convenience
pub use nalgebra::{Isometry3, Matrix3, Point3, Translation3, UnitQuaternion, Vector3};

/// Result type for simulation operations.
pub type Result<T> = std::result::Result<T, SimError>;
