//! Impulse solvers for contact, friction and bilateral constraints.
//!
//! This crate resolves the multiplier system a time-stepping driver assembles
//! when contacts or constraints are active:
//!
//! ```text
//! A π = rhs      A = G M⁻¹ Gᵀ + diag(D)
//! ```
//!
//! subject to per-constraint complementarity rules. The resulting impulses
//! `π` are mapped back to generalized velocities by the caller.
//!
//! # Constraint Partitions
//!
//! The participating rows are split into partitions, each with its own
//! projection rule:
//!
//! - [`UncondRt`]: Always-enforced equality groups of 1–6 rows
//! - [`UniContactRt`]: Non-penetration normal with optional friction pair
//! - [`UniSpeedRt`]: One-sided speed constraint
//! - [`BoundedRt`]: Scalar with constant bounds
//! - [`StateLtdFrictionRt`]: Friction limited by a known normal force
//! - [`ConstraintLtdFrictionRt`]: Friction limited by solved normals
//!
//! # Solvers
//!
//! - [`PgsImpulseSolver`]: Projected Gauss-Seidel with adaptive SOR
//!
//! All solvers implement [`ImpulseSolver`], which reports convergence as a
//! boolean and keeps per-phase diagnostic counters on the instance.
//!
//! # Example
//!
//! ```
//! use nalgebra::{DMatrix, DVector};
//! use sim_constraint::{
//!     ConstraintPartitions, ImpulseSolver, PgsImpulseSolver, UniCond, UniContactRt,
//! };
//!
//! // One contact pushing apart (sign -1 allows non-negative impulses)
//! let a = DMatrix::from_element(1, 1, 0.5);
//! let d = DVector::zeros(1);
//! let rhs = DVector::from_element(1, 1.0);
//! let mut pi = DVector::zeros(1);
//!
//! let mut partitions = ConstraintPartitions::new();
//! partitions.uni_contact.push(UniContactRt::new(0, -1.0));
//!
//! let mut solver = PgsImpulseSolver::default();
//! assert!(solver.solve(0, &[0], &a, &d, &rhs, &mut pi, &mut partitions));
//! assert!((pi[0] - 2.0).abs() < 1e-9);
//! assert_eq!(partitions.uni_contact[0].contact_cond, UniCond::Active);
//! ```

#![deny(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
#![warn(missing_docs)]
#![allow(clippy::missing_const_for_fn, clippy::cast_precision_loss)]

pub mod impulse;
mod pgs;

pub use impulse::{
    BndCond, BoundedRt, ConstraintLtdFrictionRt, ConstraintPartitions, ContactType, FricCond,
    ImpulseSolver, MultiplierIndex, PhaseCounters, SolverStats, StateLtdFrictionRt, UncondRt,
    UniCond, UniContactRt, UniSpeedRt,
};
pub use pgs::{PgsConfig, PgsImpulseSolver, PgsReport};
