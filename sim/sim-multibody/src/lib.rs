//! Articulated rigid-body trees with O(n) recursive dynamics.
//!
//! A [`RigidBodyTree`] is built once by attaching bodies to ground through
//! joints ([`JointType`]). All simulation data lives in a separate
//! [`TreeState`], so one tree can drive many states.
//!
//! Computation is staged. Each stage fills a cache that later stages read:
//!
//! 1. **Configuration** - body transforms, spatial inertias, joint subspaces
//! 2. **Motion** - spatial velocities
//! 3. **Dynamics** - articulated-body inertias, velocity-dependent forces,
//!    operational-space inverse inertias
//! 4. **Reaction** - accelerations under the applied forces
//!
//! Writing q, u or forces through the state's `upd_*` accessors drops the
//! state back to the last stage that is still valid.
//!
//! Beyond forward dynamics the tree provides `M⁻¹ f`, equivalent joint
//! forces, `Jᵀ X` gradients, per-body operational-space inverse inertias,
//! kinetic energy and the q/u kinematic maps. The
//! [`SemiExplicitEulerDriver`] ties these together with an impulse solver
//! from `sim-constraint` to take fixed steps with contacts and constraints.
//!
//! # Example
//!
//! ```
//! use sim_multibody::{JointType, RigidBodyTree};
//! use sim_types::{Gravity, Isometry3, MassProperties, NodeId, Stage, Vector3};
//!
//! // Pendulum: 1 kg bob half a meter out along x, hinged about z
//! let mut tree = RigidBodyTree::new();
//! tree.add_body(
//!     NodeId::GROUND,
//!     MassProperties::point_mass(1.0).with_center_of_mass(Vector3::new(0.5, 0.0, 0.0)),
//!     Isometry3::identity(),
//!     Isometry3::identity(),
//!     JointType::Pin,
//!     false,
//! )?;
//!
//! let mut state = tree.create_state();
//! tree.realize(&mut state, Stage::Dynamics)?;
//! let gravity = Gravity::custom(Vector3::new(0.0, -9.81, 0.0));
//! let forces = tree.calc_gravity_forces(&state, &gravity)?;
//! state.upd_body_forces().copy_from_slice(&forces);
//!
//! let udot = tree.calc_udot(&mut state)?;
//! assert!((udot[0] + 9.81 / 0.5).abs() < 1e-9);
//! # Ok::<(), sim_types::SimError>(())
//! ```

#![deny(clippy::unwrap_used, clippy::expect_used)]
#![warn(missing_docs)]
#![allow(
    clippy::missing_const_for_fn,     // Many methods can't be const due to nalgebra
    clippy::suboptimal_flops,          // mul_add style changes aren't always clearer
    clippy::many_single_char_names,    // Recursion quantities use standard symbols
    clippy::missing_errors_doc,        // Error docs added where non-obvious
)]

mod cache;
mod driver;
pub mod mobilizer;
mod node;
mod tree;

pub use cache::{ConfigurationCache, DynamicsCache, MotionCache, ReactionCache, TreeState};
pub use driver::{
    ImpulseConstraintSource, ImpulseConstraints, ImpulseReport, SemiExplicitEulerDriver,
    StepReport, TimeSteppingDriver, IMPULSE_PHASE,
};
pub use mobilizer::{create_mobilizer, JointSpeeds, JointType, Mobilizer};
pub use node::RigidBodyNode;
pub use tree::RigidBodyTree;
