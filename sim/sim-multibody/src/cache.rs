//! State variables and stage caches.
//!
//! A [`TreeState`] owns everything that changes while a tree is simulated:
//! the state variables (q, u, applied forces) and one cache per realization
//! stage. Caches are struct-of-arrays:
//!
//! - per-node vectors, indexed by [`NodeId`]
//! - per-speed pools of length `nu`, sliced at each node's `u_index`
//! - per-speed-squared pools of length `nusq`, sliced at each node's
//!   `usq_index` (column-major `dof × dof` blocks)
//!
//! Each node records the last stage realized for it. Writing a state
//! variable drops every node back to the last stage that does not depend on
//! it:
//!
//! | Write | Nodes fall back to |
//! |-------|--------------------|
//! | `upd_q` | Topology |
//! | `upd_u` | Configuration |
//! | `upd_joint_forces`, `upd_body_forces` | Dynamics |

use nalgebra::{DVector, Isometry3, Matrix3, Vector3};
use sim_types::{NodeId, PhiMatrix, SpatialMatrix, SpatialVector, Stage};

/// Position-dependent quantities.
#[derive(Debug, Clone)]
pub struct ConfigurationCache {
    /// Cross-joint transform `X_JbJ`.
    pub x_jbj: Vec<Isometry3<f64>>,
    /// Body frame in parent body frame.
    pub x_pb: Vec<Isometry3<f64>>,
    /// Body frame in ground.
    pub x_gb: Vec<Isometry3<f64>>,
    /// Shift from body origin to parent origin.
    pub phi: Vec<PhiMatrix>,
    /// Spatial inertia about the body origin, in ground.
    pub mk: Vec<SpatialMatrix>,
    /// Center of mass location in ground.
    pub com_g: Vec<Vector3<f64>>,
    /// Body origin to center of mass, in ground.
    pub cb_g: Vec<Vector3<f64>>,
    /// Rotational inertia about the body origin, in ground.
    pub inertia_ob_g: Vec<Matrix3<f64>>,
    /// Joint motion subspace columns in ground about the body origin (pool over u).
    pub h: Vec<SpatialVector>,
}

impl ConfigurationCache {
    fn new(num_nodes: usize, nu: usize) -> Self {
        Self {
            x_jbj: vec![Isometry3::identity(); num_nodes],
            x_pb: vec![Isometry3::identity(); num_nodes],
            x_gb: vec![Isometry3::identity(); num_nodes],
            phi: vec![PhiMatrix::identity(); num_nodes],
            mk: vec![SpatialMatrix::zeros(); num_nodes],
            com_g: vec![Vector3::zeros(); num_nodes],
            cb_g: vec![Vector3::zeros(); num_nodes],
            inertia_ob_g: vec![Matrix3::zeros(); num_nodes],
            h: vec![SpatialVector::zeros(); nu],
        }
    }
}

/// Velocity-dependent kinematics.
#[derive(Debug, Clone)]
pub struct MotionCache {
    /// Spatial velocity of the body origin in ground.
    pub v_gb: Vec<SpatialVector>,
    /// Velocity of the body relative to its parent, expressed in ground.
    pub v_pb_g: Vec<SpatialVector>,
}

impl MotionCache {
    fn new(num_nodes: usize) -> Self {
        Self {
            v_gb: vec![SpatialVector::zeros(); num_nodes],
            v_pb_g: vec![SpatialVector::zeros(); num_nodes],
        }
    }
}

/// Articulated-body inertias and velocity-dependent forces.
#[derive(Debug, Clone)]
pub struct DynamicsCache {
    /// Coriolis spatial acceleration.
    pub coriolis_acceleration: Vec<SpatialVector>,
    /// Gyroscopic spatial force.
    pub gyroscopic_force: Vec<SpatialVector>,
    /// `P·coriolis + gyroscopic`.
    pub centrifugal_force: Vec<SpatialVector>,
    /// Articulated-body inertia `P`.
    pub articulated_inertia: Vec<SpatialMatrix>,
    /// `I - G Hᵀ`.
    pub tau_bar: Vec<SpatialMatrix>,
    /// `Φ · τ̄`.
    pub psi: Vec<SpatialMatrix>,
    /// `P H D⁻¹` columns (pool over u).
    pub g: Vec<SpatialVector>,
    /// `Hᵀ P H` blocks (pool over u²).
    pub d: Vec<f64>,
    /// `D⁻¹` blocks (pool over u²).
    pub di: Vec<f64>,
    /// Operational-space inverse inertia `J M⁻¹ Jᵀ` at each body origin.
    pub y: Vec<SpatialMatrix>,
}

impl DynamicsCache {
    fn new(num_nodes: usize, nu: usize, nusq: usize) -> Self {
        Self {
            coriolis_acceleration: vec![SpatialVector::zeros(); num_nodes],
            gyroscopic_force: vec![SpatialVector::zeros(); num_nodes],
            centrifugal_force: vec![SpatialVector::zeros(); num_nodes],
            articulated_inertia: vec![SpatialMatrix::zeros(); num_nodes],
            tau_bar: vec![SpatialMatrix::identity(); num_nodes],
            psi: vec![SpatialMatrix::identity(); num_nodes],
            g: vec![SpatialVector::zeros(); nu],
            d: vec![0.0; nusq],
            di: vec![0.0; nusq],
            y: vec![SpatialMatrix::zeros(); num_nodes],
        }
    }
}

/// Response to the applied forces.
#[derive(Debug, Clone)]
pub struct ReactionCache {
    /// Articulated-body bias force after the inward pass.
    pub z: Vec<SpatialVector>,
    /// `G·ε`.
    pub gepsilon: Vec<SpatialVector>,
    /// Spatial acceleration of the body origin in ground.
    pub a_gb: Vec<SpatialVector>,
    /// Joint-space residual force `τ - Hᵀ z` (pool over u).
    pub epsilon: DVector<f64>,
    /// Generalized accelerations (pool over u).
    pub udot: DVector<f64>,
}

impl ReactionCache {
    fn new(num_nodes: usize, nu: usize) -> Self {
        Self {
            z: vec![SpatialVector::zeros(); num_nodes],
            gepsilon: vec![SpatialVector::zeros(); num_nodes],
            a_gb: vec![SpatialVector::zeros(); num_nodes],
            epsilon: DVector::zeros(nu),
            udot: DVector::zeros(nu),
        }
    }
}

/// State variables plus stage caches for one tree.
#[derive(Debug, Clone)]
pub struct TreeState {
    time: f64,
    q: DVector<f64>,
    u: DVector<f64>,
    joint_forces: DVector<f64>,
    body_forces: Vec<SpatialVector>,
    stages: Vec<Stage>,
    configuration: ConfigurationCache,
    motion: MotionCache,
    dynamics: DynamicsCache,
    reaction: ReactionCache,
}

impl TreeState {
    /// Zeroed state for a tree with the given sizes, nothing realized.
    #[must_use]
    pub fn new(num_nodes: usize, nq: usize, nu: usize, nusq: usize) -> Self {
        Self {
            time: 0.0,
            q: DVector::zeros(nq),
            u: DVector::zeros(nu),
            joint_forces: DVector::zeros(nu),
            body_forces: vec![SpatialVector::zeros(); num_nodes],
            stages: vec![Stage::Topology; num_nodes],
            configuration: ConfigurationCache::new(num_nodes, nu),
            motion: MotionCache::new(num_nodes),
            dynamics: DynamicsCache::new(num_nodes, nu, nusq),
            reaction: ReactionCache::new(num_nodes, nu),
        }
    }

    /// Simulated time.
    #[must_use]
    pub fn time(&self) -> f64 {
        self.time
    }

    /// Set the simulated time.
    pub fn set_time(&mut self, time: f64) {
        self.time = time;
    }

    /// Generalized coordinates.
    #[must_use]
    pub fn q(&self) -> &DVector<f64> {
        &self.q
    }

    /// Mutable generalized coordinates; invalidates every stage.
    pub fn upd_q(&mut self) -> &mut DVector<f64> {
        self.invalidate(Stage::Topology);
        &mut self.q
    }

    /// Generalized speeds.
    #[must_use]
    pub fn u(&self) -> &DVector<f64> {
        &self.u
    }

    /// Mutable generalized speeds; invalidates Motion and later.
    pub fn upd_u(&mut self) -> &mut DVector<f64> {
        self.invalidate(Stage::Configuration);
        &mut self.u
    }

    /// Applied joint forces, one per generalized speed.
    #[must_use]
    pub fn joint_forces(&self) -> &DVector<f64> {
        &self.joint_forces
    }

    /// Mutable joint forces; invalidates Reaction.
    pub fn upd_joint_forces(&mut self) -> &mut DVector<f64> {
        self.invalidate(Stage::Dynamics);
        &mut self.joint_forces
    }

    /// Applied spatial forces about each body origin, in ground.
    #[must_use]
    pub fn body_forces(&self) -> &[SpatialVector] {
        &self.body_forces
    }

    /// Mutable body forces; invalidates Reaction.
    pub fn upd_body_forces(&mut self) -> &mut [SpatialVector] {
        self.invalidate(Stage::Dynamics);
        &mut self.body_forces
    }

    /// Last stage realized for a node.
    #[must_use]
    pub fn node_stage(&self, node: NodeId) -> Stage {
        self.stages
            .get(node.index())
            .copied()
            .unwrap_or(Stage::Topology)
    }

    /// Stage realized for every node.
    #[must_use]
    pub fn stage(&self) -> Stage {
        self.stages.iter().copied().min().unwrap_or(Stage::Topology)
    }

    pub(crate) fn set_node_stage(&mut self, node: NodeId, stage: Stage) {
        self.stages[node.index()] = stage;
    }

    /// Drop every node to at most `stage`.
    pub fn invalidate(&mut self, stage: Stage) {
        for s in &mut self.stages {
            if *s > stage {
                *s = stage;
            }
        }
    }

    /// Configuration cache.
    #[must_use]
    pub fn configuration_cache(&self) -> &ConfigurationCache {
        &self.configuration
    }

    /// Mutable configuration cache.
    pub fn upd_configuration_cache(&mut self) -> &mut ConfigurationCache {
        &mut self.configuration
    }

    /// Motion cache.
    #[must_use]
    pub fn motion_cache(&self) -> &MotionCache {
        &self.motion
    }

    /// Mutable motion cache.
    pub fn upd_motion_cache(&mut self) -> &mut MotionCache {
        &mut self.motion
    }

    /// Dynamics cache.
    #[must_use]
    pub fn dynamics_cache(&self) -> &DynamicsCache {
        &self.dynamics
    }

    /// Mutable dynamics cache.
    pub fn upd_dynamics_cache(&mut self) -> &mut DynamicsCache {
        &mut self.dynamics
    }

    /// Reaction cache.
    #[must_use]
    pub fn reaction_cache(&self) -> &ReactionCache {
        &self.reaction
    }

    /// Mutable reaction cache.
    pub fn upd_reaction_cache(&mut self) -> &mut ReactionCache {
        &mut self.reaction
    }
}
