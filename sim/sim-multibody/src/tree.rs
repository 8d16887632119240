//! The articulated-body tree.
//!
//! [`RigidBodyTree`] owns the nodes and the level lists that order the
//! recursions. Passes that need parent data run base-to-tip (ascending
//! levels), passes that accumulate child data run tip-to-base.
//!
//! | Stage | Passes |
//! |-------|--------|
//! | Configuration | transforms, `Φ`, `Mk`, `H` (base-to-tip) |
//! | Motion | spatial velocities (base-to-tip) |
//! | Dynamics | velocity terms and articulated inertias (tip-to-base), `Y` (base-to-tip) |
//! | Reaction | bias forces (tip-to-base), accelerations (base-to-tip) |

use nalgebra::{DVector, Isometry3};
use sim_types::{spatial_vector, Gravity, MassProperties, NodeId, Result, SimError, SpatialVector, Stage};
use tracing::{debug, trace};

use crate::cache::TreeState;
use crate::mobilizer::JointType;
use crate::node::RigidBodyNode;

/// A tree of rigid bodies connected by joints, rooted at ground.
#[derive(Debug)]
pub struct RigidBodyTree {
    nodes: Vec<RigidBodyNode>,
    levels: Vec<Vec<NodeId>>,
    nu: usize,
    nq: usize,
    nusq: usize,
}

impl Default for RigidBodyTree {
    fn default() -> Self {
        Self::new()
    }
}

fn check_len(what: &'static str, expected: usize, actual: usize) -> Result<()> {
    if expected != actual {
        return Err(SimError::DimensionMismatch {
            what,
            expected,
            actual,
        });
    }
    Ok(())
}

impl RigidBodyTree {
    /// A tree containing only ground.
    #[must_use]
    pub fn new() -> Self {
        Self {
            nodes: vec![RigidBodyNode::ground()],
            levels: vec![vec![NodeId::GROUND]],
            nu: 0,
            nq: 0,
            nusq: 0,
        }
    }

    /// Attach a body to `parent` through a joint.
    ///
    /// `x_pjb` places the joint's inboard frame on the parent, `x_bj` places
    /// its outboard frame on the new body.
    ///
    /// # Errors
    ///
    /// Returns an error if the parent does not exist, the mass properties
    /// are invalid, the joint type is `Ground`, or the joint type cannot be
    /// reversed.
    pub fn add_body(
        &mut self,
        parent: NodeId,
        mass_props: MassProperties,
        x_pjb: Isometry3<f64>,
        x_bj: Isometry3<f64>,
        joint_type: JointType,
        is_reversed: bool,
    ) -> Result<NodeId> {
        let parent_level = self
            .nodes
            .get(parent.index())
            .ok_or(SimError::InvalidNodeId(parent))?
            .level();
        if joint_type == JointType::Ground {
            return Err(SimError::invalid_topology(
                "only the root may use a ground joint",
            ));
        }

        let (mut next_u, mut next_usq, mut next_q) = (self.nu, self.nusq, self.nq);
        let mut node = RigidBodyNode::create(
            mass_props,
            x_pjb,
            x_bj,
            joint_type,
            is_reversed,
            &mut next_u,
            &mut next_usq,
            &mut next_q,
        )?;

        let id = NodeId::new(self.nodes.len());
        let level = parent_level + 1;
        node.attach(id, Some((parent, parent_level)));
        self.nodes[parent.index()].add_child(id);
        self.nodes.push(node);
        if self.levels.len() <= level {
            self.levels.push(Vec::new());
        }
        self.levels[level].push(id);

        self.nu = next_u;
        self.nusq = next_usq;
        self.nq = next_q;

        debug!(
            node = id.index(),
            parent = parent.index(),
            joint = %joint_type,
            level,
            nu = self.nu,
            nq = self.nq,
            "added body"
        );
        Ok(id)
    }

    /// Number of nodes including ground.
    #[must_use]
    pub fn num_bodies(&self) -> usize {
        self.nodes.len()
    }

    /// Total generalized speeds.
    #[must_use]
    pub fn nu(&self) -> usize {
        self.nu
    }

    /// Total generalized coordinates.
    #[must_use]
    pub fn nq(&self) -> usize {
        self.nq
    }

    /// Total size of the per-joint `dof²` pools.
    #[must_use]
    pub fn nusq(&self) -> usize {
        self.nusq
    }

    /// Look up a node.
    ///
    /// # Errors
    ///
    /// Returns [`SimError::InvalidNodeId`] for an unknown id.
    pub fn node(&self, id: NodeId) -> Result<&RigidBodyNode> {
        self.nodes.get(id.index()).ok_or(SimError::InvalidNodeId(id))
    }

    /// All nodes in id order; parents precede their children.
    #[must_use]
    pub fn nodes(&self) -> &[RigidBodyNode] {
        &self.nodes
    }

    /// Node ids grouped by depth; level 0 holds only ground.
    #[must_use]
    pub fn levels(&self) -> &[Vec<NodeId>] {
        &self.levels
    }

    fn base_to_tip(&self) -> impl Iterator<Item = &RigidBodyNode> {
        self.levels
            .iter()
            .flatten()
            .map(move |id| &self.nodes[id.index()])
    }

    fn tip_to_base(&self) -> impl Iterator<Item = &RigidBodyNode> {
        self.levels
            .iter()
            .rev()
            .flatten()
            .map(move |id| &self.nodes[id.index()])
    }

    fn check_state(&self, state: &TreeState) -> Result<()> {
        check_len("q", self.nq, state.q().len())?;
        check_len("u", self.nu, state.u().len())?;
        check_len("joint forces", self.nu, state.joint_forces().len())?;
        check_len("body forces", self.nodes.len(), state.body_forces().len())
    }

    /// A fresh state with every joint at its default values.
    #[must_use]
    pub fn create_state(&self) -> TreeState {
        let mut state = TreeState::new(self.nodes.len(), self.nq, self.nu, self.nusq);
        for node in &self.nodes[1..] {
            node.set_default_configuration_values(state.upd_q());
            node.set_default_motion_values(state.upd_u());
        }
        state
    }

    /// Realize positions for every node.
    ///
    /// # Errors
    ///
    /// Returns an error if the state does not belong to this tree.
    pub fn realize_configuration(&self, state: &mut TreeState) -> Result<()> {
        self.check_state(state)?;
        for node in self.base_to_tip() {
            node.realize_configuration(state)?;
        }
        trace!(bodies = self.nodes.len(), "realized configuration");
        Ok(())
    }

    /// Realize velocities for every node.
    ///
    /// # Errors
    ///
    /// Returns [`SimError::StageNotRealized`] unless configuration is realized.
    pub fn realize_motion(&self, state: &mut TreeState) -> Result<()> {
        self.check_state(state)?;
        for node in self.base_to_tip() {
            node.realize_motion(state)?;
        }
        trace!(bodies = self.nodes.len(), "realized motion");
        Ok(())
    }

    /// Realize velocity-dependent forces, articulated-body inertias and the
    /// operational-space inverse inertias.
    ///
    /// # Errors
    ///
    /// Returns [`SimError::StageNotRealized`] unless motion is realized, or
    /// [`SimError::SingularArticulatedInertia`] if a joint sees no inertia.
    pub fn realize_dynamics(&self, state: &mut TreeState) -> Result<()> {
        self.check_state(state)?;
        for node in self.tip_to_base() {
            node.calc_articulated_body_inertias_inward(state)?;
        }
        for node in self.base_to_tip() {
            node.calc_y_outward(state)?;
        }
        trace!(bodies = self.nodes.len(), "realized dynamics");
        Ok(())
    }

    /// Realize accelerations under the state's applied forces.
    ///
    /// # Errors
    ///
    /// Returns [`SimError::StageNotRealized`] unless dynamics is realized.
    pub fn realize_reaction(&self, state: &mut TreeState) -> Result<()> {
        self.check_state(state)?;
        for node in self.tip_to_base() {
            let force = node.body_force(state);
            node.calc_z(state, &force)?;
        }
        for node in self.base_to_tip() {
            node.calc_udot_pass2(state)?;
        }
        trace!(bodies = self.nodes.len(), "realized reaction");
        Ok(())
    }

    /// Realize every stage up to and including `stage` that is not yet
    /// realized.
    ///
    /// # Errors
    ///
    /// Propagates errors from the individual stages.
    pub fn realize(&self, state: &mut TreeState, stage: Stage) -> Result<()> {
        for next in Stage::ALL {
            if next > stage {
                break;
            }
            if state.stage() >= next {
                continue;
            }
            match next {
                Stage::Topology => self.check_state(state)?,
                Stage::Configuration => self.realize_configuration(state)?,
                Stage::Motion => self.realize_motion(state)?,
                Stage::Dynamics => self.realize_dynamics(state)?,
                Stage::Reaction => self.realize_reaction(state)?,
            }
        }
        Ok(())
    }

    /// Generalized accelerations under the state's applied forces.
    ///
    /// Realizes through Reaction as needed.
    ///
    /// # Errors
    ///
    /// Propagates realization errors.
    pub fn calc_udot<'a>(&self, state: &'a mut TreeState) -> Result<&'a DVector<f64>> {
        self.realize(state, Stage::Reaction)?;
        Ok(&state.reaction_cache().udot)
    }

    /// Generalized accelerations under the given forces, leaving the state's
    /// reaction cache untouched.
    ///
    /// # Errors
    ///
    /// Returns an error if dynamics is not realized or a force array has the
    /// wrong size.
    pub fn calc_udot_with_forces(
        &self,
        state: &TreeState,
        joint_forces: &DVector<f64>,
        body_forces: &[SpatialVector],
    ) -> Result<DVector<f64>> {
        self.check_state(state)?;
        check_len("joint forces", self.nu, joint_forces.len())?;
        check_len("body forces", self.nodes.len(), body_forces.len())?;

        let n = self.nodes.len();
        let mut all_z = vec![SpatialVector::zeros(); n];
        let mut all_gepsilon = vec![SpatialVector::zeros(); n];
        let mut all_epsilon = DVector::zeros(self.nu);
        for node in self.tip_to_base() {
            node.calc_udot_pass1_inward(
                state,
                joint_forces,
                body_forces,
                &mut all_z,
                &mut all_gepsilon,
                &mut all_epsilon,
            )?;
        }

        let mut all_a_gb = vec![SpatialVector::zeros(); n];
        let mut all_udot = DVector::zeros(self.nu);
        for node in self.base_to_tip() {
            node.calc_udot_pass2_outward(state, &all_epsilon, &mut all_a_gb, &mut all_udot)?;
        }
        Ok(all_udot)
    }

    /// `M⁻¹ f` for a generalized force `f`, in O(n).
    ///
    /// # Errors
    ///
    /// Returns an error if dynamics is not realized or `f` has the wrong size.
    pub fn multiply_by_m_inv(&self, state: &TreeState, f: &DVector<f64>) -> Result<DVector<f64>> {
        self.check_state(state)?;
        check_len("generalized force", self.nu, f.len())?;

        let n = self.nodes.len();
        let mut all_z = vec![SpatialVector::zeros(); n];
        let mut all_gepsilon = vec![SpatialVector::zeros(); n];
        let mut all_epsilon = DVector::zeros(self.nu);
        for node in self.tip_to_base() {
            node.calc_m_inverse_f_inward(state, f, &mut all_z, &mut all_gepsilon, &mut all_epsilon)?;
        }

        let mut all_a_gb = vec![SpatialVector::zeros(); n];
        let mut result = DVector::zeros(self.nu);
        for node in self.base_to_tip() {
            node.calc_m_inverse_f_outward(state, &all_epsilon, &mut all_a_gb, &mut result)?;
        }
        Ok(result)
    }

    /// Joint forces equivalent to a set of body forces.
    ///
    /// # Errors
    ///
    /// Returns an error if configuration is not realized or
    /// `body_forces` has the wrong size.
    pub fn calc_equivalent_joint_forces(
        &self,
        state: &TreeState,
        body_forces: &[SpatialVector],
    ) -> Result<DVector<f64>> {
        self.check_state(state)?;
        check_len("body forces", self.nodes.len(), body_forces.len())?;

        let mut all_z = vec![SpatialVector::zeros(); self.nodes.len()];
        let mut joint_forces = DVector::zeros(self.nu);
        for node in self.tip_to_base() {
            node.calc_equivalent_joint_forces(state, body_forces, &mut all_z, &mut joint_forces)?;
        }
        Ok(joint_forces)
    }

    /// `Jᵀ X`: pull per-body spatial gradients back to joint space.
    ///
    /// `x[b]` is the gradient with respect to body `b`'s spatial velocity
    /// about its origin, in ground.
    ///
    /// # Errors
    ///
    /// Returns an error if configuration is not realized or `x` has the
    /// wrong size.
    pub fn calc_internal_gradient_from_spatial(
        &self,
        state: &TreeState,
        x: &[SpatialVector],
    ) -> Result<DVector<f64>> {
        self.check_state(state)?;
        check_len("spatial gradient", self.nodes.len(), x.len())?;

        let mut z_tmp = vec![SpatialVector::zeros(); self.nodes.len()];
        let mut jx = DVector::zeros(self.nu);
        for node in self.tip_to_base() {
            node.calc_internal_gradient_from_spatial(state, &mut z_tmp, x, &mut jx)?;
        }
        Ok(jx)
    }

    /// Spatial gravity force on every body, about its origin, in ground.
    ///
    /// # Errors
    ///
    /// Returns [`SimError::StageNotRealized`] unless configuration is realized.
    pub fn calc_gravity_forces(&self, state: &TreeState, gravity: &Gravity) -> Result<Vec<SpatialVector>> {
        self.check_state(state)?;
        let mut forces = vec![SpatialVector::zeros(); self.nodes.len()];
        if gravity.is_zero() {
            return Ok(forces);
        }
        for node in &self.nodes[1..] {
            let id = node.node_num();
            let actual = state.node_stage(id);
            if actual < Stage::Configuration {
                return Err(SimError::StageNotRealized {
                    node: id,
                    required: Stage::Configuration,
                    actual,
                });
            }
            let f = gravity.force_on_mass(node.mass());
            forces[id.index()] = spatial_vector(&node.cb_g(state).cross(&f), &f);
        }
        Ok(forces)
    }

    /// Total kinetic energy.
    ///
    /// # Errors
    ///
    /// Returns [`SimError::StageNotRealized`] unless motion is realized.
    pub fn calc_kinetic_energy(&self, state: &TreeState) -> Result<f64> {
        self.check_state(state)?;
        self.nodes[1..]
            .iter()
            .map(|node| node.calc_kinetic_energy(state))
            .sum()
    }

    /// `q̇` for the whole tree.
    ///
    /// # Errors
    ///
    /// Propagates mobilizer errors.
    pub fn calc_qdot(&self, state: &TreeState) -> Result<DVector<f64>> {
        self.check_state(state)?;
        let mut qdot = DVector::zeros(self.nq);
        for node in &self.nodes[1..] {
            node.calc_qdot(state, &mut qdot)?;
        }
        Ok(qdot)
    }

    /// `q̈` for the whole tree given `u̇`.
    ///
    /// # Errors
    ///
    /// Returns an error if `udot` has the wrong size; propagates mobilizer
    /// errors.
    pub fn calc_qdotdot(&self, state: &TreeState, udot: &DVector<f64>) -> Result<DVector<f64>> {
        self.check_state(state)?;
        check_len("udot", self.nu, udot.len())?;
        let mut qdotdot = DVector::zeros(self.nq);
        for node in &self.nodes[1..] {
            node.calc_qdotdot(state, udot, &mut qdotdot)?;
        }
        Ok(qdotdot)
    }

    /// Renormalize every quaternion; returns whether any changed.
    pub fn enforce_quaternion_constraints(&self, state: &mut TreeState) -> bool {
        let mut changed = false;
        for node in &self.nodes[1..] {
            changed |= node.enforce_quaternion_constraints(state);
        }
        changed
    }
}
