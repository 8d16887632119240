//! Rigid body nodes.
//!
//! A [`RigidBodyNode`] is one body together with its inboard joint. It owns
//! only quantities that are fixed once the tree is built: topology links,
//! state-vector offsets, mass properties and the joint frames. Everything
//! state-dependent lives in a [`TreeState`] and is reached through the
//! node's typed accessors, which pluck this node's slot out of the per-node
//! vectors (by node number) or its slice out of the pools (by `u_index` or
//! `usq_index`).
//!
//! # Frames
//!
//! - G: ground
//! - P: parent body frame
//! - B: this body's frame
//! - Jb: the joint's inboard frame, fixed on P (`X_PJb`)
//! - J: the joint's outboard frame, fixed on B (`X_BJ`)
//!
//! The body-in-parent transform is `X_PB = X_PJb · X_JbJ(q) · X_JB`.
//!
//! # Recursions
//!
//! With `Φ` the shift from this body's origin to its parent's, `H` the joint
//! subspace in ground about the body origin and `Mk` the spatial inertia:
//!
//! ```text
//! inward:   P  = Mk + Σ_c ψ_c P_c Φ_cᵀ
//!           D  = Hᵀ P H,  G = P H D⁻¹,  τ̄ = I - G Hᵀ,  ψ = Φ τ̄
//!           z  = P a + b - F + Σ_c Φ_c (z_c + G_c ε_c)
//!           ε  = τ - Hᵀ z
//! outward:  α' = Φᵀ A_parent
//!           u̇  = D⁻¹ ε - Gᵀ α'
//!           A  = α' + H u̇ + a
//!           Y  = ψᵀ Y_parent ψ + H D⁻¹ Hᵀ
//! ```
//!
//! where `a` is the Coriolis acceleration and `b` the gyroscopic force.

use nalgebra::{DMatrix, DVector, Isometry3, Matrix3, Matrix6xX, Vector3};
use sim_types::{
    angular, linear, spatial_inertia, spatial_vector, MassProperties, NodeId, PhiMatrix, Result,
    SimError, SpatialMatrix, SpatialVector, Stage,
};
use smallvec::SmallVec;

use crate::cache::{ConfigurationCache, DynamicsCache, TreeState};
use crate::mobilizer::{create_mobilizer, JointType, Mobilizer};

fn check_joint_len(what: &'static str, expected: usize, actual: usize) -> Result<()> {
    if expected != actual {
        return Err(SimError::DimensionMismatch {
            what,
            expected,
            actual,
        });
    }
    Ok(())
}

/// One body and its inboard joint.
#[derive(Debug)]
pub struct RigidBodyNode {
    node_num: NodeId,
    level: usize,
    parent: Option<NodeId>,
    children: Vec<NodeId>,

    u_index: usize,
    q_index: usize,
    usq_index: usize,

    mass_props_b: MassProperties,
    inertia_ob_b: Matrix3<f64>,
    x_bj: Isometry3<f64>,
    x_jb: Isometry3<f64>,
    x_pjb: Isometry3<f64>,
    ref_x_pb: Isometry3<f64>,

    mobilizer: Box<dyn Mobilizer>,
}

/// Fail unless `node` has realized at least `stage`.
fn require(state: &TreeState, node: NodeId, stage: Stage) -> Result<()> {
    let actual = state.node_stage(node);
    if actual < stage {
        return Err(SimError::StageNotRealized {
            node,
            required: stage,
            actual,
        });
    }
    Ok(())
}

impl RigidBodyNode {
    /// Build a node and allocate its state-vector slots.
    ///
    /// The counters are the next free offsets into u, the u² pools and q;
    /// each is advanced past this node's allocation. Topology links are set
    /// when the tree adopts the node.
    #[allow(clippy::too_many_arguments)]
    pub fn create(
        mass_props: MassProperties,
        x_pjb: Isometry3<f64>,
        x_bj: Isometry3<f64>,
        joint_type: JointType,
        is_reversed: bool,
        next_u_slot: &mut usize,
        next_usq_slot: &mut usize,
        next_q_slot: &mut usize,
    ) -> Result<Self> {
        mass_props.validate()?;
        let mobilizer = create_mobilizer(joint_type, is_reversed)?;

        let dof = mobilizer.dof();
        let nq = mobilizer.max_nq();
        let x_jb = x_bj.inverse();

        let node = Self {
            node_num: NodeId::GROUND,
            level: 0,
            parent: None,
            children: Vec::new(),
            u_index: *next_u_slot,
            q_index: *next_q_slot,
            usq_index: *next_usq_slot,
            inertia_ob_b: mass_props.inertia_about_origin(),
            mass_props_b: mass_props,
            x_bj,
            x_jb,
            x_pjb,
            ref_x_pb: x_pjb * x_jb,
            mobilizer,
        };

        *next_u_slot += dof;
        *next_usq_slot += dof * dof;
        *next_q_slot += nq;
        Ok(node)
    }

    /// The massless, immobile root.
    pub(crate) fn ground() -> Self {
        Self {
            node_num: NodeId::GROUND,
            level: 0,
            parent: None,
            children: Vec::new(),
            u_index: 0,
            q_index: 0,
            usq_index: 0,
            mass_props_b: MassProperties::default(),
            inertia_ob_b: Matrix3::zeros(),
            x_bj: Isometry3::identity(),
            x_jb: Isometry3::identity(),
            x_pjb: Isometry3::identity(),
            ref_x_pb: Isometry3::identity(),
            mobilizer: Box::new(crate::mobilizer::Ground),
        }
    }

    pub(crate) fn attach(&mut self, node_num: NodeId, parent: Option<(NodeId, usize)>) {
        self.node_num = node_num;
        if let Some((parent, parent_level)) = parent {
            self.parent = Some(parent);
            self.level = parent_level + 1;
        }
    }

    pub(crate) fn add_child(&mut self, child: NodeId) {
        self.children.push(child);
    }

    // Topology

    /// Stable index of this node.
    #[must_use]
    pub fn node_num(&self) -> NodeId {
        self.node_num
    }

    /// Depth in the tree; ground is level 0.
    #[must_use]
    pub fn level(&self) -> usize {
        self.level
    }

    /// Parent node, `None` only for ground.
    #[must_use]
    pub fn parent(&self) -> Option<NodeId> {
        self.parent
    }

    /// Children in insertion order.
    #[must_use]
    pub fn children(&self) -> &[NodeId] {
        &self.children
    }

    /// The i-th child.
    #[must_use]
    pub fn child(&self, i: usize) -> Option<NodeId> {
        self.children.get(i).copied()
    }

    /// Whether this is the root.
    #[must_use]
    pub fn is_ground_node(&self) -> bool {
        self.level == 0
    }

    /// Whether this body hangs directly off ground.
    #[must_use]
    pub fn is_base_node(&self) -> bool {
        self.level == 1
    }

    /// Offset into u and the per-speed pools.
    #[must_use]
    pub fn u_index(&self) -> usize {
        self.u_index
    }

    /// Offset into q.
    #[must_use]
    pub fn q_index(&self) -> usize {
        self.q_index
    }

    /// Offset into the per-speed-squared pools.
    #[must_use]
    pub fn usq_index(&self) -> usize {
        self.usq_index
    }

    /// Number of generalized speeds of the inboard joint.
    #[must_use]
    pub fn dof(&self) -> usize {
        self.mobilizer.dof()
    }

    /// Number of generalized coordinates of the inboard joint.
    #[must_use]
    pub fn max_nq(&self) -> usize {
        self.mobilizer.max_nq()
    }

    /// Inboard joint type.
    #[must_use]
    pub fn joint_type(&self) -> JointType {
        self.mobilizer.joint_type()
    }

    /// Whether the inboard joint is reversed.
    #[must_use]
    pub fn is_reversed(&self) -> bool {
        self.mobilizer.is_reversed()
    }

    // Constants

    /// Mass properties in the body frame.
    #[must_use]
    pub fn mass_properties(&self) -> &MassProperties {
        &self.mass_props_b
    }

    /// Body mass.
    #[must_use]
    pub fn mass(&self) -> f64 {
        self.mass_props_b.mass
    }

    /// Center of mass in the body frame.
    #[must_use]
    pub fn com_b(&self) -> Vector3<f64> {
        self.mass_props_b.center_of_mass
    }

    /// Inertia about the center of mass, in the body frame.
    #[must_use]
    pub fn inertia_cb_b(&self) -> &Matrix3<f64> {
        &self.mass_props_b.inertia
    }

    /// Inertia about the body origin, in the body frame.
    #[must_use]
    pub fn inertia_ob_b(&self) -> &Matrix3<f64> {
        &self.inertia_ob_b
    }

    /// Outboard joint frame in the body frame.
    #[must_use]
    pub fn x_bj(&self) -> &Isometry3<f64> {
        &self.x_bj
    }

    /// Inverse of [`x_bj`](Self::x_bj).
    #[must_use]
    pub fn x_jb(&self) -> &Isometry3<f64> {
        &self.x_jb
    }

    /// Inboard joint frame in the parent frame.
    #[must_use]
    pub fn x_pjb(&self) -> &Isometry3<f64> {
        &self.x_pjb
    }

    /// Body frame in the parent frame when `X_JbJ` is the identity.
    #[must_use]
    pub fn ref_x_pb(&self) -> &Isometry3<f64> {
        &self.ref_x_pb
    }

    // Pool slicing

    fn from_b<'a, T>(&self, pool: &'a [T]) -> &'a T {
        &pool[self.node_num.index()]
    }

    fn to_b<'a, T>(&self, pool: &'a mut [T]) -> &'a mut T {
        &mut pool[self.node_num.index()]
    }

    fn from_u<'a, T>(&self, pool: &'a [T]) -> &'a [T] {
        &pool[self.u_index..self.u_index + self.dof()]
    }

    fn to_u<'a, T>(&self, pool: &'a mut [T]) -> &'a mut [T] {
        let dof = self.dof();
        &mut pool[self.u_index..self.u_index + dof]
    }

    fn from_q<'a, T>(&self, pool: &'a [T]) -> &'a [T] {
        &pool[self.q_index..self.q_index + self.max_nq()]
    }

    fn to_q<'a, T>(&self, pool: &'a mut [T]) -> &'a mut [T] {
        let nq = self.max_nq();
        &mut pool[self.q_index..self.q_index + nq]
    }

    fn from_usq<'a, T>(&self, pool: &'a [T]) -> &'a [T] {
        let dof = self.dof();
        &pool[self.usq_index..self.usq_index + dof * dof]
    }

    fn to_usq<'a, T>(&self, pool: &'a mut [T]) -> &'a mut [T] {
        let dof = self.dof();
        &mut pool[self.usq_index..self.usq_index + dof * dof]
    }

    fn h_matrix(&self, cc: &ConfigurationCache) -> Matrix6xX<f64> {
        Matrix6xX::from_columns(self.from_u(&cc.h))
    }

    fn g_matrix(&self, dc: &DynamicsCache) -> Matrix6xX<f64> {
        Matrix6xX::from_columns(self.from_u(&dc.g))
    }

    fn di_matrix(&self, dc: &DynamicsCache) -> DMatrix<f64> {
        let dof = self.dof();
        DMatrix::from_column_slice(dof, dof, self.from_usq(&dc.di))
    }

    fn debug_require(&self, state: &TreeState, stage: Stage) {
        debug_assert!(
            state.node_stage(self.node_num) >= stage,
            "{} read at {} before it was realized",
            self.node_num,
            stage
        );
    }

    // Cache accessors

    /// `X_JbJ`.
    #[must_use]
    pub fn x_jbj(&self, state: &TreeState) -> Isometry3<f64> {
        self.debug_require(state, Stage::Configuration);
        *self.from_b(&state.configuration_cache().x_jbj)
    }

    /// `X_PB`.
    #[must_use]
    pub fn x_pb(&self, state: &TreeState) -> Isometry3<f64> {
        self.debug_require(state, Stage::Configuration);
        *self.from_b(&state.configuration_cache().x_pb)
    }

    /// `X_GB`.
    #[must_use]
    pub fn x_gb(&self, state: &TreeState) -> Isometry3<f64> {
        self.debug_require(state, Stage::Configuration);
        *self.from_b(&state.configuration_cache().x_gb)
    }

    /// Shift operator to the parent origin.
    #[must_use]
    pub fn phi(&self, state: &TreeState) -> PhiMatrix {
        self.debug_require(state, Stage::Configuration);
        *self.from_b(&state.configuration_cache().phi)
    }

    /// Spatial inertia about the body origin, in ground.
    #[must_use]
    pub fn mk(&self, state: &TreeState) -> SpatialMatrix {
        self.debug_require(state, Stage::Configuration);
        *self.from_b(&state.configuration_cache().mk)
    }

    /// Center of mass in ground.
    #[must_use]
    pub fn com_g(&self, state: &TreeState) -> Vector3<f64> {
        self.debug_require(state, Stage::Configuration);
        *self.from_b(&state.configuration_cache().com_g)
    }

    /// Body origin to center of mass, in ground.
    #[must_use]
    pub fn cb_g(&self, state: &TreeState) -> Vector3<f64> {
        self.debug_require(state, Stage::Configuration);
        *self.from_b(&state.configuration_cache().cb_g)
    }

    /// Inertia about the body origin, in ground.
    #[must_use]
    pub fn inertia_ob_g(&self, state: &TreeState) -> Matrix3<f64> {
        self.debug_require(state, Stage::Configuration);
        *self.from_b(&state.configuration_cache().inertia_ob_g)
    }

    /// Column `i` of the joint subspace `H`, in ground about the body origin.
    #[must_use]
    pub fn h_row(&self, state: &TreeState, i: usize) -> SpatialVector {
        self.debug_require(state, Stage::Configuration);
        debug_assert!(i < self.dof());
        state.configuration_cache().h[self.u_index + i]
    }

    /// Spatial velocity in ground.
    #[must_use]
    pub fn v_gb(&self, state: &TreeState) -> SpatialVector {
        self.debug_require(state, Stage::Motion);
        *self.from_b(&state.motion_cache().v_gb)
    }

    /// Velocity relative to the parent, expressed in ground.
    #[must_use]
    pub fn v_pb_g(&self, state: &TreeState) -> SpatialVector {
        self.debug_require(state, Stage::Motion);
        *self.from_b(&state.motion_cache().v_pb_g)
    }

    /// Coriolis spatial acceleration.
    #[must_use]
    pub fn coriolis_acceleration(&self, state: &TreeState) -> SpatialVector {
        self.debug_require(state, Stage::Dynamics);
        *self.from_b(&state.dynamics_cache().coriolis_acceleration)
    }

    /// Gyroscopic spatial force.
    #[must_use]
    pub fn gyroscopic_force(&self, state: &TreeState) -> SpatialVector {
        self.debug_require(state, Stage::Dynamics);
        *self.from_b(&state.dynamics_cache().gyroscopic_force)
    }

    /// `P·coriolis + gyroscopic`.
    #[must_use]
    pub fn centrifugal_force(&self, state: &TreeState) -> SpatialVector {
        self.debug_require(state, Stage::Dynamics);
        *self.from_b(&state.dynamics_cache().centrifugal_force)
    }

    /// Articulated-body inertia.
    #[must_use]
    pub fn p(&self, state: &TreeState) -> SpatialMatrix {
        self.debug_require(state, Stage::Dynamics);
        *self.from_b(&state.dynamics_cache().articulated_inertia)
    }

    /// `Φ·τ̄`.
    #[must_use]
    pub fn psi(&self, state: &TreeState) -> SpatialMatrix {
        self.debug_require(state, Stage::Dynamics);
        *self.from_b(&state.dynamics_cache().psi)
    }

    /// `I - G Hᵀ`.
    #[must_use]
    pub fn tau_bar(&self, state: &TreeState) -> SpatialMatrix {
        self.debug_require(state, Stage::Dynamics);
        *self.from_b(&state.dynamics_cache().tau_bar)
    }

    /// `P H D⁻¹` (6 × dof).
    #[must_use]
    pub fn g(&self, state: &TreeState) -> Matrix6xX<f64> {
        self.debug_require(state, Stage::Dynamics);
        self.g_matrix(state.dynamics_cache())
    }

    /// `D⁻¹` across the inboard joint.
    #[must_use]
    pub fn di(&self, state: &TreeState) -> DMatrix<f64> {
        self.debug_require(state, Stage::Dynamics);
        self.di_matrix(state.dynamics_cache())
    }

    /// Operational-space inverse inertia `J M⁻¹ Jᵀ` at the body origin.
    ///
    /// Maps a spatial impulse on this body to the change in its spatial
    /// velocity.
    #[must_use]
    pub fn y(&self, state: &TreeState) -> SpatialMatrix {
        self.debug_require(state, Stage::Dynamics);
        *self.from_b(&state.dynamics_cache().y)
    }

    /// Inward-pass bias force.
    #[must_use]
    pub fn z(&self, state: &TreeState) -> SpatialVector {
        self.debug_require(state, Stage::Dynamics);
        *self.from_b(&state.reaction_cache().z)
    }

    /// `G·ε`.
    #[must_use]
    pub fn gepsilon(&self, state: &TreeState) -> SpatialVector {
        self.debug_require(state, Stage::Dynamics);
        *self.from_b(&state.reaction_cache().gepsilon)
    }

    /// Spatial acceleration in ground.
    #[must_use]
    pub fn a_gb(&self, state: &TreeState) -> SpatialVector {
        self.debug_require(state, Stage::Reaction);
        *self.from_b(&state.reaction_cache().a_gb)
    }

    /// This joint's generalized accelerations.
    #[must_use]
    pub fn udot<'a>(&self, state: &'a TreeState) -> &'a [f64] {
        self.debug_require(state, Stage::Reaction);
        self.from_u(state.reaction_cache().udot.as_slice())
    }

    /// Applied spatial force on this body.
    #[must_use]
    pub fn body_force(&self, state: &TreeState) -> SpatialVector {
        *self.from_b(state.body_forces())
    }

    // Default-value hooks

    /// Write this joint's reference coordinates into a fresh q.
    pub fn set_default_configuration_values(&self, q: &mut DVector<f64>) {
        self.mobilizer
            .set_default_configuration_values(self.to_q(q.as_mut_slice()));
    }

    /// Write this joint's default speeds into a fresh u.
    pub fn set_default_motion_values(&self, u: &mut DVector<f64>) {
        self.mobilizer
            .set_default_motion_values(self.to_u(u.as_mut_slice()));
    }

    // Realization

    /// Positions: transforms, shift operator, spatial inertia and joint subspace.
    ///
    /// Requires the parent's configuration.
    pub fn realize_configuration(&self, state: &mut TreeState) -> Result<()> {
        let Some(parent) = self.parent else {
            let cc = state.upd_configuration_cache();
            *self.to_b(&mut cc.x_jbj) = Isometry3::identity();
            *self.to_b(&mut cc.x_pb) = Isometry3::identity();
            *self.to_b(&mut cc.x_gb) = Isometry3::identity();
            *self.to_b(&mut cc.phi) = PhiMatrix::identity();
            state.set_node_stage(self.node_num, Stage::Configuration);
            return Ok(());
        };
        require(state, parent, Stage::Configuration)?;

        let x_jbj = self
            .mobilizer
            .calc_cross_joint_transform(self.from_q(state.q().as_slice()));
        let x_pb = self.x_pjb * x_jbj * self.x_jb;
        let x_gp = state.configuration_cache().x_gb[parent.index()];
        let x_gb = x_gp * x_pb;

        let phi = PhiMatrix::new(x_gb.translation.vector - x_gp.translation.vector);
        let r_gb = x_gb.rotation.to_rotation_matrix().into_inner();
        let cb_g = r_gb * self.com_b();
        let com_g = x_gb.translation.vector + cb_g;
        let inertia_ob_g = r_gb * self.inertia_ob_b * r_gb.transpose();
        let mk = spatial_inertia(self.mass(), &cb_g, &inertia_ob_g);

        // Subspace columns rotated into ground and shifted from OJ to OB
        let r_gjb = (x_gp * self.x_pjb).rotation;
        let r_jb = -(x_gb.rotation * self.x_bj.translation.vector);
        let hj = self.mobilizer.velocity_subspace();
        let h_cols: SmallVec<[SpatialVector; 6]> = hj
            .column_iter()
            .map(|col| {
                let col: SpatialVector = col.into_owned();
                let w = r_gjb * angular(&col);
                let v = r_gjb * linear(&col) + w.cross(&r_jb);
                spatial_vector(&w, &v)
            })
            .collect();

        let cc = state.upd_configuration_cache();
        *self.to_b(&mut cc.x_jbj) = x_jbj;
        *self.to_b(&mut cc.x_pb) = x_pb;
        *self.to_b(&mut cc.x_gb) = x_gb;
        *self.to_b(&mut cc.phi) = phi;
        *self.to_b(&mut cc.mk) = mk;
        *self.to_b(&mut cc.com_g) = com_g;
        *self.to_b(&mut cc.cb_g) = cb_g;
        *self.to_b(&mut cc.inertia_ob_g) = inertia_ob_g;
        self.to_u(&mut cc.h).copy_from_slice(&h_cols);

        state.set_node_stage(self.node_num, Stage::Configuration);
        Ok(())
    }

    /// Velocities: `V_PB_G = H u` and `V_GB = Φᵀ V_GP + V_PB_G`.
    ///
    /// Requires this node's configuration and the parent's motion.
    pub fn realize_motion(&self, state: &mut TreeState) -> Result<()> {
        require(state, self.node_num, Stage::Configuration)?;
        let Some(parent) = self.parent else {
            let mc = state.upd_motion_cache();
            *self.to_b(&mut mc.v_gb) = SpatialVector::zeros();
            *self.to_b(&mut mc.v_pb_g) = SpatialVector::zeros();
            state.set_node_stage(self.node_num, Stage::Motion);
            return Ok(());
        };
        require(state, parent, Stage::Motion)?;

        let v_pb_g = if self.dof() == 0 {
            SpatialVector::zeros()
        } else {
            let u = DVector::from_column_slice(self.from_u(state.u().as_slice()));
            self.h_matrix(state.configuration_cache()) * u
        };
        let phi = *self.from_b(&state.configuration_cache().phi);
        let v_gb = phi.shift_motion(&state.motion_cache().v_gb[parent.index()]) + v_pb_g;

        let mc = state.upd_motion_cache();
        *self.to_b(&mut mc.v_gb) = v_gb;
        *self.to_b(&mut mc.v_pb_g) = v_pb_g;
        state.set_node_stage(self.node_num, Stage::Motion);
        Ok(())
    }

    /// Coriolis acceleration and gyroscopic force.
    ///
    /// These depend only on velocities, not on the articulated inertias.
    /// Requires this node's motion. The inward articulated-inertia pass runs
    /// this first, so callers only need it for the velocity terms alone.
    pub fn calc_joint_independent_dynamics_vel(&self, state: &mut TreeState) -> Result<()> {
        require(state, self.node_num, Stage::Motion)?;
        let Some(parent) = self.parent else {
            let dc = state.upd_dynamics_cache();
            *self.to_b(&mut dc.coriolis_acceleration) = SpatialVector::zeros();
            *self.to_b(&mut dc.gyroscopic_force) = SpatialVector::zeros();
            return Ok(());
        };

        let cc = state.configuration_cache();
        let mc = state.motion_cache();

        let w_p = angular(&mc.v_gb[parent.index()]);
        let v_pb_g = self.from_b(&mc.v_pb_g);
        let w_pb = angular(v_pb_g);
        let v_rel = linear(v_pb_g);
        let l = self.from_b(&cc.phi).l;
        let r_jb = -(self.from_b(&cc.x_gb).rotation * self.x_bj.translation.vector);

        let coriolis = spatial_vector(
            &w_p.cross(&w_pb),
            &(w_p.cross(&w_p.cross(&l)) + 2.0 * w_p.cross(&v_rel) + w_pb.cross(&w_pb.cross(&r_jb))),
        );

        let w = angular(self.from_b(&mc.v_gb));
        let cb_g = self.from_b(&cc.cb_g);
        let gyroscopic = spatial_vector(
            &w.cross(&(self.from_b(&cc.inertia_ob_g) * w)),
            &(w.cross(&w.cross(cb_g)) * self.mass()),
        );

        let dc = state.upd_dynamics_cache();
        *self.to_b(&mut dc.coriolis_acceleration) = coriolis;
        *self.to_b(&mut dc.gyroscopic_force) = gyroscopic;
        Ok(())
    }

    /// Velocity terms, articulated-body inertia and its joint projections.
    ///
    /// Postorder: every child must already be at Dynamics. Marks this node
    /// Dynamics.
    pub fn calc_articulated_body_inertias_inward(&self, state: &mut TreeState) -> Result<()> {
        require(state, self.node_num, Stage::Motion)?;
        for &child in &self.children {
            require(state, child, Stage::Dynamics)?;
        }
        self.calc_joint_independent_dynamics_vel(state)?;
        if self.parent.is_none() {
            state.set_node_stage(self.node_num, Stage::Dynamics);
            return Ok(());
        }

        let cc = state.configuration_cache();
        let dc = state.dynamics_cache();

        let mut p = *self.from_b(&cc.mk);
        for &child in &self.children {
            let c = child.index();
            p += cc.phi[c].shift_inertia(&(dc.tau_bar[c] * dc.articulated_inertia[c]));
        }
        let centrifugal =
            p * self.from_b(&dc.coriolis_acceleration) + self.from_b(&dc.gyroscopic_force);

        let dof = self.dof();
        let (tau_bar, g, d, di) = if dof == 0 {
            (
                SpatialMatrix::identity(),
                Matrix6xX::zeros(0),
                DMatrix::zeros(0, 0),
                DMatrix::zeros(0, 0),
            )
        } else {
            let h = self.h_matrix(cc);
            let ph = p * &h;
            let d = h.transpose() * &ph;
            let di = d
                .clone()
                .try_inverse()
                .filter(|di| di.iter().all(|x| x.is_finite()))
                .ok_or(SimError::SingularArticulatedInertia {
                    node: self.node_num,
                })?;
            let g = &ph * &di;
            let tau_bar = SpatialMatrix::identity() - &g * h.transpose();
            (tau_bar, g, d, di)
        };
        let psi = self.from_b(&cc.phi).to_matrix() * tau_bar;

        let dc = state.upd_dynamics_cache();
        *self.to_b(&mut dc.articulated_inertia) = p;
        *self.to_b(&mut dc.centrifugal_force) = centrifugal;
        *self.to_b(&mut dc.tau_bar) = tau_bar;
        *self.to_b(&mut dc.psi) = psi;
        for (slot, col) in self.to_u(&mut dc.g).iter_mut().zip(g.column_iter()) {
            *slot = col.into_owned();
        }
        self.to_usq(&mut dc.d).copy_from_slice(d.as_slice());
        self.to_usq(&mut dc.di).copy_from_slice(di.as_slice());

        state.set_node_stage(self.node_num, Stage::Dynamics);
        Ok(())
    }

    /// Outward pass for [`y`](Self::y).
    ///
    /// Requires this node and its parent at Dynamics, with the parent's `Y`
    /// already computed.
    pub fn calc_y_outward(&self, state: &mut TreeState) -> Result<()> {
        require(state, self.node_num, Stage::Dynamics)?;
        let Some(parent) = self.parent else {
            *self.to_b(&mut state.upd_dynamics_cache().y) = SpatialMatrix::zeros();
            return Ok(());
        };
        require(state, parent, Stage::Dynamics)?;

        let y = {
            let dc = state.dynamics_cache();
            let psi = self.from_b(&dc.psi);
            let mut y = psi.transpose() * dc.y[parent.index()] * psi;
            if self.dof() > 0 {
                let h = self.h_matrix(state.configuration_cache());
                y += &h * self.di_matrix(dc) * h.transpose();
            }
            y
        };
        *self.to_b(&mut state.upd_dynamics_cache().y) = y;
        Ok(())
    }

    /// Shared inward step: returns `(z, ε, Gε)`.
    ///
    /// With `include_velocity` false the centrifugal term is dropped, which
    /// turns the recursion into the first half of `M⁻¹ f`.
    #[allow(clippy::too_many_arguments)]
    fn inward_step(
        &self,
        state: &TreeState,
        include_velocity: bool,
        force: &SpatialVector,
        tau: &[f64],
        all_z: &[SpatialVector],
        all_gepsilon: &[SpatialVector],
    ) -> (SpatialVector, DVector<f64>, SpatialVector) {
        let cc = state.configuration_cache();
        let dc = state.dynamics_cache();

        let mut z = if include_velocity {
            self.from_b(&dc.centrifugal_force) - force
        } else {
            -force
        };
        for &child in &self.children {
            let c = child.index();
            z += cc.phi[c].shift_force(&(all_z[c] + all_gepsilon[c]));
        }

        if self.dof() == 0 {
            return (z, DVector::zeros(0), SpatialVector::zeros());
        }
        let h = self.h_matrix(cc);
        let epsilon = DVector::from_column_slice(tau) - h.transpose() * z;
        let gepsilon = self.g_matrix(dc) * &epsilon;
        (z, epsilon, gepsilon)
    }

    /// Shared outward step: returns `(u̇, A_GB)`.
    fn outward_step(
        &self,
        state: &TreeState,
        include_velocity: bool,
        a_gp: &SpatialVector,
        epsilon: &[f64],
    ) -> (DVector<f64>, SpatialVector) {
        let cc = state.configuration_cache();
        let dc = state.dynamics_cache();

        let mut a_gb = self.from_b(&cc.phi).shift_motion(a_gp);
        let udot = if self.dof() == 0 {
            DVector::zeros(0)
        } else {
            let udot = self.di_matrix(dc) * DVector::from_column_slice(epsilon)
                - self.g_matrix(dc).transpose() * a_gb;
            a_gb += self.h_matrix(cc) * &udot;
            udot
        };
        if include_velocity {
            a_gb += self.from_b(&dc.coriolis_acceleration);
        }
        (udot, a_gb)
    }

    /// Inward bias-force pass into the reaction cache.
    ///
    /// `spatial_force` is the applied force on this body; joint forces come
    /// from the state. Children must have run first.
    pub fn calc_z(&self, state: &mut TreeState, spatial_force: &SpatialVector) -> Result<()> {
        require(state, self.node_num, Stage::Dynamics)?;
        if self.parent.is_none() {
            return Ok(());
        }
        let (z, epsilon, gepsilon) = {
            let rc = state.reaction_cache();
            self.inward_step(
                state,
                true,
                spatial_force,
                self.from_u(state.joint_forces().as_slice()),
                &rc.z,
                &rc.gepsilon,
            )
        };

        let rc = state.upd_reaction_cache();
        *self.to_b(&mut rc.z) = z;
        *self.to_b(&mut rc.gepsilon) = gepsilon;
        self.to_u(rc.epsilon.as_mut_slice())
            .copy_from_slice(epsilon.as_slice());
        Ok(())
    }

    /// Inward bias-force pass into caller-owned arrays.
    ///
    /// Same recursion as [`calc_z`](Self::calc_z), reading forces from the
    /// arguments and leaving the state untouched.
    pub fn calc_udot_pass1_inward(
        &self,
        state: &TreeState,
        joint_forces: &DVector<f64>,
        body_forces: &[SpatialVector],
        all_z: &mut [SpatialVector],
        all_gepsilon: &mut [SpatialVector],
        all_epsilon: &mut DVector<f64>,
    ) -> Result<()> {
        require(state, self.node_num, Stage::Dynamics)?;
        if self.parent.is_none() {
            return Ok(());
        }
        let (z, epsilon, gepsilon) = self.inward_step(
            state,
            true,
            self.from_b(body_forces),
            self.from_u(joint_forces.as_slice()),
            all_z,
            all_gepsilon,
        );
        *self.to_b(all_z) = z;
        *self.to_b(all_gepsilon) = gepsilon;
        self.to_u(all_epsilon.as_mut_slice())
            .copy_from_slice(epsilon.as_slice());
        Ok(())
    }

    /// Outward acceleration pass into caller-owned arrays.
    pub fn calc_udot_pass2_outward(
        &self,
        state: &TreeState,
        all_epsilon: &DVector<f64>,
        all_a_gb: &mut [SpatialVector],
        all_udot: &mut DVector<f64>,
    ) -> Result<()> {
        require(state, self.node_num, Stage::Dynamics)?;
        let Some(parent) = self.parent else {
            *self.to_b(all_a_gb) = SpatialVector::zeros();
            return Ok(());
        };
        let (udot, a_gb) = self.outward_step(
            state,
            true,
            &all_a_gb[parent.index()],
            self.from_u(all_epsilon.as_slice()),
        );
        *self.to_b(all_a_gb) = a_gb;
        self.to_u(all_udot.as_mut_slice())
            .copy_from_slice(udot.as_slice());
        Ok(())
    }

    /// Outward acceleration pass into the reaction cache.
    ///
    /// Requires the parent at Reaction; marks this node Reaction.
    pub fn calc_udot_pass2(&self, state: &mut TreeState) -> Result<()> {
        require(state, self.node_num, Stage::Dynamics)?;
        let Some(parent) = self.parent else {
            *self.to_b(&mut state.upd_reaction_cache().a_gb) = SpatialVector::zeros();
            state.set_node_stage(self.node_num, Stage::Reaction);
            return Ok(());
        };
        require(state, parent, Stage::Reaction)?;

        let (udot, a_gb) = {
            let rc = state.reaction_cache();
            self.outward_step(
                state,
                true,
                &rc.a_gb[parent.index()],
                self.from_u(rc.epsilon.as_slice()),
            )
        };

        let rc = state.upd_reaction_cache();
        *self.to_b(&mut rc.a_gb) = a_gb;
        self.to_u(rc.udot.as_mut_slice())
            .copy_from_slice(udot.as_slice());
        state.set_node_stage(self.node_num, Stage::Reaction);
        Ok(())
    }

    /// Inward half of `M⁻¹ f`: no velocity terms, no body forces.
    pub fn calc_m_inverse_f_inward(
        &self,
        state: &TreeState,
        f: &DVector<f64>,
        all_z: &mut [SpatialVector],
        all_gepsilon: &mut [SpatialVector],
        all_epsilon: &mut DVector<f64>,
    ) -> Result<()> {
        require(state, self.node_num, Stage::Dynamics)?;
        if self.parent.is_none() {
            return Ok(());
        }
        let (z, epsilon, gepsilon) = self.inward_step(
            state,
            false,
            &SpatialVector::zeros(),
            self.from_u(f.as_slice()),
            all_z,
            all_gepsilon,
        );
        *self.to_b(all_z) = z;
        *self.to_b(all_gepsilon) = gepsilon;
        self.to_u(all_epsilon.as_mut_slice())
            .copy_from_slice(epsilon.as_slice());
        Ok(())
    }

    /// Outward half of `M⁻¹ f`.
    pub fn calc_m_inverse_f_outward(
        &self,
        state: &TreeState,
        all_epsilon: &DVector<f64>,
        all_a_gb: &mut [SpatialVector],
        all_udot: &mut DVector<f64>,
    ) -> Result<()> {
        require(state, self.node_num, Stage::Dynamics)?;
        let Some(parent) = self.parent else {
            *self.to_b(all_a_gb) = SpatialVector::zeros();
            return Ok(());
        };
        let (udot, a_gb) = self.outward_step(
            state,
            false,
            &all_a_gb[parent.index()],
            self.from_u(all_epsilon.as_slice()),
        );
        *self.to_b(all_a_gb) = a_gb;
        self.to_u(all_udot.as_mut_slice())
            .copy_from_slice(udot.as_slice());
        Ok(())
    }

    /// Joint-space gradient `Jᵀ X` from per-body spatial gradients `X`.
    ///
    /// `z = X + Σ Φ_c z_c`, `(Jᵀ X)_joint = Hᵀ z`. Inward; children must have
    /// run first.
    pub fn calc_internal_gradient_from_spatial(
        &self,
        state: &TreeState,
        z_tmp: &mut [SpatialVector],
        x: &[SpatialVector],
        jx: &mut DVector<f64>,
    ) -> Result<()> {
        require(state, self.node_num, Stage::Configuration)?;
        if self.parent.is_none() {
            return Ok(());
        }
        let cc = state.configuration_cache();
        let mut z = *self.from_b(x);
        for &child in &self.children {
            let c = child.index();
            z += cc.phi[c].shift_force(&z_tmp[c]);
        }
        *self.to_b(z_tmp) = z;
        if self.dof() > 0 {
            let g = self.h_matrix(cc).transpose() * z;
            self.to_u(jx.as_mut_slice()).copy_from_slice(g.as_slice());
        }
        Ok(())
    }

    /// Joint forces equivalent to a set of body forces: `τ = Hᵀ (F + Σ Φ_c z_c)`.
    ///
    /// Inward; children must have run first.
    pub fn calc_equivalent_joint_forces(
        &self,
        state: &TreeState,
        body_forces: &[SpatialVector],
        all_z: &mut [SpatialVector],
        joint_forces: &mut DVector<f64>,
    ) -> Result<()> {
        self.calc_internal_gradient_from_spatial(state, all_z, body_forces, joint_forces)
    }

    /// `½ Vᵀ Mk V` for this body alone.
    pub fn calc_kinetic_energy(&self, state: &TreeState) -> Result<f64> {
        require(state, self.node_num, Stage::Motion)?;
        let v = self.from_b(&state.motion_cache().v_gb);
        let mk = self.from_b(&state.configuration_cache().mk);
        Ok(0.5 * v.dot(&(mk * v)))
    }

    // Joint-space kinematics

    /// Write this joint's `q̇` into the global vector.
    pub fn calc_qdot(&self, state: &TreeState, qdot: &mut DVector<f64>) -> Result<()> {
        self.mobilizer.calc_qdot(
            self.from_q(state.q().as_slice()),
            self.from_u(state.u().as_slice()),
            self.to_q(qdot.as_mut_slice()),
        )
    }

    /// Write this joint's `q̈` into the global vector.
    pub fn calc_qdotdot(
        &self,
        state: &TreeState,
        udot: &DVector<f64>,
        qdotdot: &mut DVector<f64>,
    ) -> Result<()> {
        self.mobilizer.calc_qdotdot(
            self.from_q(state.q().as_slice()),
            self.from_u(state.u().as_slice()),
            self.from_u(udot.as_slice()),
            self.to_q(qdotdot.as_mut_slice()),
        )
    }

    /// Overwrite this joint's generalized coordinates.
    ///
    /// `q` holds this joint's values only (`max_nq` of them).
    pub fn set_q(&self, state: &mut TreeState, q: &[f64]) -> Result<()> {
        if self.is_ground_node() {
            return Err(self.mobilizer.unsupported("set_q"));
        }
        check_joint_len("joint q", self.max_nq(), q.len())?;
        self.to_q(state.upd_q().as_mut_slice()).copy_from_slice(q);
        Ok(())
    }

    /// Overwrite this joint's generalized speeds.
    ///
    /// `u` holds this joint's values only (`dof` of them).
    pub fn set_u(&self, state: &mut TreeState, u: &[f64]) -> Result<()> {
        if self.is_ground_node() {
            return Err(self.mobilizer.unsupported("set_u"));
        }
        check_joint_len("joint u", self.dof(), u.len())?;
        self.to_u(state.upd_u().as_mut_slice()).copy_from_slice(u);
        Ok(())
    }

    /// Set this joint's speeds from a desired body velocity relative to the parent.
    ///
    /// `v_pb_g` is taken about the body origin and expressed in ground, like
    /// [`v_pb_g`](Self::v_pb_g). The part outside the joint's subspace is
    /// dropped. Requires this node's configuration.
    pub fn set_vel_from_svel(&self, state: &mut TreeState, v_pb_g: &SpatialVector) -> Result<()> {
        require(state, self.node_num, Stage::Configuration)?;
        let Some(parent) = self.parent else {
            return Err(self.mobilizer.unsupported("set_vel_from_svel"));
        };

        let cc = state.configuration_cache();
        let r_gjb = (cc.x_gb[parent.index()] * self.x_pjb).rotation;
        let r_jb = -(self.from_b(&cc.x_gb).rotation * self.x_bj.translation.vector);

        // Move from OB to OJ, then into Jb
        let w = angular(v_pb_g);
        let v_j = linear(v_pb_g) - w.cross(&r_jb);
        let v_jbj = spatial_vector(
            &r_gjb.inverse_transform_vector(&w),
            &r_gjb.inverse_transform_vector(&v_j),
        );

        let u = self.mobilizer.set_vel_from_svel(&v_jbj)?;
        self.to_u(state.upd_u().as_mut_slice()).copy_from_slice(&u);
        Ok(())
    }

    /// Renormalize this joint's quaternion, if it has one.
    ///
    /// Returns whether q changed; q is only touched (and stages invalidated)
    /// when it did.
    pub fn enforce_quaternion_constraints(&self, state: &mut TreeState) -> bool {
        let mut q: SmallVec<[f64; 7]> = SmallVec::from_slice(self.from_q(state.q().as_slice()));
        if !self.mobilizer.enforce_quaternion_constraints(&mut q) {
            return false;
        }
        self.to_q(state.upd_q().as_mut_slice()).copy_from_slice(&q);
        true
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_create_advances_counters() {
        let (mut nu, mut nusq, mut nq) = (2, 4, 3);
        let node = RigidBodyNode::create(
            MassProperties::sphere(1.0, 0.1),
            Isometry3::identity(),
            Isometry3::identity(),
            JointType::Free,
            false,
            &mut nu,
            &mut nusq,
            &mut nq,
        )
        .unwrap();

        assert_eq!(node.u_index(), 2);
        assert_eq!(node.usq_index(), 4);
        assert_eq!(node.q_index(), 3);
        assert_eq!((nu, nusq, nq), (8, 40, 10));
        assert_eq!(node.dof(), 6);
        assert_eq!(node.max_nq(), 7);
    }

    #[test]
    fn test_create_derived_constants() {
        let (mut nu, mut nusq, mut nq) = (0, 0, 0);
        let x_pjb = Isometry3::translation(1.0, 0.0, 0.0);
        let x_bj = Isometry3::translation(0.0, 2.0, 0.0);
        let node = RigidBodyNode::create(
            MassProperties::point_mass(1.0).with_center_of_mass(Vector3::new(0.0, 0.0, 1.0)),
            x_pjb,
            x_bj,
            JointType::Pin,
            false,
            &mut nu,
            &mut nusq,
            &mut nq,
        )
        .unwrap();

        assert_relative_eq!(
            node.ref_x_pb().translation.vector,
            Vector3::new(1.0, -2.0, 0.0),
            epsilon = 1e-12
        );
        assert_relative_eq!(node.x_jb().translation.vector, Vector3::new(0.0, -2.0, 0.0));
        assert_relative_eq!(node.inertia_ob_b()[(0, 0)], 1.0, epsilon = 1e-12);
        assert_relative_eq!(node.inertia_ob_b()[(2, 2)], 0.0, epsilon = 1e-12);
    }

    #[test]
    fn test_create_rejects_bad_input() {
        let (mut nu, mut nusq, mut nq) = (0, 0, 0);
        let err = RigidBodyNode::create(
            MassProperties::point_mass(-1.0),
            Isometry3::identity(),
            Isometry3::identity(),
            JointType::Pin,
            false,
            &mut nu,
            &mut nusq,
            &mut nq,
        )
        .unwrap_err();
        assert!(matches!(err, SimError::InvalidMassProperties { .. }));

        let err = RigidBodyNode::create(
            MassProperties::point_mass(1.0),
            Isometry3::identity(),
            Isometry3::identity(),
            JointType::Ball,
            true,
            &mut nu,
            &mut nusq,
            &mut nq,
        )
        .unwrap_err();
        assert!(err.is_unsupported());
        assert_eq!((nu, nusq, nq), (0, 0, 0));
    }
}
