//! Time stepping.
//!
//! A [`TimeSteppingDriver`] advances a tree's state by one step. The
//! provided [`SemiExplicitEulerDriver`] integrates
//!
//! ```text
//! u⁺ = u + h u̇(q, u)
//! u⁺ ← u⁺ + M⁻¹ Gᵀ π          (when constraints are active)
//! q⁺ = q + h q̇(q, u⁺)
//! ```
//!
//! The impulses `π` come from an [`ImpulseSolver`] applied to
//!
//! ```text
//! (G M⁻¹ Gᵀ + diag(D)) π = v_target - G u⁺
//! ```
//!
//! where `G`, `v_target` and `D` are supplied each step by an
//! [`ImpulseConstraintSource`]. `M⁻¹ Gᵀ` is formed one row at a time with
//! the tree's O(n) inverse mass product, so the mass matrix is never built.

use std::fmt;

use nalgebra::{DMatrix, DVector};
use sim_constraint::{ConstraintPartitions, ImpulseSolver, MultiplierIndex, PgsImpulseSolver};
use sim_types::{Result, SimError, SimulationConfig, SpatialVector, Stage};
use tracing::{trace, warn};

use crate::cache::TreeState;
use crate::tree::RigidBodyTree;

/// Solver phase tag used for velocity-level impulses.
pub const IMPULSE_PHASE: usize = 0;

/// Advances a tree's state by one step.
pub trait TimeSteppingDriver {
    /// Take one step, updating q, u and time in place.
    ///
    /// # Errors
    ///
    /// Returns an error if the tree cannot be realized or the step produces
    /// non-finite values.
    fn step(&mut self, tree: &RigidBodyTree, state: &mut TreeState) -> Result<StepReport>;
}

/// Supplies the constraint rows active at the start of a step.
pub trait ImpulseConstraintSource: fmt::Debug + Send {
    /// Rows to enforce this step, or `None` when nothing is active.
    ///
    /// The state is realized through Dynamics when this is called.
    ///
    /// # Errors
    ///
    /// Implementations may fail if they read stage data that is missing.
    fn constraints(
        &mut self,
        tree: &RigidBodyTree,
        state: &TreeState,
    ) -> Result<Option<ImpulseConstraints>>;
}

/// Velocity-level constraint rows for one step.
#[derive(Debug, Clone)]
pub struct ImpulseConstraints {
    /// `m × nu` constraint Jacobian `G`.
    pub jacobian: DMatrix<f64>,
    /// Desired constraint-space velocity after the step.
    pub target_velocity: DVector<f64>,
    /// Diagonal regularization `D` added to `G M⁻¹ Gᵀ`.
    pub regularization: DVector<f64>,
    /// Rows handed to the solver; the rest keep their `pi` entries.
    pub participating: Vec<MultiplierIndex>,
    /// Partition records covering the participating rows.
    pub partitions: ConstraintPartitions,
    /// Initial guess for the impulses.
    pub pi: DVector<f64>,
}

impl ImpulseConstraints {
    /// Every row participating, no regularization, zero initial guess.
    #[must_use]
    pub fn new(
        jacobian: DMatrix<f64>,
        target_velocity: DVector<f64>,
        partitions: ConstraintPartitions,
    ) -> Self {
        let m = jacobian.nrows();
        Self {
            jacobian,
            target_velocity,
            regularization: DVector::zeros(m),
            participating: (0..m).collect(),
            partitions,
            pi: DVector::zeros(m),
        }
    }

    /// Set the diagonal regularization.
    #[must_use]
    pub fn with_regularization(mut self, regularization: DVector<f64>) -> Self {
        self.regularization = regularization;
        self
    }

    /// Restrict the solve to a subset of rows.
    #[must_use]
    pub fn with_participating(mut self, rows: Vec<MultiplierIndex>) -> Self {
        self.participating = rows;
        self
    }

    /// Start the solver from a previous solution.
    #[must_use]
    pub fn with_warm_start(mut self, pi: DVector<f64>) -> Self {
        self.pi = pi;
        self
    }

    /// Number of rows.
    #[must_use]
    pub fn num_constraints(&self) -> usize {
        self.jacobian.nrows()
    }

    fn validate(&self, nu: usize) -> Result<()> {
        let m = self.num_constraints();
        let check = |what: &'static str, expected: usize, actual: usize| {
            if expected == actual {
                Ok(())
            } else {
                Err(SimError::DimensionMismatch {
                    what,
                    expected,
                    actual,
                })
            }
        };
        check("constraint jacobian columns", nu, self.jacobian.ncols())?;
        check("target velocity", m, self.target_velocity.len())?;
        check("regularization", m, self.regularization.len())?;
        check("initial impulses", m, self.pi.len())?;

        if let Some(&row) = self.participating.iter().find(|&&row| row >= m) {
            return Err(SimError::invalid_config(format!(
                "participating row {row} out of range for {m} constraints"
            )));
        }
        if let Some(max) = self.partitions.max_index() {
            if max >= m {
                return Err(SimError::invalid_config(format!(
                    "partition references row {max} but only {m} constraints exist"
                )));
            }
        }
        Ok(())
    }
}

/// Outcome of the impulse solve within one step.
#[derive(Debug, Clone, PartialEq)]
pub struct ImpulseReport {
    /// Whether the solver met its tolerance.
    pub converged: bool,
    /// Solver iterations spent this step.
    pub iterations: usize,
    /// Number of constraint rows.
    pub num_constraints: usize,
    /// Resulting impulses.
    pub pi: DVector<f64>,
}

/// Outcome of one step.
#[derive(Debug, Clone, PartialEq)]
pub struct StepReport {
    /// Simulated time after the step.
    pub time: f64,
    /// Impulse solve details, if constraints were active.
    pub impulse: Option<ImpulseReport>,
}

/// Semi-explicit Euler with velocity-level impulses.
#[derive(Debug)]
pub struct SemiExplicitEulerDriver<S: ImpulseSolver = PgsImpulseSolver> {
    config: SimulationConfig,
    solver: S,
    constraints: Option<Box<dyn ImpulseConstraintSource>>,
}

impl SemiExplicitEulerDriver<PgsImpulseSolver> {
    /// Driver using the default projected Gauss-Seidel solver.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid.
    pub fn new(config: SimulationConfig) -> Result<Self> {
        Self::with_solver(config, PgsImpulseSolver::default())
    }
}

impl<S: ImpulseSolver> SemiExplicitEulerDriver<S> {
    /// Driver using the given impulse solver.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration or the solver settings are
    /// invalid.
    pub fn with_solver(config: SimulationConfig, solver: S) -> Result<Self> {
        config.validate()?;
        solver.validate()?;
        Ok(Self {
            config,
            solver,
            constraints: None,
        })
    }

    /// Attach a constraint source.
    #[must_use]
    pub fn with_constraints(mut self, source: Box<dyn ImpulseConstraintSource>) -> Self {
        self.constraints = Some(source);
        self
    }

    /// Step configuration.
    #[must_use]
    pub fn config(&self) -> &SimulationConfig {
        &self.config
    }

    /// The impulse solver.
    #[must_use]
    pub fn solver(&self) -> &S {
        &self.solver
    }

    /// Mutable access to the impulse solver.
    pub fn solver_mut(&mut self) -> &mut S {
        &mut self.solver
    }

    fn apply_impulses(
        &mut self,
        tree: &RigidBodyTree,
        state: &TreeState,
        u_next: &mut DVector<f64>,
    ) -> Result<Option<ImpulseReport>> {
        let Some(source) = self.constraints.as_mut() else {
            return Ok(None);
        };
        let Some(mut rows) = source.constraints(tree, state)? else {
            return Ok(None);
        };
        rows.validate(tree.nu())?;
        let m = rows.num_constraints();
        if m == 0 {
            return Ok(None);
        }

        let mut minv_gt = DMatrix::zeros(tree.nu(), m);
        for (i, row) in rows.jacobian.row_iter().enumerate() {
            let col = tree.multiply_by_m_inv(state, &row.transpose())?;
            minv_gt.set_column(i, &col);
        }
        let mut a = &rows.jacobian * &minv_gt;
        for i in 0..m {
            a[(i, i)] += rows.regularization[i];
        }
        let rhs = &rows.target_velocity - &rows.jacobian * &*u_next;

        let before = self.solver.stats().iterations(IMPULSE_PHASE);
        let converged = self.solver.solve(
            IMPULSE_PHASE,
            &rows.participating,
            &a,
            &rows.regularization,
            &rhs,
            &mut rows.pi,
            &mut rows.partitions,
        );
        let iterations = self.solver.stats().iterations(IMPULSE_PHASE) - before;
        if !converged {
            warn!(
                time = state.time(),
                constraints = m,
                iterations,
                "impulse solve did not converge; applying best iterate"
            );
        }

        *u_next += &minv_gt * &rows.pi;
        Ok(Some(ImpulseReport {
            converged,
            iterations,
            num_constraints: m,
            pi: rows.pi,
        }))
    }
}

impl<S: ImpulseSolver> TimeSteppingDriver for SemiExplicitEulerDriver<S> {
    fn step(&mut self, tree: &RigidBodyTree, state: &mut TreeState) -> Result<StepReport> {
        let h = self.config.timestep;
        tree.realize(state, Stage::Dynamics)?;

        let gravity = tree.calc_gravity_forces(state, &self.config.gravity)?;
        let body_forces: Vec<SpatialVector> = state
            .body_forces()
            .iter()
            .zip(&gravity)
            .map(|(applied, weight)| applied + weight)
            .collect();
        let udot = tree.calc_udot_with_forces(state, state.joint_forces(), &body_forces)?;

        let mut u_next = state.u() + &udot * h;
        let impulse = if self.config.enable_impulses {
            self.apply_impulses(tree, state, &mut u_next)?
        } else {
            None
        };
        if u_next.iter().any(|x| !x.is_finite()) {
            return Err(SimError::diverged(format!(
                "non-finite generalized speeds at t = {}",
                state.time()
            )));
        }

        *state.upd_u() = u_next;
        let qdot = tree.calc_qdot(state)?;
        *state.upd_q() += qdot * h;
        if self.config.enforce_quaternions {
            tree.enforce_quaternion_constraints(state);
        }
        state.set_time(state.time() + h);

        trace!(time = state.time(), impulses = impulse.is_some(), "step complete");
        Ok(StepReport {
            time: state.time(),
            impulse,
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::mobilizer::JointType;
    use approx::assert_relative_eq;
    use nalgebra::{Isometry3, Vector3};
    use sim_constraint::{PgsConfig, UniCond, UniContactRt};
    use sim_types::{Gravity, MassProperties, NodeId};

    const H: f64 = 0.01;
    const G: f64 = 9.81;

    /// A body on a slider along x with gravity pulling toward -x.
    fn slider_tree(mass: f64) -> RigidBodyTree {
        let mut tree = RigidBodyTree::new();
        tree.add_body(
            NodeId::GROUND,
            MassProperties::point_mass(mass),
            Isometry3::identity(),
            Isometry3::identity(),
            JointType::Slider,
            false,
        )
        .unwrap();
        tree
    }

    fn config() -> SimulationConfig {
        SimulationConfig::with_timestep(H).gravity(Gravity::custom(Vector3::new(-G, 0.0, 0.0)))
    }

    /// Floor at q = 0 for the slider.
    #[derive(Debug)]
    struct Floor;

    impl ImpulseConstraintSource for Floor {
        fn constraints(
            &mut self,
            _tree: &RigidBodyTree,
            state: &TreeState,
        ) -> Result<Option<ImpulseConstraints>> {
            if state.q()[0] > 0.0 {
                return Ok(None);
            }
            let mut partitions = ConstraintPartitions::new();
            partitions.uni_contact.push(UniContactRt::new(0, -1.0));
            Ok(Some(ImpulseConstraints::new(
                DMatrix::from_element(1, 1, 1.0),
                DVector::zeros(1),
                partitions,
            )))
        }
    }

    #[test]
    fn test_free_fall_step() {
        let tree = slider_tree(1.0);
        let mut state = tree.create_state();
        state.upd_q()[0] = 1.0;
        let mut driver = SemiExplicitEulerDriver::new(config()).unwrap();

        let report = driver.step(&tree, &mut state).unwrap();
        assert!(report.impulse.is_none());
        assert_relative_eq!(report.time, H);
        assert_relative_eq!(state.u()[0], -G * H, epsilon = 1e-12);
        assert_relative_eq!(state.q()[0], 1.0 - G * H * H, epsilon = 1e-12);
    }

    #[test]
    fn test_contact_stops_body() {
        let mass = 2.0;
        let tree = slider_tree(mass);
        let mut state = tree.create_state();
        state.upd_u()[0] = -1.0;
        let mut driver = SemiExplicitEulerDriver::new(config())
            .unwrap()
            .with_constraints(Box::new(Floor));

        let report = driver.step(&tree, &mut state).unwrap();
        let impulse = report.impulse.unwrap();
        assert!(impulse.converged);
        assert_eq!(impulse.num_constraints, 1);
        assert_relative_eq!(impulse.pi[0], mass * (1.0 + G * H), epsilon = 1e-9);
        assert_relative_eq!(state.u()[0], 0.0, epsilon = 1e-9);
        assert_relative_eq!(state.q()[0], 0.0, epsilon = 1e-9);
    }

    #[test]
    fn test_contact_releases_when_separating() {
        let tree = slider_tree(1.0);
        let mut state = tree.create_state();
        state.upd_u()[0] = 5.0;
        let mut driver = SemiExplicitEulerDriver::new(config())
            .unwrap()
            .with_constraints(Box::new(Floor));

        let report = driver.step(&tree, &mut state).unwrap();
        assert_eq!(
            driver.solver().last_report().phase,
            IMPULSE_PHASE
        );
        let impulse = report.impulse.unwrap();
        assert_relative_eq!(impulse.pi[0], 0.0);
        assert_relative_eq!(state.u()[0], 5.0 - G * H, epsilon = 1e-12);
    }

    #[test]
    fn test_impulses_disabled() {
        let tree = slider_tree(1.0);
        let mut state = tree.create_state();
        let mut driver = SemiExplicitEulerDriver::new(config().without_impulses())
            .unwrap()
            .with_constraints(Box::new(Floor));

        let report = driver.step(&tree, &mut state).unwrap();
        assert!(report.impulse.is_none());
        assert!(state.u()[0] < 0.0);
    }

    #[test]
    fn test_rejects_bad_constraint_shape() {
        #[derive(Debug)]
        struct Misfit;
        impl ImpulseConstraintSource for Misfit {
            fn constraints(
                &mut self,
                _tree: &RigidBodyTree,
                _state: &TreeState,
            ) -> Result<Option<ImpulseConstraints>> {
                Ok(Some(ImpulseConstraints::new(
                    DMatrix::zeros(1, 3),
                    DVector::zeros(1),
                    ConstraintPartitions::new(),
                )))
            }
        }

        let tree = slider_tree(1.0);
        let mut state = tree.create_state();
        let mut driver = SemiExplicitEulerDriver::new(config())
            .unwrap()
            .with_constraints(Box::new(Misfit));
        let err = driver.step(&tree, &mut state).unwrap_err();
        assert!(matches!(err, SimError::DimensionMismatch { expected: 1, actual: 3, .. }));
    }

    #[test]
    fn test_rejects_invalid_config() {
        let err = SemiExplicitEulerDriver::new(SimulationConfig::with_timestep(-1.0)).unwrap_err();
        assert!(matches!(err, SimError::InvalidTimestep(_)));
    }

    #[test]
    fn test_rejects_invalid_solver_settings() {
        let solver = PgsImpulseSolver::new(PgsConfig::default().with_max_iterations(0));
        let err = SemiExplicitEulerDriver::with_solver(SimulationConfig::with_timestep(H), solver)
            .unwrap_err();
        assert!(err.is_config_error());
    }

    #[test]
    fn test_quaternion_kept_unit() {
        let mut tree = RigidBodyTree::new();
        tree.add_body(
            NodeId::GROUND,
            MassProperties::box_shape(1.0, Vector3::new(0.1, 0.2, 0.3)),
            Isometry3::identity(),
            Isometry3::identity(),
            JointType::Free,
            false,
        )
        .unwrap();
        let mut state = tree.create_state();
        state.upd_u()[0] = 3.0;
        state.upd_u()[1] = -2.0;
        let mut driver =
            SemiExplicitEulerDriver::new(SimulationConfig::with_timestep(H).zero_gravity()).unwrap();
        for _ in 0..50 {
            driver.step(&tree, &mut state).unwrap();
        }
        let norm = state.q().rows(0, 4).norm();
        assert_relative_eq!(norm, 1.0, epsilon = 1e-12);
        assert_relative_eq!(state.time(), 50.0 * H, epsilon = 1e-12);
    }

    #[test]
    fn test_constraints_start_unknown_and_reject_bad_rows() {
        let mut partitions = ConstraintPartitions::new();
        partitions.uni_contact.push(UniContactRt::new(0, -1.0));
        let rows = ImpulseConstraints::new(DMatrix::identity(1, 1), DVector::zeros(1), partitions);
        assert_eq!(rows.partitions.uni_contact[0].contact_cond, UniCond::Unknown);
        assert!(rows.validate(1).is_ok());
        assert!(rows.with_participating(vec![3]).validate(1).is_err());
    }
}
