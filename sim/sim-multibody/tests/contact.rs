//! Contact through the impulse driver.
//!
//! A sphere on a free joint meets a floor at z = 0. The constraint source
//! supplies one normal row and two friction rows at the contact point; the
//! projected Gauss-Seidel solver does the rest.

use approx::assert_relative_eq;
use nalgebra::{DMatrix, DVector, Isometry3};
use sim_constraint::{ConstraintPartitions, ImpulseSolver, UniContactRt};
use sim_multibody::{
    ImpulseConstraintSource, ImpulseConstraints, JointType, RigidBodyTree, SemiExplicitEulerDriver,
    TimeSteppingDriver, TreeState,
};
use sim_types::{MassProperties, NodeId, Result, SimulationConfig};

const RADIUS: f64 = 0.1;
const MU: f64 = 0.5;
const H: f64 = 1e-3;

/// Floor contact for a sphere whose free joint is aligned with ground.
///
/// With u = [ω; v] in ground and the contact point at -r ẑ from the center,
/// the point velocity is `v + ω × (-r ẑ)`.
#[derive(Debug)]
struct SphereOnFloor;

impl ImpulseConstraintSource for SphereOnFloor {
    fn constraints(
        &mut self,
        _tree: &RigidBodyTree,
        state: &TreeState,
    ) -> Result<Option<ImpulseConstraints>> {
        if state.q()[6] > RADIUS + 1e-9 {
            return Ok(None);
        }
        #[rustfmt::skip]
        let jacobian = DMatrix::from_row_slice(3, 6, &[
            0.0,     0.0,    0.0, 0.0, 0.0, 1.0,
            0.0,    -RADIUS, 0.0, 1.0, 0.0, 0.0,
            RADIUS,  0.0,    0.0, 0.0, 1.0, 0.0,
        ]);
        let mut partitions = ConstraintPartitions::new();
        partitions
            .uni_contact
            .push(UniContactRt::new(0, -1.0).with_friction([1, 2], MU));
        Ok(Some(ImpulseConstraints::new(jacobian, DVector::zeros(3), partitions)))
    }
}

fn sphere_tree() -> RigidBodyTree {
    let mut tree = RigidBodyTree::new();
    tree.add_body(
        NodeId::GROUND,
        MassProperties::sphere(1.0, RADIUS),
        Isometry3::identity(),
        Isometry3::identity(),
        JointType::Free,
        false,
    )
    .unwrap();
    tree
}

fn driver() -> SemiExplicitEulerDriver {
    SemiExplicitEulerDriver::new(SimulationConfig::with_timestep(H))
        .unwrap()
        .with_constraints(Box::new(SphereOnFloor))
}

#[test]
fn resting_sphere_stays_on_floor() {
    let tree = sphere_tree();
    let mut state = tree.create_state();
    state.upd_q()[6] = RADIUS;
    let mut driver = driver();

    for _ in 0..100 {
        let report = driver.step(&tree, &mut state).unwrap();
        let impulse = report.impulse.unwrap();
        assert!(impulse.converged);
        assert_relative_eq!(impulse.pi[0], 9.81 * H, epsilon = 1e-9);
    }
    assert_relative_eq!(state.q()[6], RADIUS, epsilon = 1e-9);
    assert_relative_eq!(state.u()[5], 0.0, epsilon = 1e-9);
}

#[test]
fn sliding_sphere_starts_rolling() {
    let tree = sphere_tree();
    let mut state = tree.create_state();
    state.upd_q()[6] = RADIUS;
    state.upd_u()[3] = 1.0;
    let mut driver = driver();

    // Sliding friction bounded by μ·π_n on the first step
    let report = driver.step(&tree, &mut state).unwrap();
    let pi = report.impulse.unwrap().pi;
    assert_relative_eq!(pi[1], -MU * pi[0], epsilon = 1e-9);
    assert_relative_eq!(state.u()[3], 1.0 - MU * 9.81 * H, epsilon = 1e-9);

    for _ in 0..299 {
        driver.step(&tree, &mut state).unwrap();
    }

    // A solid sphere loses 2/7 of its speed before rolling
    let v = state.u()[3];
    let spin = state.u()[1];
    assert_relative_eq!(v, 5.0 / 7.0, epsilon = 1e-6);
    assert_relative_eq!(v, RADIUS * spin, epsilon = 1e-6);
    assert_relative_eq!(state.q()[6], RADIUS, epsilon = 1e-9);
}

#[test]
fn airborne_sphere_has_no_impulses() {
    let tree = sphere_tree();
    let mut state = tree.create_state();
    state.upd_q()[6] = 1.0;
    let mut driver = driver();

    let report = driver.step(&tree, &mut state).unwrap();
    assert!(report.impulse.is_none());
    assert!(state.u()[5] < 0.0);
    assert_eq!(driver.solver().stats().solves(0), 0);
}
