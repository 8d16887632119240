//! Impulse solver contract.
//!
//! An impulse solver works on the multiplier system
//!
//! ```text
//! A[I,I] π[I] = rhs[I]
//! ```
//!
//! restricted to a *participating* index set `I` (p ≤ m rows of the m×m
//! matrix `A`). The participating rows are split into partitions, each with
//! its own projection rule:
//!
//! | Partition | Rows | Rule |
//! |-----------|------|------|
//! | [`UncondRt`] | 1–6 | always enforced |
//! | [`UniContactRt`] | normal + optional 2 friction | `sign·π_N ≤ 0`, `‖π_F‖ ≤ μ|π_N|` |
//! | [`UniSpeedRt`] | 1 | `sign·π ≤ 0` |
//! | [`BoundedRt`] | 1 | `lb ≤ π ≤ ub` |
//! | [`StateLtdFrictionRt`] | 1–3 | `‖π_F‖ ≤ μ N` with N fixed |
//! | [`ConstraintLtdFrictionRt`] | 1–3 | `‖π_F‖ ≤ μ ‖π_N‖` with N solved elsewhere |
//!
//! Each partition record carries its inputs plus a condition field that the
//! solver overwrites with the outcome of the last projection.

use nalgebra::{DMatrix, DVector};
use sim_types::Result;
use smallvec::SmallVec;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// Index of a multiplier (row and column) in the constraint system.
pub type MultiplierIndex = usize;

/// State of a unilateral constraint after projection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum UniCond {
    /// Not yet evaluated.
    #[default]
    Unknown,
    /// Multiplier clamped to zero; constraint inactive.
    Off,
    /// Constraint enforced as an equality.
    Active,
}

/// State of a bounded scalar constraint after projection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum BndCond {
    /// Not yet evaluated.
    #[default]
    Unknown,
    /// Multiplier held at the lower bound.
    SlipLow,
    /// Multiplier held at the upper bound.
    SlipHigh,
    /// Multiplier strictly inside its bounds; equation enforced.
    Engaged,
}

/// State of a friction group after projection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum FricCond {
    /// Not yet evaluated.
    #[default]
    Unknown,
    /// Friction saturated at its limit and scaled back.
    Sliding,
    /// Friction inside its limit; equations enforced.
    Rolling,
}

/// How a unilateral contact's normal multiplier takes part in a solve.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum ContactType {
    /// Normal is solved for in this call.
    #[default]
    Participate,
    /// Normal has a fixed value supplied by the caller; only friction is solved.
    Known,
    /// Contact is watched but neither normal nor friction is solved.
    Observe,
}

/// Always-enforced equality group.
#[derive(Debug, Clone, PartialEq, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct UncondRt {
    /// The 1–6 multipliers of the group.
    pub mults: SmallVec<[MultiplierIndex; 6]>,
}

impl UncondRt {
    /// Group over the given multipliers.
    #[must_use]
    pub fn new(mults: &[MultiplierIndex]) -> Self {
        debug_assert!((1..=6).contains(&mults.len()));
        Self {
            mults: SmallVec::from_slice(mults),
        }
    }
}

/// Unilateral contact with optional planar friction.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct UniContactRt {
    /// Sign convention: the solution must satisfy `sign·π_N ≤ 0`.
    pub sign: f64,
    /// Normal multiplier.
    pub normal: MultiplierIndex,
    /// Two friction multipliers, if the contact has friction.
    pub friction: Option<[MultiplierIndex; 2]>,
    /// Role of the normal in this solve.
    pub contact_type: ContactType,
    /// Normal value used when `contact_type` is [`ContactType::Known`].
    pub known_pi: f64,
    /// Effective coefficient of friction.
    pub eff_mu: f64,
    /// Output: normal condition.
    pub contact_cond: UniCond,
    /// Output: friction condition.
    pub friction_cond: FricCond,
}

impl UniContactRt {
    /// Frictionless participating contact.
    #[must_use]
    pub fn new(normal: MultiplierIndex, sign: f64) -> Self {
        debug_assert!(sign == 1.0 || sign == -1.0);
        Self {
            sign,
            normal,
            friction: None,
            contact_type: ContactType::Participate,
            known_pi: 0.0,
            eff_mu: 0.0,
            contact_cond: UniCond::Unknown,
            friction_cond: FricCond::Unknown,
        }
    }

    /// Add planar friction with the given coefficient.
    #[must_use]
    pub fn with_friction(mut self, friction: [MultiplierIndex; 2], eff_mu: f64) -> Self {
        self.friction = Some(friction);
        self.eff_mu = eff_mu;
        self
    }

    /// Fix the normal multiplier to a known value.
    #[must_use]
    pub fn known(mut self, known_pi: f64) -> Self {
        self.contact_type = ContactType::Known;
        self.known_pi = known_pi;
        self
    }

    /// Exclude the contact from the solve.
    #[must_use]
    pub fn observed(mut self) -> Self {
        self.contact_type = ContactType::Observe;
        self
    }

    /// Whether the contact has friction multipliers.
    #[must_use]
    pub fn has_friction(&self) -> bool {
        self.friction.is_some()
    }
}

/// One-sided speed constraint.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct UniSpeedRt {
    /// Multiplier.
    pub ix: MultiplierIndex,
    /// Sign convention: the solution must satisfy `sign·π ≤ 0`.
    pub sign: f64,
    /// Output: condition.
    pub cond: UniCond,
}

impl UniSpeedRt {
    /// Speed constraint on one multiplier.
    #[must_use]
    pub fn new(ix: MultiplierIndex, sign: f64) -> Self {
        debug_assert!(sign == 1.0 || sign == -1.0);
        Self {
            ix,
            sign,
            cond: UniCond::Unknown,
        }
    }
}

/// Scalar multiplier with constant bounds.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct BoundedRt {
    /// Multiplier.
    pub ix: MultiplierIndex,
    /// Lower bound.
    pub lb: f64,
    /// Upper bound.
    pub ub: f64,
    /// Output: condition.
    pub cond: BndCond,
}

impl BoundedRt {
    /// Bounded multiplier with `lb ≤ ub`.
    #[must_use]
    pub fn new(ix: MultiplierIndex, lb: f64, ub: f64) -> Self {
        debug_assert!(lb <= ub);
        Self {
            ix,
            lb,
            ub,
            cond: BndCond::Unknown,
        }
    }
}

/// Friction limited by a normal force fixed from the state.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct StateLtdFrictionRt {
    /// The 1–3 friction multipliers.
    pub friction: SmallVec<[MultiplierIndex; 3]>,
    /// Limiting normal force magnitude (non-negative).
    pub known_n: f64,
    /// Effective coefficient of friction.
    pub eff_mu: f64,
    /// Output: friction condition.
    pub friction_cond: FricCond,
}

impl StateLtdFrictionRt {
    /// Friction group limited by `eff_mu * known_n`.
    #[must_use]
    pub fn new(friction: &[MultiplierIndex], known_n: f64, eff_mu: f64) -> Self {
        debug_assert!((1..=3).contains(&friction.len()));
        Self {
            friction: SmallVec::from_slice(friction),
            known_n,
            eff_mu,
            friction_cond: FricCond::Unknown,
        }
    }
}

/// Friction limited by normal multipliers solved in the same call.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct ConstraintLtdFrictionRt {
    /// The 1–3 friction multipliers.
    pub friction: SmallVec<[MultiplierIndex; 3]>,
    /// The 1–3 normal multipliers whose norm sets the limit.
    pub normals: SmallVec<[MultiplierIndex; 3]>,
    /// Effective coefficient of friction.
    pub eff_mu: f64,
    /// Output: friction condition.
    pub friction_cond: FricCond,
}

impl ConstraintLtdFrictionRt {
    /// Friction group limited by `eff_mu * ‖π[normals]‖`.
    #[must_use]
    pub fn new(friction: &[MultiplierIndex], normals: &[MultiplierIndex], eff_mu: f64) -> Self {
        debug_assert!((1..=3).contains(&friction.len()));
        debug_assert!((1..=3).contains(&normals.len()));
        Self {
            friction: SmallVec::from_slice(friction),
            normals: SmallVec::from_slice(normals),
            eff_mu,
            friction_cond: FricCond::Unknown,
        }
    }
}

/// All partitions of one solve call.
#[derive(Debug, Clone, PartialEq, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct ConstraintPartitions {
    /// Unconditional groups.
    pub unconditional: Vec<UncondRt>,
    /// Unilateral contacts with optional friction.
    pub uni_contact: Vec<UniContactRt>,
    /// Unilateral speed constraints.
    pub uni_speed: Vec<UniSpeedRt>,
    /// Bounded scalars.
    pub bounded: Vec<BoundedRt>,
    /// Constraint-limited friction groups.
    pub cons_ltd_friction: Vec<ConstraintLtdFrictionRt>,
    /// State-limited friction groups.
    pub state_ltd_friction: Vec<StateLtdFrictionRt>,
}

impl ConstraintPartitions {
    /// Empty partition set.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of constraint equations the partitions contribute.
    ///
    /// Observed contacts contribute nothing. A participating normal counts
    /// one, and a friction pair counts two even when its normal is known.
    /// This must equal the size of the participating set.
    #[must_use]
    pub fn equation_count(&self) -> usize {
        let mut count = self.uni_speed.len() + self.bounded.len();
        count += self
            .unconditional
            .iter()
            .map(|rt| rt.mults.len())
            .sum::<usize>();
        for rt in &self.uni_contact {
            if rt.contact_type == ContactType::Observe {
                continue;
            }
            if rt.contact_type == ContactType::Participate {
                count += 1;
            }
            if rt.has_friction() {
                count += 2;
            }
        }
        count += self
            .state_ltd_friction
            .iter()
            .map(|rt| rt.friction.len())
            .sum::<usize>();
        count += self
            .cons_ltd_friction
            .iter()
            .map(|rt| rt.friction.len())
            .sum::<usize>();
        count
    }

    /// Whether no partition has any entry.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.unconditional.is_empty()
            && self.uni_contact.is_empty()
            && self.uni_speed.is_empty()
            && self.bounded.is_empty()
            && self.cons_ltd_friction.is_empty()
            && self.state_ltd_friction.is_empty()
    }

    /// Largest multiplier index referenced by any partition.
    #[must_use]
    pub fn max_index(&self) -> Option<MultiplierIndex> {
        let uncond = self.unconditional.iter().flat_map(|rt| rt.mults.iter().copied());
        let contact = self.uni_contact.iter().flat_map(|rt| {
            std::iter::once(rt.normal).chain(rt.friction.into_iter().flatten())
        });
        let speed = self.uni_speed.iter().map(|rt| rt.ix);
        let bounded = self.bounded.iter().map(|rt| rt.ix);
        let cons = self
            .cons_ltd_friction
            .iter()
            .flat_map(|rt| rt.friction.iter().chain(rt.normals.iter()).copied());
        let state = self
            .state_ltd_friction
            .iter()
            .flat_map(|rt| rt.friction.iter().copied());
        uncond
            .chain(contact)
            .chain(speed)
            .chain(bounded)
            .chain(cons)
            .chain(state)
            .max()
    }
}

/// Diagnostic counters for one phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct PhaseCounters {
    /// Number of `solve` calls.
    pub solves: usize,
    /// Total iterations across all calls.
    pub iterations: usize,
    /// Number of calls that did not converge.
    pub failures: usize,
}

/// Per-phase diagnostic counters kept by a solver instance.
///
/// Phases are small integers chosen by the caller. Storage grows on demand.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct SolverStats {
    phases: Vec<PhaseCounters>,
}

impl SolverStats {
    /// Counters for a phase; zero for phases never seen.
    #[must_use]
    pub fn phase(&self, phase: usize) -> PhaseCounters {
        self.phases.get(phase).copied().unwrap_or_default()
    }

    /// Number of `solve` calls for a phase.
    #[must_use]
    pub fn solves(&self, phase: usize) -> usize {
        self.phase(phase).solves
    }

    /// Total iterations for a phase.
    #[must_use]
    pub fn iterations(&self, phase: usize) -> usize {
        self.phase(phase).iterations
    }

    /// Number of convergence failures for a phase.
    #[must_use]
    pub fn failures(&self, phase: usize) -> usize {
        self.phase(phase).failures
    }

    /// Number of phases with any recorded activity slot.
    #[must_use]
    pub fn num_phases(&self) -> usize {
        self.phases.len()
    }

    /// Reset every counter.
    pub fn clear(&mut self) {
        self.phases.clear();
    }

    /// Mutable counters for a phase, growing storage if needed.
    pub fn phase_mut(&mut self, phase: usize) -> &mut PhaseCounters {
        if self.phases.len() <= phase {
            self.phases.resize(phase + 1, PhaseCounters::default());
        }
        &mut self.phases[phase]
    }
}

/// A solver for the partitioned multiplier system.
///
/// Implementations keep only diagnostic state between calls; the problem
/// itself is owned by the caller for the duration of one [`solve`].
///
/// [`solve`]: ImpulseSolver::solve
pub trait ImpulseSolver {
    /// Solve for `pi` in place.
    ///
    /// * `phase` - diagnostic tag for the counters
    /// * `participating` - the p ≤ m active rows/columns
    /// * `a` - m×m symmetric matrix with regularization already added
    /// * `d` - the m diagonal regularization terms included in `a`
    /// * `rhs` - m right-hand side values
    /// * `pi` - m multipliers: initial guess on entry, result on exit
    /// * `partitions` - partition records; conditions are overwritten
    ///
    /// Returns whether the iteration converged. A `false` result still leaves
    /// the best available iterate in `pi`.
    ///
    /// # Panics
    ///
    /// Panics if the dimensions of `a`, `rhs`, `pi` and `participating`
    /// disagree.
    #[allow(clippy::too_many_arguments)]
    fn solve(
        &mut self,
        phase: usize,
        participating: &[MultiplierIndex],
        a: &DMatrix<f64>,
        d: &DVector<f64>,
        rhs: &DVector<f64>,
        pi: &mut DVector<f64>,
        partitions: &mut ConstraintPartitions,
    ) -> bool;

    /// Diagnostic counters accumulated so far.
    fn stats(&self) -> &SolverStats;

    /// Reset the diagnostic counters.
    fn clear_stats(&mut self);

    /// Iteration cap per call.
    fn max_iterations(&self) -> usize;

    /// Change the iteration cap per call.
    fn set_max_iterations(&mut self, max_iterations: usize);

    /// Convergence tolerance on the RMS of enforced residuals.
    fn convergence_tol(&self) -> f64;

    /// Change the convergence tolerance.
    fn set_convergence_tol(&mut self, tol: f64);

    /// Check the solver's settings before it is used.
    ///
    /// # Errors
    ///
    /// Returns [`SimError::InvalidConfig`](sim_types::SimError::InvalidConfig)
    /// for settings under which no solve can succeed.
    fn validate(&self) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_equation_count_accounting() {
        let mut parts = ConstraintPartitions::new();
        assert_eq!(parts.equation_count(), 0);
        assert!(parts.is_empty());

        parts.unconditional.push(UncondRt::new(&[0, 1, 2]));
        parts
            .uni_contact
            .push(UniContactRt::new(3, -1.0).with_friction([4, 5], 0.5));
        // Known normal: friction still participates
        parts
            .uni_contact
            .push(UniContactRt::new(6, -1.0).with_friction([7, 8], 0.5).known(2.0));
        // Observed: nothing participates
        parts
            .uni_contact
            .push(UniContactRt::new(9, -1.0).with_friction([10, 11], 0.5).observed());
        parts.uni_speed.push(UniSpeedRt::new(12, 1.0));
        parts.bounded.push(BoundedRt::new(13, -1.0, 1.0));
        parts
            .state_ltd_friction
            .push(StateLtdFrictionRt::new(&[14, 15, 16], 1.0, 0.3));
        parts
            .cons_ltd_friction
            .push(ConstraintLtdFrictionRt::new(&[17], &[0], 0.3));

        // 3 + (1 + 2) + 2 + 0 + 1 + 1 + 3 + 1
        assert_eq!(parts.equation_count(), 14);
        assert_eq!(parts.max_index(), Some(17));
        assert!(!parts.is_empty());
    }

    #[test]
    fn test_stats_grow_on_demand() {
        let mut stats = SolverStats::default();
        assert_eq!(stats.solves(3), 0);

        stats.phase_mut(2).solves += 1;
        stats.phase_mut(2).failures += 1;
        assert_eq!(stats.num_phases(), 3);
        assert_eq!(stats.solves(2), 1);
        assert_eq!(stats.failures(2), 1);
        assert_eq!(stats.iterations(0), 0);

        stats.clear();
        assert_eq!(stats.solves(2), 0);
    }

    #[test]
    fn test_contact_builders() {
        let rt = UniContactRt::new(0, -1.0);
        assert!(!rt.has_friction());
        assert_eq!(rt.contact_type, ContactType::Participate);

        let rt = rt.with_friction([1, 2], 0.8).known(3.0);
        assert!(rt.has_friction());
        assert_eq!(rt.contact_type, ContactType::Known);
        assert!((rt.known_pi - 3.0).abs() < 1e-15);
    }
}
