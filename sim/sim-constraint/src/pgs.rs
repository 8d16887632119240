//! Projected Gauss-Seidel (PGS) impulse solver.
//!
//! This module solves the partitioned multiplier system described in
//! [`crate::impulse`] by Gauss-Seidel sweeps with Successive Over-Relaxation
//! (SOR), projecting each partition onto its feasible set right after its
//! rows are updated.
//!
//! # Algorithm
//!
//! For each scalar row r the update is
//!
//! ```text
//! er   = rhs[r] - Σ_{c ∈ I} A[r,c] π[c]
//! π[r] = π[r] + sor · er / A[r,r]        (skipped when A[r,r] ≤ 0)
//! ```
//!
//! where the sum runs over the participating columns only. Rows of a
//! multi-row group compute all of their residuals before any of them is
//! updated, so a group behaves as one Jacobi block inside the outer
//! Gauss-Seidel sweep.
//!
//! Partitions are swept in a fixed order so that friction limits always see
//! normal multipliers already updated in the same iteration:
//!
//! 1. unconditional groups
//! 2. unilateral contact normals
//! 3. unilateral contact friction
//! 4. unilateral speed constraints
//! 5. bounded scalars
//! 6. state-limited friction
//! 7. constraint-limited friction
//!
//! Two residual norms are tracked per iteration, both `sqrt(Σ er² / p)`:
//! one over every row and one over the rows whose constraint is currently
//! *enforced* (not switched off, not at a bound, not sliding). Convergence is
//! declared on the enforced norm.
//!
//! # Adaptive relaxation
//!
//! When the enforced norm grows from one iteration to the next, the
//! relaxation factor is cut by [`PgsConfig::sor_reduction`] down to
//! [`PgsConfig::min_sor`]. There is no matching increase for slowly
//! converging solves.
//!
//! # Example
//!
//! ```
//! use nalgebra::{DMatrix, DVector};
//! use sim_constraint::{
//!     ConstraintPartitions, ImpulseSolver, PgsConfig, PgsImpulseSolver, UncondRt,
//! };
//!
//! let a = DMatrix::from_row_slice(2, 2, &[2.0, 0.5, 0.5, 1.0]);
//! let d = DVector::zeros(2);
//! let rhs = DVector::from_vec(vec![1.0, 2.0]);
//! let mut pi = DVector::zeros(2);
//!
//! let mut partitions = ConstraintPartitions::new();
//! partitions.unconditional.push(UncondRt::new(&[0]));
//! partitions.unconditional.push(UncondRt::new(&[1]));
//!
//! let mut solver = PgsImpulseSolver::new(PgsConfig::high_accuracy());
//! let converged = solver.solve(0, &[0, 1], &a, &d, &rhs, &mut pi, &mut partitions);
//!
//! assert!(converged);
//! assert!((&a * &pi - &rhs).norm() < 1e-8);
//! ```

use nalgebra::{DMatrix, DVector};
use sim_types::{Result, SimError};
use smallvec::SmallVec;
use tracing::{debug, trace, warn};

use crate::impulse::{
    BndCond, ConstraintPartitions, ContactType, FricCond, ImpulseSolver, MultiplierIndex,
    SolverStats, UniCond,
};

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// Configuration for the PGS impulse solver.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct PgsConfig {
    /// Maximum number of sweeps per solve.
    pub max_iterations: usize,

    /// Convergence tolerance on the RMS of enforced residuals.
    pub convergence_tol: f64,

    /// Initial SOR factor.
    /// - 1.0: Standard Gauss-Seidel
    /// - < 1.0: Under-relaxation (more stable)
    /// - > 1.0: Over-relaxation (faster convergence if stable)
    pub sor: f64,

    /// Floor for the relaxation factor when it is reduced.
    pub min_sor: f64,

    /// Factor applied to the relaxation factor when the residual grows.
    pub sor_reduction: f64,
}

impl Default for PgsConfig {
    fn default() -> Self {
        Self {
            max_iterations: 100,
            convergence_tol: 1e-6,
            sor: 1.0, // Standard Gauss-Seidel
            min_sor: 0.1,
            sor_reduction: 0.8,
        }
    }
}

impl PgsConfig {
    /// High-accuracy configuration for precise simulations.
    #[must_use]
    pub fn high_accuracy() -> Self {
        Self {
            max_iterations: 1000,
            convergence_tol: 1e-12,
            ..Self::default()
        }
    }

    /// Fast configuration for real-time applications.
    #[must_use]
    pub fn realtime() -> Self {
        Self {
            max_iterations: 20,
            convergence_tol: 1e-4,
            sor: 1.2, // Mild over-relaxation
            ..Self::default()
        }
    }

    /// Set the initial SOR factor.
    #[must_use]
    pub const fn with_sor(mut self, sor: f64) -> Self {
        self.sor = sor;
        self
    }

    /// Set maximum iterations.
    #[must_use]
    pub const fn with_max_iterations(mut self, max_iterations: usize) -> Self {
        self.max_iterations = max_iterations;
        self
    }

    /// Set the convergence tolerance.
    #[must_use]
    pub const fn with_convergence_tol(mut self, tol: f64) -> Self {
        self.convergence_tol = tol;
        self
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<()> {
        if self.max_iterations == 0 {
            return Err(SimError::invalid_config("max_iterations must be positive"));
        }
        if self.convergence_tol.is_nan() || self.convergence_tol <= 0.0 {
            return Err(SimError::invalid_config("convergence tolerance must be positive"));
        }
        if self.sor.is_nan() || self.sor <= 0.0 || self.sor >= 2.0 {
            return Err(SimError::invalid_config("SOR factor must be in range (0, 2)"));
        }
        if self.min_sor.is_nan() || self.min_sor <= 0.0 || self.min_sor > self.sor {
            return Err(SimError::invalid_config(
                "minimum SOR factor must be in range (0, sor]",
            ));
        }
        if self.sor_reduction.is_nan() || self.sor_reduction <= 0.0 || self.sor_reduction >= 1.0 {
            return Err(SimError::invalid_config(
                "SOR reduction must be in range (0, 1)",
            ));
        }
        Ok(())
    }
}

/// Summary of the most recent solve.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct PgsReport {
    /// Phase tag of the call.
    pub phase: usize,
    /// Sweeps performed.
    pub iterations: usize,
    /// RMS residual over all participating rows in the last sweep.
    pub rms_all: f64,
    /// RMS residual over the enforced rows in the last sweep.
    pub rms_enforced: f64,
    /// Relaxation factor in effect at the end.
    pub final_sor: f64,
    /// Whether the relaxation factor was reduced during the call.
    pub sor_reduced: bool,
    /// Whether the call converged.
    pub converged: bool,
}

impl Default for PgsReport {
    fn default() -> Self {
        Self {
            phase: 0,
            iterations: 0,
            rms_all: 0.0,
            rms_enforced: 0.0,
            final_sor: 1.0,
            sor_reduced: false,
            converged: true,
        }
    }
}

/// Projected Gauss-Seidel impulse solver.
///
/// The instance carries only configuration and diagnostics. Use one instance
/// per simulation thread.
#[derive(Debug, Clone, Default)]
pub struct PgsImpulseSolver {
    config: PgsConfig,
    stats: SolverStats,
    last_report: PgsReport,
}

impl PgsImpulseSolver {
    /// Create a solver with the given configuration.
    #[must_use]
    pub fn new(config: PgsConfig) -> Self {
        Self {
            config,
            stats: SolverStats::default(),
            last_report: PgsReport::default(),
        }
    }

    /// Get the solver configuration.
    #[must_use]
    pub fn config(&self) -> &PgsConfig {
        &self.config
    }

    /// Get mutable access to the configuration.
    pub fn config_mut(&mut self) -> &mut PgsConfig {
        &mut self.config
    }

    /// Summary of the most recent call to [`ImpulseSolver::solve`].
    #[must_use]
    pub fn last_report(&self) -> &PgsReport {
        &self.last_report
    }
}

impl ImpulseSolver for PgsImpulseSolver {
    #[allow(clippy::too_many_lines)]
    fn solve(
        &mut self,
        phase: usize,
        participating: &[MultiplierIndex],
        a: &DMatrix<f64>,
        d: &DVector<f64>,
        rhs: &DVector<f64>,
        pi: &mut DVector<f64>,
        partitions: &mut ConstraintPartitions,
    ) -> bool {
        self.stats.phase_mut(phase).solves += 1;

        let m = a.nrows();
        assert_eq!(a.ncols(), m, "constraint matrix must be square");
        assert_eq!(rhs.len(), m, "rhs length must match constraint matrix");
        assert_eq!(pi.len(), m, "pi length must match constraint matrix");
        assert_eq!(d.len(), m, "regularization length must match constraint matrix");
        let p = participating.len();
        assert!(p <= m, "more participating rows than constraint equations");
        debug_assert!(participating.iter().all(|&ix| ix < m));
        debug_assert!(partitions.max_index().map_or(true, |ix| ix < m));
        debug_assert_eq!(
            partitions.equation_count(),
            p,
            "partition equation count must equal participating count"
        );

        self.last_report = PgsReport {
            phase,
            final_sor: self.config.sor,
            ..PgsReport::default()
        };

        if p == 0 {
            trace!(phase, "PGS: nothing to do; converged in 0 iterations");
            return true;
        }

        let mut converged = false;
        let mut sor = self.config.sor;
        let mut sor_reduced = false;
        let mut norm_rms_all = f64::INFINITY;
        let mut norm_rms_enf = f64::INFINITY;
        let mut its = 0;
        let mut row_sums: SmallVec<[f64; 6]> = SmallVec::new();

        while its < self.config.max_iterations {
            its += 1;
            self.stats.phase_mut(phase).iterations += 1;
            let prev_norm_rms_enf = norm_rms_enf;
            let mut sum2all = 0.0;
            let mut sum2enf = 0.0;

            for rt in &partitions.unconditional {
                row_sums_into(participating, &rt.mults, a, pi, &mut row_sums);
                let er2 = update_rows(&rt.mults, a, rhs, sor, &row_sums, pi);
                sum2all += er2;
                sum2enf += er2;
            }

            // Every participating normal before any friction
            for rt in &mut partitions.uni_contact {
                if rt.contact_type != ContactType::Participate {
                    continue;
                }
                let nk = rt.normal;
                let er2 = update_row(nk, a, rhs, sor, row_sum(participating, nk, a, pi), pi);
                sum2all += er2;
                rt.contact_cond = bound_unilateral(rt.sign, &mut pi[nk]);
                if rt.contact_cond == UniCond::Active {
                    sum2enf += er2;
                }
            }

            for rt in &mut partitions.uni_contact {
                if rt.contact_type == ContactType::Observe {
                    continue;
                }
                let Some(fk) = rt.friction else {
                    continue;
                };
                row_sums_into(participating, &fk, a, pi, &mut row_sums);
                let er2 = update_rows(&fk, a, rhs, sor, &row_sums, pi);
                sum2all += er2;
                let n = if rt.contact_type == ContactType::Known {
                    rt.known_pi
                } else {
                    pi[rt.normal]
                }
                .abs();
                rt.friction_cond = bound_vector(rt.eff_mu * n, &fk, pi);
                if rt.friction_cond == FricCond::Rolling {
                    sum2enf += er2;
                }
            }

            for rt in &mut partitions.uni_speed {
                let ix = rt.ix;
                let er2 = update_row(ix, a, rhs, sor, row_sum(participating, ix, a, pi), pi);
                sum2all += er2;
                rt.cond = bound_unilateral(rt.sign, &mut pi[ix]);
                if rt.cond == UniCond::Active {
                    sum2enf += er2;
                }
            }

            for rt in &mut partitions.bounded {
                let ix = rt.ix;
                let er2 = update_row(ix, a, rhs, sor, row_sum(participating, ix, a, pi), pi);
                sum2all += er2;
                rt.cond = bound_scalar(rt.lb, &mut pi[ix], rt.ub);
                if rt.cond == BndCond::Engaged {
                    sum2enf += er2;
                }
            }

            for rt in &mut partitions.state_ltd_friction {
                row_sums_into(participating, &rt.friction, a, pi, &mut row_sums);
                let er2 = update_rows(&rt.friction, a, rhs, sor, &row_sums, pi);
                sum2all += er2;
                rt.friction_cond = bound_vector(rt.eff_mu * rt.known_n, &rt.friction, pi);
                if rt.friction_cond == FricCond::Rolling {
                    sum2enf += er2;
                }
            }

            for rt in &mut partitions.cons_ltd_friction {
                row_sums_into(participating, &rt.friction, a, pi, &mut row_sums);
                let er2 = update_rows(&rt.friction, a, rhs, sor, &row_sums, pi);
                sum2all += er2;
                rt.friction_cond = bound_friction(rt.eff_mu, &rt.normals, &rt.friction, pi);
                if rt.friction_cond == FricCond::Rolling {
                    sum2enf += er2;
                }
            }

            let pf = p as f64;
            norm_rms_all = (sum2all / pf).sqrt();
            norm_rms_enf = (sum2enf / pf).sqrt();

            // First sweep compares against infinity, giving a rate of zero
            let rate = norm_rms_enf / prev_norm_rms_enf;
            if rate > 1.0 {
                if sor > self.config.min_sor {
                    sor = (self.config.sor_reduction * sor).max(self.config.min_sor);
                    debug!(phase, iteration = its, sor, rate, "PGS: residual grew; reducing SOR");
                }
                sor_reduced = true;
            }

            debug!(
                phase,
                iteration = its,
                rms_all = norm_rms_all,
                rms_enf = norm_rms_enf,
                rate,
                "PGS sweep"
            );

            if norm_rms_enf < self.config.convergence_tol {
                converged = true;
                break;
            }
        }

        if converged {
            debug!(phase, iterations = its, rms_enf = norm_rms_enf, "PGS converged");
        } else {
            self.stats.phase_mut(phase).failures += 1;
            warn!(
                phase,
                iterations = its,
                rms_enf = norm_rms_enf,
                "PGS convergence failure"
            );
        }

        self.last_report = PgsReport {
            phase,
            iterations: its,
            rms_all: norm_rms_all,
            rms_enforced: norm_rms_enf,
            final_sor: sor,
            sor_reduced,
            converged,
        };
        converged
    }

    fn stats(&self) -> &SolverStats {
        &self.stats
    }

    fn clear_stats(&mut self) {
        self.stats.clear();
    }

    fn max_iterations(&self) -> usize {
        self.config.max_iterations
    }

    fn set_max_iterations(&mut self, max_iterations: usize) {
        self.config.max_iterations = max_iterations;
    }

    fn convergence_tol(&self) -> f64 {
        self.config.convergence_tol
    }

    fn set_convergence_tol(&mut self, tol: f64) {
        self.config.convergence_tol = tol;
    }

    fn validate(&self) -> Result<()> {
        self.config.validate()
    }
}

/// `A[row, I]·π[I]` over the participating columns.
fn row_sum(
    columns: &[MultiplierIndex],
    row: MultiplierIndex,
    a: &DMatrix<f64>,
    pi: &DVector<f64>,
) -> f64 {
    columns.iter().map(|&c| a[(row, c)] * pi[c]).sum()
}

/// Row sums for a whole group, evaluated before any row of it moves.
fn row_sums_into(
    columns: &[MultiplierIndex],
    rows: &[MultiplierIndex],
    a: &DMatrix<f64>,
    pi: &DVector<f64>,
    sums: &mut SmallVec<[f64; 6]>,
) {
    sums.clear();
    sums.extend(rows.iter().map(|&r| row_sum(columns, r, a, pi)));
}

/// Relax one row; returns its squared residual.
#[inline]
fn update_row(
    row: MultiplierIndex,
    a: &DMatrix<f64>,
    rhs: &DVector<f64>,
    sor: f64,
    row_sum: f64,
    pi: &mut DVector<f64>,
) -> f64 {
    let arr = a[(row, row)];
    let er = rhs[row] - row_sum;
    if arr > 0.0 {
        pi[row] += sor * er / arr;
    }
    er * er
}

/// Relax a group of rows from precomputed sums; returns the summed squared residual.
fn update_rows(
    rows: &[MultiplierIndex],
    a: &DMatrix<f64>,
    rhs: &DVector<f64>,
    sor: f64,
    row_sums: &[f64],
    pi: &mut DVector<f64>,
) -> f64 {
    rows.iter()
        .zip(row_sums)
        .map(|(&row, &sum)| update_row(row, a, rhs, sor, sum, pi))
        .sum()
}

/// Enforce `sign·π ≤ 0`.
#[inline]
fn bound_unilateral(sign: f64, pi: &mut f64) -> UniCond {
    debug_assert!(sign == 1.0 || sign == -1.0);
    if sign * *pi > 0.0 {
        *pi = 0.0;
        return UniCond::Off;
    }
    UniCond::Active
}

/// Enforce `lb ≤ π ≤ ub` by moving to the nearest bound.
#[inline]
fn bound_scalar(lb: f64, pi: &mut f64, ub: f64) -> BndCond {
    debug_assert!(lb <= ub);
    if *pi > ub {
        *pi = ub;
        BndCond::SlipHigh
    } else if *pi < lb {
        *pi = lb;
        BndCond::SlipLow
    } else {
        BndCond::Engaged
    }
}

/// Enforce `‖π[iv]‖ ≤ max_len` by uniform scaling.
fn bound_vector(max_len: f64, iv: &[MultiplierIndex], pi: &mut DVector<f64>) -> FricCond {
    debug_assert!(max_len >= 0.0);
    let max_len2 = max_len * max_len;
    let norm2: f64 = iv.iter().map(|&i| pi[i] * pi[i]).sum();
    if norm2 <= max_len2 {
        return FricCond::Rolling;
    }
    let scale = (max_len2 / norm2).sqrt();
    for &i in iv {
        pi[i] *= scale;
    }
    FricCond::Sliding
}

/// Enforce `‖π[i_f]‖ ≤ μ‖π[i_n]‖` by scaling the friction components.
fn bound_friction(
    mu: f64,
    i_n: &[MultiplierIndex],
    i_f: &[MultiplierIndex],
    pi: &mut DVector<f64>,
) -> FricCond {
    debug_assert!(mu >= 0.0);
    let n2: f64 = i_n.iter().map(|&i| pi[i] * pi[i]).sum();
    let f2: f64 = i_f.iter().map(|&i| pi[i] * pi[i]).sum();
    let mu2n2 = mu * mu * n2;
    if f2 <= mu2n2 {
        return FricCond::Rolling;
    }
    let scale = (mu2n2 / f2).sqrt();
    for &i in i_f {
        pi[i] *= scale;
    }
    FricCond::Sliding
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::float_cmp)]
mod tests {
    use super::*;
    use crate::impulse::{
        BoundedRt, ConstraintLtdFrictionRt, StateLtdFrictionRt, UncondRt, UniContactRt,
        UniSpeedRt,
    };
    use approx::assert_relative_eq;

    fn singles(n: usize) -> ConstraintPartitions {
        let mut parts = ConstraintPartitions::new();
        for i in 0..n {
            parts.unconditional.push(UncondRt::new(&[i]));
        }
        parts
    }

    fn solve(
        solver: &mut PgsImpulseSolver,
        participating: &[usize],
        a: &DMatrix<f64>,
        rhs: &DVector<f64>,
        pi: &mut DVector<f64>,
        parts: &mut ConstraintPartitions,
    ) -> bool {
        let d = DVector::zeros(a.nrows());
        solver.solve(0, participating, a, &d, rhs, pi, parts)
    }

    #[test]
    fn test_config_presets_validate() {
        assert!(PgsConfig::default().validate().is_ok());
        assert!(PgsConfig::high_accuracy().validate().is_ok());
        assert!(PgsConfig::realtime().validate().is_ok());

        assert!(PgsConfig::default().with_sor(2.5).validate().is_err());
        assert!(PgsConfig::default().with_max_iterations(0).validate().is_err());
        assert!(PgsConfig::default()
            .with_convergence_tol(0.0)
            .validate()
            .unwrap_err()
            .is_config_error());
    }

    #[test]
    fn test_empty_participating_is_trivial() {
        let mut solver = PgsImpulseSolver::default();
        let a = DMatrix::identity(2, 2);
        let rhs = DVector::from_vec(vec![1.0, 2.0]);
        let mut pi = DVector::from_vec(vec![7.0, -3.0]);
        let mut parts = ConstraintPartitions::new();

        assert!(solve(&mut solver, &[], &a, &rhs, &mut pi, &mut parts));
        assert_eq!(pi, DVector::from_vec(vec![7.0, -3.0]));
        assert_eq!(solver.stats().solves(0), 1);
        assert_eq!(solver.stats().iterations(0), 0);
        assert_eq!(solver.last_report().iterations, 0);
    }

    #[test]
    fn test_unconditional_matches_direct_solve() {
        let a = DMatrix::from_row_slice(3, 3, &[4.0, 1.0, 0.0, 1.0, 3.0, 1.0, 0.0, 1.0, 2.0]);
        let rhs = DVector::from_vec(vec![1.0, 2.0, 3.0]);
        let direct = a.clone().cholesky().unwrap().solve(&rhs);

        let mut solver = PgsImpulseSolver::new(
            PgsConfig::default()
                .with_convergence_tol(1e-11)
                .with_max_iterations(500),
        );
        let mut pi = DVector::zeros(3);
        let mut parts = singles(3);

        assert!(solve(&mut solver, &[0, 1, 2], &a, &rhs, &mut pi, &mut parts));
        assert_relative_eq!(pi, direct, epsilon = 1e-8);
        assert!((&a * &pi - &rhs).norm() < 1e-8);
        assert!(solver.last_report().rms_enforced < 1e-11);
        assert_eq!(solver.stats().failures(0), 0);
    }

    #[test]
    fn test_unconditional_group_block() {
        // Diagonally dominant so the in-group Jacobi block converges
        let a = DMatrix::from_row_slice(3, 3, &[5.0, 1.0, 1.0, 1.0, 4.0, 1.0, 1.0, 1.0, 3.0]);
        let rhs = DVector::from_vec(vec![1.0, -1.0, 2.0]);
        let direct = a.clone().lu().solve(&rhs).unwrap();

        let mut solver = PgsImpulseSolver::new(PgsConfig::high_accuracy());
        let mut pi = DVector::zeros(3);
        let mut parts = ConstraintPartitions::new();
        parts.unconditional.push(UncondRt::new(&[0, 1, 2]));

        assert!(solve(&mut solver, &[0, 1, 2], &a, &rhs, &mut pi, &mut parts));
        assert_relative_eq!(pi, direct, epsilon = 1e-9);
    }

    #[test]
    fn test_unilateral_contact_active_and_off() {
        let a = DMatrix::from_element(1, 1, 2.0);
        let mut solver = PgsImpulseSolver::default();

        // Unconstrained solution 2 satisfies -1·2 ≤ 0
        let rhs = DVector::from_element(1, 4.0);
        let mut pi = DVector::zeros(1);
        let mut parts = ConstraintPartitions::new();
        parts.uni_contact.push(UniContactRt::new(0, -1.0));
        assert!(solve(&mut solver, &[0], &a, &rhs, &mut pi, &mut parts));
        assert_relative_eq!(pi[0], 2.0, epsilon = 1e-12);
        assert_eq!(parts.uni_contact[0].contact_cond, UniCond::Active);

        // Unconstrained solution -2 violates it: clamp to zero
        let rhs = DVector::from_element(1, -4.0);
        let mut pi = DVector::zeros(1);
        assert!(solve(&mut solver, &[0], &a, &rhs, &mut pi, &mut parts));
        assert_eq!(pi[0], 0.0);
        assert_eq!(parts.uni_contact[0].contact_cond, UniCond::Off);
    }

    #[test]
    fn test_bounded_scalar_conditions() {
        let a = DMatrix::identity(1, 1);
        let mut solver = PgsImpulseSolver::default();

        for (target, expected, cond) in [
            (5.0, 1.0, BndCond::SlipHigh),
            (-5.0, -1.0, BndCond::SlipLow),
            (0.3, 0.3, BndCond::Engaged),
        ] {
            let rhs = DVector::from_element(1, target);
            let mut pi = DVector::zeros(1);
            let mut parts = ConstraintPartitions::new();
            parts.bounded.push(BoundedRt::new(0, -1.0, 1.0));

            assert!(solve(&mut solver, &[0], &a, &rhs, &mut pi, &mut parts));
            assert_relative_eq!(pi[0], expected, epsilon = 1e-12);
            assert_eq!(parts.bounded[0].cond, cond);
        }
    }

    #[test]
    fn test_vector_bound_scales_to_limit() {
        let a = DMatrix::identity(2, 2);
        let mut solver = PgsImpulseSolver::default();

        // Unconstrained magnitude 10, limit 2
        let rhs = DVector::from_vec(vec![6.0, 8.0]);
        let mut pi = DVector::zeros(2);
        let mut parts = ConstraintPartitions::new();
        parts
            .state_ltd_friction
            .push(StateLtdFrictionRt::new(&[0, 1], 2.0, 1.0));

        assert!(solve(&mut solver, &[0, 1], &a, &rhs, &mut pi, &mut parts));
        assert_relative_eq!(pi.norm(), 2.0, epsilon = 1e-12);
        assert_relative_eq!(pi[0], 1.2, epsilon = 1e-12);
        assert_relative_eq!(pi[1], 1.6, epsilon = 1e-12);
        assert_eq!(parts.state_ltd_friction[0].friction_cond, FricCond::Sliding);

        // Inside the limit: unchanged
        let rhs = DVector::from_vec(vec![0.6, 0.8]);
        let mut pi = DVector::zeros(2);
        assert!(solve(&mut solver, &[0, 1], &a, &rhs, &mut pi, &mut parts));
        assert_relative_eq!(pi[0], 0.6, epsilon = 1e-12);
        assert_relative_eq!(pi[1], 0.8, epsilon = 1e-12);
        assert_eq!(parts.state_ltd_friction[0].friction_cond, FricCond::Rolling);
    }

    #[test]
    fn test_contact_friction_uses_updated_normal() {
        let a = DMatrix::identity(3, 3);
        let rhs = DVector::from_vec(vec![2.0, 3.0, 4.0]);
        let mut pi = DVector::zeros(3);
        let mut parts = ConstraintPartitions::new();
        parts
            .uni_contact
            .push(UniContactRt::new(0, -1.0).with_friction([1, 2], 0.5));

        let mut solver = PgsImpulseSolver::default();
        assert!(solve(&mut solver, &[0, 1, 2], &a, &rhs, &mut pi, &mut parts));

        // Limit 0.5·2 = 1 applied to (3, 4)
        assert_relative_eq!(pi[0], 2.0, epsilon = 1e-12);
        assert_relative_eq!(pi[1], 0.6, epsilon = 1e-12);
        assert_relative_eq!(pi[2], 0.8, epsilon = 1e-12);
        assert_eq!(parts.uni_contact[0].contact_cond, UniCond::Active);
        assert_eq!(parts.uni_contact[0].friction_cond, FricCond::Sliding);
    }

    #[test]
    fn test_known_normal_limits_friction() {
        let a = DMatrix::identity(3, 3);
        let rhs = DVector::from_vec(vec![100.0, 3.0, 4.0]);
        let mut pi = DVector::from_vec(vec![9.0, 0.0, 0.0]);
        let mut parts = ConstraintPartitions::new();
        parts
            .uni_contact
            .push(UniContactRt::new(0, -1.0).with_friction([1, 2], 0.5).known(-2.0));

        let mut solver = PgsImpulseSolver::default();
        assert!(solve(&mut solver, &[1, 2], &a, &rhs, &mut pi, &mut parts));

        // Normal is not solved; the known magnitude 2 sets the limit
        assert_eq!(pi[0], 9.0);
        assert_relative_eq!(pi[1], 0.6, epsilon = 1e-12);
        assert_relative_eq!(pi[2], 0.8, epsilon = 1e-12);
    }

    #[test]
    fn test_observed_contact_is_skipped() {
        let a = DMatrix::identity(4, 4);
        let rhs = DVector::from_vec(vec![1.0, 5.0, 5.0, 2.0]);
        let mut pi = DVector::zeros(4);
        let mut parts = ConstraintPartitions::new();
        parts
            .uni_contact
            .push(UniContactRt::new(0, -1.0).with_friction([1, 2], 0.5).observed());
        parts.unconditional.push(UncondRt::new(&[3]));

        let mut solver = PgsImpulseSolver::default();
        assert!(solve(&mut solver, &[3], &a, &rhs, &mut pi, &mut parts));
        assert_eq!(pi[0], 0.0);
        assert_eq!(pi[1], 0.0);
        assert_relative_eq!(pi[3], 2.0, epsilon = 1e-12);
        assert_eq!(parts.uni_contact[0].contact_cond, UniCond::Unknown);
    }

    #[test]
    fn test_constraint_limited_friction() {
        let a = DMatrix::identity(3, 3);
        let rhs = DVector::from_vec(vec![2.0, 3.0, 4.0]);
        let mut pi = DVector::zeros(3);
        let mut parts = ConstraintPartitions::new();
        parts.unconditional.push(UncondRt::new(&[0]));
        parts
            .cons_ltd_friction
            .push(ConstraintLtdFrictionRt::new(&[1, 2], &[0], 0.5));

        let mut solver = PgsImpulseSolver::default();
        assert!(solve(&mut solver, &[0, 1, 2], &a, &rhs, &mut pi, &mut parts));
        assert_relative_eq!(pi[1], 0.6, epsilon = 1e-12);
        assert_relative_eq!(pi[2], 0.8, epsilon = 1e-12);
        assert_eq!(parts.cons_ltd_friction[0].friction_cond, FricCond::Sliding);
    }

    #[test]
    fn test_uni_speed_constraint() {
        let a = DMatrix::identity(1, 1);
        let rhs = DVector::from_element(1, 3.0);
        let mut pi = DVector::zeros(1);
        let mut parts = ConstraintPartitions::new();
        parts.uni_speed.push(UniSpeedRt::new(0, 1.0));

        let mut solver = PgsImpulseSolver::default();
        assert!(solve(&mut solver, &[0], &a, &rhs, &mut pi, &mut parts));
        assert_eq!(pi[0], 0.0);
        assert_eq!(parts.uni_speed[0].cond, UniCond::Off);
    }

    #[test]
    fn test_non_participating_columns_are_ignored() {
        let a = DMatrix::from_row_slice(2, 2, &[1.0, 0.5, 0.5, 1.0]);
        let rhs = DVector::from_vec(vec![0.0, 1.0]);
        let mut pi = DVector::from_vec(vec![10.0, 0.0]);
        let mut parts = ConstraintPartitions::new();
        parts.unconditional.push(UncondRt::new(&[1]));

        let mut solver = PgsImpulseSolver::default();
        assert!(solve(&mut solver, &[1], &a, &rhs, &mut pi, &mut parts));
        assert_eq!(pi[0], 10.0);
        assert_relative_eq!(pi[1], 1.0, epsilon = 1e-12);
    }

    #[test]
    fn test_degenerate_row_is_skipped() {
        let a = DMatrix::zeros(1, 1);
        let rhs = DVector::zeros(1);
        let mut pi = DVector::from_element(1, 3.0);
        let mut parts = singles(1);

        let mut solver = PgsImpulseSolver::default();
        assert!(solve(&mut solver, &[0], &a, &rhs, &mut pi, &mut parts));
        assert_eq!(pi[0], 3.0);
    }

    #[test]
    fn test_resolve_from_converged_guess_takes_one_iteration() {
        let a = DMatrix::from_row_slice(3, 3, &[4.0, 1.0, 0.0, 1.0, 3.0, 1.0, 0.0, 1.0, 2.0]);
        let rhs = DVector::from_vec(vec![1.0, 2.0, 3.0]);
        let mut pi = DVector::zeros(3);
        let mut parts = singles(3);
        parts.unconditional.truncate(2);
        parts.bounded.push(BoundedRt::new(2, -10.0, 10.0));

        let mut solver = PgsImpulseSolver::default();
        assert!(solve(&mut solver, &[0, 1, 2], &a, &rhs, &mut pi, &mut parts));
        let first = solver.stats().iterations(0);

        assert!(solve(&mut solver, &[0, 1, 2], &a, &rhs, &mut pi, &mut parts));
        assert!(solver.stats().iterations(0) - first <= 1);
        assert_eq!(solver.last_report().iterations, 1);
    }

    #[test]
    fn test_iteration_cap_reports_failure() {
        // Inconsistent singular system: no multiplier can satisfy both rows
        let a = DMatrix::from_row_slice(2, 2, &[1.0, 1.0, 1.0, 1.0]);
        let rhs = DVector::from_vec(vec![1.0, -1.0]);
        let mut pi = DVector::zeros(2);
        let mut parts = singles(2);

        let mut solver = PgsImpulseSolver::new(PgsConfig::default().with_max_iterations(25));
        assert!(!solve(&mut solver, &[0, 1], &a, &rhs, &mut pi, &mut parts));
        assert_eq!(solver.stats().iterations(0), 25);
        assert_eq!(solver.stats().failures(0), 1);
        assert_eq!(solver.last_report().iterations, 25);
        assert!(!solver.last_report().converged);
        assert!(pi.iter().all(|v| v.is_finite()));
    }

    #[test]
    fn test_contact_conflicting_with_equality_hits_cap() {
        // The equality wants π₀ + π₁ = -1 while the contact wants +1
        let a = DMatrix::from_row_slice(2, 2, &[1.0, 1.0, 1.0, 1.0]);
        let rhs = DVector::from_vec(vec![1.0, -1.0]);
        let mut pi = DVector::zeros(2);
        let mut parts = ConstraintPartitions::new();
        parts.uni_contact.push(UniContactRt::new(0, -1.0));
        parts.unconditional.push(UncondRt::new(&[1]));

        let mut solver = PgsImpulseSolver::new(PgsConfig::default().with_max_iterations(25));
        assert!(!solve(&mut solver, &[0, 1], &a, &rhs, &mut pi, &mut parts));
        assert_eq!(solver.last_report().iterations, solver.config().max_iterations);
        assert!(!solver.last_report().converged);
        assert_eq!(solver.stats().iterations(0), 25);
        assert_eq!(solver.stats().failures(0), 1);
        assert_eq!(parts.uni_contact[0].contact_cond, UniCond::Active);
        assert!(pi[0] > 0.0);
    }

    #[test]
    fn test_known_contact_without_friction_is_skipped() {
        let a = DMatrix::identity(2, 2);
        let rhs = DVector::from_vec(vec![4.0, 2.0]);
        let mut pi = DVector::from_vec(vec![7.0, 0.0]);
        let mut parts = ConstraintPartitions::new();
        parts.uni_contact.push(UniContactRt::new(0, -1.0).known(-3.0));
        parts.unconditional.push(UncondRt::new(&[1]));
        assert_eq!(parts.equation_count(), 1);

        let mut solver = PgsImpulseSolver::default();
        assert!(solve(&mut solver, &[1], &a, &rhs, &mut pi, &mut parts));
        assert_eq!(pi[0], 7.0);
        assert_relative_eq!(pi[1], 2.0, epsilon = 1e-12);
        assert_eq!(parts.uni_contact[0].contact_cond, UniCond::Unknown);
        assert_eq!(parts.uni_contact[0].friction_cond, FricCond::Unknown);
    }

    #[test]
    fn test_active_uni_speed_acts_as_equality() {
        let a = DMatrix::from_row_slice(2, 2, &[2.0, 1.0, 1.0, 2.0]);
        let rhs = DVector::from_vec(vec![3.0, 3.0]);
        let mut pi = DVector::zeros(2);
        let mut parts = ConstraintPartitions::new();
        parts.uni_speed.push(UniSpeedRt::new(0, -1.0));
        parts.unconditional.push(UncondRt::new(&[1]));

        let mut solver = PgsImpulseSolver::default();
        assert!(solve(&mut solver, &[0, 1], &a, &rhs, &mut pi, &mut parts));
        assert_eq!(parts.uni_speed[0].cond, UniCond::Active);
        assert_relative_eq!(pi[0], 1.0, epsilon = 1e-5);
        assert_relative_eq!(pi[1], 1.0, epsilon = 1e-5);
        assert_relative_eq!((&a * &pi)[0], rhs[0], epsilon = 1e-5);
    }

    #[test]
    fn test_growing_residual_reduces_sor() {
        let a = DMatrix::from_row_slice(2, 2, &[1.0, 1.0, 1.0, 1.0]);
        let rhs = DVector::from_vec(vec![1.0, -1.0]);
        let mut pi = DVector::zeros(2);
        let mut parts = singles(2);

        let mut solver = PgsImpulseSolver::new(PgsConfig::default().with_max_iterations(200));
        assert!(!solve(&mut solver, &[0, 1], &a, &rhs, &mut pi, &mut parts));
        let report = solver.last_report();
        assert!(report.sor_reduced);
        assert!(report.final_sor < 1.0);
        assert!(report.final_sor >= 0.1);
    }

    #[test]
    fn test_counters_are_per_phase() {
        let a = DMatrix::identity(1, 1);
        let d = DVector::zeros(1);
        let rhs = DVector::from_element(1, 1.0);
        let mut parts = singles(1);
        let mut solver = PgsImpulseSolver::default();

        let mut pi = DVector::zeros(1);
        assert!(solver.solve(0, &[0], &a, &d, &rhs, &mut pi, &mut parts));
        let mut pi = DVector::zeros(1);
        assert!(solver.solve(2, &[0], &a, &d, &rhs, &mut pi, &mut parts));
        assert!(solver.solve(2, &[0], &a, &d, &rhs, &mut pi, &mut parts));

        assert_eq!(solver.stats().solves(0), 1);
        assert_eq!(solver.stats().solves(1), 0);
        assert_eq!(solver.stats().solves(2), 2);

        solver.clear_stats();
        assert_eq!(solver.stats().solves(2), 0);
    }

    #[test]
    #[should_panic(expected = "rhs length")]
    fn test_dimension_mismatch_panics() {
        let a = DMatrix::identity(2, 2);
        let d = DVector::zeros(2);
        let rhs = DVector::zeros(3);
        let mut pi = DVector::zeros(2);
        let mut parts = singles(2);
        let mut solver = PgsImpulseSolver::default();
        let _ = solver.solve(0, &[0, 1], &a, &d, &rhs, &mut pi, &mut parts);
    }
}
