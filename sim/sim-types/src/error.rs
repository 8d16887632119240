//! Error types for multibody operations.

use crate::body::NodeId;
use crate::stage::Stage;
use thiserror::Error;

/// Errors that can occur while building or evaluating a multibody system.
///
/// Numerical non-convergence of an impulse solve is deliberately absent: it is
/// reported as a boolean outcome by the solver, not as an error.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum SimError {
    /// Invalid node ID referenced.
    #[error("invalid node ID: {0}")]
    InvalidNodeId(NodeId),

    /// Tree topology is malformed.
    #[error("invalid topology: {reason}")]
    InvalidTopology {
        /// Description of the topology error.
        reason: String,
    },

    /// Invalid timestep.
    #[error("invalid timestep: {0} (must be positive and finite)")]
    InvalidTimestep(f64),

    /// Invalid configuration.
    #[error("invalid configuration: {reason}")]
    InvalidConfig {
        /// Description of the configuration error.
        reason: String,
    },

    /// Invalid mass properties.
    #[error("invalid mass properties: {reason}")]
    InvalidMassProperties {
        /// Description of what's wrong.
        reason: String,
    },

    /// A cache entry was requested before its stage was realized.
    #[error("{node} needs stage {required} but has only realized {actual}")]
    StageNotRealized {
        /// The node whose cache was not ready.
        node: NodeId,
        /// The stage that had to be realized first.
        required: Stage,
        /// The stage the node had actually reached.
        actual: Stage,
    },

    /// The joint type does not implement the requested capability.
    #[error("operation `{operation}` is not implemented for {joint} joints")]
    Unsupported {
        /// Name of the joint type.
        joint: &'static str,
        /// Name of the missing operation.
        operation: &'static str,
    },

    /// The articulated-body inertia projected onto a joint is singular.
    #[error("articulated-body inertia of {node} is singular across its joint")]
    SingularArticulatedInertia {
        /// The offending node.
        node: NodeId,
    },

    /// A vector or matrix had the wrong size.
    #[error("dimension mismatch in {what}: expected {expected}, got {actual}")]
    DimensionMismatch {
        /// Which quantity was mis-sized.
        what: &'static str,
        /// Expected length.
        expected: usize,
        /// Actual length.
        actual: usize,
    },

    /// Simulation diverged (`NaN` or `Inf` detected).
    #[error("simulation diverged: {reason}")]
    Diverged {
        /// Description of what went wrong.
        reason: String,
    },
}

impl SimError {
    /// Create a diverged error.
    #[must_use]
    pub fn diverged(reason: impl Into<String>) -> Self {
        Self::Diverged {
            reason: reason.into(),
        }
    }

    /// Create an invalid configuration error.
    #[must_use]
    pub fn invalid_config(reason: impl Into<String>) -> Self {
        Self::InvalidConfig {
            reason: reason.into(),
        }
    }

    /// Create an invalid mass properties error.
    #[must_use]
    pub fn invalid_mass(reason: impl Into<String>) -> Self {
        Self::InvalidMassProperties {
            reason: reason.into(),
        }
    }

    /// Create an invalid topology error.
    #[must_use]
    pub fn invalid_topology(reason: impl Into<String>) -> Self {
        Self::InvalidTopology {
            reason: reason.into(),
        }
    }

    /// Create an unsupported-capability error.
    #[must_use]
    pub const fn unsupported(joint: &'static str, operation: &'static str) -> Self {
        Self::Unsupported { joint, operation }
    }

    /// Check if this is a divergence error.
    #[must_use]
    pub fn is_diverged(&self) -> bool {
        matches!(self, Self::Diverged { .. })
    }

    /// Check if this is a configuration error.
    #[must_use]
    pub fn is_config_error(&self) -> bool {
        matches!(self, Self::InvalidConfig { .. })
    }

    /// Check if a joint type was asked for a capability it lacks.
    #[must_use]
    pub fn is_unsupported(&self) -> bool {
        matches!(self, Self::Unsupported { .. })
    }

    /// Check if a stage was read before it was realized.
    #[must_use]
    pub fn is_stage_violation(&self) -> bool {
        matches!(self, Self::StageNotRealized { .. })
    }
}
