//! Realization stages.
//!
//! Every state-dependent quantity in the multibody tree belongs to exactly one
//! stage. A stage may only be computed once every earlier stage is available,
//! and a cache entry of stage `S` may only be read after `S` was realized for
//! the owning node and all of its ancestors.

use std::fmt;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// Computation stages, in the order they must be realized.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum Stage {
    /// Topology and allocation are fixed; nothing state-dependent is known.
    #[default]
    Topology,
    /// Positions: transforms, shift operators, spatial inertias.
    Configuration,
    /// Velocities: spatial velocities in ground and across joints.
    Motion,
    /// Velocity-dependent forces and articulated-body inertias.
    Dynamics,
    /// Applied-force response: accelerations and recursion residuals.
    Reaction,
}

impl Stage {
    /// All stages in realization order.
    pub const ALL: [Self; 5] = [
        Self::Topology,
        Self::Configuration,
        Self::Motion,
        Self::Dynamics,
        Self::Reaction,
    ];

    /// Human-readable name.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Topology => "Topology",
            Self::Configuration => "Configuration",
            Self::Motion => "Motion",
            Self::Dynamics => "Dynamics",
            Self::Reaction => "Reaction",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}
