//! Body identity and mass properties.

use nalgebra::{Matrix3, Vector3};

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// Stable index of a body node in a multibody tree.
///
/// Node 0 is always ground. Indices are assigned in insertion order and never
/// reused, so a `NodeId` also addresses every per-node cache slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct NodeId(pub usize);

impl NodeId {
    /// The ground node.
    pub const GROUND: Self = Self(0);

    /// Create a new node ID.
    #[must_use]
    pub const fn new(id: usize) -> Self {
        Self(id)
    }

    /// Get the raw index.
    #[must_use]
    pub const fn index(self) -> usize {
        self.0
    }

    /// Whether this is the ground node.
    #[must_use]
    pub const fn is_ground(self) -> bool {
        self.0 == 0
    }
}

impl From<usize> for NodeId {
    fn from(id: usize) -> Self {
        Self(id)
    }
}

impl std::fmt::Display for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Node({})", self.0)
    }
}

/// Mass properties of a rigid body.
///
/// All quantities are expressed in the body frame B. The inertia is taken
/// about the center of mass; use [`MassProperties::inertia_about_origin`] for
/// the inertia about the body origin.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct MassProperties {
    /// Total mass in kg.
    pub mass: f64,
    /// Center of mass offset from body origin in local coordinates.
    pub center_of_mass: Vector3<f64>,
    /// Inertia tensor about center of mass in local coordinates (kg·m²).
    pub inertia: Matrix3<f64>,
}

impl Default for MassProperties {
    fn default() -> Self {
        Self::point_mass(0.0)
    }
}

impl MassProperties {
    /// Create mass properties with given values.
    ///
    /// # Arguments
    ///
    /// * `mass` - Total mass (must be non-negative)
    /// * `center_of_mass` - COM offset from body origin
    /// * `inertia` - Inertia tensor about COM
    #[must_use]
    pub const fn new(mass: f64, center_of_mass: Vector3<f64>, inertia: Matrix3<f64>) -> Self {
        Self {
            mass,
            center_of_mass,
            inertia,
        }
    }

    /// Create mass properties for a point mass at the origin.
    #[must_use]
    pub fn point_mass(mass: f64) -> Self {
        Self {
            mass,
            center_of_mass: Vector3::zeros(),
            inertia: Matrix3::zeros(),
        }
    }

    /// Create mass properties for a uniform sphere.
    ///
    /// Inertia of a solid sphere: I = (2/5) * m * r²
    #[must_use]
    pub fn sphere(mass: f64, radius: f64) -> Self {
        let i = 0.4 * mass * radius * radius;
        Self {
            mass,
            center_of_mass: Vector3::zeros(),
            inertia: Matrix3::from_diagonal(&Vector3::new(i, i, i)),
        }
    }

    /// Create mass properties for a uniform box.
    ///
    /// Inertia of a solid box with dimensions (x, y, z):
    /// - Ixx = (1/12) * m * (y² + z²)
    /// - Iyy = (1/12) * m * (x² + z²)
    /// - Izz = (1/12) * m * (x² + y²)
    #[must_use]
    pub fn box_shape(mass: f64, half_extents: Vector3<f64>) -> Self {
        let x2 = 4.0 * half_extents.x * half_extents.x;
        let y2 = 4.0 * half_extents.y * half_extents.y;
        let z2 = 4.0 * half_extents.z * half_extents.z;

        Self {
            mass,
            center_of_mass: Vector3::zeros(),
            inertia: Matrix3::from_diagonal(&Vector3::new(
                mass * (y2 + z2) / 12.0,
                mass * (x2 + z2) / 12.0,
                mass * (x2 + y2) / 12.0,
            )),
        }
    }

    /// Create mass properties for a uniform cylinder (aligned with Z axis).
    ///
    /// - Ixx = Iyy = (1/12) * m * (3r² + h²)
    /// - Izz = (1/2) * m * r²
    #[must_use]
    pub fn cylinder(mass: f64, radius: f64, half_height: f64) -> Self {
        let r2 = radius * radius;
        let h2 = 4.0 * half_height * half_height;
        let ixx = mass * (3.0 * r2 + h2) / 12.0;

        Self {
            mass,
            center_of_mass: Vector3::zeros(),
            inertia: Matrix3::from_diagonal(&Vector3::new(ixx, ixx, 0.5 * mass * r2)),
        }
    }

    /// Move the center of mass, keeping the inertia about the COM unchanged.
    #[must_use]
    pub fn with_center_of_mass(mut self, center_of_mass: Vector3<f64>) -> Self {
        self.center_of_mass = center_of_mass;
        self
    }

    /// Inertia about the body origin, in the body frame.
    ///
    /// Parallel-axis shift: `I_O = I_C + m (|c|² E - c cᵀ)`.
    #[must_use]
    pub fn inertia_about_origin(&self) -> Matrix3<f64> {
        let c = self.center_of_mass;
        self.inertia + (Matrix3::identity() * c.norm_squared() - c * c.transpose()) * self.mass
    }

    /// Get the inverse mass (0 if the mass is zero or infinite).
    #[must_use]
    pub fn inverse_mass(&self) -> f64 {
        if self.mass <= 0.0 || self.mass.is_infinite() {
            0.0
        } else {
            1.0 / self.mass
        }
    }

    /// Validate that the mass properties are physically valid.
    ///
    /// Ground-attached massless bodies are allowed; infinite mass is not,
    /// since the articulated-body recursion cannot propagate it.
    pub fn validate(&self) -> crate::Result<()> {
        if !self.mass.is_finite() {
            return Err(crate::SimError::invalid_mass("mass must be finite"));
        }

        if self.mass < 0.0 {
            return Err(crate::SimError::invalid_mass("mass cannot be negative"));
        }

        if !self.center_of_mass.iter().all(|x| x.is_finite()) {
            return Err(crate::SimError::invalid_mass(
                "center of mass must be finite",
            ));
        }

        if !self.inertia.iter().all(|x| x.is_finite()) {
            return Err(crate::SimError::invalid_mass("inertia must be finite"));
        }

        // Physical inertia is symmetric positive semi-definite
        if (self.inertia - self.inertia.transpose()).amax() > 1e-10 {
            return Err(crate::SimError::invalid_mass(
                "inertia tensor must be symmetric",
            ));
        }
        let eigenvalues = self.inertia.symmetric_eigenvalues();
        if eigenvalues.iter().any(|&e| e < -1e-10) {
            return Err(crate::SimError::invalid_mass(
                "inertia tensor must be positive semi-definite",
            ));
        }

        Ok(())
    }
}
