//! Scan raster geometry.
//!
//! The acquisition raster is described by which physical axis moves fastest,
//! the sweep direction of each spatial axis, the step counts per axis, and
//! whether alternate fast-axis sweeps run in opposite directions. The
//! strongly-typed parameters replace the loosely-typed dictionaries the
//! acquisition layer passes around, and are validated at construction time.

use serde::{Deserialize, Serialize};

use crate::error::AssemblyError;

/// Physical scan axis. `LeftRight` maps to image columns, `UpDown` to image
/// rows, `BackFront` to volume slices; `Time` is always the slowest axis.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ScanAxis {
    LeftRight,
    UpDown,
    BackFront,
    Time,
}

/// Sweep direction of a spatial axis.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ScanDirection {
    Positive,
    Negative,
}

/// Full description of the acquisition raster.
///
/// `dimensions` lists the axes from fastest to slowest; the first three are
/// the spatial axes in their physical acquisition order and the last must be
/// [`ScanAxis::Time`]. `steps` and `step_sizes` are indexed the same way.
/// `directions` is indexed by axis identity: `[LeftRight, UpDown, BackFront]`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScanParameters {
    pub dimensions: [ScanAxis; 4],
    pub directions: [ScanDirection; 3],
    pub steps: [u32; 4],
    pub step_sizes: [f64; 4],
    pub unidirectional: bool,
}

impl ScanParameters {
    pub fn new(
        dimensions: [ScanAxis; 4],
        directions: [ScanDirection; 3],
        steps: [u32; 4],
        step_sizes: [f64; 4],
        unidirectional: bool,
    ) -> Result<Self, AssemblyError> {
        let params = Self {
            dimensions,
            directions,
            steps,
            step_sizes,
            unidirectional,
        };
        params.validate()?;
        Ok(params)
    }

    /// Check the axis permutation and step counts.
    ///
    /// Deserialized parameters can bypass [`ScanParameters::new`], so
    /// assembly re-validates before trusting the values.
    pub fn validate(&self) -> Result<(), AssemblyError> {
        self.spatial_roles()?;
        if self.dimensions[3] != ScanAxis::Time {
            return Err(AssemblyError::InvalidScanParameters(format!(
                "time must be the slowest dimension, got {:?}",
                self.dimensions
            )));
        }
        if let Some(pos) = self.steps.iter().position(|&s| s == 0) {
            return Err(AssemblyError::InvalidScanParameters(format!(
                "step count for dimension {pos} is zero"
            )));
        }
        Ok(())
    }

    /// Total number of frames one pass over the raster produces.
    pub fn frame_count(&self) -> usize {
        self.steps.iter().map(|&s| s as usize).product()
    }

    /// Acquisition-order position (0 = fastest) of each spatial axis, in
    /// `[LeftRight, UpDown, BackFront]` order. Errors on a duplicate or
    /// missing axis.
    pub(crate) fn spatial_roles(&self) -> Result<[usize; 3], AssemblyError> {
        let mut roles = [usize::MAX; 3];
        for (role, &axis) in self.dimensions.iter().enumerate() {
            let slot = match axis {
                ScanAxis::LeftRight => 0,
                ScanAxis::UpDown => 1,
                ScanAxis::BackFront => 2,
                ScanAxis::Time => continue,
            };
            if roles[slot] != usize::MAX {
                return Err(AssemblyError::InvalidScanParameters(format!(
                    "duplicate axis {axis:?} in dimensions {:?}",
                    self.dimensions
                )));
            }
            roles[slot] = role;
        }
        if let Some(slot) = roles.iter().position(|&r| r == usize::MAX) {
            let axis = [ScanAxis::LeftRight, ScanAxis::UpDown, ScanAxis::BackFront][slot];
            return Err(AssemblyError::InvalidScanParameters(format!(
                "axis {axis:?} missing from dimensions {:?}",
                self.dimensions
            )));
        }
        Ok(roles)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn canonical() -> ScanParameters {
        ScanParameters::new(
            [
                ScanAxis::LeftRight,
                ScanAxis::UpDown,
                ScanAxis::BackFront,
                ScanAxis::Time,
            ],
            [ScanDirection::Positive; 3],
            [4, 3, 2, 5],
            [0.1, 0.1, 0.5, 1.0],
            true,
        )
        .expect("canonical parameters are valid")
    }

    #[test]
    fn frame_count_is_step_product() {
        assert_eq!(canonical().frame_count(), 4 * 3 * 2 * 5);
    }

    #[test]
    fn duplicate_axis_is_rejected() {
        let mut params = canonical();
        params.dimensions[1] = ScanAxis::LeftRight;
        assert!(matches!(
            params.validate(),
            Err(AssemblyError::InvalidScanParameters(_))
        ));
    }

    #[test]
    fn time_must_be_slowest() {
        let mut params = canonical();
        params.dimensions.swap(1, 3);
        assert!(matches!(
            params.validate(),
            Err(AssemblyError::InvalidScanParameters(_))
        ));
    }

    #[test]
    fn zero_step_is_rejected() {
        let mut params = canonical();
        params.steps[2] = 0;
        assert!(matches!(
            params.validate(),
            Err(AssemblyError::InvalidScanParameters(_))
        ));
    }

    #[test]
    fn roles_follow_dimension_order() {
        let mut params = canonical();
        params.dimensions = [
            ScanAxis::BackFront,
            ScanAxis::LeftRight,
            ScanAxis::UpDown,
            ScanAxis::Time,
        ];
        assert_eq!(params.spatial_roles().unwrap(), [1, 2, 0]);
    }

    #[test]
    fn parameters_serde_round_trip() {
        let params = canonical();
        let json = serde_json::to_string(&params).expect("serializes");
        let back: ScanParameters = serde_json::from_str(&json).expect("deserializes");
        assert_eq!(back, params);
    }
}
