//! Export contract for the persistence collaborator.
//!
//! The writer downstream expects multi-page images in `(T, Z, C, Y, X, 1)`
//! axis order together with the physical voxel pitch. Only the reshape and
//! the metadata derivation live here; file formats belong to the collaborator.

use ndarray::{Array6, Axis};
use serde::{Deserialize, Serialize};

use crate::assemble::Volume;
use crate::error::AssemblyError;
use crate::scan::ScanParameters;

/// Physical voxel pitch of an assembled volume, in the scan's length units.
///
/// Each raster step advances the sample by one fine pixel along the image
/// axis that spatial axis maps to, so the pitch per image axis is the step
/// size of whichever scan axis landed there.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct VoxelSize {
    pub t: f64,
    pub z: f64,
    pub y: f64,
    pub x: f64,
}

impl VoxelSize {
    pub fn from_scan(scan: &ScanParameters) -> Result<Self, AssemblyError> {
        let [rl_role, ud_role, bf_role] = scan.spatial_roles()?;
        Ok(Self {
            t: scan.step_sizes[3],
            z: scan.step_sizes[bf_role],
            y: scan.step_sizes[ud_role],
            x: scan.step_sizes[rl_role],
        })
    }
}

/// Reorder a `[basis][time][slice][row][col]` volume into the writer's
/// `(T, Z, C, Y, X, 1)` layout.
pub fn to_tzcyx(volume: &Volume) -> Array6<f32> {
    let reordered = volume.view().permuted_axes([1, 2, 0, 3, 4]);
    let with_trailing = reordered.insert_axis(Axis(5));
    with_trailing.as_standard_layout().to_owned()
}
