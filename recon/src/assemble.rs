//! Volume assembly.
//!
//! Every acquired frame carries one coefficient slab per basis: the lattice
//! grid sampled at one raster phase. Assembly inverts the raster: the flat
//! frame index is decomposed into (time, slow, mid, fast) counters, the
//! serpentine and direction corrections are applied, the spatial counters are
//! routed to image coordinates by the axis labelling, and the slab is
//! scattered into every `pr`-th row / `pc`-th column of the output volume.

use ndarray::{s, Array4, Array5, ArrayView4, ArrayView5};

use crate::error::AssemblyError;
use crate::scan::{ScanDirection, ScanParameters};

/// Extracted coefficients, `[basis][frame][grid_row][grid_col]`.
pub type CoeffStack = Array4<f32>;

/// Reconstructed volume for one dataset, `[basis][time][slice][row][col]`.
#[derive(Debug, Clone, PartialEq)]
pub struct Volume {
    data: Array5<f32>,
}

impl Volume {
    pub fn view(&self) -> ArrayView5<'_, f32> {
        self.data.view()
    }

    /// The 4D `[time][slice][row][col]` volume of one basis.
    pub fn basis(&self, basis: usize) -> ArrayView4<'_, f32> {
        self.data.index_axis(ndarray::Axis(0), basis)
    }

    pub fn n_basis(&self) -> usize {
        self.data.shape()[0]
    }

    pub fn into_inner(self) -> Array5<f32> {
        self.data
    }
}

/// Reassemble a coefficient stack into a volume according to the scan raster.
///
/// The frame count must match the raster exactly; a mismatch is a hard
/// [`AssemblyError::FrameCountMismatch`], not a warning.
pub fn assemble_volume(
    coeffs: &CoeffStack,
    scan: &ScanParameters,
) -> Result<Volume, AssemblyError> {
    scan.validate()?;
    let roles = scan.spatial_roles()?;

    let (n_basis, frames, grid_rows, grid_cols) = coeffs.dim();
    if grid_rows == 0 || grid_cols == 0 {
        return Err(AssemblyError::EmptyGrid);
    }
    let expected = scan.frame_count();
    if frames != expected {
        return Err(AssemblyError::FrameCountMismatch { frames, expected });
    }

    let counts = [
        scan.steps[0] as usize,
        scan.steps[1] as usize,
        scan.steps[2] as usize,
    ];
    let time_steps = scan.steps[3] as usize;
    let frames_per_time = frames / time_steps;

    let [rl_role, ud_role, bf_role] = roles;
    let pc = counts[rl_role];
    let pr = counts[ud_role];
    let n_slices = counts[bf_role];

    let mut volume = Array5::<f32>::zeros((
        n_basis,
        time_steps,
        n_slices,
        grid_rows * pr,
        grid_cols * pc,
    ));

    for i in 0..frames {
        let t = i / frames_per_time;
        let mut idx = decompose(i, frames_per_time, counts, scan.unidirectional);

        for (axis, &role) in roles.iter().enumerate() {
            if scan.directions[axis] == ScanDirection::Negative {
                idx[role] = counts[role] - 1 - idx[role];
            }
        }

        let row0 = idx[ud_role];
        let col0 = idx[rl_role];
        let slice = idx[bf_role];

        for basis in 0..n_basis {
            volume
                .slice_mut(s![basis, t, slice, row0..;pr as isize, col0..;pc as isize])
                .assign(&coeffs.slice(s![basis, i, .., ..]));
        }
    }

    Ok(Volume { data: volume })
}

/// Split a flat frame index into `[fast, mid, slow]` raster counters,
/// applying the serpentine mirror on odd mid sweeps.
fn decompose(
    i: usize,
    frames_per_time: usize,
    counts: [usize; 3],
    unidirectional: bool,
) -> [usize; 3] {
    let slow = (i % frames_per_time) / (counts[0] * counts[1]);
    let mid = (i % (counts[0] * counts[1])) / counts[0];
    let mut fast = i % counts[0];
    if !unidirectional && mid % 2 == 1 {
        fast = counts[0] - 1 - fast;
    }
    [fast, mid, slow]
}
