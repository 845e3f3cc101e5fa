//! Scanned-illumination reconstruction pipeline.
//!
//! Reconstructs super-resolved image volumes from frame stacks acquired under
//! a periodic scanning illumination lattice. The pipeline has three stages
//! plus a stateful orchestrator:
//!
//! - [`pattern::estimate_pattern`] recovers the lattice period and sub-pixel
//!   phase from a 2D mean image
//! - [`extract::CoefficientExtractor`] fits per-basis amplitudes at every
//!   lattice point of every frame through the `spotfit` compute kernel
//! - [`assemble::assemble_volume`] scatters the coefficient stream into an ND
//!   volume according to the acquisition raster
//! - [`session::ReconstructionSession`] accumulates coefficients across
//!   datasets and owns the assembled volumes
//!
//! Raw data flows in one direction: frames -> pattern -> coefficients ->
//! volume. Every stage returns typed errors; nothing in this crate logs and
//! swallows a failure.

pub mod assemble;
pub mod error;
pub mod export;
pub mod extract;
pub mod gaussfit;
pub mod pattern;
pub mod peaks;
pub mod scan;
pub mod session;

pub use assemble::{assemble_volume, CoeffStack, Volume};
pub use error::{AssemblyError, ExtractionError, PatternError};
pub use export::{to_tzcyx, VoxelSize};
pub use extract::{
    grid_shape, BasisSigmas, CoefficientExtractor, Device, GpuFailurePolicy,
    CONSTANT_BACKGROUND_CODE, NO_BACKGROUND_CODE,
};
pub use pattern::{estimate_pattern, Pattern};
pub use scan::{ScanAxis, ScanDirection, ScanParameters};
pub use session::ReconstructionSession;

// Kernel-boundary types shared with callers.
pub use spotfit::{Background, CancelToken};
