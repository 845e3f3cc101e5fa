//! Reconstruction session state.
//!
//! A session accumulates the coefficient stacks of repeated extractions
//! (one per dataset or time point) and owns the volumes assembled from them.
//! It is deliberately not synchronized: extraction and assembly for one
//! session must not overlap, which the `&mut` receivers enforce at compile
//! time. Sessions for independent datasets are independent values.

use crate::assemble::{assemble_volume, CoeffStack, Volume};
use crate::error::AssemblyError;
use crate::scan::ScanParameters;

#[derive(Debug)]
pub struct ReconstructionSession {
    scan: ScanParameters,
    datasets: Vec<CoeffStack>,
    volumes: Vec<Volume>,
    display_levels: Option<(f32, f32)>,
}

impl ReconstructionSession {
    pub fn new(scan: ScanParameters) -> Self {
        Self {
            scan,
            datasets: Vec::new(),
            volumes: Vec::new(),
            display_levels: None,
        }
    }

    pub fn scan_parameters(&self) -> &ScanParameters {
        &self.scan
    }

    /// Replace the scan parameters without re-assembling; call
    /// [`ReconstructionSession::rebuild`] when the new raster should take
    /// effect.
    pub fn update_scan_parameters(&mut self, scan: ScanParameters) -> Result<(), AssemblyError> {
        scan.validate()?;
        self.scan = scan;
        Ok(())
    }

    /// Append one extraction's coefficients as a new dataset.
    ///
    /// All datasets of a session must share one shape so they stack along the
    /// dataset axis.
    pub fn add_coefficients(&mut self, coeffs: CoeffStack) -> Result<(), AssemblyError> {
        if let Some(first) = self.datasets.first() {
            let expected: [usize; 4] = first
                .shape()
                .try_into()
                .unwrap_or([0; 4]);
            let got: [usize; 4] = coeffs.shape().try_into().unwrap_or([0; 4]);
            if expected != got {
                return Err(AssemblyError::DatasetShapeMismatch { expected, got });
            }
        }
        self.datasets.push(coeffs);
        Ok(())
    }

    pub fn dataset_count(&self) -> usize {
        self.datasets.len()
    }

    pub fn coefficients(&self) -> &[CoeffStack] {
        &self.datasets
    }

    /// Re-assemble every accumulated dataset with the current parameters.
    ///
    /// The previous volumes are replaced wholesale; on error nothing is kept.
    pub fn rebuild(&mut self) -> Result<(), AssemblyError> {
        let mut volumes = Vec::with_capacity(self.datasets.len());
        for coeffs in &self.datasets {
            volumes.push(assemble_volume(coeffs, &self.scan)?);
        }
        self.volumes = volumes;
        Ok(())
    }

    /// Volumes from the last successful [`ReconstructionSession::rebuild`],
    /// one per dataset.
    pub fn volumes(&self) -> &[Volume] {
        &self.volumes
    }

    pub fn set_display_levels(&mut self, levels: (f32, f32)) {
        self.display_levels = Some(levels);
    }

    pub fn display_levels(&self) -> Option<(f32, f32)> {
        self.display_levels
    }

    /// Derive display levels from the assembled data (min / max over all
    /// volumes) and store them. Returns `None` when nothing is assembled yet.
    pub fn auto_display_levels(&mut self) -> Option<(f32, f32)> {
        let mut lo = f32::INFINITY;
        let mut hi = f32::NEG_INFINITY;
        for volume in &self.volumes {
            for &v in volume.view().iter() {
                lo = lo.min(v);
                hi = hi.max(v);
            }
        }
        if lo > hi {
            return None;
        }
        self.display_levels = Some((lo, hi));
        self.display_levels
    }

    /// Drop accumulated coefficients, volumes, and display levels.
    pub fn clear(&mut self) {
        self.datasets.clear();
        self.volumes.clear();
        self.display_levels = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scan::{ScanAxis, ScanDirection};
    use ndarray::Array4;

    fn scan() -> ScanParameters {
        ScanParameters::new(
            [
                ScanAxis::LeftRight,
                ScanAxis::UpDown,
                ScanAxis::BackFront,
                ScanAxis::Time,
            ],
            [ScanDirection::Positive; 3],
            [2, 2, 1, 1],
            [1.0; 4],
            true,
        )
        .expect("valid scan")
    }

    fn stack(fill: f32) -> CoeffStack {
        Array4::from_elem((1, 4, 1, 1), fill)
    }

    #[test]
    fn accumulates_and_rebuilds_per_dataset() {
        let mut session = ReconstructionSession::new(scan());
        session.add_coefficients(stack(1.0)).unwrap();
        session.add_coefficients(stack(2.0)).unwrap();
        assert_eq!(session.dataset_count(), 2);

        session.rebuild().expect("rebuild succeeds");
        assert_eq!(session.volumes().len(), 2);
        assert_eq!(session.volumes()[1].view()[[0, 0, 0, 1, 1]], 2.0);
    }

    #[test]
    fn rejects_mismatched_dataset_shape() {
        let mut session = ReconstructionSession::new(scan());
        session.add_coefficients(stack(1.0)).unwrap();
        let err = session
            .add_coefficients(Array4::from_elem((1, 4, 2, 1), 0.0))
            .unwrap_err();
        assert!(matches!(err, AssemblyError::DatasetShapeMismatch { .. }));
    }

    #[test]
    fn update_parameters_does_not_rebuild() {
        let mut session = ReconstructionSession::new(scan());
        session.add_coefficients(stack(1.0)).unwrap();
        session.rebuild().unwrap();

        let mut other = scan();
        other.steps = [4, 1, 1, 1];
        session.update_scan_parameters(other).unwrap();

        // Volumes still reflect the old raster until rebuild is called.
        assert_eq!(session.volumes()[0].view().shape(), &[1, 1, 1, 2, 2]);
        session.rebuild().unwrap();
        assert_eq!(session.volumes()[0].view().shape(), &[1, 1, 1, 1, 4]);
    }

    #[test]
    fn auto_levels_span_assembled_values() {
        let mut session = ReconstructionSession::new(scan());
        let coeffs =
            Array4::from_shape_vec((1, 4, 1, 1), vec![1.0, 5.0, -2.0, 3.0]).expect("shape");
        session.add_coefficients(coeffs).unwrap();
        assert_eq!(session.auto_display_levels(), None);

        session.rebuild().unwrap();
        assert_eq!(session.auto_display_levels(), Some((-2.0, 5.0)));
        assert_eq!(session.display_levels(), Some((-2.0, 5.0)));
    }

    #[test]
    fn clear_resets_everything() {
        let mut session = ReconstructionSession::new(scan());
        session.add_coefficients(stack(1.0)).unwrap();
        session.rebuild().unwrap();
        session.clear();
        assert_eq!(session.dataset_count(), 0);
        assert!(session.volumes().is_empty());
        assert_eq!(session.display_levels(), None);
    }
}
