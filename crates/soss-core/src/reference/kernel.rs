use super::SpecKernelReference;
use crate::domain::SossError;
use crate::numerics::{gradient, interpolate_linear, is_strictly_increasing};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum KernelError {
    #[error("kernel table is empty")]
    EmptyTable,
    #[error("kernel table has {wavelengths} wavelengths but {kernels} kernels")]
    TableLengthMismatch { wavelengths: usize, kernels: usize },
    #[error("kernel wavelengths must be finite and strictly increasing")]
    NotIncreasing,
    #[error("kernel {index} holds {actual} samples, expected {expected}")]
    ProfileLength {
        index: usize,
        expected: usize,
        actual: usize,
    },
    #[error("kernel oversampling must be positive")]
    ZeroOversampling,
    #[error("trace centroid covers {valid} columns; the dispersion needs at least two")]
    NoDispersion { valid: usize },
}

impl From<KernelError> for SossError {
    fn from(error: KernelError) -> Self {
        SossError::reference_mismatch("REF.KERNEL", error.to_string())
    }
}

/// Instrument line-spread kernel whose wavelength width follows the trace dispersion.
#[derive(Debug, Clone, PartialEq)]
pub struct WebbKernel {
    wavelengths: Vec<f64>,
    profiles: Vec<Vec<f64>>,
    halfwidth: usize,
    oversampling: usize,
    dispersion_wavelength: Vec<f64>,
    dispersion: Vec<f64>,
}

impl WebbKernel {
    /// `wave_centroid` holds one wavelength per detector column, zero or
    /// non-finite where the trace is absent.
    pub fn new(reference: &SpecKernelReference, wave_centroid: &[f64]) -> Result<Self, KernelError> {
        if reference.wavelengths.is_empty() {
            return Err(KernelError::EmptyTable);
        }
        if reference.wavelengths.len() != reference.kernels.len() {
            return Err(KernelError::TableLengthMismatch {
                wavelengths: reference.wavelengths.len(),
                kernels: reference.kernels.len(),
            });
        }
        if !is_strictly_increasing(&reference.wavelengths) {
            return Err(KernelError::NotIncreasing);
        }
        if reference.oversampling == 0 {
            return Err(KernelError::ZeroOversampling);
        }
        let expected = 2 * reference.halfwidth * reference.oversampling + 1;
        for (index, kernel) in reference.kernels.iter().enumerate() {
            if kernel.len() != expected {
                return Err(KernelError::ProfileLength {
                    index,
                    expected,
                    actual: kernel.len(),
                });
            }
        }

        let (columns, centroid): (Vec<f64>, Vec<f64>) = wave_centroid
            .iter()
            .enumerate()
            .filter(|(_, wavelength)| wavelength.is_finite() && **wavelength > 0.0)
            .map(|(column, &wavelength)| (column as f64, wavelength))
            .unzip();
        if centroid.len() < 2 {
            return Err(KernelError::NoDispersion {
                valid: centroid.len(),
            });
        }
        let slope = gradient(&centroid, &columns).ok_or(KernelError::NoDispersion {
            valid: centroid.len(),
        })?;

        let mut pairs: Vec<(f64, f64)> = centroid
            .iter()
            .zip(&slope)
            .map(|(&wavelength, &d)| (wavelength, d.abs()))
            .filter(|(_, d)| d.is_finite() && *d > 0.0)
            .collect();
        pairs.sort_unstable_by(|lhs, rhs| lhs.0.total_cmp(&rhs.0));
        pairs.dedup_by(|next, kept| next.0 == kept.0);
        if pairs.is_empty() {
            return Err(KernelError::NoDispersion { valid: 0 });
        }
        let (dispersion_wavelength, dispersion) = pairs.into_iter().unzip();

        Ok(Self {
            wavelengths: reference.wavelengths.clone(),
            profiles: reference.kernels.clone(),
            halfwidth: reference.halfwidth,
            oversampling: reference.oversampling,
            dispersion_wavelength,
            dispersion,
        })
    }

    pub fn wavelength_range(&self) -> (f64, f64) {
        (self.wavelengths[0], self.wavelengths[self.wavelengths.len() - 1])
    }

    /// |dλ/dpixel| at `wavelength`.
    pub fn dispersion(&self, wavelength: f64) -> f64 {
        if self.dispersion.len() == 1 {
            return self.dispersion[0];
        }
        interpolate_linear(wavelength, &self.dispersion_wavelength, &self.dispersion)
            .unwrap_or(self.dispersion[0])
    }

    fn profile_at(&self, wavelength: f64) -> Vec<f64> {
        let count = self.wavelengths.len();
        if count == 1 || wavelength <= self.wavelengths[0] {
            return self.profiles[0].clone();
        }
        if wavelength >= self.wavelengths[count - 1] {
            return self.profiles[count - 1].clone();
        }
        let upper = self.wavelengths.partition_point(|&w| w < wavelength).max(1);
        let lower = upper - 1;
        let t = (wavelength - self.wavelengths[lower])
            / (self.wavelengths[upper] - self.wavelengths[lower]);
        self.profiles[lower]
            .iter()
            .zip(&self.profiles[upper])
            .map(|(a, b)| a + t * (b - a))
            .collect()
    }

    fn sample(&self, profile: &[f64], pixel_offset: f64) -> f64 {
        let position = (pixel_offset + self.halfwidth as f64) * self.oversampling as f64;
        let last = (profile.len() - 1) as f64;
        if !(0.0..=last).contains(&position) {
            return 0.0;
        }
        let lower = position.floor() as usize;
        let upper = position.ceil() as usize;
        let t = position - lower as f64;
        profile[lower] + t * (profile[upper] - profile[lower])
    }

    /// Kernel rows for every grid node whose support fits inside the grid.
    pub fn convolution_matrix(&self, grid: &[f64]) -> ConvolutionMatrix {
        let n = grid.len();
        let mut grid_indices = Vec::new();
        let mut rows = Vec::new();
        if n < 2 {
            return ConvolutionMatrix { grid_indices, rows };
        }

        for (j, &center) in grid.iter().enumerate() {
            let dispersion = self.dispersion(center);
            let support = self.halfwidth as f64 * dispersion;
            if center - support < grid[0] || center + support > grid[n - 1] {
                continue;
            }

            let profile = self.profile_at(center);
            let first = grid.partition_point(|&w| w < center - support);
            let last = grid.partition_point(|&w| w <= center + support);
            let mut row: Vec<(usize, f64)> = (first..last)
                .map(|i| {
                    let left = grid[i.saturating_sub(1)];
                    let right = grid[(i + 1).min(n - 1)];
                    let weight = self.sample(&profile, (grid[i] - center) / dispersion)
                        * 0.5
                        * (right - left);
                    (i, weight)
                })
                .filter(|(_, weight)| *weight > 0.0)
                .collect();

            let total: f64 = row.iter().map(|(_, weight)| weight).sum();
            if total > 0.0 {
                row.iter_mut().for_each(|(_, weight)| *weight /= total);
            } else {
                row = vec![(j, 1.0)];
            }
            grid_indices.push(j);
            rows.push(row);
        }

        ConvolutionMatrix { grid_indices, rows }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Kernel {
    Identity,
    Webb(WebbKernel),
}

impl Kernel {
    pub fn convolution_matrix(&self, grid: &[f64]) -> ConvolutionMatrix {
        match self {
            Self::Identity => ConvolutionMatrix::identity(grid.len()),
            Self::Webb(kernel) => kernel.convolution_matrix(grid),
        }
    }
}

/// Sparse map from fluxes on a wavelength grid to convolved fluxes on the
/// subset of grid nodes listed in `grid_indices`.
#[derive(Debug, Clone, PartialEq)]
pub struct ConvolutionMatrix {
    grid_indices: Vec<usize>,
    rows: Vec<Vec<(usize, f64)>>,
}

impl ConvolutionMatrix {
    pub fn identity(n: usize) -> Self {
        Self {
            grid_indices: (0..n).collect(),
            rows: (0..n).map(|i| vec![(i, 1.0)]).collect(),
        }
    }

    pub fn grid_indices(&self) -> &[usize] {
        &self.grid_indices
    }

    pub fn rows(&self) -> &[Vec<(usize, f64)>] {
        &self.rows
    }

    pub fn len(&self) -> usize {
        self.grid_indices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.grid_indices.is_empty()
    }

    pub fn convolved_grid(&self, grid: &[f64]) -> Vec<f64> {
        self.grid_indices.iter().map(|&i| grid[i]).collect()
    }

    pub fn apply(&self, flux: &[f64]) -> Vec<f64> {
        self.rows
            .iter()
            .map(|row| row.iter().map(|&(i, weight)| weight * flux[i]).sum())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::{ConvolutionMatrix, Kernel, KernelError, WebbKernel};
    use crate::reference::SpecKernelReference;

    fn reference(halfwidth: usize, kernel: Vec<f64>) -> SpecKernelReference {
        SpecKernelReference {
            wavelengths: vec![1.0, 2.0],
            kernels: vec![kernel.clone(), kernel],
            halfwidth,
            oversampling: 1,
        }
    }

    fn centroid() -> Vec<f64> {
        // 0.01 micron per column, two uncovered columns at each edge.
        let mut values: Vec<f64> = (0..40).map(|c| 1.2 + 0.01 * c as f64).collect();
        values[0] = 0.0;
        values[1] = f64::NAN;
        values[38] = 0.0;
        values[39] = 0.0;
        values
    }

    #[test]
    fn dispersion_follows_the_trace_centroid() {
        let kernel = WebbKernel::new(&reference(1, vec![0.25, 0.5, 0.25]), &centroid()).expect("kernel");
        assert!((kernel.dispersion(1.4) - 0.01).abs() < 1.0e-12);
        assert_eq!(kernel.wavelength_range(), (1.0, 2.0));
    }

    #[test]
    fn convolution_rows_are_normalized_and_trim_grid_edges() {
        let kernel = WebbKernel::new(&reference(2, vec![0.1, 0.2, 0.4, 0.2, 0.1]), &centroid())
            .expect("kernel");
        let grid: Vec<f64> = (0..50).map(|i| 1.2 + 0.005 * i as f64).collect();
        let matrix = kernel.convolution_matrix(&grid);

        assert!(!matrix.is_empty());
        // Support is two pixels (0.02 micron), four grid steps.
        let first = matrix.grid_indices()[0];
        let last = *matrix.grid_indices().last().expect("last");
        assert!((4..=5).contains(&first));
        assert!((44..=45).contains(&last));
        for row in matrix.rows() {
            let total: f64 = row.iter().map(|(_, w)| w).sum();
            assert!((total - 1.0).abs() < 1.0e-12);
        }

        let flat = matrix.apply(&vec![3.0; grid.len()]);
        assert!(flat.iter().all(|value| (value - 3.0).abs() < 1.0e-12));
    }

    #[test]
    fn identity_kernel_keeps_every_node() {
        let matrix = Kernel::Identity.convolution_matrix(&[1.0, 1.1, 1.2]);
        assert_eq!(matrix, ConvolutionMatrix::identity(3));
        assert_eq!(matrix.apply(&[1.0, 2.0, 3.0]), vec![1.0, 2.0, 3.0]);
    }

    #[test]
    fn malformed_tables_are_rejected() {
        let error = WebbKernel::new(&reference(1, vec![1.0]), &centroid()).expect_err("length");
        assert_eq!(
            error,
            KernelError::ProfileLength {
                index: 0,
                expected: 3,
                actual: 1
            }
        );
        let error = WebbKernel::new(&reference(1, vec![0.2, 0.6, 0.2]), &[0.0, 1.3, 0.0])
            .expect_err("one column");
        assert_eq!(error, KernelError::NoDispersion { valid: 1 });
    }
}
