use faer::linalg::solvers::{Ldlt, Llt, Solve};
use faer::sparse::linalg::solvers::{Llt as SparseLlt, SymbolicLlt};
use faer::sparse::{SparseColMatRef, SymbolicSparseColMat};
use faer::{Mat, Side};
use std::collections::BTreeMap;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SolveError {
    #[error("linear solve requires a square matrix, got {rows}x{cols}")]
    NonSquareMatrix { rows: usize, cols: usize },
    #[error("linear solve requires a non-empty matrix")]
    EmptyMatrix,
    #[error("right-hand side length mismatch: expected {expected}, got {actual}")]
    RhsLengthMismatch { expected: usize, actual: usize },
    #[error("symmetric system of size {dimension} could not be factorized")]
    FactorizationFailed { dimension: usize },
    #[error("solution holds a non-finite value at index {index}")]
    NonFiniteSolution { index: usize },
    #[error("sparse pattern of size {dimension} could not be analysed")]
    SymbolicAnalysisFailed { dimension: usize },
    #[error("expected {expected} matrix values, got {actual}")]
    ValueLengthMismatch { expected: usize, actual: usize },
}

/// Solves `matrix * x = rhs` for a symmetric positive (semi-)definite matrix.
/// Only the lower triangle is read. LLᵀ is tried first, LDLᵀ second.
pub fn solve_symmetric(matrix: &Mat<f64>, rhs: &[f64]) -> Result<Vec<f64>, SolveError> {
    let (rows, cols) = (matrix.nrows(), matrix.ncols());
    if rows != cols {
        return Err(SolveError::NonSquareMatrix { rows, cols });
    }
    if rows == 0 {
        return Err(SolveError::EmptyMatrix);
    }
    if rhs.len() != rows {
        return Err(SolveError::RhsLengthMismatch {
            expected: rows,
            actual: rhs.len(),
        });
    }

    let mut solution = Mat::<f64>::from_fn(rows, 1, |i, _| rhs[i]);
    if let Ok(llt) = Llt::new(matrix.as_ref(), Side::Lower) {
        llt.solve_in_place(solution.as_mut());
    } else if let Ok(ldlt) = Ldlt::new(matrix.as_ref(), Side::Lower) {
        ldlt.solve_in_place(solution.as_mut());
    } else {
        return Err(SolveError::FactorizationFailed { dimension: rows });
    }

    finite_column(&solution)
}

fn finite_column(solution: &Mat<f64>) -> Result<Vec<f64>, SolveError> {
    let values: Vec<f64> = (0..solution.nrows()).map(|i| solution[(i, 0)]).collect();
    if let Some(index) = values.iter().position(|value| !value.is_finite()) {
        return Err(SolveError::NonFiniteSolution { index });
    }
    Ok(values)
}

/// Lower triangle of a symmetric matrix in compressed-column storage.
/// Row indices are sorted within each column and every diagonal entry is stored.
#[derive(Debug, Clone, PartialEq)]
pub struct SymmetricSparse {
    col_ptr: Vec<usize>,
    row_idx: Vec<usize>,
    values: Vec<f64>,
}

impl SymmetricSparse {
    /// `columns[j]` maps row indices `i >= j` to values; rows above the
    /// diagonal are ignored and missing diagonals are stored as zero.
    pub fn from_columns(columns: Vec<BTreeMap<usize, f64>>) -> Self {
        let dimension = columns.len();
        let mut col_ptr = Vec::with_capacity(dimension + 1);
        let mut row_idx = Vec::new();
        let mut values = Vec::new();
        col_ptr.push(0);
        for (j, mut column) in columns.into_iter().enumerate() {
            column.entry(j).or_insert(0.0);
            for (i, value) in column.range(j..dimension) {
                row_idx.push(*i);
                values.push(*value);
            }
            col_ptr.push(row_idx.len());
        }
        Self {
            col_ptr,
            row_idx,
            values,
        }
    }

    pub fn dimension(&self) -> usize {
        self.col_ptr.len() - 1
    }

    /// Stored entries of the lower triangle.
    pub fn nonzeros(&self) -> usize {
        self.row_idx.len()
    }

    pub fn values(&self) -> &[f64] {
        &self.values
    }

    /// Position of `(row, col)` in [`Self::values`], with `row >= col`.
    pub fn position(&self, row: usize, col: usize) -> Option<usize> {
        let (start, end) = (self.col_ptr[col], self.col_ptr[col + 1]);
        self.row_idx[start..end]
            .binary_search(&row)
            .ok()
            .map(|offset| start + offset)
    }

    pub fn diagonal(&self, i: usize) -> f64 {
        self.values[self.col_ptr[i]]
    }

    /// Principal submatrix on the sorted indices `keep`.
    pub fn submatrix(&self, keep: &[usize]) -> Self {
        let mut local = vec![usize::MAX; self.dimension()];
        for (new, &old) in keep.iter().enumerate() {
            local[old] = new;
        }
        let columns = keep
            .iter()
            .map(|&old| {
                (self.col_ptr[old]..self.col_ptr[old + 1])
                    .filter(|&k| local[self.row_idx[k]] != usize::MAX)
                    .map(|k| (local[self.row_idx[k]], self.values[k]))
                    .collect()
            })
            .collect();
        Self::from_columns(columns)
    }

    pub fn to_dense_lower(&self, values: &[f64]) -> Mat<f64> {
        let n = self.dimension();
        let mut dense = Mat::<f64>::zeros(n, n);
        for j in 0..n {
            for k in self.col_ptr[j]..self.col_ptr[j + 1] {
                dense[(self.row_idx[k], j)] = values[k];
            }
        }
        dense
    }
}

/// Sparse LLᵀ whose symbolic analysis is shared by every value set on one pattern.
pub struct SparseCholesky {
    pattern: SymbolicSparseColMat<usize>,
    symbolic: SymbolicLlt<usize>,
}

impl SparseCholesky {
    pub fn analyze(matrix: &SymmetricSparse) -> Result<Self, SolveError> {
        let dimension = matrix.dimension();
        if dimension == 0 {
            return Err(SolveError::EmptyMatrix);
        }
        let pattern = SymbolicSparseColMat::new_checked(
            dimension,
            dimension,
            matrix.col_ptr.clone(),
            None,
            matrix.row_idx.clone(),
        );
        let symbolic = SymbolicLlt::try_new(pattern.as_ref(), Side::Lower)
            .map_err(|_| SolveError::SymbolicAnalysisFailed { dimension })?;
        Ok(Self { pattern, symbolic })
    }

    /// Solves with `values` laid out like the analysed matrix's stored entries.
    pub fn solve(&self, values: &[f64], rhs: &[f64]) -> Result<Vec<f64>, SolveError> {
        let dimension = self.pattern.nrows();
        if values.len() != self.pattern.row_idx().len() {
            return Err(SolveError::ValueLengthMismatch {
                expected: self.pattern.row_idx().len(),
                actual: values.len(),
            });
        }
        if rhs.len() != dimension {
            return Err(SolveError::RhsLengthMismatch {
                expected: dimension,
                actual: rhs.len(),
            });
        }

        let matrix = SparseColMatRef::new(self.pattern.as_ref(), values);
        let llt = SparseLlt::try_new_with_symbolic(self.symbolic.clone(), matrix, Side::Lower)
            .map_err(|_| SolveError::FactorizationFailed { dimension })?;
        let mut solution = Mat::<f64>::from_fn(dimension, 1, |i, _| rhs[i]);
        llt.solve_in_place(solution.as_mut());
        finite_column(&solution)
    }
}
