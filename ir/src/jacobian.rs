//! Load jacobians: the derivative of producer coordinates with respect to
//! consumer loops.
//!
//! A [`LoadJacobian`] summarizes the memory-access locality of one load: a
//! `rows x cols` matrix of rational strides (rows = producer storage
//! dimensions, cols = consumer loop dimensions) plus a count of how many
//! loads share the matrix, so identical access patterns are recorded once.

use std::fmt;

use crate::rational::OptionalRational;

#[derive(Debug, Clone)]
pub struct LoadJacobian {
    coeffs: Vec<OptionalRational>,
    count: i64,
    rows: usize,
    cols: usize,
}

impl LoadJacobian {
    /// All coefficients start unknown; builders fill them in.
    pub fn new(producer_storage_dims: usize, consumer_loop_dims: usize, count: i64) -> Self {
        Self {
            coeffs: vec![OptionalRational::unknown(); producer_storage_dims * consumer_loop_dims],
            count,
            rows: producer_storage_dims,
            cols: consumer_loop_dims,
        }
    }

    pub fn producer_storage_dims(&self) -> usize {
        self.rows
    }

    pub fn consumer_loop_dims(&self) -> usize {
        self.cols
    }

    pub fn is_empty(&self) -> bool {
        self.rows == 0
    }

    pub fn count(&self) -> i64 {
        self.count
    }

    pub fn all_coeffs_exist(&self) -> bool {
        self.coeffs.iter().all(|c| c.exists())
    }

    /// True when every stride is an exact zero.
    pub fn is_constant(&self) -> bool {
        self.coeffs.iter().all(|c| c.exists() && *c == 0)
    }

    /// A scalar producer or consumer has no strides at all, so every cell
    /// reads as exact zero.
    pub fn get(&self, producer_storage_dim: usize, consumer_loop_dim: usize) -> OptionalRational {
        if self.rows == 0 || self.cols == 0 {
            return OptionalRational::zero();
        }
        self.coeffs[producer_storage_dim * self.cols + consumer_loop_dim]
    }

    pub fn set(&mut self, producer_storage_dim: usize, consumer_loop_dim: usize, value: OptionalRational) {
        self.coeffs[producer_storage_dim * self.cols + consumer_loop_dim] = value;
    }

    /// Fold another jacobian into this one if the matrices match, bumping the
    /// count. Returns whether the merge happened.
    pub fn merge(&mut self, other: &LoadJacobian) -> bool {
        if other.rows != self.rows || other.cols != self.cols {
            return false;
        }
        if self.coeffs.iter().zip(&other.coeffs).any(|(a, b)| a != b) {
            return false;
        }
        self.count += other.count;
        true
    }

    /// Scale each column by the given factor (used when a consumer loop is
    /// split by a tiling factor).
    pub fn scale_columns(&self, factors: &[i64]) -> LoadJacobian {
        assert_eq!(factors.len(), self.cols, "one scale factor per consumer loop dim");
        let mut result = LoadJacobian::new(self.rows, self.cols, self.count);
        for i in 0..self.rows {
            for j in 0..self.cols {
                result.set(i, j, self.get(i, j) * factors[j]);
            }
        }
        result
    }

    /// Matrix composition, used to look at memory dependencies through
    /// inlined producers. Counts multiply: each of the `self.count` loads
    /// happens once per load recorded in `other`.
    pub fn compose(&self, other: &LoadJacobian) -> LoadJacobian {
        assert_eq!(
            self.cols,
            other.rows,
            "jacobian composition dimension mismatch: {}x{} * {}x{}",
            self.rows,
            self.cols,
            other.rows,
            other.cols
        );
        let mut result = LoadJacobian::new(self.rows, other.cols, self.count * other.count);
        for i in 0..self.rows {
            for j in 0..other.cols {
                let mut cell = OptionalRational::zero();
                for k in 0..self.cols {
                    cell += self.get(i, k) * other.get(k, j);
                }
                result.set(i, j, cell);
            }
        }
        result
    }
}

impl fmt::Display for LoadJacobian {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{}x{} (count {})", self.rows, self.cols, self.count)?;
        for i in 0..self.rows {
            write!(f, "  [")?;
            for j in 0..self.cols {
                if j > 0 {
                    write!(f, " ")?;
                }
                write!(f, "{}", self.get(i, j))?;
            }
            writeln!(f, "]")?;
        }
        Ok(())
    }
}
