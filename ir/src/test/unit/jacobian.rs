use crate::jacobian::LoadJacobian;
use crate::rational::OptionalRational;

fn r(n: i64, d: i64) -> OptionalRational {
    OptionalRational::new(n, d)
}

fn matrix(rows: usize, cols: usize, count: i64, cells: &[(usize, usize, i64, i64)]) -> LoadJacobian {
    let mut j = LoadJacobian::new(rows, cols, count);
    for i in 0..rows {
        for k in 0..cols {
            j.set(i, k, OptionalRational::zero());
        }
    }
    for &(i, k, n, d) in cells {
        j.set(i, k, r(n, d));
    }
    j
}

#[test]
fn scalar_producer_reads_exact_zero() {
    let j = LoadJacobian::new(0, 3, 1);
    assert_eq!(j.get(0, 0), 0);
    assert_eq!(j.get(5, 2), 0);
    assert!(j.get(0, 0).exists());
    assert!(j.is_empty());
}

#[test]
fn merge_requires_equal_coefficients() {
    let mut a = matrix(1, 1, 2, &[(0, 0, 1, 1)]);
    let b = matrix(1, 1, 3, &[(0, 0, 1, 1)]);
    assert!(a.merge(&b));
    assert_eq!(a.count(), 5);

    let c = matrix(1, 1, 1, &[(0, 0, 2, 1)]);
    assert!(!a.merge(&c));
    assert_eq!(a.count(), 5);

    let wrong_shape = matrix(2, 1, 1, &[(0, 0, 1, 1)]);
    assert!(!a.merge(&wrong_shape));
}

#[test]
fn merge_is_commutative_on_matching_matrices() {
    let a = matrix(1, 2, 2, &[(0, 0, 1, 2), (0, 1, 0, 1)]);
    let b = matrix(1, 2, 5, &[(0, 0, 2, 4), (0, 1, 0, 1)]);

    let mut ab = a.clone();
    assert!(ab.merge(&b));
    let mut ba = b.clone();
    assert!(ba.merge(&a));
    assert_eq!(ab.count(), ba.count());
}

#[test]
fn composition_multiplies_counts_and_dots_cells() {
    // a: 1x2, b: 2x1
    let a = matrix(1, 2, 2, &[(0, 0, 1, 2), (0, 1, 3, 1)]);
    let b = matrix(2, 1, 3, &[(0, 0, 1, 1), (1, 0, 1, 3)]);
    let c = a.compose(&b);
    assert_eq!(c.producer_storage_dims(), 1);
    assert_eq!(c.consumer_loop_dims(), 1);
    assert_eq!(c.count(), 6);
    // 1/2 * 1 + 3 * 1/3 = 3/2
    assert_eq!(c.get(0, 0), r(3, 2));
}

#[test]
fn composition_associates_on_coefficients() {
    let a = matrix(2, 2, 1, &[(0, 0, 1, 1), (0, 1, 1, 2), (1, 0, 0, 1), (1, 1, 2, 1)]);
    let b = matrix(2, 2, 2, &[(0, 0, 1, 3), (0, 1, 0, 1), (1, 0, 1, 1), (1, 1, 1, 1)]);
    let c = matrix(2, 2, 3, &[(0, 0, 2, 1), (0, 1, 1, 1), (1, 0, 0, 1), (1, 1, 1, 4)]);

    let left = a.compose(&b).compose(&c);
    let right = a.compose(&b.compose(&c));
    assert_eq!(left.count(), right.count());
    for i in 0..2 {
        for j in 0..2 {
            assert_eq!(left.get(i, j), right.get(i, j), "cell ({i}, {j})");
        }
    }
}

#[test]
fn unknown_coefficient_poisons_the_dot_chain() {
    let mut a = matrix(1, 2, 1, &[(0, 0, 1, 1)]);
    a.set(0, 1, OptionalRational::unknown());
    let b = matrix(2, 1, 1, &[(0, 0, 1, 1), (1, 0, 1, 1)]);
    let c = a.compose(&b);
    assert!(!c.get(0, 0).exists());
    assert!(!c.all_coeffs_exist());
}

#[test]
fn scale_columns() {
    let a = matrix(1, 2, 1, &[(0, 0, 1, 2), (0, 1, 1, 1)]);
    let scaled = a.scale_columns(&[4, 3]);
    assert_eq!(scaled.get(0, 0), 2);
    assert_eq!(scaled.get(0, 1), 3);
    assert_eq!(scaled.count(), 1);
}

#[test]
fn constant_matrix_detection() {
    let z = matrix(2, 2, 1, &[]);
    assert!(z.is_constant());
    let nz = matrix(2, 2, 1, &[(0, 0, 1, 1)]);
    assert!(!nz.is_constant());
}

#[test]
#[should_panic(expected = "dimension mismatch")]
fn composition_dimension_mismatch_is_fatal() {
    let a = matrix(1, 2, 1, &[]);
    let b = matrix(3, 1, 1, &[]);
    let _ = a.compose(&b);
}
