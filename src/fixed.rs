//! Q1.31 saturating fixed-point engine
//!
//! Every participant in the fabric computes with the same 32-bit fixed-point
//! scalar: one sign bit, 31 fraction bits, range `[-1, 1 − 2^−31]`. The
//! protocol decodes coded results by exact integer elimination, so arithmetic
//! here must be **bit-identical on every node**:
//!
//! - No floating point anywhere on the hot path. `from_f64` exists for
//!   configuration files and tests only.
//! - Multiplication takes the exact 64-bit product and divides by `2^31`,
//!   which truncates toward zero (an arithmetic shift would floor, and floor
//!   differs from truncation on negative products).
//! - `dot` accumulates exact 64-bit per-term products with **saturating**
//!   64-bit addition and applies a single truncate-and-clamp at the end. The
//!   pre-shift accumulator is part of the wire protocol (see `coded`), so it
//!   is exposed here as [`dot_acc`].
//! - All saturation is silent but observable through [`SatCount`]; counters
//!   feed diagnostics, never control decisions.

#![forbid(unsafe_code)]
#![allow(missing_docs)]

/// Fixed shift between the integer representation and the represented value.
pub const FRAC_BITS: u32 = 31;

const SCALE: i64 = 1i64 << FRAC_BITS;

/// A Q1.31 scalar: `i32` bits interpreted at scale `2^−31`.
#[derive(Copy, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Q31(i32);

impl Q31 {
    /// Largest representable value, `1 − 2^−31`.
    pub const MAX: Q31 = Q31(i32::MAX);
    /// Smallest representable value, `−1`.
    pub const MIN: Q31 = Q31(i32::MIN);
    /// Zero.
    pub const ZERO: Q31 = Q31(0);

    /// Reinterpret raw bits as a scalar (transparent, no scaling).
    #[inline]
    pub const fn from_bits(bits: i32) -> Self {
        Q31(bits)
    }

    /// The raw two's-complement bits (transparent, no scaling).
    #[inline]
    pub const fn to_bits(self) -> i32 {
        self.0
    }

    /// Saturating addition.
    #[inline]
    pub fn saturating_add(self, rhs: Q31) -> Q31 {
        Q31(self.0.saturating_add(rhs.0))
    }

    /// Saturating subtraction.
    #[inline]
    pub fn saturating_sub(self, rhs: Q31) -> Q31 {
        Q31(self.0.saturating_sub(rhs.0))
    }

    /// Saturating multiplication, truncating toward zero.
    ///
    /// `(-1) · (-1)` saturates to `1 − 2^−31`: the mathematically exact `1`
    /// is not representable.
    #[inline]
    pub fn saturating_mul(self, rhs: Q31) -> Q31 {
        let exact = (self.0 as i64) * (rhs.0 as i64);
        clamp_i64(exact / SCALE)
    }

    /// Addition that bumps `sat` when the result clamped.
    #[inline]
    pub fn add_observed(self, rhs: Q31, sat: &mut SatCount) -> Q31 {
        match self.0.checked_add(rhs.0) {
            Some(v) => Q31(v),
            None => {
                sat.bump();
                if (self.0 as i64 + rhs.0 as i64) > 0 {
                    Q31::MAX
                } else {
                    Q31::MIN
                }
            }
        }
    }

    /// Multiplication that bumps `sat` when the result clamped.
    #[inline]
    pub fn mul_observed(self, rhs: Q31, sat: &mut SatCount) -> Q31 {
        let exact = (self.0 as i64) * (rhs.0 as i64);
        let q = exact / SCALE;
        if q > i32::MAX as i64 || q < i32::MIN as i64 {
            sat.bump();
        }
        clamp_i64(q)
    }

    /// Conversion for configuration and test fixtures. Never call this on the
    /// hot path; the protocol is float-free by construction.
    pub fn from_f64(v: f64) -> Q31 {
        let scaled = v * SCALE as f64;
        if scaled >= i32::MAX as f64 {
            Q31::MAX
        } else if scaled <= i32::MIN as f64 {
            Q31::MIN
        } else {
            Q31(scaled as i32)
        }
    }

    /// Approximate decimal value, for diagnostics only.
    pub fn to_f64(self) -> f64 {
        self.0 as f64 / SCALE as f64
    }
}

impl std::fmt::Debug for Q31 {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Q31({:#010x})", self.0)
    }
}

#[inline]
fn clamp_i64(v: i64) -> Q31 {
    if v > i32::MAX as i64 {
        Q31::MAX
    } else if v < i32::MIN as i64 {
        Q31::MIN
    } else {
        Q31(v as i32)
    }
}

/// Truncate-and-clamp a raw dot accumulator into a scalar.
///
/// This is the single rounding step at the end of [`dot`]; the decoder calls
/// it on recovered per-row accumulators so decoded outputs match the
/// single-node oracle bit for bit.
#[inline]
pub fn q31_from_acc(acc: i64) -> Q31 {
    clamp_i64(acc / SCALE)
}

/// Saturation event counter. Observable, never authoritative.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct SatCount(u64);

impl SatCount {
    /// Fresh counter at zero.
    #[inline]
    pub const fn new() -> Self {
        SatCount(0)
    }
    #[inline]
    pub fn bump(&mut self) {
        self.0 += 1;
    }
    /// Number of saturation events observed so far.
    #[inline]
    pub fn get(self) -> u64 {
        self.0
    }
    /// True if any saturation was observed.
    #[inline]
    pub fn any(self) -> bool {
        self.0 > 0
    }
}

/// Errors surfaced by the fixed-point kernels.
#[derive(Debug, thiserror::Error)]
pub enum FixedError {
    #[error("dimension mismatch: left {left}, right {right}")]
    DimensionMismatch { left: usize, right: usize },
    #[error("matrix shape {rows}x{cols} does not match element count {len}")]
    BadShape { rows: usize, cols: usize, len: usize },
    #[error("row index {row} out of range (rows={rows})")]
    RowOutOfRange { row: usize, rows: usize },
}

/// Raw result of a dot product before the final truncate-and-clamp.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct DotAcc {
    /// Sum of exact 64-bit per-term products, saturating accumulation.
    pub acc: i64,
    /// True if the accumulator clamped at any step.
    pub saturated: bool,
}

/// Dot product returning the pre-shift accumulator.
///
/// The accumulator is exactly linear in `u` as long as neither side saturates,
/// which is what makes coded blocks decodable: the accumulator of a combined
/// row equals the sum of the accumulators of its constituent rows.
pub fn dot_acc(u: &[Q31], v: &[Q31]) -> Result<DotAcc, FixedError> {
    if u.len() != v.len() {
        return Err(FixedError::DimensionMismatch { left: u.len(), right: v.len() });
    }
    let mut acc = 0i64;
    let mut saturated = false;
    for (a, b) in u.iter().zip(v.iter()) {
        let term = (a.to_bits() as i64) * (b.to_bits() as i64);
        match acc.checked_add(term) {
            Some(next) => acc = next,
            None => {
                saturated = true;
                acc = if term > 0 { i64::MAX } else { i64::MIN };
            }
        }
    }
    Ok(DotAcc { acc, saturated })
}

/// Dot product: exact accumulation, one truncate-and-clamp at the end.
pub fn dot(u: &[Q31], v: &[Q31]) -> Result<Q31, FixedError> {
    Ok(q31_from_acc(dot_acc(u, v)?.acc))
}

/// Dense row-major Q1.31 matrix.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Matrix {
    rows: usize,
    cols: usize,
    elems: Vec<Q31>,
    unit: bool,
}

fn is_unit_pattern(rows: usize, cols: usize, elems: &[Q31]) -> bool {
    rows == cols
        && elems.iter().enumerate().all(|(i, e)| {
            if i / cols == i % cols {
                *e == Q31::MAX
            } else {
                *e == Q31::ZERO
            }
        })
}

impl Matrix {
    /// Build from row-major elements, validating the shape.
    pub fn new_r(rows: usize, cols: usize, elems: Vec<Q31>) -> Result<Self, FixedError> {
        if elems.len() != rows * cols {
            return Err(FixedError::BadShape { rows, cols, len: elems.len() });
        }
        let unit = is_unit_pattern(rows, cols, &elems);
        Ok(Matrix { rows, cols, elems, unit })
    }

    /// Build from row-major elements (panics on bad shape; test convenience).
    pub fn new(rows: usize, cols: usize, elems: Vec<Q31>) -> Self {
        Self::new_r(rows, cols, elems).expect("matrix shape")
    }

    /// The n-by-n identity operator.
    ///
    /// A unit diagonal is not representable in Q1.31 (the largest scalar is
    /// `1 − 2^−31`), and multiplying through a `MAX` diagonal loses one ULP
    /// toward zero on every nonzero entry. The conflict is resolved at the
    /// operator level: the stored elements are the `MAX`-diagonal pattern,
    /// and any matrix whose bytes form exactly that pattern **denotes the
    /// identity map**, which [`matvec`] and the coded evaluation path apply
    /// as an exact pass-through. Detection is structural, so every node
    /// derives the same behavior from the same matrix data regardless of
    /// whether it arrived by bootstrap or by commit.
    pub fn identity(n: usize) -> Self {
        let mut elems = vec![Q31::ZERO; n * n];
        for i in 0..n {
            elems[i * n + i] = Q31::MAX;
        }
        Matrix { rows: n, cols: n, elems, unit: true }
    }

    /// True when this matrix denotes the identity operator (see
    /// [`Matrix::identity`]).
    #[inline]
    pub fn is_identity(&self) -> bool {
        self.unit
    }

    #[inline]
    pub fn rows(&self) -> usize {
        self.rows
    }

    #[inline]
    pub fn cols(&self) -> usize {
        self.cols
    }

    /// Borrow row `i`.
    pub fn row_r(&self, i: usize) -> Result<&[Q31], FixedError> {
        if i >= self.rows {
            return Err(FixedError::RowOutOfRange { row: i, rows: self.rows });
        }
        Ok(&self.elems[i * self.cols..(i + 1) * self.cols])
    }

    /// Borrow row `i` (panics out of range).
    #[inline]
    pub fn row(&self, i: usize) -> &[Q31] {
        self.row_r(i).expect("row in range")
    }

    /// All elements, row-major.
    #[inline]
    pub fn elems(&self) -> &[Q31] {
        &self.elems
    }
}

/// Reference matrix-vector product: `y_i = dot(M_i, x)`.
///
/// The identity operator is applied as an exact pass-through: its rows hold
/// `MAX` (which is `1 − 2^−31`, not `1`), and dotting through them would
/// shift every nonzero component one ULP toward zero.
pub fn matvec(m: &Matrix, x: &[Q31]) -> Result<Vec<Q31>, FixedError> {
    if x.len() != m.cols() {
        return Err(FixedError::DimensionMismatch { left: m.cols(), right: x.len() });
    }
    if m.is_identity() {
        return Ok(x.to_vec());
    }
    let mut y = Vec::with_capacity(m.rows());
    for i in 0..m.rows() {
        y.push(dot(m.row(i), x)?);
    }
    Ok(y)
}

/// Accumulator of the identity operator restricted to `select`: each
/// selected component contributes the exact full-scale term `x_j · 1`,
/// i.e. `x_j` shifted up by the fraction width.
///
/// This is the identity-operator counterpart of combine-then-[`dot_acc`]:
/// identity rows never collide under combination (one `MAX` per distinct
/// column), and the pass-through terms keep the accumulator exactly linear,
/// so decoded outputs reproduce the input bit for bit.
pub fn passthrough_acc<I>(x: &[Q31], select: I) -> Result<DotAcc, FixedError>
where
    I: IntoIterator<Item = usize>,
{
    let mut acc = 0i64;
    let mut saturated = false;
    for j in select {
        if j >= x.len() {
            return Err(FixedError::RowOutOfRange { row: j, rows: x.len() });
        }
        let term = (x[j].to_bits() as i64) << FRAC_BITS;
        match acc.checked_add(term) {
            Some(next) => acc = next,
            None => {
                saturated = true;
                acc = if term > 0 { i64::MAX } else { i64::MIN };
            }
        }
    }
    Ok(DotAcc { acc, saturated })
}

/// Componentwise saturating sum of the selected rows of `m`.
///
/// Returns the combined row and whether any component clamped. A clamped
/// combination breaks the linearity the decoder relies on, so the flag
/// travels with the block result.
pub fn combine_rows<I>(m: &Matrix, select: I) -> Result<(Vec<Q31>, bool), FixedError>
where
    I: IntoIterator<Item = usize>,
{
    let mut out = vec![Q31::ZERO; m.cols()];
    let mut sat = SatCount::new();
    for i in select {
        let row = m.row_r(i)?;
        for (o, r) in out.iter_mut().zip(row.iter()) {
            *o = o.add_observed(*r, &mut sat);
        }
    }
    Ok((out, sat.any()))
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn q(v: f64) -> Q31 {
        Q31::from_f64(v)
    }

    #[test]
    fn mul_of_minus_one_squared_saturates_below_one() {
        let r = Q31::MIN.saturating_mul(Q31::MIN);
        assert_eq!(r, Q31::MAX);
    }

    #[test]
    fn add_at_the_top_of_the_range_clamps() {
        let eps = Q31::from_bits(1);
        assert_eq!(Q31::MAX.saturating_add(eps), Q31::MAX);
        assert_eq!(Q31::MIN.saturating_sub(eps), Q31::MIN);
    }

    #[test]
    fn mul_truncates_toward_zero_on_negatives() {
        // -ε · ε has an exact product of -1 at scale 2^-62; truncation toward
        // zero gives 0, where an arithmetic shift would give -ε.
        let eps = Q31::from_bits(1);
        let neg = Q31::from_bits(-1);
        assert_eq!(neg.saturating_mul(eps), Q31::ZERO);
    }

    #[test]
    fn add_and_mul_commute() {
        let a = q(0.37);
        let b = q(-0.61);
        assert_eq!(a.saturating_add(b), b.saturating_add(a));
        assert_eq!(a.saturating_mul(b), b.saturating_mul(a));
    }

    #[test]
    fn add_is_associative_only_up_to_saturation() {
        let a = q(0.25);
        let b = q(0.5);
        let c = q(-0.125);
        assert_eq!(
            a.saturating_add(b).saturating_add(c),
            a.saturating_add(b.saturating_add(c))
        );

        // Once an intermediate clamps, grouping matters.
        let big = q(0.75);
        let neg = q(-0.5);
        let left = big.saturating_add(big).saturating_add(neg);
        let right = big.saturating_add(big.saturating_add(neg));
        assert_ne!(left, right);
    }

    #[test]
    fn observed_add_counts_clamps() {
        let mut sat = SatCount::new();
        let _ = Q31::MAX.add_observed(Q31::MAX, &mut sat);
        let _ = q(0.1).add_observed(q(0.1), &mut sat);
        assert_eq!(sat.get(), 1);
    }

    #[test]
    fn dot_accumulator_is_linear_without_saturation() {
        let r1 = vec![q(0.25), q(-0.5), q(0.125)];
        let r2 = vec![q(-0.125), q(0.25), q(0.0625)];
        let x = vec![q(0.5), q(0.25), q(-0.75)];

        let combined: Vec<Q31> = r1
            .iter()
            .zip(r2.iter())
            .map(|(a, b)| a.saturating_add(*b))
            .collect();

        let lhs = dot_acc(&combined, &x).unwrap();
        let a1 = dot_acc(&r1, &x).unwrap();
        let a2 = dot_acc(&r2, &x).unwrap();
        assert!(!lhs.saturated && !a1.saturated && !a2.saturated);
        assert_eq!(lhs.acc, a1.acc + a2.acc);
    }

    #[test]
    fn dot_rejects_ragged_inputs() {
        let e = dot(&[Q31::ZERO], &[Q31::ZERO, Q31::ZERO]).unwrap_err();
        assert!(matches!(e, FixedError::DimensionMismatch { left: 1, right: 2 }));
    }

    #[test]
    fn matvec_on_zero_vector_is_zero() {
        let m = Matrix::identity(4);
        let x = vec![Q31::ZERO; 4];
        assert_eq!(matvec(&m, &x).unwrap(), x);
    }

    #[test]
    fn identity_matvec_is_an_exact_pass_through() {
        let m = Matrix::identity(4);
        let x = vec![q(0.5), q(-0.25), q(0.125), q(-0.0625)];
        assert!(m.is_identity());
        assert_eq!(matvec(&m, &x).unwrap(), x);
    }

    #[test]
    fn identity_detection_is_structural() {
        // The exact MAX-diagonal pattern denotes the identity, however the
        // matrix was built.
        let by_elems = Matrix::new_r(
            2,
            2,
            vec![Q31::MAX, Q31::ZERO, Q31::ZERO, Q31::MAX],
        )
        .unwrap();
        assert!(by_elems.is_identity());

        let off_diag = Matrix::new(2, 2, vec![Q31::MAX, Q31::ZERO, Q31::ZERO, q(0.5)]);
        assert!(!off_diag.is_identity());

        let not_square = Matrix::new(1, 2, vec![Q31::MAX, Q31::ZERO]);
        assert!(!not_square.is_identity());
    }

    #[test]
    fn max_diagonal_rows_alone_lose_one_ulp() {
        // Row-level dots keep literal Q1.31 semantics: MAX is 1 − 2^−31, so
        // a plain dot against an identity row truncates one ULP toward zero
        // on either sign. The operator-level pass-through is exact.
        let m = Matrix::identity(2);
        let x = vec![q(0.5), q(-0.25)];
        let d0 = dot(m.row(0), &x).unwrap();
        let d1 = dot(m.row(1), &x).unwrap();
        assert_eq!(d0.to_bits(), x[0].to_bits() - 1);
        assert_eq!(d1.to_bits(), x[1].to_bits() + 1);
        assert_eq!(matvec(&m, &x).unwrap(), x);
    }

    #[test]
    fn passthrough_acc_reproduces_selected_components_exactly() {
        let x = vec![q(0.5), q(-0.25), q(0.125)];
        let acc = passthrough_acc(&x, [1usize]).unwrap();
        assert!(!acc.saturated);
        assert_eq!(q31_from_acc(acc.acc), x[1]);

        let pair = passthrough_acc(&x, [0usize, 2]).unwrap();
        let a0 = passthrough_acc(&x, [0usize]).unwrap();
        let a2 = passthrough_acc(&x, [2usize]).unwrap();
        assert_eq!(pair.acc, a0.acc + a2.acc);

        assert!(matches!(
            passthrough_acc(&x, [3usize]),
            Err(FixedError::RowOutOfRange { row: 3, rows: 3 })
        ));
    }

    #[test]
    fn matvec_matches_per_row_dots() {
        let m = Matrix::new(
            2,
            3,
            vec![q(0.5), q(-0.25), q(0.125), q(0.0625), q(0.75), q(-0.5)],
        );
        let x = vec![q(0.1), q(0.2), q(0.3)];
        let y = matvec(&m, &x).unwrap();
        assert_eq!(y[0], dot(m.row(0), &x).unwrap());
        assert_eq!(y[1], dot(m.row(1), &x).unwrap());
    }

    #[test]
    fn combine_rows_flags_saturation() {
        let m = Matrix::new(2, 1, vec![Q31::MAX, Q31::MAX]);
        let (row, sat) = combine_rows(&m, [0usize, 1]).unwrap();
        assert!(sat);
        assert_eq!(row[0], Q31::MAX);

        let m2 = Matrix::new(2, 1, vec![q(0.25), q(0.25)]);
        let (row2, sat2) = combine_rows(&m2, [0usize, 1]).unwrap();
        assert!(!sat2);
        assert_eq!(row2[0], q(0.5));
    }

    #[test]
    fn bits_round_trip_is_transparent() {
        for bits in [i32::MIN, -1, 0, 1, i32::MAX] {
            assert_eq!(Q31::from_bits(bits).to_bits(), bits);
        }
    }
}
