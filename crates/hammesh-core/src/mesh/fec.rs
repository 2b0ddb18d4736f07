//! Reed-Solomon forward error correction
//!
//! Every L2 frame carries [`PARITY_LEN`] bytes of Reed-Solomon parity over
//! GF(2^8), which corrects up to [`CORRECTABLE`] corrupted bytes anywhere in
//! the frame. Three block sizes are available; the encoder picks the smallest
//! one that fits and zero-pads the data to it (a shortened code). Only the
//! real data and the parity go on air, so the receiver recovers the profile
//! from the frame length alone.
//!
//! ```text
//! on air:     [ data (n bytes) ][ parity (20) ]
//! codeword:   [ data (n bytes) | zeros (k - n) ][ parity (20) ]
//! ```
//!
//! The decoder fails closed: a frame with more errors than the code can
//! correct is reported as [`FecError::Uncorrectable`] or
//! [`FecError::ParityMismatch`], never returned with wrong bytes.

use thiserror::Error;

/// Parity bytes appended to every frame
pub const PARITY_LEN: usize = 20;

/// Guaranteed correctable byte errors per frame
pub const CORRECTABLE: usize = PARITY_LEN / 2;

/// Field generator polynomial x^8 + x^4 + x^3 + x^2 + 1
const PRIMITIVE_POLY: u16 = 0x11d;

/// FEC failures
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FecError {
    /// Frame length does not match any profile
    #[error("bad frame length {0}")]
    BadLength(usize),

    /// Data does not fit the largest profile
    #[error("payload of {0} bytes exceeds largest FEC block")]
    TooLong(usize),

    /// Error locator could not be resolved
    #[error("uncorrectable block ({0:?} profile)")]
    Uncorrectable(FecProfile),

    /// Syndromes still non-zero after correction
    #[error("parity mismatch after correction ({0:?} profile)")]
    ParityMismatch(FecProfile),
}

/// Block size profile
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum FecProfile {
    Short,
    Medium,
    Long,
}

impl FecProfile {
    /// All profiles, smallest first
    pub const ALL: [FecProfile; 3] = [FecProfile::Short, FecProfile::Medium, FecProfile::Long];

    /// Data bytes per block
    pub const fn data_len(self) -> usize {
        match self {
            FecProfile::Short => 80,
            FecProfile::Medium => 140,
            FecProfile::Long => 220,
        }
    }

    /// Largest on-air frame for this profile
    pub const fn max_frame_len(self) -> usize {
        self.data_len() + PARITY_LEN
    }

    /// Smallest profile that holds `data_len` bytes
    pub fn for_data_len(data_len: usize) -> Option<Self> {
        Self::ALL.into_iter().find(|p| data_len <= p.data_len())
    }

    /// Profile of a received frame, from its total on-air length
    pub fn for_frame_len(frame_len: usize) -> Option<Self> {
        if frame_len <= PARITY_LEN {
            return None;
        }
        Self::for_data_len(frame_len - PARITY_LEN)
    }
}

/// Result type for FEC operations
pub type FecResult<T> = Result<T, FecError>;

/// Append Reed-Solomon parity to `data`
pub fn encode(data: &[u8]) -> FecResult<Vec<u8>> {
    let profile = FecProfile::for_data_len(data.len()).ok_or(FecError::TooLong(data.len()))?;
    let codec = ReedSolomon::new(profile);
    let mut frame = Vec::with_capacity(data.len() + PARITY_LEN);
    frame.extend_from_slice(data);
    frame.extend_from_slice(&codec.parity(data));
    Ok(frame)
}

/// Check and correct a frame, returning the data without parity
pub fn decode(frame: &[u8]) -> FecResult<Vec<u8>> {
    let profile = FecProfile::for_frame_len(frame.len()).ok_or(FecError::BadLength(frame.len()))?;
    ReedSolomon::new(profile).correct(frame)
}

/// GF(2^8) log/antilog tables
struct Gf {
    exp: [u8; 512],
    log: [u8; 256],
}

impl Gf {
    const fn build() -> Self {
        let mut exp = [0u8; 512];
        let mut log = [0u8; 256];
        let mut x: u16 = 1;
        let mut i = 0;
        while i < 255 {
            exp[i] = x as u8;
            log[x as usize] = i as u8;
            x <<= 1;
            if x & 0x100 != 0 {
                x ^= PRIMITIVE_POLY;
            }
            i += 1;
        }
        // doubled so mul never needs a modulo
        while i < 512 {
            exp[i] = exp[i - 255];
            i += 1;
        }
        Self { exp, log }
    }

    #[inline]
    fn mul(&self, a: u8, b: u8) -> u8 {
        if a == 0 || b == 0 {
            0
        } else {
            self.exp[self.log[a as usize] as usize + self.log[b as usize] as usize]
        }
    }

    #[inline]
    fn div(&self, a: u8, b: u8) -> u8 {
        // callers never divide by zero
        if a == 0 || b == 0 {
            0
        } else {
            self.exp[self.log[a as usize] as usize + 255 - self.log[b as usize] as usize]
        }
    }

    /// alpha^power, power taken mod 255
    #[inline]
    fn pow_alpha(&self, power: usize) -> u8 {
        self.exp[power % 255]
    }

    #[inline]
    fn inv(&self, a: u8) -> u8 {
        self.div(1, a)
    }
}

static GF: Gf = Gf::build();

/// Systematic Reed-Solomon codec for one profile
///
/// Codewords are handled highest-degree coefficient first, generator roots
/// are alpha^0 .. alpha^(PARITY_LEN-1).
struct ReedSolomon {
    profile: FecProfile,
    /// Generator polynomial, highest degree first, monic
    generator: Vec<u8>,
}

impl ReedSolomon {
    fn new(profile: FecProfile) -> Self {
        let mut generator = vec![1u8];
        for i in 0..PARITY_LEN {
            // multiply by (x - alpha^i)
            let root = GF.pow_alpha(i);
            let mut next = vec![0u8; generator.len() + 1];
            for (j, &g) in generator.iter().enumerate() {
                next[j] ^= g;
                next[j + 1] ^= GF.mul(g, root);
            }
            generator = next;
        }
        Self { profile, generator }
    }

    /// Codeword length (data block + parity)
    fn n(&self) -> usize {
        self.profile.data_len() + PARITY_LEN
    }

    fn parity(&self, data: &[u8]) -> [u8; PARITY_LEN] {
        // remainder of data(x) * x^PARITY_LEN / g(x); padding zeros add nothing
        // to the remainder except shifting, so feed them too
        let mut remainder = [0u8; PARITY_LEN];
        let padded = data
            .iter()
            .copied()
            .chain(std::iter::repeat(0).take(self.profile.data_len() - data.len()));
        for byte in padded {
            let feedback = byte ^ remainder[0];
            remainder.copy_within(1.., 0);
            remainder[PARITY_LEN - 1] = 0;
            if feedback != 0 {
                for (r, &g) in remainder.iter_mut().zip(&self.generator[1..]) {
                    *r ^= GF.mul(g, feedback);
                }
            }
        }
        remainder
    }

    fn syndromes(&self, codeword: &[u8]) -> [u8; PARITY_LEN] {
        let mut s = [0u8; PARITY_LEN];
        for (j, sj) in s.iter_mut().enumerate() {
            let x = GF.pow_alpha(j);
            *sj = codeword.iter().fold(0u8, |acc, &c| GF.mul(acc, x) ^ c);
        }
        s
    }

    /// Correct a shortened on-air frame and return its data part
    fn correct(&self, frame: &[u8]) -> FecResult<Vec<u8>> {
        let data_len = frame.len() - PARITY_LEN;
        let k = self.profile.data_len();

        let mut codeword = vec![0u8; self.n()];
        codeword[..data_len].copy_from_slice(&frame[..data_len]);
        codeword[k..].copy_from_slice(&frame[data_len..]);

        let syndromes = self.syndromes(&codeword);
        if syndromes.iter().all(|&s| s == 0) {
            return Ok(codeword[..data_len].to_vec());
        }

        let locator = berlekamp_massey(&syndromes);
        let errors = locator.len() - 1;
        if errors == 0 || errors > CORRECTABLE {
            return Err(FecError::Uncorrectable(self.profile));
        }

        let positions = self.chien_search(&locator);
        if positions.len() != errors {
            return Err(FecError::Uncorrectable(self.profile));
        }

        // the zero padding is known, an "error" there means miscorrection
        if positions.iter().any(|&p| p >= data_len && p < k) {
            return Err(FecError::Uncorrectable(self.profile));
        }

        let omega = error_evaluator(&syndromes, &locator);
        for &pos in &positions {
            let x = GF.pow_alpha(self.n() - 1 - pos);
            let x_inv = GF.inv(x);
            let denominator = eval_derivative(&locator, x_inv);
            if denominator == 0 {
                return Err(FecError::Uncorrectable(self.profile));
            }
            let magnitude = GF.mul(x, GF.div(eval_low_first(&omega, x_inv), denominator));
            codeword[pos] ^= magnitude;
        }

        if self.syndromes(&codeword).iter().any(|&s| s != 0) {
            return Err(FecError::ParityMismatch(self.profile));
        }

        Ok(codeword[..data_len].to_vec())
    }

    /// Array indices whose locator root vanishes
    fn chien_search(&self, locator: &[u8]) -> Vec<usize> {
        let n = self.n();
        (0..n)
            .filter(|&pos| {
                let x_inv = GF.inv(GF.pow_alpha(n - 1 - pos));
                eval_low_first(locator, x_inv) == 0
            })
            .collect()
    }
}

/// Error locator polynomial, lowest degree first, trimmed
fn berlekamp_massey(syndromes: &[u8; PARITY_LEN]) -> Vec<u8> {
    let mut c = vec![0u8; PARITY_LEN + 1];
    let mut b = vec![0u8; PARITY_LEN + 1];
    c[0] = 1;
    b[0] = 1;
    let mut l = 0usize;
    let mut m = 1usize;
    let mut last_discrepancy = 1u8;

    for n in 0..PARITY_LEN {
        let mut d = syndromes[n];
        for i in 1..=l {
            d ^= GF.mul(c[i], syndromes[n - i]);
        }

        if d == 0 {
            m += 1;
            continue;
        }

        let coef = GF.div(d, last_discrepancy);
        let previous = c.clone();
        for i in 0..(PARITY_LEN + 1 - m) {
            c[i + m] ^= GF.mul(coef, b[i]);
        }

        if 2 * l <= n {
            l = n + 1 - l;
            b = previous;
            last_discrepancy = d;
            m = 1;
        } else {
            m += 1;
        }
    }

    // degree must match the register length, otherwise the locator is bogus
    let degree = c.iter().rposition(|&v| v != 0).unwrap_or(0);
    if degree != l {
        return vec![1];
    }
    c.truncate(l + 1);
    c
}

/// Omega(x) = S(x) * Lambda(x) mod x^PARITY_LEN, lowest degree first
fn error_evaluator(syndromes: &[u8; PARITY_LEN], locator: &[u8]) -> Vec<u8> {
    let mut omega = vec![0u8; PARITY_LEN];
    for (i, &s) in syndromes.iter().enumerate() {
        for (j, &l) in locator.iter().enumerate() {
            if i + j < PARITY_LEN {
                omega[i + j] ^= GF.mul(s, l);
            }
        }
    }
    omega
}

fn eval_low_first(poly: &[u8], x: u8) -> u8 {
    poly.iter().rev().fold(0u8, |acc, &c| GF.mul(acc, x) ^ c)
}

/// Formal derivative evaluated at x; in GF(2^m) only odd terms survive
fn eval_derivative(poly: &[u8], x: u8) -> u8 {
    let x2 = GF.mul(x, x);
    let mut result = 0u8;
    let mut power = 1u8; // x^(i-1) for odd i, stepping by x^2
    for i in (1..poly.len()).step_by(2) {
        result ^= GF.mul(poly[i], power);
        power = GF.mul(power, x2);
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(len: usize) -> Vec<u8> {
        (0..len).map(|i| b'A' + (i % 26) as u8).collect()
    }

    fn corrupt(frame: &mut [u8], count: usize) {
        // spread across data and parity
        let step = frame.len() / count.max(1);
        for i in 0..count {
            frame[i * step] ^= 0x5a;
        }
    }

    #[test]
    fn test_gf_tables() {
        assert_eq!(GF.pow_alpha(0), 1);
        assert_eq!(GF.pow_alpha(8), 0x1d);
        for a in 1..=255u8 {
            assert_eq!(GF.mul(a, GF.inv(a)), 1);
        }
    }

    #[test]
    fn test_profile_selection() {
        assert_eq!(FecProfile::for_data_len(10), Some(FecProfile::Short));
        assert_eq!(FecProfile::for_data_len(80), Some(FecProfile::Short));
        assert_eq!(FecProfile::for_data_len(81), Some(FecProfile::Medium));
        assert_eq!(FecProfile::for_data_len(220), Some(FecProfile::Long));
        assert_eq!(FecProfile::for_data_len(221), None);
        assert_eq!(FecProfile::for_frame_len(20), None);
        assert_eq!(FecProfile::for_frame_len(100), Some(FecProfile::Short));
        assert_eq!(FecProfile::for_frame_len(101), Some(FecProfile::Medium));
    }

    #[test]
    fn test_clean_frame() {
        let data = sample(42);
        let frame = encode(&data).unwrap();
        assert_eq!(frame.len(), 42 + PARITY_LEN);
        assert_eq!(&frame[..42], &data[..]);
        assert_eq!(decode(&frame).unwrap(), data);
    }

    #[test]
    fn test_correction_boundary_per_profile() {
        for profile in FecProfile::ALL {
            let data = sample(profile.data_len() - 3);
            let frame = encode(&data).unwrap();
            assert_eq!(FecProfile::for_frame_len(frame.len()), Some(profile));

            for errors in 1..=CORRECTABLE {
                let mut damaged = frame.clone();
                corrupt(&mut damaged, errors);
                assert_eq!(
                    decode(&damaged).unwrap(),
                    data,
                    "{:?} with {} errors",
                    profile,
                    errors
                );
            }

            for errors in [CORRECTABLE + 1, CORRECTABLE + 4] {
                let mut damaged = frame.clone();
                corrupt(&mut damaged, errors);
                let result = decode(&damaged);
                assert!(
                    matches!(
                        result,
                        Err(FecError::Uncorrectable(_)) | Err(FecError::ParityMismatch(_))
                    ),
                    "{:?} with {} errors returned {:?}",
                    profile,
                    errors,
                    result.map(|d| d.len())
                );
            }
        }
    }

    #[test]
    fn test_parity_bytes_corrected() {
        let data = sample(30);
        let mut frame = encode(&data).unwrap();
        let len = frame.len();
        frame[len - 1] ^= 0xff;
        frame[len - 5] ^= 0x01;
        assert_eq!(decode(&frame).unwrap(), data);
    }

    #[test]
    fn test_bad_lengths() {
        assert_eq!(decode(&[0u8; 20]), Err(FecError::BadLength(20)));
        assert_eq!(decode(&[0u8; 241]), Err(FecError::BadLength(241)));
        assert_eq!(encode(&[0u8; 221]), Err(FecError::TooLong(221)));
    }
}
