//! Wavefront reconstruction via singular-value pseudo-inverse.
//!
//! The influence matrix M (2*nsubap x Nact) maps actuator commands to
//! measured spot displacements. Closing the loop requires the inverse
//! map; M is generally rectangular and possibly rank-deficient, so it
//! is decomposed as `M = U diag(S) V^T` once at calibration time and
//! pseudo-inverted by inverting only the non-zero singular values.

use nalgebra::{DMatrix, DVector};
use tracing::{debug, info, warn};

pub type Result<M> = std::result::Result<M, Error>;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("SVD of {rows}x{cols} influence matrix did not converge")]
    DidNotConverge { rows: usize, cols: usize },
    #[error("SVD triple shapes are inconsistent: U {u_rows}x{u_cols}, S {s_len}, V^T {vt_rows}x{vt_cols}")]
    InconsistentShapes {
        u_rows: usize,
        u_cols: usize,
        s_len: usize,
        vt_rows: usize,
        vt_cols: usize,
    },
    #[error(
        "SVD self-check failed: relative reconstruction error {err} exceeds {tol}"
    )]
    SelfCheckFailed { err: f64, tol: f64 },
}

/// Singular values at or below this fraction of the largest are treated
/// as zero when inverting.
const SINGULAR_EPS: f64 = 1e-12;

/// Relative tolerance of the post-decomposition self-check.
pub const SELF_CHECK_TOL: f64 = 1e-4;

/// The decomposition `M = U diag(S) V^T` of an influence matrix.
#[derive(Debug, Clone, PartialEq)]
pub struct SvdTriple {
    /// Sensor modes, 2*nsubap x Nact.
    pub u: DMatrix<f64>,
    /// Singular values, length Nact, descending.
    pub singular: DVector<f64>,
    /// Corrector modes (transposed), Nact x Nact.
    pub v_t: DMatrix<f64>,
}

impl SvdTriple {
    /// Decompose an influence matrix.
    pub fn decompose(m: &DMatrix<f64>) -> Result<Self> {
        let (rows, cols) = m.shape();
        let svd = m.clone().svd(true, true);
        let u = svd.u.ok_or(Error::DidNotConverge { rows, cols })?;
        let v_t = svd.v_t.ok_or(Error::DidNotConverge { rows, cols })?;
        let triple = Self {
            u,
            singular: svd.singular_values,
            v_t,
        };
        info!(
            "influence matrix {}x{} decomposed, condition {:.3e}, rank deficit {}",
            rows,
            cols,
            triple.condition_number(),
            triple.rank_deficit()
        );
        triple.check_shapes()?;
        Ok(triple)
    }

    fn check_shapes(&self) -> Result<()> {
        let n = self.singular.len();
        if self.u.ncols() != n || self.v_t.nrows() != n || self.v_t.ncols() != n {
            return Err(Error::InconsistentShapes {
                u_rows: self.u.nrows(),
                u_cols: self.u.ncols(),
                s_len: n,
                vt_rows: self.v_t.nrows(),
                vt_cols: self.v_t.ncols(),
            });
        }
        Ok(())
    }

    /// Number of actuator modes (Nact).
    pub fn nact(&self) -> usize {
        self.singular.len()
    }

    /// Number of measurement rows (2*nsubap).
    pub fn nmeas(&self) -> usize {
        self.u.nrows()
    }

    fn zero_cutoff(&self) -> f64 {
        self.singular.max() * SINGULAR_EPS
    }

    /// Rebuild `U diag(S) V^T`.
    pub fn reconstruct(&self) -> DMatrix<f64> {
        let mut us = self.u.clone();
        for (j, mut col) in us.column_iter_mut().enumerate() {
            let s = self.singular[j];
            for v in col.iter_mut() {
                *v *= s;
            }
        }
        us * &self.v_t
    }

    /// Ratio of the largest singular value to the smallest non-zero
    /// one. 1 would be a perfectly conditioned system.
    pub fn condition_number(&self) -> f64 {
        let cutoff = self.zero_cutoff();
        let min_nonzero = self
            .singular
            .iter()
            .copied()
            .filter(|&s| s > cutoff)
            .fold(f64::INFINITY, f64::min);
        if min_nonzero.is_finite() {
            self.singular.max() / min_nonzero
        } else {
            f64::INFINITY
        }
    }

    /// Count of singular values treated as zero.
    pub fn rank_deficit(&self) -> usize {
        let cutoff = self.zero_cutoff();
        self.singular.iter().filter(|&&s| s <= cutoff).count()
    }

    /// Apply the truncated pseudo-inverse to a displacement vector:
    /// `V diag(1/S_i for i < nmodes, non-zero S only) U^T disp`.
    ///
    /// `nmodes` larger than Nact is cropped; 0 means all modes.
    pub fn pseudo_apply(&self, disp: &DVector<f64>, nmodes: usize) -> DVector<f64> {
        let nact = self.nact();
        let nmodes = if nmodes == 0 || nmodes > nact {
            if nmodes > nact {
                warn!("nmodes {} exceeds actuator count {}, cropping", nmodes, nact);
            }
            nact
        } else {
            nmodes
        };
        let cutoff = self.zero_cutoff();
        let mut work = self.u.tr_mul(disp);
        for i in 0..nact {
            let s = self.singular[i];
            work[i] = if i < nmodes && s > cutoff {
                work[i] / s
            } else {
                0.0
            };
        }
        self.v_t.tr_mul(&work)
    }

    /// Verify the decomposition against the measured matrix with a
    /// caller-supplied test vector: both `M x` vs `U diag(S) V^T x` and
    /// the pseudo-inverse round trip must agree to [SELF_CHECK_TOL].
    pub fn self_check(&self, m: &DMatrix<f64>, test: &DVector<f64>) -> Result<()> {
        let direct = m * test;
        let via_svd = self.reconstruct() * test;
        let denom = direct.norm();
        let err = if denom > 0.0 {
            (&direct - &via_svd).norm() / denom
        } else {
            (&direct - &via_svd).norm()
        };
        debug!("SVD forward self-check relative error: {:.3e}", err);
        if err >= SELF_CHECK_TOL {
            return Err(Error::SelfCheckFailed {
                err,
                tol: SELF_CHECK_TOL,
            });
        }

        if self.rank_deficit() == 0 && self.nmeas() >= self.nact() {
            let recovered = self.pseudo_apply(&direct, 0);
            let denom = test.norm();
            let err = if denom > 0.0 {
                (&recovered - test).norm() / denom
            } else {
                (&recovered - test).norm()
            };
            debug!("SVD inverse self-check relative error: {:.3e}", err);
            if err >= SELF_CHECK_TOL {
                return Err(Error::SelfCheckFailed {
                    err,
                    tol: SELF_CHECK_TOL,
                });
            }
        }
        Ok(())
    }
}

/// One corrector's slice of the reconstructed update.
pub struct CtrlBank<'a> {
    /// Control vector, adjusted in place, clamped to [-1, 1].
    pub ctrl: &'a mut [f32],
    /// Step gain applied to this corrector's share of the update.
    pub gain: f32,
}

/// The reconstructor: a decomposition plus a mode-truncation setting.
#[derive(Debug, Clone)]
pub struct Reconstructor {
    triple: SvdTriple,
    nmodes: usize,
}

impl Reconstructor {
    /// `nmodes == 0` keeps every mode.
    pub fn new(triple: SvdTriple, nmodes: usize) -> Self {
        Self { triple, nmodes }
    }

    pub fn triple(&self) -> &SvdTriple {
        &self.triple
    }

    pub fn nact(&self) -> usize {
        self.triple.nact()
    }

    /// Reconstruct actuator commands from a displacement vector.
    pub fn reconstruct(&self, disp: &DVector<f64>) -> DVector<f64> {
        self.triple.pseudo_apply(disp, self.nmodes)
    }

    /// Split a reconstructed command vector across correctors in
    /// declaration order, applying each bank's step gain and clamping:
    /// `ctrl[a] <- clamp(ctrl[a] - total[j]*gain, -1, 1)`.
    ///
    /// The reconstructed values are corrections to the commands already
    /// applied, hence the subtraction.
    pub fn distribute(total: &DVector<f64>, banks: &mut [CtrlBank<'_>]) {
        let mut j = 0;
        for bank in banks.iter_mut() {
            for c in bank.ctrl.iter_mut() {
                if j >= total.len() {
                    return;
                }
                *c = (*c - total[j] as f32 * bank.gain).clamp(-1.0, 1.0);
                j += 1;
            }
        }
    }
}
