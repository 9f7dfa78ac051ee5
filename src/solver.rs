//! Least-squares fit of replacement PT100 coefficients.
//!
//! Input is one averaged (reference temperature, resistance, scaled raw
//! count) triple per completed calibration step. The resistance model is
//! `R(T) = R0 * (1 + A*T + B*T^2)`, fitted as a plain quadratic
//! `p0 + p1*T + p2*T^2` so that `R0 = p0`, `A = p1/p0`, `B = p2/p0`.
//!
//! The solver never touches a device. Writing the fitted constants is the
//! separate, explicit [`write_coefficients`](crate::client::ProbeClient::
//! write_coefficients) operation.

use crate::config::SolverSettings;
use crate::error::SolverError;
use serde::{Deserialize, Serialize};

/// Minimum number of usable points for a quadratic fit.
pub const MIN_POINTS: usize = 3;

/// One per-step average for one probe.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FitPoint {
    pub reference_temperature: f64,
    pub resistance: f64,
    /// Raw ADC count scaled by 1/1000.
    pub scaled_count: f64,
}

/// Fitted constants and fit quality for one probe. Produced once per
/// completed sequence; a fresh fit replaces it.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CoefficientFit {
    /// Zero-degree resistance.
    pub r0: f64,
    pub a: f64,
    pub b: f64,
    /// Scaled raw count projected to 0 degrees Celsius.
    pub projected_count: f64,
    pub adc_offset: f64,
    /// Root-mean-square error of the resistance fit over the points used.
    pub rmse: f64,
    /// Coefficient of determination of the resistance fit.
    pub r_squared: f64,
    pub points_used: usize,
}

/// Fit new coefficients from accumulated per-step averages.
///
/// Points with a non-finite reference temperature or resistance, or
/// outside the instrument's valid calibration span, are discarded before
/// fitting. On any error the caller leaves the existing device
/// coefficients untouched.
pub fn fit_coefficients(
    points: &[FitPoint],
    existing_conversion_factor: f64,
    settings: &SolverSettings,
) -> Result<CoefficientFit, SolverError> {
    let usable: Vec<FitPoint> = points
        .iter()
        .filter(|p| {
            p.reference_temperature.is_finite()
                && p.resistance.is_finite()
                && p.reference_temperature >= settings.min_temperature_c
                && p.reference_temperature <= settings.max_temperature_c
        })
        .copied()
        .collect();

    if usable.len() < MIN_POINTS {
        return Err(SolverError::InsufficientData {
            got: usable.len(),
            need: MIN_POINTS,
        });
    }

    let ts: Vec<f64> = usable.iter().map(|p| p.reference_temperature).collect();
    let rs: Vec<f64> = usable.iter().map(|p| p.resistance).collect();
    let counts: Vec<f64> = usable.iter().map(|p| p.scaled_count).collect();

    let r_poly = quadratic_fit(&ts, &rs, settings.pivot_epsilon)?;
    let r0 = r_poly[0];
    if r0.abs() < settings.pivot_epsilon {
        return Err(SolverError::SingularFit);
    }
    let a = r_poly[1] / r0;
    let b = r_poly[2] / r0;

    let count_poly = quadratic_fit(&ts, &counts, settings.pivot_epsilon)?;
    let projected_count = count_poly[0];

    // Formula preserved exactly as observed in the source system; no
    // documented derivation. Flagged for domain-expert review.
    let adc_offset = projected_count / r0 - existing_conversion_factor;

    let (rmse, r_squared) = fit_quality(&ts, &rs, &r_poly);

    Ok(CoefficientFit {
        r0,
        a,
        b,
        projected_count,
        adc_offset,
        rmse,
        r_squared,
        points_used: usable.len(),
    })
}

/// Ordinary least squares for `y = p0 + p1*x + p2*x^2` via the 3x3 normal
/// equations built from power sums of x (orders 0 through 4).
fn quadratic_fit(xs: &[f64], ys: &[f64], epsilon: f64) -> Result<[f64; 3], SolverError> {
    let mut s = [0.0f64; 5];
    let mut t = [0.0f64; 3];
    for (&x, &y) in xs.iter().zip(ys) {
        let mut xp = 1.0;
        for sk in s.iter_mut() {
            *sk += xp;
            xp *= x;
        }
        let mut xp = 1.0;
        for tk in t.iter_mut() {
            *tk += y * xp;
            xp *= x;
        }
    }

    let matrix = [
        [s[0], s[1], s[2]],
        [s[1], s[2], s[3]],
        [s[2], s[3], s[4]],
    ];
    gaussian_solve(matrix, t, epsilon)
}

/// Gaussian elimination with partial pivoting. A pivot magnitude below
/// `epsilon` means the design matrix is degenerate.
fn gaussian_solve(
    mut a: [[f64; 3]; 3],
    mut b: [f64; 3],
    epsilon: f64,
) -> Result<[f64; 3], SolverError> {
    for col in 0..3 {
        let mut pivot_row = col;
        for row in col + 1..3 {
            if a[row][col].abs() > a[pivot_row][col].abs() {
                pivot_row = row;
            }
        }
        if a[pivot_row][col].abs() < epsilon {
            return Err(SolverError::SingularFit);
        }
        if pivot_row != col {
            a.swap(col, pivot_row);
            b.swap(col, pivot_row);
        }

        for row in col + 1..3 {
            let factor = a[row][col] / a[col][col];
            for k in col..3 {
                a[row][k] -= factor * a[col][k];
            }
            b[row] -= factor * b[col];
        }
    }

    let mut x = [0.0f64; 3];
    for row in (0..3).rev() {
        let mut sum = b[row];
        for k in row + 1..3 {
            sum -= a[row][k] * x[k];
        }
        x[row] = sum / a[row][row];
    }
    Ok(x)
}

fn fit_quality(xs: &[f64], ys: &[f64], poly: &[f64; 3]) -> (f64, f64) {
    let n = xs.len() as f64;
    let mean = ys.iter().sum::<f64>() / n;

    let mut ss_res = 0.0;
    let mut ss_tot = 0.0;
    for (&x, &y) in xs.iter().zip(ys) {
        let predicted = poly[0] + poly[1] * x + poly[2] * x * x;
        ss_res += (y - predicted) * (y - predicted);
        ss_tot += (y - mean) * (y - mean);
    }

    let rmse = (ss_res / n).sqrt();
    let r_squared = if ss_tot > 0.0 {
        1.0 - ss_res / ss_tot
    } else {
        1.0
    };
    (rmse, r_squared)
}
