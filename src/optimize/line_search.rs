//! Golden-section bracketing and derivative-aware Brent minimization along a
//! single search direction, ported from the `BrentDeriv`/`Bracket` pair in
//! the original optimizer (itself grounded in Numerical Recipes).

use nalgebra::DVector;

use super::Fittable;

const BRENT_MAX_ITERATIONS: usize = 500;
const BRENT_ZEPS: f64 = 1e-10;
const GOLDEN_RATIO: f64 = 1.618_034;
const GOLDEN_LIMIT: f64 = 100.0;
const BRACKET_TINY: f64 = 1e-20;
const LINMIN_TOL: f64 = 1e-4;

fn sign(a: f64, b: f64) -> f64 {
    if b >= 0.0 { a.abs() } else { -a.abs() }
}

/// `phi(lambda) = F.chi_sq(x + lambda*d)`.
fn phi(f: &dyn Fittable, x: &DVector<f64>, d: &DVector<f64>, lambda: f64) -> f64 {
    f.chi_sq(&(x + lambda * d))
}

/// `phi'(lambda) = grad(x + lambda*d) . d`.
fn dphi(f: &dyn Fittable, x: &DVector<f64>, d: &DVector<f64>, lambda: f64) -> f64 {
    let point = x + lambda * d;
    let mut grad = DVector::from_element(x.len(), 0.0);
    f.chi_sq_gradient(&point, &mut grad);
    grad.dot(d)
}

/// Expands `(a, b, c)` by golden-section steps (with optional parabolic
/// interpolation) until `phi(b) < phi(a)` and `phi(b) < phi(c)` both hold.
/// Returns the bracket and its three function values.
pub fn bracket(
    f: &dyn Fittable,
    x: &DVector<f64>,
    d: &DVector<f64>,
    mut a: f64,
    mut b: f64,
) -> (f64, f64, f64, f64, f64, f64) {
    let mut fa = phi(f, x, d, a);
    let mut fb = phi(f, x, d, b);

    if fb > fa {
        std::mem::swap(&mut a, &mut b);
        std::mem::swap(&mut fa, &mut fb);
    }

    let mut c = b + GOLDEN_RATIO * (b - a);
    let mut fc = phi(f, x, d, c);

    while fb > fc {
        let r = (b - a) * (fb - fc);
        let q = (b - c) * (fb - fa);
        let mut new_triple = true;
        let mut denom = (q - r).abs();
        if BRACKET_TINY > denom {
            denom = BRACKET_TINY;
        }
        if r > q {
            denom = -denom;
        }
        let mut u = b - ((b - c) * q - (b - a) * r) / (2.0 * denom);
        let ulim = b + GOLDEN_LIMIT * (c - b);
        let mut fu;

        if (b - u) * (u - c) > 0.0 {
            fu = phi(f, x, d, u);
            if fu < fc {
                a = b;
                fa = fb;
                b = u;
                fb = fu;
                new_triple = false;
            } else if fu > fb {
                c = u;
                fc = fu;
                new_triple = false;
            } else {
                u = c + GOLDEN_RATIO * (c - b);
                fu = phi(f, x, d, u);
            }
        } else if (c - u) * (u - ulim) > 0.0 {
            fu = phi(f, x, d, u);
            if fu < fc {
                b = c;
                c = u;
                u = c + GOLDEN_RATIO * (c - b);
                fb = fc;
                fc = fu;
                fu = phi(f, x, d, u);
            }
        } else if (u - ulim) * (ulim - c) >= 0.0 {
            u = ulim;
            fu = phi(f, x, d, u);
        } else {
            u = c + GOLDEN_RATIO * (c - b);
            fu = phi(f, x, d, u);
        }

        if new_triple {
            a = b;
            b = c;
            c = u;
            fa = fb;
            fb = fc;
            fc = fu;
        }
    }

    (a, b, c, fa, fb, fc)
}

/// Derivative-aware Brent search for the minimum of `phi` inside `[a, c]`,
/// started from `b`. Returns `(f_min, lambda_min)`.
pub fn brent_deriv(
    f: &dyn Fittable,
    x: &DVector<f64>,
    d: &DVector<f64>,
    a: f64,
    b: f64,
    c: f64,
    tol: f64,
    verbosity: u8,
) -> (f64, f64) {
    let (mut sa, mut sb) = if a < c { (a, c) } else { (c, a) };

    let mut w = b;
    let mut v = b;
    let mut x_pt = b;
    let mut e = 0.0;

    let mut fx = phi(f, x, d, x_pt);
    let mut fv = fx;
    let mut fw = fx;
    let mut dx = dphi(f, x, d, x_pt);
    let mut dv = dx;
    let mut dw = dx;

    let mut done = false;
    let mut iterations_used = 0usize;
    // Carries the step actually taken last iteration, mirroring Numerical
    // Recipes' `d`, which is never reset to zero between iterations — `e`
    // below only records *its* predecessor (`olde = e; e = d;`) once this
    // round's step has been finalized.
    let mut dstep = 0.0;

    for k in 0..BRENT_MAX_ITERATIONS {
        iterations_used = k;
        let xm = 0.5 * (sa + sb);
        let tol1 = tol * x_pt.abs() + BRENT_ZEPS;
        let tol2 = 2.0 * tol1;
        done = (x_pt - xm).abs() <= (tol2 - 0.5 * (sb - sa));
        if done {
            break;
        }

        let mut ok1 = false;
        if e.abs() > tol1 {
            let mut d1 = 2.0 * (sb - sa);
            let mut d2 = d1;
            if dw != dx {
                d1 = (w - x_pt) * dx / (dx - dw);
            }
            if dv != dx {
                d2 = (v - x_pt) * dx / (dx - dv);
            }
            let u1 = x_pt + d1;
            let u2 = x_pt + d2;
            let ok_1 = (sa - u1) * (u1 - sb) > 0.0 && dx * d1 <= 0.0;
            let ok_2 = (sa - u2) * (u2 - sb) > 0.0 && dx * d2 <= 0.0;
            let olde = e;
            e = dstep;

            if ok_1 && ok_2 {
                dstep = if d1.abs() < d2.abs() { d1 } else { d2 };
                ok1 = true;
            } else if ok_1 {
                dstep = d1;
                ok1 = true;
            } else if ok_2 {
                dstep = d2;
                ok1 = true;
            }

            if dstep.abs() > (0.5 * olde).abs() {
                ok1 = false;
            }

            if ok1 {
                let u = x_pt + dstep;
                if (u - sa) < tol2 || (sb - u) < tol2 {
                    dstep = sign(tol1, xm - x_pt);
                }
            }
        }

        if !ok1 {
            e = if dx > 0.0 { sa - x_pt } else { sb - x_pt };
            dstep = 0.5 * e;
        }

        let u;
        let fu;
        if dstep.abs() >= tol1 {
            u = x_pt + dstep;
            fu = phi(f, x, d, u);
        } else {
            u = x_pt + sign(tol1, dstep);
            fu = phi(f, x, d, u);
            if fu > fx {
                done = true;
                break;
            }
        }

        let du = dphi(f, x, d, u);
        if fu < fx {
            if u >= x_pt {
                sa = x_pt;
            } else {
                sb = x_pt;
            }
            v = w;
            fv = fw;
            dv = dw;
            w = x_pt;
            fw = fx;
            dw = dx;
            x_pt = u;
            fx = fu;
            dx = du;
        } else {
            if u < x_pt {
                sa = u;
            } else {
                sb = u;
            }
            if fu <= fw || v == x_pt {
                v = w;
                fv = fw;
                dv = dw;
                w = u;
                fw = fu;
                dw = du;
            } else if fu < fv || v == x_pt || v == w {
                v = u;
                fv = fu;
                dv = du;
            }
        }
    }

    if !done && verbosity > 0 {
        log::warn!(
            "Brent line search exhausted the maximum number of iterations ({iterations_used})"
        );
    }

    let _ = (fv, fw, dv, dw);
    (fx, x_pt)
}

/// Brackets then Brent-minimizes along `d` starting from `x`; advances `x`
/// in place by `lambda*d` and returns the chi-square at the new point.
pub fn line_min(f: &dyn Fittable, x: &mut DVector<f64>, d: &DVector<f64>, verbosity: u8) -> f64 {
    let (a, b, c, _fa, _fb, _fc) = bracket(f, x, d, 0.0, 1.0);
    let (fmin, lambda) = brent_deriv(f, x, d, a, b, c, LINMIN_TOL, verbosity);
    if verbosity > 0 {
        log::debug!("lambda={lambda}");
    }
    *x += lambda * d;
    fmin
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::optimize::test_functions::Quadratic;
    use approx::assert_abs_diff_eq;

    #[test]
    fn line_min_finds_the_minimum_of_a_quadratic_along_steepest_descent() {
        let f = Quadratic::new(vec![5.0], vec![3.0]);
        let mut x = DVector::from_vec(vec![0.0]);
        let mut grad = DVector::from_element(1, 0.0);
        f.chi_sq_gradient(&x, &mut grad);
        let d = -grad;
        let fmin = line_min(&f, &mut x, &d, 0);
        assert_abs_diff_eq!(fmin, 0.0, epsilon = 1e-6);
        assert_abs_diff_eq!(x[0], 5.0, epsilon = 1e-4);
    }
}
