use cv_core::nalgebra::DMatrix;

/// Real roots of a polynomial with coefficients ordered from the highest degree down.
///
/// The roots are the eigenvalues of the companion matrix, polished with a few Newton steps.
/// Leading coefficients that are negligible relative to the largest one are dropped.
pub(crate) fn real_roots(coefficients: &[f64]) -> Vec<f64> {
    let largest = coefficients.iter().fold(0.0f64, |m, c| m.max(c.abs()));
    if largest == 0.0 || !largest.is_finite() {
        return Vec::new();
    }
    let start = match coefficients
        .iter()
        .position(|c| c.abs() > largest * 1e-14)
    {
        Some(start) => start,
        None => return Vec::new(),
    };
    let coefficients = &coefficients[start..];
    let degree = coefficients.len() - 1;
    match degree {
        0 => Vec::new(),
        1 => vec![-coefficients[1] / coefficients[0]],
        _ => {
            let lead = coefficients[0];
            let companion = DMatrix::from_fn(degree, degree, |r, c| {
                if r == 0 {
                    -coefficients[c + 1] / lead
                } else if r == c + 1 {
                    1.0
                } else {
                    0.0
                }
            });
            companion
                .complex_eigenvalues()
                .iter()
                .filter(|root| root.im.abs() <= 1e-6 * (1.0 + root.re.abs()))
                .map(|root| polish(coefficients, root.re))
                .collect()
        }
    }
}

/// Evaluates the polynomial and its derivative with Horner's scheme.
pub(crate) fn evaluate(coefficients: &[f64], x: f64) -> (f64, f64) {
    coefficients
        .iter()
        .fold((0.0, 0.0), |(value, derivative), &c| (value * x + c, derivative * x + value))
}

fn polish(coefficients: &[f64], mut x: f64) -> f64 {
    for _ in 0..3 {
        let (value, derivative) = evaluate(coefficients, x);
        if derivative.abs() < 1e-300 {
            break;
        }
        let next = x - value / derivative;
        if !next.is_finite() {
            break;
        }
        x = next;
    }
    x
}

/// Multiplies two polynomials with coefficients ordered from the highest degree down.
pub(crate) fn multiply(a: &[f64], b: &[f64]) -> Vec<f64> {
    if a.is_empty() || b.is_empty() {
        return Vec::new();
    }
    let mut out = vec![0.0; a.len() + b.len() - 1];
    for (i, &ca) in a.iter().enumerate() {
        for (j, &cb) in b.iter().enumerate() {
            out[i + j] += ca * cb;
        }
    }
    out
}

/// Adds two polynomials with coefficients ordered from the highest degree down.
pub(crate) fn add(a: &[f64], b: &[f64]) -> Vec<f64> {
    let len = a.len().max(b.len());
    let mut out = vec![0.0; len];
    for (i, &c) in a.iter().enumerate() {
        out[len - a.len() + i] += c;
    }
    for (i, &c) in b.iter().enumerate() {
        out[len - b.len() + i] += c;
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sorted(mut roots: Vec<f64>) -> Vec<f64> {
        roots.sort_by(|a, b| a.partial_cmp(b).unwrap());
        roots
    }

    #[test]
    fn quartic_roots() {
        // (x - 1)(x + 2)(x - 3)(x^2 + 1) has three real roots.
        let p = multiply(
            &multiply(&multiply(&[1.0, -1.0], &[1.0, 2.0]), &[1.0, -3.0]),
            &[1.0, 0.0, 1.0],
        );
        let roots = sorted(real_roots(&p));
        assert_eq!(roots.len(), 3);
        for (root, expected) in roots.iter().zip([-2.0, 1.0, 3.0]) {
            assert!((root - expected).abs() < 1e-10);
        }
    }

    #[test]
    fn leading_zeros_are_dropped() {
        let roots = real_roots(&[0.0, 0.0, 2.0, -4.0]);
        assert_eq!(roots.len(), 1);
        assert!((roots[0] - 2.0).abs() < 1e-12);
    }

    #[test]
    fn sums_align_lowest_degree() {
        assert_eq!(add(&[1.0, 2.0, 3.0], &[1.0]), vec![1.0, 2.0, 4.0]);
        assert_eq!(evaluate(&[1.0, 0.0, -4.0], 2.0), (0.0, 4.0));
    }
}
