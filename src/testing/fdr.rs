//! Benjamini-Hochberg adjustment for the default results provider

/// BH adjusted p-values; NaN entries stay NaN and do not count as tests.
/// R equivalent: p.adjust(pvalue, method = "BH")
pub fn benjamini_hochberg(pvalues: &[f64]) -> Vec<f64> {
    let mut tested: Vec<(usize, f64)> = pvalues
        .iter()
        .copied()
        .enumerate()
        .filter(|(_, p)| p.is_finite())
        .collect();
    tested.sort_by(|a, b| a.1.total_cmp(&b.1));

    let m = tested.len() as f64;
    let mut padj = vec![f64::NAN; pvalues.len()];
    let mut running_min = 1.0_f64;
    for (rank, &(i, p)) in tested.iter().enumerate().rev() {
        running_min = running_min.min(p * m / (rank + 1) as f64);
        padj[i] = running_min;
    }
    padj
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_matches_p_adjust() {
        // p.adjust(c(0.01, 0.04, 0.03, 0.02), "BH") = 0.04 0.04 0.04 0.04
        let padj = benjamini_hochberg(&[0.01, 0.04, 0.03, 0.02]);
        for q in padj {
            assert!((q - 0.04).abs() < 1e-12);
        }

        // p.adjust(c(0.001, 0.01, 0.05, 0.1), "BH") = 0.004 0.02 0.0667 0.1
        let padj = benjamini_hochberg(&[0.001, 0.01, 0.05, 0.1]);
        let expected = [0.004, 0.02, 0.05 * 4.0 / 3.0, 0.1];
        for (q, e) in padj.iter().zip(expected) {
            assert!((q - e).abs() < 1e-12, "{} vs {}", q, e);
        }
    }

    #[test]
    fn test_nan_is_not_a_test() {
        let padj = benjamini_hochberg(&[0.01, f64::NAN, 0.03, 0.02]);
        assert!(padj[1].is_nan());
        assert!((padj[0] - 0.03).abs() < 1e-12);
        assert!((padj[2] - 0.03).abs() < 1e-12);
        assert!(benjamini_hochberg(&[]).is_empty());
    }

    #[test]
    fn test_capped_at_one() {
        let padj = benjamini_hochberg(&[0.9, 0.95, 1.0]);
        assert!(padj.iter().all(|&q| q <= 1.0));
    }
}
