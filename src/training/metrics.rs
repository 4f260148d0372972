//! Loss and accuracy on one-hot targets

use ndarray::{Array2, ArrayView1};

/// Categorical cross-entropy between predicted probabilities and one-hot
/// targets, averaged over the batch. Probabilities are clipped away from zero.
pub fn cross_entropy(probs: &Array2<f32>, targets: &Array2<f32>) -> f32 {
    let n = probs.nrows() as f32;
    let mut loss = 0.0;
    for (p, t) in probs.iter().zip(targets.iter()) {
        if *t > 0.0 {
            loss -= t * p.max(1e-7).ln();
        }
    }
    loss / n
}

/// Fraction of rows where the predicted arg-max matches the target arg-max
pub fn accuracy(probs: &Array2<f32>, targets: &Array2<f32>) -> f32 {
    let n = probs.nrows();
    if n == 0 {
        return 0.0;
    }
    let correct = probs
        .rows()
        .into_iter()
        .zip(targets.rows())
        .filter(|(p, t)| argmax(p.view()) == argmax(t.view()))
        .count();
    correct as f32 / n as f32
}

/// Index of the largest value in a row
pub fn argmax(row: ArrayView1<f32>) -> usize {
    let mut best = 0;
    let mut best_value = f32::NEG_INFINITY;
    for (i, &v) in row.iter().enumerate() {
        if v > best_value {
            best = i;
            best_value = v;
        }
    }
    best
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    #[test]
    fn test_cross_entropy_perfect_prediction() {
        let probs = array![[1.0, 0.0], [0.0, 1.0]];
        let targets = probs.clone();
        assert!(cross_entropy(&probs, &targets).abs() < 1e-6);
    }

    #[test]
    fn test_cross_entropy_uniform_prediction() {
        let probs = array![[0.5, 0.5]];
        let targets = array![[1.0, 0.0]];
        let loss = cross_entropy(&probs, &targets);
        assert!((loss - 0.5f32.ln().abs()).abs() < 1e-6);
    }

    #[test]
    fn test_accuracy_counts_argmax_matches() {
        let probs = array![[0.9, 0.1], [0.4, 0.6], [0.7, 0.3]];
        let targets = array![[1.0, 0.0], [1.0, 0.0], [1.0, 0.0]];
        assert!((accuracy(&probs, &targets) - 2.0 / 3.0).abs() < 1e-6);
    }

    #[test]
    fn test_argmax() {
        let row = array![0.1, 0.7, 0.2];
        assert_eq!(argmax(row.view()), 1);
    }
}
