//! Row-level score math shared by the search variants and the processors.

use std::collections::HashSet;

use ndarray::{ArrayBase, ArrayView1, DataMut, Ix1};
use rand::Rng;

/// Numerically stable in-place softmax over one score row.
pub fn softmax_1d_inplace<S>(row: &mut ArrayBase<S, Ix1>)
where
    S: DataMut<Elem = f32>,
{
    let max_val = row.fold(f32::NEG_INFINITY, |acc, &x| acc.max(x));
    row.mapv_inplace(|x| (x - max_val).exp());
    let sum = row.sum();
    row.mapv_inplace(|x| x / sum);
}

/// Numerically stable in-place log-softmax: `x -> x - max - ln(sum(exp(x - max)))`.
pub fn log_softmax_1d_inplace<S>(row: &mut ArrayBase<S, Ix1>)
where
    S: DataMut<Elem = f32>,
{
    let max_val = row.fold(f32::NEG_INFINITY, |acc, &x| acc.max(x));
    let exp_sum = row.fold(0.0f32, |acc, &x| acc + (x - max_val).exp());
    let shift = max_val + exp_sum.ln();
    row.mapv_inplace(|x| x - shift);
}

/// Index of the largest score. Ties break toward the lowest token id.
pub fn argmax(row: ArrayView1<f32>) -> usize {
    let mut best = 0;
    let mut best_score = row[0];
    for (idx, &score) in row.iter().enumerate().skip(1) {
        if score > best_score {
            best_score = score;
            best = idx;
        }
    }
    best
}

/// Keeps the `k` highest-scoring entries and masks the rest to `-inf`.
/// Equal scores at the cut keep the lower token id.
pub fn top_k_filter_inplace<S>(row: &mut ArrayBase<S, Ix1>, k: usize)
where
    S: DataMut<Elem = f32>,
{
    if k == 0 || k >= row.len() {
        return;
    }
    let mut indices: Vec<usize> = (0..row.len()).collect();
    indices.sort_unstable_by(|&a, &b| {
        row[b].partial_cmp(&row[a]).unwrap().then(a.cmp(&b))
    });
    for &idx in &indices[k..] {
        row[idx] = f32::NEG_INFINITY;
    }
}

/// Masks to `-inf` everything outside the smallest prefix of the
/// probability-sorted vocabulary whose cumulative probability reaches `p`.
/// Expects `row` to already hold probabilities.
pub fn top_p_filter_inplace<S>(row: &mut ArrayBase<S, Ix1>, p: f32)
where
    S: DataMut<Elem = f32>,
{
    if p >= 1.0 {
        return;
    }
    let mut indices: Vec<usize> = (0..row.len()).collect();
    indices.sort_unstable_by(|&a, &b| {
        row[b].partial_cmp(&row[a]).unwrap().then(a.cmp(&b))
    });

    let mut cumulative = 0.0;
    let mut cut = indices.len();
    for (i, &idx) in indices.iter().enumerate() {
        cumulative += row[idx];
        if cumulative >= p {
            cut = i + 1;
            break;
        }
    }
    for &idx in &indices[cut..] {
        row[idx] = f32::NEG_INFINITY;
    }
}

/// Draws one token from a probability row. Entries masked to `-inf` must
/// have been renormalized away before calling.
pub fn sample_from_probs<S, R>(probs: &ArrayBase<S, Ix1>, rng: &mut R) -> u32
where
    S: ndarray::Data<Elem = f32>,
    R: Rng,
{
    let uniform: f32 = rng.r#gen();
    let mut cumulative = 0.0;
    let mut last_nonzero = 0;
    for (idx, &prob) in probs.iter().enumerate() {
        if prob > 0.0 {
            last_nonzero = idx;
        }
        cumulative += prob;
        if cumulative >= uniform {
            return idx as u32;
        }
    }
    last_nonzero as u32
}

/// Sign-aware repetition penalty over the distinct tokens of `sequence`.
///
/// Scores below zero are multiplied by the penalty, scores at or above zero
/// divided. Each distinct token is penalized once regardless of how often it
/// occurs.
pub fn apply_repetition_penalty_inplace<S>(
    row: &mut ArrayBase<S, Ix1>,
    sequence: &[u32],
    penalty: f32,
) where
    S: DataMut<Elem = f32>,
{
    if penalty == 1.0 {
        return;
    }
    let unique: HashSet<u32> = sequence.iter().copied().collect();
    for token in unique {
        let idx = token as usize;
        if idx < row.len() {
            let score = row[idx];
            row[idx] = if score < 0.0 {
                score * penalty
            } else {
                score / penalty
            };
        }
    }
}
