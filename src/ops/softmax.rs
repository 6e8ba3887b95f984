//! Numerically stable softmax and its vector-Jacobian product.

/// `p_i = exp(z_i - m) / Σ_j exp(z_j - m)` with `m = max(z)`.
pub fn forward(logits: &[f32]) -> Vec<f32> {
    let m = logits.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    let exps: Vec<f32> = logits.iter().map(|z| (z - m).exp()).collect();
    let sum: f32 = exps.iter().sum();
    exps.into_iter().map(|e| e / sum).collect()
}

/// `log Σ exp(z_i)`, max-subtracted.
pub fn log_sum_exp(logits: &[f32]) -> f32 {
    let m = logits.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    m + logits.iter().map(|z| (z - m).exp()).sum::<f32>().ln()
}

/// `grad_k = Σ_i g_i J_ik` with `J_ii = p_i(1 - p_i)` and `J_ij = -p_i p_j`.
///
/// Expanding the sum gives `grad_k = p_k (g_k - Σ_i g_i p_i)`, which is what
/// is evaluated here so the `k × k` Jacobian is never materialized.
pub fn vjp(probabilities: &[f32], upstream: &[f32]) -> Vec<f32> {
    let dot: f32 = probabilities.iter().zip(upstream.iter()).map(|(p, g)| p * g).sum();
    probabilities.iter().zip(upstream.iter()).map(|(p, g)| p * (g - dot)).collect()
}
