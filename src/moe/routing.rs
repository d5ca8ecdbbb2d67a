//! Sort/unsort coordination for expert dispatch.
//!
//! An expert-routed batch arrives as N = batch * tokens * slots
//! (token, slot) pairs with arbitrary expert assignments. Grouping same-expert
//! pairs contiguously turns the irregular computation into a handful of large
//! GEMMs, one per expert run. The reordering must be a pure permutation: every
//! pair appears exactly once in the sorted intermediate and lands back at its
//! original coordinate on the way out.

use crate::tensor::Tensor2;
use ndarray::ArrayView2;

/// Below this many (token, slot) pairs the sort overhead outweighs the
/// benefit of contiguous runs and dispatch runs in original order. A fixed
/// heuristic, not a derived optimum; blocks expose it as a tunable.
pub const DEFAULT_SORT_THRESHOLD: usize = 64;

/// Stable argsort: a permutation `order` such that `values[order]` is
/// non-decreasing, ties keeping their original relative position.
pub fn stable_argsort(values: &[usize]) -> Vec<usize> {
    let mut order: Vec<usize> = (0..values.len()).collect();
    order.sort_by_key(|&i| values[i]);
    order
}

/// Inverse permutation: inverse[order[i]] == i for all i.
pub fn inverse_permutation(order: &[usize]) -> Vec<usize> {
    let mut inverse = vec![0usize; order.len()];
    for (i, &o) in order.iter().enumerate() {
        inverse[o] = i;
    }
    inverse
}

/// One logical unit of expert work per (token, slot) pair: row i of the
/// returned activation matrix is the token row for pair i. In original order
/// pair i belongs to token i / slots_per_token.
pub fn expand_rows(x_tokens: ArrayView2<f32>, n: usize, slots_per_token: usize) -> Tensor2 {
    let mut rows = Tensor2::zeros((n, x_tokens.ncols()));
    for i in 0..n {
        rows.row_mut(i).assign(&x_tokens.row(i / slots_per_token));
    }
    rows
}

/// Reorder (token, slot) pairs so equal expert indices become contiguous.
///
/// x_tokens: (batch * tokens, features); flat_indices: one expert id per
/// (token, slot) pair in original order. Returns the gathered activation
/// rows, the sorted expert ids, and the inverse permutation `scatter_unsort`
/// needs to restore original order.
pub fn gather_sort(
    x_tokens: ArrayView2<f32>,
    flat_indices: &[usize],
    slots_per_token: usize,
) -> (Tensor2, Vec<usize>, Vec<usize>) {
    let order = stable_argsort(flat_indices);
    let inv_order = inverse_permutation(&order);

    let mut rows = Tensor2::zeros((flat_indices.len(), x_tokens.ncols()));
    let mut sorted_indices = Vec::with_capacity(flat_indices.len());
    for (i, &o) in order.iter().enumerate() {
        rows.row_mut(i).assign(&x_tokens.row(o / slots_per_token));
        sorted_indices.push(flat_indices[o]);
    }

    (rows, sorted_indices, inv_order)
}

/// Undo `gather_sort`: row j of the result is the sorted row inv_order[j],
/// restoring original (token, slot) order.
pub fn scatter_unsort(y_sorted: &Tensor2, inv_order: &[usize]) -> Tensor2 {
    let mut y = Tensor2::zeros(y_sorted.dim());
    for (j, &src) in inv_order.iter().enumerate() {
        y.row_mut(j).assign(&y_sorted.row(src));
    }
    y
}

/// Prepared dispatch state for one forward call: the per-pair activation
/// rows, the (possibly sorted) expert ids to feed the indexed matmuls, and
/// whatever is needed to restore original order afterwards. Transient; built
/// and consumed within a single forward pass.
pub struct Dispatch {
    /// Activation rows, one per (token, slot) pair: (n, features)
    pub x_rows: Tensor2,
    /// Expert id per row, aligned with `x_rows`.
    pub indices: Vec<usize>,
    inv_order: Option<Vec<usize>>,
}

impl Dispatch {
    /// Sort when the pair count reaches `sort_threshold`, otherwise keep
    /// original order. Both paths produce numerically identical results
    /// downstream; only the grouping differs.
    pub fn prepare(
        x_tokens: ArrayView2<f32>,
        flat_indices: &[usize],
        slots_per_token: usize,
        sort_threshold: usize,
    ) -> Self {
        if flat_indices.len() >= sort_threshold {
            let (x_rows, indices, inv_order) = gather_sort(x_tokens, flat_indices, slots_per_token);
            Dispatch {
                x_rows,
                indices,
                inv_order: Some(inv_order),
            }
        } else {
            Dispatch {
                x_rows: expand_rows(x_tokens, flat_indices.len(), slots_per_token),
                indices: flat_indices.to_vec(),
                inv_order: None,
            }
        }
    }

    /// Whether `indices` is sorted, i.e. whether the indexed matmuls may
    /// assume contiguous runs.
    pub fn is_sorted(&self) -> bool {
        self.inv_order.is_some()
    }

    /// Restore original (token, slot) order on the computed output.
    pub fn finish(self, y: Tensor2) -> Tensor2 {
        match self.inv_order {
            Some(inv_order) => scatter_unsort(&y, &inv_order),
            None => y,
        }
    }
}
