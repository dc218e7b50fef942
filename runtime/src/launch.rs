//! Launch-geometry resolution.
//!
//! Callers describe a launch with up to three 2-D extents: total instances
//! `n`, block size `ls` and grid size `gs`, where `0` means "unspecified".
//! Each dimension follows these rules:
//!
//! | given          | local                 | grid               |
//! |----------------|-----------------------|--------------------|
//! | `ls`, `gs`     | `ls`                  | `gs` (`n` ignored) |
//! | `n`, `ls`      | `ls`                  | `ceil(n / ls)`     |
//! | `n`, `gs`      | `ceil(n / gs)`        | `gs`               |
//! | `n`            | backend hint          | `ceil(n / local)`  |
//! | `ls`           | `ls`                  | 1                  |
//! | `gs`           | 1                     | `gs`               |
//! | nothing        | 1                     | 1                  |
//!
//! Hinted dimensions share one block budget: the hint for a dimension is
//! told how many block instances remain after the fixed dimensions and the
//! hints before it, so the heuristic alone never builds an oversized block.
//! Sizes the caller fixes are used as given.
//!
//! Rounding up means more instances than requested may run; kernels guard
//! against indices past `n` themselves.

use skein_device::LaunchDims;
use crate::error::{InvalidArgumentSnafu, Result};

/// Resolve a launch request.
///
/// `max_block` is the device's limit on instances per block.
/// `hint(dim, n, budget)` supplies the block size when only `n` is known for
/// `dim`; `budget` is what is left of `max_block` at that point.
pub fn resolve(
    n: [usize; 2],
    ls: [usize; 2],
    gs: [usize; 2],
    max_block: usize,
    mut hint: impl FnMut(usize, usize, usize) -> Result<usize>,
) -> Result<LaunchDims> {
    let fixed = [fixed_dim(n[0], ls[0], gs[0]), fixed_dim(n[1], ls[1], gs[1])];
    let mut budget = fixed.iter().flatten().fold(max_block.max(1), |left, &(local, _)| (left / local).max(1));

    let mut dims = LaunchDims::default();
    for dim in 0..2 {
        let (local, grid) = match fixed[dim] {
            Some(resolved) => resolved,
            None => {
                let local = hint(dim, n[dim], budget)?;
                snafu::ensure!(local != 0, InvalidArgumentSnafu { reason: "block size heuristic returned 0" });
                budget = (budget / local).max(1);
                (local, n[dim].div_ceil(local))
            }
        };
        snafu::ensure!(
            local.checked_mul(grid).is_some(),
            InvalidArgumentSnafu { reason: format!("dimension {dim}: {local} x {grid} instances overflow") }
        );
        dims.local[dim] = local;
        dims.grid[dim] = grid;
    }

    snafu::ensure!(
        dims.instances(0).checked_mul(dims.instances(1)).is_some(),
        InvalidArgumentSnafu { reason: "total instance count overflows" }
    );
    Ok(dims)
}

/// Geometry of a dimension that needs no hint; `None` when only `n` is given.
fn fixed_dim(n: usize, ls: usize, gs: usize) -> Option<(usize, usize)> {
    let resolved = match (n, ls, gs) {
        (0, 0, 0) => (1, 1),
        (0, ls, 0) => (ls, 1),
        (0, 0, gs) => (1, gs),
        (_, 0, 0) => return None,
        (n, ls, 0) => (ls, n.div_ceil(ls)),
        (n, 0, gs) => (n.div_ceil(gs), gs),
        (_, ls, gs) => (ls, gs),
    };
    Some(resolved)
}
