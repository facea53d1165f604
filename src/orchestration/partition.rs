//! Shard selection over sorted application ids

use crate::error::{EvalError, Result};

/// Number of groups of `group_size` needed to cover `total` items
pub fn total_groups(total: usize, group_size: usize) -> Result<usize> {
    if group_size == 0 {
        return Err(EvalError::InvalidArgument(
            "group_size must be greater than zero".to_string(),
        ));
    }
    Ok(total.div_ceil(group_size))
}

/// Contiguous zero-based group `group_index`; empty when out of range
pub fn select_group<T: Clone>(items: &[T], group_size: usize, group_index: usize) -> Result<Vec<T>> {
    if group_size == 0 {
        return Err(EvalError::InvalidArgument(
            "group_size must be greater than zero".to_string(),
        ));
    }
    let start = group_index.saturating_mul(group_size);
    if start >= items.len() {
        return Ok(Vec::new());
    }
    let end = start.saturating_add(group_size).min(items.len());
    Ok(items[start..end].to_vec())
}
