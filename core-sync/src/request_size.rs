//! Outbound request splitting for task imports.
//!
//! The central service rejects request bodies above [`MAX_PAYLOAD_SIZE`]
//! bytes. Task lists are cut into contiguous slices, growing the slice count
//! until every serialized slice fits.

use crate::error::{Result, SyncError};
use crate::models::{Task, TaskRequest};

/// Largest accepted request body in bytes.
pub const MAX_PAYLOAD_SIZE: usize = 800_000;

/// `{"tasks":[]}`
const ENVELOPE_SIZE: usize = 12;

/// Split `tasks` into requests that each serialize to at most
/// [`MAX_PAYLOAD_SIZE`] bytes, starting from `split` slices.
///
/// Empty slices are omitted; the last slice absorbs the remainder.
///
/// # Errors
///
/// [`SyncError::PayloadTooLarge`] when a single task alone exceeds the limit.
pub fn adjust_request_size(tasks: &[Task], split: usize) -> Result<Vec<TaskRequest>> {
    adjust_request_size_with_limit(tasks, split, MAX_PAYLOAD_SIZE)
}

pub(crate) fn adjust_request_size_with_limit(
    tasks: &[Task],
    split: usize,
    limit: usize,
) -> Result<Vec<TaskRequest>> {
    if tasks.is_empty() {
        return Ok(Vec::new());
    }

    let sizes = tasks
        .iter()
        .map(|task| serde_json::to_vec(task).map(|bytes| bytes.len()))
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| SyncError::UpstreamCallFailed(format!("failed to serialize tasks: {}", e)))?;

    if sizes.iter().any(|size| ENVELOPE_SIZE + size > limit) {
        return Err(SyncError::PayloadTooLarge { limit });
    }

    let mut split = split.max(1);
    loop {
        let bounds = partition(tasks.len(), split);
        let fits = bounds
            .iter()
            .all(|&(start, end)| slice_size(&sizes[start..end]) <= limit);

        if fits {
            return Ok(bounds
                .into_iter()
                .map(|(start, end)| TaskRequest {
                    tasks: tasks[start..end].to_vec(),
                })
                .collect());
        }
        split += 1;
    }
}

/// Non-empty `[start, end)` ranges of `split` contiguous slices over `len`
/// items. Once `split` reaches `len` every item gets its own slice.
fn partition(len: usize, split: usize) -> Vec<(usize, usize)> {
    if split >= len {
        return (0..len).map(|i| (i, i + 1)).collect();
    }

    let chunk = len / split;
    (0..split)
        .map(|i| {
            let start = i * chunk;
            let end = if i == split - 1 { len } else { start + chunk };
            (start, end)
        })
        .collect()
}

fn slice_size(sizes: &[usize]) -> usize {
    if sizes.is_empty() {
        return ENVELOPE_SIZE;
    }
    ENVELOPE_SIZE + sizes.iter().sum::<usize>() + sizes.len() - 1
}
