//! Bounded-parallel fan-out over per-sub work.
//!
//! Two flavors: `do_in_parallel` propagates the first failure once the
//! in-flight batch drains, `run_all` always returns every per-item result so
//! callers can aggregate (the merge-conflict report needs all of them).

use rayon::prelude::*;

use crate::error::{MetaError, Result};

pub const DEFAULT_CONCURRENCY: usize = 8;

fn pool(concurrency: usize) -> Result<rayon::ThreadPool> {
    rayon::ThreadPoolBuilder::new()
        .num_threads(concurrency.max(1))
        .build()
        .map_err(|e| MetaError::Internal(format!("failed to build worker pool: {e}")))
}

/// Run `f(index, item)` for every item with at most `concurrency` running at
/// once. The result vector preserves item order. On failure, tasks already
/// started run to completion, no new work begins, and one failure is
/// returned.
pub fn do_in_parallel<T, R, F>(items: Vec<T>, concurrency: usize, f: F) -> Result<Vec<R>>
where
    T: Send,
    R: Send,
    F: Fn(usize, T) -> Result<R> + Sync,
{
    if items.is_empty() {
        return Ok(Vec::new());
    }
    pool(concurrency)?.install(|| {
        items
            .into_par_iter()
            .enumerate()
            .map(|(i, item)| f(i, item))
            .collect()
    })
}

/// Like `do_in_parallel` but never short-circuits: every item's outcome is
/// returned, in item order.
pub fn run_all<T, R, F>(items: Vec<T>, concurrency: usize, f: F) -> Vec<Result<R>>
where
    T: Send,
    R: Send,
    F: Fn(usize, T) -> Result<R> + Sync,
{
    if items.is_empty() {
        return Vec::new();
    }
    let pool = match pool(concurrency) {
        Ok(pool) => pool,
        Err(e) => return vec![Err(e)],
    };
    pool.install(|| {
        items
            .into_par_iter()
            .enumerate()
            .map(|(i, item)| f(i, item))
            .collect()
    })
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    #[test]
    fn results_preserve_item_order() {
        let out = do_in_parallel((0..32).collect(), 4, |i, item: i32| {
            assert_eq!(i as i32, item);
            Ok(item * 2)
        })
        .unwrap();
        assert_eq!(out, (0..32).map(|i| i * 2).collect::<Vec<_>>());
    }

    #[test]
    fn first_failure_propagates_after_drain() {
        let ran = AtomicUsize::new(0);
        let err = do_in_parallel((0..16).collect(), 2, |_, item: i32| {
            ran.fetch_add(1, Ordering::SeqCst);
            if item == 3 {
                Err(MetaError::Internal("boom".to_string()))
            } else {
                Ok(item)
            }
        })
        .unwrap_err();
        assert!(matches!(err, MetaError::Internal(_)));
        assert!(ran.load(Ordering::SeqCst) >= 1);
    }

    #[test]
    fn run_all_reports_every_outcome() {
        let results = run_all(vec!["a", "b", "c"], 8, |_, item| {
            if item == "b" {
                Err(MetaError::SubHeadMissing(item.to_string()))
            } else {
                Ok(item.to_uppercase())
            }
        });
        assert_eq!(results.len(), 3);
        assert!(results[0].is_ok());
        assert!(results[1].is_err());
        assert!(results[2].is_ok());
    }

    #[test]
    fn empty_input_is_a_no_op() {
        let out: Vec<u8> = do_in_parallel(Vec::<u8>::new(), 8, |_, b| Ok(b)).unwrap();
        assert!(out.is_empty());
    }
}
