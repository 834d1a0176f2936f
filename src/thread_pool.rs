//! Dedicated worker pools for fold-level and candidate-level parallelism.
//!
//! Each parallel stage gets its own pool sized by its `n_jobs` setting, so a
//! sequential outer loop (one worker) can still drive a wide inner stage.

use crate::structs::{DecodeError, Result};
use rayon::ThreadPool;

/// Build a pool with `n_jobs` workers; 0 means one worker per logical CPU
///
/// # Errors
/// Returns `Config` error if the pool cannot be created
pub fn build(n_jobs: usize) -> Result<ThreadPool> {
    rayon::ThreadPoolBuilder::new()
        .num_threads(n_jobs)
        .thread_name(|i| format!("decode-worker-{i}"))
        .build()
        .map_err(|e| DecodeError::Config(format!("Failed to build worker pool: {e}")))
}

/// Run `op` inside a fresh pool of `n_jobs` workers
///
/// # Errors
/// Returns error if the pool cannot be created or `op` fails
pub fn install<OP, R>(n_jobs: usize, op: OP) -> Result<R>
where
    OP: FnOnce() -> Result<R> + Send,
    R: Send,
{
    build(n_jobs)?.install(op)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rayon::prelude::*;

    #[test]
    fn test_install_runs_in_pool() {
        let threads = install(2, || Ok(rayon::current_num_threads())).expect("pool");
        assert_eq!(threads, 2);
    }

    #[test]
    fn test_install_propagates_error() {
        let result: Result<Vec<usize>> = install(3, || {
            (0..10usize)
                .into_par_iter()
                .map(|i| {
                    if i == 7 {
                        Err(DecodeError::Ml("boom".into()))
                    } else {
                        Ok(i)
                    }
                })
                .collect()
        });
        assert!(result.is_err());
    }
}
