// src/pool.rs

//! Bounded worker pool for the import and relabel phases
//!
//! Work items fan out onto a fixed-size rayon pool and fan back in through
//! a channel. The calling thread blocks until every spawned unit has
//! finished. The first failure sets a cancel flag: units that have not
//! started yet return [`Error::Cancelled`] without running, units already
//! running finish normally, and the first real error is what the caller
//! sees.

use crate::error::{Error, Result};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::mpsc;
use tracing::debug;

/// Fixed-size pool of worker threads
pub struct WorkerPool {
    pool: rayon::ThreadPool,
    size: usize,
}

impl WorkerPool {
    pub fn new(size: usize) -> Result<Self> {
        let size = size.max(1);
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(size)
            .thread_name(|i| format!("treeforge-worker-{}", i))
            .build()
            .map_err(|e| Error::IoError(format!("Failed to start worker pool: {}", e)))?;
        Ok(Self { pool, size })
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Run `f` over `items`, at most `size` at a time
    ///
    /// Results come back in input order. Must not be called from one of
    /// this pool's own threads.
    pub fn run<T, R, F>(&self, what: &str, items: &[T], f: F) -> Result<Vec<R>>
    where
        T: Sync,
        R: Send,
        F: Fn(&T) -> Result<R> + Sync,
    {
        if items.is_empty() {
            return Ok(Vec::new());
        }

        let total = items.len();
        let cancel = AtomicBool::new(false);
        let done = AtomicUsize::new(0);
        let (tx, rx) = mpsc::channel::<(usize, Result<R>)>();

        self.pool.in_place_scope(|s| {
            for (i, item) in items.iter().enumerate() {
                let tx = tx.clone();
                let cancel = &cancel;
                let done = &done;
                let f = &f;
                s.spawn(move |_| {
                    let result = if cancel.load(Ordering::SeqCst) {
                        Err(Error::Cancelled)
                    } else {
                        let r = f(item);
                        if r.is_err() {
                            cancel.store(true, Ordering::SeqCst);
                        }
                        r
                    };
                    let n = done.fetch_add(1, Ordering::SeqCst) + 1;
                    debug!("{}: {}/{} finished", what, n, total);
                    // The receiver outlives the scope
                    let _ = tx.send((i, result));
                });
            }
        });
        drop(tx);

        let mut slots: Vec<Option<R>> = (0..total).map(|_| None).collect();
        let mut first_error: Option<Error> = None;
        for (i, result) in rx {
            match result {
                Ok(r) => slots[i] = Some(r),
                Err(Error::Cancelled) => {}
                Err(e) => {
                    if first_error.is_none() {
                        first_error = Some(e);
                    }
                }
            }
        }

        if let Some(e) = first_error {
            return Err(e);
        }
        slots
            .into_iter()
            .map(|r| r.ok_or(Error::Cancelled))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_results_in_input_order() {
        let pool = WorkerPool::new(4).unwrap();
        let items: Vec<u64> = (0..32).collect();
        let out = pool
            .run("square", &items, |n| {
                std::thread::sleep(Duration::from_millis(32 - *n));
                Ok(n * n)
            })
            .unwrap();
        assert_eq!(out, items.iter().map(|n| n * n).collect::<Vec<_>>());
    }

    #[test]
    fn test_bounded_concurrency() {
        let pool = WorkerPool::new(2).unwrap();
        let active = AtomicUsize::new(0);
        let peak = AtomicUsize::new(0);
        let items: Vec<u32> = (0..10).collect();
        pool.run("bounded", &items, |_| {
            let now = active.fetch_add(1, Ordering::SeqCst) + 1;
            peak.fetch_max(now, Ordering::SeqCst);
            std::thread::sleep(Duration::from_millis(5));
            active.fetch_sub(1, Ordering::SeqCst);
            Ok(())
        })
        .unwrap();
        assert!(peak.load(Ordering::SeqCst) <= 2);
    }

    #[test]
    fn test_first_error_cancels_rest() {
        let pool = WorkerPool::new(1).unwrap();
        let ran = AtomicUsize::new(0);
        let items: Vec<u32> = (0..20).collect();
        let err = pool
            .run("failing", &items, |n| {
                // Whichever unit runs first fails
                if ran.fetch_add(1, Ordering::SeqCst) == 0 {
                    Err(Error::UnsupportedContent("bad".to_string()))
                } else {
                    Ok(*n)
                }
            })
            .unwrap_err();
        assert!(matches!(err, Error::UnsupportedContent(_)));
        assert!(ran.load(Ordering::SeqCst) < items.len());
    }

    #[test]
    fn test_empty_input() {
        let pool = WorkerPool::new(0).unwrap();
        assert_eq!(pool.size(), 1);
        let out: Vec<u8> = pool.run("none", &Vec::<u8>::new(), |_| Ok(0)).unwrap();
        assert!(out.is_empty());
    }
}
