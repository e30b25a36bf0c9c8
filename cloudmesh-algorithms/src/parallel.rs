//! Parallel processing utilities for the point-wise pipeline stages
//!
//! Every data-parallel loop in cloudmesh goes through this module so a
//! caller can size the worker pool once, or switch parallelism off
//! entirely when debugging. Without an explicit [`init_thread_pool`] call
//! the work runs on rayon's global pool.

use cloudmesh_core::{Error, Result};
use rayon::prelude::*;
use rayon::{ThreadPool, ThreadPoolBuilder};
use std::sync::{Arc, Mutex, OnceLock};
use tracing::debug;

static GLOBAL_THREAD_POOL: OnceLock<Arc<ThreadPool>> = OnceLock::new();
static THREAD_POOL_CONFIG: Mutex<ThreadPoolConfig> = Mutex::new(ThreadPoolConfig::new());

/// Thread pool configuration for parallel processing
#[derive(Debug, Clone)]
pub struct ThreadPoolConfig {
    /// Number of threads to use (None = automatic)
    pub num_threads: Option<usize>,
    /// Thread stack size in bytes
    pub stack_size: Option<usize>,
    /// Thread name prefix
    pub thread_name_prefix: String,
    /// Enable parallel processing (can be disabled for debugging)
    pub enabled: bool,
    /// Inputs shorter than this run sequentially
    pub min_parallel_len: usize,
}

impl ThreadPoolConfig {
    const fn new() -> Self {
        Self {
            num_threads: None,
            stack_size: None,
            thread_name_prefix: String::new(),
            enabled: true,
            min_parallel_len: 256,
        }
    }

    /// Set number of threads
    pub fn with_threads(mut self, num_threads: usize) -> Self {
        self.num_threads = Some(num_threads);
        self
    }

    /// Set stack size
    pub fn with_stack_size(mut self, stack_size: usize) -> Self {
        self.stack_size = Some(stack_size);
        self
    }

    /// Enable or disable parallel processing
    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    /// Set the sequential cutoff
    pub fn with_min_parallel_len(mut self, len: usize) -> Self {
        self.min_parallel_len = len;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.num_threads == Some(0) {
            return Err(Error::InvalidParameters(
                "thread pool needs at least one thread".to_string(),
            ));
        }
        Ok(())
    }
}

impl Default for ThreadPoolConfig {
    fn default() -> Self {
        Self {
            thread_name_prefix: "cloudmesh".to_string(),
            ..Self::new()
        }
    }
}

/// Initialize the global thread pool with custom configuration.
///
/// Only the first successful call builds a pool; later calls still update
/// the `enabled` flag and the sequential cutoff.
pub fn init_thread_pool(config: ThreadPoolConfig) -> Result<()> {
    config.validate()?;
    if GLOBAL_THREAD_POOL.get().is_none() {
        let mut builder = ThreadPoolBuilder::new();

        if let Some(num_threads) = config.num_threads {
            builder = builder.num_threads(num_threads);
        }

        if let Some(stack_size) = config.stack_size {
            builder = builder.stack_size(stack_size);
        }

        if !config.thread_name_prefix.is_empty() {
            let prefix = config.thread_name_prefix.clone();
            builder = builder.thread_name(move |index| format!("{}-{}", prefix, index));
        }

        let pool = builder.build().map_err(|e| {
            Error::ResourceExhausted(format!("Failed to create thread pool: {}", e))
        })?;
        debug!(threads = pool.current_num_threads(), "Initialized cloudmesh thread pool");

        // A concurrent initializer may have won the race; either pool is fine.
        let _ = GLOBAL_THREAD_POOL.set(Arc::new(pool));
    }

    if let Ok(mut global_config) = THREAD_POOL_CONFIG.lock() {
        *global_config = config;
    }

    Ok(())
}

/// The pool configured through [`init_thread_pool`], if any
pub fn thread_pool() -> Option<Arc<ThreadPool>> {
    GLOBAL_THREAD_POOL.get().cloned()
}

/// Get current thread pool configuration
pub fn get_config() -> ThreadPoolConfig {
    THREAD_POOL_CONFIG
        .lock()
        .map(|config| config.clone())
        .unwrap_or_default()
}

/// Check if parallel processing is enabled
pub fn is_parallel_enabled() -> bool {
    get_config().enabled
}

/// Number of worker threads parallel loops will use
pub fn current_num_threads() -> usize {
    match thread_pool() {
        Some(pool) => pool.current_num_threads(),
        None => rayon::current_num_threads(),
    }
}

/// Execute a parallel operation on the configured pool
pub fn execute_parallel<F, R>(op: F) -> R
where
    F: FnOnce() -> R + Send,
    R: Send,
{
    match thread_pool() {
        Some(pool) => pool.install(op),
        None => op(),
    }
}

/// Parallel map operation; output order matches input order
pub fn parallel_map<T, U, F>(data: &[T], f: F) -> Vec<U>
where
    T: Sync,
    U: Send,
    F: Fn(&T) -> U + Sync + Send,
{
    let config = get_config();
    if !config.enabled || data.len() < config.min_parallel_len {
        return data.iter().map(f).collect();
    }

    execute_parallel(|| data.par_iter().map(f).collect())
}

/// Parallel map with index; output order matches input order
pub fn parallel_map_indexed<T, U, F>(data: &[T], f: F) -> Vec<U>
where
    T: Sync,
    U: Send,
    F: Fn(usize, &T) -> U + Sync + Send,
{
    let config = get_config();
    if !config.enabled || data.len() < config.min_parallel_len {
        return data.iter().enumerate().map(|(i, x)| f(i, x)).collect();
    }

    execute_parallel(|| data.par_iter().enumerate().map(|(i, x)| f(i, x)).collect())
}

/// Apply `f` to consecutive chunks of `data` in place.
///
/// `f` receives the chunk index and the chunk. Chunks never overlap, so the
/// result does not depend on scheduling.
pub fn parallel_chunks_mut<T, F>(data: &mut [T], chunk_size: usize, f: F)
where
    T: Send,
    F: Fn(usize, &mut [T]) + Sync + Send,
{
    let chunk_size = chunk_size.max(1);
    let config = get_config();
    if !config.enabled || data.len() < config.min_parallel_len {
        data.chunks_mut(chunk_size).enumerate().for_each(|(i, c)| f(i, c));
        return;
    }

    execute_parallel(|| {
        data.par_chunks_mut(chunk_size)
            .enumerate()
            .for_each(|(i, c)| f(i, c))
    })
}
