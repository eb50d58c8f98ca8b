//! Parallel executor for multi-file compilation
//!
//! Uses Rayon for work-stealing parallelism with a configurable pool size.
//! Files share nothing but the compiler's read-only fact tables.

use crate::compiler::{Compiler, FileReport};
use crate::error::{Error, Result};
use rayon::prelude::*;
use std::path::PathBuf;

/// Configuration for parallel execution
#[derive(Debug, Clone)]
pub struct ParallelConfig {
    /// Maximum number of parallel tasks (default: num_cpus)
    pub max_parallelism: usize,
    /// Fail fast on the first unreadable file vs report it and keep going
    pub fail_fast: bool,
}

impl Default for ParallelConfig {
    fn default() -> Self {
        Self {
            max_parallelism: num_cpus::get(),
            fail_fast: false,
        }
    }
}

/// Parallel map over a slice, preserving input order
///
/// # Returns
/// * `Ok(Vec<R>)` - One result per item, in input order
/// * `Err(Error)` - An error from the mapper, or the pool could not be built
pub fn parallel_map<T, R, F>(items: &[T], mapper: F, config: &ParallelConfig) -> Result<Vec<R>>
where
    T: Sync,
    R: Send,
    F: Fn(&T) -> Result<R> + Send + Sync,
{
    // Single item - no parallelism needed
    if items.len() <= 1 {
        return items.iter().map(mapper).collect();
    }

    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(config.max_parallelism.clamp(1, items.len()))
        .build()
        .map_err(|e| Error::Config(format!("failed to create thread pool: {}", e)))?;

    pool.install(|| items.par_iter().map(&mapper).collect())
}

/// Compile every file, one report per path in input order
///
/// With `fail_fast` an unreadable file aborts the batch; otherwise it shows
/// up as a failed report carrying an I/O diagnostic.
pub fn compile_files(
    compiler: &Compiler,
    paths: &[PathBuf],
    config: &ParallelConfig,
) -> Result<Vec<FileReport>> {
    tracing::debug!(
        files = paths.len(),
        threads = config.max_parallelism,
        "compiling files"
    );
    let fail_fast = config.fail_fast;
    parallel_map(
        paths,
        |path| match compiler.compile_file(path) {
            Ok(report) => Ok(report),
            Err(err) if !fail_fast => {
                tracing::warn!(path = %path.display(), error = %err, "source unreadable");
                Ok(FileReport::from_error(&path.display().to_string(), &err))
            }
            Err(err) => Err(err),
        },
        config,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compiler::{CompileOptions, FileStatus};
    use crate::diagnostics::DiagnosticKind;

    #[test]
    fn test_parallel_map_preserves_order() {
        let items: Vec<u64> = (0..64).collect();
        let results = parallel_map(&items, |n| Ok(n * 2), &ParallelConfig::default()).unwrap();
        assert_eq!(results.len(), 64);
        assert!(results.iter().enumerate().all(|(i, r)| *r == i as u64 * 2));
    }

    #[test]
    fn test_parallel_map_empty() {
        let items: Vec<u64> = vec![];
        let results = parallel_map(&items, |n| Ok(*n), &ParallelConfig::default()).unwrap();
        assert!(results.is_empty());
    }

    #[test]
    fn test_parallel_map_error() {
        let items = vec![1i64, -1, 3];
        let result = parallel_map(
            &items,
            |n| {
                if *n < 0 {
                    Err(Error::Config(format!("negative item {}", n)))
                } else {
                    Ok(*n)
                }
            },
            &ParallelConfig::default(),
        );
        assert!(matches!(result, Err(Error::Config(_))));
    }

    #[test]
    fn test_unreadable_file_collected() {
        let compiler = Compiler::new(CompileOptions::default());
        let paths = vec![
            PathBuf::from("/nonexistent/a.bpf.c"),
            PathBuf::from("/nonexistent/b.bpf.c"),
        ];

        let reports = compile_files(&compiler, &paths, &ParallelConfig::default()).unwrap();
        assert_eq!(reports.len(), 2);
        assert_eq!(reports[0].file, "/nonexistent/a.bpf.c");
        assert_eq!(reports[1].status, FileStatus::Failure);
        assert_eq!(reports[1].diagnostics[0].kind, DiagnosticKind::Io);

        let config = ParallelConfig {
            fail_fast: true,
            ..Default::default()
        };
        assert!(matches!(
            compile_files(&compiler, &paths, &config),
            Err(Error::Io { .. })
        ));
    }
}
