//! Native toolchain driver.
//!
//! Generated units go through the configured compiler on a bounded rayon
//! pool. The first failure stops every job that has not started yet, and its
//! captured output is returned to the caller.

use crate::cache::SourceEntry;
use crate::error::{CompileResult, CompilerError, ERR_TOOLCHAIN};
use rayon::prelude::*;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

#[derive(Debug, Clone, PartialEq)]
pub struct CompileJob {
    pub source: PathBuf,
    pub object: PathBuf,
}

impl CompileJob {
    /// Jobs for the entries whose object is stale: the source was rewritten,
    /// or the object file is missing.
    pub fn plan(entries: &[SourceEntry], obj_dir: &Path) -> Vec<CompileJob> {
        entries
            .iter()
            .filter(|entry| crate::cache::is_compilable(&entry.path))
            .filter_map(|entry| {
                let stem = entry.path.file_stem()?.to_string_lossy().into_owned();
                let object = obj_dir.join(format!("{}.o", stem));
                if entry.compile || !object.exists() {
                    Some(CompileJob {
                        source: entry.path.clone(),
                        object,
                    })
                } else {
                    None
                }
            })
            .collect()
    }
}

pub struct Toolchain {
    compiler: String,
    cflags: Vec<String>,
    jobs: usize,
    launched: AtomicUsize,
}

impl Toolchain {
    /// `jobs` of 0 sizes the pool to the CPU count.
    pub fn new(compiler: &str, cflags: &[String], jobs: usize) -> Self {
        let jobs = if jobs == 0 {
            rayon::current_num_threads()
        } else {
            jobs
        };
        Self {
            compiler: compiler.to_string(),
            cflags: cflags.to_vec(),
            jobs,
            launched: AtomicUsize::new(0),
        }
    }

    pub fn jobs(&self) -> usize {
        self.jobs
    }

    /// Compiler processes started so far.
    pub fn launched(&self) -> usize {
        self.launched.load(Ordering::SeqCst)
    }

    /// Compiles every job and joins them all before returning the object
    /// paths in job order.
    pub fn compile_all(&self, jobs: &[CompileJob]) -> CompileResult<Vec<PathBuf>> {
        if jobs.is_empty() {
            return Ok(Vec::new());
        }
        log::info!(
            "[Hyperloop] compiling {} unit(s) with {} job(s)",
            jobs.len(),
            self.jobs
        );

        let failed = AtomicBool::new(false);
        let run = |job: &CompileJob| -> Option<CompileResult<PathBuf>> {
            if failed.load(Ordering::SeqCst) {
                return None;
            }
            let result = self.compile_one(job);
            if result.is_err() {
                failed.store(true, Ordering::SeqCst);
            }
            Some(result)
        };

        let results: Vec<Option<CompileResult<PathBuf>>> =
            match rayon::ThreadPoolBuilder::new().num_threads(self.jobs).build() {
                Ok(pool) => pool.install(|| jobs.par_iter().map(run).collect()),
                Err(e) => {
                    log::warn!("[Hyperloop] failed to create compile pool ({}), running sequentially", e);
                    jobs.iter().map(run).collect()
                }
            };

        let mut objects = Vec::with_capacity(results.len());
        for result in results.into_iter().flatten() {
            objects.push(result?);
        }
        Ok(objects)
    }

    fn compile_one(&self, job: &CompileJob) -> CompileResult<PathBuf> {
        if let Some(parent) = job.object.parent() {
            std::fs::create_dir_all(parent)?;
        }
        self.launched.fetch_add(1, Ordering::SeqCst);
        log::debug!("[Hyperloop] compiling {}", job.source.display());

        let output = Command::new(&self.compiler)
            .args(&self.cflags)
            .arg("-c")
            .arg(&job.source)
            .arg("-o")
            .arg(&job.object)
            .output()
            .map_err(|e| {
                CompilerError::bare(
                    ERR_TOOLCHAIN,
                    &format!("failed to launch compiler '{}': {}", self.compiler, e),
                )
                .at(&job.source.to_string_lossy(), 1, 1)
            })?;

        if !output.status.success() {
            let mut captured = String::from_utf8_lossy(&output.stderr).into_owned();
            if captured.trim().is_empty() {
                captured = String::from_utf8_lossy(&output.stdout).into_owned();
            }
            return Err(CompilerError::bare(
                ERR_TOOLCHAIN,
                &format!(
                    "compiler exited with {} for {}",
                    output.status,
                    job.source.display()
                ),
            )
            .at(&job.source.to_string_lossy(), 1, 1)
            .with_context(captured));
        }
        Ok(job.object.clone())
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    fn jobs(dir: &Path, n: usize) -> Vec<CompileJob> {
        (0..n)
            .map(|i| CompileJob {
                source: dir.join(format!("unit{}.cpp", i)),
                object: dir.join("obj").join(format!("unit{}.o", i)),
            })
            .collect()
    }

    #[test]
    fn test_all_jobs_succeed() {
        let dir = tempfile::tempdir().unwrap();
        let toolchain = Toolchain::new("true", &[], 4);
        let objects = toolchain.compile_all(&jobs(dir.path(), 6)).unwrap();
        assert_eq!(objects.len(), 6);
        assert_eq!(objects[2], dir.path().join("obj").join("unit2.o"));
        assert_eq!(toolchain.launched(), 6);
    }

    #[test]
    fn test_failure_stops_queued_jobs() {
        let dir = tempfile::tempdir().unwrap();
        let toolchain = Toolchain::new("false", &[], 1);
        let err = toolchain.compile_all(&jobs(dir.path(), 10)).unwrap_err();
        assert_eq!(err.code, ERR_TOOLCHAIN);
        assert!(err.file.ends_with("unit0.cpp"));
        assert_eq!(toolchain.launched(), 1);
    }

    #[test]
    fn test_captured_stderr_in_context() {
        let dir = tempfile::tempdir().unwrap();
        let flags = vec!["-c".to_string(), "echo 'bad token' >&2; exit 2".to_string()];
        let toolchain = Toolchain::new("sh", &flags, 1);
        let err = toolchain.compile_all(&jobs(dir.path(), 1)).unwrap_err();
        assert!(err.context.as_deref().unwrap_or("").contains("bad token"));
    }

    #[test]
    fn test_missing_compiler() {
        let dir = tempfile::tempdir().unwrap();
        let toolchain = Toolchain::new("/nonexistent/hl-cc", &[], 1);
        let err = toolchain.compile_all(&jobs(dir.path(), 1)).unwrap_err();
        assert_eq!(err.code, ERR_TOOLCHAIN);
    }

    #[test]
    fn test_plan_skips_fresh_objects() {
        let dir = tempfile::tempdir().unwrap();
        let obj = dir.path().join("obj");
        std::fs::create_dir_all(&obj).unwrap();
        std::fs::write(obj.join("fresh.o"), "").unwrap();

        let entries = vec![
            SourceEntry { path: dir.path().join("fresh.cpp"), hash: "a".into(), compile: false },
            SourceEntry { path: dir.path().join("missing.cpp"), hash: "b".into(), compile: false },
            SourceEntry { path: dir.path().join("changed.cpp"), hash: "c".into(), compile: true },
            SourceEntry { path: dir.path().join("hyperloop.h"), hash: "d".into(), compile: true },
        ];
        let planned: Vec<String> = CompileJob::plan(&entries, &obj)
            .iter()
            .map(|job| job.object.file_name().unwrap().to_string_lossy().into_owned())
            .collect();
        assert_eq!(planned, vec!["missing.o", "changed.o"]);
    }
}
