//! The persisted benchmark log.
//!
//! One fixed-layout record per benchmark invocation, keyed by
//! `(scale, edge_factor, mpi_size)`. The `LOGFILE` environment variable
//! names the file; when it is absent nothing is persisted. A resumed run
//! must match the stored key exactly, then skips the roots already
//! recorded. Each completed root rewrites the file through a sibling
//! temporary and a rename.

use std::env;
use std::fs;
use std::path::PathBuf;

use zerocopy::{AsBytes, FromBytes, FromZeroes};

use crate::error::{BfsError, Result};
use crate::params::NUM_BFS_ROOTS;

/// Environment variable naming the log file.
pub const LOGFILE_ENV: &str = "LOGFILE";

/// Per-root measurements.
#[derive(AsBytes, FromBytes, FromZeroes, Clone, Copy, Debug, Default, PartialEq)]
#[repr(C)]
pub struct RootTimes {
    /// BFS wall time in seconds.
    pub bfs_time: f64,
    /// Validation wall time in seconds.
    pub validate_time: f64,
    /// Edges traversed, as a double for the benchmark report.
    pub edge_counts: f64,
}

/// The on-disk record.
#[derive(AsBytes, FromBytes, FromZeroes, Clone, Copy, Debug)]
#[repr(C)]
pub struct LogRecord {
    /// Problem scale (log2 of the vertex count).
    pub scale: i32,
    /// Edges per vertex.
    pub edge_factor: i32,
    /// Total ranks of the run.
    pub mpi_size: i32,
    /// Roots completed so far.
    pub num_runs: i32,
    /// Edge-generation wall time.
    pub generation_time: f64,
    /// Graph-construction wall time.
    pub construction_time: f64,
    /// Edge-redistribution wall time.
    pub redistribution_time: f64,
    /// Per-root measurements, `num_runs` of them valid.
    pub times: [RootTimes; NUM_BFS_ROOTS],
}

impl LogRecord {
    fn fresh(scale: i32, edge_factor: i32, mpi_size: i32) -> Self {
        Self {
            scale,
            edge_factor,
            mpi_size,
            num_runs: 0,
            generation_time: 0.0,
            construction_time: 0.0,
            redistribution_time: 0.0,
            times: [RootTimes::default(); NUM_BFS_ROOTS],
        }
    }
}

/// Handle on the (possibly absent) benchmark log.
#[derive(Debug)]
pub struct RunLog {
    path: Option<PathBuf>,
    record: LogRecord,
}

impl RunLog {
    /// Opens the log named by `LOGFILE`. Returns the handle and the index
    /// of the first root still to run. A log whose key mismatches the
    /// current run is a fatal error.
    pub fn open(scale: i32, edge_factor: i32, mpi_size: i32) -> Result<(Self, usize)> {
        let path = env::var_os(LOGFILE_ENV).map(PathBuf::from);
        Self::open_at(path, scale, edge_factor, mpi_size)
    }

    /// As [`RunLog::open`] with an explicit path (tests).
    pub fn open_at(
        path: Option<PathBuf>,
        scale: i32,
        edge_factor: i32,
        mpi_size: i32,
    ) -> Result<(Self, usize)> {
        let Some(path) = path else {
            return Ok((
                Self {
                    path: None,
                    record: LogRecord::fresh(scale, edge_factor, mpi_size),
                },
                0,
            ));
        };
        if !path.exists() {
            return Ok((
                Self {
                    path: Some(path),
                    record: LogRecord::fresh(scale, edge_factor, mpi_size),
                },
                0,
            ));
        }
        let bytes = fs::read(&path)?;
        let record = LogRecord::read_from(bytes.as_slice()).ok_or_else(|| {
            BfsError::Validation(format!("run log {} is malformed", path.display()))
        })?;
        check_field("scale", i64::from(scale), i64::from(record.scale))?;
        check_field(
            "edge_factor",
            i64::from(edge_factor),
            i64::from(record.edge_factor),
        )?;
        check_field("mpi_size", i64::from(mpi_size), i64::from(record.mpi_size))?;
        let resume = record.num_runs.clamp(0, NUM_BFS_ROOTS as i32) as usize;
        Ok((
            Self {
                path: Some(path),
                record,
            },
            resume,
        ))
    }

    /// Stores the build-phase timings.
    pub fn set_build_times(&mut self, generation: f64, construction: f64, redistribution: f64) {
        self.record.generation_time = generation;
        self.record.construction_time = construction;
        self.record.redistribution_time = redistribution;
    }

    /// Records one completed root and persists the log.
    pub fn record_run(&mut self, times: RootTimes) -> Result<()> {
        let idx = self.record.num_runs.clamp(0, NUM_BFS_ROOTS as i32 - 1) as usize;
        self.record.times[idx] = times;
        self.record.num_runs += 1;
        self.persist()
    }

    /// Per-root measurements recorded so far.
    pub fn completed(&self) -> &[RootTimes] {
        &self.record.times[..self.record.num_runs.clamp(0, NUM_BFS_ROOTS as i32) as usize]
    }

    fn persist(&self) -> Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let tmp = path.with_extension("tmp");
        fs::write(&tmp, self.record.as_bytes())?;
        fs::rename(&tmp, path)?;
        Ok(())
    }
}

fn check_field(field: &'static str, expected: i64, found: i64) -> Result<()> {
    if expected != found {
        return Err(BfsError::LogMismatch {
            field,
            expected,
            found,
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn absent_env_means_no_log() {
        let (log, resume) = RunLog::open_at(None, 10, 16, 4).unwrap();
        assert_eq!(resume, 0);
        assert!(log.path.is_none());
    }

    #[test]
    fn resume_counts_completed_roots() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bench.log");
        let (mut log, resume) = RunLog::open_at(Some(path.clone()), 10, 16, 4).unwrap();
        assert_eq!(resume, 0);
        for i in 0..3 {
            log.record_run(RootTimes {
                bfs_time: f64::from(i),
                validate_time: 0.0,
                edge_counts: 100.0,
            })
            .unwrap();
        }
        let (log2, resume2) = RunLog::open_at(Some(path), 10, 16, 4).unwrap();
        assert_eq!(resume2, 3);
        assert_eq!(log2.completed().len(), 3);
        assert_eq!(log2.completed()[2].bfs_time, 2.0);
    }

    #[test]
    fn key_mismatch_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bench.log");
        let (mut log, _) = RunLog::open_at(Some(path.clone()), 10, 16, 4).unwrap();
        log.record_run(RootTimes::default()).unwrap();
        let err = RunLog::open_at(Some(path), 11, 16, 4).unwrap_err();
        assert!(matches!(err, BfsError::LogMismatch { field: "scale", .. }));
    }
}
