//! Artifact freshness checks used for memoization.
//!
//! A task's targets are fresh when every target exists and none of them is
//! older than the newest upstream artifact (dependency targets plus declared
//! input files). Fresh tasks are marked cached instead of being executed.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

/// Outcome of a freshness check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Freshness {
    /// All targets exist and are at least as new as every upstream artifact.
    Fresh,
    /// The task must run.
    Stale(StaleReason),
}

impl Freshness {
    /// Returns true if the task can be skipped.
    pub fn is_fresh(&self) -> bool {
        matches!(self, Self::Fresh)
    }
}

/// Why a task must run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StaleReason {
    /// A declared target does not exist.
    MissingTarget(PathBuf),
    /// An upstream artifact is missing, so the age comparison is meaningless.
    MissingUpstream(PathBuf),
    /// A target is older than an upstream artifact.
    OlderThanUpstream { target: PathBuf, upstream: PathBuf },
    /// A dependency was executed during this run.
    UpstreamExecuted,
    /// The ledger recorded different arguments for these targets.
    ArgumentsChanged,
}

impl std::fmt::Display for StaleReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::MissingTarget(p) => write!(f, "target missing: {}", p.display()),
            Self::MissingUpstream(p) => write!(f, "upstream artifact missing: {}", p.display()),
            Self::OlderThanUpstream { target, upstream } => write!(
                f,
                "{} is older than {}",
                target.display(),
                upstream.display()
            ),
            Self::UpstreamExecuted => write!(f, "a dependency was rebuilt"),
            Self::ArgumentsChanged => write!(f, "task arguments changed"),
        }
    }
}

/// Returns the modification time of `path`, or `None` if it does not exist.
pub fn modified_time(path: &Path) -> io::Result<Option<SystemTime>> {
    match fs::metadata(path) {
        Ok(meta) => meta.modified().map(Some),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e),
    }
}

/// Checks whether `targets` are up to date with respect to `upstream`.
///
/// `upstream_executed` short-circuits the comparison: filesystem timestamps
/// can be too coarse to order a rebuilt dependency against an existing
/// target, so a dependency that ran in this session always forces a rerun.
pub fn check(
    targets: &[PathBuf],
    upstream: &[PathBuf],
    upstream_executed: bool,
) -> io::Result<Freshness> {
    let mut oldest_target: Option<(SystemTime, &PathBuf)> = None;
    for target in targets {
        match modified_time(target)? {
            Some(mtime) => {
                if oldest_target.map_or(true, |(oldest, _)| mtime < oldest) {
                    oldest_target = Some((mtime, target));
                }
            }
            None => return Ok(Freshness::Stale(StaleReason::MissingTarget(target.clone()))),
        }
    }

    if upstream_executed {
        return Ok(Freshness::Stale(StaleReason::UpstreamExecuted));
    }

    let mut newest_upstream: Option<(SystemTime, &PathBuf)> = None;
    for path in upstream {
        match modified_time(path)? {
            Some(mtime) => {
                if newest_upstream.map_or(true, |(newest, _)| mtime > newest) {
                    newest_upstream = Some((mtime, path));
                }
            }
            None => return Ok(Freshness::Stale(StaleReason::MissingUpstream(path.clone()))),
        }
    }

    match (oldest_target, newest_upstream) {
        (Some((target_time, target)), Some((upstream_time, upstream)))
            if target_time < upstream_time =>
        {
            Ok(Freshness::Stale(StaleReason::OlderThanUpstream {
                target: target.clone(),
                upstream: upstream.clone(),
            }))
        }
        _ => Ok(Freshness::Fresh),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use filetime::{set_file_mtime, FileTime};
    use tempfile::TempDir;

    fn touch(dir: &TempDir, name: &str, unix_secs: i64) -> PathBuf {
        let path = dir.path().join(name);
        fs::write(&path, name).unwrap();
        set_file_mtime(&path, FileTime::from_unix_time(unix_secs, 0)).unwrap();
        path
    }

    #[test]
    fn test_missing_target_is_stale() {
        let dir = TempDir::new().unwrap();
        let target = dir.path().join("out.tif");
        let result = check(&[target.clone()], &[], false).unwrap();
        assert_eq!(result, Freshness::Stale(StaleReason::MissingTarget(target)));
    }

    #[test]
    fn test_newer_target_is_fresh() {
        let dir = TempDir::new().unwrap();
        let input = touch(&dir, "in.tif", 1_000);
        let target = touch(&dir, "out.tif", 2_000);
        assert!(check(&[target], &[input], false).unwrap().is_fresh());
    }

    #[test]
    fn test_equal_mtime_is_fresh() {
        let dir = TempDir::new().unwrap();
        let input = touch(&dir, "in.tif", 1_500);
        let target = touch(&dir, "out.tif", 1_500);
        assert!(check(&[target], &[input], false).unwrap().is_fresh());
    }

    #[test]
    fn test_older_target_is_stale() {
        let dir = TempDir::new().unwrap();
        let input = touch(&dir, "in.tif", 3_000);
        let fresh = touch(&dir, "a.tif", 4_000);
        let old = touch(&dir, "b.tif", 2_000);

        let result = check(&[fresh, old.clone()], &[input.clone()], false).unwrap();
        assert_eq!(
            result,
            Freshness::Stale(StaleReason::OlderThanUpstream {
                target: old,
                upstream: input
            })
        );
    }

    #[test]
    fn test_upstream_executed_forces_rerun() {
        let dir = TempDir::new().unwrap();
        let target = touch(&dir, "out.tif", 2_000);
        let result = check(&[target], &[], true).unwrap();
        assert_eq!(result, Freshness::Stale(StaleReason::UpstreamExecuted));
    }

    #[test]
    fn test_missing_upstream_is_stale() {
        let dir = TempDir::new().unwrap();
        let target = touch(&dir, "out.tif", 2_000);
        let input = dir.path().join("gone.tif");
        let result = check(&[target], &[input.clone()], false).unwrap();
        assert_eq!(result, Freshness::Stale(StaleReason::MissingUpstream(input)));
    }
}
