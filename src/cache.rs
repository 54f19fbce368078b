//! Content-addressed build-artifact cache.
//!
//! Tarballs live at `{cache}/{app}-{md5}.tar.gz`; the `build_artifacts`
//! table indexes them by md5, git sha, and version. Every lookup is
//! revalidated by re-hashing the file; a mismatch is a miss, not an error.

use std::io::Read;
use std::path::{Path, PathBuf};
use tracing::warn;

use crate::builder::BuildOutcome;
use crate::db::{AppRow, ArtifactRow, Repository};
use crate::error::{Error, Result};

const MIN_MD5_PREFIX: usize = 10;

/// Directory half of the artifact cache.
pub struct ArtifactCache {
    dir: PathBuf,
}

impl ArtifactCache {
    /// Open (and create) a cache directory.
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    /// Default location under the invoking user's home directory.
    pub fn open_default() -> Result<Self> {
        let home = std::env::var("HOME")
            .map_err(|_| Error::Config("HOME is not set; cannot place build cache".to_string()))?;
        Self::new(Path::new(&home).join(".shipyard").join("build_cache"))
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Register a freshly built tarball: atomically move it into the cache
    /// and index it.
    pub fn put(&self, repo: &Repository, app: &AppRow, outcome: BuildOutcome) -> Result<ArtifactRow> {
        let final_path = self
            .dir
            .join(format!("{}-{}.tar.gz", app.name, outcome.md5));
        outcome
            .tarball
            .persist(&final_path)
            .map_err(|err| Error::Io(err.error))?;
        let git_sha = if outcome.git_sha == "unknown" {
            None
        } else {
            Some(outcome.git_sha.as_str())
        };
        repo.add_artifact(
            &app.id,
            &outcome.version,
            git_sha,
            &outcome.md5,
            &final_path.to_string_lossy(),
        )
    }

    /// Resolve a user-supplied `use_build` identifier: md5 prefix first,
    /// then full git sha. The returned row is validated on disk.
    pub fn lookup_identifier(
        &self,
        repo: &Repository,
        app: &AppRow,
        identifier: &str,
    ) -> Result<ArtifactRow> {
        if identifier.len() >= MIN_MD5_PREFIX && identifier.chars().all(|c| c.is_ascii_hexdigit()) {
            match repo.find_artifact_by_md5_prefix(&app.id, identifier) {
                Ok(row) => return self.validated(row, identifier),
                Err(Error::ArtifactNotFound(_)) => {}
                Err(err) => return Err(err),
            }
        }
        let row = repo.find_artifact_by_git_sha(&app.id, identifier)?;
        self.validated(row, identifier)
    }

    /// Cache lookup for the current clean git sha; any miss or corruption
    /// returns `None` so the caller falls through to a build.
    pub fn lookup_git_sha(&self, repo: &Repository, app: &AppRow, sha: &str) -> Option<ArtifactRow> {
        match repo.find_artifact_by_git_sha(&app.id, sha) {
            Ok(row) => {
                if self.validate(&row) {
                    Some(row)
                } else {
                    warn!(
                        app = %app.name,
                        path = %row.local_path,
                        "cached artifact failed validation; rebuilding"
                    );
                    None
                }
            }
            Err(_) => None,
        }
    }

    fn validated(&self, row: ArtifactRow, identifier: &str) -> Result<ArtifactRow> {
        if self.validate(&row) {
            return Ok(row);
        }
        warn!(
            path = %row.local_path,
            "artifact for {} exists in the index but fails validation",
            identifier
        );
        Err(Error::ArtifactNotFound(identifier.to_string()))
    }

    /// Re-hash the file behind a row; corrupt or missing files fail.
    pub fn validate(&self, row: &ArtifactRow) -> bool {
        match md5_of_file(Path::new(&row.local_path)) {
            Ok(md5) => md5 == row.md5_hash,
            Err(_) => false,
        }
    }
}

/// Streaming MD5 of a file on disk.
pub fn md5_of_file(path: &Path) -> Result<String> {
    let mut file = std::fs::File::open(path)?;
    let mut context = md5::Context::new();
    let mut buf = [0u8; 64 * 1024];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        context.consume(&buf[..n]);
    }
    Ok(format!("{:x}", context.compute()))
}
