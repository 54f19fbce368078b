//! Artifact builder: detect the runtime, drive a container build, and pack
//! the release tree into a content-hashed tarball.

use flate2::Compression;
use flate2::write::GzEncoder;
use std::io::Write;
use std::path::{Path, PathBuf};
use tar::HeaderMode;
use time::OffsetDateTime;
use time::macros::format_description;
use tracing::info;

use crate::error::{Error, Result};
use crate::runner;

/// Supported application runtimes, in detection order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Runtime {
    Phoenix,
    Elixir,
    Node,
    Golang,
    Static,
}

impl Runtime {
    pub fn as_str(&self) -> &'static str {
        match self {
            Runtime::Phoenix => "phoenix",
            Runtime::Elixir => "elixir",
            Runtime::Node => "node",
            Runtime::Golang => "golang",
            Runtime::Static => "static",
        }
    }

    pub fn from_name(name: &str) -> Result<Self> {
        match name {
            "phoenix" => Ok(Runtime::Phoenix),
            "elixir" => Ok(Runtime::Elixir),
            "node" => Ok(Runtime::Node),
            "golang" | "go" => Ok(Runtime::Golang),
            "static" => Ok(Runtime::Static),
            other => Err(Error::Config(format!("unknown runtime {}", other))),
        }
    }
}

/// Detect the runtime from the project layout; first match wins.
pub fn detect_runtime(project_dir: &Path) -> Runtime {
    let mix = project_dir.join("mix.exs");
    if mix.exists() {
        let source = std::fs::read_to_string(&mix).unwrap_or_default();
        if source.contains(":phoenix") {
            return Runtime::Phoenix;
        }
        return Runtime::Elixir;
    }
    if project_dir.join("release/bin").is_dir() {
        return Runtime::Phoenix;
    }
    if project_dir.join("package.json").exists() {
        return Runtime::Node;
    }
    if project_dir.join("go.mod").exists() {
        return Runtime::Golang;
    }
    if project_dir.join("index.html").exists() {
        return Runtime::Static;
    }
    for dir in ["dist", "build", "public"] {
        if project_dir.join(dir).join("index.html").exists() {
            return Runtime::Static;
        }
    }
    Runtime::Elixir
}

/// Derive the release version from project metadata, falling back to a
/// timestamp.
pub fn derive_version(project_dir: &Path, runtime: Runtime) -> String {
    match runtime {
        Runtime::Phoenix | Runtime::Elixir => {
            if let Ok(source) = std::fs::read_to_string(project_dir.join("mix.exs")) {
                if let Some(version) = parse_mix_version(&source) {
                    return version;
                }
            }
        }
        Runtime::Static | Runtime::Node => {
            if let Ok(source) = std::fs::read_to_string(project_dir.join("package.json")) {
                if let Some(version) = serde_json::from_str::<serde_json::Value>(&source)
                    .ok()
                    .and_then(|pkg| pkg.get("version")?.as_str().map(str::to_string))
                {
                    return version;
                }
            }
        }
        Runtime::Golang => {}
    }
    timestamp_version()
}

fn parse_mix_version(source: &str) -> Option<String> {
    for line in source.lines() {
        let trimmed = line.trim();
        if let Some(rest) = trimmed.strip_prefix("version:") {
            let rest = rest.trim();
            if let Some(start) = rest.find('"') {
                if let Some(end) = rest[start + 1..].find('"') {
                    return Some(rest[start + 1..start + 1 + end].to_string());
                }
            }
        }
    }
    None
}

fn timestamp_version() -> String {
    let fmt = format_description!("[year][month][day].[hour][minute][second]");
    OffsetDateTime::now_utc()
        .format(&fmt)
        .unwrap_or_else(|_| "00000000.000000".to_string())
}

/// Short HEAD sha, `-dirty` suffixed when the worktree has changes, or
/// `unknown` outside a checkout. Dirty and unknown shas never hit the cache.
pub fn git_commit(project_dir: &Path) -> String {
    let repo = match git2::Repository::discover(project_dir) {
        Ok(repo) => repo,
        Err(_) => return "unknown".to_string(),
    };
    let short = match head_short_sha(&repo) {
        Some(sha) => sha,
        None => return "unknown".to_string(),
    };
    if worktree_dirty(&repo) {
        format!("{}-dirty", short)
    } else {
        short
    }
}

fn head_short_sha(repo: &git2::Repository) -> Option<String> {
    let object = repo.revparse_single("HEAD").ok()?;
    let buf = object.short_id().ok()?;
    buf.as_str().map(str::to_string)
}

fn worktree_dirty(repo: &git2::Repository) -> bool {
    let mut options = git2::StatusOptions::new();
    options.include_untracked(true).include_ignored(false);
    match repo.statuses(Some(&mut options)) {
        Ok(statuses) => !statuses.is_empty(),
        Err(_) => false,
    }
}

/// Whether a sha may be used as a cache key.
pub fn is_reusable_sha(sha: &str) -> bool {
    sha != "unknown" && !sha.ends_with("-dirty")
}

/// Container engine used for local release builds.
pub struct ContainerEngine {
    engine: &'static str,
}

impl ContainerEngine {
    /// Find docker or podman on PATH.
    pub fn detect() -> Result<Self> {
        for engine in ["docker", "podman"] {
            if runner::command_exists(engine) {
                return Ok(Self { engine });
            }
        }
        Err(Error::BuildFailed(
            "no container engine found; install docker or podman".to_string(),
        ))
    }

    fn run(&self, args: &[&str]) -> Result<()> {
        let output = runner::run_output(self.engine, args)
            .map_err(|err| Error::BuildFailed(err.to_string()))?;
        if output.status.success() {
            return Ok(());
        }
        Err(Error::BuildFailed(format!(
            "{} {:?} failed: {}",
            self.engine,
            args,
            String::from_utf8_lossy(&output.stderr).trim()
        )))
    }
}

/// A packed release ready for cache registration.
pub struct BuildOutcome {
    pub version: String,
    pub git_sha: String,
    pub md5: String,
    pub tarball: tempfile::NamedTempFile,
}

/// Build a release for a project and pack it.
///
/// The container image produces its release tree under `/build-output`,
/// which is bind-mounted to a scratch directory here and then tarred. The
/// temp tarball is created inside `scratch_dir` so the cache can rename it
/// into place atomically.
pub fn build(
    project_dir: &Path,
    app_name: &str,
    runtime: Runtime,
    dockerfile_override: Option<&str>,
    scratch_dir: &Path,
) -> Result<BuildOutcome> {
    let engine = ContainerEngine::detect()?;
    let version = derive_version(project_dir, runtime);
    let git_sha = git_commit(project_dir);

    let staging = tempfile::TempDir::new()?;
    let dockerfile = resolve_dockerfile(project_dir, runtime, dockerfile_override, staging.path())?;
    let out_dir = staging.path().join("release");
    std::fs::create_dir_all(&out_dir)?;

    let tag = format!("shipyard-build-{}", app_name);
    info!(app = app_name, runtime = runtime.as_str(), %version, "building release image");
    let build_arg = format!("APP={}", app_name);
    engine.run(&[
        "build",
        "-f",
        &dockerfile.to_string_lossy(),
        "-t",
        &tag,
        "--build-arg",
        &build_arg,
        &project_dir.to_string_lossy(),
    ])?;
    let bind = format!("{}:/build-output", out_dir.display());
    engine.run(&[
        "run",
        "--rm",
        "-v",
        &bind,
        &tag,
        "sh",
        "-c",
        "cp -a /app/release/. /build-output/",
    ])?;

    let (tarball, md5) = pack_release(&out_dir, scratch_dir)?;
    info!(app = app_name, %md5, "release packed");
    Ok(BuildOutcome {
        version,
        git_sha,
        md5,
        tarball,
    })
}

fn resolve_dockerfile(
    project_dir: &Path,
    runtime: Runtime,
    dockerfile_override: Option<&str>,
    staging: &Path,
) -> Result<PathBuf> {
    if let Some(name) = dockerfile_override {
        let path = project_dir.join(name);
        if !path.exists() {
            return Err(Error::Config(format!("dockerfile {} not found", name)));
        }
        return Ok(path);
    }
    let project_file = match runtime {
        Runtime::Static => project_dir.join("Dockerfile.shipyard.static"),
        _ => project_dir.join("Dockerfile.shipyard"),
    };
    if project_file.exists() {
        return Ok(project_file);
    }
    let template = match runtime {
        Runtime::Phoenix => include_str!("../templates/Dockerfile.phoenix"),
        Runtime::Elixir => include_str!("../templates/Dockerfile.elixir"),
        Runtime::Node => include_str!("../templates/Dockerfile.node"),
        Runtime::Golang => include_str!("../templates/Dockerfile.golang"),
        Runtime::Static => include_str!("../templates/Dockerfile.static"),
    };
    let path = staging.join("Dockerfile.shipyard");
    std::fs::write(&path, template)?;
    Ok(path)
}

struct HashingWriter<W: Write> {
    inner: W,
    context: md5::Context,
}

impl<W: Write> Write for HashingWriter<W> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let written = self.inner.write(buf)?;
        self.context.consume(&buf[..written]);
        Ok(written)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.inner.flush()
    }
}

/// Tar+gzip a release tree into a temp file, hashing the compressed bytes
/// as they are written.
pub fn pack_release(
    release_dir: &Path,
    scratch_dir: &Path,
) -> Result<(tempfile::NamedTempFile, String)> {
    std::fs::create_dir_all(scratch_dir)?;
    let mut tarball = tempfile::NamedTempFile::new_in(scratch_dir)?;
    let md5 = {
        let writer = HashingWriter {
            inner: &mut tarball,
            context: md5::Context::new(),
        };
        let encoder = GzEncoder::new(writer, Compression::default());
        let mut archive = tar::Builder::new(encoder);
        archive.mode(HeaderMode::Deterministic);
        archive
            .append_dir_all(".", release_dir)
            .map_err(|err| Error::BuildFailed(format!("packing failed: {}", err)))?;
        let encoder = archive
            .into_inner()
            .map_err(|err| Error::BuildFailed(format!("packing failed: {}", err)))?;
        let writer = encoder
            .finish()
            .map_err(|err| Error::BuildFailed(format!("gzip failed: {}", err)))?;
        format!("{:x}", writer.context.compute())
    };
    tarball.flush()?;
    Ok((tarball, md5))
}
