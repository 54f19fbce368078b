//! Error kinds surfaced by the deployment core.

use thiserror::Error;

/// Hook stages that can fail independently.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HookStage {
    PreDeploy,
    Migrate,
    PostDeploy,
}

impl std::fmt::Display for HookStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            HookStage::PreDeploy => "pre_deploy",
            HookStage::Migrate => "migrate",
            HookStage::PostDeploy => "post_deploy",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Error)]
/// Errors produced by the repository, transports, and the orchestrator.
pub enum Error {
    #[error("application {0} not found")]
    AppNotFound(String),

    #[error("host {0} not found")]
    HostNotFound(String),

    #[error("no instance of {app} on {host}; run `shipyard launch` first")]
    InstanceNotFound { app: String, host: String },

    #[error("no build artifact matches {0}")]
    ArtifactNotFound(String),

    #[error("identifier {0} matches more than one artifact; use a longer prefix")]
    AmbiguousArtifact(String),

    #[error("domain {0} not found")]
    DomainNotFound(String),

    #[error("another deployment holds the lock for instance {0}")]
    InstanceBusy(String),

    #[error("host key for {host} does not match the pinned key; refusing to connect")]
    HostKeyMismatch { host: String },

    #[error("host {0} has not been initialized; run `shipyard host init {0}`")]
    HostNotInitialized(String),

    #[error("build failed: {0}")]
    BuildFailed(String),

    #[error("transport: {0}")]
    Transport(String),

    #[error("unit {unit} never became active: {detail}")]
    HealthCheckFailed { unit: String, detail: String },

    #[error("caddy admin API unreachable: {0}")]
    CaddyUnavailable(String),

    #[error("caddy admin API returned {status}: {body}")]
    CaddyUpdate { status: u16, body: String },

    #[error("{stage} hook failed: {detail}")]
    HookFailed { stage: HookStage, detail: String },

    #[error("deployment cancelled")]
    Cancelled,

    #[error("config: {0}")]
    Config(String),

    #[error("secret cipher: {0}")]
    Crypto(String),

    #[error(transparent)]
    Db(#[from] rusqlite::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Http(#[from] reqwest::Error),
}

impl Error {
    /// Whether the orchestrator treats this as fatal before any traffic switch.
    pub fn aborts_before_cutover(&self) -> bool {
        !matches!(
            self,
            Error::HookFailed {
                stage: HookStage::PostDeploy,
                ..
            }
        )
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
