//! User-declared deploy hooks: shell commands sourced against the app env,
//! or `bin/{app} eval` invocations inside the release.

use tracing::info;

use crate::config::{HookCommand, HookKind};
use crate::error::{Error, HookStage, Result};
use crate::transport::{Transport, sh_quote};

/// Values available to hook templates.
pub struct HookContext {
    pub app_name: String,
    pub release_path: String,
    pub version: String,
    pub commit_sha: String,
}

/// Expand `{{release_path}}`, `{{app_name}}`, `{{version}}`, and
/// `{{commit_sha}}` in a hook command.
pub fn expand(template: &str, ctx: &HookContext) -> String {
    template
        .replace("{{release_path}}", &ctx.release_path)
        .replace("{{app_name}}", &ctx.app_name)
        .replace("{{version}}", &ctx.version)
        .replace("{{commit_sha}}", &ctx.commit_sha)
}

/// Build the remote command line for one hook.
pub fn command_for(hook: &HookCommand, ctx: &HookContext) -> String {
    let expanded = expand(&hook.command, ctx);
    match hook.kind {
        HookKind::Shell => {
            let inner = format!("set -a && . /etc/{}/env && set +a && {}", ctx.app_name, expanded);
            format!("sudo bash -c {}", sh_quote(&inner))
        }
        HookKind::Eval => format!(
            "sudo {}/bin/{} eval {}",
            ctx.release_path,
            ctx.app_name,
            sh_quote(&expanded)
        ),
    }
}

/// Run a stage's hooks in order; the first failure aborts the stage.
pub fn run_hooks(
    transport: &mut dyn Transport,
    hooks: &[HookCommand],
    stage: HookStage,
    ctx: &HookContext,
) -> Result<Vec<String>> {
    let mut log = Vec::new();
    for hook in hooks {
        let command = command_for(hook, ctx);
        info!(%stage, command = %hook.command, "running hook");
        let result = transport.exec(&command)?;
        log.push(format!("[{}] {}\n{}", stage, hook.command, result.output));
        if !result.success() {
            return Err(Error::HookFailed {
                stage,
                detail: format!(
                    "`{}` exited {}: {}",
                    hook.command,
                    result.exit_status,
                    result.output.trim()
                ),
            });
        }
    }
    Ok(log)
}
