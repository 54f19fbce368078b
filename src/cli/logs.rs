use anyhow::Result;
use clap::Args;

use crate::cancel::CancelToken;
use crate::db::Repository;
use crate::supervise;

#[derive(Args, Debug)]
#[command(about = "Stream logs for the active run")]
/// Logs argument set.
pub struct LogsArgs {
    #[arg(help = "App name")]
    pub app: String,
    #[arg(short = 's', long, default_value = "localhost", help = "Host name")]
    pub host: String,
    #[arg(short = 'n', long, default_value_t = 100, help = "Lines of history")]
    pub lines: u32,
    #[arg(short = 'f', long, help = "Follow log output")]
    pub follow: bool,
}

/// Stream journal output for the active run to stdout.
pub fn handle(repo: &Repository, args: LogsArgs, cancel: &CancelToken) -> Result<()> {
    let target = supervise::resolve(repo, &args.app, &args.host)?;
    let mut stdout = std::io::stdout();
    supervise::logs(&target, args.lines, args.follow, cancel, &mut stdout)?;
    Ok(())
}
