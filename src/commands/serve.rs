use anyhow::{Context, Result};

use super::utils::{CommandContext, runtime};
use hotspot_engine::daemon;

/// Run the engine daemon in the foreground
pub fn serve(ctx: &CommandContext) -> Result<()> {
    let catalog = ctx.catalog()?;
    let state_dir = ctx
        .state_dir()
        .context("Failed to determine state directory")?;

    println!("Starting hotspot engine in foreground mode...");
    println!("State directory: {}", state_dir.display());
    println!("Press Ctrl+C to stop");
    println!();

    let config = ctx.config.clone();
    runtime()?.block_on(daemon::run_engine_daemon(config, catalog, state_dir))
}
