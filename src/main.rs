use anyhow::Result;
use clap::Parser;

mod cli;
mod commands;

use cli::{Args, Commands};
use commands::{CommandContext, admin, init_logging, serve, subscriber};

fn main() {
    if let Err(e) = run() {
        eprintln!("Error: {:#}", e);
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    let args = Args::parse();

    let ctx = CommandContext::load(args.config, args.json)?;
    init_logging(args.verbose, &ctx.config.logging.level);

    match args.command {
        Commands::Init { force } => admin::init(&ctx, force),
        Commands::Plans => admin::plans(&ctx),
        Commands::Vouchers { command } => admin::vouchers(&ctx, command),
        Commands::Redeem { code, subscriber } => subscriber::redeem(&ctx, &code, &subscriber),
        Commands::Balance { subscriber } => subscriber::balance(&ctx, &subscriber),
        Commands::Session { command } => subscriber::session(&ctx, command),
        Commands::Sessions {
            subscriber,
            active,
            csv,
        } => subscriber::sessions(&ctx, subscriber.as_deref(), active, csv),
        Commands::Subscribers { csv } => subscriber::subscribers(&ctx, csv),
        Commands::Stats => admin::stats(&ctx),
        Commands::Serve => serve::serve(&ctx),
    }
}
