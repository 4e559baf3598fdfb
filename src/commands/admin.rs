use anyhow::{Context, Result};

use super::utils::{CommandContext, format_price, format_timestamp, print_json, runtime};
use crate::cli::{VoucherCommands, VoucherFilter};
use hotspot_engine::catalog::EXAMPLE_CATALOG;
use hotspot_engine::config::EXAMPLE_CONFIG;
use hotspot_engine::ids::PlanId;
use hotspot_engine::ledger::VoucherState;
use hotspot_engine::quota::{format_data_size, format_time_duration};
use hotspot_engine::storage::fs::{atomic_write, write_private};

/// Write the example configuration and catalog
pub fn init(ctx: &CommandContext, force: bool) -> Result<()> {
    let catalog_path = ctx.config.catalog_path(&ctx.config_path);

    for path in [&ctx.config_path, &catalog_path] {
        if path.exists() && !force {
            anyhow::bail!(
                "{} already exists. Use --force to overwrite it.",
                path.display()
            );
        }
    }

    // May later hold the controller token
    write_private(&ctx.config_path, EXAMPLE_CONFIG.as_bytes())
        .with_context(|| format!("Failed to write {}", ctx.config_path.display()))?;
    atomic_write(&catalog_path, EXAMPLE_CATALOG.as_bytes())
        .with_context(|| format!("Failed to write {}", catalog_path.display()))?;

    println!("✓ Configuration written to {}", ctx.config_path.display());
    println!("✓ Plan catalog written to {}", catalog_path.display());
    println!();
    println!("Next steps:");
    println!("  1. Set [enforcer] endpoint to your access controller");
    println!("  2. Adjust the plans in {}", catalog_path.display());
    println!("  3. Start the engine: hotspot-engine serve");

    Ok(())
}

/// List the plan catalog
pub fn plans(ctx: &CommandContext) -> Result<()> {
    let catalog = ctx.catalog()?;
    let plans = catalog.plans();

    if ctx.json {
        let plans: Vec<_> = plans.iter().map(|p| p.as_ref()).collect();
        return print_json(&plans);
    }

    println!("Plans");
    println!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");
    for plan in plans {
        println!(
            "{:<14} {:<20} data {:<10} time {:<10} {:>8}{}",
            plan.id.as_str(),
            plan.name,
            plan.data.display_bytes(),
            plan.time.display_duration(),
            format_price(plan.price_cents),
            if plan.active { "" } else { "  (inactive)" }
        );
    }

    Ok(())
}

/// Voucher management
pub fn vouchers(ctx: &CommandContext, command: VoucherCommands) -> Result<()> {
    match command {
        VoucherCommands::Issue { plan, count } => issue(ctx, &PlanId::from(plan), count),
        VoucherCommands::List { state } => list(ctx, state),
        VoucherCommands::Revoke { code } => revoke(ctx, &code),
        VoucherCommands::Delete { code } => delete(ctx, &code),
    }
}

fn issue(ctx: &CommandContext, plan_id: &PlanId, count: usize) -> Result<()> {
    let engine = ctx.open_engine_for_update()?;
    let vouchers = runtime()?.block_on(engine.issue_vouchers(plan_id, count))?;

    if ctx.json {
        return print_json(&vouchers);
    }

    println!("✓ Issued {} vouchers for plan {}", vouchers.len(), plan_id);
    println!();
    for voucher in vouchers {
        println!("  {}", voucher.code);
    }

    Ok(())
}

fn list(ctx: &CommandContext, filter: Option<VoucherFilter>) -> Result<()> {
    let engine = ctx.open_engine()?;
    let vouchers: Vec<_> = runtime()?
        .block_on(engine.vouchers())
        .into_iter()
        .filter(|v| filter.is_none_or(|f| f.matches(v.state)))
        .collect();

    if ctx.json {
        return print_json(&vouchers);
    }

    if vouchers.is_empty() {
        println!("No vouchers");
        return Ok(());
    }

    for voucher in vouchers {
        let detail = match voucher.state {
            VoucherState::Unredeemed => "unredeemed".to_string(),
            VoucherState::Redeemed => format!(
                "redeemed by {} at {}",
                voucher
                    .redeemed_by
                    .as_ref()
                    .map(|s| s.as_str())
                    .unwrap_or("?"),
                voucher
                    .redeemed_at
                    .map(format_timestamp)
                    .unwrap_or_default()
            ),
            VoucherState::Revoked => "revoked".to_string(),
        };

        println!(
            "{}  {:<14} {}  {}",
            voucher.code,
            voucher.plan_id.as_str(),
            format_timestamp(voucher.created_at),
            detail
        );
    }

    Ok(())
}

fn revoke(ctx: &CommandContext, code: &str) -> Result<()> {
    let engine = ctx.open_engine_for_update()?;
    let voucher = runtime()?.block_on(engine.revoke_voucher(code))?;

    if ctx.json {
        return print_json(&voucher);
    }

    println!("✓ Voucher {} revoked", voucher.code);
    Ok(())
}

fn delete(ctx: &CommandContext, code: &str) -> Result<()> {
    let engine = ctx.open_engine_for_update()?;
    runtime()?.block_on(engine.delete_voucher(code))?;

    if ctx.json {
        return print_json(&serde_json::json!({ "deleted": code }));
    }

    println!("✓ Voucher {} deleted", code);
    Ok(())
}

/// Dashboard statistics
pub fn stats(ctx: &CommandContext) -> Result<()> {
    let engine = ctx.open_engine()?;
    let stats = runtime()?.block_on(async {
        engine.load_sessions().await?;
        Ok::<_, anyhow::Error>(engine.stats().await)
    })?;

    if ctx.json {
        return print_json(&stats);
    }

    println!("Hotspot Statistics");
    println!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");
    println!("Plans:            {}", stats.plans);
    println!("Subscribers:      {}", stats.subscribers);
    println!();
    println!("Vouchers:         {}", stats.vouchers.total);
    println!("  Unredeemed:     {}", stats.vouchers.unredeemed);
    println!("  Redeemed:       {}", stats.vouchers.redeemed);
    println!("  Revoked:        {}", stats.vouchers.revoked);
    println!("Redeemed value:   {}", format_price(stats.redeemed_value_cents));
    println!();
    println!("Live sessions:    {}", stats.live_sessions);
    println!("Ended sessions:   {}", stats.ended_sessions);
    println!("Data used:        {}", format_data_size(stats.data_used_bytes));
    println!("Time used:        {}", format_time_duration(stats.time_used_seconds));

    Ok(())
}
