use anyhow::Result;
use serde::Serialize;

use super::utils::{
    CommandContext, REPLY_MARGIN, ReportFormat, format_timestamp, print_csv, print_json, runtime,
};
use crate::cli::SessionCommands;
use hotspot_engine::balance::Balance;
use hotspot_engine::control::{ControlCommand, ControlReply};
use hotspot_engine::ids::SubscriberId;
use hotspot_engine::quota::{Allowance, format_data_size, format_time_duration};
use hotspot_engine::session::{SessionSnapshot, SessionState};

/// Redeem a voucher on behalf of a subscriber.
///
/// Goes through the daemon while one is running, otherwise straight to the
/// state directory.
pub fn redeem(ctx: &CommandContext, code: &str, subscriber: &str) -> Result<()> {
    let subscriber = SubscriberId::from(subscriber);

    let (plan_name, plan_id, balance) = match ctx.daemon_spool()? {
        Some(spool) => {
            let command = ControlCommand::Redeem {
                code: code.to_string(),
                subscriber: subscriber.clone(),
            };
            match ctx.ask_daemon(&spool, command, REPLY_MARGIN)? {
                ControlReply::Redeemed {
                    plan_id,
                    plan_name,
                    balance,
                } => (plan_name, plan_id, balance),
                other => anyhow::bail!("Unexpected answer from the engine daemon: {:?}", other),
            }
        }
        None => {
            let engine = ctx.open_engine_for_update()?;
            runtime()?.block_on(async {
                let plan = engine.redeem_voucher(code, &subscriber).await?;
                let balance = engine.read_balance(&subscriber).await;
                Ok::<_, anyhow::Error>((plan.name.clone(), plan.id.clone(), balance))
            })?
        }
    };

    if ctx.json {
        return print_json(&balance);
    }

    println!("✓ Voucher redeemed: {} ({})", plan_name, plan_id);
    println!(
        "  Balance of {}: data {}, time {}",
        subscriber,
        balance.data.display_bytes(),
        balance.time.display_duration()
    );

    Ok(())
}

/// Drive a live session through the running daemon
pub fn session(ctx: &CommandContext, command: SessionCommands) -> Result<()> {
    let Some(spool) = ctx.daemon_spool()? else {
        anyhow::bail!("The engine daemon is not running. Start it with 'hotspot-engine serve'.");
    };

    let (command, limit) = match command {
        SessionCommands::Start { subscriber } => (
            ControlCommand::StartSession {
                subscriber: subscriber.into(),
            },
            ctx.config.session_config().starting_timeout + REPLY_MARGIN,
        ),
        SessionCommands::Stop { subscriber } => (
            ControlCommand::StopSession {
                subscriber: subscriber.into(),
            },
            REPLY_MARGIN,
        ),
        SessionCommands::Revoke { subscriber } => (
            ControlCommand::RevokeSession {
                subscriber: subscriber.into(),
            },
            REPLY_MARGIN,
        ),
    };

    let session = match ctx.ask_daemon(&spool, command, limit)? {
        ControlReply::Session { session } => session,
        other => anyhow::bail!("Unexpected answer from the engine daemon: {:?}", other),
    };

    if ctx.json {
        return print_json(&session);
    }

    match session.state {
        SessionState::Active => println!(
            "✓ Session {} active for {}",
            session.id, session.subscriber
        ),
        SessionState::Stopping | SessionState::Ended => println!(
            "✓ Session {} of {} is {} ({})",
            session.id,
            session.subscriber,
            session.state,
            session
                .end_reason
                .map(|r| r.to_string())
                .unwrap_or_default()
        ),
        _ => println!(
            "Session {} of {} is {}",
            session.id, session.subscriber, session.state
        ),
    }

    Ok(())
}

/// Show a subscriber's balance
pub fn balance(ctx: &CommandContext, subscriber: &str) -> Result<()> {
    let subscriber = SubscriberId::from(subscriber);
    let engine = ctx.open_engine()?;
    let balance = runtime()?.block_on(engine.read_balance(&subscriber));

    if ctx.json {
        return print_json(&balance);
    }

    println!("Balance of {}", subscriber);
    println!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");
    println!("Data remaining:  {}", balance.data.display_bytes());
    println!("Time remaining:  {}", balance.time.display_duration());
    println!("Last change:     {}", format_timestamp(balance.updated_at));
    if !balance.can_start_session() {
        println!();
        println!("No usable balance. Redeem a voucher to start a session.");
    }

    Ok(())
}

/// One line of the sessions CSV report
#[derive(Debug, Serialize)]
struct SessionRow {
    id: String,
    subscriber: String,
    state: String,
    started_at: String,
    activated_at: String,
    ended_at: String,
    data_used_bytes: u64,
    time_used_seconds: u64,
    end_reason: String,
    superseded_reason: String,
    failure: String,
}

impl From<&SessionSnapshot> for SessionRow {
    fn from(session: &SessionSnapshot) -> Self {
        let timestamp = |at: Option<chrono::DateTime<chrono::Utc>>| {
            at.map(|t| t.to_rfc3339()).unwrap_or_default()
        };

        Self {
            id: session.id.to_string(),
            subscriber: session.subscriber.to_string(),
            state: session.state.to_string(),
            started_at: session.started_at.to_rfc3339(),
            activated_at: timestamp(session.activated_at),
            ended_at: timestamp(session.ended_at),
            data_used_bytes: session.usage.data_bytes,
            time_used_seconds: session.usage.time_seconds,
            end_reason: session.end_reason.map(|r| r.to_string()).unwrap_or_default(),
            superseded_reason: session
                .superseded_reason
                .map(|r| r.to_string())
                .unwrap_or_default(),
            failure: session.failure.clone().unwrap_or_default(),
        }
    }
}

/// Show live and ended sessions
pub fn sessions(
    ctx: &CommandContext,
    subscriber: Option<&str>,
    active_only: bool,
    csv: bool,
) -> Result<()> {
    let format = ctx.report_format(csv)?;
    let subscriber = subscriber.map(SubscriberId::from);
    let engine = ctx.open_engine()?;

    let sessions = runtime()?.block_on(async {
        engine.load_sessions().await?;

        let mut sessions: Vec<SessionSnapshot> = engine
            .active_sessions()
            .await
            .into_iter()
            .filter(|s| subscriber.as_ref().is_none_or(|sub| &s.subscriber == sub))
            .collect();

        if !active_only {
            sessions.extend(engine.history(subscriber.as_ref()).await);
        }
        Ok::<_, anyhow::Error>(sessions)
    })?;

    match format {
        ReportFormat::Json => return print_json(&sessions),
        ReportFormat::Csv => {
            let rows: Vec<SessionRow> = sessions.iter().map(SessionRow::from).collect();
            return print_csv(&rows);
        }
        ReportFormat::Text => {}
    }

    if sessions.is_empty() {
        println!("No sessions");
        return Ok(());
    }

    for session in sessions {
        let reason = session
            .end_reason
            .map(|r| format!(" ({})", r))
            .unwrap_or_default();

        println!(
            "{}  {:<16} {:<9}{}  started {}  used {} / {}",
            session.id,
            session.subscriber.as_str(),
            session.state.to_string(),
            reason,
            format_timestamp(session.started_at),
            format_data_size(session.usage.data_bytes),
            format_time_duration(session.usage.time_seconds)
        );

        if let Some(failure) = &session.failure {
            println!("    enforcement failure: {}", failure);
        }
    }

    Ok(())
}

/// One line of the subscribers CSV report
#[derive(Debug, Serialize)]
struct SubscriberRow {
    subscriber: String,
    /// Remaining bytes, or `unlimited`
    data_remaining: String,
    /// Remaining seconds, or `unlimited`
    time_remaining: String,
    session_state: String,
    updated_at: String,
}

fn allowance_cell(allowance: Allowance) -> String {
    match allowance {
        Allowance::Limited(amount) => amount.to_string(),
        Allowance::Unlimited => "unlimited".to_string(),
    }
}

impl SubscriberRow {
    fn new(balance: &Balance, state: SessionState) -> Self {
        Self {
            subscriber: balance.subscriber.to_string(),
            data_remaining: allowance_cell(balance.data),
            time_remaining: allowance_cell(balance.time),
            session_state: state.to_string(),
            updated_at: balance.updated_at.to_rfc3339(),
        }
    }
}

/// List every credited subscriber with their balance
pub fn subscribers(ctx: &CommandContext, csv: bool) -> Result<()> {
    let format = ctx.report_format(csv)?;
    let engine = ctx.open_engine()?;

    let accounts = runtime()?.block_on(async {
        engine.load_sessions().await?;

        let mut accounts = Vec::new();
        for subscriber in engine.subscribers().await {
            let balance = engine.read_balance(&subscriber).await;
            let state = engine.session_state(&subscriber).await;
            accounts.push((balance, state));
        }
        Ok::<_, anyhow::Error>(accounts)
    })?;

    match format {
        ReportFormat::Json => {
            let balances: Vec<&Balance> = accounts.iter().map(|(b, _)| b).collect();
            return print_json(&balances);
        }
        ReportFormat::Csv => {
            let rows: Vec<SubscriberRow> = accounts
                .iter()
                .map(|(balance, state)| SubscriberRow::new(balance, *state))
                .collect();
            return print_csv(&rows);
        }
        ReportFormat::Text => {}
    }

    if accounts.is_empty() {
        println!("No subscribers");
        return Ok(());
    }

    for (balance, state) in accounts {
        println!(
            "{:<18} data {:<10} time {:<10} {}",
            balance.subscriber.as_str(),
            balance.data.display_bytes(),
            balance.time.display_duration(),
            state
        );
    }

    Ok(())
}
