//! Operator CLI for the command outbox.
//!
//! Talks directly to the configured database (same environment variables
//! as the server), so it works whether or not the bus is running.

use chrono::{DateTime, Utc};
use serde_json::Value;

use edgebus::domain::{CommandFilter, CommandStatus, NewCommand};
use edgebus::server::{connect_stores, Config};

const USAGE: &str = "\
edgebus-admin: inspect and operate the command outbox

USAGE:
    edgebus-admin <COMMAND> [OPTIONS]

COMMANDS:
    migrate                     Run pending schema migrations and exit
    enqueue                     Insert a command
        --agent <id> --kind <kind> --payload <json>
        [--dedupe <key>] [--not-before <unix-secs>]
    peek                        Inspect the outbox
        [--summary] [--agent <id>] [--status <s>] [--limit <n>]
        [--show <id>] [--receipt <cmd-id>]
    reap                        Run one reap pass over expired leases
    release --id <id>           Return one leased command to pending
    trust                       Set an agent's trust flag
        --agent <id> --trusted <0|1> [--reason <text>]
    agents                      List known agents and their trust state

Environment: OUTBOX_MODE, DATABASE_URL, OUTBOX_DB_PATH, OUTBOX_MAX_ATTEMPTS
";

fn flag_value(args: &[String], name: &str) -> Option<String> {
    args.iter()
        .position(|a| a == name)
        .and_then(|i| args.get(i + 1))
        .cloned()
}

fn has_flag(args: &[String], name: &str) -> bool {
    args.iter().any(|a| a == name)
}

fn required(args: &[String], name: &str) -> anyhow::Result<String> {
    flag_value(args, name).ok_or_else(|| anyhow::anyhow!("missing required option {name}"))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args: Vec<String> = std::env::args().skip(1).collect();
    let Some(command) = args.first().map(String::as_str) else {
        eprint!("{USAGE}");
        std::process::exit(2);
    };
    if matches!(command, "-h" | "--help" | "help") {
        print!("{USAGE}");
        return Ok(());
    }

    let mut config = Config::from_env()?;
    if command == "migrate" {
        // Setups that disable startup migration still migrate here.
        config.migrate_on_startup = true;
    }
    let (store, authority) = connect_stores(&config).await?;
    let rest = &args[1..];

    match command {
        "migrate" => {
            println!("migrations applied ({:?})", config.storage_mode()?);
        }
        "enqueue" => {
            let agent_id = required(rest, "--agent")?;
            let kind = required(rest, "--kind")?;
            let payload: Value = serde_json::from_str(&required(rest, "--payload")?)?;
            let not_before = match flag_value(rest, "--not-before") {
                Some(v) => {
                    let secs: i64 = v.parse()?;
                    Some(
                        DateTime::from_timestamp(secs, 0)
                            .ok_or_else(|| anyhow::anyhow!("--not-before out of range"))?,
                    )
                }
                None => None,
            };
            let outcome = store
                .enqueue(
                    NewCommand {
                        agent_id,
                        kind,
                        payload,
                        not_before,
                        dedupe_key: flag_value(rest, "--dedupe"),
                    },
                    Utc::now(),
                )
                .await?;
            if outcome.is_duplicate() {
                println!("duplicate of command {}", outcome.id());
            } else {
                println!("enqueued command {}", outcome.id());
            }
        }
        "peek" => peek(store.as_ref(), rest).await?,
        "reap" => {
            let summary = store.reap_expired(Utc::now()).await?;
            println!(
                "recovered {} lease(s), retired {} to error",
                summary.recovered, summary.failed
            );
        }
        "release" => {
            let id: i64 = required(rest, "--id")?.parse()?;
            if store.force_release(id).await? {
                println!("command {id} released to pending");
            } else {
                println!("command {id} is not leased; nothing to do");
            }
        }
        "trust" => {
            let agent = required(rest, "--agent")?;
            let trusted = match required(rest, "--trusted")?.as_str() {
                "1" | "true" => true,
                "0" | "false" => false,
                other => anyhow::bail!("--trusted must be 0 or 1, got {other}"),
            };
            let reason = flag_value(rest, "--reason").unwrap_or_default();
            authority
                .set_trust(&agent, trusted, &reason, Utc::now())
                .await?;
            println!(
                "agent {agent} is now {}",
                if trusted { "trusted" } else { "distrusted" }
            );
        }
        "agents" => {
            let agents = authority.list_agents().await?;
            if agents.is_empty() {
                println!("no agents on record");
            }
            for a in agents {
                println!(
                    "{}\ttrusted={}\tlast_seen={}\treason={}",
                    a.agent_id,
                    a.trusted,
                    a.last_seen.to_rfc3339(),
                    if a.reason.is_empty() { "-" } else { &a.reason },
                );
            }
        }
        other => {
            eprintln!("unknown command: {other}\n");
            eprint!("{USAGE}");
            std::process::exit(2);
        }
    }
    Ok(())
}

async fn peek(store: &dyn edgebus::CommandStore, args: &[String]) -> anyhow::Result<()> {
    if let Some(id) = flag_value(args, "--show") {
        let id: i64 = id.parse()?;
        match store.get_command(id).await? {
            Some(cmd) => println!("{}", serde_json::to_string_pretty(&cmd)?),
            None => println!("command {id} not found"),
        }
        return Ok(());
    }
    if let Some(id) = flag_value(args, "--receipt") {
        let id: i64 = id.parse()?;
        match store.get_receipt(id).await? {
            Some(receipt) => println!("{}", serde_json::to_string_pretty(&receipt)?),
            None => println!("no receipt for command {id}"),
        }
        return Ok(());
    }

    let filter = CommandFilter {
        agent_id: flag_value(args, "--agent"),
        status: match flag_value(args, "--status") {
            Some(s) => Some(CommandStatus::parse(&s)?),
            None => None,
        },
    };

    if has_flag(args, "--summary") {
        for (status, n) in store.status_counts(filter).await? {
            println!("{status}\t{n}");
        }
        return Ok(());
    }

    let limit: u32 = flag_value(args, "--limit")
        .and_then(|v| v.parse().ok())
        .unwrap_or(20);
    for cmd in store.list_commands(filter, limit).await? {
        println!(
            "{}\t{}\t{}\t{}\tattempts={}\t{}",
            cmd.id,
            cmd.status,
            cmd.agent_id,
            cmd.kind,
            cmd.attempts,
            cmd.created_at.to_rfc3339(),
        );
    }
    Ok(())
}
