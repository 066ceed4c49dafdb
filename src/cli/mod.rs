use std::path::PathBuf;

use anyhow::{anyhow, bail, Context, Result};
use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;
use tracing::info;
use uuid::Uuid;

use crate::config::{parse_frequency_mhz, Config};
use crate::orchestrator::Orchestrator;
use crate::store::types::{ScheduleEntry, StationRole, Trigger};
use crate::store::ScheduleStore;

const USAGE: &str = "\
usage: netmarshal <command> [--config <path>]

commands:
  run                      run the scheduler until ctrl-c
  list                     print the schedule
  add [options]            add a schedule entry and print its id
  cancel <entry-id>        remove a schedule entry
  fire <entry-id>          fire an entry immediately

add options:
  --at <rfc3339>           fire once at the given UTC instant
  --daily <HH:MM>          fire every day at the given UTC time
  --freq <MHz>             dial frequency, e.g. 14.070
  --mode <mode>            operating mode, e.g. USB
  --message <text>         text to transmit
  --roles <a,b,..>         target roles (rig, decoder, messenger, net_tool)";

pub async fn run_main() -> Result<()> {
    let args: Vec<String> = std::env::args().skip(1).collect();
    let command = args.first().map(String::as_str).unwrap_or("run");
    let config = load_config(&args)?;

    match command {
        "run" => run(config).await,
        "list" => list(config).await,
        "add" => add(config, &args[1..]).await,
        "cancel" => {
            let id = entry_id_arg(&args, "cancel")?;
            cancel(config, id).await
        }
        "fire" => {
            let id = entry_id_arg(&args, "fire")?;
            fire(config, id).await
        }
        "--help" | "help" => {
            println!("{}", USAGE);
            Ok(())
        }
        other => Err(anyhow!("unknown command '{}'\n{}", other, USAGE)),
    }
}

fn load_config(args: &[String]) -> Result<Config> {
    let explicit = args
        .iter()
        .position(|a| a == "--config")
        .and_then(|i| args.get(i + 1))
        .map(PathBuf::from);

    match explicit {
        Some(path) => Ok(Config::load(&path)?),
        None => {
            let default = PathBuf::from("netmarshal.toml");
            if default.exists() {
                Ok(Config::load(&default)?)
            } else {
                Ok(Config::parse("")?)
            }
        }
    }
}

async fn build_orchestrator(config: Config) -> Result<Orchestrator> {
    let store = ScheduleStore::open(&config.db_path)?;
    let orchestrator = Orchestrator::new(store);
    for station in config.stations {
        let profile = station.into_profile();
        info!(
            "[{}] Station configured ({} at {}:{})",
            profile.role,
            profile.protocol.as_str(),
            profile.host,
            profile.port
        );
        orchestrator.configure_station(profile).await?;
    }
    Ok(orchestrator)
}

async fn run(config: Config) -> Result<()> {
    let orchestrator = build_orchestrator(config).await?;
    let shutdown = CancellationToken::new();
    let scheduler = orchestrator.spawn_scheduler(shutdown.clone());

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for ctrl-c")?;
    info!("Shutting down");
    shutdown.cancel();
    scheduler.await.context("scheduler task failed")??;
    Ok(())
}

async fn list(config: Config) -> Result<()> {
    let orchestrator = build_orchestrator(config).await?;
    let entries = orchestrator.list_schedule().await?;
    if entries.is_empty() {
        println!("no schedule entries");
        return Ok(());
    }
    for entry in entries {
        let freq = entry
            .frequency_hz
            .map(|hz| format!("{} Hz", hz))
            .unwrap_or_else(|| "-".to_string());
        println!(
            "{}  {:?}  freq={}  mode={}  roles={:?}  enabled={}",
            entry.id,
            entry.trigger,
            freq,
            entry.mode.as_deref().unwrap_or("-"),
            entry.roles,
            entry.enabled
        );
    }
    Ok(())
}

fn entry_id_arg(args: &[String], command: &str) -> Result<Uuid> {
    let raw = args
        .get(1)
        .ok_or_else(|| anyhow!("{} needs an entry id\n{}", command, USAGE))?;
    Uuid::parse_str(raw).context("entry id is not a UUID")
}

async fn add(config: Config, args: &[String]) -> Result<()> {
    let mut trigger = None;
    let mut frequency_hz = None;
    let mut mode = None;
    let mut message = None;
    let mut roles = Vec::new();

    let mut i = 0;
    while i < args.len() {
        let flag = args[i].as_str();
        let value = || {
            args.get(i + 1)
                .map(String::as_str)
                .ok_or_else(|| anyhow!("{} needs a value\n{}", flag, USAGE))
        };
        match flag {
            "--at" => {
                let at = DateTime::parse_from_rfc3339(value()?)
                    .context("--at expects an RFC 3339 timestamp")?
                    .with_timezone(&Utc);
                trigger = Some(Trigger::Once { at });
            }
            "--daily" => {
                let (hour, minute) = parse_hhmm(value()?)?;
                trigger = Some(Trigger::Daily { hour, minute });
            }
            "--freq" => {
                let raw = value()?;
                frequency_hz = Some(
                    parse_frequency_mhz(raw)
                        .ok_or_else(|| anyhow!("'{}' is not a frequency in MHz", raw))?,
                );
            }
            "--mode" => mode = Some(value()?.to_string()),
            "--message" => message = Some(value()?.to_string()),
            "--roles" => {
                for name in value()?.split(',') {
                    let role = StationRole::from_name(name.trim())
                        .ok_or_else(|| anyhow!("unknown role '{}'", name.trim()))?;
                    roles.push(role);
                }
            }
            "--config" => {} // consumed by load_config
            other => bail!("unknown flag '{}'\n{}", other, USAGE),
        }
        i += 2;
    }

    let trigger = trigger.ok_or_else(|| anyhow!("add needs --at or --daily\n{}", USAGE))?;
    let mut entry = ScheduleEntry::new(trigger, roles);
    entry.frequency_hz = frequency_hz;
    entry.mode = mode;
    entry.message = message;

    let orchestrator = build_orchestrator(config).await?;
    let id = orchestrator.schedule(entry).await?;
    println!("{}", id);
    Ok(())
}

fn parse_hhmm(raw: &str) -> Result<(u8, u8)> {
    let (h, m) = raw
        .split_once(':')
        .ok_or_else(|| anyhow!("'{}' is not HH:MM", raw))?;
    Ok((
        h.parse().with_context(|| format!("bad hour in '{}'", raw))?,
        m.parse().with_context(|| format!("bad minute in '{}'", raw))?,
    ))
}

async fn cancel(config: Config, id: Uuid) -> Result<()> {
    let orchestrator = build_orchestrator(config).await?;
    orchestrator.cancel(id).await?;
    println!("cancelled {}", id);
    Ok(())
}

async fn fire(config: Config, id: Uuid) -> Result<()> {
    let orchestrator = build_orchestrator(config).await?;
    let result = orchestrator.force_fire_now(id).await?;
    for (role, outcome) in &result.outcomes {
        println!("{}: {:?}", role, outcome);
    }
    if !result.all_succeeded() {
        return Err(anyhow!("one or more roles failed"));
    }
    Ok(())
}
