use anyhow::{Result, bail};
use std::sync::Arc;

use super::worker::build_lifecycle;
use super::{parse_label_flags, parse_launch_args};
use crate::core::clock::{Clock, SystemClock};
use crate::core::config::AgentboxConfig;
use crate::core::store::SqliteStore;
use crate::core::terminal::{GuideSection, print_info, print_status, print_success, print_warn};
use crate::core::types::{WorkerRecord, WorkerSpec};

fn print_usage() {
    GuideSection::new("agentbox agents")
        .command("list [--label k=v]", "List worker records")
        .command("status <name>", "Show one worker record")
        .command("delete <name>", "Delete a worker record")
        .command("launch <name>", "Create a worker record")
        .blank()
        .text("launch options: --type T --image I [--ttl S] [--run-once] [--env K=V]...")
        .print();
    println!();
}

fn print_record_row(record: &WorkerRecord) {
    let last_active = record
        .last_activity_time
        .map(|t| t.to_rfc3339())
        .unwrap_or_else(|| "-".to_string());
    println!(
        "  {:<44} {:<16} {:<10} {}",
        record.name(),
        record.spec.worker_type,
        record.phase,
        last_active
    );
}

fn launch_spec(args: &[String]) -> Result<WorkerSpec> {
    let parsed = parse_launch_args(args, 3)?;
    let mut spec = WorkerSpec::new(&parsed.name, &parsed.worker_type, &parsed.image)
        .run_once(parsed.run_once)
        .ttl_seconds(parsed.ttl_seconds)
        .env("AGENT_TYPE", &parsed.worker_type)
        .env("AGENT_ID", &parsed.name);
    if parsed.run_once {
        spec = spec.env("RUN_ONCE", "true");
    }
    for (key, value) in parsed.env {
        spec = spec.env(key, value);
    }
    Ok(spec)
}

pub async fn run_agents_command(args: &[String], config: &AgentboxConfig) -> Result<()> {
    let sub_cmd = args.get(2).map(String::as_str).unwrap_or("");
    if !matches!(sub_cmd, "list" | "status" | "delete" | "launch") {
        print_usage();
        return Ok(());
    }

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let lifecycle = build_lifecycle(config, clock)?;

    match sub_cmd {
        "list" => {
            let selector = parse_label_flags(args, 3)?;
            let filter = if selector.is_empty() {
                None
            } else {
                Some(&selector)
            };
            let records = lifecycle.list(filter).await;
            if records.is_empty() {
                print_info("No workers found.");
            }
            for record in &records {
                print_record_row(record);
            }
        }
        "status" => {
            let Some(name) = args.get(3) else {
                bail!("Usage: agentbox agents status <name>");
            };
            let Some(record) = lifecycle.describe(name).await else {
                print_warn(&format!("Worker {} not found.", name));
                return Ok(());
            };
            print_status("Name", record.name());
            print_status("Type", &record.spec.worker_type);
            print_status("Image", &record.spec.image);
            print_status("Phase", record.phase.as_str());
            if let Some(message) = &record.message {
                print_status("Message", message);
            }
            if let Some(ttl) = record.spec.ttl_seconds {
                print_status("TTL", &format!("{}s", ttl));
            }
            if let Some(at) = record.created_at {
                print_status("Created", &at.to_rfc3339());
            }
            if let Some(at) = record.last_activity_time {
                print_status("Last activity", &at.to_rfc3339());
            }
            for (key, value) in &record.spec.labels {
                print_status("Label", &format!("{}={}", key, value));
            }

            let store = SqliteStore::open(config.db_path()).await?;
            if let Some(reported) = store.get_status(name).await? {
                print_status(
                    "Reported",
                    &format!(
                        "{} at {}{}",
                        reported.phase,
                        reported.updated_at,
                        reported
                            .message
                            .map(|m| format!(" ({})", m))
                            .unwrap_or_default()
                    ),
                );
            }
        }
        "delete" => {
            let Some(name) = args.get(3) else {
                bail!("Usage: agentbox agents delete <name>");
            };
            if lifecycle.delete(name).await {
                print_success(&format!("Worker {} deleted.", name));
            } else {
                print_warn(&format!("Worker {} was not deleted.", name));
            }
        }
        _ => {
            let spec = launch_spec(args)?;
            if !lifecycle.create(&spec).await {
                bail!("Worker {} was not created", spec.name);
            }
            print_success(&format!("Worker {} created.", spec.name));
        }
    }
    Ok(())
}
