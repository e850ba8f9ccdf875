mod agents;
mod message;
mod worker;

use anyhow::{Result, bail};
use console::style;

use crate::core::backend::LabelSelector;
use crate::core::config::{AgentboxConfig, config_path};
use crate::core::terminal::{GuideSection, print_error};

fn print_help() {
    GuideSection::new("Worker")
        .command("worker", "Run the worker named by AGENT_TYPE / AGENT_ID")
        .print();

    GuideSection::new("Management")
        .command("agents list [--label k=v]", "List worker records")
        .command("agents status <name>", "Show a worker record and its reported status")
        .command("agents delete <name>", "Delete a worker record")
        .command(
            "agents launch <name> --type T --image I",
            "Create a worker record [--ttl S] [--run-once] [--env K=V]",
        )
        .print();

    GuideSection::new("Messaging")
        .command(
            "message <type> <id> <text>",
            "Send to a worker inbox and wait for the reply [--from KEY] [--timeout S]",
        )
        .print();

    println!(
        "\n {} {} <command> [subcommand]\n",
        style("Usage:").bold(),
        style("agentbox").green()
    );
}

/// Split `KEY=VALUE`. The key must be non-empty; the value may be.
pub(crate) fn parse_key_value(raw: &str) -> Option<(String, String)> {
    let (key, value) = raw.split_once('=')?;
    if key.is_empty() {
        return None;
    }
    Some((key.to_string(), value.to_string()))
}

pub(crate) fn parse_label_flags(args: &[String], start: usize) -> Result<LabelSelector> {
    let mut selector = LabelSelector::new();
    let mut i = start;
    while i < args.len() {
        match args[i].as_str() {
            "--label" | "-l" => {
                if i + 1 < args.len() {
                    let Some((key, value)) = parse_key_value(&args[i + 1]) else {
                        bail!("Expected --label key=value, got '{}'", args[i + 1]);
                    };
                    selector.insert(key, value);
                    i += 2;
                } else {
                    i += 1;
                }
            }
            _ => i += 1,
        }
    }
    Ok(selector)
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub(crate) struct LaunchArgs {
    pub name: String,
    pub worker_type: String,
    pub image: String,
    pub ttl_seconds: Option<u64>,
    pub run_once: bool,
    pub env: Vec<(String, String)>,
}

pub(crate) fn parse_launch_args(args: &[String], start: usize) -> Result<LaunchArgs> {
    let mut parsed = LaunchArgs::default();
    let mut i = start;
    while i < args.len() {
        match args[i].as_str() {
            "--type" | "-t" => {
                if i + 1 < args.len() {
                    parsed.worker_type = args[i + 1].clone();
                    i += 2;
                } else {
                    i += 1;
                }
            }
            "--image" | "-i" => {
                if i + 1 < args.len() {
                    parsed.image = args[i + 1].clone();
                    i += 2;
                } else {
                    i += 1;
                }
            }
            "--ttl" => {
                if i + 1 < args.len() {
                    let Ok(ttl) = args[i + 1].parse() else {
                        bail!("--ttl expects seconds, got '{}'", args[i + 1]);
                    };
                    parsed.ttl_seconds = Some(ttl);
                    i += 2;
                } else {
                    i += 1;
                }
            }
            "--run-once" => {
                parsed.run_once = true;
                i += 1;
            }
            "--env" | "-e" => {
                if i + 1 < args.len() {
                    let Some(pair) = parse_key_value(&args[i + 1]) else {
                        bail!("Expected --env KEY=VALUE, got '{}'", args[i + 1]);
                    };
                    parsed.env.push(pair);
                    i += 2;
                } else {
                    i += 1;
                }
            }
            other => {
                if parsed.name.is_empty() && !other.starts_with('-') {
                    parsed.name = other.to_string();
                }
                i += 1;
            }
        }
    }
    if parsed.name.is_empty() || parsed.worker_type.is_empty() || parsed.image.is_empty() {
        bail!("Usage: agentbox agents launch <name> --type T --image I");
    }
    Ok(parsed)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct MessageArgs {
    pub worker_type: String,
    pub worker_id: String,
    pub text: String,
    pub from: String,
    pub timeout_secs: u64,
}

pub(crate) fn parse_message_args(args: &[String], start: usize) -> Result<MessageArgs> {
    let mut positional = Vec::new();
    let mut from = "cli".to_string();
    let mut timeout_secs = 30;
    let mut i = start;
    while i < args.len() {
        match args[i].as_str() {
            "--from" => {
                if i + 1 < args.len() {
                    from = args[i + 1].clone();
                    i += 2;
                } else {
                    i += 1;
                }
            }
            "--timeout" => {
                if i + 1 < args.len() {
                    timeout_secs = args[i + 1].parse().unwrap_or(30);
                    i += 2;
                } else {
                    i += 1;
                }
            }
            other => {
                positional.push(other.to_string());
                i += 1;
            }
        }
    }
    if positional.len() < 3 {
        bail!("Usage: agentbox message <workerType> <workerId> <text>");
    }
    let text = positional.split_off(2).join(" ");
    Ok(MessageArgs {
        worker_type: positional[0].clone(),
        worker_id: positional[1].clone(),
        text,
        from,
        timeout_secs,
    })
}

pub async fn run_main() -> Result<()> {
    let args: Vec<String> = std::env::args().collect();
    crate::logging::init();

    if args.len() < 2 {
        print_help();
        return Ok(());
    }

    let mut config = AgentboxConfig::load(config_path()).await?;
    config.apply_env(|key| std::env::var(key).ok());

    match args[1].as_str() {
        "worker" => worker::run_worker_command(config).await,
        "agents" => agents::run_agents_command(&args, &config).await,
        "message" => message::run_message_command(&args, &config).await,
        "help" | "--help" | "-h" => {
            print_help();
            Ok(())
        }
        cmd => {
            print_error(&format!("Unknown command: {}", cmd));
            print_help();
            Ok(())
        }
    }
}
