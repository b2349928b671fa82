//! `pp ...` administration commands of the pool-to-pool client.

use anyhow::{bail, Result};
use clap::{Parser, Subcommand, ValueEnum};
use tracing::{info, warn};

use super::TransferSessionManager;
use crate::companion::TransferRequest;
use crate::config::MAX_TIMEOUT_MS;
use crate::types::{FileId, SessionId};

#[derive(Parser, Debug)]
#[command(name = "pp", about = "Pool to pool transfers", disable_version_flag = true)]
struct PpCommand {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Pull a replica from another pool
    Get {
        #[command(subcommand)]
        target: GetTarget,
    },
    /// List transfers
    Ls,
    /// Cancel a transfer
    Cancel { id: u32 },
    /// Remove a transfer from the listing without cancelling it
    Remove { id: u32 },
    Set {
        #[command(subcommand)]
        setting: Setting,
    },
    /// Keep finished transfers in the listing
    Keep { mode: Switch },
    /// Fail every transfer after the copy (debugging only)
    Fail { mode: Switch },
    Info,
}

#[derive(Subcommand, Debug)]
enum GetTarget {
    File { file_id: FileId, pool: String },
}

#[derive(Subcommand, Debug)]
enum Setting {
    /// Listen port used the next time the listener starts
    Port { port: u16 },
    Max {
        #[command(subcommand)]
        setting: MaxSetting,
    },
    Pnfs {
        #[command(subcommand)]
        setting: PnfsSetting,
    },
}

#[derive(Subcommand, Debug)]
enum MaxSetting {
    Active { max_active: usize },
}

#[derive(Subcommand, Debug)]
enum PnfsSetting {
    Timeout { seconds: u64 },
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
enum Switch {
    On,
    Off,
}

impl Switch {
    fn is_on(self) -> bool {
        self == Switch::On
    }
}

fn parse(line: &str) -> Result<Command> {
    let tokens: Vec<&str> = line.split_whitespace().collect();
    if tokens.first() != Some(&"pp") {
        bail!("not a pool to pool command: {line}");
    }
    Ok(PpCommand::try_parse_from(tokens)?.command)
}

/// Run one command line and return the reply text.
pub async fn execute(manager: &TransferSessionManager, line: &str) -> Result<String> {
    let reply = match parse(line)? {
        Command::Get {
            target: GetTarget::File { file_id, pool },
        } => {
            let request = TransferRequest::new(file_id, pool);
            manager
                .start(request, |file_id, error| match error {
                    None => info!(%file_id, "pool to pool transfer finished"),
                    Some(e) => warn!(%file_id, "pool to pool transfer failed: {}", e),
                })
                .await?;
            "Transfer Initiated".to_string()
        }
        Command::Ls => manager
            .list()
            .iter()
            .map(|s| format!("{s}\n"))
            .collect(),
        Command::Cancel { id } => {
            if !manager.cancel(SessionId(id)) {
                bail!("No active transfer with id {id}");
            }
            "Cancelling".to_string()
        }
        Command::Remove { id } => {
            if !manager.remove(SessionId(id)) {
                bail!("Id not found : {id}");
            }
            String::new()
        }
        Command::Set { setting } => match setting {
            Setting::Port { port } => {
                manager.set_port(port).await?;
                String::new()
            }
            Setting::Max {
                setting: MaxSetting::Active { max_active },
            } => {
                manager.set_max_active(max_active);
                String::new()
            }
            Setting::Pnfs {
                setting: PnfsSetting::Timeout { seconds },
            } => {
                if seconds == 0 {
                    bail!("Pnfs timeout must be positive");
                }
                if seconds > MAX_TIMEOUT_MS / 1000 {
                    bail!("Pnfs timeout must not exceed {} seconds", MAX_TIMEOUT_MS / 1000);
                }
                manager.set_namespace_timeout(std::time::Duration::from_secs(seconds));
                format!("Pnfs timeout set to {seconds} seconds")
            }
        },
        Command::Keep { mode } => {
            manager.set_remove_on_exit(!mode.is_on());
            String::new()
        }
        Command::Fail { mode } => {
            manager.set_simulate_io_failure(mode.is_on());
            "Done".to_string()
        }
        Command::Info => manager.info().await,
    };
    Ok(reply)
}
