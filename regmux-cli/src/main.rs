//! regmux CLI - exercise the device-mediation runtime from the command line.
//!
//! The CLI hosts an in-process runtime with in-memory demo devices (two I²C
//! sensors on one shared bus, an MMIO block, and a DPM device) and drives it
//! through the same command channel user-space clients use.
//!
//! # Commands
//!
//! - `info`: print device info for the demo devices
//! - `reg-io`: run a register program (from a JSON script or `--write` /
//!   `--read` flags) against a device
//! - `demo`: run the trigger demo (AND of an event predicate and a fence)

mod error;
mod runner;

use clap::{Parser, Subcommand};
use error::CliError;
use regmux::command::{CommandBody, CommandPacket, ResponseBody};
use regmux::event::DequeueOutcome;
use regmux::io_entry::{IoEntry, TransactionResponse};
use regmux::transaction::TransactionInfo;
use regmux::trigger::{TriggerCondition, TriggerNode};
use runner::DemoRig;
use std::path::PathBuf;

#[derive(Debug, Parser)]
#[command(name = "regmux", version = regmux::VERSION, about = "Device-mediation runtime CLI")]
struct Cli {
    /// Write logs to logs/regmux.log as well as stdout
    #[arg(long, global = true)]
    log: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Print device info for every demo device
    Info,
    /// Run a register program against a demo device
    RegIo {
        /// Device id to run against
        #[arg(long, default_value_t = 1)]
        device: u32,
        /// JSON file holding a list of io-entries
        #[arg(long)]
        script: Option<PathBuf>,
        /// Write in OFFSET=VALUE form (hex accepted), repeatable
        #[arg(long)]
        write: Vec<String>,
        /// Read an OFFSET (hex accepted), repeatable
        #[arg(long)]
        read: Vec<String>,
    },
    /// Run the trigger demo: a transaction gated on an event counter AND a
    /// fence, driven to completion
    Demo,
}

fn parse_u64(raw: &str) -> Result<u64, CliError> {
    let raw = raw.trim();
    let parsed = match raw.strip_prefix("0x").or_else(|| raw.strip_prefix("0X")) {
        Some(hex) => u64::from_str_radix(hex, 16),
        None => raw.parse(),
    };
    parsed.map_err(|_| CliError::Argument(format!("not a number: {raw}")))
}

fn parse_write(raw: &str) -> Result<IoEntry, CliError> {
    let (offset, value) = raw
        .split_once('=')
        .ok_or_else(|| CliError::Argument(format!("expected OFFSET=VALUE, got: {raw}")))?;
    Ok(IoEntry::Write {
        offset: parse_u64(offset)?,
        value: parse_u64(value)?,
    })
}

fn load_script(path: &PathBuf) -> Result<Vec<IoEntry>, CliError> {
    let raw = std::fs::read_to_string(path).map_err(|e| CliError::Script {
        path: path.display().to_string(),
        reason: e.to_string(),
    })?;
    serde_json::from_str(&raw).map_err(|e| CliError::Script {
        path: path.display().to_string(),
        reason: e.to_string(),
    })
}

fn print_response(resp: &TransactionResponse) {
    println!(
        "completed entries: {}, error code: {}",
        resp.completion_index + 1,
        resp.error_code
    );
    for (index, result) in resp.results.iter().enumerate() {
        if result.bytes.len() <= 8 {
            let value = resp.value_at(index).unwrap_or(0);
            println!("  [{:#06x}] = {value:#x}", result.offset);
        } else {
            println!("  [{:#06x}] = {} bytes", result.offset, result.bytes.len());
        }
    }
}

async fn cmd_info(rig: &DemoRig) -> Result<(), CliError> {
    for id in rig.device_ids() {
        let client = rig.runtime.open_client(id)?;
        let responses = rig
            .runtime
            .process_commands(&client, vec![CommandPacket::new(CommandBody::GetDeviceInfo)])
            .await;
        if let Some(response) = responses.first() {
            if let ResponseBody::DeviceInfo(info) = &response.body {
                println!(
                    "{}",
                    serde_json::to_string_pretty(info)
                        .unwrap_or_else(|_| format!("{info:?}"))
                );
            }
        }
        rig.runtime.close_client(&client).await?;
    }
    Ok(())
}

async fn cmd_reg_io(
    rig: &DemoRig,
    device: u32,
    script: Option<PathBuf>,
    write: Vec<String>,
    read: Vec<String>,
) -> Result<(), CliError> {
    let mut entries = match &script {
        Some(path) => load_script(path)?,
        None => Vec::new(),
    };
    for raw in &write {
        entries.push(parse_write(raw)?);
    }
    for raw in &read {
        entries.push(IoEntry::Read {
            offset: parse_u64(raw)?,
        });
    }
    if entries.is_empty() {
        return Err(CliError::Argument(
            "no io entries given; use --script, --write, or --read".into(),
        ));
    }

    let client = rig.runtime.open_client(device)?;
    client.enable_device().await?;
    let resp = client.reg_io(&entries).await?;
    print_response(&resp);
    rig.runtime.close_client(&client).await?;
    Ok(())
}

async fn cmd_demo(rig: &DemoRig) -> Result<(), CliError> {
    const DEMO_EVENT: i64 = 0x10;
    const DONE_EVENT: i64 = 0x11;

    let client = rig.runtime.open_client(rig.sensors[0])?;
    client.enable_device().await?;

    let (fence_fd, _fence) = rig.runtime.fences().create();
    let info = TransactionInfo::immediate(vec![
        IoEntry::Write {
            offset: 0x100,
            value: 0xA5,
        },
        IoEntry::Read { offset: 0x100 },
    ])
    .with_trigger(TriggerCondition::all_of(vec![
        TriggerNode::Event {
            event_id: DEMO_EVENT,
            counter: 2,
        },
        TriggerNode::Fence { fd: fence_fd },
    ]))
    .with_success_event(DONE_EVENT);
    let submitted = client.submit_transaction(info)?;
    println!(
        "submitted transaction {} gated on event {DEMO_EVENT:#x} (counter 2) AND fence {fence_fd}",
        submitted.id
    );

    println!("emitting event (counter 1): transaction stays pending");
    client.device().emit_event(DEMO_EVENT, vec![]);
    println!("signaling fence with 0: still pending, event counter not reached");
    rig.runtime.fences().signal(fence_fd, 0)?;
    println!("emitting event (counter 2): condition satisfied");
    client.device().emit_event(DEMO_EVENT, vec![]);

    match client.next_event(4096).await? {
        DequeueOutcome::Event(record) => {
            let resp = TransactionResponse::decode(&record.payload)?;
            println!(
                "completion event {:#x} (counter {}) received:",
                record.event_id, record.counter
            );
            print_response(&resp);
        }
        DequeueOutcome::NeedLargerBuffer { required } => {
            println!("completion payload needs {required} bytes");
        }
    }

    rig.runtime.close_client(&client).await?;
    Ok(())
}

async fn run(cli: Cli) -> Result<(), CliError> {
    let _guard = if cli.log {
        Some(
            regmux::logging::init_logging("logs", "regmux.log")
                .map_err(|e| CliError::LoggingInit(e.to_string()))?,
        )
    } else {
        None
    };

    let rig = DemoRig::build()?;
    match cli.command {
        Commands::Info => cmd_info(&rig).await,
        Commands::RegIo {
            device,
            script,
            write,
            read,
        } => cmd_reg_io(&rig, device, script, write, read).await,
        Commands::Demo => cmd_demo(&rig).await,
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    if let Err(e) = run(cli).await {
        e.exit();
    }
}
