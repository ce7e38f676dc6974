/*
 * This file is part of YogaVPC.
 *
 * Copyright (C) 2026 YogaVPC contributors
 *
 * YogaVPC is free software: you can redistribute it and/or modify
 * it under the terms of the GNU General Public License version 2 as
 * published by the Free Software Foundation.
 *
 * YogaVPC is distributed in the hope that it will be useful,
 * but WITHOUT ANY WARRANTY; without even the implied warranty of
 * MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
 * GNU General Public License for more details.
 *
 * You should have received a copy of the GNU General Public License
 * along with YogaVPC. If not, see <https://www.gnu.org/licenses/>.
 */

//! Command Line Interface

use std::fmt::Write as _;
use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};
use vpc_protocol::{
    DriverStatus, EcRegister, EcWidth, OutcomeKind, PowerEvent, PropertyValue, Request, ResponseData,
};

use crate::client::{socket_path, VpcClient};

#[derive(Parser)]
#[command(name = "yogavpc")]
#[command(version)]
#[command(about = "Control Lenovo platform features through the yogavpcd daemon")]
#[command(long_about = "Control Lenovo platform features through the yogavpcd daemon

EXAMPLES:
    yogavpc status                       Show every toggle and its cached value
    yogavpc set ConservationMode on      Cap battery charge
    yogavpc set FanControl 2             Select fan mode 2
    yogavpc toggle clamshell             Flip clamshell mode
    yogavpc ec read 0x10 --word          Raw EC read (two bytes, little-endian)
    yogavpc power resume                 Resynchronize after wake (sleep hooks)

Changing state requires root.")]
#[command(propagate_version = true)]
pub struct Cli {
    /// Daemon control socket
    #[arg(long, global = true, env = "YOGAVPC_SOCKET")]
    pub socket: Option<PathBuf>,

    /// Print raw JSON instead of text
    #[arg(long, global = true)]
    pub json: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Check that the daemon answers
    Ping,
    /// Show driver state and cached toggle values
    Status,
    /// Show one property's cached value
    Get { property: String },
    /// Set a property: on/off/true/false or a number (0x.. accepted)
    Set { property: String, value: String },
    /// Set a property without a value (flips ClamshellMode)
    Toggle {
        #[arg(default_value = "ClamshellMode")]
        property: String,
    },
    /// Raw EC register access
    #[command(subcommand)]
    Ec(EcCommands),
    /// Deliver a system power event
    Power {
        #[arg(value_enum)]
        event: PowerArg,
    },
    /// Re-read every toggle from firmware
    Update,
    /// Re-run the init probe and re-read every toggle
    Reset,
    /// Dump the firmware configuration methods
    Config,
}

#[derive(Subcommand)]
pub enum EcCommands {
    Read {
        #[arg(value_parser = parse_number::<u8>)]
        offset: u8,
        /// Two bytes, little-endian
        #[arg(long)]
        word: bool,
    },
    Write {
        #[arg(value_parser = parse_number::<u8>)]
        offset: u8,
        #[arg(value_parser = parse_number::<u16>)]
        value: u16,
        #[arg(long)]
        word: bool,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum PowerArg {
    Sleep,
    Resume,
}

impl From<PowerArg> for PowerEvent {
    fn from(arg: PowerArg) -> Self {
        match arg {
            PowerArg::Sleep => PowerEvent::Sleep,
            PowerArg::Resume => PowerEvent::Resume,
        }
    }
}

/// Decimal or 0x-prefixed hex
pub fn parse_number<T: TryFrom<u64>>(s: &str) -> Result<T, String> {
    let s = s.trim();
    let parsed = match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => u64::from_str_radix(hex, 16),
        None => s.parse::<u64>(),
    }
    .map_err(|e| format!("invalid number {:?}: {}", s, e))?;
    T::try_from(parsed).map_err(|_| format!("{} is out of range", s))
}

pub fn parse_value(s: &str) -> Result<PropertyValue, String> {
    match s.to_ascii_lowercase().as_str() {
        "on" | "true" | "yes" => Ok(PropertyValue::Bool(true)),
        "off" | "false" | "no" => Ok(PropertyValue::Bool(false)),
        _ => parse_number::<u32>(s).map(PropertyValue::Int),
    }
}

fn width(word: bool) -> EcWidth {
    if word {
        EcWidth::Word
    } else {
        EcWidth::Byte
    }
}

/// Request for a subcommand
pub fn build_request(command: &Commands) -> Result<Request, String> {
    let set = |name: &str, value: PropertyValue| Request::SetProperty { name: name.to_string(), value };

    Ok(match command {
        Commands::Ping => Request::Ping,
        Commands::Status | Commands::Get { .. } => Request::Status,
        Commands::Set { property, value } => set(property, parse_value(value)?),
        Commands::Toggle { property } if property.eq_ignore_ascii_case("clamshell") => {
            set("ClamshellMode", PropertyValue::None)
        }
        Commands::Toggle { property } => set(property, PropertyValue::None),
        Commands::Ec(EcCommands::Read { offset, word }) => set(
            "ReadEC",
            PropertyValue::Register(EcRegister { offset: *offset, width: width(*word), value: None }),
        ),
        Commands::Ec(EcCommands::Write { offset, value, word }) => set(
            "WriteEC",
            PropertyValue::Register(EcRegister { offset: *offset, width: width(*word), value: Some(*value) }),
        ),
        Commands::Power { event } => Request::Power { event: (*event).into() },
        Commands::Update => set("Update", PropertyValue::None),
        Commands::Reset => set("reset", PropertyValue::None),
        Commands::Config => set("VPCconfig", PropertyValue::None),
    })
}

fn render_value(value: Option<u32>) -> String {
    value.map(|v| format!("{} (0x{:x})", v, v)).unwrap_or_else(|| "-".to_string())
}

pub fn render_status(status: &DriverStatus) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "Platform:     {}", status.platform);
    let _ = writeln!(out, "Power:        {}", status.power);
    let registration = match status.aggregator_instance {
        Some(instance) => format!("{} (instance {})", status.registration, instance),
        None => status.registration.clone(),
    };
    let _ = writeln!(out, "Aggregator:   {}", registration);
    let _ = writeln!(out);
    for toggle in &status.toggles {
        let state = if toggle.missing { "missing" } else { toggle.state.as_str() };
        let _ = writeln!(out, "  {:<18} {:<8} {}", toggle.property, state, render_value(toggle.value));
    }
    out
}

pub fn render_data(data: &ResponseData) -> String {
    let mut out = String::new();
    if let Some(outcome) = &data.outcome {
        let verb = match outcome.result {
            OutcomeKind::Changed => "set to",
            OutcomeKind::AlreadySet => "already",
            OutcomeKind::Value => "=",
            OutcomeKind::Done => "done",
        };
        match outcome.value {
            Some(v) => {
                let _ = writeln!(out, "{} {} {}", outcome.property, verb, render_value(Some(v)));
            }
            None => {
                let _ = writeln!(out, "{} {}", outcome.property, verb);
            }
        }
    }
    if let Some(entries) = &data.config {
        for entry in entries {
            match &entry.error {
                Some(e) => {
                    let _ = writeln!(out, "  {:<6} error: {}", entry.method, e);
                }
                None => {
                    let _ = writeln!(out, "  {:<6} {}", entry.method, render_value(entry.value));
                }
            }
        }
    }
    if let Some(entries) = &data.resync {
        for entry in entries {
            match &entry.error {
                Some(e) => {
                    let _ = writeln!(out, "  {:<18} error: {}", entry.property, e);
                }
                None => {
                    let _ = writeln!(out, "  {:<18} {}", entry.property, render_value(entry.value));
                }
            }
        }
    }
    if data.config.is_none() {
        if let Some(status) = &data.status {
            out.push_str(&render_status(status));
        }
    }
    if let Some(value) = &data.value {
        let _ = writeln!(out, "{}", value);
    }
    if out.is_empty() {
        out.push_str("ok\n");
    }
    out
}

pub fn run_cli(cli: &Cli) -> anyhow::Result<()> {
    let request = build_request(&cli.command).map_err(|e| anyhow::anyhow!(e))?;
    let path = cli.socket.clone().unwrap_or_else(socket_path);
    let mut client = VpcClient::connect(&path)?;
    let data = client.request(request)?;

    if cli.json {
        println!("{}", serde_json::to_string_pretty(&data)?);
        return Ok(());
    }

    if let Commands::Get { property } = &cli.command {
        let status = data.status.ok_or_else(|| anyhow::anyhow!("daemon sent no status"))?;
        let toggle = status
            .toggles
            .iter()
            .find(|t| t.property.eq_ignore_ascii_case(property))
            .ok_or_else(|| anyhow::anyhow!("{} is not supported on the {} profile", property, status.platform))?;
        println!("{} {}", toggle.property, render_value(toggle.value));
        return Ok(());
    }

    print!("{}", render_data(&data));
    Ok(())
}
