//! Command-line interface definitions for devpci.

use clap::{Parser, Subcommand};

/// Inspect PCI devices through the devpci backends.
#[derive(Parser)]
#[command(name = "devpci", version, about)]
pub struct Cli {
    /// Subcommand to execute.
    #[command(subcommand)]
    pub command: Command,

    /// Backend to use (defaults to the configured one).
    #[arg(long, short = 'b', global = true)]
    pub backend: Option<String>,

    /// Only report errors.
    #[arg(long, short = 'q', global = true, conflicts_with = "verbose")]
    pub quiet: bool,

    /// More log output; repeat for trace output.
    #[arg(long, short = 'v', global = true, action = clap::ArgAction::Count)]
    pub verbose: u8,
}

/// Available subcommands.
#[derive(Subcommand)]
pub enum Command {
    /// List the selectable backends.
    Backends,
    /// List devices matching one or more `vendor:device` pairs.
    List(ListArgs),
    /// Show one device in detail.
    Show(ShowArgs),
    /// Find devices by vendor and device ID.
    Find(FindArgs),
}

/// Arguments for the `list` subcommand.
#[derive(Parser)]
pub struct ListArgs {
    /// `vendor:device` pairs in hex, e.g. `1a3e:e693`.
    #[arg(required = true, value_parser = parse_pair)]
    pub ids: Vec<(u16, u16)>,

    /// Detail level (0-2).
    #[arg(long, short = 'l', default_value_t = 0)]
    pub level: u8,
}

/// Arguments for the `show` subcommand.
#[derive(Parser)]
pub struct ShowArgs {
    /// Device address as `bus:slot.function` in hex.
    #[arg(value_parser = parse_address)]
    pub address: (u8, u8, u8),

    /// `vendor:device` pair the device must match.
    #[arg(long, short = 'i', value_parser = parse_pair)]
    pub id: (u16, u16),

    /// Detail level (0-2).
    #[arg(long, short = 'l', default_value_t = 2)]
    pub level: u8,
}

/// Arguments for the `find` subcommand.
#[derive(Parser)]
pub struct FindArgs {
    /// Vendor ID in hex.
    #[arg(value_parser = parse_hex16)]
    pub vendor: u16,

    /// Device ID in hex.
    #[arg(value_parser = parse_hex16)]
    pub device: u16,

    /// Required subsystem as `vendor:device` in hex.
    #[arg(long, value_parser = parse_pair)]
    pub subsystem: Option<(u16, u16)>,

    /// Required 24-bit class code in hex.
    #[arg(long, value_parser = parse_hex24)]
    pub class: Option<u32>,
}

fn parse_hex16(s: &str) -> Result<u16, String> {
    let digits = s.strip_prefix("0x").unwrap_or(s);
    u16::from_str_radix(digits, 16).map_err(|e| format!("'{s}': {e}"))
}

fn parse_hex24(s: &str) -> Result<u32, String> {
    let digits = s.strip_prefix("0x").unwrap_or(s);
    match u32::from_str_radix(digits, 16) {
        Ok(v) if v <= 0xFF_FFFF => Ok(v),
        Ok(_) => Err(format!("'{s}' is wider than 24 bits")),
        Err(e) => Err(format!("'{s}': {e}")),
    }
}

pub(crate) fn parse_pair(s: &str) -> Result<(u16, u16), String> {
    let (vendor, device) = s
        .split_once(':')
        .ok_or_else(|| format!("expected vendor:device, got '{s}'"))?;
    Ok((parse_hex16(vendor)?, parse_hex16(device)?))
}

pub(crate) fn parse_address(s: &str) -> Result<(u8, u8, u8), String> {
    let bad = || format!("expected bus:slot.function, got '{s}'");
    let (bus, rest) = s.split_once(':').ok_or_else(bad)?;
    let (slot, function) = rest.split_once('.').ok_or_else(bad)?;
    let field = |v: &str, max: u8| {
        u8::from_str_radix(v, 16)
            .ok()
            .filter(|&n| n <= max)
            .ok_or_else(bad)
    };
    Ok((field(bus, 0xFF)?, field(slot, 0x1F)?, field(function, 7)?))
}
