//! devpci command-line tool.
//!
//! Selects a backend the same way a driver would, then reports what it
//! finds. Nothing is mapped and no interrupts are connected; BAR lengths
//! the bus did not report are discovered through configuration space.

mod cli;
mod logger;

use anyhow::{Context, Result, bail};
use clap::Parser;
use devpci::show::DeviceReport;
use devpci::{Config, DevPci, DeviceRef, PciId, Visit};

fn main() -> Result<()> {
    let cli = cli::Cli::parse();
    logger::init(logger::filter(cli.quiet, cli.verbose));

    if let cli::Command::Backends = cli.command {
        for name in devpci::backend::names() {
            println!("{name}");
        }
        return Ok(());
    }

    let config = Config::load().context("loading devpci configuration")?;
    let pci = DevPci::open(&config, cli.backend.as_deref()).with_context(|| {
        let name = cli.backend.as_deref().unwrap_or(&config.backend);
        format!("selecting backend '{name}'")
    })?;

    match cli.command {
        cli::Command::Backends => Ok(()),
        cli::Command::List(ref args) => cmd_list(&pci, args),
        cli::Command::Show(ref args) => cmd_show(&pci, args),
        cli::Command::Find(ref args) => cmd_find(&pci, args),
    }
}

fn print_report(pci: &DevPci, dev: &DeviceRef, level: u8) {
    let report = DeviceReport::new(dev, level).with_lengths(|bar| pci.bar_length(dev, bar));
    println!("{report}");
}

fn cmd_list(pci: &DevPci, args: &cli::ListArgs) -> Result<()> {
    let patterns: Vec<PciId> = args.ids.iter().map(|&(v, d)| PciId::new(v, d)).collect();
    let mut count = 0usize;
    pci.find(&patterns, |dev| {
        print_report(pci, dev, args.level);
        count += 1;
        Ok(Visit::Continue)
    })
    .context("searching the bus")?;
    log::info!("{count} device(s)");
    Ok(())
}

fn cmd_show(pci: &DevPci, args: &cli::ShowArgs) -> Result<()> {
    let (bus, slot, function) = args.address;
    let (vendor, device) = args.id;
    let dev = pci
        .find_bdf(&[PciId::new(vendor, device)], bus, slot, function)
        .with_context(|| {
            format!("no {vendor:04x}:{device:04x} device at {bus:02x}:{slot:02x}.{function}")
        })?;
    print_report(pci, &dev, args.level);
    Ok(())
}

fn cmd_find(pci: &DevPci, args: &cli::FindArgs) -> Result<()> {
    let mut pattern = PciId::new(args.vendor, args.device);
    if let Some((sub_vendor, sub_device)) = args.subsystem {
        pattern = pattern.with_subsystem(sub_vendor, sub_device);
    }
    if let Some(class) = args.class {
        pattern = pattern.with_class(class);
    }

    let mut found = Vec::new();
    pci.find(&[pattern], |dev| {
        found.push(dev.address());
        Ok(Visit::Continue)
    })
    .context("searching the bus")?;

    if found.is_empty() {
        bail!("no device matches {:04x}:{:04x}", args.vendor, args.device);
    }
    for address in found {
        println!("{address}");
    }
    Ok(())
}
