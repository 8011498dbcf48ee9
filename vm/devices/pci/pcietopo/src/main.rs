// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Command-line utility that turns a PCIe topology declaration into
//! `-device` options for the hypervisor and firmware configuration entries
//! for the guest BIOS.

#![forbid(unsafe_code)]

use anyhow::Context;
use clap::Parser;
use clap::ValueEnum;
use pcie_topology::FirmwareConfigEntry;
use pcie_topology::PcieTopology;
use pcie_topology::PcieTopologyConfig;
use pcie_topology::TopologyError;
use std::path::Path;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(
    name = "pcietopo",
    about = "Render a PCIe topology declaration as hypervisor device options",
    version,
    long_about = None
)]
struct Cli {
    /// The topology declaration (YAML or JSON)
    file: PathBuf,

    /// Declaration format, inferred from the file extension by default
    #[arg(long, value_enum)]
    format: Option<Format>,

    /// Print all options on one line, ready to append to a command line
    #[arg(long)]
    joined: bool,

    /// Also print the firmware configuration entries as JSON
    #[arg(long)]
    fw_cfg_json: bool,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, ValueEnum)]
enum Format {
    Yaml,
    Json,
}

impl Format {
    fn from_path(path: &Path) -> Option<Self> {
        match path.extension()?.to_str()? {
            "yaml" | "yml" => Some(Format::Yaml),
            "json" => Some(Format::Json),
            _ => None,
        }
    }
}

/// Runs every topology phase and returns the option fragments and the
/// firmware configuration entries.
fn render(
    config: PcieTopologyConfig,
) -> Result<(Vec<String>, Vec<FirmwareConfigEntry>), TopologyError> {
    let mut topology = PcieTopology::new(Some(config));
    topology.validate()?;
    topology.build()?;
    let mut entries: Vec<FirmwareConfigEntry> = Vec::new();
    topology.initialize_all(&mut entries)?;
    Ok((topology.render_options()?, entries))
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    let text = read_declaration(&cli.file)?;
    let format = cli
        .format
        .or_else(|| Format::from_path(&cli.file))
        .unwrap_or(Format::Yaml);
    let config = match format {
        Format::Yaml => PcieTopologyConfig::from_yaml(&text),
        Format::Json => PcieTopologyConfig::from_json(&text),
    }
    .with_context(|| format!("failed to parse {}", cli.file.display()))?;

    let (options, entries) = render(config).context("failed to build pcie topology")?;
    tracing::debug!(options = options.len(), entries = entries.len(), "rendered");

    if cli.joined {
        println!("{}", options.join(" "));
    } else {
        for option in &options {
            println!("{option}");
        }
    }

    if cli.fw_cfg_json {
        println!("{}", serde_json::to_string_pretty(&entries)?);
    }

    Ok(())
}

fn read_declaration(path: &Path) -> anyhow::Result<String> {
    std::fs::read_to_string(path).with_context(|| format!("failed to read {}", path.display()))
}
