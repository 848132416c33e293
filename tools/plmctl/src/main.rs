// Copyright © 2025 Lukas Bower
// SPDX-License-Identifier: Apache-2.0
// Purpose: Inspect boot images and run them against simulated memory.
// Author: Lukas Bower

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use log::info;
use pdi_format::{Cpu, ExecState, VectorLocation};
use plm_loader::config::{load_active, load_config_file};
use plm_loader::{
    BootSource, DeviceRegistry, FileDevice, ImageLoader, Interpreter, LoadedImage, PowerError,
    PowerManager, SimMemory,
};
use serde_json::json;

#[derive(Parser)]
#[command(about = "Boot image loader host tool")]
struct Cli {
    #[command(subcommand)]
    cmd: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Validate and print the meta header of an image
    Inspect {
        image: PathBuf,
        /// Boot source name the file stands in for
        #[arg(long, default_value = "sd0")]
        source: BootSource,
        /// Image base offset within the file
        #[arg(long, default_value_t = 0)]
        offset: u64,
        /// Image starts with the header table instead of a boot header
        #[arg(long)]
        partial: bool,
        /// Emit JSON
        #[arg(long)]
        json: bool,
    },
    /// Load every partition into simulated memory and release the cores
    Run {
        image: PathBuf,
        #[arg(long, default_value = "sd0")]
        source: BootSource,
        #[arg(long, default_value_t = 0)]
        offset: u64,
        #[arg(long)]
        partial: bool,
        /// Loader configuration; defaults to PLM_CONFIG or built-in values
        #[arg(long)]
        config: Option<PathBuf>,
    },
}

/// Prints wake requests instead of releasing hardware.
struct PrintingPm;

impl PowerManager for PrintingPm {
    fn set_exec_state(&mut self, cpu: Cpu, state: ExecState) -> Result<(), PowerError> {
        info!("{cpu}: exec state {state:?}");
        Ok(())
    }

    fn set_vector_location(&mut self, cpu: Cpu, vector: VectorLocation) -> Result<(), PowerError> {
        info!("{cpu}: vectors {vector:?}");
        Ok(())
    }

    fn request_wake(&mut self, cpu: Cpu, entry: u64) -> Result<(), PowerError> {
        println!("wake {cpu} at {entry:#x}");
        Ok(())
    }
}

fn open(
    image: &Path,
    source: BootSource,
    offset: u64,
    partial: bool,
    config: Option<&Path>,
) -> Result<(ImageLoader, LoadedImage)> {
    let config = match config {
        Some(path) => load_config_file(path)?,
        None => load_active(),
    };
    let mut registry = DeviceRegistry::new();
    registry.register(source, Box::new(FileDevice::new(image)));
    let mut loader = ImageLoader::new(registry, Interpreter::with_general_module()?, config)?;
    let loaded = if partial {
        loader.load_partial_image(source, offset)
    } else {
        loader.load_image(source, offset)
    }
    .with_context(|| format!("reading {}", image.display()))?;
    Ok((loader, loaded))
}

fn inspect(image: &LoadedImage, as_json: bool) -> Result<()> {
    let meta = image.meta();
    if as_json {
        let doc = json!({
            "source": image.source().to_string(),
            "address": image.address(),
            "boot_header": meta.boot_header.as_ref().map(|h| json!({
                "meta_header_offset": h.meta_header_offset,
                "attributes": h.attributes,
                "plm_len": h.plm_len,
            })),
            "table": meta.table,
            "partitions": meta.partitions,
        });
        println!("{}", serde_json::to_string_pretty(&doc)?);
        return Ok(());
    }
    println!(
        "{} partition(s), id {:#x}, table version {:#x}",
        meta.partition_count(),
        meta.table.pdi_id,
        meta.table.version
    );
    for header in &meta.partitions {
        println!("  {header}");
    }
    Ok(())
}

fn run(mut loader: ImageLoader, mut image: LoadedImage) -> Result<()> {
    let mut mem = SimMemory::new();
    let mut staging = loader.staging_buffer();
    let summary = loader.load_all(&mut image, &mut staging, &mut mem)?;
    println!(
        "loaded {} of {} partition(s), {} skipped, {} command(s), {} deferred failure(s)",
        summary.loaded, summary.partitions, summary.skipped, summary.commands, summary.deferred
    );
    for (index, report) in image.reports() {
        for failure in &report.deferred {
            println!(
                "  partition {index}: command {}:{} at word {:#x} failed with {:#06x}",
                failure.module_id, failure.api_id, failure.offset, failure.code
            );
        }
    }
    let started = loader.start_cores(&mut image, &mut PrintingPm)?;
    println!("{started} core(s) released, {} memory write(s)", mem.write_count());
    Ok(())
}

fn main() -> Result<()> {
    env_logger::init();
    let cli = Cli::parse();
    match cli.cmd {
        Command::Inspect {
            image,
            source,
            offset,
            partial,
            json,
        } => {
            let (_, loaded) = open(&image, source, offset, partial, None)?;
            inspect(&loaded, json)
        }
        Command::Run {
            image,
            source,
            offset,
            partial,
            config,
        } => {
            let (loader, loaded) = open(&image, source, offset, partial, config.as_deref())?;
            run(loader, loaded)
        }
    }
}
