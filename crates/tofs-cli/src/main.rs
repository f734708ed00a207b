#![forbid(unsafe_code)]
//! Host tool for tofs volume images: format, inspect, and move data in
//! and out of a file-backed volume.

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use serde::Serialize;
use std::io::{Read, Write};
use std::path::PathBuf;
use tofs::{
    FileDevice, FileInfo, FileName, Geometry, MountOptions, OpenOptions, Priority, Volume,
};

#[derive(Parser)]
#[command(name = "tofs", about = "tofs — transactional log-structured file store")]
struct Cli {
    /// Path to the volume image file.
    image: PathBuf,
    /// Block size as a power of two (2^offset_bits bytes).
    #[arg(long, default_value_t = 12)]
    offset_bits: u8,
    /// Number of erase blocks in the volume.
    #[arg(long, default_value_t = 256)]
    blocks: u32,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Erase and reformat the volume image.
    Format,
    /// List files with sizes and flags.
    Ls {
        /// Output in JSON format.
        #[arg(long)]
        json: bool,
    },
    /// Show one file's metadata.
    Stat {
        name: String,
        /// Output in JSON format.
        #[arg(long)]
        json: bool,
    },
    /// Append stdin (or an argument string) as one record.
    Append {
        name: String,
        /// Record payload; stdin is used when omitted.
        data: Option<String>,
        /// File priority to set on open.
        #[arg(long, value_parser = parse_priority)]
        priority: Option<Priority>,
    },
    /// Write every record of a file to stdout, in order.
    Cat {
        name: String,
        /// Advance the file's head past everything printed.
        #[arg(long)]
        consume: bool,
    },
    /// Delete a file.
    Rm { name: String },
}

fn parse_priority(s: &str) -> std::result::Result<Priority, String> {
    match s {
        "low" => Ok(Priority::Low),
        "normal" => Ok(Priority::Normal),
        "high" => Ok(Priority::High),
        other => Err(format!("unknown priority {other:?} (low|normal|high)")),
    }
}

#[derive(Debug, Serialize)]
struct FileReport {
    name: String,
    id: u32,
    priority: String,
    size: u32,
    head: u32,
    tail: u32,
}

impl From<&FileInfo> for FileReport {
    fn from(info: &FileInfo) -> Self {
        Self {
            name: info.name.to_string(),
            id: info.id.0,
            priority: info.flags.priority().to_string(),
            size: info.size,
            head: info.head,
            tail: info.tail,
        }
    }
}

fn parse_name(s: &str) -> Result<FileName> {
    s.parse()
        .with_context(|| format!("invalid file name {s:?}"))
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let geo = Geometry::new(cli.offset_bits, cli.blocks)
        .with_context(|| "invalid volume geometry")?;
    let dev = FileDevice::open(&cli.image, geo)
        .with_context(|| format!("cannot open image {}", cli.image.display()))?;

    match cli.command {
        Command::Format => {
            let vol = Volume::mount(
                dev,
                MountOptions {
                    auto_format: true,
                    ..MountOptions::default()
                },
            )?
            .reformat()?;
            let epoch = vol.epoch();
            vol.unmount()?;
            println!(
                "formatted: {} blocks of {} bytes (epoch {epoch})",
                cli.blocks,
                geo.block_size()
            );
        }
        Command::Ls { json } => {
            let vol = mount(dev)?;
            let mut reports = Vec::new();
            vol.for_each_file(|f| reports.push(FileReport::from(f)));
            if json {
                println!("{}", serde_json::to_string_pretty(&reports)?);
            } else {
                for r in &reports {
                    println!("{:<15} {:>8} bytes  {}", r.name, r.size, r.priority);
                }
            }
        }
        Command::Stat { name, json } => {
            let vol = mount(dev)?;
            let info = vol.stat(&parse_name(&name)?)?;
            let report = FileReport::from(&info);
            if json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                println!(
                    "{}: id {} priority {} size {} head {} tail {}",
                    report.name, report.id, report.priority, report.size, report.head, report.tail
                );
            }
        }
        Command::Append {
            name,
            data,
            priority,
        } => {
            let mut vol = mount(dev)?;
            let payload = match data {
                Some(s) => s.into_bytes(),
                None => {
                    let mut buf = Vec::new();
                    std::io::stdin().read_to_end(&mut buf)?;
                    buf
                }
            };
            if payload.is_empty() {
                bail!("refusing to append an empty record");
            }
            let mut opts = OpenOptions::append();
            if let Some(p) = priority {
                opts = opts.priority(p);
            }
            let file = parse_name(&name)?;
            let h = vol.open(&file, &opts)?;
            vol.write(h, &payload)?;
            vol.close(h)?;
            vol.unmount()?;
        }
        Command::Cat { name, consume } => {
            let mut vol = mount(dev)?;
            let file = parse_name(&name)?;
            let opts = if consume {
                OpenOptions::queue()
            } else {
                OpenOptions::read()
            };
            let h = vol.open(&file, &opts.dont_create())?;
            let mut out = std::io::stdout().lock();
            let mut buf = vec![0_u8; geo.block_size() as usize];
            loop {
                let n = vol.read(h, Some(&mut buf))?;
                if n == 0 {
                    break;
                }
                out.write_all(&buf[..n])?;
            }
            if consume {
                vol.bookmark(h)?;
            }
            vol.close(h)?;
            vol.unmount()?;
        }
        Command::Rm { name } => {
            let mut vol = mount(dev)?;
            vol.delete(&parse_name(&name)?)?;
            vol.unmount()?;
        }
    }
    Ok(())
}

fn mount(dev: FileDevice) -> Result<Volume<FileDevice>> {
    Volume::mount(
        dev,
        MountOptions {
            auto_format: false,
            ..MountOptions::default()
        },
    )
    .with_context(|| "mount failed (is the image formatted?)")
}
