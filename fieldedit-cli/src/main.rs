use clap::{Parser, Subcommand};
use std::collections::HashMap;
use std::fs::File;
use std::path::PathBuf;
use std::process::exit;

use fieldedit_core::field::{FieldFile, SectionDirectory, SECTION_COUNT};
use fieldedit_core::{background, lgp::Lgp, lzs};

#[derive(Debug, Parser)]
#[command(name = "fieldedit", version, about = "Final Fantasy VII field asset tool")]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// List the entries of an LGP archive.
    List {
        archive: PathBuf,
    },
    /// Extract one archive member to a file.
    Extract {
        archive: PathBuf,
        name: String,
        /// Directory qualifier, only needed for conflicted names.
        #[arg(long, default_value = "")]
        dir: String,
        #[arg(long)]
        output: PathBuf,
    },
    /// Print the section directory of a compressed field file.
    Sections {
        field: PathBuf,
    },
    /// Decompress, rebuild and recompress a field file with no edits,
    /// verifying the output is byte-identical.
    Roundtrip {
        field: PathBuf,
    },
    /// Render a PS field background to a PNG.
    Background {
        /// Decompressed MIM member (palettes + texture pages).
        #[arg(long)]
        mim: PathBuf,
        /// Decompressed field DAT member.
        #[arg(long)]
        dat: PathBuf,
        #[arg(long)]
        output: PathBuf,
        /// Active parametric-tile states, as param=statebits pairs.
        #[arg(long = "param", value_name = "K=V")]
        params: Vec<String>,
    },
}

fn main() {
    let args = Args::parse();
    if let Err(message) = run(args.command) {
        eprintln!("{}", message);
        exit(1);
    }
}

fn run(command: Command) -> Result<(), String> {
    match command {
        Command::List { archive } => {
            let file = File::open(&archive).map_err(|e| format!("{:?}: {}", archive, e))?;
            let mut lgp = Lgp::open(file).map_err(|e| format!("{:?}: {}", archive, e))?;

            for (index, error) in lgp.entry_errors() {
                eprintln!("entry {}: {}", index, error);
            }
            for index in 0..lgp.len() {
                let size = lgp.entry_size(index).map(|s| s.to_string());
                let entry = &lgp.entries()[index];
                let dir = if entry.dir.is_empty() {
                    String::new()
                } else {
                    format!("{}/", entry.dir)
                };
                match size {
                    Ok(size) => println!("{}{}\t{}", dir, entry.name, size),
                    Err(e) => println!("{}{}\t({})", dir, entry.name, e),
                }
            }
            Ok(())
        }
        Command::Extract {
            archive,
            name,
            dir,
            output,
        } => {
            let file = File::open(&archive).map_err(|e| format!("{:?}: {}", archive, e))?;
            let mut lgp = Lgp::open(file).map_err(|e| format!("{:?}: {}", archive, e))?;
            let index = lgp
                .find(&name, &dir)
                .ok_or_else(|| format!("{:?} not found in {:?}", name, archive))?;
            let data = lgp
                .read_entry(index)
                .map_err(|e| format!("{:?}: {}", name, e))?;
            std::fs::write(&output, data).map_err(|e| format!("{:?}: {}", output, e))?;
            println!("extracted {} ({} bytes)", name, lgp.entry_size(index).unwrap_or(0));
            Ok(())
        }
        Command::Sections { field } => {
            let data = std::fs::read(&field).map_err(|e| format!("{:?}: {}", field, e))?;
            let file = FieldFile::open(data).map_err(|e| format!("{:?}: {}", field, e))?;
            let decompressed = file
                .decompress_all()
                .map_err(|e| format!("{:?}: {}", field, e))?;
            let dir = SectionDirectory::parse(&decompressed)
                .map_err(|e| format!("{:?}: {}", field, e))?;

            println!("decompressed size: {} (pad {})", decompressed.len(), dir.pad());
            for i in 0..SECTION_COUNT {
                let section = dir
                    .slice_section(&decompressed, i)
                    .map_err(|e| format!("section {}: {}", i + 1, e))?;
                println!(
                    "section {}: offset {:#010x}, {} bytes",
                    i + 1,
                    dir.offsets()[i],
                    section.len()
                );
            }
            Ok(())
        }
        Command::Roundtrip { field } => {
            let data = std::fs::read(&field).map_err(|e| format!("{:?}: {}", field, e))?;
            let file = FieldFile::open(data.clone()).map_err(|e| format!("{:?}: {}", field, e))?;
            let saved = file.save(true).map_err(|e| format!("{:?}: {}", field, e))?;
            if saved == data {
                println!("{:?}: OK, {} bytes", field, data.len());
                Ok(())
            } else {
                Err(format!(
                    "{:?}: MISMATCH (input {} bytes, output {} bytes)",
                    field,
                    data.len(),
                    saved.len()
                ))
            }
        }
        Command::Background {
            mim,
            dat,
            output,
            params,
        } => {
            let mim_raw = std::fs::read(&mim).map_err(|e| format!("{:?}: {}", mim, e))?;
            let dat_raw = std::fs::read(&dat).map_err(|e| format!("{:?}: {}", dat, e))?;
            let mim_dec =
                lzs::decompress(&mim_raw[4.min(mim_raw.len())..], 0).map_err(|e| e.to_string())?;
            let dat_dec =
                lzs::decompress(&dat_raw[4.min(dat_raw.len())..], 0).map_err(|e| e.to_string())?;

            let mut active = HashMap::new();
            for pair in &params {
                let (k, v) = pair
                    .split_once('=')
                    .ok_or_else(|| format!("bad --param {:?}, expected K=V", pair))?;
                let k: u8 = k.parse().map_err(|_| format!("bad param key {:?}", k))?;
                let v: u8 = v.parse().map_err(|_| format!("bad param state {:?}", v))?;
                active.insert(k, v);
            }

            match background::composite(&mim_dec, &dat_dec, &active, [-1, -1], None)
                .map_err(|e| e.to_string())?
            {
                Some(image) => {
                    image.save(&output).map_err(|e| format!("{:?}: {}", output, e))?;
                    println!(
                        "wrote {:?} ({}x{})",
                        output,
                        image.width(),
                        image.height()
                    );
                    Ok(())
                }
                None => Err("background has no visible tiles".to_string()),
            }
        }
    }
}
