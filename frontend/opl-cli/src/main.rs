mod script;
mod wav;

use anyhow::Context;
use clap::Parser;
use env_logger::Env;
use opl_config::{ChipKind, OpllConfig};
use std::fs;
use std::path::PathBuf;
use ym_opl::{FmChip, Opl2, Opll};

// Both chips produce one internal update per 72 input clocks
const CLOCKS_PER_UPDATE: u32 = 72;

#[derive(Parser)]
struct Args {
    /// Register write script path
    #[arg(short = 'f', long)]
    script_path: PathBuf,

    /// Output WAV file path
    #[arg(short = 'o', long)]
    output_path: PathBuf,

    /// Chip to emulate
    #[arg(long, value_enum, default_value_t)]
    chip: ChipKind,

    /// OPLL input clocks per output sample (1-4); ignored for OPL2
    #[arg(long, default_value_t = 1)]
    audio_divider: u8,

    /// Chip input clock rate in Hz
    #[arg(long, default_value_t = 3_579_545)]
    clock_rate: u32,
}

fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(Env::default().default_filter_or("info")).init();

    let args = Args::parse();

    let script_text = fs::read_to_string(&args.script_path).with_context(|| {
        format!("Failed to read script from '{}'", args.script_path.display())
    })?;
    let commands = script::parse(&script_text)?;

    let (mut chip, sample_rate): (Box<dyn FmChip>, u32) = match args.chip.opll_variant() {
        None => (Box::new(Opl2::new()), args.clock_rate / CLOCKS_PER_UPDATE),
        Some(variant) => {
            let config = OpllConfig { variant, audio_divider: args.audio_divider };
            config.validate()?;
            (Box::new(Opll::new(config)), args.clock_rate / u32::from(args.audio_divider))
        }
    };

    log::info!("Playing {} commands through {} at {sample_rate} Hz", commands.len(), args.chip);

    let samples = script::run(&commands, &mut *chip);

    wav::write_file(&args.output_path, &samples, sample_rate).with_context(|| {
        format!("Failed to write WAV to '{}'", args.output_path.display())
    })?;

    log::info!("Wrote {} samples to '{}'", samples.len(), args.output_path.display());

    Ok(())
}
