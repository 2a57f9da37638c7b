//! strata-unpack: Pack a dense weight with a backend layout, unpack it, and check the round trip.

use std::path::PathBuf;
use std::process;

use clap::Parser;

use strata_qlinear::cli;
use strata_qlinear::packed::{available_backends, LinearPackedParams, PackedLinearWeight};
use strata_qlinear::tensor::TensorDtype;
use strata_qlinear::PackingConfig;

#[derive(Parser)]
#[command(name = "strata-unpack", about = "Pack and unpack a linear weight")]
struct Args {
    /// JSON weight file (rows, cols, values, optional scheme/scales/zero_points/bias)
    #[arg(short = 'w', long, required_unless_present = "list_backends")]
    weight: Option<PathBuf>,

    /// Packed layout: auto, blocked-int8, q8gemm, fp16, passthrough
    #[arg(short = 'b', long, default_value = "auto")]
    backend: String,

    /// JSON packing config (tile sizes, retain_original)
    #[arg(short = 'c', long)]
    config: Option<PathBuf>,

    /// Output format: text or json
    #[arg(long, default_value = "text", value_parser = validate_output_format)]
    output_format: String,

    /// Print the backends compiled into this build and exit
    #[arg(long)]
    list_backends: bool,

    /// Suppress all logging
    #[arg(long)]
    log_disable: bool,
}

fn validate_output_format(s: &str) -> Result<String, String> {
    match s {
        "text" | "json" => Ok(s.to_string()),
        _ => Err(format!("Unknown output format '{}'. Options: text, json", s)),
    }
}

fn main() {
    let args = Args::parse();
    cli::init_logging(args.log_disable);

    if let Err(e) = run(args) {
        eprintln!("Error: {}", e);
        process::exit(1);
    }
}

fn run(args: Args) -> Result<(), Box<dyn std::error::Error>> {
    if args.list_backends {
        for kind in available_backends() {
            println!("{}", kind);
        }
        return Ok(());
    }

    let config = match &args.config {
        Some(path) => PackingConfig::from_file(path)?,
        None => PackingConfig::default(),
    };
    let weight_path = args.weight.ok_or("--weight is required")?;
    let (weight, bias) = cli::load_weight_file(&weight_path)?;

    let kind = cli::backend::resolve_backend(
        Some(args.backend.as_str()),
        weight.dtype() == TensorDtype::F32,
    )?;
    let packed = PackedLinearWeight::prepack(kind, weight, bias, &config)?;
    let unpacked = packed.unpack()?;

    let repacked = packed.repack(&config)?;
    let round_trip = *repacked.unpack()?.0 == *unpacked.0;

    let report = cli::UnpackReport::new(kind, &unpacked, round_trip);
    match args.output_format.as_str() {
        "json" => println!("{}", serde_json::to_string_pretty(&report)?),
        _ => print!("{}", report.to_text()),
    }

    if !round_trip {
        return Err("repacked weight does not match the unpacked weight".into());
    }
    Ok(())
}
