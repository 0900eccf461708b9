// Copyright (c) 2023 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

use std::io::Read;
use std::path::PathBuf;

use canonical_error::{CanonicalError, invalid_argument_error};
use clap::Parser;
use log::info;

use front_capture::photo_store;

/// Decodes a Base64-encoded photo back into a file.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about=None)]
struct Args {
    /// File holding the Base64 text. Reads stdin when omitted.
    #[arg(short, long)]
    input: Option<PathBuf>,

    #[arg(short, long)]
    output: PathBuf,
}

fn main() -> Result<(), CanonicalError> {
    env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let text = match &args.input {
        Some(path) => std::fs::read_to_string(path),
        None => {
            let mut text = String::new();
            std::io::stdin().read_to_string(&mut text).map(|_| text)
        },
    }.map_err(|e| invalid_argument_error(format!("Could not read input: {}", e).as_str()))?;

    photo_store::base64_to_file(&text, &args.output)?;
    info!("Wrote {}", args.output.display());
    println!("{} {}", args.output.display(), photo_store::file_size(&args.output)?);
    Ok(())
}
