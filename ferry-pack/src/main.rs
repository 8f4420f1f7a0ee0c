use clap::Parser;
use ferry_pack::PackType;
use std::{path::PathBuf, process::ExitCode};

#[derive(Parser)]
#[command(name = "ferry-pack")]
#[command(about = "Convert glTF models into Ferry streaming containers")]
#[command(version)]
struct Cli {
    /// Input glTF/GLB file
    #[arg(short, long)]
    input: PathBuf,

    /// Output container, `.pak` is appended without an extension
    #[arg(short, long)]
    output: PathBuf,

    /// Compression of the payload
    #[arg(short = 't', long = "type", value_enum, default_value_t)]
    pack_type: PackType,
}

fn main() -> ExitCode {
    env_logger::init();
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) if e.use_stderr() => {
            let _ = e.print();
            return ExitCode::FAILURE;
        }
        Err(e) => e.exit(),
    };

    let output = ferry_pack::output_path(&cli.output);
    println!("Compression type: {:?}", cli.pack_type);
    match ferry_pack::pack(&cli.input, &output, cli.pack_type) {
        Ok(_) => {
            println!("Converted {:?} into {:?}", cli.input, output);
            ExitCode::SUCCESS
        }
        Err(e) => {
            log::error!("Conversion failed: {:#}", e);
            eprintln!("Error: {:#}", e);
            ExitCode::FAILURE
        }
    }
}
