//! Demonstrates building a `dfcore_config::Configuration` from the
//! command line. `Configuration` is a plain `serde`-derived struct so a
//! CLI layer outside the core can lay `#[derive(clap::Parser)]` over it
//! without restructuring it (§6.3); this binary is that thin layer, not
//! part of the core itself.

use clap::Parser;
use dfcore::{Configuration, Transport};

#[derive(Parser, Debug)]
#[command(about = "Print the effective dfcore Configuration for a run")]
struct Args {
    #[arg(long, default_value_t = 1)]
    workers_per_host: usize,

    #[arg(long, default_value_t = 2 * 1024 * 1024)]
    block_size: usize,

    #[arg(long, default_value_t = 1024 * 1024 * 1024)]
    ram_limit: usize,

    #[arg(long, default_value_t = 512 * 1024 * 1024)]
    stage_mem: usize,

    #[arg(long, default_value = ".")]
    workdir: std::path::PathBuf,

    #[arg(long, value_enum, default_value_t = CliTransport::Mock)]
    transport: CliTransport,

    #[arg(long)]
    enable_location_detection: bool,
}

#[derive(Copy, Clone, Debug, clap::ValueEnum)]
enum CliTransport {
    Tcp,
    Mpi,
    Mock,
}

impl From<CliTransport> for Transport {
    fn from(t: CliTransport) -> Self {
        match t {
            CliTransport::Tcp => Transport::Tcp,
            CliTransport::Mpi => Transport::Mpi,
            CliTransport::Mock => Transport::Mock,
        }
    }
}

fn main() {
    let args = Args::parse();
    let config = Configuration {
        workers_per_host: args.workers_per_host,
        block_size: args.block_size,
        ram_limit: args.ram_limit,
        stage_mem: args.stage_mem,
        workdir: args.workdir,
        transport: args.transport.into(),
        enable_location_detection: args.enable_location_detection,
        ..Configuration::default()
    };
    println!("{}", serde_json::to_string_pretty(&config).expect("Configuration is always serializable"));
}
