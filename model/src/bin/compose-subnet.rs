use clap::Parser;
use std::path::PathBuf;
use trace_model::{
    compose::{self, Subnet, DEFAULT_SUBNET},
    init_logging,
};

/// Pin the default network of a docker-compose application to a fixed subnet.
///
/// Every service is attached to the default network. The file is rewritten in place.
#[derive(Parser)]
struct Options {
    /// The docker-compose file to update.
    #[clap(
        short,
        long,
        env = "COMPOSE_FILE",
        value_name = "FILE",
        default_value = "docker-compose.yml"
    )]
    file: PathBuf,

    /// The subnet for the default network, in CIDR notation.
    #[clap(short, long, env = "COMPOSE_SUBNET", default_value = DEFAULT_SUBNET)]
    subnet: Subnet,
}

fn main() -> Result<(), anyhow::Error> {
    init_logging();

    let opt = Options::parse();
    compose::update_file(&opt.file, opt.subnet)?;
    println!("{} updated successfully.", opt.file.display());
    Ok(())
}
