//! Standalone reference tracker binary for local testing. Not part of the
//! library's public surface: a real deployment would run a tracker
//! maintained separately, so this only needs to be good enough to exercise
//! `download`/`upload` end to end against something other than a unit test's
//! in-process fake. Grounded on `examples/original_source/server.py`.

use std::net::TcpListener;

use clap::Parser;
use swarmd::tracker::tcp::{run_reference_tracker, DEFAULT_PORT};

#[derive(Parser, Debug)]
#[command(about = "Reference private-tracker server for local testing")]
struct Cli {
    #[arg(short, long, default_value_t = DEFAULT_PORT)]
    port: u16,
}

fn main() -> anyhow::Result<()> {
    env_logger::init();
    let args = Cli::parse();
    let listener = TcpListener::bind(("0.0.0.0", args.port))?;
    log::info!("reference tracker listening on {}", listener.local_addr()?);
    run_reference_tracker(listener)?;
    Ok(())
}
