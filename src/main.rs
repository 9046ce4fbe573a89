use clap::Parser;
use kgrid::{run_with_args, Args};

fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_default_env().init();
    run_with_args(Args::parse())
}
