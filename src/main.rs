//! Monitor ATA and SCSI SMART devices and warn on health degradation

#![cfg_attr(
    feature = "generate-extras",
    expect(dead_code, unused_crate_dependencies, unused_imports)
)]

use clap::Parser as _;

mod bitset;
mod check;
mod cl;
mod comparator;
mod config;
mod daemon;
mod device;
#[cfg(feature = "generate-extras")]
mod extras;
mod logging;
mod notifier;
mod pidfile;
mod platform;
mod registration;
mod scheduler;
mod signals;
#[cfg(test)]
mod tests;

#[cfg(feature = "generate-extras")]
fn main() -> anyhow::Result<()> {
    let dir = std::env::args_os()
        .nth(1)
        .ok_or_else(|| anyhow::anyhow!("missing output directory argument"))?;
    let dir = std::path::Path::new(&dir);
    extras::generate_man_pages(dir)?;
    extras::generate_shell_completions(None, Some(dir))?;
    Ok(())
}

#[cfg(not(feature = "generate-extras"))]
fn main() -> anyhow::Result<()> {
    use anyhow::Context as _;

    let args = cl::Args::parse();

    let level = if args.debug {
        log::LevelFilter::Debug
    } else {
        log::LevelFilter::Info
    };
    logging::init(args.debug, args.facility, level).context("failed to init logger")?;

    let status = daemon::run(&args);
    std::process::exit(status.code());
}
