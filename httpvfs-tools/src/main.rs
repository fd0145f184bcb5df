//! A set of tools for httpvfs.

mod bench;
mod read;
mod stat;

use std::time::Duration;

use clap::{Parser, Subcommand};
use httpvfs::{Dispatcher, Handle, HttpFetcher, Options};
pub(crate) use httpvfs::{Error, Result};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    #[command(subcommand)]
    cmd: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    Stat(stat::Args),
    Read(read::Args),
    Bench(bench::Args),
}

/// Dispatcher options shared by all commands.
#[derive(clap::Args, Debug, Clone)]
pub(crate) struct VfsArgs {
    /// Bytes the page cache may keep resident.
    #[arg(long, default_value_t = 32 << 20)]
    cache_capacity: usize,

    /// The largest page size accepted.
    #[arg(long, default_value_t = 64 << 10)]
    max_page_size: u32,

    /// The upper bound of a coalesced fetch.
    #[arg(long, default_value_t = 1 << 20)]
    max_super_page_size: usize,

    /// Timeout of a single request in seconds, 0 disables it.
    #[arg(long, default_value_t = 60)]
    timeout: u64,

    /// Extra request header as `name: value`, may be repeated.
    #[arg(short = 'H', long = "header", value_parser = parse_header)]
    headers: Vec<(String, String)>,
}

impl VfsArgs {
    fn options(&self) -> Options {
        let mut options = Options::default();
        options.cache_capacity = self.cache_capacity;
        options.max_page_size = self.max_page_size;
        options.max_super_page_size = self.max_super_page_size;
        options.fetch_timeout = (self.timeout > 0).then(|| Duration::from_secs(self.timeout));
        for (name, value) in &self.headers {
            options = options.with_header(name, value);
        }
        options
    }

    /// Spawns and initializes a dispatcher.
    pub(crate) fn start(&self) -> Result<Handle> {
        let handle = Dispatcher::spawn(HttpFetcher::new()?)?;
        handle.init(self.options())?;
        Ok(handle)
    }
}

fn parse_header(s: &str) -> std::result::Result<(String, String), String> {
    let (name, value) = s
        .split_once(':')
        .ok_or_else(|| format!("invalid header `{s}`, expect `name: value`"))?;
    Ok((name.trim().to_owned(), value.trim().to_owned()))
}

fn main() -> Result<()> {
    env_logger::init();
    let args = Args::parse();
    match args.cmd {
        Commands::Stat(args) => stat::run(args)?,
        Commands::Read(args) => read::run(args)?,
        Commands::Bench(args) => bench::run(args)?,
    }
    Ok(())
}
