use clap::Parser;

use crate::{Result, VfsArgs};

#[derive(Parser, Debug)]
#[clap(about = "Print the size and page layout of a remote database")]
pub(crate) struct Args {
    /// URL of the database file.
    url: String,

    #[command(flatten)]
    vfs: VfsArgs,
}

pub(crate) fn run(args: Args) -> Result<()> {
    let handle = args.vfs.start()?;
    let mut consumer = handle.handshake()?;
    consumer.open(&args.url)?;
    let size = consumer.file_size(&args.url)?;
    let page_size = consumer.page_size(&args.url)?;
    let pages = (size + page_size as u64 - 1) / page_size as u64;
    println!("url: {}", args.url);
    println!("size: {size}, page_size: {page_size}, pages: {pages}");
    print!("{}", handle.stats());
    drop(consumer);
    handle.close()
}
