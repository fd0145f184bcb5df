use std::io::{self, Write};

use clap::Parser;

use crate::{Error, Result, VfsArgs};

#[derive(Parser, Debug)]
#[clap(about = "Dump one page of a remote database")]
pub(crate) struct Args {
    /// URL of the database file.
    url: String,

    /// Index of the page to read.
    #[arg(short, long, default_value_t = 0)]
    page: u64,

    /// Write the raw bytes instead of a hex dump.
    #[arg(long, default_value_t = false)]
    raw: bool,

    #[command(flatten)]
    vfs: VfsArgs,
}

pub(crate) fn run(args: Args) -> Result<()> {
    let handle = args.vfs.start()?;
    let mut consumer = handle.handshake()?;
    consumer.open(&args.url)?;
    let page_size = consumer.page_size(&args.url)?;
    let mut buf = vec![0u8; page_size as usize];
    let n = consumer.read(&args.url, args.page * page_size as u64, &mut buf)?;
    buf.truncate(n);
    drop(consumer);
    handle.close()?;

    let mut out = io::stdout().lock();
    let written = if args.raw {
        out.write_all(&buf)
    } else {
        hexdump(&mut out, args.page * page_size as u64, &buf)
    };
    written.map_err(|err| Error::Setup(format!("stdout: {err}")))
}

fn hexdump(out: &mut impl Write, base: u64, data: &[u8]) -> io::Result<()> {
    for (i, line) in data.chunks(16).enumerate() {
        write!(out, "{:08x}:", base + i as u64 * 16)?;
        for b in line {
            write!(out, " {b:02x}")?;
        }
        let text: String = line
            .iter()
            .map(|b| if b.is_ascii_graphic() { *b as char } else { '.' })
            .collect();
        writeln!(out, "{:pad$}  {text}", "", pad = (16 - line.len()) * 3)?;
    }
    Ok(())
}
