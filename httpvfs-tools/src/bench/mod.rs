use std::{
    fmt, thread,
    time::{Duration, Instant},
};

use clap::{Parser, ValueEnum};
use hdrhistogram::Histogram;
use httpvfs::Handle;
use log::warn;
use rand::{rngs::SmallRng, Rng, SeedableRng};

use crate::{Error, Result, VfsArgs};

#[derive(Parser, Debug, Clone)]
#[clap(about = "Start bench testing")]
pub(crate) struct Args {
    /// URL of the database file.
    url: String,

    /// Number of concurrent consumer threads.
    #[arg(short, long, default_value_t = 4)]
    threads: u64,

    /// Number of page reads per thread.
    #[arg(short, long, default_value_t = 1000)]
    reads: u64,

    /// The order in which pages are read.
    #[arg(short, long, default_value_t = AccessMode::Sequential)]
    mode: AccessMode,

    /// Seed of the random page generator.
    #[arg(long, default_value_t = 301)]
    seed: u64,

    /// Print latency percentiles.
    #[arg(long, default_value_t = false)]
    hist: bool,

    #[command(flatten)]
    vfs: VfsArgs,
}

#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, ValueEnum, Debug)]
pub(crate) enum AccessMode {
    Sequential,
    Random,
}

impl fmt::Display for AccessMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AccessMode::Sequential => f.pad("sequential"),
            AccessMode::Random => f.pad("random"),
        }
    }
}

/// Results of one bench thread.
struct Report {
    done: u64,
    errors: u64,
    bytes: u64,
    hist: Histogram<u64>,
}

impl Report {
    fn new() -> Result<Self> {
        let hist = Histogram::new_with_bounds(1, 60 * 60 * 1000 * 1000, 2)
            .map_err(|err| Error::Setup(format!("histogram: {err}")))?;
        Ok(Self {
            done: 0,
            errors: 0,
            bytes: 0,
            hist,
        })
    }

    fn record(&mut self, elapsed: Duration, read: Result<usize>) {
        match read {
            Ok(n) => {
                self.done += 1;
                self.bytes += n as u64;
            }
            Err(err) => {
                warn!("read failed: {err}");
                self.errors += 1;
            }
        }
        self.hist.saturating_record(elapsed.as_micros() as u64);
    }

    fn merge(&mut self, o: &Report) -> Result<()> {
        self.done += o.done;
        self.errors += o.errors;
        self.bytes += o.bytes;
        self.hist
            .add(&o.hist)
            .map_err(|err| Error::Setup(format!("histogram: {err}")))
    }
}

#[derive(Clone, Copy)]
struct Layout {
    page_size: u32,
    pages: u64,
}

pub(crate) fn run(args: Args) -> Result<()> {
    let handle = args.vfs.start()?;
    let mut consumer = handle.handshake()?;
    consumer.open(&args.url)?;
    let size = consumer.file_size(&args.url)?;
    let page_size = consumer.page_size(&args.url)?;
    let layout = Layout {
        page_size,
        pages: ((size + page_size as u64 - 1) / page_size as u64).max(1),
    };
    drop(consumer);

    let before = handle.stats();
    let start = Instant::now();
    let mut threads = Vec::with_capacity(args.threads as usize);
    for tid in 0..args.threads {
        let handle = handle.clone();
        let args = args.clone();
        threads.push(thread::spawn(move || bench_thread(tid, &args, &handle, &layout)));
    }
    let mut total = Report::new()?;
    for thread in threads {
        let report = thread
            .join()
            .map_err(|_| Error::Protocol("bench thread panicked".to_owned()))??;
        total.merge(&report)?;
    }
    let elapsed = start.elapsed();

    let bytes_rate = (total.bytes as f64 / 1024. / 1024.) / elapsed.as_secs_f64();
    println!(
        "{:12} : {} ops, {} errors, {:.3} sec, {:.0} ops/sec, {:.3} MiB/s",
        args.mode,
        total.done,
        total.errors,
        elapsed.as_secs_f64(),
        total.done as f64 / elapsed.as_secs_f64(),
        bytes_rate,
    );
    if args.hist {
        display_hist(&total.hist);
    }
    print!("{}", handle.stats().sub(&before));
    handle.close()
}

fn bench_thread(tid: u64, args: &Args, handle: &Handle, layout: &Layout) -> Result<Report> {
    let mut consumer = handle.handshake()?;
    let mut rng = SmallRng::seed_from_u64(args.seed.wrapping_add(tid));
    let mut report = Report::new()?;
    let mut buf = vec![0u8; layout.page_size as usize];
    // Sequential threads start evenly spread over the file.
    let first = tid * layout.pages / args.threads.max(1);
    for i in 0..args.reads {
        let page = match args.mode {
            AccessMode::Sequential => (first + i) % layout.pages,
            AccessMode::Random => rng.gen_range(0..layout.pages),
        };
        let start = Instant::now();
        let read = consumer.read(&args.url, page * layout.page_size as u64, &mut buf);
        report.record(start.elapsed(), read);
    }
    Ok(report)
}

fn display_hist(hist: &Histogram<u64>) {
    println!(
        "Percentiles : P50: {} us, P75: {} us, P99: {} us, P99.9: {} us, P99.99: {} us",
        hist.value_at_quantile(0.50),
        hist.value_at_quantile(0.75),
        hist.value_at_quantile(0.99),
        hist.value_at_quantile(0.999),
        hist.value_at_quantile(0.9999),
    )
}
