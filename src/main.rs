use std::fs::File;
use std::io::{BufWriter, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tracing_subscriber::EnvFilter;

use reloj::cli::{Cli, OutputFormat};
use reloj::engine::Engine;
use reloj::filter::ThreadFilter;
use reloj::recorder::{SampleRecorder, StatsRecorder};
use reloj::ring_buffer::RingBufferRecorder;
use reloj::runtime;
use reloj::wall_clock::WallClock;

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let args = cli.sampler_args();

    let filter = Arc::new(ThreadFilter::new());
    if cli.filter_workload {
        filter.set_enabled(true);
    }

    let stats = Arc::new(StatsRecorder::new());
    let ring: Option<Arc<RingBufferRecorder>> = match cli.format {
        OutputFormat::Text => None,
        OutputFormat::Jsonl => {
            let sink: Box<dyn Write + Send> = match &cli.output {
                Some(path) => Box::new(BufWriter::new(
                    File::create(path)
                        .with_context(|| format!("failed to create {}", path.display()))?,
                )),
                None => Box::new(std::io::stdout()),
            };
            Some(Arc::new(
                RingBufferRecorder::new(8192, sink).context("failed to start sample export")?,
            ))
        }
    };
    let recorder: Arc<dyn SampleRecorder> = match &ring {
        Some(ring) => Arc::clone(ring) as Arc<dyn SampleRecorder>,
        None => Arc::clone(&stats) as Arc<dyn SampleRecorder>,
    };

    let engine = WallClock::new(recorder, Arc::clone(&filter));
    engine.check(&args)?;

    let stop_flag = Arc::new(AtomicBool::new(false));
    let workers = spawn_workload(&cli, &filter, &stop_flag);

    engine.start(&args).context("failed to start sampler")?;
    std::thread::sleep(Duration::from_millis(cli.duration_ms));
    engine.stop();

    stop_flag.store(true, Ordering::Release);
    for worker in workers {
        let _ = worker.join();
    }

    match cli.format {
        OutputFormat::Text => stats.print_summary(),
        OutputFormat::Jsonl => {
            if let Some(ring) = ring {
                ring.shutdown();
                if ring.dropped() > 0 {
                    eprintln!("{} samples dropped (export queue full)", ring.dropped());
                }
            }
        }
    }

    Ok(())
}

/// Spawn the demo workload: spinners burn CPU, sleepers park in nanosleep.
/// Each thread attaches to the runtime facade and registers with the
/// thread filter so --filter-workload can single them out.
fn spawn_workload(
    cli: &Cli,
    filter: &Arc<ThreadFilter>,
    stop_flag: &Arc<AtomicBool>,
) -> Vec<std::thread::JoinHandle<()>> {
    let mut workers = Vec::new();

    for i in 0..cli.spinners {
        let filter = Arc::clone(filter);
        let stop_flag = Arc::clone(stop_flag);
        workers.push(std::thread::spawn(move || {
            let registration = runtime::attach(format!("spin-{i}"));
            filter.add(registration.tid());
            let mut acc = 0u64;
            while !stop_flag.load(Ordering::Acquire) {
                acc = acc.wrapping_mul(6364136223846793005).wrapping_add(1);
                std::hint::black_box(acc);
            }
            filter.remove(registration.tid());
        }));
    }

    for i in 0..cli.sleepers {
        let filter = Arc::clone(filter);
        let stop_flag = Arc::clone(stop_flag);
        workers.push(std::thread::spawn(move || {
            let registration = runtime::attach(format!("sleep-{i}"));
            filter.add(registration.tid());
            while !stop_flag.load(Ordering::Acquire) {
                std::thread::sleep(Duration::from_millis(5));
            }
            filter.remove(registration.tid());
        }));
    }

    workers
}
