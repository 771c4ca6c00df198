//! # strata - Demo Entry Point
//!
//! Runs a multi-threaded workload against a simulated coprocessor with the
//! activity, allocator and metadata services on one channel, then flushes,
//! finishes and prints the counters.

#![allow(clippy::too_many_lines, clippy::cast_possible_truncation)]

use anyhow::{Context, Result};
use clap::Parser;
use log::info;
use std::fs::File;
use std::io::BufWriter;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use strata::attribute::{AttrFlags, AttrType};
use strata::channel::Instrumentation;
use strata::cli::Args;
use strata::config::ChannelConfig;
use strata::domain::ConfigError;
use strata::export::JsonLinesWriter;
use strata::services::{
    register_configured, AllocatorTable, Category, MetaValue, MetadataTable, ServiceSources, SERVICE_NAMES,
};
use strata::snapshot::SnapshotView;
use strata::source::SimulatedDevice;

// Exit codes
const EXIT_SUCCESS: i32 = 0;
const EXIT_ERROR: i32 = 1;
const EXIT_USAGE: i32 = 2;

const KERNELS: [&str; 3] = [
    "_ZN6solver6matmul17h0123456789abcdefE",
    "_ZN6solver7stencil17hfedcba9876543210E",
    "reduce_sum",
];

fn main() {
    env_logger::init();
    std::process::exit(match run() {
        Ok(()) => EXIT_SUCCESS,
        Err(e) => {
            let code = exit_code_for(&e);
            eprintln!("error: {e:#}");
            code
        }
    });
}

/// Simulated kernel runtime for iteration `k`, between 200 and 499 ns
fn kernel_duration_ns(k: u32) -> u64 {
    200 + u64::from(k) * 37 % 300
}

fn exit_code_for(err: &anyhow::Error) -> i32 {
    if err.chain().any(|cause| cause.downcast_ref::<ConfigError>().is_some()) {
        EXIT_USAGE
    } else {
        EXIT_ERROR
    }
}

fn load_config(args: &Args) -> Result<ChannelConfig> {
    let mut config = match &args.config {
        Some(path) => ChannelConfig::from_file(path)
            .with_context(|| format!("Failed to load channel config {}", path.display()))?,
        None => ChannelConfig { services: SERVICE_NAMES.map(String::from).to_vec(), ..ChannelConfig::default() },
    };
    args.apply(&mut config)?;
    Ok(config)
}

fn publish_metadata(table: &MetadataTable, args: &Args) {
    let launched = SystemTime::now().duration_since(UNIX_EPOCH).map_or(0, |d| d.as_secs());

    table.set("threads", Category::GENERAL, "workload", MetaValue::Uint(args.threads));
    table.set("kernels.per.thread", Category::GENERAL, "workload", MetaValue::Uint(args.kernels));
    table.set("launchdate", Category::GENERAL, "", MetaValue::Date(launched));
    table.set("strata.version", Category::GENERAL, "", MetaValue::Version(env!("CARGO_PKG_VERSION").to_string()));
    table.set(
        "grid",
        Category::PERFORMANCE,
        "",
        MetaValue::Tuple(vec![MetaValue::Int(64), MetaValue::Int(64), MetaValue::Int(1)]),
    );
    table.set("log.level", Category::CONTROL, "", MetaValue::Str("info".to_string()));
}

fn run() -> Result<()> {
    let args = Args::parse();
    let config = load_config(&args)?;

    let instr = Instrumentation::new();
    let channel = instr.create_channel("demo", config);

    let device = Arc::new(SimulatedDevice::new(0));
    let allocators = Arc::new(AllocatorTable::new());
    let metadata = Arc::new(MetadataTable::new());
    publish_metadata(&metadata, &args);

    let sources = ServiceSources {
        activity: Some(device.clone()),
        allocator: Some(allocators.clone()),
        metadata: Some(metadata.clone()),
    };
    let services = register_configured(&channel, &sources);

    let records = Arc::new(AtomicU64::new(0));
    {
        let records = Arc::clone(&records);
        channel.events().on_process_snapshot(move |_, _| {
            records.fetch_add(1, Ordering::Relaxed);
        });
    }

    let exporter = match &args.export {
        Some(path) => {
            let file = File::create(path).with_context(|| format!("Failed to create export file {}", path.display()))?;
            Some(JsonLinesWriter::register(&channel, BufWriter::new(file)))
        }
        None => None,
    };

    channel.init();

    let region = instr.create_attribute("region", AttrType::Str, AttrFlags::NESTED, &[]);
    let iteration = instr.create_attribute("iteration", AttrType::Uint, AttrFlags::DEFAULT, &[]);

    let kernels = args.kernels;
    std::thread::scope(|scope| -> Result<()> {
        let workers: Vec<_> = (0..args.threads)
            .map(|t| {
                let (instr, channel, device, allocators) = (&instr, &channel, &device, &allocators);
                let (region, iteration) = (&region, &iteration);
                scope.spawn(move || -> Result<()> {
                    instr.begin(region, format!("worker-{t}"));
                    for k in 0..kernels {
                        instr.begin(iteration, k);
                        let kernel = KERNELS[(k as usize + t as usize) % KERNELS.len()];
                        device.launch_kernel(kernel, kernel_duration_ns(k));
                        if k % 4 == 0 {
                            allocators.allocate("device", 1 << 20);
                            device.memcpy(1 << 20, 50);
                        }
                        instr.with_thread_context(|ctx| channel.push_snapshot(ctx, SnapshotView::empty()));
                        instr.end(iteration)?;
                    }
                    device.synchronize();
                    instr.end(region)?;
                    Ok(())
                })
            })
            .collect();

        for worker in workers {
            worker.join().map_err(|_| anyhow::anyhow!("workload thread panicked"))??;
        }
        Ok(())
    })?;

    channel.flush();
    channel.finish();

    if let Some(exporter) = &exporter {
        info!("exported {} records ({} errors)", exporter.written(), exporter.errors());
    }

    if !args.quiet {
        let stats = channel.stats();
        println!("channel '{}'", channel.name());
        println!("  records processed:   {}", records.load(Ordering::Relaxed));
        println!("  snapshots:           {}", stats.snapshots);
        println!("  flushes:             {}", stats.flushes);
        println!("  fields dropped:      {}", stats.fields_dropped);

        if let Some(activity) = &services.activity {
            let a = activity.stats();
            println!("activity");
            println!("  buffers drained:     {}", a.flush.flushes);
            println!("  records:             {} ({} flushed, {} skipped)", a.flush.records, a.flush.flushed, a.flush.skipped);
            println!(
                "  correlations:        {} stored, {} found, {} missed, {} duplicates",
                a.correlations.stored, a.correlations.found, a.correlations.missed, a.correlations.duplicates
            );
        }
        if let Some(metadata) = &services.metadata {
            println!("metadata");
            println!("  values imported:     {}", metadata.imported());
        }
        if let Some(exporter) = &exporter {
            println!("export");
            println!("  records written:     {}", exporter.written());
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kernel_duration_stays_in_range_for_any_iteration() {
        assert_eq!(kernel_duration_ns(0), 200);
        assert_eq!(kernel_duration_ns(1), 237);
        for k in [116_080_000, u32::MAX - 1, u32::MAX] {
            assert!((200..500).contains(&kernel_duration_ns(k)));
        }
    }
}
