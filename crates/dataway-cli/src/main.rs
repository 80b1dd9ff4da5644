//! 🚀 dataway-cli — the front door. Loads config, sets up logging, starts the flushers,
//! optionally feeds them line protocol, and prints what got delivered on the way out.
//!
//! 🎬 *[narrator voice]* "It all started with a simple main() function..." 🦆

use std::collections::BTreeMap;
use std::io::Read;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use comfy_table::Table;
use dataway::{Category, Dataway, Encoding, point};
use prometheus::Registry;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

/// 📡 Ship line-protocol points to a dataway.
#[derive(Debug, Parser)]
#[command(name = "dataway-cli", version)]
struct Cli {
    /// TOML config file; `DW_*` env vars fill in (and are overridden by) it
    #[arg(long, short, default_value = "dataway.toml")]
    config: PathBuf,

    /// category the input points are written as
    #[arg(long, default_value = "logging")]
    category: Category,

    /// line-protocol file to send, `-` for stdin
    #[arg(long)]
    input: Option<String>,

    /// points per write call
    #[arg(long, default_value_t = 1000)]
    batch: usize,

    /// exit once the queues are empty instead of waiting for ctrl-c
    #[arg(long)]
    drain: bool,
}

fn read_input(input: &str) -> Result<Vec<u8>> {
    let mut data = Vec::new();
    if input == "-" {
        std::io::stdin().read_to_end(&mut data).context("💀 could not read points from stdin")?;
    } else {
        data = std::fs::read(input).with_context(|| format!("💀 could not read points from '{input}'"))?;
    }
    Ok(data)
}

async fn feed(dw: &Dataway, cli: &Cli, input: &str) -> Result<usize> {
    let owned = input.to_string();
    let data = tokio::task::spawn_blocking(move || read_input(&owned)).await.context("💀 input reader panicked")??;
    let points = point::decode(Encoding::LineProtocol, &data).context("💀 input is not valid line protocol")?;
    let total = points.len();

    let mut points = points.into_iter().peekable();
    while points.peek().is_some() {
        let chunk: Vec<_> = points.by_ref().take(cli.batch.max(1)).collect();
        dw.write(dw.write_options(cli.category), chunk).await.context("💀 write rejected")?;
    }
    info!("📥 queued {} points as {}", total, cli.category);
    Ok(total)
}

/// 🍽️ Point and byte counters per category and status, straight out of the registry.
fn summary(registry: &Registry) -> Table {
    let mut rows: BTreeMap<(String, String), (f64, f64)> = BTreeMap::new();
    for mf in registry.gather() {
        let is_points = mf.get_name() == "dataway_point_total";
        let is_bytes = mf.get_name() == "dataway_bytes_total";
        if !is_points && !is_bytes {
            continue;
        }
        for m in mf.get_metric() {
            let label = |name: &str| {
                m.get_label().iter().find(|l| l.get_name() == name).map(|l| l.get_value().to_string()).unwrap_or_default()
            };
            if is_bytes && label("enc") != "gzip" {
                continue;
            }
            let row = rows.entry((label("category"), label("status"))).or_default();
            if is_points {
                row.0 += m.get_counter().get_value();
            } else {
                row.1 += m.get_counter().get_value();
            }
        }
    }

    let mut table = Table::new();
    table.set_header(vec!["category", "status", "points", "bytes (gzip)"]);
    for ((cat, status), (pts, bytes)) in rows {
        table.add_row(vec![cat, status, format!("{pts}"), format!("{bytes}")]);
    }
    table
}

async fn run(cli: Cli) -> Result<()> {
    let config_file = cli
        .config
        .try_exists()
        .with_context(|| {
            format!(
                "💀 Configuration file may not exist, couldn't check it. Use an absolute path to be sure. Was checking here: '{}'",
                cli.config.display()
            )
        })?
        .then_some(cli.config.as_path());

    let app_config = dataway::app_config::load_config(config_file)
        .context("💀 In dataway-cli, main, we couldn't load the config file, take a look at it and make sure it's correct")?;

    let registry = Registry::new();
    let (dw, workers) = dataway::start(app_config, &registry)?;

    if let Some(input) = cli.input.as_deref() {
        feed(&dw, &cli, input).await?;
    }

    if cli.drain {
        while !dw.is_drained() {
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        // the last bodies may still be in flight
        tokio::time::sleep(Duration::from_millis(500)).await;
    } else {
        info!("🛑 running, ctrl-c to stop");
        tokio::signal::ctrl_c().await.context("💀 could not listen for ctrl-c")?;
    }

    dw.context().exit.trigger();
    workers.await.context("💀 the supervisor panicked")??;

    for q in dw.queue_stats().iter().filter(|q| q.mem_len > 0 || q.disk_bytes > 0) {
        info!("📦 {} left behind: {} in memory, {} bytes on disk", q.queue, q.mem_len, q.disk_bytes);
    }
    println!("{}", summary(&registry));
    Ok(())
}

/// 🚀 main() — init tracing, run, and if it all goes sideways, explain why.
#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt().with_env_filter(EnvFilter::from_default_env()).init();

    let result = run(Cli::parse()).await;

    if let Err(err) = result {
        error!("💀 error: {}", err);
        // -- 🧅 peel the onion of sadness, one layer at a time
        let mut the_vibes_are_giving_connection_issues = false;
        for cause in err.chain().skip(1) {
            error!("⚠️  cause: {}", cause);
            let cause_str = cause.to_string();
            if cause_str.contains("error sending request")
                || cause_str.contains("connection refused")
                || cause_str.contains("Connection refused")
                || cause_str.contains("tcp connect error")
                || cause_str.contains("dns error")
            {
                the_vibes_are_giving_connection_issues = true;
            }
        }

        if the_vibes_are_giving_connection_issues {
            error!(
                "🔧 hint: looks like the dataway isn't reachable. \
                Double-check the URLs in [dataway] urls, the proxy setting, and that the host \
                can actually reach it (`curl -v <url>/v1/ntp/` is a cheap smoke test). ☕"
            );
        }

        std::process::exit(1);
    }

    Ok(())
}
