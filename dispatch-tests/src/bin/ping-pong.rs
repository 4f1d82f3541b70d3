// SPDX-License-Identifier: MIT
//
// Author: Johannes Leupolz <dev@leupolz.eu>

use anyhow::Context;
use clap::Parser;
use dispatch_runtime::{context, Directory, RuntimeConfig};
use dispatch_tests::trace::ExecutionTrace;
use log::info;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Bounces tasks between a primary and a secondary dispatcher, then floods a pool.
#[derive(Debug, Parser)]
#[command(author, version, about)]
struct Args {
    /// Number of ping-pong round trips
    #[arg(long, default_value_t = 3)]
    rounds: usize,

    /// Number of tasks posted to the pool after the last round trip
    #[arg(long, default_value_t = 100)]
    burst: usize,

    /// Pool size (defaults to the configured size or the hardware concurrency)
    #[arg(long)]
    pool_size: Option<usize>,

    /// Runtime configuration (JSON encoded)
    #[arg(long, value_name = "JSON")]
    config: Option<String>,

    /// Print the execution trace as JSON
    #[arg(long)]
    json: bool,
}

struct Scenario {
    directory: Arc<Directory>,
    trace: Arc<ExecutionTrace>,
    rounds: usize,
    burst: usize,
}

fn ping(scenario: Arc<Scenario>, round: usize) {
    scenario.trace.record(format!("ping-{round}"));
    if round == scenario.rounds {
        burst(scenario);
        return;
    }

    let pong = scenario.clone();
    let next = scenario.clone();
    let posted = scenario.directory.post_task_and_reply_to(
        "secondary",
        move || pong.trace.record(format!("pong-{round}")),
        move || ping(next, round + 1),
    );
    if let Err(e) = posted {
        log::error!("ping-pong interrupted: {e}");
        context::end();
    }
}

fn burst(scenario: Arc<Scenario>) {
    let outstanding = Arc::new(AtomicUsize::new(scenario.burst));
    if scenario.burst == 0 {
        finish(&scenario);
        return;
    }

    let directory = scenario.directory.clone();
    for i in 0..scenario.burst {
        let scenario = scenario.clone();
        let outstanding = outstanding.clone();
        let posted = directory.post_task_to("pool", move || {
            scenario.trace.record(format!("burst-{i}"));
            if outstanding.fetch_sub(1, Ordering::AcqRel) == 1 {
                let done = scenario.clone();
                let _ = scenario
                    .directory
                    .post_task_to("primary", move || finish(&done));
            }
        });
        if let Err(e) = posted {
            log::error!("burst interrupted: {e}");
            context::end();
            return;
        }
    }
}

fn finish(scenario: &Scenario) {
    scenario.trace.record("finished");
    let _ = scenario.directory.stop("secondary");
    let _ = scenario.directory.stop("pool");
    context::end();
}

fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();
    let config = match &args.config {
        Some(json) => RuntimeConfig::from_json(json).context("failed to parse --config")?,
        None => RuntimeConfig::default(),
    };

    let directory = Directory::with_config(config);
    let trace = ExecutionTrace::new();

    directory.create_dispatcher("secondary")?;
    let pool = directory.create_pool("pool", args.pool_size)?;
    info!("Pool runs {} workers", pool.size());

    let scenario = Arc::new(Scenario {
        directory: directory.clone(),
        trace: trace.clone(),
        rounds: args.rounds,
        burst: args.burst,
    });
    directory.create_and_enter_dispatcher("primary", move || ping(scenario, 0))?;
    directory.wait_all();

    info!(
        "{} events recorded, {} tasks dispatched to the pool",
        trace.len(),
        pool.tasks_dispatched()
    );
    if args.json {
        println!("{}", trace.to_json()?);
    }
    Ok(())
}
