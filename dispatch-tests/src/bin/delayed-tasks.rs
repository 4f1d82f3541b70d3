// SPDX-License-Identifier: MIT
//
// Author: Johannes Leupolz <dev@leupolz.eu>

use clap::Parser;
use dispatch_runtime::{context, Directory, DispatcherBuilder, TaskPriority};
use dispatch_tests::trace::ExecutionTrace;
use log::{info, warn};
use std::time::Duration;

/// Schedules delayed tasks in reverse order and reports when each one ran.
#[derive(Debug, Parser)]
#[command(author, version, about)]
struct Args {
    /// Number of delayed tasks
    #[arg(long, default_value_t = 5)]
    count: u64,

    /// Delay between two consecutive tasks, in milliseconds
    #[arg(long, default_value_t = 50)]
    step_ms: u64,

    /// Priority of the immediate task posted alongside
    #[arg(long, value_enum, default_value_t)]
    priority: TaskPriority,

    /// Print the execution trace as JSON
    #[arg(long)]
    json: bool,
}

fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let directory = Directory::new();
    let trace = ExecutionTrace::new();

    let count = args.count;
    let step_ms = args.step_ms;
    let priority = args.priority;
    let recorder = trace.clone();
    let timer = directory.spawn(
        DispatcherBuilder::new()
            .name("timer")
            .keep_alive(false)
            .entry(move || {
                for i in (1..=count).rev() {
                    let recorder = recorder.clone();
                    context::post_delayed_task(
                        move || recorder.record(format!("delayed-{i}")),
                        Duration::from_millis(step_ms.saturating_mul(i)),
                    );
                }
                let recorder = recorder.clone();
                context::post_task_with_priority(
                    move || recorder.record("immediate"),
                    priority,
                );
            }),
    )?;

    timer.wait();
    directory.wait_all();

    for event in trace.events() {
        info!("{:>12} after {:>8} us", event.label, event.elapsed_usec);
    }
    let labels = trace.labels();
    let in_order = labels
        .iter()
        .skip(1)
        .zip(1..)
        .all(|(label, i)| *label == format!("delayed-{i}"));
    if !in_order {
        warn!("Delayed tasks ran out of order: {labels:?}");
    }
    info!(
        "Dispatcher ran {} tasks in {} keep-alive cycles",
        timer.tasks_completed(),
        timer.keep_alive_cycles()
    );

    if args.json {
        println!("{}", trace.to_json()?);
    }
    Ok(())
}
