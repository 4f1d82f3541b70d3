// SPDX-License-Identifier: MIT
//
// Author: Johannes Leupolz <dev@leupolz.eu>

use clap::Parser;
use dispatch_runtime::{context, Directory, Dispatcher};
use dispatch_tests::stress::{StressAction, StressSource};
use log::{debug, info};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Drives a main and a second dispatcher with a random mix of posts, delays and ends.
#[derive(Debug, Parser)]
#[command(author, version, about)]
struct Args {
    /// Seed of the action generator
    #[arg(long, default_value_t = 1)]
    seed: u64,

    /// Number of actions before every job ends its dispatcher
    #[arg(long, default_value_t = 10_000)]
    actions: usize,

    /// Largest burst of a single "post many" action
    #[arg(long, default_value_t = 200)]
    max_burst: usize,

    /// Number of runs, each with the next seed
    #[arg(long, default_value_t = 1)]
    runs: u64,
}

#[derive(Clone)]
struct StressRun {
    directory: Arc<Directory>,
    source: Arc<Mutex<StressSource>>,
    second: Arc<Dispatcher>,
    executed: Arc<AtomicUsize>,
}

impl StressRun {
    fn next_action(&self) -> StressAction {
        self.source
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .next_action()
    }

    fn job(&self) -> impl FnOnce() + Send + 'static {
        let run = self.clone();
        move || run.perform()
    }

    fn perform(self) {
        self.executed.fetch_add(1, Ordering::Relaxed);

        match self.next_action() {
            StressAction::Post => context::post_task(self.job()),
            StressAction::PostMany(count) => {
                for _ in 0..count {
                    context::post_task(self.job());
                }
            }
            StressAction::PostDelayed => {
                context::post_delayed_task(self.job(), Duration::from_millis(25))
            }
            StressAction::PostOther => {
                if self.second.is_current_thread() {
                    let _ = self.directory.post_task_to("main", self.job());
                } else {
                    self.second.post_task(self.job());
                }
                context::post_task(self.job());
            }
            StressAction::End => context::end(),
        }
    }
}

fn run_once(seed: u64, args: &Args) -> anyhow::Result<usize> {
    let directory = Directory::new();
    let second = directory.create_dispatcher("second")?;
    let run = StressRun {
        directory: directory.clone(),
        source: Arc::new(Mutex::new(StressSource::new(
            seed,
            args.actions,
            args.max_burst,
        ))),
        second: second.clone(),
        executed: Arc::new(AtomicUsize::new(0)),
    };

    directory.create_and_enter_dispatcher("main", run.job())?;
    second.stop();
    second.wait();
    directory.wait_all();

    let executed = run.executed.load(Ordering::Relaxed);
    debug!(
        "Seed {seed}: second dispatcher ran {} tasks",
        second.tasks_completed()
    );
    Ok(executed)
}

fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();
    let args = Args::parse();

    for seed in args.seed..args.seed + args.runs {
        let executed = run_once(seed, &args)?;
        info!("Seed {seed}: {executed} stress jobs executed");
        println!("seed {seed}: {executed} jobs");
    }
    Ok(())
}
