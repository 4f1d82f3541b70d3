// SPDX-License-Identifier: MIT
//
// Author: Johannes Leupolz <dev@leupolz.eu>

use clap::Parser;
use dispatch_runtime::{context, BoundRefPtr, Directory, SharedRefPtr};
use log::{info, warn};
use std::sync::Mutex;

/// Hands a thread-bound payload to another dispatcher and back.
#[derive(Debug, Parser)]
#[command(author, version, about)]
struct Args {
    /// Number of elements in the payload
    #[arg(long, default_value_t = 16)]
    size: u32,

    /// Touch the bound payload on the worker. This is an affinity violation and terminates the
    /// worker.
    #[arg(long)]
    violate: bool,
}

fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let directory = Directory::new();
    let worker = directory.create_dispatcher("worker")?;
    if args.violate {
        // The payload never comes back, so the owner has to be ended from here.
        let owner_directory = directory.clone();
        worker.set_destruction_handler(move |_| {
            let _ = owner_directory.post_task_to("owner", context::end);
        });
    }

    let violate = args.violate;
    let size = args.size;
    let owner_directory = directory.clone();
    directory.create_and_enter_dispatcher("owner", move || {
        let bound = BoundRefPtr::new((0..size).collect::<Vec<u32>>());
        let shared = SharedRefPtr::new(Mutex::new(0u64));
        info!("Payload of {} elements created on owner", bound.len());

        let result = shared.clone();
        let back = owner_directory.clone();
        let posted = owner_directory.post_task_to("worker", move || {
            // The handle travels with the job. Only its owner may look inside.
            info!(
                "Worker holds the payload, accessible: {}",
                bound.is_accessible()
            );
            if violate {
                warn!("Touching the payload from the worker");
                let _ = bound.len();
            }
            *result.lock().unwrap_or_else(|p| p.into_inner()) += 1;

            let returned = back.post_task_to("owner", move || {
                let sum: u64 = bound.iter().map(|v| u64::from(*v)).sum();
                info!(
                    "Payload is back on owner with {} references, sum {}",
                    bound.ref_count(),
                    sum
                );
                context::end();
            });
            if let Err(e) = returned {
                warn!("Could not return the payload: {e}");
            }
        });
        if let Err(e) = posted {
            warn!("Could not hand off the payload: {e}");
            context::end();
        }

        info!("Shared result has {} references", shared.ref_count());
    })?;

    worker.stop();
    worker.wait();
    directory.wait_all();
    Ok(())
}
