//! Multi-target execution: a producer enumerating the probe matrix, an
//! order-randomizing stage, and a pool of blocking worker threads.
//!
//! The enumeration keeps the target as the innermost loop so the stream
//! cycles through all targets before revisiting any one of them, and the
//! reservoir stage spreads the remaining same-target runs across the
//! wall clock. Together they keep any single origin from being flooded
//! with back-to-back probes.

use crate::detect::{detect, DetectContext, DetectParams};
use crate::detect_method::DETECT_METHODS;
use crate::log_writer::CsvLogWriter;
use crate::padding::PADDING_METHODS;
use crate::smuggle::SMUGGLING_METHODS;
use log::warn;
use rand::seq::SliceRandom;
use rand::Rng;
use std::sync::mpsc::{sync_channel, Receiver, SyncSender};
use std::sync::{Arc, Mutex};

/// Upper bound on jobs held back for reordering.
const RANDOMIZER_CAPACITY: usize = 1_000_000;

pub struct SchedulerConfig {
    pub threads: usize,
    pub request_methods: Vec<String>,
    pub csv: Option<CsvLogWriter>,
}

/// Runs the full probe matrix over `targets`, printing distinguishable
/// probes to stdout and logging every probe to the CSV sink when one is
/// configured.
pub fn detect_multiple_targets(
    mut targets: Vec<String>,
    ctx: DetectContext,
    config: SchedulerConfig,
) -> Result<(), String> {
    if targets.is_empty() {
        return Err("no targets specified".to_string());
    }

    targets.shuffle(&mut rand::thread_rng());

    let ctx = Arc::new(ctx);
    let csv = config.csv.map(Arc::new);
    let threads = config.threads.max(1);
    let request_methods = config.request_methods;
    // Reordering only matters when there is more than one target to
    // spread probes across.
    let randomize = targets.len() > 1;

    std::thread::scope(|scope| {
        let (job_tx, job_rx) = sync_channel::<DetectParams>(threads);

        let worker_rx = if randomize {
            let (out_tx, out_rx) = sync_channel::<DetectParams>(threads);
            scope.spawn(move || randomize_jobs(job_rx, out_tx, RANDOMIZER_CAPACITY));
            out_rx
        } else {
            job_rx
        };
        let worker_rx = Arc::new(Mutex::new(worker_rx));

        scope.spawn(move || {
            push_detect_jobs(&targets, &request_methods, |job| {
                let _ = job_tx.send(job);
            });
        });

        for _ in 0..threads {
            let worker_rx = worker_rx.clone();
            let ctx = ctx.clone();
            let csv = csv.clone();
            scope.spawn(move || {
                loop {
                    let job = match worker_rx.lock().unwrap().recv() {
                        Ok(job) => job,
                        Err(_) => break,
                    };
                    let verdict = detect(&job, &ctx);
                    let verdict_str = match &verdict {
                        Ok(v) => v.to_string(),
                        Err(e) => e.to_string(),
                    };
                    match &verdict {
                        Ok(v) if v.is_distinguishable() => {
                            println!("{}: {}", job, v);
                        }
                        Ok(_) => {}
                        Err(e) => warn!("{}: {}", job, e),
                    }
                    if let Some(csv) = &csv {
                        if let Err(e) = csv.log(&job, &verdict_str) {
                            warn!("csv log failed: {}", e);
                        }
                    }
                }
            });
        }
    });

    Ok(())
}

/// Enumerates the Cartesian product of all probe axes, filtering
/// incompatible (detect, smuggling) pairs. The target is the innermost
/// axis.
pub fn push_detect_jobs<F>(targets: &[String], request_methods: &[String], mut emit: F)
where
    F: FnMut(DetectParams),
{
    for dm in DETECT_METHODS {
        for sm in SMUGGLING_METHODS {
            if !dm.allows(sm) {
                continue;
            }
            for pm in PADDING_METHODS {
                for rm in request_methods {
                    for variant in sm.variants() {
                        for target in targets {
                            emit(DetectParams::new(
                                target.clone(),
                                rm.trim().to_string(),
                                dm,
                                sm,
                                variant.clone(),
                                pm,
                            ));
                        }
                    }
                }
            }
        }
    }
}

/// Reservoir permutation: each arrival lands in a random slot, kicking
/// the previous occupant downstream; once the input closes the reservoir
/// drains in random order. Every job is eventually emitted, with at most
/// `capacity` held back at any moment.
fn randomize_jobs(
    input: Receiver<DetectParams>,
    output: SyncSender<DetectParams>,
    capacity: usize,
) {
    let mut rng = rand::thread_rng();
    let mut slots: Vec<DetectParams> = Vec::new();

    for job in input {
        let at = rng.gen_range(0..capacity);
        if at < slots.len() {
            let displaced = std::mem::replace(&mut slots[at], job);
            if output.send(displaced).is_err() {
                return;
            }
        } else {
            slots.push(job);
        }
    }

    while !slots.is_empty() {
        let at = rng.gen_range(0..slots.len());
        if output.send(slots.swap_remove(at)).is_err() {
            return;
        }
    }
}
