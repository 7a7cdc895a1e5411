//! Train subcommand - epoch loop with per-epoch validation and checkpoints
//!
//! Ctrl-C is honoured between epochs only: the running epoch finishes,
//! is validated and checkpointed, then the loop stops.

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use humanise_training::{EpochSummary, HumaniseSession, OperationMode};

use crate::{select_device, ConfigArgs, DataArgs};

const TRAINING_LOG: &str = "training_log.json";

#[derive(Debug, Clone, Serialize, Deserialize)]
struct TrainingLog {
    log_name: String,
    epochs: Vec<EpochLog>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct EpochLog {
    epoch: u64,
    global_step: u64,
    train: EpochSummary,
    validation: EpochSummary,
    checkpoint: PathBuf,
    seconds: f64,
}

pub fn run(
    config_args: &ConfigArgs,
    data: &DataArgs,
    epochs: u64,
    log_name: &str,
    model_name: &str,
    resume: Option<PathBuf>,
    resume_latest: bool,
) -> Result<()> {
    let stop = Arc::new(AtomicBool::new(false));
    let stop_handler = stop.clone();
    if let Err(e) = ctrlc::set_handler(move || {
        eprintln!("\n  Interrupt received, stopping after the current epoch...");
        stop_handler.store(true, Ordering::SeqCst);
    }) {
        tracing::warn!("Could not install interrupt handler: {}", e);
    }

    let device = select_device()?;
    let config = config_args.resolve()?;

    let latest = if resume_latest {
        HumaniseSession::load_latest(model_name, config.clone(), &device)?
    } else {
        None
    };
    if resume_latest && latest.is_none() {
        tracing::info!(
            "No {} checkpoint in {}, starting fresh",
            model_name,
            config.model_output_path.display()
        );
    }

    let resumed = resume.is_some() || latest.is_some();
    let mut session = match (resume, latest) {
        (Some(path), _) => HumaniseSession::load_path(&path, config.clone(), &device)?,
        (None, Some(session)) => session,
        (None, None) => HumaniseSession::new(log_name, config.clone(), &device)?,
    };

    let mut train_set = data.training_set(&config, &device)?;
    let mut validation_set = data.validation_set(&config, &device)?;

    let log_path = config.model_output_path.join(TRAINING_LOG);
    let mut log = if resumed {
        load_log(&log_path, session.log_name())
    } else {
        TrainingLog {
            log_name: session.log_name().to_string(),
            epochs: Vec::new(),
        }
    };

    tracing::info!(
        "Training {} from epoch {} (global step {}), {} epochs, {} training / {} validation samples",
        session.log_name(),
        session.epoch(),
        session.global_step(),
        epochs,
        train_set.len(),
        validation_set.len()
    );

    for _ in 0..epochs {
        if stop.load(Ordering::SeqCst) {
            break;
        }

        let start = Instant::now();
        let epoch = session.epoch();

        session.set_mode(OperationMode::Train);
        let train = session.train(&mut train_set)?;

        session.set_mode(OperationMode::Inference);
        let validation = session.validate(&mut validation_set)?;

        session.advance_epoch();
        let checkpoint = session.checkpoint(model_name)?;

        log.epochs.push(EpochLog {
            epoch,
            global_step: session.global_step(),
            train,
            validation,
            checkpoint,
            seconds: start.elapsed().as_secs_f64(),
        });
        save_log(&log, &log_path)?;
    }

    if stop.load(Ordering::SeqCst) {
        tracing::info!("Stopped at epoch {} on interrupt", session.epoch());
    } else {
        tracing::info!(
            "Finished at epoch {}, global step {}",
            session.epoch(),
            session.global_step()
        );
    }

    Ok(())
}

/// Existing log for a resumed run, or a fresh one when missing or unreadable.
fn load_log(path: &Path, log_name: &str) -> TrainingLog {
    let existing = std::fs::read_to_string(path)
        .ok()
        .and_then(|data| serde_json::from_str::<TrainingLog>(&data).ok())
        .filter(|log| log.log_name == log_name);

    match existing {
        Some(log) => {
            tracing::info!("Resumed training log ({} existing epochs)", log.epochs.len());
            log
        }
        None => TrainingLog {
            log_name: log_name.to_string(),
            epochs: Vec::new(),
        },
    }
}

fn save_log(log: &TrainingLog, path: &Path) -> Result<()> {
    let json = serde_json::to_string_pretty(log)?;
    std::fs::write(path, json)?;
    Ok(())
}
