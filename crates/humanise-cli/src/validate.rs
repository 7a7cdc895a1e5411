//! Validate subcommand - one inference pass with a saved checkpoint

use anyhow::Result;
use std::path::PathBuf;

use humanise_training::{HumaniseSession, OperationMode};

use crate::{select_device, ConfigArgs, DataArgs};

pub fn run(config_args: &ConfigArgs, data: &DataArgs, checkpoint: PathBuf) -> Result<()> {
    let device = select_device()?;
    let config = config_args.resolve()?;

    let mut session = HumaniseSession::load_path(&checkpoint, config.clone(), &device)?;
    session.set_mode(OperationMode::Inference);

    let mut validation_set = data.validation_set(&config, &device)?;
    let summary = session.validate(&mut validation_set)?;

    println!("\n  {} (epoch {}, global step {})", session.log_name(), session.epoch(), session.global_step());
    println!("  Batches: {}", summary.batches);
    for (name, value) in &summary.means {
        println!("  {:<10} {:.6}", name, value);
    }

    Ok(())
}
