//! Inspect subcommand - checkpoint header and tensor inventory

use anyhow::Result;
use candle_core::Device;
use std::path::PathBuf;

use humanise_training::Checkpoint;

pub fn run(path: PathBuf, list_tensors: bool) -> Result<()> {
    let checkpoint = Checkpoint::load(&path, &Device::Cpu)?;

    println!("\n  Checkpoint: {}", path.display());
    println!("  Log name:    {}", checkpoint.log_name);
    println!("  Epoch:       {}", checkpoint.epoch);
    println!("  Global step: {}", checkpoint.global_step);
    println!();

    for (section, count) in checkpoint.inventory() {
        println!("  {:<24} {} tensors", section, count);
    }

    if list_tensors {
        let sections = [
            ("generator", &checkpoint.generator),
            ("discriminator", &checkpoint.discriminator),
            ("generator_optimiser", &checkpoint.generator_optimiser),
            ("discriminator_optimiser", &checkpoint.discriminator_optimiser),
            ("criterion", &checkpoint.criterion),
        ];
        for (section, tensors) in sections {
            let mut names: Vec<&String> = tensors.keys().collect();
            names.sort();
            for name in names {
                let tensor = &tensors[name];
                println!(
                    "  {}.{:<48} {:?} {:?}",
                    section,
                    name,
                    tensor.dims(),
                    tensor.dtype()
                );
            }
        }
    }

    Ok(())
}
