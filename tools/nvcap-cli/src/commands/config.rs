//! Show or initialize the configuration file.

use nvcap_common::config::{config_file_path, NvcapConfig};

pub fn run(config: &NvcapConfig, write_default: bool) -> anyhow::Result<()> {
    if write_default {
        let path = NvcapConfig::default().save()?;
        println!("Wrote default configuration to {}", path.display());
        return Ok(());
    }

    let path = config_file_path();
    if path.exists() {
        println!("# {}", path.display());
    } else {
        println!("# {} (not found, showing defaults)", path.display());
    }
    println!("{}", serde_json::to_string_pretty(config)?);
    Ok(())
}
