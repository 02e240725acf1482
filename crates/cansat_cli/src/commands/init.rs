//! Init command implementation.

use cansat_station::{StationConfig, StationError, TargetConfig};
use std::path::Path;
use tracing::info;

/// Runs the init command.
pub fn run(
    path: &Path,
    name: String,
    target: Option<(String, String)>,
    username: String,
    password: String,
    force: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    if path.exists() && !force {
        return Err(StationError::Config(format!(
            "{} already exists (use --force to overwrite)",
            path.display()
        ))
        .into());
    }

    let mut config = StationConfig::new(name);
    if let Some((data_url, log_url)) = target {
        config = config.with_target(TargetConfig {
            data_url,
            log_url,
            username,
            password,
        });
    }
    config.validate()?;
    config.save(path)?;

    info!(path = %path.display(), station = %config.name, "wrote station configuration");
    println!("Wrote {}", path.display());
    Ok(())
}
