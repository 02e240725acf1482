//! Resolve command implementation.

use cansat_replication::{Credentials, RemoteTargetResolver, TargetResolver};
use cansat_station::StationError;

/// Runs the resolve command.
pub fn run(target: &str) -> Result<(), Box<dyn std::error::Error>> {
    let resolved = RemoteTargetResolver
        .resolve(target, &Credentials::none())
        .map_err(StationError::from)?;

    println!("Target:      {}", resolved.url());
    println!("Remote:      {}", resolved.is_remote());
    match resolved.credentials().username() {
        Some(user) => println!("Credentials: {user} (from URL)"),
        None => println!("Credentials: none"),
    }
    Ok(())
}
