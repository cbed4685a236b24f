//! meshcache node - main entry point.

use meshcache::config::CacheConfig;
use std::path::PathBuf;

/// Default byte budget for the in-memory backing store.
const DEFAULT_CAPACITY: u64 = 1 << 30;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config_path = std::env::args().nth(1).map(PathBuf::from);

    let config = match config_path {
        Some(path) => CacheConfig::from_file(&path)?,
        None => {
            eprintln!("usage: meshcache <config.json>");
            std::process::exit(2);
        }
    };

    let capacity = std::env::var("MESHCACHE_CAPACITY_BYTES")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(DEFAULT_CAPACITY);

    meshcache::run(config, capacity).await?;
    Ok(())
}
