//! `quill config`: configuration management commands.

use quill_config::AppConfig;
use std::path::{Path, PathBuf};

fn config_path(explicit: Option<&Path>) -> PathBuf {
    explicit
        .map(Path::to_path_buf)
        .unwrap_or_else(|| AppConfig::config_dir().join("config.toml"))
}

pub fn show(explicit: Option<&Path>) -> Result<(), Box<dyn std::error::Error>> {
    let config = AppConfig::load_with(explicit).map_err(|e| format!("Failed to load config: {e}"))?;
    println!("{config:#?}");
    if !config.has_api_key() {
        eprintln!();
        eprintln!("  No API key set (config file, QUILL_API_KEY, MOONSHOT_API_KEY or OPENAI_API_KEY)");
    }
    Ok(())
}

pub fn path(explicit: Option<&Path>) {
    println!("{}", config_path(explicit).display());
}

pub fn init(explicit: Option<&Path>) -> Result<(), Box<dyn std::error::Error>> {
    let path = config_path(explicit);
    if path.exists() {
        println!("Config already exists at {}", path.display());
        return Ok(());
    }
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(&path, AppConfig::default_toml())?;
    println!("Wrote default config to {}", path.display());
    Ok(())
}
