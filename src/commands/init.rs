//! Init command implementation

use crate::config::Config;
use crate::error::{Error, Result};
use crate::meta::MetaDb;
use serde::Serialize;
use std::path::PathBuf;
use tracing::info;

#[derive(Debug, Clone)]
pub struct InitOptions {
    pub base_dir: PathBuf,
    pub config_path: PathBuf,
    pub force: bool,
}

impl InitOptions {
    /// Resolve paths from `--config`: a `.toml` file is used as-is, anything
    /// else is treated as the base directory.
    pub fn from_config_arg(config: Option<PathBuf>, force: bool) -> Self {
        let (base_dir, config_path) = match config {
            Some(path) if path.extension().is_some_and(|e| e == "toml") => {
                let base = path
                    .parent()
                    .filter(|p| !p.as_os_str().is_empty())
                    .map(PathBuf::from)
                    .unwrap_or_else(|| PathBuf::from("."));
                (base, path)
            }
            Some(dir) => (dir.clone(), dir.join("config.toml")),
            None => {
                let base = Config::default_base_dir();
                (base.clone(), base.join("config.toml"))
            }
        };
        Self {
            base_dir,
            config_path,
            force,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct InitReport {
    pub config_path: String,
    pub db_path: String,
    pub service_url: String,
}

/// Write a default config and create the database
pub async fn cmd_init(options: InitOptions) -> Result<InitReport> {
    let InitOptions {
        base_dir,
        config_path,
        force,
    } = options;

    if config_path.exists() && !force {
        return Err(Error::Config(format!(
            "Config already exists at {}. Use --force to overwrite.",
            config_path.display()
        )));
    }

    let mut config = Config::default();
    config.init_paths(Some(base_dir));
    config.paths.config_file = config_path;
    config.validate()?;
    config.save()?;

    let db = MetaDb::connect(&config).await?;
    db.init_schema().await?;
    info!("Created database at {:?}", config.paths.db_file);

    Ok(InitReport {
        config_path: config.paths.config_file.display().to_string(),
        db_path: config.paths.db_file.display().to_string(),
        service_url: config.service.url,
    })
}

pub fn print_init(report: &InitReport) {
    println!("✓ reqflow initialized");
    println!("  Config: {}", report.config_path);
    println!("  Database: {}", report.db_path);
    println!("  Service: {}", report.service_url);
    println!("\nNext steps:");
    println!("  reqflow project create \"My project\"");
    println!("  reqflow upload 1 ./meeting-notes.txt");
    println!("  reqflow worker --until-idle");
}
