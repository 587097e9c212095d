use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use anyhow::Context;
use serde::Deserialize;

pub const CONFIG_ENV: &str = "STUDENT_PORTAL_CONFIG";
pub const DEFAULT_CONFIG_FILE: &str = "config.json";

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct Config {
    pub bind_address: SocketAddr,
    /// Postgres connection string. Without one, students live in memory.
    pub database_url: Option<String>,
    pub upload_dir: PathBuf,
    pub max_connections: u32,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind_address: SocketAddr::from(([127, 0, 0, 1], 3000)),
            database_url: None,
            upload_dir: ["wwwroot", "images", "uploaded"].iter().collect(),
            max_connections: 5,
        }
    }
}

impl Config {
    /// Reads the JSON config file named by `STUDENT_PORTAL_CONFIG` (or
    /// `config.json` when present), then applies environment overrides.
    pub fn load() -> anyhow::Result<Self> {
        let mut config = match std::env::var(CONFIG_ENV) {
            Ok(path) => Self::from_file(path)?,
            Err(_) if Path::new(DEFAULT_CONFIG_FILE).exists() => {
                Self::from_file(DEFAULT_CONFIG_FILE)?
            }
            Err(_) => Self::default(),
        };
        config.apply_overrides(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    pub fn from_file<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;
        serde_json::from_str(&raw).with_context(|| format!("parsing config file {}", path.display()))
    }

    pub fn apply_overrides<F>(&mut self, var: F) -> anyhow::Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(url) = var("DATABASE_URL").filter(|it| !it.is_empty()) {
            self.database_url = Some(url);
        }
        if let Some(addr) = var("BIND_ADDRESS") {
            self.bind_address = addr
                .parse()
                .with_context(|| format!("invalid BIND_ADDRESS `{}`", addr))?;
        }
        if let Some(dir) = var("UPLOAD_DIR") {
            self.upload_dir = PathBuf::from(dir);
        }
        Ok(())
    }
}
