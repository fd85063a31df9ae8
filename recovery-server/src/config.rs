use clap::Parser;
use recovery_core::Config;
use std::path::PathBuf;

#[derive(Parser, Debug, Clone, Default)]
#[command(name = "recovery-server", version, about = "Backup metadata recovery server")]
pub struct Args {
    /// Path to a TOML configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// HTTP port to listen on
    #[arg(short, long)]
    pub port: Option<u16>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long)]
    pub log_level: Option<String>,
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub port: u16,
    pub log_level: String,
    pub mirror_sweep_secs: u64,
    pub core: Config,
}

impl AppConfig {
    pub fn from_env(args: &Args) -> anyhow::Result<Self> {
        let _ = dotenvy::dotenv();
        Self::resolve(args, |key| std::env::var(key).ok())
    }

    /// Flags win over environment variables, which win over the file.
    pub fn resolve<F>(args: &Args, env: F) -> anyhow::Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let config_path = args
            .config
            .clone()
            .or_else(|| env("RECOVERY_CONFIG").map(PathBuf::from));
        let mut core = match config_path {
            Some(path) => Config::from_file(&path)?,
            None => Config::default(),
        };

        if let Some(dir) = env("RECOVERY_DATA_DIR") {
            core.storage.data_dir = PathBuf::from(dir);
        }
        if let Some(cron) = env("RETENTION_CRON") {
            core.retention.cron = cron;
        }

        let log_level = args
            .log_level
            .clone()
            .or_else(|| env("LOG_LEVEL"))
            .unwrap_or_else(|| core.log.level.clone());

        Ok(Self {
            port: args
                .port
                .or_else(|| env("PORT").and_then(|v| v.parse().ok()))
                .unwrap_or(3000),
            log_level,
            mirror_sweep_secs: env("MIRROR_SWEEP_SECS")
                .and_then(|v| v.parse().ok())
                .unwrap_or(30),
            core,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env_of(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key: &str| map.get(key).cloned()
    }

    #[test]
    fn test_defaults_without_file_or_env() {
        let config = AppConfig::resolve(&Args::default(), env_of(&[])).unwrap();
        assert_eq!(config.port, 3000);
        assert_eq!(config.log_level, "info");
        assert_eq!(config.mirror_sweep_secs, 30);
        assert_eq!(config.core.engine.max_chain_depth, 8);
    }

    #[test]
    fn test_flags_override_env_and_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("recovery.toml");
        std::fs::write(
            &path,
            "[engine]\nmax_chain_depth = 2\n\n[log]\nlevel = \"warn\"\n",
        )
        .unwrap();

        let args = Args {
            config: Some(path),
            port: Some(8080),
            log_level: None,
        };
        let config = AppConfig::resolve(
            &args,
            env_of(&[
                ("PORT", "9000"),
                ("RECOVERY_DATA_DIR", "/srv/recovery"),
                ("MIRROR_SWEEP_SECS", "5"),
            ]),
        )
        .unwrap();

        assert_eq!(config.port, 8080);
        assert_eq!(config.log_level, "warn");
        assert_eq!(config.mirror_sweep_secs, 5);
        assert_eq!(config.core.engine.max_chain_depth, 2);
        assert_eq!(config.core.storage.data_dir, PathBuf::from("/srv/recovery"));
    }

    #[test]
    fn test_invalid_file_is_an_error() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("bad.toml");
        std::fs::write(&path, "[engine]\nmax_chain_depth = 0\n").unwrap();
        let args = Args {
            config: Some(path),
            ..Default::default()
        };
        assert!(AppConfig::resolve(&args, env_of(&[])).is_err());
    }
}
