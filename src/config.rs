use anyhow::{Context, Result};
use chrono::{Duration, FixedOffset};
use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::numbering::SeriesTemplates;
use crate::otp::OtpSettings;

/// Main configuration structure for SIMPA BEND
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct SimpaBendConfig {
    pub database: DatabaseConfig,
    pub observability: ObservabilityConfig,
    pub workflow: WorkflowConfig,
    pub numbering: NumberingConfig,
    pub otp: OtpConfig,
    pub notifications: NotificationConfig,
    pub storage: StorageConfig,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct DatabaseConfig {
    /// SQLite connection string
    pub url: String,
    /// Maximum connections in pool
    pub max_connections: u32,
    /// Enable automatic migrations
    pub auto_migrate: bool,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct ObservabilityConfig {
    /// Log level or `EnvFilter` directive
    pub log_level: String,
    /// Emit JSON lines instead of human-readable text
    pub json_logs: bool,
    /// Log workflow counters on shutdown
    pub metrics_enabled: bool,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct WorkflowConfig {
    /// Smallest SPM value accepted, in rupiah
    pub minimum_nilai: i64,
    /// Office timezone; decides which month/year a number belongs to
    pub utc_offset_hours: i32,
}

/// Fallback templates per series. `None` keeps the built-in format.
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
pub struct NumberingConfig {
    pub antrian_template: Option<String>,
    pub berkas_template: Option<String>,
    pub sp2d_template: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct OtpConfig {
    pub length: usize,
    pub ttl_minutes: i64,
    /// Wrong codes tolerated before the code has to be requested again
    pub max_attempts: u32,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct NotificationConfig {
    pub email_enabled: bool,
    pub whatsapp_enabled: bool,
    /// Log full message bodies, one-time codes included. For installs
    /// without a mail or WhatsApp gateway.
    pub log_message_bodies: bool,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct StorageConfig {
    /// Directory attachments are written under
    pub attachment_dir: PathBuf,
}

impl Default for SimpaBendConfig {
    fn default() -> Self {
        Self {
            database: DatabaseConfig {
                url: "sqlite://simpa-bend.db".to_string(),
                max_connections: 5,
                auto_migrate: true,
            },
            observability: ObservabilityConfig {
                log_level: "info".to_string(),
                json_logs: false,
                metrics_enabled: true,
            },
            workflow: WorkflowConfig {
                minimum_nilai: 1,
                utc_offset_hours: 7, // WIB
            },
            numbering: NumberingConfig::default(),
            otp: OtpConfig {
                length: 6,
                ttl_minutes: 5,
                max_attempts: 5,
            },
            notifications: NotificationConfig {
                email_enabled: true,
                whatsapp_enabled: true,
                log_message_bodies: false,
            },
            storage: StorageConfig {
                attachment_dir: PathBuf::from(".simpa-bend/attachments"),
            },
        }
    }
}

impl SimpaBendConfig {
    /// Load configuration from multiple sources with precedence:
    /// 1. Default values
    /// 2. Configuration files (simpa-bend.toml, .simpa-bend-rc, or `path`)
    /// 3. Environment variables (SIMPA_BEND_SECTION__KEY)
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = Config::builder().add_source(Config::try_from(&Self::default())?);

        match path {
            Some(path) => {
                builder = builder.add_source(File::from(path.to_path_buf()));
            }
            None => {
                if Path::new("simpa-bend.toml").exists() {
                    builder = builder.add_source(File::with_name("simpa-bend"));
                }
                if Path::new(".simpa-bend-rc").exists() {
                    builder = builder.add_source(
                        File::with_name(".simpa-bend-rc").format(config::FileFormat::Toml),
                    );
                }
            }
        }

        builder = builder.add_source(
            Environment::with_prefix("SIMPA_BEND")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

        let loaded: SimpaBendConfig = builder.build()?.try_deserialize()?;
        loaded.validate()?;
        Ok(loaded)
    }

    /// Reject values the workflow cannot run with. Templates are parsed here
    /// so a typo fails at startup rather than at the first allocation.
    pub fn validate(&self) -> Result<()> {
        self.series_templates()?;
        self.utc_offset()?;
        if self.workflow.minimum_nilai < 1 {
            anyhow::bail!("workflow.minimum_nilai must be at least 1");
        }
        if !(4..=10).contains(&self.otp.length) {
            anyhow::bail!("otp.length must be between 4 and 10 digits");
        }
        if self.otp.ttl_minutes < 1 {
            anyhow::bail!("otp.ttl_minutes must be positive");
        }
        if self.otp.max_attempts == 0 {
            anyhow::bail!("otp.max_attempts must be at least 1");
        }
        if self.database.max_connections == 0 {
            anyhow::bail!("database.max_connections must be positive");
        }
        Ok(())
    }

    pub fn series_templates(&self) -> Result<SeriesTemplates> {
        SeriesTemplates::from_raw(
            self.numbering.antrian_template.as_deref(),
            self.numbering.berkas_template.as_deref(),
            self.numbering.sp2d_template.as_deref(),
        )
        .context("invalid numbering template")
    }

    pub fn utc_offset(&self) -> Result<FixedOffset> {
        FixedOffset::east_opt(self.workflow.utc_offset_hours * 3600).with_context(|| {
            format!(
                "workflow.utc_offset_hours {} is out of range",
                self.workflow.utc_offset_hours
            )
        })
    }

    pub fn otp_settings(&self) -> OtpSettings {
        OtpSettings {
            length: self.otp.length,
            ttl: Duration::minutes(self.otp.ttl_minutes),
            max_attempts: self.otp.max_attempts,
        }
    }

    /// Save configuration to file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let toml_content = toml::to_string_pretty(self)?;
        std::fs::write(path, toml_content)?;
        Ok(())
    }

    /// Load .env file if it exists
    pub fn load_env_file() -> Result<()> {
        if Path::new(".env").exists() {
            dotenvy::dotenv()?;
            tracing::info!("Loaded environment variables from .env file");
        }
        Ok(())
    }
}

/// Global configuration instance
static CONFIG: std::sync::LazyLock<Result<SimpaBendConfig, anyhow::Error>> =
    std::sync::LazyLock::new(|| {
        let _ = SimpaBendConfig::load_env_file();
        SimpaBendConfig::load(None)
    });

/// Get the global configuration
pub fn config() -> Result<&'static SimpaBendConfig> {
    CONFIG
        .as_ref()
        .map_err(|e| anyhow::anyhow!("Failed to load configuration: {}", e))
}

/// Initialize configuration (called at startup)
pub fn init_config() -> Result<()> {
    let _config = config()?;
    tracing::info!("Configuration loaded successfully");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = SimpaBendConfig::default();
        config.validate().unwrap();
        assert_eq!(config.utc_offset().unwrap().local_minus_utc(), 7 * 3600);
        assert_eq!(config.otp_settings(), OtpSettings::default());
    }

    #[test]
    fn codes_stay_out_of_logs_and_attempts_are_bounded() {
        let mut config = SimpaBendConfig::default();
        assert!(!config.notifications.log_message_bodies);
        config.otp.max_attempts = 0;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("max_attempts"));
    }

    #[test]
    fn bad_template_is_rejected() {
        let mut config = SimpaBendConfig::default();
        config.numbering.sp2d_template = Some("SP2D/{TAHUN}".to_string());
        let err = config.validate().unwrap_err();
        assert!(format!("{err:#}").contains("COUNTER"));
    }

    #[test]
    fn saved_file_loads_back_with_overrides() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("simpa-bend.toml");
        let mut config = SimpaBendConfig::default();
        config.workflow.minimum_nilai = 50_000;
        config.numbering.berkas_template = Some("{COUNTER}/BERKAS/{TAHUN}".to_string());
        config.save_to_file(&path).unwrap();

        let loaded = SimpaBendConfig::load(Some(&path)).unwrap();
        assert_eq!(loaded.workflow.minimum_nilai, 50_000);
        assert_eq!(
            loaded.series_templates().unwrap().berkas.as_str(),
            "{COUNTER}/BERKAS/{TAHUN}"
        );
    }
}
