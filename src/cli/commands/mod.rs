use anyhow::{Context, Result};
use std::sync::Arc;

use simpa_bend::{
    init_database, Actor, Channel, EngineSettings, LocalFileStorage, LogChannel, NotificationChannel,
    NotificationDispatcher, SimpaBendConfig, WorkflowEngine,
};

pub mod admin;
pub mod document;
pub mod numbering;
pub mod sp2d;

#[allow(async_fn_in_trait)]
pub trait Command {
    async fn execute(&self) -> Result<()>;
}

/// Everything a command needs: the loaded configuration, the engine wired
/// to the configured store and the acting user.
pub struct AppContext {
    pub config: SimpaBendConfig,
    pub engine: WorkflowEngine,
    user: Option<String>,
}

impl AppContext {
    pub async fn open(config: SimpaBendConfig, user: Option<String>) -> Result<Self> {
        let store = init_database(&config.database)
            .await
            .context("Failed to open the workflow database")?;

        let bodies = config.notifications.log_message_bodies;
        let mut channels: Vec<Arc<dyn NotificationChannel>> = Vec::new();
        if config.notifications.email_enabled {
            channels.push(Arc::new(LogChannel::new(Channel::Email).with_body(bodies)));
        }
        if config.notifications.whatsapp_enabled {
            channels.push(Arc::new(LogChannel::new(Channel::WhatsApp).with_body(bodies)));
        }

        let settings = EngineSettings {
            minimum_nilai: config.workflow.minimum_nilai,
            utc_offset: config.utc_offset()?,
        };
        let engine = WorkflowEngine::new(store, Arc::new(LocalFileStorage::new(&config.storage.attachment_dir)))
            .with_dispatcher(NotificationDispatcher::new(channels))
            .with_templates(config.series_templates()?)
            .with_otp_settings(config.otp_settings())
            .with_settings(settings);

        Ok(Self { config, engine, user })
    }

    /// The acting user with their active roles. Fails when `--as` was not given.
    pub async fn actor(&self) -> Result<Actor> {
        let user = self
            .user
            .as_deref()
            .context("This command needs an acting user; pass --as <USER>")?;
        let actor = self.engine.actor(user).await?;
        if actor.roles().is_empty() {
            println!("⚠️  User '{user}' holds no active role");
        }
        Ok(actor)
    }
}

pub(crate) fn parse_id(raw: &str) -> Result<uuid::Uuid> {
    uuid::Uuid::parse_str(raw.trim()).with_context(|| format!("'{raw}' is not a document id"))
}

pub(crate) fn parse_date(raw: &str) -> Result<chrono::NaiveDate> {
    chrono::NaiveDate::parse_from_str(raw.trim(), "%Y-%m-%d")
        .with_context(|| format!("'{raw}' is not a date in YYYY-MM-DD form"))
}

pub(crate) fn rupiah(amount: i64) -> String {
    let digits = amount.unsigned_abs().to_string();
    let mut grouped = String::with_capacity(digits.len() + digits.len() / 3);
    for (i, ch) in digits.chars().enumerate() {
        if i > 0 && (digits.len() - i) % 3 == 0 {
            grouped.push('.');
        }
        grouped.push(ch);
    }
    if amount < 0 {
        format!("-Rp {grouped}")
    } else {
        format!("Rp {grouped}")
    }
}
