use std::{
    collections::BTreeMap,
    fs,
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::Context;
use board_core::{
    options::{DEFAULT_PERSIST_TIMEOUT, DEFAULT_SETTLE_DELAY},
    BoardOptions, ContactDatePolicy, DefaultColumnPolicy, StageRegistry,
};
use serde::Deserialize;
use shared::domain::StageId;
use tracing::warn;

pub const SETTINGS_FILE: &str = "board.toml";

/// Stage set loaded from the backend instead of a built-in preset.
pub const STORE_BOARD: &str = "store";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settings {
    pub database_url: String,
    /// REST/WebSocket backend; the local store is used when unset.
    pub backend_url: Option<String>,
    /// `store` or a preset name (`prospects`, `deals`).
    pub board: String,
    pub default_stage: Option<String>,
    pub persist_timeout_ms: u64,
    pub settle_delay_ms: u64,
    /// Stage id to "days before now" stamped on the record when moved there.
    pub contact_policy: BTreeMap<String, i64>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            database_url: "sqlite://./data/board.db".into(),
            backend_url: None,
            board: STORE_BOARD.into(),
            default_stage: None,
            persist_timeout_ms: DEFAULT_PERSIST_TIMEOUT.as_millis() as u64,
            settle_delay_ms: DEFAULT_SETTLE_DELAY.as_millis() as u64,
            contact_policy: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct FileSettings {
    database_url: Option<String>,
    backend_url: Option<String>,
    board: Option<String>,
    default_stage: Option<String>,
    persist_timeout_ms: Option<u64>,
    settle_delay_ms: Option<u64>,
    #[serde(default)]
    contact_policy: BTreeMap<String, i64>,
}

impl Settings {
    pub fn board_options(&self) -> BoardOptions {
        BoardOptions {
            default_column: match &self.default_stage {
                Some(stage) => DefaultColumnPolicy::Stage(StageId::new(stage.clone())),
                None => DefaultColumnPolicy::LowestSortOrder,
            },
            contact_policy: ContactDatePolicy::from_table(self.contact_policy.clone()),
            persist_timeout: Duration::from_millis(self.persist_timeout_ms),
            settle_delay: Duration::from_millis(self.settle_delay_ms),
        }
    }

    /// `None` means the stages come from the backend.
    pub fn registry(&self) -> anyhow::Result<Option<StageRegistry>> {
        if self.board == STORE_BOARD {
            return Ok(None);
        }
        StageRegistry::preset(&self.board)
            .map(Some)
            .with_context(|| format!("unknown board preset '{}'", self.board))
    }
}

pub fn load_settings() -> Settings {
    let mut settings = Settings::default();
    apply_file(&mut settings, Path::new(SETTINGS_FILE));
    apply_env(&mut settings, |key| std::env::var(key).ok());
    settings
}

fn apply_file(settings: &mut Settings, path: &Path) {
    let Ok(raw) = fs::read_to_string(path) else {
        return;
    };
    let file_cfg = match toml::from_str::<FileSettings>(&raw) {
        Ok(file_cfg) => file_cfg,
        Err(err) => {
            warn!(path = %path.display(), error = %err, "ignoring unreadable settings file");
            return;
        }
    };

    if let Some(v) = file_cfg.database_url {
        settings.database_url = v;
    }
    if file_cfg.backend_url.is_some() {
        settings.backend_url = file_cfg.backend_url;
    }
    if let Some(v) = file_cfg.board {
        settings.board = v;
    }
    if file_cfg.default_stage.is_some() {
        settings.default_stage = file_cfg.default_stage;
    }
    match file_cfg.persist_timeout_ms {
        Some(0) => warn!(path = %path.display(), "ignoring zero persist_timeout_ms"),
        Some(v) => settings.persist_timeout_ms = v,
        None => {}
    }
    if let Some(v) = file_cfg.settle_delay_ms {
        settings.settle_delay_ms = v;
    }
    for (stage, days) in file_cfg.contact_policy {
        if ContactDatePolicy::accepts_offset(days) {
            settings.contact_policy.insert(stage, days);
        } else {
            warn!(stage = %stage, days, "ignoring out-of-range contact_policy offset");
        }
    }
}

fn apply_env(settings: &mut Settings, var: impl Fn(&str) -> Option<String>) {
    if let Some(v) = var("DATABASE_URL") {
        settings.database_url = v;
    }
    if let Some(v) = var("APP__DATABASE_URL") {
        settings.database_url = v;
    }

    if let Some(v) = var("APP__BACKEND_URL") {
        settings.backend_url = Some(v);
    }
    if let Some(v) = var("APP__BOARD") {
        settings.board = v;
    }
    if let Some(v) = var("APP__DEFAULT_STAGE") {
        settings.default_stage = Some(v);
    }

    if let Some(v) = var("APP__PERSIST_TIMEOUT_MS") {
        match v.parse::<u64>() {
            Ok(parsed) if parsed > 0 => settings.persist_timeout_ms = parsed,
            _ => warn!(value = %v, "ignoring invalid APP__PERSIST_TIMEOUT_MS"),
        }
    }
    if let Some(v) = var("APP__SETTLE_DELAY_MS") {
        match v.parse::<u64>() {
            Ok(parsed) => settings.settle_delay_ms = parsed,
            Err(_) => warn!(value = %v, "ignoring invalid APP__SETTLE_DELAY_MS"),
        }
    }
}

pub fn prepare_database_url(raw_database_url: &str) -> anyhow::Result<String> {
    let database_url = normalize_database_url(raw_database_url);
    ensure_parent_dir_exists(&database_url)?;
    Ok(database_url)
}

fn normalize_database_url(raw_database_url: &str) -> String {
    let raw_database_url = raw_database_url.trim();

    if raw_database_url.is_empty() {
        return Settings::default().database_url;
    }

    if raw_database_url.starts_with("sqlite::memory:") || raw_database_url.contains("://") {
        return raw_database_url.to_string();
    }

    if let Some(path) = raw_database_url.strip_prefix("sqlite:") {
        return format!("sqlite://{}", path.replace('\\', "/"));
    }

    format!("sqlite://{}", raw_database_url.replace('\\', "/"))
}

fn ensure_parent_dir_exists(database_url: &str) -> anyhow::Result<()> {
    let Some(parent) = sqlite_path(database_url)
        .as_deref()
        .and_then(Path::parent)
        .map(Path::to_path_buf)
    else {
        return Ok(());
    };
    if parent.as_os_str().is_empty() {
        return Ok(());
    }

    fs::create_dir_all(&parent).with_context(|| {
        format!(
            "failed to create parent directory '{}' for database url '{database_url}'",
            parent.display()
        )
    })
}

fn sqlite_path(database_url: &str) -> Option<PathBuf> {
    let path = database_url
        .strip_prefix("sqlite://")?
        .split('?')
        .next()
        .unwrap_or_default();
    (!path.is_empty()).then(|| PathBuf::from(path))
}

#[cfg(test)]
#[path = "tests/config_tests.rs"]
mod tests;
