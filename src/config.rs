use std::path::{Path, PathBuf};
use std::time::Duration as StdDuration;

use chrono::{Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::cache;
use crate::error::{Error, Result};
use crate::intensity::{ConfigUpdate, ReviewCountPolicy};
use crate::llm::{LlmConfig, Provider};
use crate::orchestrator::SchedulingModel;
use crate::queue::DEFAULT_CAPACITY;

const MAX_TTL_MS: i64 = cache::MAX_TTL_DAYS * 86_400_000;

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub database_url: String,
    pub bind_addr: String,
    pub settings_path: PathBuf,
    pub llm: LlmConfig,
    /// Overrides the settings-file TTL when set.
    pub question_cache_ttl: Option<Duration>,
    pub scheduling_model: SchedulingModel,
    /// `None` means the model's own default.
    pub review_count_policy: Option<ReviewCountPolicy>,
    pub pregenerate_enabled: bool,
    pub auto_pregenerate: bool,
    pub pregenerate_interval: StdDuration,
    pub queue_capacity: usize,
    /// Minute-scale intervals for the simple engine, for manual testing.
    pub rapid_testing: bool,
}

impl AppConfig {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let var = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        let provider = match var("AI_PROVIDER") {
            Some(p) => p.parse::<Provider>()?,
            None => Provider::Ollama,
        };
        let mut llm = LlmConfig::new(provider);
        if let Some(url) = var("OLLAMA_URL") {
            llm.ollama_url = url;
        }
        llm.openrouter_api_key = var("OPENROUTER_API_KEY");

        let question_cache_ttl = match var("QUESTION_CACHE_TTL_MS") {
            Some(raw) => {
                let ms: i64 = parse(&raw, "QUESTION_CACHE_TTL_MS")?;
                (ms > 0).then(|| cache::bounded_ttl(Duration::milliseconds(ms.min(MAX_TTL_MS))))
            }
            None => None,
        };

        let scheduling_model = match var("SCHEDULING_MODEL") {
            Some(raw) => raw.parse::<SchedulingModel>().map_err(Error::Validation)?,
            None => SchedulingModel::default(),
        };
        let review_count_policy = match var("REVIEW_COUNT_POLICY") {
            Some(raw) => Some(raw.parse::<ReviewCountPolicy>().map_err(Error::Validation)?),
            None => None,
        };

        let pregenerate_minutes: u64 = match var("PREGENERATE_INTERVAL") {
            Some(raw) => parse(&raw, "PREGENERATE_INTERVAL")?,
            None => 60,
        };

        Ok(Self {
            database_url: var("DATABASE_URL").unwrap_or_else(|| "sqlite://note-tutor.db?mode=rwc".to_string()),
            bind_addr: var("BIND_ADDR").unwrap_or_else(|| "0.0.0.0:3000".to_string()),
            settings_path: var("SETTINGS_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("data/config.json")),
            llm,
            question_cache_ttl,
            scheduling_model,
            review_count_policy,
            pregenerate_enabled: var("PREGENERATE_ENABLED").map_or(true, |v| v != "false"),
            auto_pregenerate: var("AUTO_PREGENERATE").is_some_and(|v| v == "true"),
            pregenerate_interval: StdDuration::from_secs(pregenerate_minutes.max(1) * 60),
            queue_capacity: match var("AI_QUEUE_CAPACITY") {
                Some(raw) => parse(&raw, "AI_QUEUE_CAPACITY")?,
                None => DEFAULT_CAPACITY,
            },
            rapid_testing: var("RAPID_TESTING").is_some_and(|v| v == "true"),
        })
    }
}

fn parse<T: std::str::FromStr>(raw: &str, key: &str) -> Result<T> {
    raw.parse()
        .map_err(|_| Error::Validation(format!("{} has an invalid value: {}", key, raw)))
}

/// User-editable settings persisted as JSON.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub interrogations_enabled: bool,
    pub question_cache_ttl_days: f64,
    pub scheduler: Option<ConfigUpdate>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            interrogations_enabled: true,
            question_cache_ttl_days: 7.0,
            scheduler: None,
        }
    }
}

impl Settings {
    /// Reads the settings file. A missing file is created with defaults; an
    /// unreadable one is backed up next to itself and replaced by defaults.
    pub async fn load(path: &Path) -> Result<Settings> {
        let raw = match tokio::fs::read_to_string(path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                log::info!("Settings file {} not found, writing defaults", path.display());
                let settings = Settings::default();
                settings.save(path).await?;
                return Ok(settings);
            }
            Err(e) => return Err(e.into()),
        };

        match serde_json::from_str::<Settings>(&raw) {
            Ok(settings) => Ok(settings),
            Err(e) => {
                log::error!("Settings file {} is corrupt: {}", path.display(), e);
                let backup = backup_path(path);
                match tokio::fs::copy(path, &backup).await {
                    Ok(_) => log::warn!("Corrupt settings backed up to {}", backup.display()),
                    Err(copy_err) => log::error!("Could not back up corrupt settings: {}", copy_err),
                }
                let settings = Settings::default();
                settings.save(path).await?;
                Ok(settings)
            }
        }
    }

    pub async fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }
        let json = serde_json::to_string_pretty(self)?;
        tokio::fs::write(path, json).await?;
        Ok(())
    }

    pub fn cache_ttl(&self) -> Duration {
        if self.question_cache_ttl_days.is_finite() && self.question_cache_ttl_days > 0.0 {
            let days = self.question_cache_ttl_days.min(cache::MAX_TTL_DAYS as f64);
            cache::bounded_ttl(Duration::milliseconds((days * 86_400_000.0).round() as i64))
        } else {
            Duration::days(7)
        }
    }

    /// Folds a scheduler override into the stored overrides.
    pub fn merge_scheduler(&mut self, update: &ConfigUpdate) {
        let stored = self.scheduler.get_or_insert_with(ConfigUpdate::default);
        if let Some(base_hours) = &update.base_hours {
            stored
                .base_hours
                .get_or_insert_with(Default::default)
                .extend(base_hours.iter().map(|(k, v)| (*k, *v)));
        }
        if let Some(multipliers) = &update.difficulty_multipliers {
            stored
                .difficulty_multipliers
                .get_or_insert_with(Default::default)
                .extend(multipliers.iter().map(|(k, v)| (*k, *v)));
        }
    }
}

fn backup_path(path: &Path) -> PathBuf {
    let stem = path
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("config");
    let name = format!("{}.backup.{}.json", stem, Utc::now().timestamp_millis());
    path.with_file_name(name)
}
