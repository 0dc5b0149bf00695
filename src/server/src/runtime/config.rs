use std::path::Path;

use anyhow::Context;
use crucible_events::SchedulerConfig;
use crucible_util::debug::error::{read_optional_file_anyhow, MultiError};
use serde::Deserialize;

pub const DEFAULT_CONFIG_PATH: &str = "crucible.toml";

// === Schema === //

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ConfRoot {
    pub tick: ConfTick,
    pub lanes: ConfLanes,
    pub demo: ConfDemo,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ConfTick {
    /// Ticks per second.
    pub rate: f64,

    /// Stop after this many ticks. Zero means run forever.
    pub max_ticks: u64,

    /// The most ticks the server will run back-to-back after falling behind.
    pub max_catch_up: u32,
}

impl Default for ConfTick {
    fn default() -> Self {
        Self {
            rate: 20.,
            max_ticks: 200,
            max_catch_up: 10,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ConfLanes {
    pub name_prefix: String,
    pub stack_size: Option<usize>,
}

impl Default for ConfLanes {
    fn default() -> Self {
        let defaults = SchedulerConfig::default();

        Self {
            name_prefix: defaults.lane_name_prefix,
            stack_size: defaults.lane_stack_size,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ConfDemo {
    /// Fire the demo spawn event every this many ticks.
    pub spawn_every: u64,

    /// Ticks the spawn effect handler stays suspended for.
    pub effect_delay: u32,

    /// Every this many spawn requests gets cancelled by the guard handler. Zero disables it.
    pub cancel_every: u64,
}

impl Default for ConfDemo {
    fn default() -> Self {
        Self {
            spawn_every: 10,
            effect_delay: 3,
            cancel_every: 3,
        }
    }
}

// === Loading === //

impl ConfRoot {
    pub fn parse(text: &str) -> anyhow::Result<Self> {
        let conf = toml::from_str::<Self>(text).context("server config is malformed")?;
        conf.validate()?;
        Ok(conf)
    }

    /// Loads the config at `path`, falling back to the defaults if no such file exists.
    pub fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();

        match read_optional_file_anyhow("config file", path)? {
            Some(text) => {
                Self::parse(&text).with_context(|| format!("failed to load config at {path:?}"))
            }
            None => {
                log::info!("No config file found at {path:?}; using defaults.");
                Ok(Self::default())
            }
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        let mut errors = MultiError::new("config validation");

        errors.report_if(!(self.tick.rate.is_finite() && self.tick.rate > 0.), || {
            format!("`tick.rate` must be a positive number (got {})", self.tick.rate)
        });
        errors.report_if(self.tick.max_catch_up == 0, || {
            "`tick.max_catch_up` must be at least 1".to_string()
        });
        errors.report_if(self.lanes.name_prefix.is_empty(), || {
            "`lanes.name_prefix` must not be empty".to_string()
        });
        errors.report_if(self.lanes.name_prefix.contains('\0'), || {
            "`lanes.name_prefix` must not contain NUL characters".to_string()
        });
        errors.report_if(self.lanes.stack_size == Some(0), || {
            "`lanes.stack_size` must be non-zero when given".to_string()
        });
        errors.report_if(self.demo.spawn_every == 0, || {
            "`demo.spawn_every` must be at least 1".to_string()
        });

        errors.finish()
    }

    pub fn scheduler_config(&self) -> SchedulerConfig {
        SchedulerConfig {
            lane_name_prefix: self.lanes.name_prefix.clone(),
            lane_stack_size: self.lanes.stack_size,
        }
    }
}
