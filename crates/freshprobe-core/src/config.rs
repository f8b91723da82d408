//! Run configuration
//!
//! Sources, lowest priority first:
//! - Hardcoded defaults (`BASE_URL` / `HOT_PRODUCT_ID` seed the target defaults)
//! - File named by `FRESHPROBE_CONFIG`
//! - `./config/freshprobe.{toml,yaml,json}`
//! - `FRESHPROBE_*` environment variables, `__` between nested keys

use crate::error::{ProbeError, ProbeResult};
use crate::load::LoadShape;
use crate::poller::{ConvergencePolicy, PollSettings};
use crate::subject::SubjectStrategy;
use crate::targets::ReplicaTargets;
use crate::thresholds::ThresholdSet;
use crate::wire::{AdjustmentGenerator, AdjustmentMode, ProductId, Route};
use config::builder::DefaultState;
use config::{Config, ConfigBuilder, Environment, File};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

/// Root configuration of a run.
#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq)]
pub struct ProbeConfig {
    #[serde(default)]
    pub target: TargetConfig,

    #[serde(default)]
    pub freshness: FreshnessConfig,

    #[serde(default)]
    pub load: LoadConfig,

    #[serde(default)]
    pub http: HttpConfig,

    /// Metric name to threshold expressions, e.g. `freshness_delay = ["avg<=1000"]`.
    #[serde(default)]
    pub thresholds: BTreeMap<String, Vec<String>>,
}

impl ProbeConfig {
    /// Load configuration from every layered source and validate it.
    pub fn load() -> ProbeResult<Self> {
        let mut builder = Self::seeded()?;

        if let Ok(config_path) = std::env::var("FRESHPROBE_CONFIG") {
            builder = builder.add_source(File::with_name(&config_path).required(false));
        }

        // Example: FRESHPROBE_FRESHNESS__DEADLINE_MS=3000
        builder = builder
            .add_source(File::with_name("./config/freshprobe").required(false))
            .add_source(
                Environment::with_prefix("FRESHPROBE")
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            );

        let config: ProbeConfig = builder.build()?.try_deserialize()?;
        config.validate()?;

        Ok(config)
    }

    /// Load configuration from a specific file path.
    ///
    /// `BASE_URL` and `HOT_PRODUCT_ID` still fill in keys the file leaves unset.
    pub fn from_file<P: AsRef<Path>>(path: P) -> ProbeResult<Self> {
        let config: ProbeConfig = Self::seeded()?
            .add_source(File::from(path.as_ref()))
            .build()?
            .try_deserialize()?;
        config.validate()?;

        Ok(config)
    }

    /// Builder whose defaults come from `BASE_URL` and `HOT_PRODUCT_ID`.
    fn seeded() -> ProbeResult<ConfigBuilder<DefaultState>> {
        let mut builder = Config::builder();
        if let Ok(base_url) = std::env::var("BASE_URL") {
            builder = builder.set_default("target.endpoints", base_url)?;
        }
        if let Some(hot) = std::env::var("HOT_PRODUCT_ID")
            .ok()
            .and_then(|v| v.trim().parse::<i64>().ok())
        {
            builder = builder.set_default("target.hot_product_id", hot)?;
        }
        Ok(builder)
    }

    /// Validate configuration values
    pub fn validate(&self) -> ProbeResult<()> {
        let f = &self.freshness;
        if f.deadline_ms == 0 {
            return Err(ProbeError::invalid_config("freshness.deadline_ms must be > 0"));
        }
        if f.poll_interval_ms == 0 {
            return Err(ProbeError::invalid_config(
                "freshness.poll_interval_ms must be > 0",
            ));
        }
        if f.poll_interval_ms >= f.deadline_ms {
            return Err(ProbeError::invalid_config(
                "freshness.poll_interval_ms must be < deadline_ms",
            ));
        }
        if f.value_min > f.value_max {
            return Err(ProbeError::invalid_config(
                "freshness.value_max must be >= value_min",
            ));
        }
        if f.product_id_min > f.product_id_max {
            return Err(ProbeError::invalid_config(
                "freshness.product_id_max must be >= product_id_min",
            ));
        }
        if f.batch_size == 0 {
            return Err(ProbeError::invalid_config("freshness.batch_size must be > 0"));
        }

        let l = &self.load;
        if l.duration_secs == 0 {
            return Err(ProbeError::invalid_config("load.duration_secs must be > 0"));
        }
        match l.executor {
            Executor::ConstantVus => {
                if l.vus == 0 {
                    return Err(ProbeError::invalid_config("load.vus must be > 0"));
                }
            }
            Executor::ConstantArrivalRate => {
                if l.rate == 0 {
                    return Err(ProbeError::invalid_config("load.rate must be > 0"));
                }
                if l.time_unit_ms == 0 {
                    return Err(ProbeError::invalid_config("load.time_unit_ms must be > 0"));
                }
                if l.max_vus == 0 {
                    return Err(ProbeError::invalid_config("load.max_vus must be > 0"));
                }
                if l.max_vus < l.pre_allocated_vus {
                    return Err(ProbeError::invalid_config(
                        "load.max_vus must be >= pre_allocated_vus",
                    ));
                }
            }
        }

        if self.http.request_timeout_ms == 0 {
            return Err(ProbeError::invalid_config(
                "http.request_timeout_ms must be > 0",
            ));
        }

        self.threshold_set().map(|_| ())
    }

    pub fn targets(&self) -> ReplicaTargets {
        ReplicaTargets::resolve(self.target.endpoints.as_deref())
    }

    pub fn poll_settings(&self) -> PollSettings {
        PollSettings {
            deadline: self.freshness.deadline(),
            interval: self.freshness.poll_interval(),
            policy: self.freshness.policy,
            route: Route::Price,
        }
    }

    pub fn subject_strategy(&self) -> SubjectStrategy {
        let f = &self.freshness;
        match f.subject {
            SubjectKind::Fixed => SubjectStrategy::Fixed(f.product_id),
            SubjectKind::Random => SubjectStrategy::Random {
                min: f.product_id_min,
                max: f.product_id_max,
            },
            SubjectKind::PerWorker => SubjectStrategy::PerWorker {
                base: f.product_id_min,
                spread: f
                    .product_id_max
                    .saturating_sub(f.product_id_min)
                    .saturating_add(1),
            },
        }
    }

    pub fn generator(&self) -> AdjustmentGenerator {
        let f = &self.freshness;
        AdjustmentGenerator::new(
            f.adjustment_type.clone(),
            f.adjustment_mode,
            f.value_min,
            f.value_max,
            f.batch_size,
        )
    }

    pub fn load_shape(&self) -> LoadShape {
        self.load.shape()
    }

    pub fn threshold_set(&self) -> ProbeResult<ThresholdSet> {
        ThresholdSet::from_map(&self.thresholds)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.http.request_timeout_ms)
    }
}

/// Where traffic goes.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct TargetConfig {
    /// Single endpoint or comma-delimited replica list.
    pub endpoints: Option<String>,

    /// Subject hammered by the cache-pressure benchmark.
    pub hot_product_id: ProductId,
}

impl Default for TargetConfig {
    fn default() -> Self {
        Self {
            endpoints: None,
            hot_product_id: 12345,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum SubjectKind {
    #[default]
    Fixed,
    Random,
    PerWorker,
}

/// Freshness probe settings
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct FreshnessConfig {
    /// Per-iteration convergence deadline, also the timeout sentinel
    pub deadline_ms: u64,
    pub poll_interval_ms: u64,
    pub policy: ConvergencePolicy,
    pub subject: SubjectKind,
    /// Subject of the `fixed` strategy
    pub product_id: ProductId,
    pub product_id_min: ProductId,
    pub product_id_max: ProductId,
    pub adjustment_type: String,
    pub adjustment_mode: AdjustmentMode,
    pub value_min: u32,
    pub value_max: u32,
    /// 1 sends a single adjustment object, more sends an array
    pub batch_size: usize,
}

impl Default for FreshnessConfig {
    fn default() -> Self {
        Self {
            deadline_ms: 5000,
            poll_interval_ms: 50,
            policy: ConvergencePolicy::Any,
            subject: SubjectKind::Fixed,
            product_id: 9999,
            product_id_min: 1,
            product_id_max: 100_000,
            adjustment_type: "PROMO".to_string(),
            adjustment_mode: AdjustmentMode::Absolute,
            value_min: 1,
            value_max: 10,
            batch_size: 1,
        }
    }
}

impl FreshnessConfig {
    pub fn deadline(&self) -> Duration {
        Duration::from_millis(self.deadline_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum Executor {
    #[default]
    ConstantVus,
    ConstantArrivalRate,
}

/// Traffic shape
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct LoadConfig {
    pub executor: Executor,
    pub vus: usize,
    pub duration_secs: u64,
    /// Arrivals per `time_unit_ms` (arrival-rate executor only)
    pub rate: u64,
    pub time_unit_ms: u64,
    pub pre_allocated_vus: usize,
    pub max_vus: usize,
    pub think_time_ms: u64,
}

impl Default for LoadConfig {
    fn default() -> Self {
        Self {
            executor: Executor::ConstantVus,
            vus: 20,
            duration_secs: 15,
            rate: 100,
            time_unit_ms: 1000,
            pre_allocated_vus: 10,
            max_vus: 100,
            think_time_ms: 0,
        }
    }
}

impl LoadConfig {
    pub fn shape(&self) -> LoadShape {
        let duration = Duration::from_secs(self.duration_secs);
        match self.executor {
            Executor::ConstantVus => LoadShape::ConstantVus {
                vus: self.vus,
                duration,
                think_time: Duration::from_millis(self.think_time_ms),
            },
            Executor::ConstantArrivalRate => LoadShape::ConstantArrivalRate {
                rate: self.rate,
                time_unit: Duration::from_millis(self.time_unit_ms),
                duration,
                pre_allocated_vus: self.pre_allocated_vus,
                max_vus: self.max_vus,
            },
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct HttpConfig {
    pub request_timeout_ms: u64,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            request_timeout_ms: 10_000,
        }
    }
}
