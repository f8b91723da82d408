use clap::{Args, Parser, Subcommand};
use freshprobe_core::{
    ConvergencePolicy, Executor, FreshnessProbe, LoadRunner, LoadShape, MeteredTransport, Preset,
    ProbeConfig, ProbeError, ProbeResult, ReadBenchmark, ReportFormat, ReqwestTransport, Route,
    RunMetrics, Scenario, SubjectStrategy, SummaryReport, ThresholdSet, Workload,
};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};
use tracing_subscriber::{fmt, EnvFilter};

#[derive(Parser, Debug)]
#[command(name = "freshprobe")]
#[command(about = "Freshness SLA probing and read load generation", long_about = None)]
#[command(version)]
struct Cli {
    /// Configuration file (defaults to FRESHPROBE_CONFIG / ./config/freshprobe)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Log at debug level unless RUST_LOG is set
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Measure write-to-read freshness across replicas
    Freshness {
        #[command(flatten)]
        target: TargetArgs,

        /// Per-iteration convergence deadline in milliseconds
        #[arg(long)]
        deadline_ms: Option<u64>,

        /// Convergence policy (any or all)
        #[arg(long)]
        policy: Option<ConvergencePolicy>,

        #[command(flatten)]
        run: RunArgs,
    },

    /// Read-only latency benchmark
    Read {
        #[command(flatten)]
        target: TargetArgs,

        /// Route to read (price, price-db, products)
        #[arg(long, default_value = "price")]
        route: Route,

        /// Subject: "hot", "random", or a product id
        #[arg(long, default_value = "random")]
        subject: String,

        /// Switch to constant arrival rate, iterations per second
        #[arg(long)]
        rate: Option<u64>,

        /// VU ceiling for the arrival-rate executor
        #[arg(long)]
        max_vus: Option<usize>,

        #[command(flatten)]
        run: RunArgs,
    },

    /// Run a built-in benchmark (freshness-sla, cache-hot, db-baseline, high-rps)
    Preset {
        name: Preset,

        #[command(flatten)]
        target: TargetArgs,

        #[command(flatten)]
        report: ReportArgs,
    },

    /// Generate configuration file
    GenerateConfig {
        /// Output configuration file path
        #[arg(long, default_value = "freshprobe.toml")]
        output: String,
    },
}

#[derive(Args, Debug)]
struct TargetArgs {
    /// Endpoint or comma-delimited replica list (overrides the configuration)
    #[arg(long)]
    endpoints: Option<String>,
}

#[derive(Args, Debug)]
struct RunArgs {
    /// Concurrent virtual users
    #[arg(long)]
    vus: Option<usize>,

    /// Run duration in seconds
    #[arg(long)]
    duration_secs: Option<u64>,

    /// Extra threshold, e.g. "freshness_delay:p(95)<=3000" (repeatable)
    #[arg(long = "threshold", value_name = "METRIC:EXPR")]
    thresholds: Vec<String>,

    #[command(flatten)]
    report: ReportArgs,
}

#[derive(Args, Debug)]
struct ReportArgs {
    /// Report format (text, markdown, json, prometheus)
    #[arg(long, default_value = "text")]
    format: ReportFormat,

    /// Write the report to a file instead of stdout
    #[arg(long)]
    output: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    // Initialize logging
    init_logging(cli.verbose);

    let passed = match cli.command {
        Commands::GenerateConfig { output } => {
            std::fs::write(&output, CONFIG_TEMPLATE)?;
            println!("Configuration template written to: {}", output);
            println!("\nEdit the file and use it with:");
            println!("  freshprobe --config {} freshness", output);
            return Ok(());
        }
        command => match run(cli.config, command).await {
            Ok(passed) => passed,
            Err(e) => {
                error!(error = %e, "run aborted");
                return Err(e.into());
            }
        },
    };

    if !passed {
        std::process::exit(1);
    }
    Ok(())
}

/// Execute a run command; `Ok(false)` means a threshold failed.
async fn run(config_path: Option<PathBuf>, command: Commands) -> ProbeResult<bool> {
    let mut config = load_config(config_path)?;
    let mut thresholds = config.threshold_set()?;

    match command {
        Commands::Freshness {
            target,
            deadline_ms,
            policy,
            run,
        } => {
            target.apply(&mut config);
            if let Some(deadline_ms) = deadline_ms {
                config.freshness.deadline_ms = deadline_ms;
            }
            if let Some(policy) = policy {
                config.freshness.policy = policy;
            }
            run.apply(&mut config, &mut thresholds)?;
            config.validate()?;

            freshness(&config, config.load_shape(), thresholds, &run.report).await
        }

        Commands::Read {
            target,
            route,
            subject,
            rate,
            max_vus,
            run,
        } => {
            target.apply(&mut config);
            if let Some(rate) = rate {
                config.load.executor = Executor::ConstantArrivalRate;
                config.load.rate = rate;
                config.load.time_unit_ms = 1000;
            }
            if let Some(max_vus) = max_vus {
                config.load.max_vus = max_vus;
            }
            run.apply(&mut config, &mut thresholds)?;
            if config.load.pre_allocated_vus > config.load.max_vus {
                config.load.pre_allocated_vus = config.load.max_vus;
            }
            config.validate()?;

            let subjects = parse_subject(&subject, config.target.hot_product_id)?;
            let think_time = Duration::from_millis(config.load.think_time_ms);
            let mut shape = config.load_shape();
            // Think time is applied by the benchmark, not twice.
            if let LoadShape::ConstantVus { think_time, .. } = &mut shape {
                *think_time = Duration::ZERO;
            }

            read(&config, shape, route, subjects, think_time, thresholds, &run.report).await
        }

        Commands::Preset {
            name,
            target,
            report,
        } => {
            target.apply(&mut config);
            config.validate()?;
            thresholds.extend(name.thresholds()?);
            info!(preset = %name, "{}", name.description());

            match name.workload(config.target.hot_product_id) {
                Workload::Freshness => freshness(&config, name.shape(), thresholds, &report).await,
                Workload::Read {
                    route,
                    subjects,
                    think_time,
                } => {
                    read(&config, name.shape(), route, subjects, think_time, thresholds, &report)
                        .await
                }
            }
        }

        Commands::GenerateConfig { .. } => Ok(true),
    }
}

/// `BASE_URL` is only a fallback below the file and `FRESHPROBE_*` keys.
fn load_config(config_path: Option<PathBuf>) -> ProbeResult<ProbeConfig> {
    match config_path {
        Some(path) => ProbeConfig::from_file(path),
        None => ProbeConfig::load(),
    }
}

impl TargetArgs {
    fn apply(&self, config: &mut ProbeConfig) {
        if let Some(endpoints) = &self.endpoints {
            config.target.endpoints = Some(endpoints.clone());
        }
    }
}

impl RunArgs {
    fn apply(&self, config: &mut ProbeConfig, thresholds: &mut ThresholdSet) -> ProbeResult<()> {
        if let Some(vus) = self.vus {
            config.load.vus = vus;
        }
        if let Some(duration_secs) = self.duration_secs {
            config.load.duration_secs = duration_secs;
        }
        for assignment in &self.thresholds {
            thresholds.add_assignment(assignment)?;
        }
        Ok(())
    }
}

fn parse_subject(raw: &str, hot_product_id: u64) -> ProbeResult<SubjectStrategy> {
    match raw {
        "hot" => Ok(SubjectStrategy::Fixed(hot_product_id)),
        "random" => Ok(SubjectStrategy::Random { min: 1, max: 100_000 }),
        id => id.parse().map(SubjectStrategy::Fixed).map_err(|_| {
            ProbeError::invalid_config(format!(
                "subject must be 'hot', 'random' or a product id, got '{}'",
                id
            ))
        }),
    }
}

async fn freshness(
    config: &ProbeConfig,
    shape: LoadShape,
    thresholds: ThresholdSet,
    report: &ReportArgs,
) -> ProbeResult<bool> {
    let metrics = Arc::new(RunMetrics::new());
    let transport = metered(config, &shape, &metrics)?;
    let targets = config.targets();

    info!(
        replicas = targets.len(),
        policy = %config.freshness.policy,
        deadline_ms = config.freshness.deadline_ms,
        subject = %config.subject_strategy().description(),
        "freshness probe configured"
    );

    let probe = FreshnessProbe::new(
        targets,
        transport,
        config.generator(),
        config.subject_strategy(),
        config.poll_settings(),
        Arc::clone(&metrics),
    );
    execute(Arc::new(probe), shape, metrics, thresholds, report).await
}

async fn read(
    config: &ProbeConfig,
    shape: LoadShape,
    route: Route,
    subjects: SubjectStrategy,
    think_time: Duration,
    thresholds: ThresholdSet,
    report: &ReportArgs,
) -> ProbeResult<bool> {
    let metrics = Arc::new(RunMetrics::new());
    let transport = metered(config, &shape, &metrics)?;

    info!(route = %route, subject = %subjects.description(), "read benchmark configured");

    let bench = ReadBenchmark::new(route, subjects, config.targets(), transport)
        .with_think_time(think_time);
    execute(Arc::new(bench), shape, metrics, thresholds, report).await
}

fn metered(
    config: &ProbeConfig,
    shape: &LoadShape,
    metrics: &Arc<RunMetrics>,
) -> ProbeResult<Arc<MeteredTransport<ReqwestTransport>>> {
    let client = ReqwestTransport::new(config.request_timeout(), shape.max_concurrency())?;
    Ok(Arc::new(MeteredTransport::new(client, Arc::clone(metrics))))
}

async fn execute<S: Scenario>(
    scenario: Arc<S>,
    shape: LoadShape,
    metrics: Arc<RunMetrics>,
    thresholds: ThresholdSet,
    report: &ReportArgs,
) -> ProbeResult<bool> {
    let name = scenario.name().to_string();
    let stats = LoadRunner::new(Arc::clone(&metrics))
        .run(&shape, scenario)
        .await;

    let snapshot = metrics.snapshot();
    let summary = SummaryReport::new(
        &name,
        &shape.description(),
        &stats,
        &snapshot,
        thresholds.evaluate(&snapshot),
    );

    match &report.output {
        Some(path) => {
            summary.write_report(path, report.format)?;
            print!("{}", summary.render(ReportFormat::Text)?);
            info!(path = %path.display(), format = %report.format, "report written");
        }
        None => print!("{}", summary.render(report.format)?),
    }

    for failure in summary.thresholds.failures() {
        error!(metric = %failure.metric, expression = %failure.expression, "{}", failure.message);
    }

    Ok(summary.passed)
}

fn init_logging(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

const CONFIG_TEMPLATE: &str = r#"# freshprobe configuration
# Every key is optional; values shown are the defaults.
# Override any key with FRESHPROBE_<SECTION>__<KEY>, e.g. FRESHPROBE_LOAD__VUS=50

[target]
# Single endpoint or comma-delimited replica list
endpoints = "http://localhost:8080"
hot_product_id = 12345

[freshness]
deadline_ms = 5000
poll_interval_ms = 50
policy = "any"            # any or all
subject = "fixed"         # fixed, random or per-worker
product_id = 9999
product_id_min = 1
product_id_max = 100000
adjustment_type = "PROMO"
adjustment_mode = "ABSOLUTE"  # ABSOLUTE or RELATIVE
value_min = 1
value_max = 10
batch_size = 1

[load]
executor = "constant-vus"  # constant-vus or constant-arrival-rate
vus = 20
duration_secs = 15
rate = 100
time_unit_ms = 1000
pre_allocated_vus = 10
max_vus = 100
think_time_ms = 0

[http]
request_timeout_ms = 10000

[thresholds]
freshness_delay = ["avg<=1000", "p(95)<=3000"]
freshness_timeout = ["rate==0"]
"#;

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_base_url_does_not_replace_configured_replicas() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("freshprobe.toml");
        let mut file = std::fs::File::create(&path).unwrap();
        file.write_all(b"[target]\nendpoints = \"http://replica-a,http://replica-b\"\n")
            .unwrap();

        std::env::set_var("BASE_URL", "http://localhost:8080");
        let cli = Cli::try_parse_from([
            "freshprobe",
            "--config",
            path.to_str().unwrap(),
            "freshness",
        ])
        .unwrap();
        let mut config = load_config(cli.config).unwrap();
        let Commands::Freshness { target, .. } = cli.command else {
            panic!("expected the freshness command");
        };
        target.apply(&mut config);
        std::env::remove_var("BASE_URL");

        assert!(target.endpoints.is_none());
        assert_eq!(
            config.target.endpoints.as_deref(),
            Some("http://replica-a,http://replica-b")
        );
        assert_eq!(config.targets().len(), 2);
    }

    #[test]
    fn test_endpoints_flag_overrides_configuration() {
        let cli = Cli::try_parse_from(["freshprobe", "read", "--endpoints", "http://r1,http://r2"])
            .unwrap();
        let Commands::Read { target, .. } = cli.command else {
            panic!("expected the read command");
        };

        let mut config = ProbeConfig::default();
        target.apply(&mut config);
        assert_eq!(config.target.endpoints.as_deref(), Some("http://r1,http://r2"));
    }
}
