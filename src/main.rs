use std::env;
use std::fs::{self, File};
use std::io;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Mutex;
use std::time::Duration;

use anyhow::{Context, Result, anyhow, bail};
use clap::{Args, CommandFactory, Parser, Subcommand, ValueHint};
use clap_complete::{Shell, generate};
use perftest::analysis::compare::STARTUP_QUERY;
use perftest::analysis::{
    AnalyzeRequest, Analyzer, CompareRequest, MetricDelta, QueryLibrary, ReportFormat,
    ShellTraceProcessor, TraceSet,
};
use perftest::build::{BuildStage, BuildVariant, GitFetcher, GradleBuild};
use perftest::catalog::TestCatalog;
use perftest::config::Config;
use perftest::credentials::{AwsCredentials, Credentials, Secret};
use perftest::devicefarm::{DeviceFarmClient, RunStatus};
use perftest::observability::{MetricsCollector, log_snapshot};
use perftest::pipeline::{FullRunRequest, Pipeline, PipelineError};
use perftest::poll::SystemClock;
use perftest::testrun::{TestOptions, TestOutcome, TestStage};
use perftest::validation::validate_environment;
use perftest::{ArtifactCache, ArtifactSet, BuildIdentity, PerftestError};
use tracing::{debug, error, info, warn};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

const EXIT_STAGE_FAILED: u8 = 1;
const EXIT_PARTIAL_ANALYSIS: u8 = 2;
const EXIT_TIMEOUT: u8 = 3;

fn main() -> ExitCode {
    let cli = Cli::parse();
    match run(cli) {
        Ok(code) => code,
        Err(err) => {
            eprintln!("error: {err:#}");
            if let Some(run_arn) = timed_out_run(&err) {
                eprintln!("the run is still active; resume with `perftest resume --run-arn {run_arn}`");
            }
            ExitCode::from(exit_code_for(&err))
        }
    }
}

fn run(cli: Cli) -> Result<ExitCode> {
    if let Commands::Completions { shell } = cli.command {
        generate(shell, &mut Cli::command(), "perftest", &mut io::stdout());
        return Ok(ExitCode::SUCCESS);
    }

    let (mut config, source) = Config::load(cli.config.as_deref())?;
    config.apply_env(env_lookup);
    if let Some(dir) = cli.output_dir {
        config.output.base_dir = dir;
    }

    configure_tracing(&config.logging.level, cli.verbose, config.logging.file.as_deref())?;
    match &source {
        Some(path) => debug!(config = %path.display(), "Loaded configuration"),
        None => debug!("Using built-in configuration defaults"),
    }

    match cli.command {
        Commands::Build(args) => build_command(&config, args),
        Commands::Test(args) => test_command(&config, args),
        Commands::Resume(args) => resume_command(&config, args),
        Commands::Analyze(args) => analyze_command(&config, args),
        Commands::Compare(args) => compare_command(&config, args),
        Commands::Tests => tests_command(&config),
        Commands::FullRun(args) => full_run_command(&config, args),
        Commands::Validate => validate_command(&config, source.as_deref()),
        Commands::Cache {
            action: CacheCommands::List,
        } => cache_list_command(&config),
        Commands::Completions { .. } => Ok(ExitCode::SUCCESS),
    }
}

/// `RUST_LOG` wins, then `--verbose`, then the configured level.
fn configure_tracing(level: &str, verbose: bool, log_file: Option<&Path>) -> Result<()> {
    let default_level = if verbose { "debug" } else { level };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    let file_layer = match log_file {
        Some(path) => {
            if let Some(parent) = path.parent()
                && !parent.as_os_str().is_empty()
            {
                fs::create_dir_all(parent)
                    .with_context(|| format!("Failed to create log directory: {}", parent.display()))?;
            }
            let file = File::options()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("Failed to open log file: {}", path.display()))?;
            Some(fmt::layer().with_ansi(false).with_writer(Mutex::new(file)))
        }
        None => None,
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(io::stderr))
        .with(file_layer)
        .try_init()
        .map_err(|err| anyhow!(err.to_string()))
}

fn env_lookup(key: &str) -> Option<String> {
    env::var(key).ok()
}

fn load_credentials(github_token: Option<String>) -> Credentials {
    let aws = match AwsCredentials::from_lookup(env_lookup) {
        Ok(creds) => Some(creds),
        Err(err) => {
            debug!(error = %err, "AWS credentials unavailable");
            None
        }
    };
    Credentials {
        github_token: github_token
            .map(Secret::new)
            .filter(|token| !token.expose().is_empty()),
        aws,
    }
}

fn build_command(config: &Config, args: BuildCommandArgs) -> Result<ExitCode> {
    let credentials = load_credentials(args.build.github_token.clone());
    let identity = args.identity.resolve(config)?;
    let (stage, variant) = build_stage(config, &args.build, &credentials, true)?;

    let outcome = stage
        .build(&identity, &variant)
        .with_context(|| format!("Build of {identity} failed"))?;
    info!(cache_hit = outcome.cache_hit, "Build artifacts ready");
    println!("app: {}", outcome.artifacts.app_apk.display());
    println!("test: {}", outcome.artifacts.test_apk.display());
    Ok(ExitCode::SUCCESS)
}

fn test_command(config: &Config, args: TestCommandArgs) -> Result<ExitCode> {
    let artifacts = match (&args.app_apk, &args.test_apk) {
        (Some(app), Some(test)) => ArtifactSet::from_paths(app, test)?,
        (None, None) => {
            let Some(commit) = &args.commit else {
                bail!("pass --app-apk and --test-apk, or --commit to use cached artifacts");
            };
            let branch = args
                .branch
                .clone()
                .unwrap_or_else(|| config.build.default_branch.clone());
            let identity = BuildIdentity::new(branch, commit.clone())?;
            ArtifactCache::new(&config.output.base_dir)
                .resolve(&identity)
                .ok_or_else(|| PerftestError::ArtifactsNotFound(identity.to_string()))?
        }
        _ => bail!("--app-apk and --test-apk must be given together"),
    };

    let credentials = load_credentials(None);
    let stage = test_stage(config, &credentials)?;
    let mut options = args.device.options(config)?;
    options.wait = !args.no_wait;
    let outcome = stage.run(&artifacts, &options).context("Test stage failed")?;
    Ok(report_test_outcome(&outcome))
}

fn resume_command(config: &Config, args: ResumeArgs) -> Result<ExitCode> {
    let credentials = load_credentials(None);
    let stage = test_stage(config, &credentials)?;
    let options = args.device.options(config)?;
    let outcome = stage
        .resume(&args.run_arn, &options)
        .with_context(|| format!("Resuming {} failed", args.run_arn))?;
    Ok(report_test_outcome(&outcome))
}

fn report_test_outcome(outcome: &TestOutcome) -> ExitCode {
    let run = &outcome.run;
    println!("run: {}", run.run_arn);
    println!("status: {}", run.status);
    if let Some(downloads) = &outcome.downloads {
        println!("traces: {}", downloads.trace_dir.display());
        for failure in downloads.failures() {
            warn!(
                device = %failure.device,
                error = failure.error.as_deref().unwrap_or_default(),
                "Device results incomplete"
            );
        }
    }
    if let Some(path) = &outcome.summary_path {
        println!("summary: {}", path.display());
    }

    match run.status {
        RunStatus::Completed | RunStatus::Pending | RunStatus::Running => ExitCode::SUCCESS,
        RunStatus::Failed | RunStatus::Stopped => ExitCode::from(EXIT_STAGE_FAILED),
    }
}

fn analyze_command(config: &Config, args: AnalyzeArgs) -> Result<ExitCode> {
    if args.trace_file.is_empty() && args.trace_dir.is_none() {
        bail!("pass --trace-file or --trace-dir");
    }
    let request = AnalyzeRequest {
        trace_files: args.trace_file,
        trace_dir: args.trace_dir,
        queries: args.queries.names(config),
        custom_queries: args.queries.custom_query,
        format: args.queries.output_format,
        output: args.output,
    };

    let outcome = analyzer(config).run(&request).context("Analysis failed")?;
    println!("report: {}", outcome.path.display());
    if outcome.report.is_partial() {
        return Ok(ExitCode::from(EXIT_PARTIAL_ANALYSIS));
    }
    Ok(ExitCode::SUCCESS)
}

fn compare_command(config: &Config, args: CompareArgs) -> Result<ExitCode> {
    let side = |dir: PathBuf, label: Option<String>| match label {
        Some(label) => TraceSet::new(label, dir),
        None => TraceSet::from_dir(dir),
    };
    let request = CompareRequest {
        base: side(args.base_dir, args.base_label),
        test: side(args.test_dir, args.test_label),
        query: args.query,
        format: args.output_format,
        output: args.output,
    };

    let outcome = analyzer(config).compare(&request).context("Comparison failed")?;
    print_deltas(&outcome.comparison.deltas);
    println!("report: {}", outcome.path.display());
    Ok(ExitCode::SUCCESS)
}

fn print_deltas(deltas: &[MetricDelta]) {
    for delta in deltas {
        let pct = delta
            .mean_delta_pct
            .map(|pct| format!(" ({pct:+.1}%)"))
            .unwrap_or_default();
        println!(
            "{}: {:.1} -> {:.1} ms, {:+.1} ms{pct}",
            delta.metric, delta.base_mean, delta.test_mean, delta.mean_delta_ms
        );
    }
}

fn tests_command(config: &Config) -> Result<ExitCode> {
    let path = &config.devicefarm.tests_catalog;
    let catalog = TestCatalog::load(path)
        .with_context(|| format!("Failed to load test catalog: {}", path.display()))?;
    if catalog.tests().is_empty() {
        println!("no tests listed in {}", path.display());
    }
    for test in catalog.tests() {
        println!("{}\t{}", test.full_name(), test.description);
    }
    Ok(ExitCode::SUCCESS)
}

fn full_run_command(config: &Config, args: FullRunArgs) -> Result<ExitCode> {
    let credentials = load_credentials(args.build.github_token.clone());
    let identity = args.identity.resolve(config)?;
    let baseline = match &args.baseline_commit {
        Some(commit) => {
            let branch = args
                .baseline_branch
                .clone()
                .unwrap_or_else(|| config.build.default_branch.clone());
            Some(BuildIdentity::new(branch, commit.clone())?)
        }
        None if args.baseline_branch.is_some() => bail!("--baseline-branch needs --baseline-commit"),
        None => None,
    };
    let (build, variant) = build_stage(config, &args.build, &credentials, !args.skip_build)?;
    let pipeline = Pipeline::new(
        build,
        test_stage(config, &credentials)?,
        analyzer(config),
        config.output_dir("reports"),
    );

    let request = FullRunRequest {
        identity,
        baseline,
        variant,
        test: args.device.options(config)?,
        skip_build: args.skip_build,
        skip_analysis: args.skip_analysis,
        queries: args.queries.names(config),
        custom_queries: args.queries.custom_query.clone(),
        format: args.queries.output_format,
    };

    let outcome = pipeline.full_run(&request);
    emit_metrics(pipeline.metrics(), args.print_metrics, args.metrics_json.as_deref())?;

    let result = match outcome {
        Ok(result) => result,
        Err(err) => {
            report_partial(&err);
            return Err(err.into());
        }
    };

    if let Some(path) = &result.summary_path {
        println!("summary: {}", path.display());
    }
    if let Some(deltas) = &result.comparison {
        print_deltas(deltas);
    }
    if let Some(path) = &result.report_path {
        println!("report: {}", path.display());
    }
    let run_failed = [&result.baseline_test, &result.test]
        .into_iter()
        .flatten()
        .any(|test| test.run.status != RunStatus::Completed);
    if run_failed {
        return Ok(ExitCode::from(EXIT_STAGE_FAILED));
    }
    if result.is_partial_analysis() {
        return Ok(ExitCode::from(EXIT_PARTIAL_ANALYSIS));
    }
    Ok(ExitCode::SUCCESS)
}

fn report_partial(err: &PipelineError) {
    let partial = &err.partial;
    if let Some(artifacts) = partial.artifacts() {
        info!(app_apk = %artifacts.app_apk.display(), "Build artifacts were produced");
    }
    if let Some(test) = &partial.test {
        info!(run_arn = %test.run.run_arn, status = %test.run.status, "Test run finished before the failure");
    }
    if let Some(path) = &partial.summary_path {
        println!("summary: {}", path.display());
    }
}

fn emit_metrics(metrics: &MetricsCollector, print: bool, json: Option<&Path>) -> Result<()> {
    if !print && json.is_none() {
        return Ok(());
    }
    let snapshot = metrics.snapshot();
    if print {
        log_snapshot(&snapshot);
    }
    if let Some(path) = json {
        snapshot
            .write_json(path)
            .with_context(|| format!("Failed to write metrics JSON: {}", path.display()))?;
        info!(metrics = %path.display(), "Metrics JSON written");
    }
    Ok(())
}

fn validate_command(config: &Config, source: Option<&Path>) -> Result<ExitCode> {
    match source {
        Some(path) => info!(config = %path.display(), "Configuration file"),
        None => info!("No configuration file found; using defaults"),
    }
    info!(output = %config.output.base_dir.display(), "Output directory");

    let report = validate_environment(config, env_lookup);
    for check in &report.checks {
        info!("ok: {check}");
    }
    for warning in &report.warnings {
        warn!("{warning}");
    }

    if report.is_ok() {
        info!(warnings = report.warnings.len(), "Environment validation passed");
        Ok(ExitCode::SUCCESS)
    } else {
        for error_msg in &report.errors {
            error!("{error_msg}");
        }
        Err(anyhow!(
            "Environment validation failed with {} error(s)",
            report.errors.len()
        ))
    }
}

fn cache_list_command(config: &Config) -> Result<ExitCode> {
    let cache = ArtifactCache::new(&config.output.base_dir);
    let entries = cache.list()?;
    if entries.is_empty() {
        println!("no cached builds under {}", cache.root().display());
    }
    for entry in entries {
        let manifest = &entry.manifest;
        println!(
            "{}\t{}\t{}\t{}\t{}",
            manifest.identity,
            manifest.variant,
            manifest.built_at.format("%Y-%m-%d %H:%M:%S"),
            manifest.app_apk.file_name,
            manifest.test_apk.file_name
        );
    }
    Ok(ExitCode::SUCCESS)
}

fn build_stage(
    config: &Config,
    args: &BuildArgs,
    credentials: &Credentials,
    require_repository: bool,
) -> Result<(BuildStage, BuildVariant)> {
    let mut build_config = config.build.clone();
    if let Some(url) = &args.repo_url {
        build_config.repository_url = url.clone();
    }
    if let Some(flavor) = &args.flavor {
        build_config.flavor = Some(flavor.clone());
    }
    if let Some(build_type) = &args.build_type {
        build_config.build_type = build_type.clone();
    }
    if require_repository && build_config.repository_url.trim().is_empty() {
        bail!("repository URL is required (--repo-url or build.repository_url)");
    }

    let token = match credentials.github_token() {
        Ok(token) => Some(token.clone()),
        Err(err) => {
            if require_repository {
                warn!(%err, "Cloning without authentication");
            }
            None
        }
    };
    let fetcher = GitFetcher::new(build_config.repository_url.clone(), token.clone());
    let tool = GradleBuild::from_config(&build_config, token);
    let variant = BuildVariant::new(build_config.flavor.clone(), build_config.build_type.clone());
    let stage = BuildStage::new(
        ArtifactCache::new(&config.output.base_dir),
        Box::new(fetcher),
        Box::new(tool),
    );
    Ok((stage, variant))
}

fn test_stage(config: &Config, credentials: &Credentials) -> Result<TestStage> {
    let aws = credentials.aws()?.clone();
    let farm = DeviceFarmClient::new(&config.devicefarm.region, aws);
    Ok(TestStage::new(
        Box::new(farm),
        Box::new(SystemClock::new()),
        &config.output.base_dir,
    ))
}

fn analyzer(config: &Config) -> Analyzer {
    Analyzer::new(
        Box::new(ShellTraceProcessor::new(&config.analysis.trace_processor_path)),
        QueryLibrary::new(config.analysis.query_dirs.clone()),
        config.output_dir("reports"),
        config.analysis.trace_pattern.clone(),
    )
}

fn perftest_error(err: &anyhow::Error) -> Option<&PerftestError> {
    err.chain().find_map(|cause| {
        cause
            .downcast_ref::<PipelineError>()
            .map(|pipeline| &pipeline.source)
            .or_else(|| cause.downcast_ref::<PerftestError>())
    })
}

fn exit_code_for(err: &anyhow::Error) -> u8 {
    match perftest_error(err) {
        Some(source) if source.is_timeout() => EXIT_TIMEOUT,
        _ => EXIT_STAGE_FAILED,
    }
}

fn timed_out_run(err: &anyhow::Error) -> Option<&str> {
    match perftest_error(err)? {
        PerftestError::Timeout { resource, .. } => resource.strip_prefix("run "),
        _ => None,
    }
}

#[derive(Parser)]
#[command(
    name = "perftest",
    version,
    about = "Build, run and analyze Android performance tests on AWS Device Farm"
)]
struct Cli {
    /// Configuration file; defaults to config/default.yaml when present
    #[arg(long, global = true, value_hint = ValueHint::FilePath)]
    config: Option<PathBuf>,
    /// Base directory for cache, traces, artifacts and reports
    #[arg(long = "output-dir", global = true, value_hint = ValueHint::DirPath)]
    output_dir: Option<PathBuf>,
    /// Enable debug logging
    #[arg(short, long, global = true)]
    verbose: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Clone and build the app and test APKs for a commit (cached)
    Build(BuildCommandArgs),
    /// Upload APKs and run the instrumentation tests on Device Farm
    Test(TestCommandArgs),
    /// Wait for an existing run and download its results
    Resume(ResumeArgs),
    /// Run SQL queries over Perfetto traces and write a report
    Analyze(AnalyzeArgs),
    /// Compare startup latency between two sets of traces
    Compare(CompareArgs),
    /// List the benchmark tests in the test catalog
    Tests,
    /// Build, test and analyze in one go
    FullRun(FullRunArgs),
    /// Check configuration, credentials and local tools
    Validate,
    /// Inspect the build artifact cache
    Cache {
        #[command(subcommand)]
        action: CacheCommands,
    },
    /// Print shell completions
    Completions {
        #[arg(value_enum)]
        shell: Shell,
    },
}

#[derive(Subcommand)]
enum CacheCommands {
    /// List cached builds
    List,
}

#[derive(Args)]
struct IdentityArgs {
    /// Branch to build; defaults to build.default_branch
    #[arg(long)]
    branch: Option<String>,
    /// Commit hash (4 to 40 hex characters)
    #[arg(long)]
    commit: String,
}

impl IdentityArgs {
    fn resolve(&self, config: &Config) -> Result<BuildIdentity> {
        let branch = self
            .branch
            .clone()
            .unwrap_or_else(|| config.build.default_branch.clone());
        Ok(BuildIdentity::new(branch, self.commit.clone())?)
    }
}

#[derive(Args)]
struct BuildArgs {
    /// GitHub token for private repositories and packages
    #[arg(long = "github-token", env = "GITHUB_PAT", hide_env_values = true)]
    github_token: Option<String>,
    #[arg(long = "repo-url")]
    repo_url: Option<String>,
    #[arg(long)]
    flavor: Option<String>,
    #[arg(long = "build-type")]
    build_type: Option<String>,
}

#[derive(Args)]
struct DeviceArgs {
    #[arg(long = "project-arn")]
    project_arn: Option<String>,
    /// Device pool name or ARN
    #[arg(long = "device-pool")]
    device_pool: Option<String>,
    /// Seconds to wait for the run before giving up locally
    #[arg(long)]
    timeout: Option<u64>,
    #[arg(long = "run-name")]
    run_name: Option<String>,
    /// Instrumentation class filter, passed as TEST_CLASS
    #[arg(long = "test-filter", conflicts_with = "test_name")]
    test_filter: Option<String>,
    /// Test from the catalog, by method name or Class#method
    #[arg(long = "test-name")]
    test_name: Option<String>,
    #[arg(long)]
    iterations: Option<u32>,
    #[arg(long = "test-spec", value_hint = ValueHint::FilePath)]
    test_spec: Option<PathBuf>,
    #[arg(long = "download-traces", overrides_with = "no_download_traces")]
    download_traces: bool,
    #[arg(long = "no-download-traces")]
    no_download_traces: bool,
    #[arg(long = "download-artifacts", overrides_with = "no_download_artifacts")]
    download_artifacts: bool,
    #[arg(long = "no-download-artifacts")]
    no_download_artifacts: bool,
}

impl DeviceArgs {
    fn options(&self, config: &Config) -> Result<TestOptions> {
        let mut options = TestOptions::from_config(&config.devicefarm);
        if let Some(arn) = &self.project_arn {
            options.project_arn = arn.clone();
        }
        if let Some(pool) = &self.device_pool {
            options.device_pool = pool.clone();
        }
        if let Some(secs) = self.timeout {
            options.run_policy.timeout = Duration::from_secs(secs);
        }
        if self.run_name.is_some() {
            options.run_name = self.run_name.clone();
        }
        if self.test_filter.is_some() {
            options.test_filter = self.test_filter.clone();
        }
        if let Some(name) = &self.test_name {
            let path = &config.devicefarm.tests_catalog;
            let catalog = TestCatalog::load(path)
                .with_context(|| format!("Failed to load test catalog: {}", path.display()))?;
            options.test_filter = Some(catalog.find(name)?.full_name());
        }
        if self.iterations.is_some() {
            options.iterations = self.iterations;
        }
        if self.test_spec.is_some() {
            options.test_spec_template = self.test_spec.clone();
        }
        options.download_traces = self.download_traces || !self.no_download_traces;
        options.download_artifacts = self.download_artifacts || !self.no_download_artifacts;
        Ok(options)
    }
}

#[derive(Args)]
struct QueryArgs {
    /// Query name; repeatable. Defaults to analysis.default_queries
    #[arg(long = "query")]
    query: Vec<String>,
    /// Extra SQL file, named after its file stem; repeatable
    #[arg(long = "custom-query", value_hint = ValueHint::FilePath)]
    custom_query: Vec<PathBuf>,
    #[arg(long = "output-format", value_enum, default_value_t = ReportFormat::Csv)]
    output_format: ReportFormat,
}

impl QueryArgs {
    /// Configured defaults apply only when no query was chosen at all.
    fn names(&self, config: &Config) -> Vec<String> {
        if self.query.is_empty() && self.custom_query.is_empty() {
            config.analysis.default_queries.clone()
        } else {
            self.query.clone()
        }
    }
}

#[derive(Args)]
struct BuildCommandArgs {
    #[command(flatten)]
    identity: IdentityArgs,
    #[command(flatten)]
    build: BuildArgs,
}

#[derive(Args)]
struct TestCommandArgs {
    #[arg(long = "app-apk", value_hint = ValueHint::FilePath)]
    app_apk: Option<PathBuf>,
    #[arg(long = "test-apk", value_hint = ValueHint::FilePath)]
    test_apk: Option<PathBuf>,
    /// Use cached artifacts for this commit instead of explicit APKs
    #[arg(long)]
    commit: Option<String>,
    #[arg(long)]
    branch: Option<String>,
    /// Schedule the run and return without waiting
    #[arg(long = "no-wait")]
    no_wait: bool,
    #[command(flatten)]
    device: DeviceArgs,
}

#[derive(Args)]
struct ResumeArgs {
    #[arg(long = "run-arn")]
    run_arn: String,
    #[command(flatten)]
    device: DeviceArgs,
}

#[derive(Args)]
struct AnalyzeArgs {
    /// Trace file; repeatable
    #[arg(long = "trace-file", value_hint = ValueHint::FilePath)]
    trace_file: Vec<PathBuf>,
    /// Directory searched recursively for traces
    #[arg(long = "trace-dir", value_hint = ValueHint::DirPath)]
    trace_dir: Option<PathBuf>,
    #[command(flatten)]
    queries: QueryArgs,
    /// Report path; defaults to <output>/reports/report-<timestamp>.<ext>
    #[arg(long, value_hint = ValueHint::FilePath)]
    output: Option<PathBuf>,
}

#[derive(Args)]
struct CompareArgs {
    /// Baseline traces: a run directory or a directory of runs
    #[arg(long = "base-dir", value_hint = ValueHint::DirPath)]
    base_dir: PathBuf,
    /// Candidate traces compared against the baseline
    #[arg(long = "test-dir", value_hint = ValueHint::DirPath)]
    test_dir: PathBuf,
    /// Label for the baseline; defaults to the directory name
    #[arg(long = "base-label")]
    base_label: Option<String>,
    #[arg(long = "test-label")]
    test_label: Option<String>,
    /// Query producing startup_latency_ms and render_latency_ms
    #[arg(long, default_value = STARTUP_QUERY)]
    query: String,
    #[arg(long = "output-format", value_enum, default_value_t = ReportFormat::Csv)]
    output_format: ReportFormat,
    /// Report path; defaults to <output>/reports/compare-<base>-vs-<test>-<timestamp>.<ext>
    #[arg(long, value_hint = ValueHint::FilePath)]
    output: Option<PathBuf>,
}

#[derive(Args)]
struct FullRunArgs {
    #[command(flatten)]
    identity: IdentityArgs,
    #[command(flatten)]
    build: BuildArgs,
    #[command(flatten)]
    device: DeviceArgs,
    #[command(flatten)]
    queries: QueryArgs,
    /// Also build and test this commit and compare startup latency against it
    #[arg(long = "baseline-commit")]
    baseline_commit: Option<String>,
    /// Branch of the baseline commit; defaults to build.default_branch
    #[arg(long = "baseline-branch")]
    baseline_branch: Option<String>,
    /// Use cached artifacts; fails if the commit was never built
    #[arg(long = "skip-build")]
    skip_build: bool,
    #[arg(long = "skip-analysis")]
    skip_analysis: bool,
    /// Log per-stage timings when the run ends
    #[arg(long = "print-metrics")]
    print_metrics: bool,
    #[arg(long = "metrics-json", value_hint = ValueHint::FilePath)]
    metrics_json: Option<PathBuf>,
}
