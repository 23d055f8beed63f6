mod cli;

use clap::Parser;
use cli::{AnalyzeArgs, CheckpointArgs, Cli, Commands, MonitorArgs, RestoreArgs, RunArgs, TurbostatArgs};
use color_eyre::eyre;
use idlesnap_common::{InstanceId, SnapshotError};
use idlesnap_controller::backend::{build_backend, CheckpointOptions, RestoreOptions};
use idlesnap_controller::experiment::{ExperimentConfig, ExperimentRunner};
use idlesnap_controller::metrics::{export_summary, EnergyModel, ExperimentResults, RESULTS_FILE};
use idlesnap_controller::telemetry::{monitor_to_csv, turbostat, TelemetryCollector};
use idlesnap_controller::{ControllerConfig, SnapshotController};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> eyre::Result<()> {
    dotenvy::dotenv().ok();
    color_eyre::install()?;
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    if let Err(report) = dispatch(cli).await {
        let code = report
            .downcast_ref::<SnapshotError>()
            .map_or(2, SnapshotError::exit_code);
        eprintln!("Error: {:?}", report);
        std::process::exit(code);
    }
    Ok(())
}

/// anyhow is used by the library plumbing; the binary reports through eyre.
trait IntoReport<T> {
    fn into_report(self) -> eyre::Result<T>;
}

impl<T> IntoReport<T> for anyhow::Result<T> {
    fn into_report(self) -> eyre::Result<T> {
        self.map_err(|e| {
            let context = e.to_string();
            match e.downcast::<SnapshotError>() {
                Ok(err) if err.to_string() == context => eyre::Report::new(err),
                Ok(err) => eyre::Report::new(err).wrap_err(context),
                Err(e) => eyre::eyre!("{:#}", e),
            }
        })
    }
}

async fn dispatch(cli: Cli) -> eyre::Result<()> {
    let mut config = ControllerConfig::load(cli.config.as_deref())?;
    if let Some(backend) = cli.backend {
        config.backend = backend;
    }

    match cli.command {
        Commands::Run(args) => run_experiment(config, args).await,
        Commands::Checkpoint(args) => checkpoint(config, args).await,
        Commands::Restore(args) => restore(config, args).await,
        Commands::Monitor(args) => monitor(config, args).await,
        Commands::Analyze(args) => analyze(config, args),
        Commands::Turbostat(args) => turbostat_report(args),
    }
}

fn seconds(value: f64, what: &str) -> Result<Duration, SnapshotError> {
    if value.is_finite() && value > 0.0 {
        Ok(Duration::from_secs_f64(value))
    } else {
        Err(SnapshotError::Config(format!("{what} must be a positive number of seconds")))
    }
}

async fn run_experiment(mut config: ControllerConfig, args: RunArgs) -> eyre::Result<()> {
    let idle = seconds(args.idle_seconds, "idle_seconds")?;
    let baseline = args
        .baseline_seconds
        .map(|s| seconds(s, "baseline_seconds"))
        .transpose()?;
    if args.num_runs == 0 {
        return Err(SnapshotError::Config("num_runs must be at least 1".into()).into());
    }

    config.criu.images_dir = args.checkpoint_dir.join("images");
    if config.cold_dir.is_none() {
        config.cold_dir = Some(args.checkpoint_dir.join("cold"));
    }
    if !args.cpus.is_empty() {
        config.cores = args.cpus.clone();
    }

    let backend = build_backend(&config).await?;
    let telemetry = Arc::new(TelemetryCollector::from_config(&config));
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let sampler = telemetry.clone().spawn(config.telemetry_interval(), shutdown_rx);
    let model = config.energy;

    let controller = Arc::new(SnapshotController::from_config(config, backend).await?);
    let runner = ExperimentRunner::new(controller, telemetry);
    let experiment = ExperimentConfig {
        instance: InstanceId::new(args.name),
        num_runs: args.num_runs,
        idle,
        results_dir: args.results_dir.clone(),
        footprint_bytes: args.footprint_bytes,
        restore_sla: Duration::from_millis(args.restore_sla_ms),
        baseline,
    };

    let outcome = tokio::select! {
        outcome = runner.run(&experiment) => outcome.into_report(),
        _ = tokio::signal::ctrl_c() => {
            warn!("Interrupted, no results written");
            Err(eyre::eyre!("experiment interrupted"))
        }
    };
    let _ = shutdown_tx.send(true);
    if let Err(e) = sampler.await {
        warn!("Telemetry sampler ended abnormally: {}", e);
    }

    let outcome = outcome?;
    print_results(&outcome.results, &model);
    info!(
        run_id = %outcome.report.run_id,
        estimated_energy_saved_joules = outcome.report.estimated_energy_saved_joules,
        "Experiment complete"
    );
    Ok(())
}

async fn checkpoint(config: ControllerConfig, args: CheckpointArgs) -> eyre::Result<()> {
    let backend = build_backend(&config).await?;
    let name = args
        .name
        .unwrap_or_else(|| format!("checkpoint-{}", chrono::Utc::now().format("%Y%m%d-%H%M%S")));
    let options = CheckpointOptions {
        leave_running: args.leave_running,
        timeout: config.checkpoint_timeout(),
    };

    let started = Instant::now();
    let instance = InstanceId::new(args.instance);
    tokio::time::timeout(
        options.timeout,
        backend.dump_named(&instance, &args.dir, &name, &options),
    )
    .await
    .map_err(|_| {
        SnapshotError::checkpoint(
            &instance,
            idlesnap_common::CheckpointErrorKind::Timeout,
            format!("checkpoint exceeded {:?}", options.timeout),
        )
    })??;

    println!(
        "Checkpoint '{}' of {} written to {} in {:.1} ms",
        name,
        instance,
        args.dir.display(),
        started.elapsed().as_secs_f64() * 1000.0
    );
    Ok(())
}

async fn restore(config: ControllerConfig, args: RestoreArgs) -> eyre::Result<()> {
    let backend = build_backend(&config).await?;
    let options = RestoreOptions {
        target_identity: InstanceId::new(args.instance),
        timeout: config.restore_timeout(),
    };

    let started = Instant::now();
    let handle = tokio::time::timeout(
        options.timeout,
        backend.restore_named(&args.checkpoint_name, &args.dir, &options),
    )
    .await
    .map_err(|_| {
        SnapshotError::restore(
            &options.target_identity,
            idlesnap_common::RestoreErrorKind::Timeout,
            format!("restore exceeded {:?}", options.timeout),
        )
    })??;

    println!(
        "Restored {} as {} in {:.1} ms",
        handle.instance_id,
        handle.identity,
        started.elapsed().as_secs_f64() * 1000.0
    );
    Ok(())
}

async fn monitor(mut config: ControllerConfig, args: MonitorArgs) -> eyre::Result<()> {
    let interval = seconds(args.interval, "interval")?;
    let duration = seconds(args.duration, "duration")?;
    config.cores = args.cpus.0;
    let states = if args.states.is_empty() {
        vec![config.deep_idle_state.clone()]
    } else {
        args.states
    };
    for state in &states {
        if !config.cstate_map.contains_canonical(state) {
            return Err(SnapshotError::Config(format!("no idle state maps to {state}")).into());
        }
    }

    let collector = TelemetryCollector::from_config(&config);
    let rows = monitor_to_csv(&collector, &states, interval, duration, &args.out)
        .await
        .into_report()?;
    if collector.read_failures() > 0 {
        warn!(
            failures = collector.read_failures(),
            "Some residency reads failed; see earlier warnings"
        );
    }
    println!("Wrote {} rows to {}", rows, args.out.display());
    Ok(())
}

fn analyze(config: ControllerConfig, args: AnalyzeArgs) -> eyre::Result<()> {
    if !args.results_dir.join(RESULTS_FILE).exists() {
        return Err(SnapshotError::Prerequisite(format!(
            "no {} in {}",
            RESULTS_FILE,
            args.results_dir.display()
        ))
        .into());
    }

    let mut model = config.energy;
    if let Some(power) = args.server_power {
        model.server_power_w = power;
    }

    let results = ExperimentResults::load(&args.results_dir).into_report()?;
    print_results(&results, &model);

    if let Some(path) = args.export {
        export_summary(&results, &model, &path).into_report()?;
        println!("Summary exported to {}", path.display());
    }
    Ok(())
}

fn turbostat_report(args: TurbostatArgs) -> eyre::Result<()> {
    if !args.logfile.exists() {
        return Err(SnapshotError::Prerequisite(format!("{} not found", args.logfile.display())).into());
    }
    let samples = turbostat::parse_file(&args.logfile).into_report()?;
    let filter = (!args.cpus.is_empty()).then_some(args.cpus.as_slice());
    let Some(summary) = turbostat::analyze(&samples, filter) else {
        return Err(SnapshotError::Prerequisite("no matching samples in the turbostat log".into()).into());
    };

    println!("Turbostat summary ({} samples)", summary.total_samples);
    println!("{:>5} {:>8} {:>8} {:>8} {:>8} {:>9}", "CPU", "C6 avg", "C6 min", "C6 max", "Busy", "MHz");
    for (cpu, stats) in &summary.per_cpu {
        println!(
            "{:>5} {:>7.2}% {:>7.2}% {:>7.2}% {:>7.2}% {:>9.0}",
            cpu, stats.c6_avg, stats.c6_min, stats.c6_max, stats.busy_avg, stats.freq_avg
        );
    }
    let aggregate = &summary.aggregate;
    println!(
        "C6 residency {:.2}% (sd {:.2}), busy {:.2}%",
        aggregate.c6_avg, aggregate.c6_std, aggregate.busy_avg
    );
    if let Some(watts) = aggregate.pkg_watt_avg {
        println!("Package power {:.2} W", watts);
    }

    if let Some(path) = args.export {
        turbostat::export_csv(&samples, &path).into_report()?;
        println!("Samples exported to {}", path.display());
    }
    Ok(())
}

fn print_results(results: &ExperimentResults, model: &EnergyModel) {
    let energy = results.energy(model);
    println!("Runs:                 {}", results.runs.len());
    println!("Avg checkpoint:       {:.1} ms", results.avg_checkpoint_ms());
    println!("Avg restore:          {:.1} ms", results.avg_restore_ms());
    println!("Total overhead:       {:.1} ms", results.total_overhead_ms());
    println!("Avg C6 residency:     {:.2} %", results.avg_c6_residency());
    match results.baseline_c6 {
        Some(baseline) => println!(
            "Baseline C6:          {:.2} % ({:+.2} points)",
            baseline,
            results.c6_improvement()
        ),
        None => println!("Baseline C6:          not measured"),
    }
    println!("Overhead energy:      {:.1} J", energy.overhead_energy_j);
    println!("Idle energy saved:    {:.1} J", energy.idle_energy_saved_j);
    println!(
        "Net savings:          {:.1} J ({:.1} %)",
        energy.net_savings_j, energy.net_savings_percent
    );
    match energy.break_even_idle_s {
        Some(seconds) => println!("Break-even idle time: {:.2} s", seconds),
        None => println!("Break-even idle time: never (no deep idle residency)"),
    }
}
