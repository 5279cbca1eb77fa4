// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{anyhow, Context};
use clap::Parser;
use domain_api_types::{NodeCapacity, PlacementConstraints, VmSpec};
use launcher_config_toml::Config;
use serde::de::DeserializeOwned;
use slog::{error, info, o, warn, Logger};

use virt_launcher::connection::ConnectionManager;
use virt_launcher::daemon::sim::SimulatedDaemon;
use virt_launcher::daemon::socket::SocketConnector;
use virt_launcher::daemon::Connector;
use virt_launcher::placement::compute_placement;
use virt_launcher::spec::SpecConverter;
use virt_launcher::vm::Vm;

fn parse_log_level(s: &str) -> anyhow::Result<slog::Level> {
    s.parse().map_err(|_| anyhow!("Invalid log level"))
}

#[derive(Debug, clap::Args)]
struct PlacementArgs {
    /// JSON file holding precomputed placement constraints.
    #[clap(long, conflicts_with = "node_capacity")]
    constraints: Option<PathBuf>,

    /// JSON file describing the host's free capacity. Placement is computed
    /// from it.
    #[clap(long)]
    node_capacity: Option<PathBuf>,
}

#[derive(Debug, Parser)]
#[clap(about, version)]
/// Launches a virtual machine on the host's virtualization daemon and keeps
/// it in the requested state
enum Args {
    /// Runs a VM until interrupted, then stops and removes it.
    Run {
        /// TOML launcher configuration. Defaults apply if omitted.
        #[clap(long)]
        config: Option<PathBuf>,

        /// JSON VM specification.
        #[clap(long)]
        spec: PathBuf,

        #[clap(flatten)]
        placement: PlacementArgs,

        /// Runs against an in-process simulated daemon.
        #[clap(long, action)]
        simulate: bool,

        /// Logging level for the launcher
        #[clap(long, default_value_t = slog::Level::Info, value_parser = parse_log_level)]
        log_level: slog::Level,
    },

    /// Prints the domain definition a VM specification converts to.
    Render {
        #[clap(long)]
        spec: PathBuf,

        #[clap(flatten)]
        placement: PlacementArgs,
    },
}

fn read_json<T: DeserializeOwned>(path: &Path) -> anyhow::Result<T> {
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("reading {}", path.display()))?;
    serde_json::from_str(&contents)
        .with_context(|| format!("parsing {}", path.display()))
}

fn load_placement(
    args: &PlacementArgs,
    spec: &VmSpec,
) -> anyhow::Result<PlacementConstraints> {
    match (&args.constraints, &args.node_capacity) {
        (Some(path), _) => read_json(path),
        (None, Some(path)) => {
            let capacity: NodeCapacity = read_json(path)?;
            Ok(compute_placement(&capacity, spec)?)
        }
        (None, None) => Err(anyhow!(
            "one of --constraints or --node-capacity is required"
        )),
    }
}

fn build_logger(level: slog::Level) -> slog::Logger {
    use slog::Drain;

    let main_drain = if atty::is(atty::Stream::Stdout) {
        let decorator = slog_term::TermDecorator::new().build();
        let drain = slog_term::FullFormat::new(decorator).build().fuse();
        slog_async::Async::new(drain)
            .overflow_strategy(slog_async::OverflowStrategy::Block)
            .build_no_guard()
    } else {
        let drain = slog_bunyan::with_name("virt-launcher", std::io::stdout())
            .build()
            .fuse();
        slog_async::Async::new(drain)
            .overflow_strategy(slog_async::OverflowStrategy::Block)
            .build_no_guard()
    };

    let filtered_main = slog::LevelFilter::new(main_drain, level);
    slog::Logger::root(filtered_main.fuse(), o!())
}

async fn run_launcher(
    config: Config,
    spec: VmSpec,
    placement: PlacementConstraints,
    simulate: bool,
    log: Logger,
) -> anyhow::Result<()> {
    let connector: Arc<dyn Connector> = if simulate {
        info!(log, "using simulated daemon");
        let sim = SimulatedDaemon::new(log.new(o!("component" => "sim")));
        Arc::new(sim.connector())
    } else {
        Arc::new(SocketConnector::new(
            config.connection.socket_path.clone(),
            config.connection.request_timeout(),
            log.new(o!("component" => "daemon_socket")),
        ))
    };

    let conn = ConnectionManager::connect(
        connector,
        config.connection.clone(),
        log.new(o!("component" => "connection")),
    )
    .await
    .context("connecting to virtualization daemon")?;

    let converter = Arc::new(SpecConverter::new());
    let vm = Vm::launch(&spec.name, conn.clone(), converter, &config, &log)
        .await
        .context("launching VM")?;

    let outcome = vm.reconcile(spec, placement).await;
    let result = match outcome {
        Ok(outcome) => {
            info!(log, "VM reconciled"; "outcome" => ?outcome);
            wait_for_interrupt(&vm, &log).await
        }
        Err(e) => Err(anyhow!(e).context("reconciling VM")),
    };

    match vm.shutdown(true, None).await {
        Ok(outcome) => {
            info!(log, "VM stopped"; "outcome" => ?outcome);
            if let Err(e) = vm.teardown().await {
                warn!(log, "failed to remove domain"; "error" => %e);
            }
        }
        Err(e) => error!(log, "failed to stop VM"; "error" => %e),
    }

    vm.stop().await;
    conn.shutdown().await;
    result
}

/// Logs the VM's state changes until the process is interrupted.
async fn wait_for_interrupt(vm: &Vm, log: &Logger) -> anyhow::Result<()> {
    let mut state_rx = vm.state_watch();
    loop {
        tokio::select! {
            res = tokio::signal::ctrl_c() => {
                res.context("waiting for interrupt")?;
                info!(log, "interrupted; stopping VM");
                return Ok(());
            }
            res = state_rx.changed() => {
                if res.is_err() {
                    return Err(anyhow!("VM state driver exited"));
                }
                let current = state_rx.borrow_and_update().clone();
                info!(log, "VM state"; "gen" => current.gen,
                      "state" => %current.state,
                      "migration" => ?current.migration);
            }
        }
    }
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    match args {
        Args::Render { spec, placement } => {
            let spec: VmSpec = read_json(&spec)?;
            let placement = load_placement(&placement, &spec)?;
            let definition = SpecConverter::new().convert(&spec, &placement)?;
            println!("{}", definition.render());
            Ok(())
        }
        Args::Run { config, spec, placement, simulate, log_level } => {
            let log = build_logger(log_level);

            let config = match config {
                Some(path) => launcher_config_toml::parse(&path)
                    .with_context(|| format!("loading {}", path.display()))?,
                None => Config::default(),
            };
            let spec: VmSpec = read_json(&spec)?;
            let placement = load_placement(&placement, &spec)?;
            info!(log, "starting launcher";
                  "vm" => &spec.name,
                  "socket" => %config.connection.socket_path.display(),
                  "simulate" => simulate);

            let runtime = tokio::runtime::Builder::new_multi_thread()
                .enable_all()
                .thread_name("virt-launcher")
                .build()?;
            runtime.block_on(run_launcher(
                config, spec, placement, simulate, log,
            ))
        }
    }
}
