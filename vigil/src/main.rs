//! Vigil - CPU hotplug and idle governor daemon for DaemonOS
//!
//! Provides:
//! - Dynamic CPU hotplug driven by load, display and suspend state
//! - cpuidle LPM gating mirrored into the sysfs state switches
//! - Idle profiling sessions
//! - Control over a Unix socket (see `vigilctl`)

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;
use vigil::config::{VigilConfig, DEFAULT_CONFIG_PATH};
use vigil::decision::Tunables;
use vigil::ipc::{ClusterRequest, DaemonStatus, IpcHandler, IpcServer};
use vigil::platform::{FreqPolicy, IdleStateControl, Platform};
use vigil::profiler::ProfileReport;
use vigil::{
    CpuidleGate, Governor, GovernorOptions, IdleProfiler, IdleState, Knob, NotifierChain,
    PowerEvent, ProfileMode, SimPlatform, SysfsPlatform, Topology,
};

/// Vigil - CPU hotplug and idle governor
#[derive(Parser, Debug)]
#[command(name = "vigild", version, about)]
struct Args {
    /// Configuration file
    #[arg(short, long, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Socket path (overrides the configuration)
    #[arg(short, long)]
    socket: Option<PathBuf>,

    /// Debug mode
    #[arg(short, long)]
    debug: bool,

    /// Drive a simulated SoC instead of sysfs
    #[arg(long)]
    simulate: bool,
}

/// Daemon state
struct VigilState {
    governor: Arc<Governor>,
    gate: Arc<CpuidleGate>,
    profiler: Arc<IdleProfiler>,
    notifier: Arc<NotifierChain>,
    default_period: u32,
}

impl IpcHandler for VigilState {
    fn get_status(&self) -> DaemonStatus {
        DaemonStatus {
            version: env!("CARGO_PKG_VERSION").to_string(),
            governor: self.governor.status(),
            lpm_allowed: self.gate.lpm_allowed(),
            profiling: self.profiler.is_active(),
        }
    }

    fn enable(&self) {
        self.governor.enable();
    }

    fn disable(&self) {
        self.governor.disable();
    }

    fn set_knob(&self, knob: Knob, value: &str) -> Result<()> {
        Ok(self.governor.store_knob(knob, value)?)
    }

    fn get_knobs(&self) -> Tunables {
        self.governor.tunables()
    }

    fn power_event(&self, event: PowerEvent) {
        self.notifier.notify(event);
    }

    fn cluster(&self, request: ClusterRequest) -> Result<()> {
        let result = match request {
            ClusterRequest::Cluster1Out => self.governor.cluster1_out(),
            ClusterRequest::Cluster1In => self.governor.cluster1_in(),
            ClusterRequest::Cluster0OneIn => self.governor.cluster0_one_in(),
            ClusterRequest::Cluster0OneOut => self.governor.cluster0_one_out(),
        };
        Ok(result?)
    }

    fn set_idle_state(&self, state: IdleState, disabled: bool) -> Result<()> {
        self.gate.set_disabled(state, disabled)?;
        self.governor.refresh_idle_limits();
        Ok(())
    }

    fn start_profile(&self, period: Option<u32>) -> Result<u32> {
        let period = period.unwrap_or(self.default_period);
        self.profiler.start_session(period)?;
        Ok(period)
    }

    fn stop_profile(&self) -> bool {
        self.profiler.stop_session()
    }

    fn get_profile(&self, mode: u8) -> Result<ProfileReport> {
        let mode = ProfileMode::try_from(mode)?;
        Ok(self.profiler.report(mode))
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let config = VigilConfig::load(&args.config)?;

    let log_level = if args.debug {
        "debug"
    } else {
        config.daemon.log_level.as_str()
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level)),
        )
        .init();

    info!("Vigil v{} starting", env!("CARGO_PKG_VERSION"));

    let model = config.topology;
    let nr_cpus = model.nr_cpus();
    let mut sim = None;
    let (platform, idle_control): (Arc<dyn Platform>, Arc<dyn IdleStateControl>) =
        if args.simulate {
            warn!("Running against a simulated SoC");
            let platform = Arc::new(SimPlatform::new(
                &model,
                FreqPolicy {
                    min: 400_000,
                    max: 1_300_000,
                    cur: 400_000,
                },
            ));
            sim = Some(Arc::clone(&platform));
            (platform.clone() as Arc<dyn Platform>, platform as Arc<dyn IdleStateControl>)
        } else {
            let platform = Arc::new(SysfsPlatform::new(
                &config.daemon.cpu_root,
                &config.daemon.qos_dir,
                nr_cpus,
            ));
            (platform.clone() as Arc<dyn Platform>, platform as Arc<dyn IdleStateControl>)
        };

    let topology = Arc::new(Topology::from_online(model, |cpu| platform.cpu_online(cpu)));
    let governor = Governor::new(
        Arc::clone(&platform),
        Arc::clone(&topology),
        GovernorOptions::from(&config.governor),
        tokio::runtime::Handle::current(),
    );

    let profiler = Arc::new(IdleProfiler::new(nr_cpus));
    let gate = Arc::new(
        CpuidleGate::new(
            Arc::clone(&topology),
            governor.display_flag(),
            config.idle.c2_supported,
            config.idle.lpm_supported,
        )
        .with_profiler(Arc::clone(&profiler)),
    );
    let governor = if config.idle.apply_limits {
        governor.with_idle_limits(Arc::clone(&gate), idle_control)
    } else {
        governor
    };

    let notifier = Arc::new(NotifierChain::new());
    let governor = governor
        .start(Arc::clone(&notifier))
        .context("starting hotplug governor")?;

    if let Some(sim) = sim {
        spawn_sim_idle(Arc::clone(&gate), sim, Arc::clone(&topology));
    }

    let state = Arc::new(VigilState {
        governor: Arc::clone(&governor),
        gate,
        profiler,
        notifier: Arc::clone(&notifier),
        default_period: config.profiler.default_period_secs,
    });

    let socket_path = match &args.socket {
        Some(path) => path.to_string_lossy().to_string(),
        None => config.daemon.socket_path.clone(),
    };
    let server = IpcServer::new(socket_path.clone(), state);

    info!("Vigil ready");
    tokio::select! {
        result = server.run() => {
            if let Err(e) = result {
                error!("IPC server failed: {}", e);
            }
        }
        result = shutdown_signal() => {
            result?;
        }
    }

    // Joining governor tasks blocks
    tokio::task::spawn_blocking(move || {
        notifier.notify(PowerEvent::Reboot);
        governor.shutdown();
    })
    .await?;
    let _ = std::fs::remove_file(&socket_path);

    info!("Vigil stopped");
    Ok(())
}

async fn shutdown_signal() -> Result<()> {
    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;

    tokio::select! {
        _ = sigterm.recv() => info!("Received SIGTERM, shutting down"),
        result = tokio::signal::ctrl_c() => {
            result?;
            info!("Received SIGINT, shutting down");
        }
    }
    Ok(())
}

/// Idle and load traffic for `--simulate`, so status and profiles move
fn spawn_sim_idle(gate: Arc<CpuidleGate>, sim: Arc<SimPlatform>, topology: Arc<Topology>) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_millis(10));
        loop {
            ticker.tick().await;
            for cpu in topology.online_cpus() {
                sim.advance(cpu, 10_000, 9_000);
                gate.enter(cpu, IdleState::Lpm, sim.as_ref());
            }
        }
    });
}
