//! vigilctl - Vigil control utility

use anyhow::Result;
use clap::{Parser, Subcommand, ValueEnum};
use vigil::ipc::{ClusterRequest, IpcClient, IpcRequest};
use vigil::profiler::ProfileReport;
use vigil::{IdleState, Knob, PowerEvent};

/// Vigil control utility
#[derive(Parser)]
#[command(name = "vigilctl", version, about = "Control the Vigil hotplug governor")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Socket path
    #[arg(long, default_value = "/run/vigil/vigil.sock")]
    socket: String,
}

#[derive(Subcommand)]
enum Commands {
    /// Show governor status
    Status,

    /// Enable the governor (drops one disable reference)
    Enable,

    /// Disable the governor (takes one disable reference)
    Disable,

    /// Show runtime knobs
    Knobs,

    /// Set a runtime knob, e.g. `vigilctl set nr_running "3 4"`
    Set {
        /// Knob name (stay_threshold, delays, nr_running, ...)
        knob: String,

        /// Value in text form
        value: String,
    },

    /// Inject a power event
    Event {
        #[arg(value_enum)]
        event: EventArg,
    },

    /// Drive a cluster directly
    Cluster {
        #[arg(value_enum)]
        request: ClusterArg,
    },

    /// Enable or disable an idle state
    Idle {
        #[arg(value_enum)]
        state: IdleArg,

        /// Disable instead of enable
        #[arg(long)]
        disable: bool,
    },

    /// Idle profiling
    Profile {
        #[command(subcommand)]
        command: ProfileCommands,
    },
}

#[derive(Subcommand)]
enum ProfileCommands {
    /// Start a session
    Start {
        /// Period in seconds (0 runs until stopped)
        period: Option<u32>,
    },

    /// Stop the running session
    Stop,

    /// Show the report
    Show {
        /// 0 all, 1 c1, 2 c2, 3 lpm, 4 c2+lpm, 5 totals only
        #[arg(default_value_t = 0)]
        mode: u8,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum EventArg {
    Blank,
    Unblank,
    SuspendPrepare,
    PostResume,
    Reboot,
}

impl From<EventArg> for PowerEvent {
    fn from(arg: EventArg) -> Self {
        match arg {
            EventArg::Blank => PowerEvent::DisplayBlank,
            EventArg::Unblank => PowerEvent::DisplayUnblank,
            EventArg::SuspendPrepare => PowerEvent::SuspendPrepare,
            EventArg::PostResume => PowerEvent::PostResume,
            EventArg::Reboot => PowerEvent::Reboot,
        }
    }
}

#[derive(Clone, Copy, ValueEnum)]
enum ClusterArg {
    BigOut,
    BigIn,
    LittleOneIn,
    LittleOneOut,
}

impl From<ClusterArg> for ClusterRequest {
    fn from(arg: ClusterArg) -> Self {
        match arg {
            ClusterArg::BigOut => ClusterRequest::Cluster1Out,
            ClusterArg::BigIn => ClusterRequest::Cluster1In,
            ClusterArg::LittleOneIn => ClusterRequest::Cluster0OneIn,
            ClusterArg::LittleOneOut => ClusterRequest::Cluster0OneOut,
        }
    }
}

#[derive(Clone, Copy, ValueEnum)]
enum IdleArg {
    C2,
    Lpm,
}

impl From<IdleArg> for IdleState {
    fn from(arg: IdleArg) -> Self {
        match arg {
            IdleArg::C2 => IdleState::C2,
            IdleArg::Lpm => IdleState::Lpm,
        }
    }
}

fn yes_no(value: bool) -> &'static str {
    if value {
        "yes"
    } else {
        "no"
    }
}

fn print_profile(report: &ProfileReport) {
    println!("Idle Profile");
    println!("============");
    println!("Active:        {}", yes_no(report.active));
    if let Some(started) = report.started_at {
        println!("Started:       {}", started.format("%Y-%m-%d %H:%M:%S UTC"));
    }
    println!("Duration:      {} ms", report.duration_ms);

    for cpu in &report.cpus {
        println!();
        println!("cpu{}:", cpu.cpu);
        for s in &cpu.states {
            println!(
                "  {:<4} entries {:>8}  early {:>6}  residency {:>10} us ({:.1}%)",
                s.state.name(),
                s.entry_count,
                s.early_wakeup_count,
                s.residency_us,
                s.residency_percent
            );
        }
    }

    println!();
    println!("Totals:");
    for s in &report.totals {
        println!(
            "  {:<4} entries {:>8}  early {:>6}  residency {:>10} us ({:.1}%)",
            s.state.name(),
            s.entry_count,
            s.early_wakeup_count,
            s.residency_us,
            s.residency_percent
        );
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let client = IpcClient::new(&cli.socket);

    match cli.command {
        Commands::Status => {
            let status = client.get_status().await?;
            let gov = &status.governor;

            println!("Vigil Status");
            println!("============");
            println!("Version:       {}", status.version);
            println!(
                "Enabled:       {} (disable count {})",
                yes_no(gov.enabled),
                gov.disable_count
            );
            println!("Display on:    {}", yes_no(gov.lcd_on));
            println!("Low power:     {}", yes_no(gov.in_low_power_mode));
            println!("Suspended:     {}", yes_no(gov.suspend_prepared));
            println!("Forced:        {}", yes_no(gov.forced_hotplug));
            println!("Applied:       {}", gov.applied);
            if let Some(decided) = gov.last_decided {
                println!("Last decision: {}", decided);
            }
            println!(
                "Online CPUs:   {}",
                gov.online_cpus
                    .iter()
                    .map(|c| c.to_string())
                    .collect::<Vec<_>>()
                    .join(",")
            );
            println!("Big pinned:    {}", yes_no(gov.cluster1_hotplugged));
            println!(
                "Hysteresis:    low_stay {} nr_running {}",
                gov.hysteresis.low_stay, gov.hysteresis.nr_running_count
            );
            println!("Ticks:         {} ({} executions)", gov.ticks, gov.executions);
            println!("LPM allowed:   {}", yes_no(status.lpm_allowed));
            println!("Profiling:     {}", yes_no(status.profiling));
            if let Some(err) = &gov.last_error {
                println!("Last error:    {}", err);
            }
        }

        Commands::Enable => {
            client.call::<serde_json::Value>(IpcRequest::Enable).await?;
            println!("Enable requested");
        }

        Commands::Disable => {
            client.call::<serde_json::Value>(IpcRequest::Disable).await?;
            println!("Disable requested");
        }

        Commands::Knobs => {
            let t = client.get_knobs().await?;
            println!("Tunables");
            println!("========");
            println!("normal_min_freq:       {} kHz", t.normal_min_freq);
            println!("cluster1_busy_freq:    {} kHz", t.cluster1_busy_freq);
            println!("stay_threshold:        {}", t.stay_threshold);
            println!("delays:                {} {} ms", t.out_delay_ms, t.in_delay_ms);
            println!("nr_running:            {} {}", t.nr_running_threshold, t.nr_running_range);
            println!("run_queue_signal:      {:?}", t.run_queue_signal);
            println!("load_report_threshold: {}%", t.load_report_threshold);
            println!("one_core_in:           {}", yes_no(t.one_core_in_request));
        }

        Commands::Set { knob, value } => {
            let knob: Knob = knob.parse()?;
            client.set_knob(knob, &value).await?;
            println!("{} set to {}", knob, value);
        }

        Commands::Event { event } => {
            let event = PowerEvent::from(event);
            client
                .call::<serde_json::Value>(IpcRequest::Event { event })
                .await?;
            println!("Sent {}", event);
        }

        Commands::Cluster { request } => {
            let request = ClusterRequest::from(request);
            client
                .call::<serde_json::Value>(IpcRequest::Cluster { request })
                .await?;
            println!("Applied {:?}", request);
        }

        Commands::Idle { state, disable } => {
            let state = IdleState::from(state);
            client
                .call::<serde_json::Value>(IpcRequest::SetIdleState {
                    state,
                    disabled: disable,
                })
                .await?;
            println!("{} {}", state, if disable { "disabled" } else { "enabled" });
        }

        Commands::Profile { command } => match command {
            ProfileCommands::Start { period } => {
                let data: serde_json::Value =
                    client.call(IpcRequest::StartProfile { period }).await?;
                println!("Profiling started ({}s)", data["period"]);
            }

            ProfileCommands::Stop => {
                let data: serde_json::Value = client.call(IpcRequest::StopProfile).await?;
                if data["stopped"].as_bool().unwrap_or(false) {
                    println!("Profiling stopped");
                } else {
                    println!("No profiling session running");
                }
            }

            ProfileCommands::Show { mode } => {
                let report = client.get_profile(mode).await?;
                print_profile(&report);
            }
        },
    }

    Ok(())
}
