//! `cablebot-cli` – operator entry point for the winch robot.
//!
//! This binary:
//!
//! 1. Loads `~/.cablebot/config.toml` (or `$CABLEBOT_CONFIG`), falling back
//!    to built-in defaults, and validates it.
//! 2. Connects the telemetry link to the sensor bridge and starts polling.
//! 3. Opens the motor field bus, hands the driver layer to the motion
//!    controller and starts the control loop.
//! 4. Drops the operator into an **interactive console** (`/status`,
//!    `/mode`, `/jog`, `/move`, `/estop`, ...).
//! 5. Intercepts **Ctrl-C** to issue an emergency stop before exiting.
//!
//! With `--simulate` the bridge and the field bus are replaced by the
//! in-process doubles, so the whole stack runs without hardware.

mod config;
mod repl;

use colored::Colorize;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use tracing::{error, info, warn};

use cablebot_hal::sim::SimBus;
use cablebot_hal::{DriverLayer, FieldBus, RtuBus};
use cablebot_kernel::MotionController;
use cablebot_link::TelemetryLink;
use cablebot_link::sim::SimBridge;
use cablebot_runtime::{ControlLoop, ControllerHandle};
use cablebot_types::{ControllerStatus, DriverError};
use tokio::sync::watch;

use crate::config::{BusTransport, Config};

/// Command-line flags.
#[derive(Debug, Default, PartialEq, Eq)]
struct Options {
    simulate: bool,
    init_config: bool,
    help: bool,
}

impl Options {
    fn parse(args: impl IntoIterator<Item = String>) -> Result<Self, String> {
        let mut opts = Options::default();
        for arg in args {
            match arg.as_str() {
                "--simulate" | "-s" => opts.simulate = true,
                "--init-config" => opts.init_config = true,
                "--help" | "-h" => opts.help = true,
                other => return Err(format!("unknown argument '{other}'")),
            }
        }
        Ok(opts)
    }
}

fn main() {
    let opts = match Options::parse(std::env::args().skip(1)) {
        Ok(o) => o,
        Err(e) => {
            eprintln!("{}: {}", "Error".red(), e);
            print_usage();
            std::process::exit(2);
        }
    };
    if opts.help {
        print_usage();
        return;
    }

    // Before the tokio runtime exists: the OTLP exporter is synchronous.
    let _tracing = cablebot_runtime::init_tracing("cablebot");

    if opts.init_config {
        let path = config::config_path();
        match config::write_new(&Config::default(), &path) {
            Ok(()) => println!(
                "  {} Default config written to {}",
                "✓".green().bold(),
                path.display().to_string().bold()
            ),
            Err(e) => {
                println!("{}: {}", "Error writing config".red(), e);
                std::process::exit(1);
            }
        }
        return;
    }

    print_banner();

    let cfg = match config::load() {
        Ok(cfg) => {
            println!(
                "  Config: {}",
                config::config_path().display().to_string().bold()
            );
            cfg
        }
        Err(e) => {
            println!("{}: {}", "Config error".red(), e);
            std::process::exit(1);
        }
    };

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            error!(error = %e, "failed to start tokio runtime");
            std::process::exit(1);
        }
    };

    let sim = if opts.simulate {
        match runtime.block_on(SimBridge::start(&cfg.motion.winch_ids)) {
            Ok(bridge) => Some(bridge),
            Err(e) => {
                println!("{}: {}", "Failed to start simulated bridge".red(), e);
                std::process::exit(1);
            }
        }
    } else {
        None
    };

    let stack = match runtime.block_on(start_stack(&cfg, sim.as_ref())) {
        Ok(stack) => stack,
        Err(e) => {
            println!("{}: {}", "Startup failed".red(), e);
            std::process::exit(1);
        }
    };

    // ── Ctrl-C handler ────────────────────────────────────────────────────
    let shutdown = Arc::new(AtomicBool::new(false));
    let shutdown_clone = shutdown.clone();
    let ctrlc_handle = stack.handle.with_source("ctrl-c");
    if let Err(e) = ctrlc::set_handler(move || {
        println!();
        println!("{}", "⚠  Ctrl-C received – emergency stop …".yellow().bold());
        match ctrlc_handle.trigger_stop_all() {
            Ok(()) => {
                let mut status = ctrlc_handle.subscribe_status();
                if wait_for_fault(&mut status, Duration::from_secs(1)) {
                    println!("{}", "  ✓ Winches stopped, fault latched.".green());
                } else {
                    println!("{}", "  ✗ Stop not confirmed within 1 s.".red());
                }
            }
            Err(e) => println!("  {} {}", "✗ Could not queue emergency stop:".red(), e),
        }
        shutdown_clone.store(true, Ordering::SeqCst);
        std::process::exit(130);
    }) {
        warn!(error = %e, "Failed to install Ctrl-C handler; Ctrl-C will not stop the winches");
    }

    println!();
    println!("  Type {} for a list of commands.\n", "/help".bold().cyan());

    let console = repl::Console {
        runtime: &runtime,
        handle: stack.handle.with_source("console"),
        link: Arc::clone(&stack.link),
        presets: repl::Presets::from(&cfg.motion),
        sim: sim.as_ref(),
    };
    repl::run(&console, shutdown);

    // ── Shutdown ──────────────────────────────────────────────────────────
    if let Err(e) = runtime.block_on(stack.handle.stop()) {
        error!(error = %e, "final stop failed");
    }
    stack.poller.abort();
    info!("cablebot exiting");
    drop(console);
    drop(stack);
    runtime.shutdown_timeout(Duration::from_millis(500));
}

// ─────────────────────────────────────────────────────────────────────────────
// Wiring
// ─────────────────────────────────────────────────────────────────────────────

struct Stack {
    handle: ControllerHandle,
    link: Arc<TelemetryLink>,
    poller: tokio::task::JoinHandle<()>,
}

async fn start_stack(cfg: &Config, sim: Option<&SimBridge>) -> Result<Stack, String> {
    let mut link_config = cfg.link_config();
    if let Some(bridge) = sim {
        link_config.addr = bridge.addr().to_string();
    }

    let link = Arc::new(TelemetryLink::new(link_config));
    print!("  Sensor bridge at {} … ", link.config().addr.dimmed());
    match link.connect().await {
        Ok(()) => println!("{}", "online".green()),
        Err(e) => {
            // Not fatal: the poller keeps retrying and motion stays refused
            // until fresh telemetry arrives.
            println!("{} ({})", "offline".yellow(), e);
            warn!(error = %e, "sensor bridge unreachable at startup");
        }
    }
    let poller = link.spawn_poller(cfg.poll_interval());

    let bus = open_bus(cfg, sim.is_some()).await.map_err(|e| e.to_string())?;
    let driver = DriverLayer::new(bus, cfg.winch_targets());
    let controller = MotionController::new(driver, link.subscribe(), cfg.thresholds())
        .with_hall_profile(cfg.hall_profile());
    let (handle, _loop_task) = ControlLoop::spawn(
        controller,
        Some(link.subscribe_health()),
        cfg.poll_interval(),
    );
    info!(
        winches = ?cfg.motion.winch_ids,
        min_hall = cfg.motion.min_hall,
        stale_timeout_ms = cfg.motion.stale_timeout_ms,
        "controller ready"
    );

    Ok(Stack {
        handle,
        link,
        poller,
    })
}

async fn open_bus(cfg: &Config, simulate: bool) -> Result<Box<dyn FieldBus>, DriverError> {
    if simulate {
        println!("  Field bus: {}", "simulated".yellow());
        return Ok(Box::new(SimBus::new()));
    }
    let timeout = cfg.bus_timeout();
    match cfg.bus.transport {
        BusTransport::Tcp => {
            println!("  Field bus: {} {}", "tcp".bold(), cfg.bus.address.dimmed());
            Ok(Box::new(RtuBus::connect_tcp(&cfg.bus.address, timeout).await?))
        }
        BusTransport::Device => {
            println!("  Field bus: {} {}", "device".bold(), cfg.bus.device.dimmed());
            Ok(Box::new(RtuBus::open_device(&cfg.bus.device, timeout).await?))
        }
    }
}

/// Block the calling (non-runtime) thread until the controller reports a
/// fault or `timeout` elapses.
fn wait_for_fault(status: &mut watch::Receiver<ControllerStatus>, timeout: Duration) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if status.borrow_and_update().is_faulted() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    status.borrow().is_faulted()
}

// ─────────────────────────────────────────────────────────────────────────────
// Banner
// ─────────────────────────────────────────────────────────────────────────────

fn print_banner() {
    println!();
    println!("  {} {}",
        "Cablebot".bold().cyan(),
        format!("v{}", env!("CARGO_PKG_VERSION")).dimmed()
    );
    println!("  Cable-driven winch robot controller");
    println!();
}

fn print_usage() {
    println!("usage: cablebot [--simulate] [--init-config] [--help]");
    println!();
    println!("  -s, --simulate     run against an in-process bridge and field bus");
    println!("      --init-config  write a default config file and exit");
    println!("  -h, --help         show this message");
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn parses_flags() {
        assert_eq!(Options::parse(args(&[])).unwrap(), Options::default());
        let opts = Options::parse(args(&["--simulate", "-h"])).unwrap();
        assert!(opts.simulate && opts.help && !opts.init_config);
        assert!(Options::parse(args(&["--fly"])).is_err());
    }

    #[test]
    fn wait_for_fault_sees_latched_status() {
        let (tx, mut rx) = watch::channel(ControllerStatus::default());
        assert!(!wait_for_fault(&mut rx, Duration::from_millis(20)));
        tx.send_modify(|s| s.fault = Some(cablebot_types::FaultCause::ManualTrigger));
        assert!(wait_for_fault(&mut rx, Duration::from_millis(20)));
    }

    #[tokio::test]
    async fn simulated_stack_moves_and_stops() {
        let mut cfg = Config::default();
        cfg.motion.poll_interval_ms = 10;
        let bridge = SimBridge::start(&cfg.motion.winch_ids).await.unwrap();
        let stack = start_stack(&cfg, Some(&bridge)).await.unwrap();

        // Wait for the first fresh bundle.
        let mut feed = stack.link.subscribe();
        tokio::time::timeout(Duration::from_secs(2), feed.wait_for(|b| b.is_some()))
            .await
            .unwrap()
            .unwrap();

        let h = &stack.handle;
        h.set_mode(cablebot_types::Mode::Test).await.unwrap();
        h.test_move(cablebot_types::TestMoveParams {
            direction: cablebot_types::Direction::Up,
            rpm: 300,
            duration: None,
        })
        .await
        .unwrap();
        assert_eq!(h.get_status().await.motion.as_deref(), Some("test_up"));

        bridge.set_hall(2, 1000);
        let mut status = h.subscribe_status();
        tokio::time::timeout(Duration::from_secs(2), status.wait_for(|s| s.is_faulted()))
            .await
            .unwrap()
            .unwrap();
        let status = h.get_status().await;
        assert_eq!(
            status.fault,
            Some(cablebot_types::FaultCause::HallThresholdViolation)
        );
        assert!(status.motion.is_none());
        stack.poller.abort();
    }
}
