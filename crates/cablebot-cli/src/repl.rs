//! REPL – the operator console.
//!
//! Supported slash-commands:
//!   /status                          – mode, fault, telemetry and link state
//!   /mode <idle|setup|test|fault>    – change mode
//!   /clear                           – clear a latched fault
//!   /stop                            – soft stop
//!   /estop                           – emergency stop (latches a fault)
//!   /jog <forward|reverse> [rpm] [ms]
//!   /hallrun <forward|reverse> [ms]  – speeds follow the hall readings
//!   /move <direction> [rpm] [ms]     – forward, back, left, right, up, down
//!   /hall <winch> <value>            – set a simulated hall reading
//!   /help
//!   /quit | /exit

use colored::Colorize;
use std::io::{self, BufRead, Write};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use cablebot_link::TelemetryLink;
use cablebot_link::sim::SimBridge;
use cablebot_runtime::ControllerHandle;
use cablebot_types::{
    ControlError, ControllerStatus, Direction, HallRunParams, JogDirection, JogParams, Mode,
    TestMoveParams,
};
use tokio::runtime::Runtime;

use crate::config::MotionConfig;

/// Default speed and run time for console motions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Presets {
    pub jog_rpm: u16,
    pub jog: Duration,
    pub test_rpm: u16,
    pub test: Duration,
}

impl From<&MotionConfig> for Presets {
    fn from(m: &MotionConfig) -> Self {
        Self {
            jog_rpm: m.jog_rpm,
            jog: Duration::from_millis(m.jog_ms),
            test_rpm: m.test_rpm,
            test: Duration::from_millis(m.test_ms),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConsoleCommand {
    Help,
    Status,
    Mode(Mode),
    Clear,
    Stop,
    EStop,
    Jog(JogParams),
    HallRun(HallRunParams),
    Move(TestMoveParams),
    Hall { winch: u8, value: u16 },
    Quit,
}

/// Parse one console line.  Speed and duration fall back to `presets`.
pub fn parse_command(line: &str, presets: &Presets) -> Result<ConsoleCommand, String> {
    let mut words = line.split_whitespace();
    let Some(cmd) = words.next() else {
        return Err("empty command".to_string());
    };
    let args: Vec<&str> = words.collect();

    match cmd {
        "/help" => Ok(ConsoleCommand::Help),
        "/status" => Ok(ConsoleCommand::Status),
        "/clear" => Ok(ConsoleCommand::Clear),
        "/stop" => Ok(ConsoleCommand::Stop),
        "/estop" => Ok(ConsoleCommand::EStop),
        "/quit" | "/exit" => Ok(ConsoleCommand::Quit),
        "/mode" => {
            let mode = args.first().ok_or("usage: /mode <idle|setup|test|fault>")?;
            Ok(ConsoleCommand::Mode(mode.parse()?))
        }
        "/jog" => {
            let direction: JogDirection = args
                .first()
                .ok_or("usage: /jog <forward|reverse> [rpm] [ms]")?
                .parse()?;
            let (rpm, duration) = speed_and_time(&args[1..], presets.jog_rpm, presets.jog)?;
            Ok(ConsoleCommand::Jog(JogParams {
                direction,
                rpm,
                duration: Some(duration),
            }))
        }
        "/hallrun" => {
            let direction: JogDirection = args
                .first()
                .ok_or("usage: /hallrun <forward|reverse> [ms]")?
                .parse()?;
            // Without a time limit the run lasts until /stop.
            let duration = match args.get(1) {
                Some(v) => Some(Duration::from_millis(
                    v.parse()
                        .map_err(|_| format!("'{v}' is not a duration in ms"))?,
                )),
                None => None,
            };
            Ok(ConsoleCommand::HallRun(HallRunParams {
                direction,
                duration,
            }))
        }
        "/move" => {
            let direction: Direction = args
                .first()
                .ok_or("usage: /move <direction> [rpm] [ms]")?
                .parse()?;
            let (rpm, duration) = speed_and_time(&args[1..], presets.test_rpm, presets.test)?;
            Ok(ConsoleCommand::Move(TestMoveParams {
                direction,
                rpm,
                duration: Some(duration),
            }))
        }
        "/hall" => match args.as_slice() {
            [winch, value] => Ok(ConsoleCommand::Hall {
                winch: winch
                    .parse()
                    .map_err(|_| format!("'{winch}' is not a winch id"))?,
                value: value
                    .parse()
                    .map_err(|_| format!("'{value}' is not a hall value"))?,
            }),
            _ => Err("usage: /hall <winch> <value>".to_string()),
        },
        other => Err(format!("unknown command '{other}'")),
    }
}

fn speed_and_time(
    args: &[&str],
    rpm: u16,
    duration: Duration,
) -> Result<(u16, Duration), String> {
    let rpm = match args.first() {
        Some(v) => v.parse().map_err(|_| format!("'{v}' is not an rpm value"))?,
        None => rpm,
    };
    let duration = match args.get(1) {
        Some(v) => Duration::from_millis(
            v.parse()
                .map_err(|_| format!("'{v}' is not a duration in ms"))?,
        ),
        None => duration,
    };
    Ok((rpm, duration))
}

/// Everything the console operates on.
pub struct Console<'a> {
    pub runtime: &'a Runtime,
    pub handle: ControllerHandle,
    pub link: Arc<TelemetryLink>,
    pub presets: Presets,
    /// Present in `--simulate` runs.
    pub sim: Option<&'a SimBridge>,
}

/// Entry point for the interactive console.
///
/// `shutdown` is polled each iteration; when set the console exits.
pub fn run(console: &Console<'_>, shutdown: Arc<AtomicBool>) {
    let stdin = io::stdin();
    let mut stdout = io::stdout();

    loop {
        if shutdown.load(Ordering::SeqCst) {
            break;
        }

        let prompt = console.handle.subscribe_status().borrow().mode;
        print!("{} ", format!("cablebot[{prompt}]>").bold().cyan());
        stdout.flush().ok();

        let mut line = String::new();
        match stdin.lock().read_line(&mut line) {
            Ok(0) => break, // EOF
            Ok(_) => {}
            Err(e) => {
                eprintln!("{}: {}", "Read error".red(), e);
                break;
            }
        }

        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        match parse_command(line, &console.presets) {
            Ok(ConsoleCommand::Quit) => {
                println!("{}", "Stopping winches and exiting.".green());
                shutdown.store(true, Ordering::SeqCst);
                break;
            }
            Ok(cmd) => execute(console, cmd),
            Err(e) => println!(
                "{} {}. Type {} for available commands.",
                "Error:".red(),
                e.yellow(),
                "/help".bold()
            ),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Command handlers
// ─────────────────────────────────────────────────────────────────────────────

fn execute(console: &Console<'_>, cmd: ConsoleCommand) {
    let h = &console.handle;
    let rt = console.runtime;
    match cmd {
        ConsoleCommand::Help => cmd_help(),
        ConsoleCommand::Status => cmd_status(console),
        ConsoleCommand::Mode(mode) => report(&format!("mode → {mode}"), rt.block_on(h.set_mode(mode))),
        ConsoleCommand::Clear => report("fault cleared", rt.block_on(h.clear_fault())),
        ConsoleCommand::Stop => report("stopped", rt.block_on(h.stop())),
        ConsoleCommand::EStop => report("EMERGENCY STOP latched", rt.block_on(h.stop_all())),
        ConsoleCommand::Jog(p) => report(
            &format!("jog {:?} @ {} rpm", p.direction, p.rpm).to_lowercase(),
            rt.block_on(h.jog(p)),
        ),
        ConsoleCommand::HallRun(p) => report(
            &format!("hall run {:?}", p.direction).to_lowercase(),
            rt.block_on(h.hall_run(p)),
        ),
        ConsoleCommand::Move(p) => report(
            &format!("move {} @ {} rpm", p.direction, p.rpm),
            rt.block_on(h.test_move(p)),
        ),
        ConsoleCommand::Hall { winch, value } => match console.sim {
            Some(bridge) => {
                bridge.set_hall(winch, value);
                println!("  simulated hall {} → {}", winch, value.to_string().yellow());
            }
            None => println!("{}", "  /hall is only available with --simulate".yellow()),
        },
        ConsoleCommand::Quit => {}
    }
}

fn report(done: &str, result: Result<(), ControlError>) {
    match result {
        Ok(()) => println!("  {} {}", "✓".green().bold(), done),
        Err(ControlError::Rejected(r)) => println!("  {} {}", "✗ rejected:".red().bold(), r),
        Err(e) => println!("  {} {}", "✗".red().bold(), e),
    }
}

fn cmd_help() {
    println!();
    println!("{}", "Cablebot Commands".bold().underline());
    println!("  {}                        – controller and telemetry state", "/status".bold().cyan());
    println!("  {}   – change mode", "/mode <idle|setup|test|fault>".bold().cyan());
    println!("  {}                         – clear a latched fault", "/clear".bold().cyan());
    println!("  {}                          – soft stop", "/stop".bold().cyan());
    println!("  {}                         – emergency stop (latches a fault)", "/estop".bold().cyan());
    println!("  {} – setup-mode jog", "/jog <forward|reverse> [rpm] [ms]".bold().cyan());
    println!("  {}   – setup-mode run, speed from hall", "/hallrun <forward|reverse> [ms]".bold().cyan());
    println!("  {}      – test-mode move (forward/back/left/right/up/down)", "/move <dir> [rpm] [ms]".bold().cyan());
    println!("  {}          – set a simulated hall value", "/hall <winch> <value>".bold().cyan());
    println!("  {}                   – stop winches and exit", "/quit  /exit".bold().cyan());
    println!();
}

fn cmd_status(console: &Console<'_>) {
    let status = console.runtime.block_on(console.handle.get_status());
    let health = console.link.subscribe_health().borrow().clone();
    for line in format_status(&status) {
        println!("{line}");
    }
    let link = if health.connected {
        "connected".green()
    } else {
        "disconnected".red()
    };
    println!(
        "  {:<12} {} ({}, {} consecutive / {} total failures)",
        "Link",
        link,
        console.link.config().addr.dimmed(),
        health.consecutive_failures,
        health.total_failures
    );
    if let Some(e) = health.last_error {
        println!("  {:<12} {}", "Link error", e.dimmed());
    }
}

pub(crate) fn format_status(status: &ControllerStatus) -> Vec<String> {
    let mode = match status.mode {
        Mode::Fault => status.mode.to_string().red().bold().to_string(),
        _ => status.mode.to_string().green().to_string(),
    };
    let fault = match (status.fault, status.fault_since) {
        (Some(cause), Some(since)) => format!("{} since {}", cause, since.format("%H:%M:%S%.3f")),
        (Some(cause), None) => cause.to_string(),
        (None, _) => "none".to_string(),
    };
    let age = status
        .last_bundle_age_ms
        .map_or_else(|| "no data".to_string(), |ms| format!("{ms} ms"));
    let hall = if status.hall.is_empty() {
        "-".to_string()
    } else {
        status
            .hall
            .iter()
            .map(u16::to_string)
            .collect::<Vec<_>>()
            .join(" ")
    };

    let mut lines = vec![
        format!("  {:<12} {}", "Mode", mode),
        format!("  {:<12} {}", "Fault", fault),
        format!("  {:<12} {}", "Bundle age", age),
        format!("  {:<12} {}", "Hall", hall),
        format!(
            "  {:<12} {}",
            "Motion",
            status.motion.as_deref().unwrap_or("stopped")
        ),
    ];
    if let Some(e) = &status.last_driver_error {
        lines.push(format!("  {:<12} {}", "Driver error", e));
    }
    lines
}
