//! nanolink - serial debug target discovery
//!
//! Finds debug targets on the host's serial ports, validates them, and keeps
//! one connection open across hot-plug, suspend/resume and permission
//! changes. Host signals are typed on stdin; see `help` once running.

mod console;
mod settings;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use console::{ConsoleCommand, HELP};
use nano_detect::{ping_port, DeviceEnumerator, SerialPortEnumerator, SerialPortOpener};
use nano_link::{DiscoveryHandle, LinkEvent};
use nano_protocol::{DeviceIdentity, Selector};
use nano_sim::VirtualPortBus;
use settings::Settings;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Discover serial debug targets and keep a connection to one of them
#[derive(Parser)]
#[command(name = "nanolink")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to a settings file (defaults to the XDG config location)
    #[arg(long = "config", global = true, value_name = "PATH", env = "NANOLINK_CONFIG")]
    config_path: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Run discovery interactively (default)
    Run(RunArgs),
    /// List the serial endpoints the platform reports
    Ports {
        /// Selector to enumerate
        #[arg(short, long, default_value = "any")]
        selector: String,
    },
    /// Ping one port and report whether it answers like a debug target
    Probe {
        /// Port path, e.g. /dev/ttyACM0 or COM3
        port: String,
    },
}

#[derive(Args, Default)]
struct RunArgs {
    /// Selector to watch; repeat for several watchers
    #[arg(short = 's', long = "selector", value_name = "SELECTOR")]
    selectors: Vec<String>,

    /// Watcher poll interval in milliseconds
    #[arg(long, value_name = "MS", env = "NANOLINK_POLL_MS")]
    poll_ms: Option<u64>,

    /// Do not reopen the last device when it reappears
    #[arg(long)]
    no_auto_reconnect: bool,

    /// Use the virtual port bus instead of real serial ports
    #[arg(long)]
    simulate: bool,

    /// Write the effective settings back to the settings file
    #[arg(long)]
    save: bool,
}

impl RunArgs {
    fn apply(&self, settings: &mut Settings) {
        if !self.selectors.is_empty() {
            settings.discovery.selectors = self.selectors.iter().map(Selector::new).collect();
        }
        if let Some(ms) = self.poll_ms {
            settings.discovery.poll_interval_ms = ms;
        }
        if self.no_auto_reconnect {
            settings.discovery.auto_reconnect = false;
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                "nanolink=info,nano_protocol=info,nano_detect=info,nano_link=info,nano_sim=info"
                    .into()
            }),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();
    let mut settings = match &cli.config_path {
        Some(path) => Settings::load_from(path)?,
        None => Settings::load(),
    };

    match cli.command.unwrap_or(Command::Run(RunArgs::default())) {
        Command::Run(args) => {
            args.apply(&mut settings);
            if args.save {
                let path = settings.save(cli.config_path.as_deref())?;
                info!("Settings saved to {}", path.display());
            }
            run(settings, args.simulate).await
        }
        Command::Ports { selector } => list_ports(&settings, &selector),
        Command::Probe { port } => probe(&port).await,
    }
}

fn list_ports(settings: &Settings, selector: &str) -> Result<()> {
    let denylist = settings.discovery.denylist();
    let ports = SerialPortEnumerator::new()
        .enumerate(&Selector::new(selector))
        .context("Failed to enumerate serial ports")?;

    if ports.is_empty() {
        println!("no serial ports match '{}'", selector);
    }
    for identity in ports {
        let note = if denylist.is_denied(&identity) {
            "denylisted".to_string()
        } else if let Some(marker) = identity.target_marker() {
            format!("target {}", marker)
        } else {
            String::new()
        };
        println!(
            "{:<20} {:<24} {:<12} {}",
            identity.port_path(),
            identity.display_name(),
            note,
            identity.id()
        );
    }
    Ok(())
}

async fn probe(port: &str) -> Result<()> {
    let known = SerialPortEnumerator::new()
        .enumerate(&Selector::new("any"))
        .unwrap_or_default()
        .into_iter()
        .find(|identity| identity.port_path() == port);
    let identity = match known {
        Some(identity) => identity,
        None => DeviceIdentity::new(format!("SERIAL#{}", port), port, port, Selector::new("any"))?,
    };

    match ping_port(&identity).await {
        Ok(()) => {
            println!("{} answers ping", identity);
            Ok(())
        }
        Err(e) => bail!("{} is not a debug target: {}", identity, e),
    }
}

async fn run(settings: Settings, simulate: bool) -> Result<()> {
    let bus = simulate.then(|| Arc::new(VirtualPortBus::new()));
    let simulated_ports = if settings.simulated_ports.is_empty() {
        Settings::demo_ports()
    } else {
        settings.simulated_ports.clone()
    };

    let handle = match &bus {
        Some(bus) => {
            for port in &simulated_ports {
                bus.plug(port.clone())
                    .with_context(|| format!("Failed to plug virtual port {}", port.port))?;
            }
            info!("Simulating {} virtual port(s)", simulated_ports.len());
            DiscoveryHandle::spawn(&settings.discovery, bus.clone(), bus.clone())
        }
        None => DiscoveryHandle::spawn(
            &settings.discovery,
            Arc::new(SerialPortEnumerator::new()),
            Arc::new(SerialPortOpener::new()),
        ),
    };

    let mut events = handle.subscribe();
    handle.start().await?;
    println!("type 'help' for commands");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            event = events.recv() => match event {
                Ok(event) => print_event(&event),
                Err(RecvError::Lagged(n)) => warn!("Missed {} event(s)", n),
                Err(RecvError::Closed) => break,
            },

            line = lines.next_line() => {
                let Some(line) = line.context("Failed to read stdin")? else { break; };
                if line.trim().is_empty() {
                    continue;
                }
                match console::parse(&line) {
                    Ok(ConsoleCommand::Quit) => break,
                    Ok(command) => {
                        if let Err(e) = execute(command, &handle, bus.as_deref(), &simulated_ports).await {
                            eprintln!("{:#}", e);
                        }
                    }
                    Err(e) => eprintln!("{}", e),
                }
            }

            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted");
                break;
            }
        }
    }

    handle.shutdown().await?;
    Ok(())
}

fn print_event(event: &LinkEvent) {
    println!("{}", console::format_event(event));
}

async fn execute(
    command: ConsoleCommand,
    handle: &DiscoveryHandle,
    bus: Option<&VirtualPortBus>,
    simulated_ports: &[nano_sim::VirtualPortConfig],
) -> Result<()> {
    match command {
        ConsoleCommand::Start => handle.start().await?,
        ConsoleCommand::Stop => handle.stop().await?,
        ConsoleCommand::Suspend => handle.suspend().await?,
        ConsoleCommand::Resume => handle.resume().await?,
        ConsoleCommand::Access(status) => handle.access_changed(status).await?,
        ConsoleCommand::AutoReconnect(enabled) => handle.set_auto_reconnect(enabled).await?,
        ConsoleCommand::Candidates => {
            let candidates = handle.candidates().await?;
            if candidates.is_empty() {
                println!("no candidates");
            }
            let bound = handle.connection().current_identity().await;
            for candidate in candidates {
                let marker = match &bound {
                    Some(identity) if identity.id() == candidate.identity.id() => "*",
                    _ => " ",
                };
                println!(
                    "{} {:<10} {:<20} {}",
                    marker,
                    candidate.state,
                    candidate.identity.port_path(),
                    candidate.description
                );
            }
        }
        ConsoleCommand::Watchers => {
            for watcher in handle.watchers().await? {
                println!("{:?} {} {:?}", watcher.id, watcher.selector, watcher.state);
            }
        }
        ConsoleCommand::Plug(port) => {
            let bus = bus.context("plug needs --simulate")?;
            let config = simulated_ports
                .iter()
                .find(|p| p.port == port)
                .with_context(|| format!("no virtual port {} configured", port))?;
            bus.plug(config.clone())?;
        }
        ConsoleCommand::Unplug(port) => {
            bus.context("unplug needs --simulate")?.unplug(&port)?;
        }
        ConsoleCommand::Help => println!("{}", HELP),
        ConsoleCommand::Quit => {}
    }
    Ok(())
}
