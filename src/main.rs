use anyhow::{anyhow, bail, Context, Result};
use ride_remote_control::domain::keymap;
use ride_remote_control::domain::models::{
    AppEvent, DeviceId, DiscoveredDevice, LogicalButton, TransportAddress, TransportKind,
};
use ride_remote_control::domain::registry::DeviceRegistry;
use ride_remote_control::infrastructure::dispatcher::ConsoleDispatcher;
use ride_remote_control::infrastructure::logging::init_logger;
use ride_remote_control::infrastructure::storage::JsonFileRegistry;
use ride_remote_control::infrastructure::transport::connection::ConnectionConfig;
use ride_remote_control::infrastructure::transport::loopback::LoopbackTransport;
use ride_remote_control::infrastructure::transport::{RemoteService, Transport};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tracing::{error, info};

const HELP: &str = "\
commands:
  ride start|stop            signal ride state
  press ant|ble <button>     left/right/up or a raw code (36, 0xEA)
  repeat ant|ble             retransmit the last payload
  drop ant|ble               kill the radio link
  scan ant|ble               start discovery (a demo remote answers)
  stopscan ant|ble           stop discovery and disconnect
  pair ant|ble <n>           pair the n-th discovered remote
  activate <id> | remove <id>
  learn <id> | learn stop
  status | help | quit";

enum ConsoleCommand {
    Ride(bool),
    Press(TransportKind, u16),
    Repeat(TransportKind),
    DropLink(TransportKind),
    Scan(TransportKind),
    StopScan(TransportKind),
    Pair(TransportKind, usize),
    Activate(DeviceId),
    Remove(DeviceId),
    Learn(Option<DeviceId>),
    Status,
    Help,
    Quit,
}

fn parse_kind(word: Option<&str>) -> Result<TransportKind> {
    match word.map(str::to_lowercase).as_deref() {
        Some("ant") => Ok(TransportKind::Ant),
        Some("ble") => Ok(TransportKind::Ble),
        _ => bail!("expected 'ant' or 'ble'"),
    }
}

fn parse_code(kind: TransportKind, word: Option<&str>) -> Result<u16> {
    let word = word.ok_or_else(|| anyhow!("missing button"))?;
    let button = match word.to_lowercase().as_str() {
        "left" => Some(LogicalButton::Left),
        "right" => Some(LogicalButton::Right),
        "up" => Some(LogicalButton::Up),
        _ => None,
    };
    if let Some(button) = button {
        return Ok(keymap::raw_command(kind, button).code);
    }

    let parsed = match word.strip_prefix("0x").or_else(|| word.strip_prefix("0X")) {
        Some(hex) => u16::from_str_radix(hex, 16),
        None => word.parse::<u16>(),
    };
    parsed.with_context(|| format!("invalid button code '{}'", word))
}

fn parse_id(word: Option<&str>) -> Result<DeviceId> {
    word.map(|id| DeviceId(id.to_string()))
        .ok_or_else(|| anyhow!("missing device id (see 'status')"))
}

impl ConsoleCommand {
    fn parse(line: &str) -> Result<Option<Self>> {
        let mut words = line.split_whitespace();
        let Some(verb) = words.next() else {
            return Ok(None);
        };

        let command = match verb.to_lowercase().as_str() {
            "ride" => match words.next() {
                Some("start") => Self::Ride(true),
                Some("stop") => Self::Ride(false),
                _ => bail!("usage: ride start|stop"),
            },
            "press" => {
                let kind = parse_kind(words.next())?;
                Self::Press(kind, parse_code(kind, words.next())?)
            }
            "repeat" => Self::Repeat(parse_kind(words.next())?),
            "drop" => Self::DropLink(parse_kind(words.next())?),
            "scan" => Self::Scan(parse_kind(words.next())?),
            "stopscan" => Self::StopScan(parse_kind(words.next())?),
            "pair" => {
                let kind = parse_kind(words.next())?;
                let index = words
                    .next()
                    .ok_or_else(|| anyhow!("usage: pair ant|ble <n>"))?
                    .parse::<usize>()
                    .context("pair index must be a number")?;
                Self::Pair(kind, index)
            }
            "activate" => Self::Activate(parse_id(words.next())?),
            "remove" => Self::Remove(parse_id(words.next())?),
            "learn" => match words.next() {
                Some("stop") => Self::Learn(None),
                Some(id) => Self::Learn(Some(DeviceId(id.to_string()))),
                None => bail!("usage: learn <id>|stop"),
            },
            "status" => Self::Status,
            "help" => Self::Help,
            "quit" | "exit" => Self::Quit,
            other => bail!("unknown command '{}' (try 'help')", other),
        };
        Ok(Some(command))
    }
}

struct Console {
    service: RemoteService,
    registry: Arc<JsonFileRegistry>,
    ant: Arc<LoopbackTransport>,
    ble: Arc<LoopbackTransport>,
}

impl Console {
    fn loopback(&self, kind: TransportKind) -> &LoopbackTransport {
        match kind {
            TransportKind::Ant => self.ant.as_ref(),
            TransportKind::Ble => self.ble.as_ref(),
        }
    }

    async fn run(&mut self, command: ConsoleCommand) -> Result<()> {
        match command {
            ConsoleCommand::Ride(riding) => self.service.set_riding(riding),
            ConsoleCommand::Press(kind, code) => {
                if !self.loopback(kind).press(code) {
                    println!("{} has no open session", kind);
                }
            }
            ConsoleCommand::Repeat(kind) => {
                if !self.loopback(kind).repeat_last() {
                    println!("nothing to repeat on {}", kind);
                }
            }
            ConsoleCommand::DropLink(kind) => {
                if !self.loopback(kind).drop_link() {
                    println!("{} has no open session", kind);
                }
            }
            ConsoleCommand::Scan(kind) => {
                self.service.start_scan(kind)?;
                // give the worker a moment to open discovery
                tokio::time::sleep(std::time::Duration::from_millis(50)).await;
                self.loopback(kind).announce(demo_remote(kind));
            }
            ConsoleCommand::StopScan(kind) => self.service.stop_scan(kind)?,
            ConsoleCommand::Pair(kind, index) => {
                let discovered = self.service.discovered(kind)?;
                let device = discovered
                    .get(index)
                    .ok_or_else(|| anyhow!("no discovered {} remote #{}", kind, index))?;
                let config = self
                    .service
                    .pair_discovered(kind, device.address.clone(), &device.name)
                    .await?;
                println!("{} remotes configured", config.devices.len());
            }
            ConsoleCommand::Activate(id) => {
                self.service.activate(&id).await?;
            }
            ConsoleCommand::Remove(id) => {
                self.service.remove_device(&id).await?;
            }
            ConsoleCommand::Learn(Some(id)) => self.service.start_learning(&id).await?,
            ConsoleCommand::Learn(None) => self.service.stop_learning(),
            ConsoleCommand::Status => self.print_status().await?,
            ConsoleCommand::Help => println!("{}", HELP),
            ConsoleCommand::Quit => {}
        }
        Ok(())
    }

    async fn print_status(&self) -> Result<()> {
        let config = self.registry.load().await?;
        let settings = self.service.settings();
        println!(
            "riding: {}  only while riding: {}  auto-reconnect: {}",
            self.service.is_riding(),
            settings.only_while_riding,
            settings.auto_reconnect
        );
        for kind in TransportKind::ALL {
            let state = self
                .service
                .connection_state(kind)
                .map_or("absent".to_string(), |s| s.to_string());
            match self.service.last_error(kind) {
                Some(e) => println!("{:>5}: {} (last error: {})", kind.to_string(), state, e),
                None => println!("{:>5}: {}", kind.to_string(), state),
            }
            if let Ok(discovered) = self.service.discovered(kind) {
                for (index, device) in discovered.iter().enumerate() {
                    println!("       #{} {} ({})", index, device.name, device.address);
                }
            }
        }
        for device in &config.devices {
            println!(
                "{} {} [{}] {:?}",
                if device.active { "*" } else { " " },
                device.id,
                device.name,
                device.mapping_mode
            );
        }
        if let Some(id) = self.service.learning() {
            println!("learning: {}", id);
        }
        Ok(())
    }
}

fn demo_remote(kind: TransportKind) -> DiscoveredDevice {
    let address = match kind {
        TransportKind::Ant => TransportAddress::Ant(4242),
        TransportKind::Ble => TransportAddress::Ble("F0:0D:00:00:42:42".to_string()),
    };
    DiscoveredDevice {
        address,
        name: format!("Demo {} remote", kind),
        signal_strength: Some(-58),
    }
}

fn print_event(event: &AppEvent) {
    match event {
        AppEvent::ConnectionStatus { transport, state } => println!("[{}] {}", transport, state),
        AppEvent::DeviceFound { transport, device } => {
            println!("[{}] found {} ({})", transport, device.name, device.address)
        }
        AppEvent::Routed { event, outcome } => {
            println!("{} {:?} -> {:?}", event.command, event.press, outcome)
        }
        AppEvent::LogMessage(msg) => println!("{:?}: {}", msg.severity, msg.message),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let registry = match std::env::args().nth(1) {
        Some(path) => JsonFileRegistry::with_path(path),
        None => JsonFileRegistry::new()?,
    };
    let stored = JsonFileRegistry::load_blocking(registry.path());

    let _logging_guard = init_logger(&stored.log_settings)
        .map_err(|e| eprintln!("Failed to initialize logging: {}", e))
        .ok();
    info!("Starting remote console with {}", registry.path().display());

    let registry = Arc::new(registry);
    let ant = Arc::new(LoopbackTransport::new(TransportKind::Ant));
    let ble = Arc::new(LoopbackTransport::new(TransportKind::Ble));
    let transports: Vec<Arc<dyn Transport>> = vec![ant.clone(), ble.clone()];

    let (event_tx, mut event_rx) = mpsc::unbounded_channel();
    let dispatcher = Arc::new(ConsoleDispatcher::new(event_tx.clone()));
    let mut service = RemoteService::new(
        registry.clone(),
        dispatcher,
        transports,
        ConnectionConfig::default(),
        event_tx,
    )
    .await?;
    service.start().await?;

    let mut console = Console {
        service,
        registry,
        ant,
        ble,
    };
    println!("{}", HELP);

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line? else { break };
                match ConsoleCommand::parse(&line) {
                    Ok(None) => {}
                    Ok(Some(ConsoleCommand::Quit)) => break,
                    Ok(Some(command)) => {
                        if let Err(e) = console.run(command).await {
                            error!("Command failed: {}", e);
                            println!("error: {}", e);
                        }
                    }
                    Err(e) => println!("{}", e),
                }
            }
            Some(event) = event_rx.recv() => print_event(&event),
        }
    }

    console.service.shutdown().await;
    info!("Remote console stopped");
    Ok(())
}
