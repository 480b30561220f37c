// Duolink Linux host: one paired messenger over an emulated radio (UDP), chatting on stdin/stdout.

mod commands;
mod config;
mod crypto;
mod udp_link;
mod udp_radio;

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context};
use duo_core::{
    ChangeFlags, Clock, EspNowMessenger, Heartbeat, LoRaMessenger, Message, MessageHistory,
    Messenger, RadioConfig, RadioType, Sender, Settings, SystemClock, Transport,
};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, watch};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use commands::Command;
use udp_link::UdpPeerLink;
use udp_radio::UdpDatagramManager;

const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Main loop period between receive polls.
const LOOP_PERIOD: Duration = Duration::from_millis(5);

type HostTransport = Transport<UdpPeerLink, SystemClock, UdpDatagramManager>;

enum RadioEvent {
    Payload(Vec<u8>),
    Ping,
}

fn main() -> anyhow::Result<()> {
    let mut config_path: Option<PathBuf> = None;
    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--version" | "-V" => {
                println!("duo-linux {}", VERSION);
                return Ok(());
            }
            "--config" | "-c" => {
                let path = args.next().context("--config needs a path")?;
                config_path = Some(PathBuf::from(path));
            }
            other => bail!("unknown argument {other:?}"),
        }
    }

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let cfg = config::load(config_path)?;
    let rt = tokio::runtime::Runtime::new()?;
    let socket = rt
        .block_on(UdpSocket::bind(cfg.bind))
        .with_context(|| format!("binding {}", cfg.bind))?;
    info!(bind = %cfg.bind, peer = %cfg.peer, radio = ?cfg.settings.radio, "starting");

    let clock = SystemClock::new();
    let mut settings = cfg.settings.clone();
    let mut messenger: HostTransport = match settings.radio {
        RadioType::EspNow => {
            let link = UdpPeerLink::new(rt.handle().clone(), socket, cfg.peer, cfg.my_mac);
            Transport::EspNow(EspNowMessenger::begin(
                link,
                clock,
                settings.other_mac_address(),
                settings.primary_key(),
                settings.local_key(),
            )?)
        }
        RadioType::Lora => {
            let manager = UdpDatagramManager::new(rt.handle().clone(), socket, cfg.peer);
            let mut m = LoRaMessenger::new(
                manager,
                settings.my_lora_address(),
                settings.other_lora_address(),
            );
            let radio = RadioConfig {
                frequency_mhz: cfg.lora_frequency_mhz,
                ..RadioConfig::default()
            };
            m.begin(settings.primary_key(), &radio)?;
            Transport::Lora(m)
        }
    };

    let (events_tx, mut events_rx) = mpsc::unbounded_channel();
    let payload_tx = events_tx.clone();
    messenger.set_payload_callback(Box::new(move |payload| {
        let _ = payload_tx.send(RadioEvent::Payload(payload.to_vec()));
    }));
    messenger.set_ping_callback(Box::new(move || {
        let _ = events_tx.send(RadioEvent::Ping);
    }));

    let (lines_tx, mut lines_rx) = mpsc::unbounded_channel::<String>();
    rt.spawn(async move {
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            if lines_tx.send(line).is_err() {
                break;
            }
        }
    });

    let (stop_tx, stop_rx) = watch::channel(false);
    rt.spawn(async move {
        if let Err(e) = shutdown_signal().await {
            warn!(error = %e, "signal handler failed");
        }
        let _ = stop_tx.send(true);
    });

    let mut history = MessageHistory::new();
    let mut heartbeat = Heartbeat::new(clock.now_ms());
    let mut peer_seen = false;
    println!("duo-linux {VERSION} ({:?}); type a message, or /help", settings.radio);

    loop {
        if *stop_rx.borrow() {
            break;
        }

        messenger.update_rx();
        while let Ok(event) = events_rx.try_recv() {
            match event {
                RadioEvent::Payload(bytes) => {
                    let msg = Message::from_payload(Sender::Them, &bytes);
                    println!("them> {}", msg.text());
                    history.add_message(Sender::Them, msg.text());
                }
                RadioEvent::Ping => heartbeat.on_ping_received(clock.now_ms()),
            }
        }

        let now = clock.now_ms();
        if heartbeat.poll(now) {
            messenger.ping();
        }
        let seen = heartbeat.peer_recently_seen(now);
        if seen && !peer_seen {
            println!("* ping!");
        }
        peer_seen = seen;

        match lines_rx.try_recv() {
            Ok(line) => match commands::parse(&line) {
                Ok(Some(Command::Quit)) => break,
                Ok(Some(cmd)) => run_command(cmd, &mut messenger, &mut settings, &mut history),
                Ok(None) => {}
                Err(e) => println!("! {e}"),
            },
            Err(mpsc::error::TryRecvError::Empty) => {}
            Err(mpsc::error::TryRecvError::Disconnected) => break,
        }

        std::thread::sleep(LOOP_PERIOD);
    }

    info!("shutting down");
    drop(messenger);
    rt.shutdown_background();
    Ok(())
}

fn run_command(
    cmd: Command,
    messenger: &mut impl Messenger,
    settings: &mut Settings,
    history: &mut MessageHistory,
) {
    match cmd {
        Command::Send(text) => {
            let msg = Message::new(Sender::Me, &text);
            match messenger.tx_wait(&msg.to_payload()) {
                Ok(()) => {
                    history.add_message(Sender::Me, msg.text());
                    println!("me> {}", msg.text());
                }
                Err(e) => println!("! not delivered: {e}"),
            }
        }
        Command::Set(edit) => {
            let next = match commands::apply(settings, &edit) {
                Ok(next) => next,
                Err(e) => {
                    println!("! {e}");
                    return;
                }
            };
            let changes = ChangeFlags::between(settings, &next);
            *settings = next;
            if changes.is_empty() {
                println!("* nothing to apply");
                return;
            }
            match messenger.settings_changed(settings, changes) {
                Ok(()) => println!("* settings applied"),
                Err(e) => {
                    for failure in &e.failures {
                        warn!(step = ?failure.step, error = %failure.error, "settings step failed");
                    }
                    println!("! {e}");
                }
            }
        }
        Command::History => {
            for msg in history.iter() {
                let who = match msg.sender() {
                    Sender::Me => "me",
                    Sender::Them => "them",
                };
                println!("{who:>4}: {}", msg.text());
            }
        }
        Command::Help => println!("{}", commands::HELP),
        Command::Quit => {}
    }
}

/// Wait for Ctrl+C or SIGTERM (Unix).
async fn shutdown_signal() -> std::io::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate())?;
        tokio::select! {
            r = tokio::signal::ctrl_c() => r?,
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
    }
    Ok(())
}
