use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand, ValueEnum};
use gym_card_desk::{
    CardScanSession, Config, EntryChargeCoordinator, EntryType, GymBackend, HttpBackend,
    OutcomeFeed, ReaderConfig, ScanMode, SessionEvent, identify,
};
use log::{error, info, warn};
use rust_decimal::Decimal;

const RECONNECT_DELAY: Duration = Duration::from_secs(3);

#[derive(Parser, Debug)]
#[command(name = "gym-card-desk", version, about = "Gym front-desk card reader service")]
struct Cli {
    /// Defaults to `kiosk`.
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Unattended reader at the entrance, results pushed to the feed.
    Kiosk,
    /// Identify one card at the desk and charge it.
    Charge {
        entry: EntryArg,
        #[arg(default_value_t = 1, value_parser = clap::value_parser!(u32).range(1..))]
        count: u32,
        /// Unit price, manual entries only.
        price: Option<Decimal>,
    },
    /// Operator typed the card number instead of scanning it.
    Lookup { card_number: String },
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
enum EntryArg {
    Standard,
    Student,
    Manual,
}

impl From<EntryArg> for EntryType {
    fn from(arg: EntryArg) -> Self {
        match arg {
            EntryArg::Standard => EntryType::Standard,
            EntryArg::Student => EntryType::Student,
            EntryArg::Manual => EntryType::Manual,
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    dotenvy::dotenv().ok();
    env_logger::init();

    let command = Cli::parse().command.unwrap_or(Command::Kiosk);

    let config = match Config::from_env() {
        Ok(config) => config,
        Err(err) => {
            error!("Invalid configuration: {}", err);
            return ExitCode::FAILURE;
        }
    };

    let backend: Arc<dyn GymBackend> = match HttpBackend::new(&config.api) {
        Ok(backend) => Arc::new(backend),
        Err(err) => {
            error!("Could not build HTTP client: {}", err);
            return ExitCode::FAILURE;
        }
    };

    match command {
        Command::Lookup { card_number } => run_lookup(backend.as_ref(), &card_number).await,
        Command::Kiosk => {
            let Some(reader) = reader_config(&config) else {
                return ExitCode::FAILURE;
            };
            let feed = OutcomeFeed::new();
            tokio::spawn(feed.clone().serve(config.feed_addr));

            run_kiosk(&reader, backend, &feed).await;
            ExitCode::SUCCESS
        }
        Command::Charge {
            entry,
            count,
            price,
        } => run_charge(&config, backend, entry.into(), count, price).await,
    }
}

fn reader_config(config: &Config) -> Option<ReaderConfig> {
    match config.reader() {
        Ok(reader) => Some(reader.clone()),
        Err(err) => {
            error!("{}", err);
            None
        }
    }
}

async fn run_lookup(backend: &dyn GymBackend, card_number: &str) -> ExitCode {
    match identify(backend, card_number).await {
        Ok(identification) => {
            println!("{} -> {:?}", identification.uid, identification.outcome);
            ExitCode::SUCCESS
        }
        Err(err) => {
            error!("{}", err);
            ExitCode::FAILURE
        }
    }
}

/// Keeps a Multiple-mode session open, reconnecting whenever the reader drops.
/// Returns on Ctrl-C after releasing the reader.
async fn run_kiosk(reader: &ReaderConfig, backend: Arc<dyn GymBackend>, feed: &OutcomeFeed) {
    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);

    loop {
        match CardScanSession::open(reader, ScanMode::Multiple, Arc::clone(&backend)).await {
            Ok((mut session, mut events)) => {
                feed.set_reader_connected(true);
                loop {
                    tokio::select! {
                        event = events.next() => match event {
                            Some(event) => {
                                feed.publish(&event);
                                if let SessionEvent::ConnectionLost { .. } = event {
                                    break;
                                }
                            }
                            None => break,
                        },
                        _ = &mut shutdown => {
                            info!("Shutting down kiosk");
                            session.close().await;
                            return;
                        }
                    }
                }
            }
            Err(err) => {
                warn!("{}", err);
                feed.set_reader_connected(false);
            }
        }

        info!("Reconnecting to card reader in {:?}", RECONNECT_DELAY);
        tokio::select! {
            _ = tokio::time::sleep(RECONNECT_DELAY) => {}
            _ = &mut shutdown => return,
        }
    }
}

async fn run_charge(
    config: &Config,
    backend: Arc<dyn GymBackend>,
    entry: EntryType,
    count: u32,
    price: Option<Decimal>,
) -> ExitCode {
    let (mut session, mut events) =
        match CardScanSession::open_configured(config, ScanMode::Single, Arc::clone(&backend))
            .await
        {
            Ok(opened) => opened,
            Err(err) => {
                error!("{}", err);
                return ExitCode::FAILURE;
            }
        };

    println!("Place the card on the reader...");
    let mut coordinator = EntryChargeCoordinator::new(backend);
    let result = coordinator
        .charge_next_scan(&mut events, entry, count, price)
        .await;
    session.close().await;

    match result {
        Ok(receipt) => {
            println!(
                "Charged {} x {:?} ({:?})",
                receipt.request.count, receipt.request.entry_type, receipt.request.target
            );
            ExitCode::SUCCESS
        }
        Err(err) => {
            error!("{}", err);
            ExitCode::FAILURE
        }
    }
}
