//!   h02-rs:   TK102/H02 GPS tracker server
//!
//!  Prints every decoded track to stdout until Ctrl+C.

use tokio::sync::broadcast;
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use h02::config::Config;
use h02::{Event, EventHub, Server};

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config = Config::from_args();

    let subscriber = FmtSubscriber::builder()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber).ok();
    info!("h02-rs starting...");
    info!("Configuration: {:?}", config);

    let rt = tokio::runtime::Runtime::new()?;

    rt.block_on(run(config))
}

async fn run(config: Config) -> Result<(), Box<dyn std::error::Error>> {
    let hub = EventHub::new();
    let events = hub.subscribe();
    let server = Server::new(config.settings(), hub);

    if let Err(e) = server.start().await {
        error!("Cannot start server: {}", e);
        return Err(e.into());
    }

    let printer = tokio::spawn(print_events(events, config));

    tokio::signal::ctrl_c().await.ok();
    info!("Shutting down");

    server.stop().await?;
    printer.abort();
    Ok(())
}

async fn print_events(mut events: broadcast::Receiver<Event>, config: Config) {
    loop {
        let event = match events.recv().await {
            Ok(event) => event,
            Err(broadcast::error::RecvError::Lagged(n)) => {
                warn!("Dropped {} events", n);
                continue;
            }
            Err(_) => break,
        };

        match event {
            Event::Track { reading, .. } => {
                if config.json {
                    match serde_json::to_string(&reading) {
                        Ok(line) => println!("{}", line),
                        Err(e) => error!("Cannot serialize reading: {}", e),
                    }
                } else {
                    println!("{}", reading);
                }
            }
            Event::Fail(failure) if config.verbose => {
                println!(
                    "FAIL {} from {}: {:?}",
                    failure.reason, failure.connection, failure.input
                );
            }
            Event::Error(e) => error!("{}", e),
            _ => {}
        }
    }
}
