use anyhow::Result;
use clap::Parser;
use colored::*;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

mod sse_client;

use sse_client::{format_event, Connection, Options, Received};

#[derive(Parser)]
#[command(name = "sse-test-client")]
#[command(about = "Consume a Server-Sent Events stream from the command line")]
struct Cli {
    /// Full URL of the event stream (e.g., http://localhost:4000/events)
    #[arg(long)]
    url: String,

    /// Pin the reconnection interval (milliseconds), ignoring server hints
    #[arg(long)]
    retry_ms: Option<u64>,

    /// Reconnect when no bytes arrive for this many seconds (0 disables)
    #[arg(long)]
    idle_timeout_secs: Option<u64>,

    /// Resume after this event id
    #[arg(long)]
    last_event_id: Option<String>,

    /// Exit after printing this many events
    #[arg(long)]
    max_events: Option<usize>,

    /// Wait for one event of this type, then exit (non-zero on timeout)
    #[arg(long)]
    wait_for: Option<String>,

    /// How long --wait-for waits before giving up
    #[arg(long, default_value_t = 30)]
    timeout_secs: u64,

    /// Enable verbose output
    #[arg(long, short)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    if cli.verbose {
        env_logger::Builder::from_default_env()
            .filter_level(log::LevelFilter::Debug)
            .init();
    }

    let options = Options {
        url: cli.url.clone(),
        retry: cli.retry_ms.map(Duration::from_millis),
        idle_timeout: cli.idle_timeout_secs.map(Duration::from_secs),
        last_event_id: cli.last_event_id.clone(),
    };

    let cancel = CancellationToken::new();
    let on_ctrl_c = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            on_ctrl_c.cancel();
        }
    });

    println!("{} Subscribing to {}...", "→".blue(), cli.url);
    let connection = Connection::establish(&options, "stream".to_string(), &cancel)?;

    if let Some(event_type) = &cli.wait_for {
        let timeout = Duration::from_secs(cli.timeout_secs);
        let result = connection.wait_for_event(event_type, timeout).await;
        connection.close().await;

        return match result {
            Ok(event) => {
                println!("{}", format_event(&event));
                println!("\n{}", format!("Received {event_type} ✓").bright_green().bold());
                Ok(())
            }
            Err(e) => {
                println!("\n{}", format!("{e} ✗").bright_red().bold());
                std::process::exit(1);
            }
        };
    }

    let mut received = 0usize;
    loop {
        match connection.next().await {
            Received::Event(event) => {
                received += 1;
                println!("{}", format_event(&event));
                if cli.max_events.is_some_and(|max| received >= max) {
                    break;
                }
            }
            Received::KeepAlive => {
                println!("{}", "· keep-alive".dimmed());
            }
            Received::Interrupted(e) => {
                println!("{} stream interrupted ({}), reconnecting", "↻".yellow(), e);
            }
            Received::Finished(e) => {
                println!("{} stream finished: {}", "■".bright_white(), e);
                break;
            }
        }
    }

    connection.close().await;
    println!(
        "\n{}",
        format!(
            "{} event(s) received, last event id {:?}",
            received,
            connection.last_event_id()
        )
        .bright_white()
        .bold()
    );
    Ok(())
}
