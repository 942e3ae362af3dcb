//! Load generator: sends a steady stream of GET requests to a Ratewatch
//! server and prints every response.

use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tokio::time::{self, MissedTickBehavior};
use tracing::info;

/// Sends a steady stream of requests to a Ratewatch server.
#[derive(Debug, Parser)]
#[command(name = "ratewatch-client", version, about)]
struct Cli {
    /// Address of the server
    #[arg(long, default_value = "http://localhost:8080")]
    address: String,

    /// Number of requests per second
    #[arg(long, default_value_t = 1, value_parser = clap::value_parser!(u32).range(1..))]
    frequency: u32,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    tracing_subscriber::fmt().with_target(false).init();

    let period = Duration::from_secs(1) / cli.frequency;
    let mut requests = time::interval(period);
    requests.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let client = reqwest::Client::new();
    info!(address = %cli.address, ?period, "Sending requests");

    loop {
        requests.tick().await;

        let response = client
            .get(&cli.address)
            .send()
            .await
            .with_context(|| format!("doing get request to {}", cli.address))?;
        let status = response.status();
        let body = response
            .text()
            .await
            .context("reading response body")?;

        println!("server response ({status}): {}", body.trim_end());
    }
}
