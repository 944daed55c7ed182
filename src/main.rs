//! Stream samples from a BITalino board to stdout.
//!
//! Usage:
//!   cargo run -- [--rate HZ] [--channels 0,1,2] [--name PREFIX] [--id ADDR]
//!                [--scan-secs N] [--json] [--list]
//!
//! Without `--name` or `--id` the first device advertising the UART
//! service is used. `--json` prints one JSON object per sample. `--list`
//! scans for `--scan-secs`, prints every matching device and exits.

use std::io::{self, BufRead};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use log::{error, info};

use bitalino_ble::prelude::*;

struct Args {
    stream: StreamConfig,
    filter: DeviceFilter,
    json: bool,
    list: bool,
}

fn parse_args() -> Result<Args> {
    let mut stream = StreamConfig::default();
    let mut filter = DeviceFilter::default();
    let mut json = false;
    let mut list = false;

    let mut it = std::env::args().skip(1);
    while let Some(arg) = it.next() {
        let mut value = || it.next().ok_or_else(|| anyhow!("{arg} needs a value"));
        match arg.as_str() {
            "--rate" => stream.sample_rate_hz = value()?.parse().context("--rate")?,
            "--channels" => {
                stream.channels = value()?
                    .split(',')
                    .filter(|s| !s.is_empty())
                    .map(|s| s.trim().parse::<u8>())
                    .collect::<Result<_, _>>()
                    .context("--channels")?;
            }
            "--name" => filter.name_prefix = Some(value()?),
            "--id" => filter.device_id = Some(value()?),
            "--scan-secs" => {
                filter.scan_timeout = Duration::from_secs(value()?.parse().context("--scan-secs")?)
            }
            "--json" => json = true,
            "--list" => list = true,
            other => bail!("unknown argument: {other}"),
        }
    }
    stream.validate()?;
    Ok(Args {
        stream,
        filter,
        json,
        list,
    })
}

#[tokio::main]
async fn main() -> Result<()> {
    // ── Logging ───────────────────────────────────────────────────────────────
    // RUST_LOG=bitalino_ble=debug for per-frame output.
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = parse_args()?;

    if args.list {
        let devices = BtleplugTransport::default().scan_all(&args.filter).await?;
        if devices.is_empty() {
            println!("No BITalino devices found.");
        }
        for d in devices {
            println!("{}  {}", d.id, d.display_name());
        }
        return Ok(());
    }

    // ── Connect ───────────────────────────────────────────────────────────────
    let config = BitalinoClientConfig {
        filter: args.filter,
        ..Default::default()
    };
    let client = Arc::new(BitalinoClient::new(BtleplugTransport::default(), config));
    let mut rx = client.subscribe();

    info!("Connecting to BITalino …");
    client.connect().await?;
    client.start_streaming(args.stream.clone()).await?;
    info!("Commands (type + Enter):");
    info!("  q  – quit");
    info!("  p  – stop acquisition");
    info!("  r  – restart acquisition");
    info!("  s  – print status");

    // ── Stdin command loop ────────────────────────────────────────────────────
    // Lines are read on an OS thread so no StdinLock is held across awaits.
    let (line_tx, mut line_rx) = tokio::sync::mpsc::unbounded_channel::<String>();
    std::thread::spawn(move || {
        for line in io::stdin().lock().lines() {
            match line {
                Ok(l) => {
                    if line_tx.send(l.trim().to_owned()).is_err() {
                        break;
                    }
                }
                Err(_) => break,
            }
        }
    });

    let cmd_client = Arc::clone(&client);
    let stream = args.stream;
    tokio::spawn(async move {
        while let Some(line) = line_rx.recv().await {
            match line.as_str() {
                "" => {}
                "q" => {
                    info!("Quit requested.");
                    if let Err(e) = cmd_client.disconnect().await {
                        error!("Disconnect error: {e}");
                    }
                    break;
                }
                "p" => match cmd_client.stop_streaming().await {
                    Ok(StopOutcome::Stopped) => info!("Acquisition stopped."),
                    Ok(StopOutcome::NotStreaming) => info!("Not streaming."),
                    Err(e) => error!("Stop error: {e}"),
                },
                "r" => {
                    if let Err(e) = cmd_client.start_streaming(stream.clone()).await {
                        error!("Start error: {e}");
                    }
                }
                "s" => match serde_json::to_string(&cmd_client.status()) {
                    Ok(s) => println!("[STATUS] {s}"),
                    Err(e) => error!("Status error: {e}"),
                },
                other => info!("Unknown command '{other}'"),
            }
        }
    });

    // ── Main event loop ───────────────────────────────────────────────────────
    loop {
        let event = match rx.recv().await {
            Ok(event) => event,
            Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                error!("Output fell behind, skipped {n} events");
                continue;
            }
            Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
        };
        match event {
            BitalinoEvent::Connected(device) => info!("✅  Connected to: {}", device.display_name()),
            BitalinoEvent::StreamingStarted(cfg) => {
                info!("Acquiring at {} Hz on channels {:?}", cfg.sample_rate_hz, cfg.channels)
            }
            BitalinoEvent::StreamingStopped => info!("Acquisition stopped."),
            BitalinoEvent::Sample(sample) => {
                if args.json {
                    println!("{}", serde_json::to_string(&sample)?);
                } else {
                    println!(
                        "[SAMPLE] seq={:2}  ts={:.0} ms  digital={:?}  analog={:?}",
                        sample.sequence, sample.timestamp, sample.digital, sample.analog
                    );
                }
            }
            BitalinoEvent::Disconnected { requested } => {
                if requested {
                    info!("Disconnected.");
                } else {
                    info!("❌  Device was disconnected.");
                }
                break;
            }
        }
    }

    info!("Event loop finished – exiting.");
    Ok(())
}
