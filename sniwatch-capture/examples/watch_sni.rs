//! Example: print every TLS server name seen on an interface
//!
//! Note: Requires root/administrator privileges to run.
//!
//! Run with: sudo cargo run --example watch_sni -- eth0

use sniwatch_capture::{filters, CaptureSession};
use sniwatch_core::{default_interface, CaptureConfig, Error};
use std::time::Duration;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let interface = match std::env::args().nth(1) {
        Some(name) => name,
        None => default_interface()?.name,
    };
    println!("Watching {} for ClientHellos (30 seconds)", interface);

    let config = CaptureConfig::new(interface).with_filter(filters::tls_filter(443));
    let mut session = CaptureSession::open(config)?;
    let mut handle = session.start()?;

    let deadline = tokio::time::Instant::now() + Duration::from_secs(30);
    loop {
        let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
        match handle.wait_for_identity(remaining).await {
            Ok(record) => println!(
                "{} -> {}  {}",
                record.source, record.destination, record.hostname
            ),
            Err(Error::Timeout(_)) | Err(Error::SessionClosed) => break,
            Err(e) => return Err(e.into()),
        }
    }

    handle.shutdown().await;
    println!();
    println!("{}", session.stats().format());
    Ok(())
}
