//! Scan from the in-process SANE emulation
//!
//! ```text
//! RUST_LOG=scanrust=debug cargo run --example emulated_scan -- test:1
//! ```

use anyhow::Context;
use scanrust::{ColorMode, DriverRegistry, ScanArea, ScanParameters, ScanSource};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let id = std::env::args().nth(1).unwrap_or_else(|| "test:0".to_string());

    let registry = DriverRegistry::builder().with_emulation_defaults().build();
    for device in registry.discover().await?.iter() {
        println!("found {}", device);
    }

    let session = registry
        .open_id(&id)
        .await
        .with_context(|| format!("opening {id}"))?;
    let caps = session.capabilities().await?;
    println!("resolutions: {:?}", caps.resolutions);
    println!("parameters: {:?}", session.parameter_names().await?);

    let source = if caps.sources().contains(&ScanSource::AdfDuplex) {
        ScanSource::AdfDuplex
    } else {
        ScanSource::Flatbed
    };
    let resolution = caps.resolutions.iter().next().copied().context("no resolutions")?;
    let params = ScanParameters::new(resolution, ColorMode::Color, ScanArea::new(0.0, 0.0, 100.0, 100.0))
        .with_source(source);
    session.configure(&params).await?;

    let mut status = session.status();
    let progress = tokio::spawn(async move {
        while status.changed().await.is_ok() {
            let s = status.borrow_and_update().clone();
            println!("{:>10} {:>10} bytes, frame {}", s.state, s.progress.bytes, s.progress.frames);
        }
    });

    session.start_scan().await?;
    let image = session.wait_for_scan().await?;
    for (i, frame) in image.frames.iter().enumerate() {
        println!("frame {}: {}", i, frame.layout);
    }
    println!("{} bytes acquired at {}", image.total_bytes(), image.acquired_at);

    session.close().await;
    drop(session);
    progress.await?;
    registry.shutdown();
    Ok(())
}
