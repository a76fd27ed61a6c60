//! Drive a simulated GL841 scanner through the hardware protocol adapter,
//! then cancel a second scan halfway

use std::sync::Arc;
use std::time::Duration;

use scanrust::hardware::{SimulatedConnector, SimulatedScanner};
use scanrust::{ChipsetKind, ColorMode, DriverRegistry, ParameterValue, ScanArea, ScanParameters};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let scanner = SimulatedScanner::new(ChipsetKind::Gl841);
    let connector = Arc::new(SimulatedConnector::new().with_device("lide35", scanner.clone()));

    let registry = DriverRegistry::builder()
        .with_chipset(ChipsetKind::Gl841, connector)
        .build();
    registry.discover().await?;

    let session = registry.open_id("lide35").await?;
    let params = ScanParameters::new(150, ColorMode::Gray, ScanArea::new(0.0, 0.0, 100.0, 50.0))
        .with_extension("gain", ParameterValue::Int(24));
    session.configure(&params).await?;

    session.start_scan().await?;
    let image = session.wait_for_scan().await?;
    println!(
        "scanned {} bytes, {} calibration(s), lamp on: {}",
        image.total_bytes(),
        scanner.calibrations(),
        scanner.lamp_on()
    );

    session.start_scan().await?;
    tokio::time::sleep(Duration::from_millis(5)).await;
    if session.cancel_scan().is_ok() {
        match session.wait_for_scan().await {
            Ok(image) => println!("finished before cancel: {} bytes", image.total_bytes()),
            Err(e) => println!("second scan: {}", e.record()),
        }
    }
    println!("state {}, lamp on: {}", session.state(), scanner.lamp_on());

    session.close().await;
    Ok(())
}
