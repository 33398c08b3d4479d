//! Scan for nearby peripherals and print each one as it appears.

#[cfg(not(target_os = "linux"))]
fn main() {
    eprintln!("This example drives BlueZ and only runs on Linux.");
}

#[cfg(target_os = "linux")]
#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    use std::sync::Arc;
    use std::time::Duration;

    use bluetree_core::{BluezBroker, CoreEvent, DiscoveryAgent, DiscoveryOptions};

    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let broker = Arc::new(BluezBroker::connect_system().await?);
    let agent = DiscoveryAgent::with_options(
        broker,
        BluezBroker::default_adapter(),
        DiscoveryOptions::new().scan_duration(Duration::from_secs(5)),
    );

    let mut events = agent.subscribe();
    agent.start().await?;

    println!("Scanning for 5 seconds...");
    loop {
        match events.recv().await {
            Ok(CoreEvent::DeviceDiscovered { device }) => {
                println!("  {} ({})", device.name(), device.address());
            }
            Ok(CoreEvent::DiscoveryFinished) => break,
            Ok(CoreEvent::Error { kind }) => {
                eprintln!("scan error: {kind:?}");
                break;
            }
            Ok(_) => {}
            Err(_) => break,
        }
    }
    println!("Scan complete.");
    Ok(())
}
