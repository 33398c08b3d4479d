//! Connect to a peripheral by address and print its GATT tree.

#[cfg(not(target_os = "linux"))]
fn main() {
    eprintln!("This example drives BlueZ and only runs on Linux.");
}

#[cfg(target_os = "linux")]
#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    use std::env;
    use std::sync::Arc;
    use std::time::Duration;

    use bluetree_core::{
        BluezBroker, ConnectionController, CoreEvent, DiscoveryAgent, ObjectBroker, ServiceState,
    };
    use tokio::time::timeout;

    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let args: Vec<String> = env::args().collect();
    let address = if args.len() > 1 {
        args[1].clone()
    } else {
        eprintln!("Usage: {} <ADDRESS>", args[0]);
        std::process::exit(1);
    };

    println!("Scanning for {address}...");
    let broker: Arc<dyn ObjectBroker> = Arc::new(BluezBroker::connect_system().await?);
    let agent = DiscoveryAgent::new(Arc::clone(&broker), BluezBroker::default_adapter());
    let mut events = agent.subscribe();
    agent.start().await?;

    let device = loop {
        match events.recv().await {
            Ok(CoreEvent::DeviceDiscovered { device })
                if device.address().eq_ignore_ascii_case(&address) =>
            {
                agent.stop().await?;
                break device;
            }
            Ok(CoreEvent::DiscoveryFinished) | Err(_) => {
                println!("Device not found: {address}");
                return Ok(());
            }
            _ => {}
        }
    };

    println!("\nFound: {}", device.name());
    println!("Connecting...");

    let controller = ConnectionController::new(Arc::clone(&broker), device);
    let mut events = controller.subscribe();
    controller.connect_to_device().await?;
    println!("Connected!");

    println!("Discovering services...");
    controller.discover_services().await?;
    loop {
        match timeout(Duration::from_secs(30), events.recv()).await {
            Ok(Ok(CoreEvent::DiscoveryFinished)) => break,
            Ok(Ok(_)) => {}
            Ok(Err(_)) | Err(_) => {
                eprintln!("service discovery did not complete");
                return Ok(());
            }
        }
    }

    println!("\n=== SERVICES AND CHARACTERISTICS ===\n");
    for uuid in controller.services() {
        let Some(session) = controller.create_session(&uuid) else {
            continue;
        };
        println!("Service: {} ({})", session.uuid(), session.kind());

        let mut session_events = session.subscribe();
        session.discover_details().await?;
        while session.state() != ServiceState::ServiceDiscovered {
            if timeout(Duration::from_secs(30), session_events.recv())
                .await
                .is_err()
            {
                break;
            }
        }

        for characteristic in session.characteristics() {
            println!(
                "  Char: {} [{:?}]",
                characteristic.uuid, characteristic.capabilities
            );
            if !characteristic.value.is_empty() {
                println!("        -> {:02X?}", characteristic.value.as_ref());
            }
            for descriptor in &characteristic.descriptors {
                println!("    Desc: {} {:02X?}", descriptor.uuid, descriptor.value.as_ref());
            }
        }
        println!();
    }

    controller.disconnect_from_device().await?;
    println!("Disconnected.");
    Ok(())
}
