use iscsi_initiator::{IscsiInitiator, SessionType};

fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    let portal = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "127.0.0.1:3260".to_string());

    let initiator_iqn = std::env::args()
        .nth(2)
        .unwrap_or_else(|| "iqn.2025-12.local:test-initiator".to_string());

    println!("Discovering targets at {}...", portal);

    let mut initiator = IscsiInitiator::builder()
        .initiator_name(initiator_iqn)
        .portal(&portal)
        .session_type(SessionType::Discovery)
        .build()?;
    initiator.login_sync()?;
    let targets = initiator.discover_sync()?;
    initiator.logout_sync()?;

    if targets.is_empty() {
        println!("No targets discovered");
    } else {
        println!("\nDiscovered {} target(s):", targets.len());
        for target in &targets {
            println!("  TargetName: {}", target.target_name);
            for portal in &target.portals {
                println!("  TargetAddress: {}", portal);
            }
            println!();
        }
    }

    Ok(())
}
