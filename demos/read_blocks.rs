//! Log in to a target and dump the first blocks of LUN 0
//!
//! Usage: read_blocks <portal> <target-iqn> [chap-user chap-secret]

use iscsi_initiator::scsi::parse_read_capacity10;
use iscsi_initiator::{IscsiInitiator, ScsiTask};

fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    let args: Vec<String> = std::env::args().collect();
    let portal = args.get(1).cloned().unwrap_or_else(|| "127.0.0.1:3260".to_string());
    let target = args
        .get(2)
        .cloned()
        .unwrap_or_else(|| "iqn.2025-12.local:storage.disk1".to_string());

    let mut builder = IscsiInitiator::builder()
        .initiator_name("iqn.2025-12.local:test-initiator")
        .target_name(target)
        .portal(&portal);
    if let (Some(user), Some(secret)) = (args.get(3), args.get(4)) {
        builder = builder.chap(user.as_str(), secret.as_str());
    }

    let mut initiator = builder.build()?;
    initiator.login_sync()?;
    println!("Logged in to {}", portal);

    let task = initiator.scsi_command_sync(ScsiTask::read_capacity10(), 0)?;
    let Some((last_lba, block_size)) = parse_read_capacity10(&task.data()) else {
        return Err("READ CAPACITY returned no data".into());
    };
    println!("Capacity: {} blocks of {} bytes", last_lba as u64 + 1, block_size);

    let task = initiator.scsi_command_sync(ScsiTask::read10(0, 1, block_size), 0)?;
    for (i, line) in task.data().chunks(16).take(8).enumerate() {
        println!("{:04x}: {}", i * 16, hex::encode(line));
    }

    initiator.logout_sync()?;
    Ok(())
}
