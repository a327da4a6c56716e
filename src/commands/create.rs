//! `cdi-node-driver create`: compose, install and bootstrap the node.

use anyhow::Result;
use colored::Colorize;

use super::Session;

pub fn run(session: &mut Session) -> Result<()> {
    println!(
        "{} creating {}",
        "::".blue().bold(),
        session.node().machine_name.bold()
    );

    session.run(|driver| driver.create())?;

    let node = session.node();
    println!("{} {} created", "ok".green().bold(), node.machine_name.bold());
    println!("  uuid:       {}", node.machine_uuid);
    println!("  ip:         {}", node.ip_address);
    if !node.private_ip_address.is_empty() {
        println!("  private ip: {}", node.private_ip_address);
    }
    println!("  ssh key:    {}", node.ssh_key_path.display().to_string().dimmed());
    Ok(())
}
