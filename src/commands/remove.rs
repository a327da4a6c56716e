//! `cdi-node-driver remove`: delete the machine, then the local record.

use anyhow::Result;
use colored::Colorize;

use super::Session;

pub fn run(session: &mut Session) -> Result<()> {
    let had_uuid = !session.node().machine_uuid.is_empty();

    session.run(|driver| driver.remove())?;
    session.forget()?;

    if had_uuid {
        println!("{} {} removed", "ok".green().bold(), session.node().machine_name.bold());
    } else {
        println!(
            "{} {} had no machine to remove",
            "ok".yellow().bold(),
            session.node().machine_name.bold()
        );
    }
    Ok(())
}
