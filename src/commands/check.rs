//! `cdi-node-driver check`: validate configuration, credentials and tenant.

use anyhow::Result;
use colored::Colorize;

use super::Session;

pub fn run(session: &mut Session) -> Result<()> {
    session.run(|driver| driver.pre_create_check())?;
    println!(
        "{} configuration, authorization and tenant verified",
        "ok".green().bold()
    );
    Ok(())
}
