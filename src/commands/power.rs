//! `cdi-node-driver start|stop|kill|restart`

use anyhow::Result;
use colored::Colorize;

use super::Session;

#[derive(Debug, Clone, Copy)]
pub enum Action {
    Start,
    Stop,
    Kill,
    Restart,
}

impl Action {
    fn done(self) -> &'static str {
        match self {
            Action::Start => "started",
            Action::Stop => "stopped",
            Action::Kill => "powered off",
            Action::Restart => "restarted",
        }
    }
}

pub fn run(session: &mut Session, action: Action) -> Result<()> {
    session.run(|driver| match action {
        Action::Start => driver.start(),
        Action::Stop => driver.stop(),
        Action::Kill => driver.kill(),
        Action::Restart => driver.restart(),
    })?;

    println!(
        "{} {} {}",
        "ok".green().bold(),
        session.node().machine_name.bold(),
        action.done()
    );
    Ok(())
}
