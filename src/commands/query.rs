//! `cdi-node-driver state|ip|url`: plain values on stdout for the host.

use anyhow::Result;

use super::Session;

#[derive(Debug, Clone, Copy)]
pub enum Query {
    State,
    Ip,
    Url,
}

pub fn run(session: &mut Session, query: Query) -> Result<()> {
    let value = match query {
        Query::State => session.run(|driver| driver.state())?.to_string(),
        Query::Ip => session.run(|driver| driver.ip())?,
        Query::Url => session.run(|driver| driver.url())?,
    };
    println!("{value}");
    Ok(())
}
