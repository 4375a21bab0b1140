use crate::cli::{
    actions::{server, Action},
    commands::auth,
};
use anyhow::{Context, Result};

/// Turn parsed matches into the action to execute.
///
/// # Errors
/// Returns an error when required arguments are missing.
pub fn handler(matches: &clap::ArgMatches) -> Result<Action> {
    let port = matches.get_one::<u16>("port").map_or(8080, |&port| port);

    let dsn = matches
        .get_one::<String>("dsn")
        .context("missing required argument: --dsn")?
        .clone();

    let auth = auth::Options::parse(matches)?;

    Ok(Action::Server(server::Args { port, dsn, auth }))
}
