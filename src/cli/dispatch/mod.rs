use crate::cli::actions::Action;
use anyhow::Result;
use std::path::PathBuf;

pub fn handler(matches: &clap::ArgMatches) -> Result<Action> {
    Ok(Action::Run {
        config: matches
            .get_one::<String>("config")
            .map_or_else(|| PathBuf::from("config.yml"), PathBuf::from),
        port: matches.get_one::<u16>("port").copied(),
    })
}
