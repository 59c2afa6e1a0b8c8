use std::{env, str::FromStr};

use log::LevelFilter;
use log4rs::{
    append::console::{ConsoleAppender, Target},
    config::{Appender, Root},
    encode::pattern::PatternEncoder,
    Config,
};

/// Environment variable holding the log level; forwarded to the starter.
pub const LOG_LEVEL_ENV: &str = "OCICTL_MESSAGELEVEL";

const DEFAULT_LEVEL: LevelFilter = LevelFilter::Warn;

pub fn level() -> LevelFilter {
    parse_level(env::var(LOG_LEVEL_ENV).ok().as_deref())
}

fn parse_level(value: Option<&str>) -> LevelFilter {
    value
        .and_then(|level| LevelFilter::from_str(level.trim()).ok())
        .unwrap_or(DEFAULT_LEVEL)
}

/// The `NAME=value` pair the starter needs to log at the caller's level.
pub fn env_pair() -> (String, String) {
    (
        LOG_LEVEL_ENV.to_owned(),
        level().as_str().to_ascii_lowercase(),
    )
}

pub fn init() -> anyhow::Result<()> {
    log4rs::init_config(
        Config::builder()
            .appender(
                Appender::builder().build(
                    "stderr",
                    Box::new(
                        ConsoleAppender::builder()
                            .target(Target::Stderr)
                            .encoder(Box::new(PatternEncoder::new(
                                "{h({l}):<5} [{M}] {m}{n}",
                            )))
                            .build(),
                    ),
                ),
            )
            .build(Root::builder().appender("stderr").build(level()))?,
    )?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn level_names_are_case_insensitive() {
        assert_eq!(parse_level(Some("debug")), LevelFilter::Debug);
        assert_eq!(parse_level(Some(" TRACE\n")), LevelFilter::Trace);
        assert_eq!(parse_level(Some("off")), LevelFilter::Off);
    }

    #[test]
    fn unset_or_bogus_level_falls_back_to_warn() {
        assert_eq!(parse_level(None), LevelFilter::Warn);
        assert_eq!(parse_level(Some("chatty")), LevelFilter::Warn);
    }
}
