use clap::{builder::ValueParser, Arg, ArgAction, Command};

/// Map named log levels to a verbosity count, numbers pass through.
fn validator_log_level() -> ValueParser {
    ValueParser::from(move |level: &str| -> std::result::Result<u8, String> {
        if let Ok(numeric) = level.parse::<u8>() {
            if numeric <= 5 {
                return Ok(numeric);
            }

            return Err(format!("invalid log level: {level}"));
        }

        match level.to_ascii_lowercase().as_str() {
            "error" => Ok(0),
            "warn" => Ok(1),
            "info" => Ok(2),
            "debug" => Ok(3),
            "trace" => Ok(4),
            _ => Err(format!("invalid log level: {level}")),
        }
    })
}

#[must_use]
pub fn with_args(command: Command) -> Command {
    command
        .arg(
            Arg::new("verbosity")
                .short('v')
                .long("verbose")
                .help("Verbosity level: error, warn, info, debug, trace (repeat -v to raise)")
                .global(true)
                .action(ArgAction::Count),
        )
        .arg(
            Arg::new("log-level")
                .long("log-level")
                .help("Set the log level by name instead of repeating -v")
                .env("MERCATO_LOG_LEVEL")
                .global(true)
                .conflicts_with("verbosity")
                .value_parser(validator_log_level()),
        )
}
