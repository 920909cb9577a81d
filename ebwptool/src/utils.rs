use crate::error::{Error, Result};

/// Install the stderr log subscriber. `RUST_LOG` wins over `--debug`.
pub fn init_logging(matches: &clap::ArgMatches) {
    let default = if matches.is_present("debug") { "debug" } else { "warn" };
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default)),
        )
        .with_writer(std::io::stderr)
        .try_init();
}

pub fn get_password(given: Option<&str>) -> Result<String> {
    match given {
        Some(p) => Ok(p.to_string()),
        None => Ok(rpassword::prompt_password("Enter encryption password: ")?),
    }
}

/// Value of a required argument. clap enforces presence, this only turns a
/// missing value into an error instead of a panic.
pub fn required<'a>(matches: &'a clap::ArgMatches, name: &str) -> Result<&'a str> {
    matches
        .value_of(name)
        .ok_or_else(|| Error::CliInputError(format!("--{} is required", name)))
}
