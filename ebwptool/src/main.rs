extern crate ebwptool;

use std::path::Path;

use ebwp::completeness::Completeness;
use ebwptool::create::{self, CreateOptions};
use ebwptool::error::{Error, Result};
use ebwptool::utils::required;

fn main() {
    if let Err(e) = run() {
        eprintln!("{}", e);
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    let matches = ebwptool::cli::parse_flags();
    // Global flags propagate down, so the subcommand sees them wherever they
    // were given.
    let (name, sub) = matches.subcommand();
    let globals = sub.unwrap_or(&matches);
    ebwptool::utils::init_logging(globals);
    let password = globals.value_of("password");

    match (name, sub) {
        ("create", Some(cmd)) => {
            let options = CreateOptions::from_matches(cmd, password)?;
            let summary = create::create(&options)?;
            println!(
                "Created {} ({} files, {} bytes)",
                summary.path.display(),
                summary.totals.count,
                summary.length
            );
            if summary.totals.skipped > 0 {
                println!("Skipped {} unreadable files", summary.totals.skipped);
            }
        }
        ("list", Some(cmd)) => {
            ebwptool::inspect::list(Path::new(required(cmd, "archive")?), cmd.is_present("json"))?;
        }
        ("extract", Some(cmd)) => {
            ebwptool::restore::extract_entry(
                Path::new(required(cmd, "archive")?),
                required(cmd, "entry")?,
                Path::new(required(cmd, "dest")?),
                password,
            )?;
        }
        ("check", Some(cmd)) => {
            let archive = required(cmd, "archive")?;
            if ebwptool::inspect::check(Path::new(archive)) == Completeness::Unknown {
                return Err(Error::NotFound(archive.to_string()));
            }
        }
        ("chain", Some(cmd)) => {
            ebwptool::inspect::chain(Path::new(required(cmd, "dir")?), required(cmd, "last")?)?;
        }
        _ => {
            return Err(Error::CliInputError(
                "No command specified or unknown command. Use --help for available commands.".to_string(),
            ));
        }
    }
    Ok(())
}
