pub fn parse_flags<'a>() -> clap::ArgMatches<'a> {
    app().get_matches()
}

pub fn app<'a, 'b>() -> clap::App<'a, 'b> {
    clap::App::new("ebwptool")
        .version(clap::crate_version!())
        .about("Create, inspect and restore resumable .ebwp backup archives")
        .setting(clap::AppSettings::SubcommandRequiredElseHelp)
        .arg(clap::Arg::from_usage("-d --debug 'Enable debug output'").global(true))
        .arg(
            clap::Arg::from_usage("--password [password] 'Password for encrypted archives (prompted when omitted)'")
                .global(true),
        )
        .subcommand(
            clap::SubCommand::with_name("create")
                .about("Back up one or more directories into a new archive")
                .arg(
                    clap::Arg::from_usage("-s --source <dir> 'Directory to back up'")
                        .multiple(true)
                        .number_of_values(1),
                )
                .arg(clap::Arg::from_usage("-o --out <dir> 'Directory the archive is written to'"))
                .arg(
                    clap::Arg::from_usage("-x --exclude [glob] 'Skip files matching this pattern'")
                        .multiple(true)
                        .number_of_values(1),
                )
                .arg(clap::Arg::from_usage("-c --config [file] 'Backup config (ebwp-config.json) to start from'"))
                .arg(clap::Arg::from_usage("--encrypt 'Encrypt entry payloads'"))
                .arg(clap::Arg::from_usage("--name-tag [tag] 'Name used in the archive filename'"))
                .arg(clap::Arg::from_usage("--incremental 'Only archive files changed since the last run'"))
                .arg(
                    clap::Arg::from_usage("--snapshot [file] 'File state recorded by the last incremental run'")
                        .requires("incremental"),
                )
                .arg(clap::Arg::from_usage("--budget-secs [secs] 'Pause and persist a token after this many seconds per step'"))
                .arg(clap::Arg::from_usage("--token [file] 'Where the resumption token is kept between steps'")),
        )
        .subcommand(
            clap::SubCommand::with_name("list")
                .about("List the entries and deletions recorded in an archive")
                .arg(clap::Arg::from_usage("-a --archive <file> 'Archive to read'"))
                .arg(clap::Arg::from_usage("--json 'Print entries as JSON objects'")),
        )
        .subcommand(
            clap::SubCommand::with_name("extract")
                .about("Restore a single entry from an archive")
                .arg(clap::Arg::from_usage("-a --archive <file> 'Archive to read'"))
                .arg(clap::Arg::from_usage("-e --entry <path> 'Entry path as shown by list'"))
                .arg(clap::Arg::from_usage("--dest <file> 'Where the restored file is written'")),
        )
        .subcommand(
            clap::SubCommand::with_name("check")
                .about("Report whether an archive was completely written")
                .arg(clap::Arg::from_usage("-a --archive <file> 'Archive to check'")),
        )
        .subcommand(
            clap::SubCommand::with_name("chain")
                .about("Resolve where the next incremental backup attaches")
                .arg(clap::Arg::from_usage("--dir <dir> 'Directory holding the stored archives'"))
                .arg(clap::Arg::from_usage("--last <filename> 'Filename of the last backup'")),
        )
}
