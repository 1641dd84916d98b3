use clap::{Arg, ArgAction, Command};
use jos_core::transform::TransformerRegistry;
use jos_core::StreamParser;
use slog::{crit, Logger};
use sloggers::terminal::{Destination, TerminalLoggerBuilder};
use sloggers::types::Severity;
use sloggers::{Build, Config, LoggerConfig};
use std::error::Error;
use std::fs::File;
use std::io::BufReader;
use std::process;

fn main() {
    let matches = Command::new("jos_dump")
        .about("Dumps the contents of a Java object serialization stream")
        .arg(
            Arg::new("file")
                .value_name("FILE")
                .required(true)
                .help("Serialized stream to decode"),
        )
        .arg(
            Arg::new("json")
                .long("json")
                .action(ArgAction::SetTrue)
                .help("Render the decoded stream as JSON"),
        )
        .arg(
            Arg::new("verbose")
                .long("verbose")
                .short('v')
                .action(ArgAction::SetTrue)
                .help("Log parser events at debug level"),
        )
        .arg(
            Arg::new("log-config")
                .long("log-config")
                .value_name("TOML")
                .help("Logging configuration file"),
        )
        .get_matches();

    let log = build_logger(
        matches.get_one::<String>("log-config").map(String::as_str),
        matches.get_flag("verbose"),
    );

    let path = matches
        .get_one::<String>("file")
        .expect("file argument is required");

    if let Err(error) = run(path, matches.get_flag("json"), &log) {
        crit!(log, "parse failed"; "file" => path.as_str(), "error" => %error);
        process::exit(2);
    }
}

fn run(path: &str, as_json: bool, log: &Logger) -> Result<(), Box<dyn Error>> {
    let file = File::open(path)?;
    let mut src = BufReader::new(file);

    let mut parser = StreamParser::with_logger(&mut src, TransformerRegistry::default(), log.clone());
    let contents = parser.run()?;

    if as_json {
        let values: Vec<_> = contents.iter().map(jos_core::dump::to_json).collect();
        println!("{}", serde_json::to_string_pretty(&values)?);
    } else {
        print!("{}", parser.dump(&contents));
    }
    Ok(())
}

fn build_logger(config_path: Option<&str>, verbose: bool) -> Logger {
    if let Some(path) = config_path {
        let config: LoggerConfig =
            serdeconv::from_toml_file(path).expect("invalid logging configuration");
        return config
            .build_logger()
            .expect("cannot build the configured logger");
    }

    let mut builder = TerminalLoggerBuilder::new();
    builder.destination(Destination::Stderr);
    builder.level(if verbose {
        Severity::Debug
    } else {
        Severity::Info
    });
    builder.build().expect("cannot build the terminal logger")
}
