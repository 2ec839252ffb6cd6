use std::env;
use std::process;

/// Default seconds a previous instance gets to stop before SIGKILL
pub const DEFAULT_GRACE_SECONDS: u64 = 30;

/// Prints usage instructions for the program.
///
/// Uses `PROGRAM_NAME` constant from `crate` for the executable name.
pub fn print_usage() {
    println!(
        "Usage: {} [-h] [-v] [-d] [-1] [-l logfile] [-g grace_seconds] [-t connect_timeout] [--insecure-skip-verify] config_file",
        crate::PROGRAM_NAME
    );
}

/// Options of one daemon run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CliOptions {
    /// Verbose logging
    pub debug: bool,
    /// Path to log file (None for stdout)
    pub log_file: Option<String>,
    pub grace_seconds: u64,
    /// Overrides `connect_timeout` of every endpoint
    pub connect_timeout: Option<u64>,
    /// Poll every endpoint once and exit
    pub once: bool,
    /// Skip TLS certificate verification (FTPS only)
    pub insecure_skip_verify: bool,
    pub config_file: String,
}

/// What the command line asks for
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CliCommand {
    Run(CliOptions),
    Help,
    Version,
}

/// Parses command line arguments, exiting on `-h`, `-v` or bad input
///
/// # Example
/// ```text
/// // let options = parse_args();
/// // set_debug(options.debug);
/// ```
pub fn parse_args() -> CliOptions {
    match parse_from(env::args().skip(1)) {
        Ok(CliCommand::Run(options)) => options,
        Ok(CliCommand::Help) => {
            print_usage();
            process::exit(0);
        }
        Ok(CliCommand::Version) => {
            println!("{} version {}", crate::PROGRAM_NAME, crate::PROGRAM_VERSION);
            process::exit(0);
        }
        Err(message) => {
            eprintln!("Error: {}", message);
            print_usage();
            process::exit(1);
        }
    }
}

/// Parses arguments without the program name
///
/// # Errors
/// A message for a missing value, a bad number, an extra positional argument
/// or a missing config file.
pub fn parse_from<I>(args: I) -> Result<CliCommand, String>
where
    I: IntoIterator<Item = String>,
{
    let mut debug = false;
    let mut log_file = None;
    let mut grace_seconds = DEFAULT_GRACE_SECONDS;
    let mut connect_timeout: Option<u64> = None;
    let mut once = false;
    let mut insecure_skip_verify = false;
    let mut config_file: Option<String> = None;

    let mut args = args.into_iter();
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "-h" => return Ok(CliCommand::Help),
            "-v" => return Ok(CliCommand::Version),
            "-d" => debug = true,
            "-1" => once = true,
            "-l" => log_file = Some(args.next().ok_or("Missing log file argument")?),
            "-g" => {
                let value = args.next().ok_or("Missing grace seconds argument")?;
                grace_seconds = value
                    .parse()
                    .map_err(|_| "Grace seconds must be a positive number".to_string())?;
            }
            "-t" => {
                let value = args.next().ok_or("Missing connect timeout argument")?;
                connect_timeout = match value.parse::<u64>() {
                    Ok(n) if n > 0 => Some(n),
                    _ => return Err("Connect timeout must be a positive number".to_string()),
                };
            }
            "--insecure-skip-verify" => insecure_skip_verify = true,
            _ if arg.starts_with('-') && arg.len() > 1 => {
                return Err(format!("Unknown option: {}", arg));
            }
            _ => {
                if config_file.is_some() {
                    return Err(format!("Unexpected argument: {}", arg));
                }
                config_file = Some(arg);
            }
        }
    }

    let config_file = config_file.ok_or("Missing config file argument")?;
    Ok(CliCommand::Run(CliOptions {
        debug,
        log_file,
        grace_seconds,
        connect_timeout,
        once,
        insecure_skip_verify,
        config_file,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Result<CliCommand, String> {
        parse_from(args.iter().map(|s| s.to_string()))
    }

    #[test]
    fn test_defaults() {
        let command = parse(&["endpoints.jsonl"]).unwrap();
        assert_eq!(
            command,
            CliCommand::Run(CliOptions {
                debug: false,
                log_file: None,
                grace_seconds: DEFAULT_GRACE_SECONDS,
                connect_timeout: None,
                once: false,
                insecure_skip_verify: false,
                config_file: "endpoints.jsonl".to_string(),
            })
        );
    }

    #[test]
    fn test_all_flags() {
        let command = parse(&[
            "-d",
            "-1",
            "-l",
            "/var/log/ftpoll.log",
            "-g",
            "5",
            "-t",
            "12",
            "--insecure-skip-verify",
            "conf.jsonl",
        ])
        .unwrap();
        match command {
            CliCommand::Run(options) => {
                assert!(options.debug);
                assert!(options.once);
                assert!(options.insecure_skip_verify);
                assert_eq!(options.log_file.as_deref(), Some("/var/log/ftpoll.log"));
                assert_eq!(options.grace_seconds, 5);
                assert_eq!(options.connect_timeout, Some(12));
                assert_eq!(options.config_file, "conf.jsonl");
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_help_and_version_win() {
        assert_eq!(parse(&["-h", "conf.jsonl"]).unwrap(), CliCommand::Help);
        assert_eq!(parse(&["-v"]).unwrap(), CliCommand::Version);
    }

    #[test]
    fn test_errors() {
        assert!(parse(&[]).unwrap_err().contains("config file"));
        assert!(parse(&["-t", "0", "c"]).is_err());
        assert!(parse(&["-g", "soon", "c"]).is_err());
        assert!(parse(&["-l"]).is_err());
        assert!(parse(&["a", "b"]).unwrap_err().contains("Unexpected"));
        assert!(parse(&["-x", "c"]).unwrap_err().contains("Unknown"));
    }
}
