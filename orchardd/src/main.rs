use std::path::PathBuf;
use std::process::ExitCode;

use orchardd::config::{Config, ConfigError};
use orchardd::daemon::DaemonRuntime;

const EXIT_CONFIG: u8 = 2;
const EXIT_AUTH: u8 = 4;

#[derive(Debug, Clone, PartialEq, Eq)]
enum CliMode {
    Run { config: Option<PathBuf> },
    Help,
}

fn parse_cli_mode<I>(args: I) -> anyhow::Result<CliMode>
where
    I: IntoIterator<Item = String>,
{
    let mut config = None;
    let mut args = args.into_iter().skip(1);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--config" => {
                let value = args
                    .next()
                    .ok_or_else(|| anyhow::anyhow!("--config requires a path"))?;
                config = Some(PathBuf::from(value));
            }
            "--help" | "-h" => return Ok(CliMode::Help),
            other => anyhow::bail!("unknown argument: {other}"),
        }
    }
    Ok(CliMode::Run { config })
}

#[tokio::main]
async fn main() -> ExitCode {
    let mode = match parse_cli_mode(std::env::args()) {
        Ok(mode) => mode,
        Err(err) => {
            eprintln!("[orchardd] {err}");
            return ExitCode::from(EXIT_CONFIG);
        }
    };
    let config_path = match mode {
        CliMode::Help => {
            println!("Usage: orchardd [--config <path>]");
            println!("  --config <path>   Read configuration from <path> instead of");
            println!("                    ~/.config/orchard/config.json");
            return ExitCode::SUCCESS;
        }
        CliMode::Run { config } => config,
    };

    let config = match Config::load(config_path.as_deref()) {
        Ok(config) => config,
        Err(err) => {
            eprintln!("[orchardd] config error: {err}");
            return ExitCode::from(EXIT_CONFIG);
        }
    };

    let daemon = match DaemonRuntime::bootstrap(config).await {
        Ok(daemon) => daemon,
        Err(err) => {
            eprintln!("[orchardd] startup error: {err:#}");
            let code = match err.downcast_ref::<ConfigError>() {
                Some(ConfigError::MissingToken) => EXIT_AUTH,
                Some(_) => EXIT_CONFIG,
                None => 1,
            };
            return ExitCode::from(code);
        }
    };

    match daemon.run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("[orchardd] runtime error: {err:#}");
            ExitCode::from(1)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_cli_mode_defaults_to_run() {
        let mode = parse_cli_mode(vec!["orchardd".to_string()]).unwrap();
        assert_eq!(mode, CliMode::Run { config: None });
    }

    #[test]
    fn parse_cli_mode_accepts_config_path() {
        let mode = parse_cli_mode(vec![
            "orchardd".to_string(),
            "--config".to_string(),
            "/etc/orchard.json".to_string(),
        ])
        .unwrap();
        assert_eq!(
            mode,
            CliMode::Run {
                config: Some(PathBuf::from("/etc/orchard.json"))
            }
        );
    }

    #[test]
    fn parse_cli_mode_rejects_unknown_flags() {
        assert!(parse_cli_mode(vec!["orchardd".to_string(), "--frob".to_string()]).is_err());
    }
}
