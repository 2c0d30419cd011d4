use syncwardd::daemon::{self, DaemonConfig, DaemonRuntime};
use syncwardd::process::EngineCommand;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CliMode {
    Run,
    Generate,
    ResetDatabase,
    ResetDeltas,
    Help,
}

fn parse_cli_mode<I>(args: I) -> anyhow::Result<CliMode>
where
    I: IntoIterator<Item = String>,
{
    let mut mode = CliMode::Run;
    for arg in args.into_iter().skip(1) {
        match arg.as_str() {
            "--once-generate" => mode = CliMode::Generate,
            "--reset-database" => mode = CliMode::ResetDatabase,
            "--reset-deltas" => mode = CliMode::ResetDeltas,
            "--help" | "-h" => mode = CliMode::Help,
            other => anyhow::bail!("unknown argument: {other}"),
        }
    }
    Ok(mode)
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("syncwardd=info,syncward_core=info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    init_tracing();
    let verb = match parse_cli_mode(std::env::args())? {
        CliMode::Help => {
            println!("Usage: syncwardd [--once-generate | --reset-database | --reset-deltas]");
            println!("  --once-generate   Create the engine keys and config, then exit");
            println!("  --reset-database  Drop the engine index database, then exit");
            println!("  --reset-deltas    Drop the engine delta index, then exit");
            return Ok(());
        }
        CliMode::Generate => Some(EngineCommand::Generate),
        CliMode::ResetDatabase => Some(EngineCommand::ResetDatabase),
        CliMode::ResetDeltas => Some(EngineCommand::ResetDeltas),
        CliMode::Run => None,
    };
    let config = DaemonConfig::from_env()?;
    if let Some(command) = verb {
        daemon::run_verb(&config, command).await?;
        tracing::info!(verb = command.as_str(), "engine verb finished");
        return Ok(());
    }
    let daemon = DaemonRuntime::bootstrap(config).await?;
    daemon.run().await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_cli_mode_defaults_to_run() {
        let mode = parse_cli_mode(vec!["syncwardd".to_string()]).unwrap();
        assert_eq!(mode, CliMode::Run);
    }

    #[test]
    fn parse_cli_mode_supports_reset_verbs() {
        let mode =
            parse_cli_mode(vec!["syncwardd".to_string(), "--reset-deltas".to_string()]).unwrap();
        assert_eq!(mode, CliMode::ResetDeltas);
        let mode =
            parse_cli_mode(vec!["syncwardd".to_string(), "--reset-database".to_string()]).unwrap();
        assert_eq!(mode, CliMode::ResetDatabase);
    }

    #[test]
    fn parse_cli_mode_supports_help() {
        let mode = parse_cli_mode(vec!["syncwardd".to_string(), "-h".to_string()]).unwrap();
        assert_eq!(mode, CliMode::Help);
    }

    #[test]
    fn parse_cli_mode_rejects_unknown_flags() {
        let err =
            parse_cli_mode(vec!["syncwardd".to_string(), "--logout".to_string()]).unwrap_err();
        assert!(err.to_string().contains("--logout"));
    }
}
