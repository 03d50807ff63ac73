use std::io::{Read, Write};
use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::Parser;
use log::LevelFilter;
use runpad_core::{
    probe_runtimes, BackendPreference, ExecutionResult, RuntimeConfig, RuntimeSelector,
};

#[derive(Parser, Debug)]
#[clap(
    name = "runpad",
    version = "0.1.0",
    about = "Run Python snippets through the best available interpreter backend"
)]
struct Cli {
    /// Script text to execute (reads stdin when neither this nor --file is given)
    #[clap(long, short)]
    code: Option<String>,

    /// Path to a script file to execute
    #[clap(long, short)]
    file: Option<PathBuf>,

    /// Backend selection policy: auto, native or sandbox
    #[clap(long, default_value = "auto")]
    backend: String,

    /// Optional YAML configuration file (defaults come from RUNPAD_* env vars)
    #[clap(long)]
    config: Option<PathBuf>,

    /// Resource bundle directory (stdlib archive, sandbox bootstrap)
    #[clap(long)]
    resource_dir: Option<PathBuf>,

    /// Wall-clock execution limit in seconds
    #[clap(long)]
    timeout_secs: Option<u64>,

    #[clap(long, short, default_value = "info")]
    log_level: String,

    /// Probe backend availability and exit
    #[clap(long)]
    probe: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let log_level = cli
        .log_level
        .parse::<LevelFilter>()
        .unwrap_or(LevelFilter::Info);
    env_logger::Builder::new().filter_level(log_level).init();

    let mut config = match &cli.config {
        Some(path) => RuntimeConfig::from_file(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => RuntimeConfig::from_env(),
    };
    if let Some(dir) = cli.resource_dir {
        config.resource_root = Some(dir);
    }
    if let Some(secs) = cli.timeout_secs {
        config.execution_timeout_secs = Some(secs);
    }
    config.preference = match cli.backend.as_str() {
        "auto" => BackendPreference::Auto,
        "native" => BackendPreference::Native,
        "sandbox" => BackendPreference::Sandbox,
        other => bail!("unknown backend '{}', expected auto, native or sandbox", other),
    };

    if cli.probe {
        let availability = probe_runtimes(&config).await;
        println!(
            "native:  {} ({})",
            if availability.native_available {
                "available"
            } else {
                "unavailable"
            },
            availability.native_detail
        );
        println!(
            "sandbox: {} ({})",
            if availability.sandbox_present {
                "present"
            } else {
                "absent"
            },
            availability.sandbox_detail
        );
        return Ok(());
    }

    let code = match (cli.code, cli.file) {
        (Some(code), None) => code,
        (None, Some(path)) => std::fs::read_to_string(&path)
            .with_context(|| format!("reading {}", path.display()))?,
        (None, None) => {
            let mut buffer = String::new();
            std::io::stdin()
                .read_to_string(&mut buffer)
                .context("reading script from stdin")?;
            buffer
        }
        (Some(_), Some(_)) => bail!("--code and --file are mutually exclusive"),
    };

    let selector = RuntimeSelector::new(config);
    let result = selector.execute(&code).await?;

    // exit() skips buffered-writer cleanup, so flush before leaving.
    write_streams(std::io::stdout().lock(), std::io::stderr().lock(), &result)
        .context("writing script output")?;
    std::process::exit(result.exit_code.unwrap_or(0));
}

fn write_streams(
    mut out: impl Write,
    mut err: impl Write,
    result: &ExecutionResult,
) -> std::io::Result<()> {
    out.write_all(result.stdout.as_bytes())?;
    out.flush()?;
    err.write_all(result.stderr.as_bytes())?;
    err.flush()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unterminated_output_is_written_in_full() {
        let result = ExecutionResult {
            stdout: "no trailing newline".to_string(),
            stderr: "partial".to_string(),
            exit_code: Some(0),
        };
        let mut out = Vec::new();
        let mut err = Vec::new();
        write_streams(&mut out, &mut err, &result).unwrap();
        assert_eq!(out, b"no trailing newline".to_vec());
        assert_eq!(err, b"partial".to_vec());
    }
}
