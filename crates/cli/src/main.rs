//! Thin launcher: builds the desktop runtime if needed and spawns it,
//! passing all remaining arguments through untouched.

use std::process::ExitCode;

use {
    clap::Parser,
    tracing::info,
    tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt},
};

#[derive(Parser)]
#[command(name = "courier", about = "Courier channel gateway launcher")]
struct Cli {
    /// Runtime binary to launch (name on PATH or an explicit path).
    #[arg(long, env = "COURIER_RUNTIME", default_value = "courier-desktop")]
    runtime: String,

    /// Shell command that builds the runtime when it is missing.
    #[arg(long, env = "COURIER_BUILD_CMD")]
    build_cmd: Option<String>,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Output logs as JSON instead of human-readable.
    #[arg(long, default_value_t = false)]
    json_logs: bool,

    /// Arguments passed through to the runtime process.
    #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
    args: Vec<String>,
}

fn init_telemetry(cli: &Cli) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level));
    let registry = tracing_subscriber::registry().with(filter);
    if cli.json_logs {
        registry
            .with(fmt::layer().json().with_target(true).with_thread_ids(false))
            .init();
    } else {
        registry
            .with(fmt::layer().with_target(false).with_thread_ids(false))
            .init();
    }
}

fn resolve_runtime(cli: &Cli) -> anyhow::Result<std::path::PathBuf> {
    if let Ok(path) = which::which(&cli.runtime) {
        return Ok(path);
    }

    let Some(build_cmd) = &cli.build_cmd else {
        anyhow::bail!(
            "runtime '{}' not found and no build command configured \
             (set COURIER_BUILD_CMD or install the runtime)",
            cli.runtime
        );
    };

    info!(cmd = %build_cmd, "runtime missing, building");
    let status = std::process::Command::new("sh")
        .arg("-c")
        .arg(build_cmd)
        .status()?;
    if !status.success() {
        anyhow::bail!("build command failed (exit {:?})", status.code());
    }

    which::which(&cli.runtime)
        .map_err(|_| anyhow::anyhow!("runtime '{}' still missing after build", cli.runtime))
}

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    init_telemetry(&cli);

    let runtime = resolve_runtime(&cli)?;
    info!(runtime = %runtime.display(), "spawning runtime");

    let mut child = tokio::process::Command::new(&runtime)
        .args(&cli.args)
        .spawn()?;
    let status = child.wait().await?;

    Ok(ExitCode::from(status.code().unwrap_or(1).clamp(0, 255) as u8))
}
