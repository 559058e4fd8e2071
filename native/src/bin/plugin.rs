use log::{error, info};
use poe_burnin_plugin::logging;
use poe_burnin_plugin::{
    parse_attach_key, resolve_port_ids, run_session, PluginError, ReplaySampler, SessionOutcome,
    Settings,
};
use std::process::ExitCode;

fn main() -> ExitCode {
    // Load or ignore .env file
    let _ = dotenvy::dotenv();

    logging::init_logger();
    logging::init_crash_logger();

    if let Ok(dsn) = std::env::var("NATIVE_SENTRY_DSN") {
        let environment = std::env::var("SENTRY_ENVIRONMENT").ok();
        if logging::init_sentry(Some(&dsn), environment.as_deref()) {
            info!("[PLUGIN] Sentry monitoring initialized - Environment: {:?}", environment);
        }
    } else {
        info!("[PLUGIN] Sentry monitoring disabled (no NATIVE_SENTRY_DSN configured)");
    }

    info!("[PLUGIN] PoE burn-in plugin v{}", poe_burnin_plugin::get_version());

    let code = match run() {
        Ok(outcome) => {
            info!("[PLUGIN] Exiting after {:?}", outcome);
            ExitCode::SUCCESS
        }
        Err(e) => {
            logging::log_critical_error("session", &e.to_string());
            ExitCode::FAILURE
        }
    };

    logging::shutdown_sentry();
    code
}

fn run() -> Result<SessionOutcome, PluginError> {
    let key = parse_attach_key(std::env::args().skip(1))?;

    let mut settings = Settings::load()?;
    settings.apply_env_overrides()?;

    let trace = settings
        .sample_trace
        .clone()
        .ok_or(PluginError::NoSampleSource)?;
    let mut sampler = ReplaySampler::from_file(&trace)?;
    let port_ids = resolve_port_ids(&settings, &mut sampler)?;
    info!("[PLUGIN] Testing ports {:?} on '{}'", port_ids, key);

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .map_err(PluginError::Runtime)?;

    runtime.block_on(run_session(
        &settings,
        &key,
        &mut sampler,
        port_ids,
        async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!("[PLUGIN] Ctrl+C handler unavailable: {}", e);
                std::future::pending::<()>().await;
            }
        },
    ))
}
