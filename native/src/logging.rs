//! Console logging, crash log and optional Sentry reporting.

use log::{error, info, LevelFilter};
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::PathBuf;
use std::sync::{Mutex, MutexGuard, PoisonError};

const DATA_DIR: &str = "PoeBurnIn";
const CRASH_LOG_FILE: &str = "plugin_crash.log";

static CRASH_LOG_PATH: Mutex<Option<PathBuf>> = Mutex::new(None);
static SENTRY_GUARD: Mutex<Option<sentry::ClientInitGuard>> = Mutex::new(None);

fn locked<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Initialize env_logger. `RUST_LOG` wins; otherwise only warnings and errors.
pub fn init_logger() {
    let mut builder = env_logger::Builder::from_default_env();

    if std::env::var("RUST_LOG").is_err() {
        builder.filter_level(LevelFilter::Warn);
    }

    builder.format(|buf, record| {
        writeln!(
            buf,
            "[{}] {}: {}",
            record.level(),
            record.target(),
            record.args()
        )
    });

    let _ = builder.try_init();
}

/// Initialize Sentry when a DSN is configured. Returns whether it is active.
pub fn init_sentry(dsn: Option<&str>, environment: Option<&str>) -> bool {
    let Some(dsn) = dsn.filter(|d| !d.is_empty()) else {
        info!("[SENTRY] No DSN provided - Sentry disabled");
        return false;
    };

    let guard = sentry::init((
        dsn,
        sentry::ClientOptions {
            release: sentry::release_name!(),
            environment: environment.map(|e| std::borrow::Cow::Owned(e.to_string())),
            attach_stacktrace: true,
            send_default_pii: false,
            ..Default::default()
        },
    ));

    if !guard.is_enabled() {
        info!("[SENTRY] Failed to initialize");
        return false;
    }

    *locked(&SENTRY_GUARD) = Some(guard);
    info!("[SENTRY] Initialized - Environment: {:?}", environment);
    true
}

pub fn is_sentry_enabled() -> bool {
    locked(&SENTRY_GUARD)
        .as_ref()
        .is_some_and(|g| g.is_enabled())
}

/// Flush pending events and close the Sentry client.
pub fn shutdown_sentry() {
    if let Some(guard) = locked(&SENTRY_GUARD).take() {
        info!("[SENTRY] Flushing events");
        drop(guard);
    }
}

/// Install a panic hook that appends a report to the crash log.
pub fn init_crash_logger() {
    let log_dir = dirs::data_local_dir()
        .map(|dir| dir.join(DATA_DIR))
        .unwrap_or_else(|| PathBuf::from("."));
    let _ = fs::create_dir_all(&log_dir);
    let log_path = log_dir.join(CRASH_LOG_FILE);

    *locked(&CRASH_LOG_PATH) = Some(log_path.clone());

    std::panic::set_hook(Box::new(|panic_info| {
        let payload = if let Some(s) = panic_info.payload().downcast_ref::<&str>() {
            s.to_string()
        } else if let Some(s) = panic_info.payload().downcast_ref::<String>() {
            s.clone()
        } else {
            "Unknown panic payload".to_string()
        };
        let location = panic_info
            .location()
            .map(|l| format!("{}:{}:{}", l.file(), l.line(), l.column()))
            .unwrap_or_else(|| "Unknown location".to_string());
        let backtrace = format!("{:?}", std::backtrace::Backtrace::capture());

        let report = format_report(
            "PLUGIN PANIC",
            &[
                ("Location", &location),
                ("Message", &payload),
                ("Backtrace", &backtrace),
            ],
        );

        if is_sentry_enabled() {
            sentry::capture_message(&report, sentry::Level::Fatal);
        }
        if let Err(e) = append_crash_log(&report) {
            error!("[CRASH LOGGER] Failed to write crash log: {}", e);
        }
        error!("{}", report);
    }));

    info!("[CRASH LOGGER] Initialized - Log: {:?}", log_path);
}

/// Record an error that ends the session, without panicking.
pub fn log_critical_error(context: &str, error: &str) {
    let report = format_report("CRITICAL ERROR", &[("Context", context), ("Error", error)]);

    if is_sentry_enabled() {
        sentry::with_scope(
            |scope| {
                scope.set_tag("context", context);
                scope.set_level(Some(sentry::Level::Fatal));
            },
            || {
                sentry::capture_message(
                    &format!("[CRITICAL] {}: {}", context, error),
                    sentry::Level::Fatal,
                );
            },
        );
    }

    if let Err(e) = append_crash_log(&report) {
        error!("[CRASH LOGGER] Failed to write critical error: {}", e);
    }
    error!("{}", report);
}

pub fn crash_log_path() -> Option<PathBuf> {
    locked(&CRASH_LOG_PATH).clone()
}

fn format_report(title: &str, fields: &[(&str, &str)]) -> String {
    let timestamp = chrono::Local::now().format("%Y-%m-%d %H:%M:%S%.3f");
    let mut report = format!("\n===== {} =====\nTimestamp: {}\n", title, timestamp);
    for (name, value) in fields {
        if value.contains('\n') {
            report.push_str(&format!("{}:\n{}\n", name, value));
        } else {
            report.push_str(&format!("{}: {}\n", name, value));
        }
    }
    report.push_str(&format!(
        "Thread: {:?}\n",
        std::thread::current().name().unwrap_or("unnamed")
    ));
    report
}

fn append_crash_log(message: &str) -> std::io::Result<()> {
    if let Some(path) = crash_log_path() {
        let mut file = OpenOptions::new().create(true).append(true).open(path)?;
        writeln!(file, "{}", message)?;
    }
    Ok(())
}
