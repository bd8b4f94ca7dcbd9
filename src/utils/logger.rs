//! Logging setup for the engine, built on `log` + `log4rs`.
//!
//! Mirrors the layering a storage engine needs: an app log for general
//! operation, an audit log for transaction/mutation events, and a metrics
//! log for periodic counters. All three route through the standard `log`
//! macros at distinct targets (`fsx::audit`, `fsx::metrics`) so callers never
//! need to depend on `log4rs` directly.

use std::path::Path;

/// Initializes logging from the default `log4rs.yaml` in the working
/// directory, if present. Safe to call multiple times; failures are ignored
/// so a missing config file does not prevent the engine from starting.
pub fn init() {
    let _ = log4rs::init_file("log4rs.yaml", log4rs::config::Deserializers::default());
}

/// Initializes logging from a specific config file path.
pub fn init_path(path: &Path) {
    let _ = log4rs::init_file(path, log4rs::config::Deserializers::default());
}

/// Initializes rolling app/audit/metrics logs under `{base_dir}/{name}_logs/`.
///
/// # Errors
/// Returns an error if the log directory cannot be created or the appenders
/// fail to build.
pub fn init_for_engine_in(base_dir: &Path, name: &str) -> Result<(), Box<dyn std::error::Error>> {
    use log::LevelFilter;
    use log4rs::append::rolling_file::RollingFileAppender;
    use log4rs::append::rolling_file::policy::compound::{
        CompoundPolicy, roll::fixed_window::FixedWindowRoller, trigger::size::SizeTrigger,
    };
    use log4rs::config::{Appender, Config, Logger, Root};
    use log4rs::encode::pattern::PatternEncoder;
    use std::fs;

    let mut dir = base_dir.to_path_buf();
    dir.push(format!("{name}_logs"));
    fs::create_dir_all(&dir)?;
    let pattern = "{d(%Y-%m-%d %H:%M:%S%.3f)} [{l}] {t} - {m}{n}";

    let build_appender = |file_stem: &str| -> Result<RollingFileAppender, Box<dyn std::error::Error>> {
        let log_path = dir.join(format!("{file_stem}.log"));
        let roller_pattern = dir.join(format!("{file_stem}.{{}}.log"));
        let roller = FixedWindowRoller::builder().build(&roller_pattern.display().to_string(), 7)?;
        let policy = CompoundPolicy::new(Box::new(SizeTrigger::new(10 * 1024 * 1024)), Box::new(roller));
        Ok(RollingFileAppender::builder()
            .encoder(Box::new(PatternEncoder::new(pattern)))
            .build(log_path, Box::new(policy))?)
    };

    let app = build_appender(name)?;
    let audit = build_appender(&format!("{name}_audit"))?;
    let metrics = build_appender(&format!("{name}_metrics"))?;

    let config = Config::builder()
        .appender(Appender::builder().build("app", Box::new(app)))
        .appender(Appender::builder().build("audit", Box::new(audit)))
        .appender(Appender::builder().build("metrics", Box::new(metrics)))
        .logger(Logger::builder().appender("audit").additive(false).build("fsx::audit", LevelFilter::Info))
        .logger(Logger::builder().appender("metrics").additive(false).build("fsx::metrics", LevelFilter::Info))
        .build(Root::builder().appender("app").build(LevelFilter::Info))?;
    log4rs::init_config(config)?;
    Ok(())
}

/// Configure logging from environment variables if present:
/// `FSX_LOG_DIR`, `FSX_LOG_NAME` (defaults to `fsx`).
pub fn configure_from_env() {
    let dir = std::env::var("FSX_LOG_DIR").ok().map(std::path::PathBuf::from);
    let name = std::env::var("FSX_LOG_NAME").unwrap_or_else(|_| "fsx".to_string());
    if let Some(dir) = dir {
        let _ = init_for_engine_in(&dir, &name);
    } else {
        init();
    }
}
