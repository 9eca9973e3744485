//! Subscriber setup for binaries and tests.
//!
//! Library code logs through the `log` facade and opens `tracing` spans;
//! [`init`] installs one subscriber that receives both.

use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};

use serde::{Deserialize, Serialize};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::{fmt, EnvFilter, Registry};

use crate::error::LoggingError;

pub const LOG_ENV_VAR: &str = "DOCINGEST_LOG";
const DEFAULT_FILTER: &str = "info";

static INITIALIZED: AtomicBool = AtomicBool::new(false);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

impl FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "text" => Ok(LogFormat::Text),
            "json" => Ok(LogFormat::Json),
            other => Err(format!("unknown log format '{}'", other)),
        }
    }
}

/// The filter directive in effect: `DOCINGEST_LOG`, then `RUST_LOG`, then
/// `info`.
pub fn filter_directive() -> String {
    std::env::var(LOG_ENV_VAR)
        .ok()
        .filter(|v| !v.trim().is_empty())
        .or_else(|| {
            std::env::var("RUST_LOG")
                .ok()
                .filter(|v| !v.trim().is_empty())
        })
        .unwrap_or_else(|| DEFAULT_FILTER.to_string())
}

/// Installs the global subscriber. Calling it again is a no-op.
pub fn init(format: LogFormat) -> Result<(), LoggingError> {
    if INITIALIZED.swap(true, Ordering::SeqCst) {
        return Ok(());
    }

    let directive = filter_directive();
    let filter = EnvFilter::try_new(&directive).map_err(|e| {
        INITIALIZED.store(false, Ordering::SeqCst);
        LoggingError::InvalidFilter {
            filter: directive.clone(),
            reason: e.to_string(),
        }
    })?;

    let installed = match format {
        LogFormat::Text => tracing::subscriber::set_global_default(
            Registry::default()
                .with(filter)
                .with(fmt::layer().with_target(true).with_writer(std::io::stderr)),
        ),
        LogFormat::Json => tracing::subscriber::set_global_default(
            Registry::default()
                .with(filter)
                .with(fmt::layer().json().with_current_span(true).with_writer(std::io::stderr)),
        ),
    };
    installed.map_err(|e| LoggingError::Install(e.to_string()))?;

    // Another logger may already own the `log` facade (an embedding host);
    // spans and tracing events still reach the subscriber then.
    if let Err(e) = tracing_log::LogTracer::init() {
        tracing::debug!("log bridge not installed: {}", e);
    }

    log::debug!("Logging initialized ({:?}, filter '{}')", format, directive);
    Ok(())
}
