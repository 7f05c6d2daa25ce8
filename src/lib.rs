//! `tt`: a small MQTT v5 broker and client toolkit.

use std::any::Any;

use color_eyre::eyre::{self, WrapErr};
pub use color_eyre::eyre::{Error, Result};
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use crate::cli::LogFormat;

pub mod cli;
pub mod collections;
pub mod config;
pub mod mqtt;
pub mod protocol;

pub fn bootstrap(log_format: LogFormat) -> Result<()> {
    if let Err(e) = dotenvy::dotenv() {
        // Don't die if the file doesn't exist.
        if !e.not_found() {
            return Err(e).wrap_err("error reading `.env` file");
        }
    }

    // Enables capturing backtraces on stable
    color_eyre::install()?;

    let builder = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::builder()
                .with_default_directive(LevelFilter::INFO.into())
                .from_env_lossy(),
        )
        // stdout belongs to `tt sub`.
        .with_writer(std::io::stderr);

    match log_format {
        LogFormat::Full => builder.finish().try_init()?,
        LogFormat::Compact => builder.compact().finish().try_init()?,
        LogFormat::Pretty => builder.pretty().finish().try_init()?,
        LogFormat::Json => builder.json().finish().try_init()?,
    }

    Ok(())
}

pub fn map_join_error(err: tokio::task::JoinError) -> Error {
    let Ok(panic) = err.try_into_panic() else {
        return eyre::eyre!("task cancelled");
    };

    let panic_str = panic_payload_to_str(&*panic);

    eyre::eyre!("task panicked: {panic_str}")
}

/// Extract a string from a panic payload.
pub fn panic_payload_to_str<'a>(panic: &'a (dyn Any + 'static)) -> &'a str {
    // Panic payloads are almost always `String` (if made with formatting arguments)
    // or `&'static str` (if given a string literal).
    panic
        .downcast_ref::<String>()
        .map(|s| &**s)
        .or_else(|| panic.downcast_ref::<&'static str>().copied())
        .unwrap_or("(non-string payload)")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn join_errors() {
        let err = tokio::spawn(async { panic!("boom") }).await.unwrap_err();
        assert_eq!(map_join_error(err).to_string(), "task panicked: boom");

        let task = tokio::spawn(std::future::pending::<()>());
        task.abort();
        let err = task.await.unwrap_err();
        assert_eq!(map_join_error(err).to_string(), "task cancelled");
    }

    #[test]
    fn panic_payloads() {
        assert_eq!(panic_payload_to_str(&String::from("owned")), "owned");
        assert_eq!(panic_payload_to_str(&"static"), "static");
        assert_eq!(panic_payload_to_str(&42u32), "(non-string payload)");
    }
}
