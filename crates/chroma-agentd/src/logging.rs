//! Subscriber setup and runtime verbosity control.
//!
//! The filter sits behind a reload handle so the signal task can step the
//! global level up or down without restarting the agent.

use std::sync::Mutex;

use clap::ValueEnum;
use tracing::info;
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Registry, fmt, reload};

const DEFAULT_DIRECTIVES: &str = "info,chroma_agent=debug";

/// Least to most verbose.
const LADDER: [LevelFilter; 5] = [
    LevelFilter::ERROR,
    LevelFilter::WARN,
    LevelFilter::INFO,
    LevelFilter::DEBUG,
    LevelFilter::TRACE,
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

/// One step more verbose, saturating at TRACE.
pub fn louder(level: LevelFilter) -> LevelFilter {
    let at = LADDER.iter().position(|l| *l == level).unwrap_or(2);
    LADDER[(at + 1).min(LADDER.len() - 1)]
}

/// One step less verbose, saturating at ERROR.
pub fn quieter(level: LevelFilter) -> LevelFilter {
    let at = LADDER.iter().position(|l| *l == level).unwrap_or(2);
    LADDER[at.saturating_sub(1)]
}

pub struct LogControl {
    handle: reload::Handle<EnvFilter, Registry>,
    level: Mutex<LevelFilter>,
}

impl std::fmt::Debug for LogControl {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LogControl")
            .field("level", &self.level())
            .finish_non_exhaustive()
    }
}

impl LogControl {
    pub fn new(handle: reload::Handle<EnvFilter, Registry>, level: LevelFilter) -> Self {
        Self {
            handle,
            level: Mutex::new(level),
        }
    }

    pub fn level(&self) -> LevelFilter {
        *self.level.lock().unwrap_or_else(|p| p.into_inner())
    }

    pub fn raise(&self) -> LevelFilter {
        self.step(louder)
    }

    pub fn lower(&self) -> LevelFilter {
        self.step(quieter)
    }

    fn step(&self, next: fn(LevelFilter) -> LevelFilter) -> LevelFilter {
        let mut level = self.level.lock().unwrap_or_else(|p| p.into_inner());
        let wanted = next(*level);
        match self
            .handle
            .reload(EnvFilter::default().add_directive(wanted.into()))
        {
            Ok(()) => {
                *level = wanted;
                info!(level = %wanted, "log level changed");
            }
            Err(e) => eprintln!("chroma-agent: cannot change log level: {e}"),
        }
        *level
    }
}

/// Install the global subscriber, writing to stderr so stdout stays free for
/// command output. `RUST_LOG` overrides the default filter until the first
/// level change.
pub fn init(format: LogFormat) -> anyhow::Result<LogControl> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(DEFAULT_DIRECTIVES));
    let (filter, handle) = reload::Layer::new(filter);

    let registry = tracing_subscriber::registry().with(filter);
    match format {
        LogFormat::Text => registry
            .with(fmt::layer().with_writer(std::io::stderr))
            .try_init()?,
        LogFormat::Json => registry
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .try_init()?,
    }
    Ok(LogControl::new(handle, LevelFilter::INFO))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ladder_saturates_at_both_ends() {
        assert_eq!(louder(LevelFilter::INFO), LevelFilter::DEBUG);
        assert_eq!(louder(LevelFilter::TRACE), LevelFilter::TRACE);
        assert_eq!(quieter(LevelFilter::WARN), LevelFilter::ERROR);
        assert_eq!(quieter(LevelFilter::ERROR), LevelFilter::ERROR);
    }

    #[test]
    fn control_reloads_a_live_filter() {
        let (layer, handle) = reload::Layer::new(EnvFilter::new("info"));
        let _subscriber = tracing_subscriber::registry().with(layer);
        let control = LogControl::new(handle, LevelFilter::INFO);

        assert_eq!(control.raise(), LevelFilter::DEBUG);
        assert_eq!(control.raise(), LevelFilter::TRACE);
        assert_eq!(control.lower(), LevelFilter::DEBUG);
        assert_eq!(control.level(), LevelFilter::DEBUG);
    }
}
