//! Process signals: TERM and INT stop the agent, HUP is ignored, USR1 and
//! USR2 step the log level up and down.

use std::io;
use std::sync::Arc;

use tokio::signal::unix::{SignalKind, signal};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::logging::LogControl;

/// Install the handlers and run them on a background task until a stop
/// signal arrives or `stop` is cancelled elsewhere.
pub fn spawn(stop: CancellationToken, log: Arc<LogControl>) -> io::Result<JoinHandle<()>> {
    let mut term = signal(SignalKind::terminate())?;
    let mut int = signal(SignalKind::interrupt())?;
    let mut hup = signal(SignalKind::hangup())?;
    let mut usr1 = signal(SignalKind::user_defined1())?;
    let mut usr2 = signal(SignalKind::user_defined2())?;

    Ok(tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = stop.cancelled() => break,
                _ = term.recv() => {
                    info!(signal = "SIGTERM", "shutdown requested");
                    stop.cancel();
                    break;
                }
                _ = int.recv() => {
                    info!(signal = "SIGINT", "shutdown requested");
                    stop.cancel();
                    break;
                }
                _ = hup.recv() => debug!(signal = "SIGHUP", "ignored"),
                _ = usr1.recv() => {
                    log.raise();
                }
                _ = usr2.recv() => {
                    log.lower();
                }
            }
        }
    }))
}
