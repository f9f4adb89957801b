//! Per-plugin poller: requests a session when there is none, otherwise
//! drives the session's poll cycle on a jittered interval.

use std::sync::Arc;

use chroma_agent_core::{Message, Priority};
use tokio::sync::mpsc;
use tracing::{debug, error, info};

use crate::backoff::spread;
use crate::reader::Intake;
use crate::transport::Shared;

pub(crate) async fn run(shared: Arc<Shared>, plugin: String, intake: mpsc::UnboundedSender<Intake>) {
    let Some(poke) = shared.table.poke_handle(&plugin) else {
        return;
    };
    let interval = shared.config.poll_interval;
    let jitter = shared.config.poll_jitter;

    loop {
        if shared.stop.is_cancelled() {
            break;
        }

        let wait = match shared.table.get(&plugin).await {
            None => {
                if let Some(proposed_id) = shared.table.request_due(&plugin) {
                    info!(%plugin, %proposed_id, "requesting session");
                    shared.outbound.push(
                        Message::SessionCreateRequest {
                            plugin: plugin.clone(),
                            proposed_id,
                        },
                        Priority::High,
                    );
                }
                shared.table.request_wait(&plugin).unwrap_or(interval)
            }
            Some(session) => {
                let polled = tokio::select! {
                    biased;
                    _ = shared.stop.cancelled() => break,
                    polled = session.poll() => polled,
                };
                if let Err(e) = polled {
                    error!(%plugin, kind = %e.kind(), error = %e, "plugin failed, closing session");
                    let _ = intake.send(Intake::CloseSession {
                        plugin: plugin.clone(),
                        id: session.id().clone(),
                        reason: e.to_string(),
                    });
                }
                spread(interval, jitter)
            }
        };

        tokio::select! {
            biased;
            _ = shared.stop.cancelled() => break,
            _ = poke.notified() => {}
            _ = tokio::time::sleep(wait) => {}
        }
    }
    debug!(%plugin, "poller stopped");
}
