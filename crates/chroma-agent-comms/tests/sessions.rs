//! Session lifecycle against an in-memory manager: bring-up, manager
//! restart, replacement, plugin faults, outages and failsafe resends.

mod common;

use std::sync::Arc;
use std::time::Duration;

use chroma_agent_comms::{RunningTransport, Transport, TransportState};
use chroma_agent_core::AgentConfig;
use chroma_agent_plugins::{PluginRegistry, device_factory};
use common::{Counter, FakeManager, Fault, Misfire, Quiet, config, props, seqs};
use serde_json::json;
use tokio::time::Instant;

async fn start(
    manager: &Arc<FakeManager>,
    registry: PluginRegistry,
    config: AgentConfig,
) -> RunningTransport {
    Transport::new(manager.clone(), Arc::new(registry), config, props())
        .start()
        .await
        .unwrap()
}

async fn wait_for_state(transport: &RunningTransport, wanted: TransportState) {
    let mut states = transport.subscribe();
    let reached = tokio::time::timeout(
        Duration::from_secs(120),
        states.wait_for(|state| *state == wanted),
    )
    .await
    .is_ok_and(|r| r.is_ok());
    assert!(reached, "transport never reached {wanted}");
}

fn counters(names: &[&str]) -> PluginRegistry {
    names.iter().fold(PluginRegistry::new(), |registry, name| {
        registry.with_device(*name, device_factory(Counter::default))
    })
}

#[tokio::test(start_paused = true)]
async fn bring_up_requests_one_session_per_plugin() {
    let manager = FakeManager::new();
    let registry = PluginRegistry::new()
        .with_device("alpha", device_factory(Counter::default))
        .with_device("beta", device_factory(Quiet::default));
    let transport = start(&manager, registry, config()).await;

    manager
        .wait_until("a snapshot from every plugin", |m| {
            ["alpha", "beta"].iter().all(|plugin| {
                m.session(plugin)
                    .is_some_and(|id| !m.data(plugin, &id).is_empty())
            })
        })
        .await;

    for plugin in ["alpha", "beta"] {
        assert_eq!(manager.requests(plugin).len(), 1, "{plugin}");
        let id = manager.session(plugin).unwrap();
        let first = &manager.data(plugin, &id)[0];
        assert_eq!(first.session_seq, Some(0));
    }
    let alpha = manager.session("alpha").unwrap();
    assert_eq!(manager.data("alpha", &alpha)[0].body["snapshot"], true);
    assert_eq!(transport.state(), TransportState::Running);

    transport.stop(Duration::from_secs(30)).await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn manager_restart_recreates_every_session() {
    let plugins = ["a", "b", "c"];
    let manager = FakeManager::new();
    let transport = start(&manager, counters(&plugins), config()).await;

    manager
        .wait_until("steady traffic", |m| {
            plugins.iter().all(|plugin| {
                m.session(plugin)
                    .is_some_and(|id| m.data(plugin, &id).len() >= 6)
            })
        })
        .await;
    let old: Vec<String> = plugins.iter().map(|p| manager.session(p).unwrap()).collect();
    let old_proposals: Vec<_> = plugins
        .iter()
        .map(|p| manager.requests(p)[0].body["session_id"].clone())
        .collect();

    let restarted = Instant::now();
    manager.send(json!({"type": "SESSION_TERMINATE_ALL"}));

    manager
        .wait_until("new sessions with data", |m| {
            plugins.iter().zip(&old).all(|(plugin, old)| {
                m.session(plugin)
                    .is_some_and(|id| &id != old && !m.data(plugin, &id).is_empty())
            })
        })
        .await;
    assert!(restarted.elapsed() <= Duration::from_secs(15));

    for (i, plugin) in plugins.iter().enumerate() {
        let requests = manager.requests(plugin);
        assert_eq!(requests.len(), 2, "{plugin}");
        assert_ne!(requests[1].body["session_id"], old_proposals[i]);

        let id = manager.session(plugin).unwrap();
        let first = &manager.data(plugin, &id)[0];
        assert_eq!(first.session_seq, Some(0));
        assert_eq!(first.body["snapshot"], true);
    }
    wait_for_state(&transport, TransportState::Running).await;

    transport.stop(Duration::from_secs(30)).await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn terminating_one_session_leaves_the_others() {
    let manager = FakeManager::new();
    let transport = start(&manager, counters(&["a", "b"]), config()).await;

    manager
        .wait_until("both sessions", |m| {
            ["a", "b"].iter().all(|p| m.session(p).is_some_and(|id| !m.data(p, &id).is_empty()))
        })
        .await;
    let old_a = manager.session("a").unwrap();
    let b = manager.session("b").unwrap();

    manager.send(json!({
        "type": "SESSION_TERMINATE",
        "plugin": "a",
        "session_id": old_a,
    }));
    manager
        .wait_until("a fresh session for a", |m| {
            m.session("a").is_some_and(|id| id != old_a && !m.data("a", &id).is_empty())
        })
        .await;

    assert_eq!(manager.requests("b").len(), 1);
    assert_eq!(manager.session("b").unwrap(), b);
    let b_seqs = seqs(&manager.data("b", &b));
    assert_eq!(b_seqs, (0..b_seqs.len() as u64).collect::<Vec<_>>());

    transport.stop(Duration::from_secs(30)).await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn manager_replacement_restarts_the_session() {
    let manager = FakeManager::new();
    let transport = start(&manager, counters(&["alpha"]), config()).await;
    manager
        .wait_until("steady traffic", |m| {
            m.session("alpha").is_some_and(|id| m.data("alpha", &id).len() >= 3)
        })
        .await;
    let old = manager.session("alpha").unwrap();

    manager.send(json!({
        "type": "SESSION_CREATE_RESPONSE",
        "plugin": "alpha",
        "session_id": "alpha-replacement",
    }));
    manager
        .wait_until("data on the replacement", |m| {
            m.data("alpha", "alpha-replacement").len() >= 3
        })
        .await;
    let old_len = manager.data("alpha", &old).len();
    tokio::time::sleep(Duration::from_secs(10)).await;

    assert_eq!(manager.data("alpha", &old).len(), old_len, "old session went quiet");
    let data = manager.data("alpha", "alpha-replacement");
    assert_eq!(seqs(&data), (0..data.len() as u64).collect::<Vec<_>>());
    assert_eq!(data[0].body["snapshot"], true);
    assert_eq!(data[0].body["count"], 0);
    assert_eq!(manager.requests("alpha").len(), 1);

    transport.stop(Duration::from_secs(30)).await.unwrap();
}

/// Run a [`Misfire`] plugin until its fault has cost it a session and a
/// replacement session is delivering data.
async fn recovers_from_fault(plugin: &str, fault: Fault) -> Arc<FakeManager> {
    let manager = FakeManager::new();
    let config = AgentConfig {
        max_bytes_per_post: 4096,
        ..config()
    };
    let registry =
        PluginRegistry::new().with_device(plugin, device_factory(Misfire::factory(fault)));
    let transport = start(&manager, registry, config).await;

    manager
        .wait_until("the first session", |m| m.session(plugin).is_some())
        .await;
    let old = manager.session(plugin).unwrap();
    manager
        .wait_until("a replacement session with data", |m| {
            m.session(plugin)
                .is_some_and(|id| id != old && !m.data(plugin, &id).is_empty())
        })
        .await;

    let terminates = manager.terminates(plugin);
    assert_eq!(terminates.len(), 1);
    assert_eq!(terminates[0].session_id.as_deref(), Some(old.as_str()));
    assert_eq!(manager.requests(plugin).len(), 2);

    let before = seqs(&manager.data(plugin, &old));
    assert!(!before.is_empty());
    assert_eq!(before, (0..before.len() as u64).collect::<Vec<_>>());

    let new = manager.session(plugin).unwrap();
    let first = &manager.data(plugin, &new)[0];
    assert_eq!(first.session_seq, Some(0));
    assert_eq!(first.body["snapshot"], true);

    transport.stop(Duration::from_secs(30)).await.unwrap();
    manager
}

#[tokio::test(start_paused = true)]
async fn plugin_crash_reopens_the_session_from_zero() {
    recovers_from_fault("flaky", Fault::Crash).await;
}

#[tokio::test(start_paused = true)]
async fn oversized_body_costs_its_session() {
    let manager = recovers_from_fault("bulky", Fault::Payload(5000)).await;
    assert!(manager.received().iter().all(|e| !e.body.is_string()));
}

#[tokio::test(start_paused = true)]
async fn oversized_envelope_is_dropped_before_posting() {
    // The body fits, but the plugin name pushes the envelope over the limit.
    let plugin = "p".repeat(400);
    let manager = recovers_from_fault(&plugin, Fault::Payload(3400)).await;
    assert!(manager.received().iter().all(|e| !e.body.is_string()));
}

#[tokio::test(start_paused = true)]
async fn transient_outage_keeps_sequence_contiguous() {
    let manager = FakeManager::new();
    let transport = start(&manager, counters(&["alpha"]), config()).await;

    manager
        .wait_until("steady traffic", |m| {
            m.session("alpha").is_some_and(|id| m.data("alpha", &id).len() >= 5)
        })
        .await;
    let id = manager.session("alpha").unwrap();
    let before = manager.data("alpha", &id).len();

    // 1 + 2 + 4 + 8 + 16 seconds of backoff.
    manager.fail_next(5);
    wait_for_state(&transport, TransportState::Backoff).await;
    wait_for_state(&transport, TransportState::Running).await;

    manager
        .wait_until("buffered telemetry delivered", |m| {
            m.data("alpha", &id).len() >= before + 30
        })
        .await;

    let data = manager.data("alpha", &id);
    assert_eq!(seqs(&data), (0..data.len() as u64).collect::<Vec<_>>());
    let counts: Vec<u64> = data[1..]
        .iter()
        .map(|e| e.body["count"].as_u64().unwrap())
        .collect();
    assert_eq!(counts, (1..data.len() as u64).collect::<Vec<_>>());
    assert_eq!(manager.requests("alpha").len(), 1);

    transport.stop(Duration::from_secs(30)).await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn failsafe_resends_the_last_snapshot() {
    let manager = FakeManager::new();
    let config = AgentConfig {
        failsafe_threshold: 3,
        ..config()
    };
    let registry = PluginRegistry::new().with_device("quiet", device_factory(Quiet::default));
    let transport = start(&manager, registry, config).await;

    manager
        .wait_until("a failsafe resend", |m| {
            m.session("quiet").is_some_and(|id| m.data("quiet", &id).len() >= 2)
        })
        .await;

    let id = manager.session("quiet").unwrap();
    let data = manager.data("quiet", &id);
    assert_eq!(seqs(&data[..2]), vec![0, 1]);
    assert_eq!(data[1].body, data[0].body);

    transport.stop(Duration::from_secs(30)).await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn auth_rejection_resyncs_once_then_gives_up() {
    let manager = FakeManager::new();
    let transport = start(&manager, counters(&["alpha"]), config()).await;
    manager
        .wait_until("a session", |m| m.session("alpha").is_some())
        .await;
    let first = manager.session("alpha").unwrap();

    manager.reject_next(1);
    manager
        .wait_until("a new session after reauthentication", |m| {
            m.reauthentications() == 1
                && m.session("alpha").is_some_and(|id| id != first && !m.data("alpha", &id).is_empty())
        })
        .await;
    wait_for_state(&transport, TransportState::Running).await;

    manager.reject_next(2);
    let stopped = tokio::time::timeout(Duration::from_secs(60), transport.stopped()).await;
    assert!(stopped.is_ok(), "repeated auth failure must stop the transport");
    assert_eq!(transport.state(), TransportState::Stopped);
    assert!(transport.fatal_error().is_some());

    assert!(transport.stop(Duration::from_secs(30)).await.is_err());
}

#[tokio::test(start_paused = true)]
async fn stop_halts_all_traffic() {
    let manager = FakeManager::new();
    let transport = start(&manager, counters(&["alpha", "beta"]), config()).await;
    manager
        .wait_until("traffic", |m| {
            m.session("beta").is_some_and(|id| m.data("beta", &id).len() >= 3)
        })
        .await;

    let stopping = Instant::now();
    transport.stop(Duration::from_secs(30)).await.unwrap();
    assert!(stopping.elapsed() < Duration::from_secs(30));

    let posts = manager.posts();
    tokio::time::sleep(Duration::from_secs(120)).await;
    assert_eq!(manager.posts(), posts, "no request after stop");
}
