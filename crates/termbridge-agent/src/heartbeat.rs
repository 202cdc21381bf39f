//! Periodic health report: resource percentages plus the live session
//! count, sent every 30 seconds with an immediate first beat.

use libtermbridge::{system, Messenger, SessionManager};
use std::sync::Arc;
use std::time::Duration;
use termbridge_protocol::AgentEvent;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

pub async fn run(
    link: Arc<dyn Messenger>,
    machine_id: String,
    manager: Arc<SessionManager>,
    cancel: CancellationToken,
) {
    info!(interval_secs = HEARTBEAT_INTERVAL.as_secs(), "heartbeat started");
    let mut ticker = tokio::time::interval(HEARTBEAT_INTERVAL);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                info!("heartbeat stopped");
                return;
            }
            _ = ticker.tick() => {
                beat(link.as_ref(), &machine_id, &manager).await;
            }
        }
    }
}

async fn beat(link: &dyn Messenger, machine_id: &str, manager: &SessionManager) {
    // The CPU sample blocks for ~200ms; keep it off the runtime workers.
    // A failed sample degrades to zeros rather than skipping the beat.
    let metrics = tokio::task::spawn_blocking(system::collect)
        .await
        .unwrap_or_default();

    let msg = AgentEvent::Heartbeat {
        machine_id: machine_id.to_string(),
        cpu: metrics.cpu,
        memory: metrics.memory,
        disk: metrics.disk,
        session_count: manager.count(),
    };
    match serde_json::to_value(&msg) {
        Ok(value) => {
            if let Err(err) = link.send_json(value) {
                warn!(%err, "heartbeat send failed");
            } else {
                debug!(
                    cpu = metrics.cpu,
                    memory = metrics.memory,
                    disk = metrics.disk,
                    sessions = manager.count(),
                    "heartbeat sent"
                );
            }
        }
        Err(err) => warn!(%err, "heartbeat encode failed"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Value;
    use std::sync::Mutex;

    #[derive(Default)]
    struct CollectingMessenger {
        sent: Mutex<Vec<Value>>,
    }

    impl Messenger for CollectingMessenger {
        fn send_json(&self, payload: Value) -> libtermbridge::Result<()> {
            self.sent.lock().unwrap().push(payload);
            Ok(())
        }
    }

    #[tokio::test]
    async fn first_beat_is_immediate_and_carries_identity() {
        let messenger = Arc::new(CollectingMessenger::default());
        let manager = Arc::new(SessionManager::new(messenger.clone()));
        let cancel = CancellationToken::new();

        let task = tokio::spawn(run(
            messenger.clone(),
            "machine-1".to_string(),
            manager,
            cancel.clone(),
        ));

        // Immediate beat, modulo the blocking metrics sample.
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        loop {
            if !messenger.sent.lock().unwrap().is_empty() {
                break;
            }
            assert!(
                tokio::time::Instant::now() < deadline,
                "no heartbeat before deadline"
            );
            tokio::time::sleep(Duration::from_millis(25)).await;
        }

        cancel.cancel();
        task.await.unwrap();

        let sent = messenger.sent.lock().unwrap();
        let beat = &sent[0];
        assert_eq!(beat["type"], "heartbeat");
        assert_eq!(beat["machineId"], "machine-1");
        assert_eq!(beat["sessionCount"], 0);
        assert!(beat["cpu"].is_number());
        assert!(beat["memory"].is_number());
        assert!(beat["disk"].is_number());
    }

    #[tokio::test]
    async fn send_failure_does_not_stop_the_ticker() {
        struct FailingMessenger;
        impl Messenger for FailingMessenger {
            fn send_json(&self, _payload: Value) -> libtermbridge::Result<()> {
                Err(libtermbridge::BridgeError::SendBufferFull)
            }
        }

        let messenger = Arc::new(FailingMessenger);
        let manager = Arc::new(SessionManager::new(messenger.clone()));
        let cancel = CancellationToken::new();

        let task = tokio::spawn(run(
            messenger,
            "machine-1".to_string(),
            manager,
            cancel.clone(),
        ));
        tokio::time::sleep(Duration::from_millis(600)).await;
        assert!(!task.is_finished(), "ticker must survive send failures");

        cancel.cancel();
        task.await.unwrap();
    }
}
