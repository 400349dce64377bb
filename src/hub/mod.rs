// Realtime Hub - admin/display session registry, state-delta fan-out, and
// one-shot command delivery to the single session per display.

use std::collections::{HashMap, HashSet, VecDeque};

use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

use crate::services::displays;
use crate::services::playback::{DisplayCommand, StateDelta};

/// Pending commands kept for a connected-but-quiet display session.
const PENDING_COMMAND_CAP: usize = 16;

/// Messages arriving on the realtime channel.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ClientMessage {
    #[serde(rename_all = "camelCase")]
    RegisterAdmin {
        admin_id: String,
        displays: Vec<String>,
    },
    RegisterDisplay {
        code: String,
    },
    #[serde(rename_all = "camelCase")]
    Heartbeat {
        code: String,
        #[serde(default)]
        video_progress: Option<f64>,
    },
    VideoEnded {
        code: String,
    },
}

/// Messages pushed to connected sessions.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ServerMessage {
    StateDelta {
        #[serde(flatten)]
        delta: StateDelta,
    },
    Command {
        command: DisplayCommand,
    },
    /// A newer session claimed this display.
    Displaced,
    #[serde(rename_all = "camelCase")]
    DisplayStatus {
        code: String,
        is_online: bool,
    },
    #[serde(rename_all = "camelCase")]
    CommandStatus {
        code: String,
        status: CommandDelivery,
        #[serde(skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CommandDelivery {
    Delivered,
    Undelivered,
    Failed,
}

struct AdminSession {
    admin_id: String,
    watched: HashSet<String>,
    tx: UnboundedSender<ServerMessage>,
}

struct DisplaySession {
    session_id: u64,
    tx: UnboundedSender<ServerMessage>,
    pending: VecDeque<DisplayCommand>,
}

#[derive(Default)]
struct HubState {
    admins: HashMap<u64, AdminSession>,
    displays: HashMap<String, DisplaySession>,
    // Last broadcast liveness per display, for edge-triggered status events
    online: HashMap<String, bool>,
    next_session_id: u64,
}

/// In-memory membership table. Many subscribers, occasional membership
/// edits, hence the reader-writer lock.
#[derive(Default)]
pub struct Hub {
    state: RwLock<HubState>,
}

impl Hub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an admin session watching a set of displays. Returns the
    /// session id and the receiving end of its message stream.
    pub async fn register_admin(
        &self,
        admin_id: &str,
        watched: Vec<String>,
    ) -> (u64, UnboundedReceiver<ServerMessage>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut state = self.state.write().await;
        state.next_session_id += 1;
        let session_id = state.next_session_id;
        state.admins.insert(
            session_id,
            AdminSession {
                admin_id: admin_id.to_string(),
                watched: watched.into_iter().collect(),
                tx,
            },
        );
        tracing::debug!("Admin {} registered (session {})", admin_id, session_id);
        (session_id, rx)
    }

    /// Register the display's session. Exactly one session per display: a
    /// later registration displaces the earlier one, which is told so.
    /// Pending commands queued while no session was attached flush
    /// immediately.
    pub async fn register_display(&self, code: &str) -> (u64, UnboundedReceiver<ServerMessage>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut state = self.state.write().await;
        state.next_session_id += 1;
        let session_id = state.next_session_id;

        let pending = match state.displays.remove(code) {
            Some(old) => {
                let _ = old.tx.send(ServerMessage::Displaced);
                tracing::info!(
                    "Display {} session {} displaced by {}",
                    code,
                    old.session_id,
                    session_id
                );
                old.pending
            }
            None => VecDeque::new(),
        };

        for command in &pending {
            let _ = tx.send(ServerMessage::Command {
                command: command.clone(),
            });
        }

        state.displays.insert(
            code.to_string(),
            DisplaySession {
                session_id,
                tx,
                pending: VecDeque::new(),
            },
        );
        (session_id, rx)
    }

    /// Drop an admin subscription.
    pub async fn unregister_admin(&self, session_id: u64) {
        let mut state = self.state.write().await;
        if let Some(session) = state.admins.remove(&session_id) {
            tracing::debug!(
                "Admin {} unregistered (session {})",
                session.admin_id,
                session_id
            );
        }
    }

    /// Drop the display session, unless a newer session already took over.
    pub async fn unregister_display(&self, code: &str, session_id: u64) {
        let mut state = self.state.write().await;
        let owned = state
            .displays
            .get(code)
            .map(|s| s.session_id == session_id)
            .unwrap_or(false);
        if owned {
            state.displays.remove(code);
        }
    }

    /// Fan a state delta out to every admin watching the display.
    pub async fn broadcast(&self, delta: &StateDelta) {
        let state = self.state.read().await;
        for session in state.admins.values() {
            if session.watched.contains(&delta.code) {
                let _ = session.tx.send(ServerMessage::StateDelta {
                    delta: delta.clone(),
                });
            }
        }
    }

    /// Tell watchers a display's liveness changed.
    pub async fn broadcast_display_status(&self, code: &str, is_online: bool) {
        let state = self.state.read().await;
        for session in state.admins.values() {
            if session.watched.contains(code) {
                let _ = session.tx.send(ServerMessage::DisplayStatus {
                    code: code.to_string(),
                    is_online,
                });
            }
        }
    }

    /// Tell watchers how a command attempt went.
    pub async fn broadcast_command_status(
        &self,
        code: &str,
        status: CommandDelivery,
        reason: Option<String>,
    ) {
        let state = self.state.read().await;
        for session in state.admins.values() {
            if session.watched.contains(code) {
                let _ = session.tx.send(ServerMessage::CommandStatus {
                    code: code.to_string(),
                    status,
                    reason: reason.clone(),
                });
            }
        }
    }

    /// Forward a command to the display's session. `display_fresh` reflects
    /// heartbeat recency; a stale display drops the command as undelivered.
    pub async fn deliver_command(
        &self,
        code: &str,
        command: &DisplayCommand,
        display_fresh: bool,
    ) -> CommandDelivery {
        let mut state = self.state.write().await;
        match state.displays.get_mut(code) {
            Some(session) => {
                let sent = session
                    .tx
                    .send(ServerMessage::Command {
                        command: command.clone(),
                    })
                    .is_ok();
                if sent {
                    CommandDelivery::Delivered
                } else {
                    CommandDelivery::Undelivered
                }
            }
            None if display_fresh => {
                // The display pinged recently but its channel is between
                // sessions; hold the command for the reconnect.
                let entry = state
                    .displays
                    .entry(code.to_string())
                    .or_insert_with(|| DisplaySession {
                        session_id: 0,
                        tx: mpsc::unbounded_channel().0,
                        pending: VecDeque::new(),
                    });
                if entry.pending.len() == PENDING_COMMAND_CAP {
                    entry.pending.pop_front();
                }
                entry.pending.push_back(command.clone());
                CommandDelivery::Delivered
            }
            None => CommandDelivery::Undelivered,
        }
    }

    /// Record a heartbeat-driven liveness observation; returns the previous
    /// value so callers can broadcast transitions.
    pub async fn note_liveness(&self, code: &str, is_online: bool) -> Option<bool> {
        let mut state = self.state.write().await;
        state.online.insert(code.to_string(), is_online)
    }
}

/// Background sweep: derive liveness from heartbeat recency and broadcast
/// transitions to watchers. Runs once per heartbeat interval.
pub async fn run_liveness_sweeper(pool: SqlitePool, hub: std::sync::Arc<Hub>, cancel: CancellationToken) {
    let interval = std::time::Duration::from_secs(1);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                tracing::debug!("Liveness sweeper stopping");
                break;
            }
            _ = tokio::time::sleep(interval) => {
                let all = match displays::list_displays(&pool).await {
                    Ok(all) => all,
                    Err(e) => {
                        tracing::warn!("Liveness sweep failed to list displays: {}", e);
                        continue;
                    }
                };
                for disp in all {
                    let is_online = displays::is_online(&disp);
                    let previous = hub.note_liveness(&disp.code, is_online).await;
                    if previous != Some(is_online) {
                        if previous.is_some() || !is_online {
                            tracing::info!(
                                "Display {} is now {}",
                                disp.code,
                                if is_online { "online" } else { "offline" }
                            );
                        }
                        hub.broadcast_display_status(&disp.code, is_online).await;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn delta(code: &str) -> StateDelta {
        StateDelta {
            code: code.to_string(),
            playback_state: "paused".to_string(),
            muted: false,
            timeline_position: 0,
            is_online: true,
            loop_count: 0,
            playlist_id: None,
            playlist_empty: false,
            current_video: None,
            current_block: None,
            video_progress: None,
        }
    }

    #[tokio::test]
    async fn test_broadcast_reaches_all_watchers() {
        let hub = Hub::new();
        let (_x, mut rx_x) = hub.register_admin("admin-x", vec!["ABC123".to_string()]).await;
        let (_y, mut rx_y) = hub.register_admin("admin-y", vec!["ABC123".to_string()]).await;
        let (_z, mut rx_z) = hub.register_admin("admin-z", vec!["OTHER1".to_string()]).await;

        hub.broadcast(&delta("ABC123")).await;

        for rx in [&mut rx_x, &mut rx_y] {
            match rx.recv().await.unwrap() {
                ServerMessage::StateDelta { delta } => {
                    assert_eq!(delta.code, "ABC123");
                    assert_eq!(delta.playback_state, "paused");
                }
                other => panic!("unexpected message {:?}", other),
            }
        }
        // The non-watcher got nothing
        assert!(rx_z.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_register_display_displaces_previous() {
        let hub = Hub::new();
        let (first_id, mut first_rx) = hub.register_display("ABC123").await;
        let (second_id, _second_rx) = hub.register_display("ABC123").await;
        assert_ne!(first_id, second_id);

        match first_rx.recv().await.unwrap() {
            ServerMessage::Displaced => {}
            other => panic!("expected Displaced, got {:?}", other),
        }

        // The displaced session closing must not evict the new one
        hub.unregister_display("ABC123", first_id).await;
        let status = hub
            .deliver_command("ABC123", &DisplayCommand::Pause, true)
            .await;
        assert_eq!(status, CommandDelivery::Delivered);
    }

    #[tokio::test]
    async fn test_deliver_command_to_session() {
        let hub = Hub::new();
        let (_id, mut rx) = hub.register_display("ABC123").await;

        let status = hub
            .deliver_command("ABC123", &DisplayCommand::SetMuted { muted: true }, true)
            .await;
        assert_eq!(status, CommandDelivery::Delivered);

        match rx.recv().await.unwrap() {
            ServerMessage::Command { command } => {
                assert_eq!(command, DisplayCommand::SetMuted { muted: true });
            }
            other => panic!("unexpected message {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_stale_display_drops_command() {
        let hub = Hub::new();
        let status = hub
            .deliver_command("ABC123", &DisplayCommand::Play, false)
            .await;
        assert_eq!(status, CommandDelivery::Undelivered);
    }

    #[tokio::test]
    async fn test_unregister_admin_stops_fanout() {
        let hub = Hub::new();
        let (id, mut rx) = hub.register_admin("admin-x", vec!["ABC123".to_string()]).await;
        hub.unregister_admin(id).await;
        hub.broadcast(&delta("ABC123")).await;
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_client_message_parsing() {
        let msg: ClientMessage = serde_json::from_str(
            r#"{"type":"registerAdmin","adminId":"a1","displays":["ABC123"]}"#,
        )
        .unwrap();
        assert!(matches!(msg, ClientMessage::RegisterAdmin { .. }));

        let msg: ClientMessage =
            serde_json::from_str(r#"{"type":"heartbeat","code":"ABC123","videoProgress":0.4}"#)
                .unwrap();
        match msg {
            ClientMessage::Heartbeat {
                code,
                video_progress,
            } => {
                assert_eq!(code, "ABC123");
                assert_eq!(video_progress, Some(0.4));
            }
            other => panic!("unexpected {:?}", other),
        }
    }
}
