//! Heartbeat ingestion.
//!
//! Workload agents publish `server-heartbeat` messages. The listener writes
//! each one onto its instance record and refreshes the instance's heartbeat
//! key on the bus, which is what turns a provisional record into a live one.

use std::sync::Arc;

use fleet_bus::{BusError, BusMessage, BusResult, Handler, MessageBus, Subscription, channels};
use fleet_state::{Heartbeat, PlayerData, StateStore};
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// The message an agent publishes for `beat`.
pub fn heartbeat_message(beat: &Heartbeat) -> BusMessage {
    BusMessage::ServerHeartbeat {
        instance_id: beat.instance_id.clone(),
        ram_usage: beat.ram_usage,
        port: beat.port.unwrap_or(0),
        tps_centi: (beat.tps.max(0.0) * 100.0).round() as u32,
        joinable: beat.joinable,
        players: beat
            .online_players
            .iter()
            .map(|p| (p.id.clone(), p.name.clone()))
            .collect(),
    }
}

pub fn heartbeat_from_message(message: BusMessage) -> Option<Heartbeat> {
    match message {
        BusMessage::ServerHeartbeat {
            instance_id,
            ram_usage,
            port,
            tps_centi,
            joinable,
            players,
        } => Some(Heartbeat {
            instance_id,
            ram_usage,
            port: (port != 0).then_some(port),
            tps: f64::from(tps_centi) / 100.0,
            online_players: players
                .into_iter()
                .map(|(id, name)| PlayerData { id, name })
                .collect(),
            joinable,
        }),
        _ => None,
    }
}

/// Applies agent heartbeats from the bus to the state store.
///
/// The bus callback only enqueues; a single task owns the store writes.
/// Dropping the listener unsubscribes and stops the task.
pub struct HeartbeatListener {
    _subscription: Subscription,
    task: JoinHandle<()>,
}

impl HeartbeatListener {
    pub fn start(bus: Arc<dyn MessageBus>, state: StateStore) -> BusResult<Self> {
        let runtime = Handle::try_current().map_err(|_| BusError::NoRuntime)?;
        let (tx, mut rx) = mpsc::unbounded_channel::<Heartbeat>();
        let handler: Handler = Arc::new(move |message| {
            if let Some(beat) = heartbeat_from_message(message) {
                let _ = tx.send(beat);
            }
        });
        let subscription = bus.subscribe(channels::SERVER_HEARTBEAT, handler)?;

        let task = runtime.spawn(async move {
            while let Some(beat) = rx.recv().await {
                apply(&state, bus.as_ref(), &beat);
            }
        });
        info!("listening for heartbeats");
        Ok(Self {
            _subscription: subscription,
            task,
        })
    }
}

impl Drop for HeartbeatListener {
    fn drop(&mut self) {
        self.task.abort();
    }
}

fn apply(state: &StateStore, bus: &dyn MessageBus, beat: &Heartbeat) {
    match state.apply_heartbeat(beat) {
        Ok(true) => {
            debug!(
                instance = %beat.instance_id,
                port = ?beat.port,
                players = beat.online_players.len(),
                "heartbeat applied"
            );
            let recorded = heartbeat_message(beat)
                .encode()
                .map_err(BusError::from)
                .and_then(|payload| bus.record_heartbeat(&beat.instance_id, payload));
            if let Err(e) = recorded {
                warn!(instance = %beat.instance_id, error = %e, "failed to refresh heartbeat key");
            }
        }
        Ok(false) => {}
        Err(e) => {
            warn!(instance = %beat.instance_id, error = %e, "failed to apply heartbeat");
        }
    }
}
