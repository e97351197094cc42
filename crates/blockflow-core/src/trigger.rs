use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::{debug, warn};

use crate::event::EventBus;
use crate::types::{FlowEvent, Outputs};

/// Handle a subscribed block uses to report trigger firings.
///
/// Firing never blocks the listener. When the receiving side is busy and
/// its buffer is full the firing is dropped and reported as skipped.
#[derive(Clone)]
pub struct TriggerSink {
    agent_id: String,
    node_id: String,
    tx: mpsc::Sender<Outputs>,
    event_bus: Option<Arc<EventBus>>,
}

impl TriggerSink {
    pub fn new(
        agent_id: impl Into<String>,
        node_id: impl Into<String>,
        tx: mpsc::Sender<Outputs>,
    ) -> Self {
        Self {
            agent_id: agent_id.into(),
            node_id: node_id.into(),
            tx,
            event_bus: None,
        }
    }

    pub fn with_event_bus(mut self, event_bus: Arc<EventBus>) -> Self {
        self.event_bus = Some(event_bus);
        self
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    /// Report one trigger event. Returns `false` if it was dropped.
    pub fn fire(&self, outputs: Outputs) -> bool {
        match self.tx.try_send(outputs) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                debug!(
                    agent_id = %self.agent_id,
                    node_id = %self.node_id,
                    "Trigger busy, dropping firing"
                );
                self.report_skipped();
                false
            }
            Err(TrySendError::Closed(_)) => {
                warn!(
                    agent_id = %self.agent_id,
                    node_id = %self.node_id,
                    "Trigger fired after teardown, ignoring"
                );
                false
            }
        }
    }

    /// Whether the subscription behind this sink has been torn down.
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    pub(crate) fn report_skipped(&self) {
        if let Some(ref bus) = self.event_bus {
            bus.publish(FlowEvent::TriggerSkipped {
                agent_id: self.agent_id.clone(),
                node_id: self.node_id.clone(),
            });
        }
    }
}

impl std::fmt::Debug for TriggerSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TriggerSink")
            .field("agent_id", &self.agent_id)
            .field("node_id", &self.node_id)
            .field("closed", &self.tx.is_closed())
            .finish()
    }
}
