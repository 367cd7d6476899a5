use crossbeam_channel::{Receiver, Sender, TrySendError, bounded};
use log::debug;
use parking_lot::Mutex;

use crate::record::DataRecord;
use crate::types::SamplingState;

/// Events per subscriber held before new ones are dropped
const EVENT_QUEUE_CAPACITY: usize = 1024;

/// Notifications pushed to observers
#[derive(Debug, Clone)]
pub enum SamplerEvent {
    StateChanged(SamplingState),
    PositionSampled(DataRecord),
    PositionFailed {
        x_steps: i32,
        y_steps: i32,
        reason: String,
    },
    /// Free-text progress, e.g. the Froude number and chosen duration
    Status(String),
}

/// Fan-out to any number of channel subscribers. Sends never block: a full
/// queue drops the event, a disconnected receiver is forgotten.
#[derive(Default)]
pub(crate) struct EventBus {
    subscribers: Mutex<Vec<Sender<SamplerEvent>>>,
}

impl EventBus {
    pub fn subscribe(&self) -> Receiver<SamplerEvent> {
        let (tx, rx) = bounded(EVENT_QUEUE_CAPACITY);
        self.subscribers.lock().push(tx);
        rx
    }

    pub fn emit(&self, event: SamplerEvent) {
        self.subscribers
            .lock()
            .retain(|tx| match tx.try_send(event.clone()) {
                Ok(()) => true,
                Err(TrySendError::Full(_)) => {
                    debug!("Event queue full, dropping event");
                    true
                }
                Err(TrySendError::Disconnected(_)) => false,
            });
    }

    #[cfg(test)]
    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().len()
    }
}
