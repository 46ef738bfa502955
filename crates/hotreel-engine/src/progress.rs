use hotreel_core::{ProgressEvent, ProgressKind};
use tokio::sync::broadcast;
use tracing::info;
use uuid::Uuid;

const CHANNEL_CAPACITY: usize = 256;

/// Fan-out of progress events. Lagging or absent subscribers never block emitters.
#[derive(Debug, Clone)]
pub struct ProgressHub {
    sender: broadcast::Sender<ProgressEvent>,
}

impl Default for ProgressHub {
    fn default() -> Self {
        Self::new()
    }
}

impl ProgressHub {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ProgressEvent> {
        self.sender.subscribe()
    }

    pub fn emit(&self, event: ProgressEvent) {
        let job_id = event.job_id.map(|id| id.to_string()).unwrap_or_default();
        match event.kind {
            ProgressKind::Update => info!(job_id = %job_id, "{}", event.message),
            ProgressKind::Finished { success } => {
                info!(job_id = %job_id, success, "{}", event.message)
            }
        }
        // Err only means nobody is listening right now.
        let _ = self.sender.send(event);
    }

    pub fn update(&self, job_id: Option<Uuid>, message: impl Into<String>) {
        self.emit(ProgressEvent::update(job_id, message));
    }
}
