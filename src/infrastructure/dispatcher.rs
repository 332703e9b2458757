use crate::domain::error::RemoteError;
use crate::domain::models::{AppEvent, HostAction, MessageSeverity, StatusMessage};
use crate::domain::router::ActionDispatcher;
use tokio::sync::mpsc;
use tracing::{debug, info};

/// Host sink for the console harness: performs no real host call, logs the
/// action and reports it on the event feed.
pub struct ConsoleDispatcher {
    event_sender: mpsc::UnboundedSender<AppEvent>,
}

impl ConsoleDispatcher {
    pub fn new(event_sender: mpsc::UnboundedSender<AppEvent>) -> Self {
        Self { event_sender }
    }

    fn report(&self, message: String) -> Result<(), RemoteError> {
        self.event_sender
            .send(AppEvent::LogMessage(StatusMessage::new(
                message,
                MessageSeverity::Success,
            )))
            .map_err(|_| RemoteError::Dispatch)
    }
}

impl ActionDispatcher for ConsoleDispatcher {
    fn dispatch(&self, action: HostAction) -> Result<(), RemoteError> {
        info!("Host action: {}", action);
        self.report(format!("Host action: {}", action))
    }

    fn show_map_page(&self) -> Result<(), RemoteError> {
        debug!("Opening map page");
        self.report("Map page opened".to_string())
    }
}
