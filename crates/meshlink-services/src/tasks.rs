//! Task header relay between peers and the local task coordinator.

use serde_json::Value;

use meshlink_core::{PeerMessage, TaskHeader};

use crate::error::OverlayError;
use crate::service::OverlayService;

impl OverlayService {
    /// Our coordinator's headers, as answered to a get-tasks request.
    pub(crate) fn tasks_message(&self) -> Option<PeerMessage> {
        let tasks = self.tasks.as_ref()?;
        let headers = tasks
            .task_headers()
            .into_iter()
            .filter_map(|h| serde_json::to_value(h).ok())
            .collect();
        Some(PeerMessage::Tasks { headers })
    }

    /// Point a header at the owner's session address when we are connected to it.
    pub fn change_address(&self, header: &mut TaskHeader) {
        if let Some(owner) = self.registry.lookup(&header.client_id) {
            header.address = owner.address.clone();
            header.port = owner.port;
        }
    }

    pub fn add_task_header(&mut self, mut header: TaskHeader) -> Result<(), OverlayError> {
        self.change_address(&mut header);
        let Some(tasks) = self.tasks.as_mut() else {
            return Ok(());
        };
        tasks
            .add_task_header(header)
            .map_err(|e| OverlayError::TaskHeaderRejected(e.to_string()))
    }

    /// Feed a tasks list from the wire. Bad or rejected headers are skipped.
    pub(crate) fn add_task_headers_from_list(&mut self, headers: Vec<Value>) {
        for entry in headers {
            let header: TaskHeader = match serde_json::from_value(entry) {
                Ok(header) => header,
                Err(e) => {
                    tracing::warn!(error = %e, "wrong task representation");
                    continue;
                }
            };
            let task_id = header.task_id.clone();
            if let Err(e) = self.add_task_header(header) {
                tracing::warn!(task = %task_id, error = %e, "task header not added");
            }
        }
    }

    pub fn remove_task_header(&mut self, task_id: &str) {
        if let Some(tasks) = self.tasks.as_mut() {
            tasks.remove_task_header(task_id);
        }
    }

    /// Tell every active peer a task is gone.
    pub fn remove_task(&self, task_id: &str) -> usize {
        self.broadcast(PeerMessage::RemoveTask {
            task_id: task_id.to_string(),
        })
    }
}
