// Interface to the background upload queue owned by the job server client.
// The paging logger hands every closed page file to this queue; the queue
// drains uploads on its own schedule and deletes the source file when asked.

use std::path::Path;
use uuid::Uuid;

/// Artifact type for timeline log attachments.
pub const TIMELINE_LOG_FILE_TYPE: &str = "DistributedTask.Core.Log";

/// Attachment name used for tool log pages.
pub const CUSTOM_TOOL_LOG_NAME: &str = "CustomToolLog";

/// Consumer of finished files that should be uploaded to the server.
///
/// Enqueueing must be cheap and non-blocking; the implementation owns
/// ordering (files are uploaded in the order they are enqueued) and the
/// deletion of sources after successful upload when `delete_source` is set.
pub trait JobServerQueue: Send + Sync {
    /// Queue `path` for upload as an attachment of the given timeline record.
    fn queue_file_upload(
        &self,
        timeline_id: Uuid,
        timeline_record_id: Uuid,
        file_type: &str,
        name: &str,
        path: &Path,
        delete_source: bool,
    );
}
