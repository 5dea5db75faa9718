//! Hook for clearing user-facing notifications.
//!
//! When a conversation is deleted or a group is left, any pending system
//! notifications for that thread must go away too. The embedding app plugs
//! in its platform notifier here; the chat layer only fires the hook.

use satchel_shared::ThreadId;

pub trait NotificationSink: Send + Sync {
    /// Drop any pending notifications for `thread_id`. Fire-and-forget:
    /// failures are the sink's problem, not the caller's.
    fn clear_thread(&self, thread_id: &ThreadId);
}

/// Sink that ignores everything. Used by tests and headless deployments.
#[derive(Default)]
pub struct NoopNotifications;

impl NotificationSink for NoopNotifications {
    fn clear_thread(&self, _thread_id: &ThreadId) {}
}
