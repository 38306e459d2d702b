//! Event types for Sonal

use crate::source::SourceId;

/// Notifications emitted by a context while it schedules and transitions sources.
///
/// Drained with [`SonalContext::poll_events`](crate::SonalContext::poll_events).
#[derive(Debug, Clone, PartialEq)]
pub enum SonalEvent {
    SourceStarted {
        source_id: SourceId,
    },
    SourcePaused {
        source_id: SourceId,
        offset: f64,
    },
    /// Emitted once per transition into the stopped state, including queue exhaustion.
    SourceStopped {
        source_id: SourceId,
    },
    SourceRewound {
        source_id: SourceId,
    },
    /// A looping source wrapped back to its first buffer.
    SourceLooped {
        source_id: SourceId,
    },
    ListenerChanged,
    NodeScheduleFailed {
        source_id: SourceId,
        error: String,
    },
}

impl SonalEvent {
    pub fn source_id(&self) -> Option<SourceId> {
        match self {
            Self::SourceStarted { source_id }
            | Self::SourcePaused { source_id, .. }
            | Self::SourceStopped { source_id }
            | Self::SourceRewound { source_id }
            | Self::SourceLooped { source_id }
            | Self::NodeScheduleFailed { source_id, .. } => Some(*source_id),
            Self::ListenerChanged => None,
        }
    }

    pub fn is_error(&self) -> bool {
        matches!(self, Self::NodeScheduleFailed { .. })
    }
}
