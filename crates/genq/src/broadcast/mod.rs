pub mod queue_events;

pub use queue_events::{QueueEvent, QueueEventBroadcaster, QueueEventKind};
