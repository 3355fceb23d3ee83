//! Actor metrics and mailbox monitoring.
//!
//! | Actor Type | Normal | Warning | Critical |
//! |------------|--------|---------|----------|
//! | Registry   | < 100  | 100-500 | > 500    |
//! | Room       | < 100  | 100-500 | > 500    |
//! | Dispatcher | < 256  | 256-768 | > 768    |
//! | Connection | < 50   | 50-200  | > 200    |

use crate::observability::metrics as prom;
use std::sync::atomic::{AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};

/// Depth above which a mailbox is elevated, and above which it is critical.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MailboxThresholds {
    pub normal: usize,
    pub warning: usize,
}

const ROOM_THRESHOLDS: MailboxThresholds = MailboxThresholds {
    normal: 100,
    warning: 500,
};
const DISPATCH_THRESHOLDS: MailboxThresholds = MailboxThresholds {
    normal: 256,
    warning: 768,
};
const CONNECTION_THRESHOLDS: MailboxThresholds = MailboxThresholds {
    normal: 50,
    warning: 200,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActorType {
    Registry,
    Room,
    Dispatcher,
    Connection,
}

impl ActorType {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            ActorType::Registry => "registry",
            ActorType::Room => "room",
            ActorType::Dispatcher => "dispatcher",
            ActorType::Connection => "connection",
        }
    }

    #[must_use]
    pub const fn thresholds(&self) -> MailboxThresholds {
        match self {
            ActorType::Registry | ActorType::Room => ROOM_THRESHOLDS,
            ActorType::Dispatcher => DISPATCH_THRESHOLDS,
            ActorType::Connection => CONNECTION_THRESHOLDS,
        }
    }

    #[must_use]
    pub const fn level_for(&self, depth: usize) -> MailboxLevel {
        let t = self.thresholds();
        if depth > t.warning {
            MailboxLevel::Critical
        } else if depth > t.normal {
            MailboxLevel::Warning
        } else {
            MailboxLevel::Normal
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum MailboxLevel {
    Normal = 0,
    Warning = 1,
    Critical = 2,
}

impl MailboxLevel {
    const fn from_u8(value: u8) -> Self {
        match value {
            0 => MailboxLevel::Normal,
            1 => MailboxLevel::Warning,
            _ => MailboxLevel::Critical,
        }
    }
}

/// Queue depth and drop accounting for one actor's mailbox.
///
/// Level changes are logged once per transition, not per message.
#[derive(Debug)]
pub struct MailboxMonitor {
    actor_type: ActorType,
    /// Room code, connection id or a singleton name.
    actor_id: String,
    depth: AtomicUsize,
    peak_depth: AtomicUsize,
    level: AtomicU8,
    messages_processed: AtomicU64,
    messages_dropped: AtomicU64,
}

impl MailboxMonitor {
    #[must_use]
    pub fn new(actor_type: ActorType, actor_id: impl Into<String>) -> Self {
        Self {
            actor_type,
            actor_id: actor_id.into(),
            depth: AtomicUsize::new(0),
            peak_depth: AtomicUsize::new(0),
            level: AtomicU8::new(MailboxLevel::Normal as u8),
            messages_processed: AtomicU64::new(0),
            messages_dropped: AtomicU64::new(0),
        }
    }

    pub fn record_enqueue(&self) {
        let depth = self.depth.fetch_add(1, Ordering::Relaxed) + 1;
        self.peak_depth.fetch_max(depth, Ordering::Relaxed);
        self.observe(depth);
    }

    pub fn record_dequeue(&self) {
        let depth = self.depth.fetch_sub(1, Ordering::Relaxed).saturating_sub(1);
        self.messages_processed.fetch_add(1, Ordering::Relaxed);
        self.observe(depth);
    }

    /// Count a message the mailbox had no room for.
    pub fn record_drop(&self) {
        let dropped = self.messages_dropped.fetch_add(1, Ordering::Relaxed) + 1;
        warn!(
            target: "rt.actor.mailbox",
            actor_type = self.actor_type.as_str(),
            actor_id = %self.actor_id,
            dropped,
            "Mailbox full, message dropped"
        );
    }

    fn observe(&self, depth: usize) {
        let level = self.actor_type.level_for(depth);
        let previous = MailboxLevel::from_u8(self.level.swap(level as u8, Ordering::Relaxed));
        if level == previous {
            return;
        }
        if level == MailboxLevel::Critical {
            warn!(
                target: "rt.actor.mailbox",
                actor_type = self.actor_type.as_str(),
                actor_id = %self.actor_id,
                depth,
                threshold = self.actor_type.thresholds().warning,
                "Mailbox depth critical"
            );
        } else {
            debug!(
                target: "rt.actor.mailbox",
                actor_type = self.actor_type.as_str(),
                actor_id = %self.actor_id,
                depth,
                from = ?previous,
                to = ?level,
                "Mailbox level changed"
            );
        }
    }

    #[must_use]
    pub fn current_depth(&self) -> usize {
        self.depth.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn peak_depth(&self) -> usize {
        self.peak_depth.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn messages_processed(&self) -> u64 {
        self.messages_processed.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn messages_dropped(&self) -> u64 {
        self.messages_dropped.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn current_level(&self) -> MailboxLevel {
        MailboxLevel::from_u8(self.level.load(Ordering::Relaxed))
    }
}

/// Aggregated counters for the actor system.
///
/// The atomics back the registry status reply; every change is mirrored to
/// the Prometheus recorder.
#[derive(Debug, Default)]
pub struct ActorMetrics {
    pub active_rooms: AtomicUsize,
    pub active_connections: AtomicUsize,
    /// Total actor panics (indicates bugs).
    pub actor_panics: AtomicU64,
    pub total_messages_processed: AtomicU64,
    /// Events dropped because a connection mailbox was full.
    pub events_dropped: AtomicU64,
    /// Side effects dropped because the dispatcher mailbox was full.
    pub dispatch_dropped: AtomicU64,
}

impl ActorMetrics {
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn room_created(&self) {
        let rooms = self.active_rooms.fetch_add(1, Ordering::Relaxed) + 1;
        prom::set_rooms_active(rooms);
    }

    pub fn room_removed(&self) {
        let rooms = self.active_rooms.fetch_sub(1, Ordering::Relaxed).saturating_sub(1);
        prom::set_rooms_active(rooms);
    }

    pub fn connection_created(&self) {
        let connections = self.active_connections.fetch_add(1, Ordering::Relaxed) + 1;
        prom::set_connections_active(connections);
    }

    pub fn connection_closed(&self) {
        let connections = self
            .active_connections
            .fetch_sub(1, Ordering::Relaxed)
            .saturating_sub(1);
        prom::set_connections_active(connections);
    }

    pub fn record_panic(&self, actor_type: ActorType) {
        let total_panics = self.actor_panics.fetch_add(1, Ordering::Relaxed) + 1;
        tracing::error!(
            target: "rt.actor.panic",
            actor_type = actor_type.as_str(),
            total_panics,
            "Actor panic detected - indicates bug, investigation required"
        );
    }

    pub fn record_message_processed(&self) {
        self.total_messages_processed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_event_dropped(&self) {
        self.events_dropped.fetch_add(1, Ordering::Relaxed);
        prom::record_event_dropped();
    }

    pub fn record_dispatch_dropped(&self) {
        self.dispatch_dropped.fetch_add(1, Ordering::Relaxed);
        prom::record_dispatch_dropped();
    }

    #[must_use]
    pub fn room_count(&self) -> usize {
        self.active_rooms.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn connection_count(&self) -> usize {
        self.active_connections.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn events_dropped(&self) -> u64 {
        self.events_dropped.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn dispatch_dropped(&self) -> u64 {
        self.dispatch_dropped.load(Ordering::Relaxed)
    }
}
