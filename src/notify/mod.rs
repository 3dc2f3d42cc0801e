//! Search notification scheduling.
//!
//! Subscribers ask to be told about the bus inventory at least every N
//! milliseconds. A [`NotifySearchCoordinator`] keeps the subscription table,
//! derives the single effective period (the minimum requested), and drives a
//! [`PeriodicPusher`] that runs search commands on that cadence. Results whose
//! fingerprint matches the previous one are cached but not delivered.

mod coordinator;
mod pusher;

pub use coordinator::{NotifySearchCoordinator, NotifyStats};
pub use pusher::{PeriodicPusher, PushTimer, PusherByCommand};

use crate::search_result::SearchResult;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Which search a coordinator schedules.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotifyScope {
    /// Every device on the bus.
    General,
    /// Devices currently signaling an alarm.
    Alarm,
}

impl fmt::Display for NotifyScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NotifyScope::General => f.write_str("general"),
            NotifyScope::Alarm => f.write_str("alarm"),
        }
    }
}

/// Identity of a subscriber. Clones of one [`Subscriber`] share it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriberId(usize);

impl fmt::Display for SubscriberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{:x}", self.0)
    }
}

type Callback = Box<dyn Fn(&Arc<SearchResult>) + Send + Sync>;

enum Sink {
    Callback(Callback),
    Channel(mpsc::UnboundedSender<Arc<SearchResult>>),
}

struct SubscriberInner {
    label: String,
    sink: Sink,
}

/// Receives search results from a coordinator.
///
/// Either a closure, run on the fan-out task, or an unbounded channel.
#[derive(Clone)]
pub struct Subscriber {
    inner: Arc<SubscriberInner>,
}

impl Subscriber {
    pub fn from_fn<F>(label: impl Into<String>, callback: F) -> Self
    where
        F: Fn(&Arc<SearchResult>) + Send + Sync + 'static,
    {
        Self {
            inner: Arc::new(SubscriberInner {
                label: label.into(),
                sink: Sink::Callback(Box::new(callback)),
            }),
        }
    }

    pub fn channel(label: impl Into<String>) -> (Self, mpsc::UnboundedReceiver<Arc<SearchResult>>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let subscriber = Self {
            inner: Arc::new(SubscriberInner {
                label: label.into(),
                sink: Sink::Channel(tx),
            }),
        };
        (subscriber, rx)
    }

    pub fn id(&self) -> SubscriberId {
        SubscriberId(Arc::as_ptr(&self.inner) as usize)
    }

    pub fn label(&self) -> &str {
        &self.inner.label
    }

    /// Hands `result` to the sink. A panicking callback is contained here so
    /// the rest of the batch still gets delivered.
    pub(crate) fn deliver(&self, result: &Arc<SearchResult>) {
        match &self.inner.sink {
            Sink::Callback(callback) => {
                if panic::catch_unwind(AssertUnwindSafe(|| callback(result))).is_err() {
                    warn!(subscriber = %self.label(), "subscriber callback panicked");
                }
            }
            Sink::Channel(tx) => {
                if tx.send(Arc::clone(result)).is_err() {
                    debug!(subscriber = %self.label(), "subscriber channel closed");
                }
            }
        }
    }
}

impl fmt::Debug for Subscriber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscriber")
            .field("id", &self.id())
            .field("label", &self.label())
            .finish()
    }
}
