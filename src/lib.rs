//! Transactional message broker core.
//!
//! Messages are appended to a pooled, checksummed journal; queues deliver
//! references in priority order with scheduled delivery, redelivery and
//! dead-lettering; local and XA transactions make sends and
//! acknowledgements atomic; full addresses page to disk.
//!
//! [`server::Broker`] assembles the pieces around a [`server::ServerContext`].

pub mod clock;
pub(crate) mod codec;
pub mod config;
pub mod error;
pub mod file;
pub mod filter;
pub mod interceptor;
pub mod journal;
pub mod management;
pub mod message;
pub mod notification;
pub mod paging;
pub mod persistence;
pub mod postoffice;
pub mod queue;
pub mod server;
pub mod settings;
pub mod transaction;

pub use clock::{Clock, ManualClock, QuantaClock, SystemClock};
pub use config::{Configuration, JournalType};
pub use error::{Error, ErrorCategory, Result};
pub use filter::Filter;
pub use interceptor::{InterceptorChain, Next};
pub use management::{QueueControl, ServerControl};
pub use message::{Message, MessageHandle, PropertyValue, ServerMessage, TypedProperties};
pub use notification::{Notification, NotificationListener, NotificationService, NotificationType};
pub use queue::{Consumer, HandleStatus, MessageReference, Queue};
pub use server::{Broker, RecoverySummary, ServerContext};
pub use settings::{AddressFullPolicy, AddressSettings, HierarchicalRepository};
pub use transaction::{Transaction, TransactionState, Xid};
