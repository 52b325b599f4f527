//! Client side of the engine: connection context, transports and the
//! optimistic conversation view.

pub mod connection;
pub mod timeline;
pub mod transport;
pub mod view;

pub use connection::{ConnectionContext, Credentials};
pub use timeline::{IngestOutcome, PendingSend, Timeline, TimelineEntry};
pub use transport::{ChatTransport, EventStream, HttpTransport, LocalTransport};
pub use view::ConversationView;
