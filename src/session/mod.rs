// ABOUTME: Session module — in-memory session state synchronized with durable storage.
// ABOUTME: Store, conversation log, active selector, per-session persistence queue, and views.

pub mod conversation;
pub mod queue;
pub mod search;
pub mod selector;
pub mod store;
pub mod types;
pub mod view;

pub use conversation::Conversation;
pub use queue::{PersistOperation, PersistPolicy, PersistenceEvent};
pub use search::SearchHit;
pub use selector::ActiveSession;
pub use store::{SessionStore, StoreOptions};
pub use types::{Message, MessageId, NewMessage, Role, Session, SessionId, SessionSnapshot};
pub use view::StoreView;
