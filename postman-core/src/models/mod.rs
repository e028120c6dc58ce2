pub mod inbox;
pub mod outbox;
pub mod session;
pub mod template;

pub use inbox::InboxMessage;
pub use outbox::{OutboxMessage, OutboxStatus};
pub use session::{Session, SessionStatus};
pub use template::TemplateRef;
