//! HTTP request handlers.

mod admin;
mod conversations;
mod diagnostics;
mod health;
pub(crate) mod problem_details;
mod sessions;
mod ws;

pub use admin::shutdown;
pub use conversations::{
    create_conversation, get_conversation, list_conversations, list_messages, send_message,
    update_conversation,
};
pub use diagnostics::sessions as diagnostics_sessions;
pub use health::{livez, version};
pub use sessions::{get_session, latest_session};
pub use ws::conversation_stream;
