pub mod chat;
pub mod message;
pub mod user;

pub use chat::{Chat, StreamRecord};
pub use message::{Attachment, Message, MessageContent, MessagePart, Role, Source};
pub use user::User;
