pub mod chat;
pub mod events;
pub mod models;
pub mod prompt;
pub mod reference;
pub mod session;
