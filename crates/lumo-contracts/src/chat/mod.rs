mod classifier;
mod command_registry;
mod intent_parser;

pub use classifier::{
    classify_request, extract_topic, greeting_response, is_greeting, RequestKind,
    GREETING_RESPONSES,
};
pub use command_registry::CHAT_HELP_COMMANDS;
pub use intent_parser::{parse_intent, Intent};
