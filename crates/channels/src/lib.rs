pub mod api;
pub mod discord;
pub mod split;
pub mod telegram;

pub use api::ApiConnector;
pub use discord::DiscordConnector;
pub use split::split_message;
pub use telegram::TelegramConnector;
