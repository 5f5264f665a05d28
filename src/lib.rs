pub mod config;
pub mod dispatch;
pub mod mailbox;
pub mod protocol;
pub mod pump;
pub mod runtime;
pub mod server;
pub mod session;
pub mod worker;

mod utils;

pub use config::{CodingSystem, CommunicationStyle, ServerConfig};
pub use runtime::Runtime;
pub use server::{ListenerError, QuitSignal, Server};
