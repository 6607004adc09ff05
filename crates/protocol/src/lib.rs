pub mod channel;
pub mod client;
pub mod config;
pub mod feedback;
pub mod frame;
pub mod messages;

pub use channel::*;
pub use config::*;
pub use feedback::*;
pub use frame::*;
pub use messages::*;
