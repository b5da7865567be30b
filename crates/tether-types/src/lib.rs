pub mod content;
pub mod event;
pub mod message;
pub mod provider;
pub mod tool;
pub mod transcript;

pub use content::*;
pub use event::*;
pub use message::*;
pub use provider::*;
pub use tool::*;
pub use transcript::*;
