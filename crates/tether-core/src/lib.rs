pub mod approval;
pub mod cancellation;
pub mod checkpoint;
pub mod config;
pub mod context_window;
pub mod event_bus;
pub mod mode;
pub mod repetition;
pub mod responses;
pub mod storage;
pub mod task;

pub use approval::*;
pub use cancellation::*;
pub use checkpoint::*;
pub use config::*;
pub use context_window::*;
pub use event_bus::*;
pub use mode::*;
pub use repetition::*;
pub use storage::*;
pub use task::*;
