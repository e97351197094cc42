pub mod config;
pub mod error;
pub mod event;
pub mod traits;
pub mod trigger;
pub mod types;

pub use config::AppConfig;
pub use error::{BlockflowError, Result};
pub use event::EventBus;
pub use traits::{Block, Signer};
pub use trigger::TriggerSink;
pub use types::*;
