pub mod config;
pub mod error;
pub mod event;
pub mod tokens;
pub mod traits;
pub mod types;

pub use config::AppConfig;
pub use error::{FloeError, Result};
pub use event::{EventBus, FlowEvent};
pub use types::*;
