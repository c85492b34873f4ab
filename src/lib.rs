pub mod app;
pub mod assets;
pub mod cli;
pub mod config;
pub mod environment;
pub mod error;
pub mod events;
pub mod logging;
pub mod pool;
pub mod script_registry;
pub mod scripts;
pub mod services;

pub use app::{run, RunReport};
pub use error::ScriptError;
pub use events::{Event, EventBus, EventHub, Subscription};
pub use pool::{ScriptPool, SerializeMode};
pub use script_registry::ScriptRegistry;
pub use scripts::{Context, HostRegistry, Script, ScriptHost, ScriptLanguage};
