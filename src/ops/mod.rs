//! Guest-visible global installers, spec §4.5/§6. Each submodule installs
//! exactly one piece of the guest surface onto a freshly built context;
//! [`crate::context::ContextBuilder`] decides which ones to wire up based
//! on the run's [`crate::context::ContextConfig`].

pub mod console;
pub mod env;
pub mod fs;
pub mod require;
pub mod timers;
