pub mod agent;
pub mod backend;
pub mod clock;
pub mod config;
pub mod lifecycle;
pub mod llm;
pub mod messaging;
pub mod router;
pub mod store;
pub mod terminal;
pub mod types;
pub mod worker;
