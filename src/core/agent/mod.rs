//! Built-in worker types and the registry the binary launches them from.

pub mod chatbot;
pub mod hello;

use anyhow::Result;

use crate::core::llm::model_from_config;
use crate::core::router::{ChatRouter, ROUTER_TYPE, RouterPolicy};
use crate::core::worker::registry::LaunchFuture;
use crate::core::worker::{WorkerRegistry, WorkerRuntime, run_worker};

pub use chatbot::ChatbotAgent;
pub use hello::HelloAgent;

pub const CHATBOT_TYPE: &str = "chatbot-agent";
pub const HELLO_TYPE: &str = "hello-agent";

pub fn default_registry() -> Result<WorkerRegistry> {
    Ok(WorkerRegistry::builder()
        .register(ROUTER_TYPE, launch_router)?
        .register(CHATBOT_TYPE, launch_chatbot)?
        .register(HELLO_TYPE, launch_hello)?
        .freeze())
}

fn launch_router(runtime: WorkerRuntime) -> LaunchFuture {
    Box::pin(async move {
        let policy = RouterPolicy::from_config(&runtime.config.router);
        let mut router = ChatRouter::new(runtime.lifecycle, runtime.clock, policy);
        Ok(run_worker(&runtime.context, &mut router, runtime.options, runtime.shutdown).await)
    })
}

fn launch_chatbot(runtime: WorkerRuntime) -> LaunchFuture {
    Box::pin(async move {
        let model = model_from_config(&runtime.config.model, |key| std::env::var(key).ok());
        let mut agent = ChatbotAgent::new(model);
        Ok(run_worker(&runtime.context, &mut agent, runtime.options, runtime.shutdown).await)
    })
}

fn launch_hello(runtime: WorkerRuntime) -> LaunchFuture {
    Box::pin(async move {
        Ok(run_worker(&runtime.context, &mut HelloAgent, runtime.options, runtime.shutdown).await)
    })
}
