use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use super::{Fixture, ROUTER_INBOX};
use crate::core::agent::chatbot::{ChatbotAgent, ChatbotState};
use crate::core::llm::EchoModel;
use crate::core::messaging::{LogBroker, inbox_key};
use crate::core::router::RouterState;
use crate::core::types::InboundMessage;
use crate::core::worker::{RunOptions, RunOutcome, run_worker};

const CLIENT_INBOX: &str = "agent:client:u1:inbox";

async fn say(f: &Fixture, id: &str, text: &str) {
    let message = InboundMessage::new(id, "u1", "message", json!({ "text": text }))
        .with_reply_to(CLIENT_INBOX);
    f.broker
        .append(ROUTER_INBOX, &serde_json::to_string(&message).unwrap())
        .await
        .unwrap();
}

async fn wait_for_worker(f: &Fixture) -> String {
    for _ in 0..400 {
        if let Some(record) = f.lifecycle.list(None).await.into_iter().next() {
            return record.spec.name;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("router never provisioned a worker");
}

#[tokio::test]
async fn client_conversation_flows_through_a_dedicated_worker() {
    let f = Arc::new(Fixture::new(true));
    let shutdown = CancellationToken::new();

    let router_task = {
        let f = f.clone();
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            let ctx = f.router_context();
            let mut router = f.router();
            run_worker(&ctx, &mut router, RunOptions::default(), shutdown).await
        })
    };

    say(&f, "m1", "hello").await;
    let worker = wait_for_worker(&f).await;
    assert!(worker.starts_with("chatbot-user-u1-"));
    let record = f.lifecycle.describe(&worker).await.unwrap();
    assert_eq!(record.spec.ttl_seconds, Some(1800));

    let worker_task = {
        let f = f.clone();
        let shutdown = shutdown.clone();
        let worker = worker.clone();
        tokio::spawn(async move {
            let ctx = f.context("chatbot-agent", &worker);
            let mut agent = ChatbotAgent::new(Arc::new(EchoModel));
            run_worker(&ctx, &mut agent, RunOptions::default(), shutdown).await
        })
    };

    let forwarded = f.wait_for(&inbox_key("chatbot-agent", &worker), 1).await;
    assert_eq!(forwarded[0].id, "m1");
    assert_eq!(forwarded[0].sender, "u1");
    assert_eq!(forwarded[0].reply_to.as_deref(), Some(ROUTER_INBOX));

    let replies = f.wait_for(CLIENT_INBOX, 1).await;
    assert_eq!(replies[0].payload, json!({ "text": "You said: hello" }));
    assert_eq!(replies[0].reply_to.as_deref(), Some("m1"));
    assert_eq!(replies[0].kind, "reply");

    // the worker answered the router inbox, not the client directly
    let router_inbox = f.wait_for(ROUTER_INBOX, 2).await;
    assert_eq!(router_inbox[1].sender, worker);
    assert_eq!(router_inbox[1].kind, "reply");

    say(&f, "m2", "again").await;
    let replies = f.wait_for(CLIENT_INBOX, 2).await;
    assert_eq!(replies[1].payload, json!({ "text": "You said: again" }));
    assert_eq!(f.backend.create_calls(), 1);

    shutdown.cancel();
    assert_eq!(router_task.await.unwrap(), RunOutcome::Shutdown);
    assert_eq!(worker_task.await.unwrap(), RunOutcome::Shutdown);

    let router_state: RouterState = f.router_context().hydrate().await.unwrap();
    assert_eq!(router_state.user_agents["u1"], worker);
    assert!(router_state.pending_replies.is_empty());

    let chat: ChatbotState = f
        .context("chatbot-agent", &worker)
        .hydrate()
        .await
        .unwrap();
    assert_eq!(chat.conversations["u1"].len(), 4);
}

#[tokio::test]
async fn restarted_router_keeps_its_mapping() {
    let f = Fixture::new(true);

    say(&f, "m1", "hello").await;
    let ctx = f.router_context();
    let outcome = run_worker(
        &ctx,
        &mut f.router(),
        RunOptions { run_once: true },
        CancellationToken::new(),
    )
    .await;
    assert_eq!(outcome, RunOutcome::Completed);

    say(&f, "m2", "after restart").await;
    let ctx = f.router_context();
    let outcome = run_worker(
        &ctx,
        &mut f.router(),
        RunOptions { run_once: true },
        CancellationToken::new(),
    )
    .await;
    assert_eq!(outcome, RunOutcome::Completed);

    assert_eq!(f.backend.create_calls(), 1);
    let worker = wait_for_worker(&f).await;
    let forwarded = f.messages(&inbox_key("chatbot-agent", &worker)).await;
    let ids: Vec<&str> = forwarded.iter().map(|m| m.id.as_str()).collect();
    assert_eq!(ids, vec!["m1", "m2"]);
}

#[tokio::test]
async fn unknown_replies_are_dropped() {
    let f = Fixture::new(true);
    let shutdown = CancellationToken::new();

    let stray = InboundMessage::new("r1", "chatbot-user-x-1", "reply", json!({ "text": "late" }))
        .with_reply_to("never-sent");
    f.broker
        .append(ROUTER_INBOX, &serde_json::to_string(&stray).unwrap())
        .await
        .unwrap();
    say(&f, "m1", "hi").await;

    let ctx = f.router_context();
    let stop = shutdown.clone();
    let run = async {
        run_worker(&ctx, &mut f.router(), RunOptions::default(), shutdown).await
    };
    let watch = async {
        let forwarded = loop {
            if let Some(record) = f.lifecycle.list(None).await.into_iter().next() {
                break f
                    .wait_for(&inbox_key("chatbot-agent", &record.spec.name), 1)
                    .await;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        };
        stop.cancel();
        forwarded
    };
    let (outcome, forwarded) = tokio::join!(run, watch);

    assert_eq!(outcome, RunOutcome::Shutdown);
    assert_eq!(forwarded[0].id, "m1");
    assert!(f.messages(CLIENT_INBOX).await.is_empty());
    assert!(f.messages("never-sent").await.is_empty());
}
