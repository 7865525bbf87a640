//! Scripted client.
//!
//! Sends a caller-supplied list of requests to one server at fixed virtual
//! times and records each reply with its latency.

use std::any::Any;
use std::collections::{BTreeMap, VecDeque};

use dcsim_sim::{Node, NodeContext, NodeId, Store, TimerId};
use serde::{Deserialize, Serialize};

use crate::message::{Message, Reply, ReplyStatus, Request};

pub const SUBMIT_TIMER: TimerId = TimerId::new("submit");

/// Store key of the completed-request log.
pub const COMPLETED_KEY: &str = "completed";

/// One request of a client script.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScriptedRequest {
    /// Virtual time at which the request is sent.
    pub at_ns: u64,
    pub data: String,
}

impl ScriptedRequest {
    pub fn new(at_ns: u64, data: impl Into<String>) -> Self {
        Self {
            at_ns,
            data: data.into(),
        }
    }
}

/// A request the client got a reply for.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Completion {
    pub request_id: u64,
    pub status: ReplyStatus,
    pub latency_ns: u64,
}

pub struct ClientNode {
    id: NodeId,
    target: NodeId,
    script: VecDeque<ScriptedRequest>,
    next_request_id: u64,
    /// Request id → send time.
    in_flight: BTreeMap<u64, u64>,
    completed: Vec<Completion>,
    store: Store,
}

impl ClientNode {
    /// Request ids are assigned in send order, starting at 0.
    pub fn new(
        id: NodeId,
        target: NodeId,
        script: impl IntoIterator<Item = ScriptedRequest>,
    ) -> Self {
        let mut script: Vec<ScriptedRequest> = script.into_iter().collect();
        script.sort_by_key(|request| request.at_ns);
        Self {
            id,
            target,
            script: script.into(),
            next_request_id: 0,
            in_flight: BTreeMap::new(),
            completed: Vec::new(),
            store: Store::new(),
        }
    }

    pub fn target(&self) -> NodeId {
        self.target
    }

    pub fn completed(&self) -> &[Completion] {
        &self.completed
    }

    /// Requests sent and not yet answered.
    pub fn in_flight(&self) -> impl Iterator<Item = u64> + '_ {
        self.in_flight.keys().copied()
    }

    /// Requests not yet sent.
    pub fn remaining(&self) -> usize {
        self.script.len()
    }

    fn schedule_next(&self, ctx: &mut NodeContext<'_, Message>) {
        if let Some(next) = self.script.front() {
            ctx.set_timer(next.at_ns.saturating_sub(ctx.now()), SUBMIT_TIMER);
        }
    }

    fn submit_due(&mut self, ctx: &mut NodeContext<'_, Message>) {
        while self
            .script
            .front()
            .is_some_and(|next| next.at_ns <= ctx.now())
        {
            let Some(next) = self.script.pop_front() else {
                break;
            };
            let request_id = self.next_request_id;
            self.next_request_id += 1;
            self.in_flight.insert(request_id, ctx.now());
            tracing::debug!(
                client = %self.id,
                target = %self.target,
                request_id,
                "submitting request"
            );
            let request = Request {
                client_id: self.id,
                request_id,
                data: next.data,
            };
            ctx.send(self.target, Message::Request(request));
        }
        self.schedule_next(ctx);
    }

    fn on_reply(&mut self, ctx: &mut NodeContext<'_, Message>, reply: Reply) {
        let Some(sent_at) = self.in_flight.remove(&reply.request_id) else {
            tracing::debug!(
                client = %self.id,
                request_id = reply.request_id,
                "ignoring duplicate reply"
            );
            return;
        };
        let completion = Completion {
            request_id: reply.request_id,
            status: reply.status,
            latency_ns: ctx.now() - sent_at,
        };
        tracing::debug!(
            client = %self.id,
            request_id = completion.request_id,
            latency_ns = completion.latency_ns,
            "request completed"
        );
        self.completed.push(completion);
        if let Err(error) = self.store.put(COMPLETED_KEY, &self.completed) {
            tracing::error!(client = %self.id, %error, "failed to persist completions");
        }
    }
}

impl Node<Message> for ClientNode {
    fn id(&self) -> NodeId {
        self.id
    }

    fn on_start(&mut self, ctx: &mut NodeContext<'_, Message>) {
        self.schedule_next(ctx);
    }

    fn on_message(&mut self, ctx: &mut NodeContext<'_, Message>, src: NodeId, msg: Message) {
        match msg {
            Message::Reply(reply) => self.on_reply(ctx, reply),
            other => {
                tracing::trace!(client = %self.id, %src, msg = ?other, "ignoring unknown message");
                ctx.record_unknown_message();
            }
        }
    }

    fn on_timer(&mut self, ctx: &mut NodeContext<'_, Message>, timer: TimerId) {
        if timer == SUBMIT_TIMER {
            self.submit_due(ctx);
        }
    }

    fn store(&self) -> &Store {
        &self.store
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dcsim_sim::{EventKind, SimConfig, SimNetwork, Simulation};

    #[test]
    fn sends_script_in_time_order_and_records_latency() {
        let mut sim = Simulation::new(SimConfig::default(), SimNetwork::reliable());
        let client = ClientNode::new(
            NodeId::new(100),
            NodeId::new(0),
            [
                ScriptedRequest::new(2_000_000, "b"),
                ScriptedRequest::new(1_000_000, "a"),
            ],
        );
        sim.register_node(Box::new(client)).unwrap();
        sim.run_until(2_000_000);

        let client = sim.node_as::<ClientNode>(NodeId::new(100)).unwrap();
        assert_eq!(client.remaining(), 0);
        assert_eq!(client.in_flight().collect::<Vec<_>>(), vec![0, 1]);
        // Server 0 does not exist, so both requests are dropped at dispatch.
        assert_eq!(sim.counters(NodeId::new(100)).unwrap().messages_sent, 2);

        sim.schedule(
            3_000_000,
            NodeId::new(100),
            EventKind::Message {
                src: NodeId::new(0),
                msg: Message::Reply(Reply {
                    request_id: 1,
                    status: ReplyStatus::Ok,
                }),
            },
        )
        .unwrap();
        sim.run(None);

        let client = sim.node_as::<ClientNode>(NodeId::new(100)).unwrap();
        assert_eq!(
            client.completed(),
            &[Completion {
                request_id: 1,
                status: ReplyStatus::Ok,
                latency_ns: 1_000_000,
            }]
        );
        let stored: Vec<Completion> = client.store().get(COMPLETED_KEY).unwrap().unwrap();
        assert_eq!(stored, client.completed());
    }
}
