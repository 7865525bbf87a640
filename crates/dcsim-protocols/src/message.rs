//! Protocol messages.
//!
//! All nodes of a simulation exchange one closed [`Message`] enum:
//!
//! ## Client
//! - [`Request`] - Client → Server: apply this command
//! - [`Reply`] - Server → Client: your command is done
//!
//! ## Paxos
//! - `Prepare` - Leader → Acceptors: promise not to accept lower ballots
//! - `Promise` - Acceptor → Leader: promised, and here is what I accepted
//! - `Accept` - Leader → All: accept this value
//! - `Learn` - Acceptor → All: I accepted this value
//! - `Heartbeat` - Leader → All: I'm still alive
//! - `Nack` - Acceptor → Leader: your ballot is stale
//!
//! ## Primary-Backup
//! - `Heartbeat` - Primary → Backups: I'm still alive
//! - `Replicate` - Primary → Backups: append this entry
//! - `Ack` - Backup → Primary: appended

use std::fmt;

use dcsim_sim::NodeId;
use serde::{Deserialize, Serialize};

/// Index of a consensus instance (slot) in the replicated log.
pub type Instance = u64;

// ============================================================================
// Envelope
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Message {
    Request(Request),
    Reply(Reply),
    Paxos(PaxosMessage),
    PrimaryBackup(PrimaryBackupMessage),
}

impl From<Request> for Message {
    fn from(request: Request) -> Self {
        Self::Request(request)
    }
}

impl From<Reply> for Message {
    fn from(reply: Reply) -> Self {
        Self::Reply(reply)
    }
}

impl From<PaxosMessage> for Message {
    fn from(msg: PaxosMessage) -> Self {
        Self::Paxos(msg)
    }
}

impl From<PrimaryBackupMessage> for Message {
    fn from(msg: PrimaryBackupMessage) -> Self {
        Self::PrimaryBackup(msg)
    }
}

// ============================================================================
// Client Messages
// ============================================================================

/// A client command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Request {
    pub client_id: NodeId,
    /// Unique per client.
    pub request_id: u64,
    pub data: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reply {
    pub request_id: u64,
    pub status: ReplyStatus,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReplyStatus {
    /// Decided by Paxos.
    Committed,
    /// Fully replicated by primary-backup.
    Ok,
}

// ============================================================================
// Paxos
// ============================================================================

/// A Paxos ballot number.
///
/// Each node starts from its position in the cluster and steps by the
/// cluster size, so ballots from different proposers never collide.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct Ballot(u64);

impl Ballot {
    pub const ZERO: Self = Self(0);

    pub const fn new(ballot: u64) -> Self {
        Self(ballot)
    }

    pub const fn as_u64(self) -> u64 {
        self.0
    }

    /// The next ballot owned by the same proposer in a cluster of `cluster_size`.
    pub const fn advance(self, cluster_size: u64) -> Self {
        Self(self.0 + cluster_size)
    }
}

impl fmt::Display for Ballot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A client command as it travels through consensus.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Command {
    pub client_id: NodeId,
    pub request_id: u64,
    pub data: String,
}

impl Command {
    /// Identity used for duplicate suppression.
    pub fn key(&self) -> (NodeId, u64) {
        (self.client_id, self.request_id)
    }
}

impl From<Request> for Command {
    fn from(request: Request) -> Self {
        Self {
            client_id: request.client_id,
            request_id: request.request_id,
            data: request.data,
        }
    }
}

impl From<Command> for Request {
    fn from(command: Command) -> Self {
        Self {
            client_id: command.client_id,
            request_id: command.request_id,
            data: command.data,
        }
    }
}

/// The value decided for an instance.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Value {
    Command(Command),
    /// Fills an instance when the leader has nothing to propose.
    Noop { ballot: Ballot },
}

impl Value {
    pub fn command(&self) -> Option<&Command> {
        match self {
            Self::Command(command) => Some(command),
            Self::Noop { .. } => None,
        }
    }
}

/// A value accepted at a ballot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Proposal {
    pub ballot: Ballot,
    pub value: Value,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum PaxosMessage {
    Prepare {
        instance: Instance,
        ballot: Ballot,
    },
    Promise {
        acceptor: NodeId,
        instance: Instance,
        ballot: Ballot,
        /// What this acceptor already accepted for the instance, if anything.
        accepted: Option<Proposal>,
    },
    Accept {
        instance: Instance,
        ballot: Ballot,
        value: Value,
    },
    Learn {
        acceptor: NodeId,
        instance: Instance,
        ballot: Ballot,
        value: Value,
    },
    Heartbeat {
        leader: NodeId,
        ballot: Ballot,
    },
    /// Carries the acceptor's promised ballot.
    Nack {
        ballot: Ballot,
    },
}

// ============================================================================
// Primary-Backup
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum PrimaryBackupMessage {
    Heartbeat {
        primary: NodeId,
    },
    Replicate {
        client_id: NodeId,
        request_id: u64,
        data: String,
    },
    Ack {
        client_id: NodeId,
        request_id: u64,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ballots_step_by_cluster_size() {
        let ballot = Ballot::new(2).advance(3).advance(3);
        assert_eq!(ballot, Ballot::new(8));
        assert!(Ballot::ZERO < ballot);
    }

    #[test]
    fn value_exposes_command() {
        let command = Command {
            client_id: NodeId::new(100),
            request_id: 1,
            data: "x".into(),
        };
        assert_eq!(Value::Command(command.clone()).command(), Some(&command));
        assert_eq!(Value::Noop { ballot: Ballot::ZERO }.command(), None);
        assert_eq!(command.key(), (NodeId::new(100), 1));
    }

    #[test]
    fn messages_serialize_to_json() {
        let msg = Message::from(PaxosMessage::Heartbeat {
            leader: NodeId::new(2),
            ballot: Ballot::new(5),
        });
        let json = serde_json::to_string(&msg).unwrap();
        assert_eq!(json, r#"{"Paxos":{"Heartbeat":{"leader":2,"ballot":5}}}"#);
        assert_eq!(serde_json::from_str::<Message>(&json).unwrap(), msg);
    }
}
