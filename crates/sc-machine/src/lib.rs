//! State-channel protocol engine.
//!
//! This crate runs the protocols by which the owners of a 2-of-2 multisig
//! agree, off chain, on how the funds it holds are split between them and
//! between the apps installed in it. Every agreed transition produces a
//! fully signed Ethereum commitment that either party can submit on chain.
//!
//! # Overview
//!
//! A node is a set of services around an [`InstructionExecutor`]:
//!
//! | Concern | Type |
//! |---------|------|
//! | Keys | [`SigningService`] ([`LocalSigner`]) |
//! | Messages | [`IoTransport`] ([`InMemoryTransport`]) |
//! | Signed commitments | [`CommitmentStore`] ([`StoreCommitments`], [`InMemoryCommitmentStore`]) |
//! | Channels, WAL | [`Store`] ([`InMemoryStore`]) |
//! | Per-key locks | [`LockManager`] over a [`LockService`] |
//!
//! The [`ProtocolRunner`] wires these together: it loads channels, takes
//! locks, starts runs and routes inbound messages.
//!
//! # Protocols
//!
//! | Protocol | Parties | Effect |
//! |----------|---------|--------|
//! | Setup | 2 | free balance installed, balances zero |
//! | Install | 2 | app funded from the free balance |
//! | Update | 2 | app state replaced |
//! | TakeAction | 2 | app state advanced by an action |
//! | Uninstall | 2 | app removed, payout credited |
//! | Withdraw | 2 | funds leave the multisig |
//! | InstallVirtualApp | 3 | app between two parties through an intermediary |
//! | UninstallVirtualApp | 3 | virtual app settled, legs released |
//!
//! Every run is a fixed list of steps per [`Role`]:
//!
//! ```
//! use sc_machine::protocol::{Protocol, ProtocolStep, Role};
//!
//! let flow = Protocol::Install.flow(Role::Initiator).unwrap();
//! assert!(matches!(flow.last(), Some(ProtocolStep::Commit)));
//!
//! // Only the virtual-app protocols have an intermediary
//! assert!(Protocol::Install.flow(Role::Intermediary).is_none());
//! assert!(Protocol::InstallVirtualApp.flow(Role::Intermediary).is_some());
//! ```
//!
//! # Recovery
//!
//! With a [`WriteAheadLog`] attached, the executor records each signature,
//! send and receive as it happens. After a restart,
//! [`ProtocolRunner::resume`] finishes recorded runs without signing or
//! sending anything twice.

pub mod config;
pub mod error;
pub mod ethereum;
pub mod executor;
pub mod inbox;
pub mod lock;
pub mod memory;
pub mod models;
pub mod opcode;
pub mod protocol;
pub mod runner;
pub mod services;
pub mod store;
pub mod wal;

pub use config::{MachineConfig, NetworkContext};
pub use error::{MachineError, MachineResult};
pub use executor::{CommitmentSlot, Context, InstructionExecutor, RunOutcome, StepOutput};
pub use inbox::{Inbox, InboxKey};
pub use lock::{InMemoryLockService, LockManager, LockService, LockState, LockToken};
pub use memory::{InMemoryCommitmentStore, InMemoryNetwork, InMemoryTransport, LocalSigner};
pub use models::{AppInstance, AppProposal, StateChannel, StateChannelsMap};
pub use opcode::Opcode;
pub use protocol::{Protocol, ProtocolMessage, ProtocolParams, Role};
pub use runner::{ProtocolRunner, RunnerEvent};
pub use services::{AppLogic, CommitmentStore, IoTransport, SigningService};
pub use store::{InMemoryStore, Store, StoreCommitments, StoredCommitment};
pub use wal::{WalRecord, WriteAheadLog};
