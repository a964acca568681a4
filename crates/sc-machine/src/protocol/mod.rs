//! Protocol flows.
//!
//! A protocol is a fixed list of steps per [`Role`]. Pure `Compute` steps build
//! commitments, validate counter-signatures and prepare outgoing messages;
//! the other steps are effects the executor performs through its services.
//!
//! # Two-party shape
//!
//! ```text
//! Initiator                              Responder
//!   compute, Sign
//!   seq 1 ───────────────────────────────▶ compute, validate, Sign
//!                                          ◀─────────────────── seq 2
//!   validate, Commit                       Commit
//! ```
//!
//! The virtual-app protocols add an intermediary between the two parties;
//! messages are numbered per run and a message with an unexpected number is
//! rejected.

pub mod install;
pub mod install_virtual_app;
pub mod message;
pub mod params;
pub mod setup;
pub mod take_action;
pub mod uninstall;
pub mod uninstall_virtual_app;
pub mod update;
pub mod validator;
pub mod withdraw;

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{MachineError, MachineResult};
use crate::executor::{Context, StepOutput};
use crate::opcode::Opcode;

pub use message::ProtocolMessage;
pub use params::{
    virtual_channel_address, InstallParams, InstallVirtualAppParams, ProtocolParams, SetupParams,
    TakeActionParams, UninstallParams, UninstallVirtualAppParams, UpdateParams, WithdrawParams,
};

/// The protocols a node speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Protocol {
    Setup,
    Install,
    Update,
    TakeAction,
    Withdraw,
    Uninstall,
    InstallVirtualApp,
    UninstallVirtualApp,
}

impl Protocol {
    pub const ALL: [Protocol; 8] = [
        Protocol::Setup,
        Protocol::Install,
        Protocol::Update,
        Protocol::TakeAction,
        Protocol::Withdraw,
        Protocol::Uninstall,
        Protocol::InstallVirtualApp,
        Protocol::UninstallVirtualApp,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Protocol::Setup => "Setup",
            Protocol::Install => "Install",
            Protocol::Update => "Update",
            Protocol::TakeAction => "TakeAction",
            Protocol::Withdraw => "Withdraw",
            Protocol::Uninstall => "Uninstall",
            Protocol::InstallVirtualApp => "InstallVirtualApp",
            Protocol::UninstallVirtualApp => "UninstallVirtualApp",
        }
    }

    /// Whether the protocol runs through an intermediary.
    pub fn is_virtual(&self) -> bool {
        matches!(self, Protocol::InstallVirtualApp | Protocol::UninstallVirtualApp)
    }

    /// Steps `role` executes, if the role takes part in this protocol.
    pub fn flow(&self, role: Role) -> Option<&'static [ProtocolStep]> {
        let steps = match (self, role) {
            (Protocol::Setup, Role::Initiator) => setup::INITIATOR,
            (Protocol::Setup, Role::Responder) => setup::RESPONDER,
            (Protocol::Install, Role::Initiator) => install::INITIATOR,
            (Protocol::Install, Role::Responder) => install::RESPONDER,
            (Protocol::Update, Role::Initiator) => update::INITIATOR,
            (Protocol::Update, Role::Responder) => update::RESPONDER,
            (Protocol::TakeAction, Role::Initiator) => take_action::INITIATOR,
            (Protocol::TakeAction, Role::Responder) => take_action::RESPONDER,
            (Protocol::Uninstall, Role::Initiator) => uninstall::INITIATOR,
            (Protocol::Uninstall, Role::Responder) => uninstall::RESPONDER,
            (Protocol::Withdraw, Role::Initiator) => withdraw::INITIATOR,
            (Protocol::Withdraw, Role::Responder) => withdraw::RESPONDER,
            (Protocol::InstallVirtualApp, Role::Initiator) => install_virtual_app::INITIATOR,
            (Protocol::InstallVirtualApp, Role::Intermediary) => install_virtual_app::INTERMEDIARY,
            (Protocol::InstallVirtualApp, Role::Responder) => install_virtual_app::RESPONDER,
            (Protocol::UninstallVirtualApp, Role::Initiator) => uninstall_virtual_app::INITIATOR,
            (Protocol::UninstallVirtualApp, Role::Intermediary) => uninstall_virtual_app::INTERMEDIARY,
            (Protocol::UninstallVirtualApp, Role::Responder) => uninstall_virtual_app::RESPONDER,
            (_, Role::Intermediary) => return None,
        };
        Some(steps)
    }

    /// The role a node takes when the first message it sees for a run has
    /// number `seq`. Later messages of a run are not run starters.
    pub fn role_started_by(&self, seq: u32) -> Option<Role> {
        match (self.is_virtual(), seq) {
            (false, 1) => Some(Role::Responder),
            (true, 1) => Some(Role::Intermediary),
            (true, 2) => Some(Role::Responder),
            _ => None,
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Protocol {
    type Err = MachineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Protocol::ALL
            .into_iter()
            .find(|protocol| protocol.name() == s)
            .ok_or_else(|| MachineError::Serialization(format!("Unknown protocol {s}")))
    }
}

/// A node's part in a protocol run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Role {
    Initiator,
    Intermediary,
    Responder,
}

/// A pure step: reads the context, returns what to fold into it.
pub type ComputeFn = fn(&Context) -> MachineResult<StepOutput>;

/// One step of a protocol flow.
#[derive(Clone, Copy)]
pub enum ProtocolStep {
    Compute(ComputeFn),
    /// Sign every commitment awaiting a local signature.
    Sign,
    /// Sign every commitment awaiting an intermediary signature.
    SignAsIntermediary,
    /// Send everything in the outbox.
    Send,
    /// Wait for message number `seq`.
    Wait { seq: u32 },
    SendAndWait { seq: u32 },
    /// Store every fully signed commitment.
    Commit,
}

impl ProtocolStep {
    /// Effect opcode of the step, `None` for compute steps.
    pub fn opcode(&self) -> Option<Opcode> {
        match self {
            ProtocolStep::Compute(_) => None,
            ProtocolStep::Sign => Some(Opcode::OpSign),
            ProtocolStep::SignAsIntermediary => Some(Opcode::OpSignAsIntermediary),
            ProtocolStep::Send => Some(Opcode::IoSend),
            ProtocolStep::Wait { .. } => Some(Opcode::IoWait),
            ProtocolStep::SendAndWait { .. } => Some(Opcode::IoSendAndWait),
            ProtocolStep::Commit => Some(Opcode::WriteCommitment),
        }
    }
}

impl fmt::Debug for ProtocolStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProtocolStep::Compute(_) => f.write_str("Compute"),
            ProtocolStep::Sign => f.write_str("Sign"),
            ProtocolStep::SignAsIntermediary => f.write_str("SignAsIntermediary"),
            ProtocolStep::Send => f.write_str("Send"),
            ProtocolStep::Wait { seq } => write!(f, "Wait({seq})"),
            ProtocolStep::SendAndWait { seq } => write!(f, "SendAndWait({seq})"),
            ProtocolStep::Commit => f.write_str("Commit"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_every_flow_ends_in_commit() {
        for protocol in Protocol::ALL {
            for role in [Role::Initiator, Role::Intermediary, Role::Responder] {
                if let Some(steps) = protocol.flow(role) {
                    assert!(
                        matches!(steps.last(), Some(ProtocolStep::Commit)),
                        "{protocol} {role:?}"
                    );
                }
            }
        }
    }

    #[test]
    fn test_intermediary_only_in_virtual_protocols() {
        for protocol in Protocol::ALL {
            assert_eq!(protocol.flow(Role::Intermediary).is_some(), protocol.is_virtual());
        }
    }

    #[test]
    fn test_role_started_by() {
        assert_eq!(Protocol::Install.role_started_by(1), Some(Role::Responder));
        assert_eq!(Protocol::Install.role_started_by(2), None);
        assert_eq!(
            Protocol::InstallVirtualApp.role_started_by(1),
            Some(Role::Intermediary)
        );
        assert_eq!(
            Protocol::UninstallVirtualApp.role_started_by(2),
            Some(Role::Responder)
        );
        assert_eq!(Protocol::UninstallVirtualApp.role_started_by(4), None);
    }

    #[test]
    fn test_name_roundtrip() {
        for protocol in Protocol::ALL {
            assert_eq!(protocol.name().parse::<Protocol>().unwrap(), protocol);
        }
        assert!("Deposit".parse::<Protocol>().is_err());
    }

    #[test]
    fn test_wait_sequence_numbers_increase() {
        for protocol in Protocol::ALL {
            for role in [Role::Initiator, Role::Intermediary, Role::Responder] {
                let Some(steps) = protocol.flow(role) else { continue };
                let waits: Vec<u32> = steps
                    .iter()
                    .filter_map(|step| match step {
                        ProtocolStep::Wait { seq } | ProtocolStep::SendAndWait { seq } => Some(*seq),
                        _ => None,
                    })
                    .collect();
                assert!(waits.windows(2).all(|w| w[0] < w[1]), "{protocol} {role:?}");
            }
        }
    }
}
