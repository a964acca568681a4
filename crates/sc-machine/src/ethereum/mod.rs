//! Commitments: the Ethereum transactions channel transitions are anchored by.
//!
//! Every builder is a pure constructor. Identical inputs give byte-identical
//! calldata and an identical [`EthereumCommitment::hash_to_sign`], which is what
//! lets both sides of a channel sign the same digest without exchanging it.
//!
//! # Commitments
//!
//! | Builder | Target | Signed by |
//! |---------|--------|-----------|
//! | [`SetupCommitment`] | multisig, delegatecall | owners |
//! | [`InstallCommitment`] | multisig, MultiSend | owners |
//! | [`UninstallCommitment`] | multisig, MultiSend | owners |
//! | [`SetStateCommitment`] | app registry | app signing keys |
//! | [`EthVirtualAppAgreementCommitment`] | multisig, MultiSend | leg owners |
//! | [`VirtualAppSetStateCommitment`] | app registry | app keys + intermediary |
//! | [`WithdrawEthCommitment`] | multisig, call | owners |

pub mod multisig;
pub mod set_state;
pub mod virtual_app;

use std::fmt;

use sc_crypto::{Address, H256, Signature};
use serde::{Deserialize, Serialize};

use crate::error::MachineResult;
use crate::models::hex_bytes;

pub use multisig::{
    EthVirtualAppAgreementCommitment, InstallCommitment, MultisigCommitment, MultisigTransaction,
    SetupCommitment, UninstallCommitment, WithdrawEthCommitment,
};
pub use set_state::SetStateCommitment;
pub use virtual_app::VirtualAppSetStateCommitment;

/// How the multisig executes a transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Operation {
    Call = 0,
    DelegateCall = 1,
}

/// A transaction ready to broadcast.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    pub to: Address,
    pub value: u128,
    #[serde(with = "hex_bytes")]
    pub data: Vec<u8>,
}

/// Which transition a commitment anchors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CommitmentKind {
    Setup,
    Install,
    Uninstall,
    SetState,
    VirtualAppAgreement,
    VirtualAppSetState,
    WithdrawEth,
}

impl fmt::Display for CommitmentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// A candidate on-chain transaction for one transition.
pub trait EthereumCommitment: fmt::Debug + Send + Sync {
    fn kind(&self) -> CommitmentKind;

    /// Digest every regular signer signs.
    fn hash_to_sign(&self) -> H256;

    /// Digest an intermediary signs, for commitments that have one.
    fn hash_to_sign_as_intermediary(&self) -> Option<H256> {
        None
    }

    /// The transaction carrying `signatures`.
    ///
    /// Signatures may be given in any order; they are sorted by recovered
    /// signer before being packed.
    fn transaction(&self, signatures: &[Signature]) -> MachineResult<Transaction>;
}
