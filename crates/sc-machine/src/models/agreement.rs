//! Virtual app agreements.
//!
//! A virtual app lives between two parties that share no channel. Each of
//! them has a channel with a common intermediary, and in each of those legs
//! an agreement instance locks the collateral the virtual app may pay out.

use sc_abi::{encode, Token};
use sc_crypto::{keccak256, Address, H256};
use serde::{Deserialize, Serialize};

use crate::error::MachineResult;
use crate::models::app_instance::{uninstall_key, Terms};

/// Collateral backing a virtual app inside one leg's channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EthVirtualAppAgreementInstance {
    /// Multisig of the leg channel holding the collateral.
    pub multisig_address: Address,
    pub terms: Terms,
    pub app_seq_no: u64,
    pub root_nonce_value: u64,
    /// Block after which the agreement resolves without the virtual app.
    pub expiry: u64,
    /// Total collateral locked in this leg.
    pub capital_provided: u128,
    /// Owner addresses of the two virtual app parties, sorted.
    pub beneficiaries: Vec<Address>,
    pub target_app_identity_hash: H256,
}

impl EthVirtualAppAgreementInstance {
    /// ABI tuple passed to the agreement contract.
    pub fn to_token(&self) -> MachineResult<Token> {
        Ok(Token::Tuple(vec![
            Token::Address(self.multisig_address),
            Token::Bytes32(self.terms.hash()?),
            Token::Uint(u128::from(self.app_seq_no)),
            Token::Uint(u128::from(self.root_nonce_value)),
            Token::Uint(u128::from(self.expiry)),
            Token::Uint(self.capital_provided),
            Token::addresses(&self.beneficiaries),
            Token::Bytes32(self.target_app_identity_hash),
        ]))
    }

    pub fn identity_hash(&self) -> MachineResult<H256> {
        Ok(keccak256(&encode(&[self.to_token()?])?))
    }

    pub fn uninstall_key(&self) -> MachineResult<H256> {
        uninstall_key(self.multisig_address, self.app_seq_no)
    }
}
