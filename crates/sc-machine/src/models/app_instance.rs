//! App instances.
//!
//! An app instance is a piece of state both channel owners agree on, updated
//! by signed `setState` commitments and removed by an uninstall. Its identity
//! hash is fixed at install time and never reassigned.

use sc_abi::{encode, encode_packed, Token};
use sc_crypto::{keccak256, Address, H256};
use serde::{Deserialize, Serialize};

use crate::error::MachineResult;
use crate::models::hex_bytes;

/// Asset an app distributes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AssetType {
    Eth = 0,
    Erc20 = 1,
}

/// What an app may pay out when it is uninstalled.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Terms {
    pub asset_type: AssetType,
    /// Upper bound on the total payout.
    pub limit: u128,
    /// Token contract for ERC20 terms, zero for ETH.
    pub token: Address,
}

impl Terms {
    /// ETH terms capped at `limit`.
    pub fn eth(limit: u128) -> Self {
        Self {
            asset_type: AssetType::Eth,
            limit,
            token: Address::ZERO,
        }
    }

    /// `keccak256(abi.encode(assetType, limit, token))`
    pub fn hash(&self) -> MachineResult<H256> {
        let encoded = encode(&[
            Token::Uint8(self.asset_type as u8),
            Token::Uint(self.limit),
            Token::Address(self.token),
        ])?;
        Ok(keccak256(&encoded))
    }
}

/// The app definition contract and how its state and actions are encoded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AppInterface {
    pub addr: Address,
    pub state_encoding: String,
    pub action_encoding: Option<String>,
}

/// Everything needed to install an app, before a sequence number is assigned.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AppProposal {
    pub app_interface: AppInterface,
    pub terms: Terms,
    pub default_timeout: u64,
    #[serde(with = "hex_bytes")]
    pub initial_state: Vec<u8>,
}

/// The tuple that identifies an app on chain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppIdentity {
    pub owner: Address,
    pub signing_keys: Vec<Address>,
    pub app_definition: Address,
    pub terms_hash: H256,
    pub default_timeout: u64,
    pub app_seq_no: u64,
}

impl AppIdentity {
    fn members(&self) -> Vec<Token> {
        vec![
            Token::Address(self.owner),
            Token::addresses(&self.signing_keys),
            Token::Address(self.app_definition),
            Token::Bytes32(self.terms_hash),
            Token::Uint(u128::from(self.default_timeout)),
            Token::Uint(u128::from(self.app_seq_no)),
        ]
    }

    /// ABI tuple form, as passed to the app registry.
    pub fn to_token(&self) -> Token {
        Token::Tuple(self.members())
    }

    /// `keccak256(abi.encode(owner, signingKeys, appDefinition, termsHash, defaultTimeout, appSeqNo))`
    pub fn hash(&self) -> MachineResult<H256> {
        Ok(keccak256(&encode(&self.members())?))
    }
}

/// Key under which the nonce registry records that the app at `app_seq_no`
/// was uninstalled.
///
/// `keccak256(abi.encodePacked(multisig, uint256(0), keccak256(abi.encodePacked(uint256(appSeqNo)))))`
pub fn uninstall_key(multisig_address: Address, app_seq_no: u64) -> MachineResult<H256> {
    let salt = keccak256(&encode_packed(&[Token::Uint(u128::from(app_seq_no))])?);
    let packed = encode_packed(&[
        Token::Address(multisig_address),
        Token::Uint(0),
        Token::Bytes32(salt),
    ])?;
    Ok(keccak256(&packed))
}

/// An installed app.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AppInstance {
    /// Multisig of the channel the app lives in.
    pub multisig_address: Address,
    /// Addresses whose signatures update the app, sorted ascending.
    pub signing_keys: Vec<Address>,
    pub default_timeout: u64,
    pub app_interface: AppInterface,
    pub terms: Terms,
    pub is_virtual_app: bool,
    pub app_seq_no: u64,
    pub root_nonce_value: u64,
    #[serde(with = "hex_bytes")]
    pub latest_state: Vec<u8>,
    pub latest_nonce: u64,
    pub latest_timeout: u64,
}

impl AppInstance {
    /// Instantiate a proposal at `app_seq_no` in the channel at `multisig_address`.
    pub fn from_proposal(
        proposal: &AppProposal,
        multisig_address: Address,
        mut signing_keys: Vec<Address>,
        app_seq_no: u64,
        root_nonce_value: u64,
        is_virtual_app: bool,
    ) -> Self {
        signing_keys.sort();
        Self {
            multisig_address,
            signing_keys,
            default_timeout: proposal.default_timeout,
            app_interface: proposal.app_interface.clone(),
            terms: proposal.terms.clone(),
            is_virtual_app,
            app_seq_no,
            root_nonce_value,
            latest_state: proposal.initial_state.clone(),
            latest_nonce: 0,
            latest_timeout: proposal.default_timeout,
        }
    }

    pub fn identity(&self) -> MachineResult<AppIdentity> {
        Ok(AppIdentity {
            owner: self.multisig_address,
            signing_keys: self.signing_keys.clone(),
            app_definition: self.app_interface.addr,
            terms_hash: self.terms.hash()?,
            default_timeout: self.default_timeout,
            app_seq_no: self.app_seq_no,
        })
    }

    /// The identity hash, the app's permanent id.
    pub fn identity_hash(&self) -> MachineResult<H256> {
        self.identity()?.hash()
    }

    pub fn hash_of_latest_state(&self) -> H256 {
        keccak256(&self.latest_state)
    }

    /// Nonce-registry key marking this app uninstalled.
    pub fn uninstall_key(&self) -> MachineResult<H256> {
        uninstall_key(self.multisig_address, self.app_seq_no)
    }

    /// A copy with `state` as the latest state and the nonce advanced by one.
    pub fn set_state(&self, state: Vec<u8>, timeout: Option<u64>) -> Self {
        Self {
            latest_state: state,
            latest_nonce: self.latest_nonce + 1,
            latest_timeout: timeout.unwrap_or(self.default_timeout),
            ..self.clone()
        }
    }

    /// A copy frozen at `nonce_expiry`; no later update can supersede it.
    pub fn lock_state(&self, nonce_expiry: u64) -> Self {
        Self {
            latest_nonce: nonce_expiry,
            ..self.clone()
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) fn sample_proposal() -> AppProposal {
        AppProposal {
            app_interface: AppInterface {
                addr: Address([0x42; 20]),
                state_encoding: "tuple(uint256 counter)".to_string(),
                action_encoding: Some("tuple(uint256 increment)".to_string()),
            },
            terms: Terms::eth(4),
            default_timeout: 100,
            initial_state: encode(&[Token::Uint(0)]).unwrap(),
        }
    }

    fn sample_app() -> AppInstance {
        AppInstance::from_proposal(
            &sample_proposal(),
            Address([0x01; 20]),
            vec![Address([0x03; 20]), Address([0x02; 20])],
            2,
            0,
            false,
        )
    }

    #[test]
    fn test_signing_keys_sorted() {
        let app = sample_app();
        assert!(app.signing_keys[0] < app.signing_keys[1]);
    }

    #[test]
    fn test_identity_hash_depends_on_seq_no() {
        let a = sample_app();
        let mut b = sample_app();
        b.app_seq_no = 3;
        assert_ne!(a.identity_hash().unwrap(), b.identity_hash().unwrap());
        assert_eq!(a.identity_hash().unwrap(), sample_app().identity_hash().unwrap());
    }

    #[test]
    fn test_identity_hash_stable_across_updates() {
        let app = sample_app();
        let updated = app.set_state(vec![1, 2, 3], None);
        assert_eq!(updated.latest_nonce, 1);
        assert_eq!(app.latest_nonce, 0);
        assert_eq!(app.identity_hash().unwrap(), updated.identity_hash().unwrap());
    }

    #[test]
    fn test_lock_state() {
        let locked = sample_app().lock_state(65_536);
        assert_eq!(locked.latest_nonce, 65_536);
    }

    #[test]
    fn test_uninstall_key_varies_with_seq_no() {
        let multisig = Address([9; 20]);
        assert_ne!(
            uninstall_key(multisig, 1).unwrap(),
            uninstall_key(multisig, 2).unwrap()
        );
    }

    #[test]
    fn test_json_roundtrip() {
        let app = sample_app();
        let json = serde_json::to_string(&app).unwrap();
        assert!(json.contains("latestState"));
        let parsed: AppInstance = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, app);
    }
}
