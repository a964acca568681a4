//! Per-protocol parameters carried by every message of a run.

use sc_abi::{encode_packed, Token};
use sc_crypto::{keccak256, Address, ExtendedPublicKey, H256};
use serde::{Deserialize, Serialize};

use crate::error::{MachineError, MachineResult};
use crate::inbox::InboxKey;
use crate::models::hex_bytes;
use crate::models::{channel_between, AppProposal, StateChannelsMap};
use crate::protocol::Protocol;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SetupParams {
    pub initiating_xpub: ExtendedPublicKey,
    pub responding_xpub: ExtendedPublicKey,
    pub multisig_address: Address,
}

/// Install an app funded from the channel's free balance.
///
/// Decrements are in `(alice, bob)` form, alice being the lower owner address.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstallParams {
    pub initiating_xpub: ExtendedPublicKey,
    pub responding_xpub: ExtendedPublicKey,
    pub multisig_address: Address,
    pub proposal: AppProposal,
    pub alice_balance_decrement: u128,
    pub bob_balance_decrement: u128,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateParams {
    pub initiating_xpub: ExtendedPublicKey,
    pub responding_xpub: ExtendedPublicKey,
    pub multisig_address: Address,
    pub app_identity_hash: H256,
    #[serde(with = "hex_bytes")]
    pub new_state: Vec<u8>,
}

/// Advance an app by an action; each side computes the new state itself.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TakeActionParams {
    pub initiating_xpub: ExtendedPublicKey,
    pub responding_xpub: ExtendedPublicKey,
    pub multisig_address: Address,
    pub app_identity_hash: H256,
    #[serde(with = "hex_bytes")]
    pub action: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UninstallParams {
    pub initiating_xpub: ExtendedPublicKey,
    pub responding_xpub: ExtendedPublicKey,
    pub multisig_address: Address,
    pub app_identity_hash: H256,
    pub alice_balance_increment: u128,
    pub bob_balance_increment: u128,
}

/// Move `amount` of the initiator's free balance out of the multisig.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WithdrawParams {
    pub initiating_xpub: ExtendedPublicKey,
    pub responding_xpub: ExtendedPublicKey,
    pub multisig_address: Address,
    pub recipient: Address,
    pub amount: u128,
}

/// Install a virtual app between initiator and responder through an
/// intermediary both share a channel with.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstallVirtualAppParams {
    pub initiating_xpub: ExtendedPublicKey,
    pub responding_xpub: ExtendedPublicKey,
    pub intermediary_xpub: ExtendedPublicKey,
    pub proposal: AppProposal,
    pub initiating_balance_decrement: u128,
    pub responding_balance_decrement: u128,
    /// Block after which the agreements resolve without the virtual app.
    pub expiry: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UninstallVirtualAppParams {
    pub initiating_xpub: ExtendedPublicKey,
    pub responding_xpub: ExtendedPublicKey,
    pub intermediary_xpub: ExtendedPublicKey,
    pub target_app_identity_hash: H256,
    /// Final state the app is locked at.
    #[serde(with = "hex_bytes")]
    pub target_app_state: Vec<u8>,
    pub initiating_balance_increment: u128,
    pub responding_balance_increment: u128,
}

/// Parameters of a protocol run, tagged by protocol.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "protocol", content = "params")]
pub enum ProtocolParams {
    Setup(SetupParams),
    Install(InstallParams),
    Update(UpdateParams),
    TakeAction(TakeActionParams),
    Withdraw(WithdrawParams),
    Uninstall(UninstallParams),
    InstallVirtualApp(InstallVirtualAppParams),
    UninstallVirtualApp(UninstallVirtualAppParams),
}

macro_rules! params_accessor {
    ($name:ident, $variant:ident, $ty:ty) => {
        pub fn $name(&self) -> MachineResult<&$ty> {
            match self {
                ProtocolParams::$variant(params) => Ok(params),
                other => Err(MachineError::violation(
                    other.protocol(),
                    concat!("expected ", stringify!($variant), " parameters"),
                )),
            }
        }
    };
}

impl ProtocolParams {
    pub fn protocol(&self) -> Protocol {
        match self {
            ProtocolParams::Setup(_) => Protocol::Setup,
            ProtocolParams::Install(_) => Protocol::Install,
            ProtocolParams::Update(_) => Protocol::Update,
            ProtocolParams::TakeAction(_) => Protocol::TakeAction,
            ProtocolParams::Withdraw(_) => Protocol::Withdraw,
            ProtocolParams::Uninstall(_) => Protocol::Uninstall,
            ProtocolParams::InstallVirtualApp(_) => Protocol::InstallVirtualApp,
            ProtocolParams::UninstallVirtualApp(_) => Protocol::UninstallVirtualApp,
        }
    }

    pub fn initiating_xpub(&self) -> &ExtendedPublicKey {
        match self {
            ProtocolParams::Setup(p) => &p.initiating_xpub,
            ProtocolParams::Install(p) => &p.initiating_xpub,
            ProtocolParams::Update(p) => &p.initiating_xpub,
            ProtocolParams::TakeAction(p) => &p.initiating_xpub,
            ProtocolParams::Withdraw(p) => &p.initiating_xpub,
            ProtocolParams::Uninstall(p) => &p.initiating_xpub,
            ProtocolParams::InstallVirtualApp(p) => &p.initiating_xpub,
            ProtocolParams::UninstallVirtualApp(p) => &p.initiating_xpub,
        }
    }

    pub fn responding_xpub(&self) -> &ExtendedPublicKey {
        match self {
            ProtocolParams::Setup(p) => &p.responding_xpub,
            ProtocolParams::Install(p) => &p.responding_xpub,
            ProtocolParams::Update(p) => &p.responding_xpub,
            ProtocolParams::TakeAction(p) => &p.responding_xpub,
            ProtocolParams::Withdraw(p) => &p.responding_xpub,
            ProtocolParams::Uninstall(p) => &p.responding_xpub,
            ProtocolParams::InstallVirtualApp(p) => &p.responding_xpub,
            ProtocolParams::UninstallVirtualApp(p) => &p.responding_xpub,
        }
    }

    pub fn intermediary_xpub(&self) -> Option<&ExtendedPublicKey> {
        match self {
            ProtocolParams::InstallVirtualApp(p) => Some(&p.intermediary_xpub),
            ProtocolParams::UninstallVirtualApp(p) => Some(&p.intermediary_xpub),
            _ => None,
        }
    }

    /// The channel a two-party run operates on, or the virtual channel of a
    /// virtual-app run.
    pub fn multisig_address(&self) -> MachineResult<Address> {
        match self {
            ProtocolParams::Setup(p) => Ok(p.multisig_address),
            ProtocolParams::Install(p) => Ok(p.multisig_address),
            ProtocolParams::Update(p) => Ok(p.multisig_address),
            ProtocolParams::TakeAction(p) => Ok(p.multisig_address),
            ProtocolParams::Withdraw(p) => Ok(p.multisig_address),
            ProtocolParams::Uninstall(p) => Ok(p.multisig_address),
            ProtocolParams::InstallVirtualApp(p) => {
                virtual_channel_address(&p.initiating_xpub, &p.responding_xpub, &p.intermediary_xpub)
            }
            ProtocolParams::UninstallVirtualApp(p) => {
                virtual_channel_address(&p.initiating_xpub, &p.responding_xpub, &p.intermediary_xpub)
            }
        }
    }

    /// The app a run targets, if it targets an existing one.
    pub fn app_identity_hash(&self) -> Option<H256> {
        match self {
            ProtocolParams::Update(p) => Some(p.app_identity_hash),
            ProtocolParams::TakeAction(p) => Some(p.app_identity_hash),
            ProtocolParams::Uninstall(p) => Some(p.app_identity_hash),
            ProtocolParams::UninstallVirtualApp(p) => Some(p.target_app_identity_hash),
            _ => None,
        }
    }

    /// Queue continuation messages of this run are delivered to.
    pub fn inbox_key(&self) -> MachineResult<InboxKey> {
        match self {
            ProtocolParams::Update(p) => Ok(InboxKey::App(p.app_identity_hash)),
            ProtocolParams::TakeAction(p) => Ok(InboxKey::App(p.app_identity_hash)),
            _ => Ok(InboxKey::Multisig(self.multisig_address()?)),
        }
    }

    /// Lock keys a run must hold: its own queue, the channel it changes and,
    /// for virtual-app runs, every leg the local node is party to.
    pub fn lock_keys(
        &self,
        me: &ExtendedPublicKey,
        channels: &StateChannelsMap,
    ) -> MachineResult<Vec<String>> {
        let mut keys = vec![
            self.inbox_key()?.to_string(),
            InboxKey::Multisig(self.multisig_address()?).to_string(),
        ];
        if let Some(intermediary) = self.intermediary_xpub() {
            for party in [self.initiating_xpub(), self.responding_xpub()] {
                let leg = if me == intermediary {
                    channel_between(channels, party, intermediary)
                } else if me == party {
                    channel_between(channels, me, intermediary)
                } else {
                    None
                };
                if let Some(leg) = leg {
                    keys.push(InboxKey::Multisig(leg.multisig_address()).to_string());
                }
            }
        }
        keys.sort();
        keys.dedup();
        Ok(keys)
    }

    params_accessor!(as_setup, Setup, SetupParams);
    params_accessor!(as_install, Install, InstallParams);
    params_accessor!(as_update, Update, UpdateParams);
    params_accessor!(as_take_action, TakeAction, TakeActionParams);
    params_accessor!(as_withdraw, Withdraw, WithdrawParams);
    params_accessor!(as_uninstall, Uninstall, UninstallParams);
    params_accessor!(as_install_virtual_app, InstallVirtualApp, InstallVirtualAppParams);
    params_accessor!(as_uninstall_virtual_app, UninstallVirtualApp, UninstallVirtualAppParams);
}

/// Address of the virtual channel between two parties through an
/// intermediary.
///
/// The virtual channel has no multisig; the address is
/// `keccak256(sortedPartyOwners[] ‖ intermediaryOwner)[12..]`, the same on all
/// three nodes whichever party initiates.
pub fn virtual_channel_address(
    initiating: &ExtendedPublicKey,
    responding: &ExtendedPublicKey,
    intermediary: &ExtendedPublicKey,
) -> MachineResult<Address> {
    let mut parties = vec![initiating.owner_address()?, responding.owner_address()?];
    parties.sort();
    let packed = encode_packed(&[
        Token::addresses(&parties),
        Token::Address(intermediary.owner_address()?),
    ])?;
    Ok(Address::from_slice(&keccak256(&packed).as_bytes()[12..])?)
}
