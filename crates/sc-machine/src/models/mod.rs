//! Channel and app data model.

pub mod agreement;
pub mod app_instance;
pub mod free_balance;
pub mod state_channel;

use std::collections::BTreeMap;

use sc_crypto::{Address, ExtendedPublicKey};

pub use agreement::EthVirtualAppAgreementInstance;
pub use app_instance::{uninstall_key, AppIdentity, AppInstance, AppInterface, AppProposal, AssetType, Terms};
pub use free_balance::FreeBalanceState;
pub use state_channel::StateChannel;

/// Channels known to a node, keyed by multisig address.
pub type StateChannelsMap = BTreeMap<Address, StateChannel>;

/// The channel in `channels` owned by exactly `a` and `b`.
pub fn channel_between<'a>(
    channels: &'a StateChannelsMap,
    a: &ExtendedPublicKey,
    b: &ExtendedPublicKey,
) -> Option<&'a StateChannel> {
    channels
        .values()
        .find(|channel| channel.has_free_balance() && channel.is_between(a, b))
}

/// Serde adapter storing byte blobs as `0x`-prefixed hex strings.
pub(crate) mod hex_bytes {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&format!("0x{}", hex::encode(bytes)))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(deserializer)?;
        hex::decode(s.trim_start_matches("0x")).map_err(serde::de::Error::custom)
    }
}
