//! Wire message exchanged between protocol participants.

use sc_crypto::{random_bytes_32, ExtendedPublicKey, Signature, H256};
use serde::{Deserialize, Serialize};

use crate::protocol::{Protocol, ProtocolParams};

/// One message of a protocol run.
///
/// Every message carries the run's full parameters so that a node seeing the
/// run for the first time can build the same commitments as its sender.
/// `seq` numbers messages within a run; the run's starting message, which is
/// never sent, has `seq` 0. `run_id` is drawn by the initiator and copied to
/// every message of the run, so a late message from an earlier run on the
/// same channel can be told apart from the one a run is waiting for.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProtocolMessage {
    pub protocol: Protocol,
    pub run_id: H256,
    pub params: ProtocolParams,
    pub from_xpub: ExtendedPublicKey,
    pub to_xpub: ExtendedPublicKey,
    pub seq: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signature: Option<Signature>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signature2: Option<Signature>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signature3: Option<Signature>,
}

impl ProtocolMessage {
    /// The starting message of a run this node initiates.
    pub fn starting(params: ProtocolParams, from_xpub: ExtendedPublicKey, to_xpub: ExtendedPublicKey) -> Self {
        Self {
            protocol: params.protocol(),
            run_id: H256(random_bytes_32()),
            params,
            from_xpub,
            to_xpub,
            seq: 0,
            signature: None,
            signature2: None,
            signature3: None,
        }
    }

    /// A message of the same run from `from_xpub` to `to_xpub`.
    pub fn forward(&self, from_xpub: ExtendedPublicKey, to_xpub: ExtendedPublicKey, seq: u32) -> Self {
        Self {
            protocol: self.protocol,
            run_id: self.run_id,
            params: self.params.clone(),
            from_xpub,
            to_xpub,
            seq,
            signature: None,
            signature2: None,
            signature3: None,
        }
    }

    pub fn with_signatures(
        mut self,
        signature: Option<Signature>,
        signature2: Option<Signature>,
        signature3: Option<Signature>,
    ) -> Self {
        self.signature = signature;
        self.signature2 = signature2;
        self.signature3 = signature3;
        self
    }

    /// Whether `self` belongs to the same run as `other`.
    pub fn same_run(&self, other: &ProtocolMessage) -> bool {
        self.run_id == other.run_id && self.protocol == other.protocol && self.params == other.params
    }

    /// Whether this message starts a run on the receiving node.
    pub fn starts_run(&self) -> bool {
        self.protocol.role_started_by(self.seq).is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::SetupParams;
    use sc_crypto::{Address, ExtendedPrivateKey, H256};

    fn message() -> ProtocolMessage {
        let a = ExtendedPrivateKey::generate().neuter();
        let b = ExtendedPrivateKey::generate().neuter();
        let params = ProtocolParams::Setup(SetupParams {
            initiating_xpub: a,
            responding_xpub: b,
            multisig_address: Address([3; 20]),
        });
        ProtocolMessage::starting(params, a, b)
    }

    #[test]
    fn test_forward_keeps_params() {
        let start = message();
        let next = start.forward(start.from_xpub, start.to_xpub, 1);
        assert_eq!(next.params, start.params);
        assert_eq!(next.run_id, start.run_id);
        assert!(next.same_run(&start));
        assert_eq!(next.seq, 1);
        assert!(next.starts_run());
        assert!(!start.starts_run());
    }

    #[test]
    fn test_runs_with_equal_params_differ() {
        let first = message();
        let second = ProtocolMessage::starting(first.params.clone(), first.from_xpub, first.to_xpub);
        assert_ne!(first.run_id, second.run_id);
        assert!(!second.same_run(&first));
    }

    #[test]
    fn test_json_roundtrip_with_signature() {
        let key = ExtendedPrivateKey::generate().kth_keypair(0).unwrap();
        let sig = key.sign_digest(&H256([5; 32]));
        let start = message();
        let msg = start
            .forward(start.from_xpub, start.to_xpub, 1)
            .with_signatures(Some(sig), None, None);
        let json = serde_json::to_string(&msg).unwrap();
        assert!(!json.contains("signature2"));
        let parsed: ProtocolMessage = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, msg);
    }
}
