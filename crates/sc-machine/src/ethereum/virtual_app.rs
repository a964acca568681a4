//! State updates of virtual apps.
//!
//! The two app parties sign the usual set-state digest. The intermediary
//! never sees app state; it signs a digest over the identity and the nonce
//! expiry only, which bounds how long the virtual app can keep updating:
//!
//! ```text
//! parties:      keccak256(0x19 ‖ identityHash ‖ nonce       ‖ timeout ‖ stateHash)
//! intermediary: keccak256(0x19 ‖ identityHash ‖ nonceExpiry ‖ timeout ‖ 0x01)
//! ```

use sc_abi::{encode_function_call, encode_packed, Token};
use sc_crypto::{keccak256, signatures_to_sorted_bytes, Address, H256, Signature};

use crate::config::NetworkContext;
use crate::error::{MachineError, MachineResult};
use crate::ethereum::{CommitmentKind, EthereumCommitment, Transaction};
use crate::models::{AppIdentity, AppInstance};

const VIRTUAL_APP_SET_STATE: &str = "virtualAppSetState((address,address[],address,bytes32,uint256,uint256),(bytes32,uint256,uint256,uint256,bytes))";

/// Set-state of a virtual app, co-signed by the intermediary.
#[derive(Debug, Clone)]
pub struct VirtualAppSetStateCommitment {
    app_registry: Address,
    identity: AppIdentity,
    intermediary: Address,
    state_hash: H256,
    nonce: u64,
    timeout: u64,
    nonce_expiry: u64,
    hash: H256,
    intermediary_hash: H256,
}

impl VirtualAppSetStateCommitment {
    /// # Arguments
    /// * `intermediary` - Address the intermediary signs with
    /// * `nonce_expiry` - Nonce beyond which the intermediary's signature is void
    pub fn new(
        network: &NetworkContext,
        app: &AppInstance,
        intermediary: Address,
        nonce_expiry: u64,
    ) -> MachineResult<Self> {
        let identity = app.identity()?;
        let identity_hash = identity.hash()?;
        let state_hash = app.hash_of_latest_state();

        let hash = keccak256(&encode_packed(&[
            Token::FixedBytes(vec![0x19]),
            Token::Bytes32(identity_hash),
            Token::Uint(u128::from(app.latest_nonce)),
            Token::Uint(u128::from(app.latest_timeout)),
            Token::Bytes32(state_hash),
        ])?);
        let intermediary_hash = keccak256(&encode_packed(&[
            Token::FixedBytes(vec![0x19]),
            Token::Bytes32(identity_hash),
            Token::Uint(u128::from(nonce_expiry)),
            Token::Uint(u128::from(app.latest_timeout)),
            Token::FixedBytes(vec![0x01]),
        ])?);

        Ok(Self {
            app_registry: network.app_registry,
            identity,
            intermediary,
            state_hash,
            nonce: app.latest_nonce,
            timeout: app.latest_timeout,
            nonce_expiry,
            hash,
            intermediary_hash,
        })
    }

    fn is_intermediary_signature(&self, signature: &Signature) -> bool {
        signature
            .recover(&self.intermediary_hash)
            .is_ok_and(|signer| signer == self.intermediary)
    }
}

impl EthereumCommitment for VirtualAppSetStateCommitment {
    fn kind(&self) -> CommitmentKind {
        CommitmentKind::VirtualAppSetState
    }

    fn hash_to_sign(&self) -> H256 {
        self.hash
    }

    fn hash_to_sign_as_intermediary(&self) -> Option<H256> {
        Some(self.intermediary_hash)
    }

    /// Packs the intermediary signature first, then the parties' signatures
    /// sorted by signer.
    fn transaction(&self, signatures: &[Signature]) -> MachineResult<Transaction> {
        let (intermediary, parties): (Vec<Signature>, Vec<Signature>) = signatures
            .iter()
            .copied()
            .partition(|sig| self.is_intermediary_signature(sig));
        let intermediary = intermediary.first().ok_or_else(|| {
            MachineError::MissingSignature("virtual app set-state needs the intermediary".into())
        })?;

        let mut packed = intermediary.as_bytes().to_vec();
        packed.extend(signatures_to_sorted_bytes(&parties, &self.hash)?);

        let data = encode_function_call(
            VIRTUAL_APP_SET_STATE,
            &[
                self.identity.to_token(),
                Token::Tuple(vec![
                    Token::Bytes32(self.state_hash),
                    Token::Uint(u128::from(self.nonce)),
                    Token::Uint(u128::from(self.timeout)),
                    Token::Uint(u128::from(self.nonce_expiry)),
                    Token::Bytes(packed),
                ]),
            ],
        )?;
        Ok(Transaction {
            to: self.app_registry,
            value: 0,
            data,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::app_instance::tests::sample_proposal;
    use sc_crypto::ExtendedPrivateKey;

    struct Parties {
        a: ExtendedPrivateKey,
        b: ExtendedPrivateKey,
        i: ExtendedPrivateKey,
    }

    fn parties() -> Parties {
        Parties {
            a: ExtendedPrivateKey::generate(),
            b: ExtendedPrivateKey::generate(),
            i: ExtendedPrivateKey::generate(),
        }
    }

    fn commitment(p: &Parties) -> VirtualAppSetStateCommitment {
        let keys = vec![
            p.a.neuter().kth_address(1).unwrap(),
            p.b.neuter().kth_address(1).unwrap(),
        ];
        let app = AppInstance::from_proposal(&sample_proposal(), Address([0xdd; 20]), keys, 1, 0, true);
        VirtualAppSetStateCommitment::new(
            &NetworkContext::deterministic(),
            &app,
            p.i.neuter().owner_address().unwrap(),
            65_536,
        )
        .unwrap()
    }

    #[test]
    fn test_intermediary_digest_differs() {
        let p = parties();
        let c = commitment(&p);
        assert_ne!(Some(c.hash_to_sign()), c.hash_to_sign_as_intermediary());
    }

    #[test]
    fn test_transaction_puts_intermediary_first() {
        let p = parties();
        let c = commitment(&p);
        let sig_a = p.a.kth_keypair(1).unwrap().sign_digest(&c.hash_to_sign());
        let sig_b = p.b.kth_keypair(1).unwrap().sign_digest(&c.hash_to_sign());
        let sig_i = p
            .i
            .kth_keypair(0)
            .unwrap()
            .sign_digest(&c.hash_to_sign_as_intermediary().unwrap());

        let one = c.transaction(&[sig_a, sig_i, sig_b]).unwrap();
        let two = c.transaction(&[sig_b, sig_a, sig_i]).unwrap();
        assert_eq!(one, two);
        // signature bytes are the last, padded, calldata field
        let start = one.data.len() - (3 * 65usize).div_ceil(32) * 32;
        assert_eq!(&one.data[start..start + 65], sig_i.as_bytes());
    }

    #[test]
    fn test_transaction_requires_intermediary() {
        let p = parties();
        let c = commitment(&p);
        let sig_a = p.a.kth_keypair(1).unwrap().sign_digest(&c.hash_to_sign());
        let sig_b = p.b.kth_keypair(1).unwrap().sign_digest(&c.hash_to_sign());
        assert!(matches!(
            c.transaction(&[sig_a, sig_b]),
            Err(MachineError::MissingSignature(_))
        ));
    }
}
