//! App state updates on the app registry.

use sc_abi::{encode_function_call, encode_packed, Token};
use sc_crypto::{keccak256, signatures_to_sorted_bytes, Address, H256, Signature};

use crate::config::NetworkContext;
use crate::error::MachineResult;
use crate::ethereum::multisig::SET_STATE;
use crate::ethereum::{CommitmentKind, EthereumCommitment, Transaction};
use crate::models::{AppIdentity, AppInstance};

/// `setState(appIdentity, {stateHash, nonce, timeout, signatures})`.
///
/// Signed by the app's signing keys over
/// `keccak256(0x19 ‖ identityHash ‖ nonce ‖ timeout ‖ stateHash)`.
#[derive(Debug, Clone)]
pub struct SetStateCommitment {
    app_registry: Address,
    identity: AppIdentity,
    state_hash: H256,
    nonce: u64,
    timeout: u64,
    hash: H256,
}

impl SetStateCommitment {
    pub fn new(
        network: &NetworkContext,
        identity: AppIdentity,
        state_hash: H256,
        nonce: u64,
        timeout: u64,
    ) -> MachineResult<Self> {
        let packed = encode_packed(&[
            Token::FixedBytes(vec![0x19]),
            Token::Bytes32(identity.hash()?),
            Token::Uint(u128::from(nonce)),
            Token::Uint(u128::from(timeout)),
            Token::Bytes32(state_hash),
        ])?;
        Ok(Self {
            app_registry: network.app_registry,
            identity,
            state_hash,
            nonce,
            timeout,
            hash: keccak256(&packed),
        })
    }

    /// Commitment to the app's latest state.
    pub fn for_app(network: &NetworkContext, app: &AppInstance) -> MachineResult<Self> {
        Self::new(
            network,
            app.identity()?,
            app.hash_of_latest_state(),
            app.latest_nonce,
            app.latest_timeout,
        )
    }
}

impl EthereumCommitment for SetStateCommitment {
    fn kind(&self) -> CommitmentKind {
        CommitmentKind::SetState
    }

    fn hash_to_sign(&self) -> H256 {
        self.hash
    }

    fn transaction(&self, signatures: &[Signature]) -> MachineResult<Transaction> {
        let sorted = signatures_to_sorted_bytes(signatures, &self.hash)?;
        let data = encode_function_call(
            SET_STATE,
            &[
                self.identity.to_token(),
                Token::Tuple(vec![
                    Token::Bytes32(self.state_hash),
                    Token::Uint(u128::from(self.nonce)),
                    Token::Uint(u128::from(self.timeout)),
                    Token::Bytes(sorted),
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

    fn app_with_keys(keys: &[ExtendedPrivateKey]) -> AppInstance {
        let signing_keys = keys
            .iter()
            .map(|key| key.kth_keypair(2).unwrap().address())
            .collect();
        AppInstance::from_proposal(&sample_proposal(), Address([0xcc; 20]), signing_keys, 2, 0, false)
    }

    #[test]
    fn test_hash_tracks_nonce() {
        let network = NetworkContext::deterministic();
        let keys = [ExtendedPrivateKey::generate(), ExtendedPrivateKey::generate()];
        let app = app_with_keys(&keys);
        let before = SetStateCommitment::for_app(&network, &app).unwrap();
        let after = SetStateCommitment::for_app(&network, &app.set_state(app.latest_state.clone(), None)).unwrap();
        assert_ne!(before.hash_to_sign(), after.hash_to_sign());
        assert_eq!(
            before.hash_to_sign(),
            SetStateCommitment::for_app(&network, &app).unwrap().hash_to_sign()
        );
    }

    #[test]
    fn test_transaction_targets_registry() {
        let network = NetworkContext::deterministic();
        let keys = [ExtendedPrivateKey::generate(), ExtendedPrivateKey::generate()];
        let app = app_with_keys(&keys);
        let commitment = SetStateCommitment::for_app(&network, &app).unwrap();
        let sigs: Vec<Signature> = keys
            .iter()
            .map(|key| key.kth_keypair(2).unwrap().sign_digest(&commitment.hash_to_sign()))
            .collect();
        let tx = commitment.transaction(&sigs).unwrap();
        assert_eq!(tx.to, network.app_registry);
        assert_eq!(tx.value, 0);
        assert_eq!(&tx.data[..4], &sc_abi::function_selector(SET_STATE));
    }

    #[test]
    fn test_bit_flip_changes_signer() {
        let network = NetworkContext::deterministic();
        let keys = [ExtendedPrivateKey::generate(), ExtendedPrivateKey::generate()];
        let app = app_with_keys(&keys);
        let commitment = SetStateCommitment::for_app(&network, &app).unwrap();
        let keypair = keys[0].kth_keypair(2).unwrap();
        let sig = keypair.sign_digest(&commitment.hash_to_sign());

        let mut bytes = *sig.as_bytes();
        bytes[10] ^= 0x01;
        let flipped = Signature::from_bytes(bytes);
        assert_ne!(
            flipped.recover(&commitment.hash_to_sign()).ok(),
            Some(keypair.address())
        );
    }
}
