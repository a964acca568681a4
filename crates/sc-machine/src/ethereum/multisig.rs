//! Multisig-executed commitments.
//!
//! The channel multisig executes a transaction once every owner signed
//!
//! ```text
//! keccak256(0x19 ‖ owners ‖ to ‖ value ‖ data ‖ operation)
//! ```
//!
//! Transitions that touch the free balance and another contract in one step
//! batch both calls through MultiSend so that they land atomically.

use sc_abi::{encode, encode_function_call, encode_packed, Token};
use sc_crypto::{keccak256, signatures_to_sorted_bytes, Address, H256, Signature};

use crate::config::NetworkContext;
use crate::error::MachineResult;
use crate::ethereum::{CommitmentKind, EthereumCommitment, Operation, Transaction};
use crate::models::{AppInstance, EthVirtualAppAgreementInstance};

const EXEC_TRANSACTION: &str = "execTransaction(address,uint256,bytes,uint8,bytes)";
const MULTI_SEND: &str = "multiSend(bytes)";
const SET_NONCE: &str = "setNonce(uint256,bytes32,uint256)";
const EXECUTE_CONDITIONAL: &str =
    "executeAppConditionalTransaction(address,address,bytes32,uint256,bytes32,(uint8,uint256,address))";
const DELEGATE_AGREEMENT: &str =
    "delegateTarget((address,bytes32,uint256,uint256,uint256,uint256,address[],bytes32),address,address,bytes32)";
pub(crate) const SET_STATE: &str =
    "setState((address,address[],address,bytes32,uint256,uint256),(bytes32,uint256,uint256,bytes))";

/// A transaction the multisig executes on behalf of its owners.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MultisigTransaction {
    pub to: Address,
    pub value: u128,
    pub data: Vec<u8>,
    pub operation: Operation,
}

impl MultisigTransaction {
    /// Digest the owners sign.
    pub fn hash_to_sign(&self, owners: &[Address]) -> MachineResult<H256> {
        let packed = encode_packed(&[
            Token::FixedBytes(vec![0x19]),
            Token::addresses(owners),
            Token::Address(self.to),
            Token::Uint(self.value),
            Token::Bytes(self.data.clone()),
            Token::Uint8(self.operation as u8),
        ])?;
        Ok(keccak256(&packed))
    }

    /// Batch several transactions into one MultiSend delegatecall.
    pub fn multi_send(network: &NetworkContext, transactions: &[MultisigTransaction]) -> MachineResult<Self> {
        let mut batch = Vec::new();
        for tx in transactions {
            batch.extend(encode(&[
                Token::Uint8(tx.operation as u8),
                Token::Address(tx.to),
                Token::Uint(tx.value),
                Token::Bytes(tx.data.clone()),
            ])?);
        }
        Ok(Self {
            to: network.multi_send,
            value: 0,
            data: encode_function_call(MULTI_SEND, &[Token::Bytes(batch)])?,
            operation: Operation::DelegateCall,
        })
    }
}

/// A multisig commitment with its digest precomputed.
#[derive(Debug, Clone)]
pub struct MultisigCommitment {
    kind: CommitmentKind,
    multisig_address: Address,
    owners: Vec<Address>,
    inner: MultisigTransaction,
    hash: H256,
}

impl MultisigCommitment {
    pub fn new(
        kind: CommitmentKind,
        multisig_address: Address,
        owners: &[Address],
        inner: MultisigTransaction,
    ) -> MachineResult<Self> {
        let hash = inner.hash_to_sign(owners)?;
        Ok(Self {
            kind,
            multisig_address,
            owners: owners.to_vec(),
            inner,
            hash,
        })
    }

    pub fn inner(&self) -> &MultisigTransaction {
        &self.inner
    }
}

impl EthereumCommitment for MultisigCommitment {
    fn kind(&self) -> CommitmentKind {
        self.kind
    }

    fn hash_to_sign(&self) -> H256 {
        self.hash
    }

    fn transaction(&self, signatures: &[Signature]) -> MachineResult<Transaction> {
        let sorted = signatures_to_sorted_bytes(signatures, &self.hash)?;
        let data = encode_function_call(
            EXEC_TRANSACTION,
            &[
                Token::Address(self.inner.to),
                Token::Uint(self.inner.value),
                Token::Bytes(self.inner.data.clone()),
                Token::Uint8(self.inner.operation as u8),
                Token::Bytes(sorted),
            ],
        )?;
        Ok(Transaction {
            to: self.multisig_address,
            value: 0,
            data,
        })
    }
}

macro_rules! multisig_commitment {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone)]
        pub struct $name(MultisigCommitment);

        impl $name {
            pub fn inner(&self) -> &MultisigTransaction {
                self.0.inner()
            }
        }

        impl EthereumCommitment for $name {
            fn kind(&self) -> CommitmentKind {
                self.0.kind()
            }

            fn hash_to_sign(&self) -> H256 {
                self.0.hash_to_sign()
            }

            fn transaction(&self, signatures: &[Signature]) -> MachineResult<Transaction> {
                self.0.transaction(signatures)
            }
        }
    };
}

/// `setState` on the app registry, executed by the multisig as owner of the
/// free balance, so it needs no app signatures.
fn free_balance_set_state(network: &NetworkContext, free_balance: &AppInstance) -> MachineResult<MultisigTransaction> {
    let data = encode_function_call(
        SET_STATE,
        &[
            free_balance.identity()?.to_token(),
            Token::Tuple(vec![
                Token::Bytes32(free_balance.hash_of_latest_state()),
                Token::Uint(u128::from(free_balance.latest_nonce)),
                Token::Uint(u128::from(free_balance.latest_timeout)),
                Token::Bytes(Vec::new()),
            ]),
        ],
    )?;
    Ok(MultisigTransaction {
        to: network.app_registry,
        value: 0,
        data,
        operation: Operation::Call,
    })
}

/// Delegatecall paying out `app` once its uninstall key is unset.
fn conditional_transaction(network: &NetworkContext, app: &AppInstance) -> MachineResult<MultisigTransaction> {
    let data = encode_function_call(
        EXECUTE_CONDITIONAL,
        &[
            Token::Address(network.app_registry),
            Token::Address(network.nonce_registry),
            Token::Bytes32(app.uninstall_key()?),
            Token::Uint(u128::from(app.root_nonce_value)),
            Token::Bytes32(app.identity_hash()?),
            Token::Tuple(vec![
                Token::Uint8(app.terms.asset_type as u8),
                Token::Uint(app.terms.limit),
                Token::Address(app.terms.token),
            ]),
        ],
    )?;
    Ok(MultisigTransaction {
        to: network.state_channel_transaction,
        value: 0,
        data,
        operation: Operation::DelegateCall,
    })
}

multisig_commitment!(
    /// Installs the free balance and its conditional transaction.
    SetupCommitment
);

impl SetupCommitment {
    pub fn new(
        network: &NetworkContext,
        multisig_address: Address,
        owners: &[Address],
        free_balance: &AppInstance,
    ) -> MachineResult<Self> {
        let inner = conditional_transaction(network, free_balance)?;
        Ok(Self(MultisigCommitment::new(
            CommitmentKind::Setup,
            multisig_address,
            owners,
            inner,
        )?))
    }
}

multisig_commitment!(
    /// Debits the free balance and installs an app's conditional transaction.
    InstallCommitment
);

impl InstallCommitment {
    /// # Arguments
    /// * `free_balance` - The free balance after the debit
    /// * `app` - The app being installed
    pub fn new(
        network: &NetworkContext,
        multisig_address: Address,
        owners: &[Address],
        free_balance: &AppInstance,
        app: &AppInstance,
    ) -> MachineResult<Self> {
        let inner = MultisigTransaction::multi_send(
            network,
            &[
                free_balance_set_state(network, free_balance)?,
                conditional_transaction(network, app)?,
            ],
        )?;
        Ok(Self(MultisigCommitment::new(
            CommitmentKind::Install,
            multisig_address,
            owners,
            inner,
        )?))
    }
}

multisig_commitment!(
    /// Credits the free balance and marks an app uninstalled in the nonce
    /// registry, which voids its conditional transaction.
    UninstallCommitment
);

impl UninstallCommitment {
    /// # Arguments
    /// * `free_balance` - The free balance after the credit
    /// * `app_seq_no` - Sequence number of the app (or agreement) removed
    pub fn new(
        network: &NetworkContext,
        multisig_address: Address,
        owners: &[Address],
        free_balance: &AppInstance,
        app_seq_no: u64,
    ) -> MachineResult<Self> {
        let salt = keccak256(&encode_packed(&[Token::Uint(u128::from(app_seq_no))])?);
        let set_nonce = MultisigTransaction {
            to: network.nonce_registry,
            value: 0,
            data: encode_function_call(
                SET_NONCE,
                &[Token::Uint(0), Token::Bytes32(salt), Token::Uint(1)],
            )?,
            operation: Operation::Call,
        };
        let inner = MultisigTransaction::multi_send(
            network,
            &[free_balance_set_state(network, free_balance)?, set_nonce],
        )?;
        Ok(Self(MultisigCommitment::new(
            CommitmentKind::Uninstall,
            multisig_address,
            owners,
            inner,
        )?))
    }
}

multisig_commitment!(
    /// Debits a leg's free balance and installs the agreement backing a
    /// virtual app.
    EthVirtualAppAgreementCommitment
);

impl EthVirtualAppAgreementCommitment {
    pub fn new(
        network: &NetworkContext,
        multisig_address: Address,
        owners: &[Address],
        free_balance: &AppInstance,
        agreement: &EthVirtualAppAgreementInstance,
    ) -> MachineResult<Self> {
        let delegate = MultisigTransaction {
            to: network.eth_virtual_app_agreement,
            value: 0,
            data: encode_function_call(
                DELEGATE_AGREEMENT,
                &[
                    agreement.to_token()?,
                    Token::Address(network.app_registry),
                    Token::Address(network.nonce_registry),
                    Token::Bytes32(agreement.uninstall_key()?),
                ],
            )?,
            operation: Operation::DelegateCall,
        };
        let inner = MultisigTransaction::multi_send(
            network,
            &[free_balance_set_state(network, free_balance)?, delegate],
        )?;
        Ok(Self(MultisigCommitment::new(
            CommitmentKind::VirtualAppAgreement,
            multisig_address,
            owners,
            inner,
        )?))
    }
}

multisig_commitment!(
    /// Sends ETH out of the multisig.
    WithdrawEthCommitment
);

impl WithdrawEthCommitment {
    pub fn new(
        multisig_address: Address,
        owners: &[Address],
        recipient: Address,
        amount: u128,
    ) -> MachineResult<Self> {
        let inner = MultisigTransaction {
            to: recipient,
            value: amount,
            data: Vec::new(),
            operation: Operation::Call,
        };
        Ok(Self(MultisigCommitment::new(
            CommitmentKind::WithdrawEth,
            multisig_address,
            owners,
            inner,
        )?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sc_abi::{function_selector, AbiReader};
    use sc_crypto::{ExtendedPrivateKey, ExtendedPublicKey};

    use crate::models::StateChannel;

    fn setup() -> (StateChannel, [ExtendedPrivateKey; 2]) {
        let a = ExtendedPrivateKey::generate();
        let b = ExtendedPrivateKey::generate();
        let xpubs: [ExtendedPublicKey; 2] = [a.neuter(), b.neuter()];
        let channel = StateChannel::setup_channel(
            &NetworkContext::deterministic(),
            Address([0xcc; 20]),
            &xpubs,
            172_800,
        )
        .unwrap();
        (channel, [a, b])
    }

    #[test]
    fn test_setup_commitment_is_deterministic() {
        let network = NetworkContext::deterministic();
        let (channel, _) = setup();
        let build = || {
            SetupCommitment::new(
                &network,
                channel.multisig_address(),
                channel.multisig_owners(),
                channel.free_balance().unwrap(),
            )
            .unwrap()
        };
        let (one, two) = (build(), build());
        assert_eq!(one.hash_to_sign(), two.hash_to_sign());
        assert_eq!(one.inner(), two.inner());
        assert_eq!(one.inner().operation, Operation::DelegateCall);
        assert_eq!(one.inner().to, network.state_channel_transaction);
    }

    #[test]
    fn test_hash_commits_to_owners() {
        let tx = MultisigTransaction {
            to: Address([1; 20]),
            value: 5,
            data: vec![1, 2],
            operation: Operation::Call,
        };
        let a = tx.hash_to_sign(&[Address([2; 20]), Address([3; 20])]).unwrap();
        let b = tx.hash_to_sign(&[Address([2; 20]), Address([4; 20])]).unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn test_exec_transaction_sorts_signatures() {
        let (channel, keys) = setup();
        let commitment = WithdrawEthCommitment::new(
            channel.multisig_address(),
            channel.multisig_owners(),
            Address([0xee; 20]),
            3,
        )
        .unwrap();
        let digest = commitment.hash_to_sign();
        let sigs: Vec<Signature> = keys
            .iter()
            .map(|key| key.kth_keypair(0).unwrap().sign_digest(&digest))
            .collect();
        let forward = commitment.transaction(&sigs).unwrap();
        let reversed: Vec<Signature> = sigs.iter().rev().copied().collect();
        let backward = commitment.transaction(&reversed).unwrap();
        assert_eq!(forward, backward);
        assert_eq!(forward.to, channel.multisig_address());

        let mut reader = AbiReader::new(&forward.data);
        assert_eq!(reader.read_selector().unwrap(), function_selector(EXEC_TRANSACTION));
        assert_eq!(reader.read_address().unwrap(), Address([0xee; 20]));
        assert_eq!(reader.read_uint().unwrap(), 3);
        assert!(reader.read_bytes().unwrap().is_empty());
        assert_eq!(reader.read_uint8().unwrap(), Operation::Call as u8);
        let packed = reader.read_bytes().unwrap();
        assert_eq!(packed.len(), 130);
        let first = Signature::from_slice(&packed[..65]).unwrap();
        assert_eq!(first.recover(&digest).unwrap(), channel.multisig_owners()[0]);
    }

    #[test]
    fn test_install_is_multisend_delegatecall() {
        let network = NetworkContext::deterministic();
        let (channel, _) = setup();
        let fb = channel.free_balance().unwrap();
        let commitment = InstallCommitment::new(
            &network,
            channel.multisig_address(),
            channel.multisig_owners(),
            fb,
            fb,
        )
        .unwrap();
        assert_eq!(commitment.inner().to, network.multi_send);
        assert_eq!(commitment.inner().operation, Operation::DelegateCall);
        assert_eq!(&commitment.inner().data[..4], &function_selector(MULTI_SEND));
    }

    #[test]
    fn test_uninstall_differs_by_seq_no() {
        let network = NetworkContext::deterministic();
        let (channel, _) = setup();
        let fb = channel.free_balance().unwrap();
        let build = |seq| {
            UninstallCommitment::new(
                &network,
                channel.multisig_address(),
                channel.multisig_owners(),
                fb,
                seq,
            )
            .unwrap()
            .hash_to_sign()
        };
        assert_ne!(build(2), build(3));
        assert_eq!(build(2), build(2));
    }
}
