//! Channel state and its transition algebra.
//!
//! A [`StateChannel`] is an immutable value. Every transition borrows the
//! current channel and returns a new one, so a superseded channel can still be
//! used to re-check the commitments built from it.

use std::collections::BTreeMap;

use sc_crypto::{xkeys_to_sorted_kth_addresses, Address, ExtendedPublicKey, H256};
use serde::{Deserialize, Serialize};
use tracing::trace;

use crate::config::NetworkContext;
use crate::error::{MachineError, MachineResult};
use crate::models::agreement::EthVirtualAppAgreementInstance;
use crate::models::app_instance::{AppInstance, AppInterface, Terms};
use crate::models::free_balance::{FreeBalanceState, FREE_BALANCE_STATE_ENCODING};

/// A channel between exactly two parties, owned by a multisig.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StateChannel {
    multisig_address: Address,
    /// Owners' xpubs, ordered by the owner address they derive at index 0.
    user_neutered_extended_keys: Vec<ExtendedPublicKey>,
    multisig_owners: Vec<Address>,
    app_instances: BTreeMap<H256, AppInstance>,
    free_balance: Option<AppInstance>,
    /// Agreements keyed by the identity hash of the virtual app they back.
    eth_virtual_app_agreement_instances: BTreeMap<H256, EthVirtualAppAgreementInstance>,
    num_installed_apps: u64,
    root_nonce_value: u64,
}

impl StateChannel {
    /// An empty channel without a free balance.
    ///
    /// # Errors
    /// Fails unless exactly two distinct xpubs are given.
    pub fn new(multisig_address: Address, xpubs: &[ExtendedPublicKey]) -> MachineResult<Self> {
        if xpubs.len() != 2 || xpubs[0] == xpubs[1] {
            return Err(MachineError::Crypto(format!(
                "A channel needs two distinct owners, got {}",
                xpubs.len()
            )));
        }
        let mut keyed = xpubs
            .iter()
            .map(|xpub| Ok((xpub.owner_address()?, *xpub)))
            .collect::<MachineResult<Vec<_>>>()?;
        keyed.sort_by_key(|(owner, _)| *owner);

        Ok(Self {
            multisig_address,
            multisig_owners: keyed.iter().map(|(owner, _)| *owner).collect(),
            user_neutered_extended_keys: keyed.into_iter().map(|(_, xpub)| xpub).collect(),
            app_instances: BTreeMap::new(),
            free_balance: None,
            eth_virtual_app_agreement_instances: BTreeMap::new(),
            num_installed_apps: 0,
            root_nonce_value: 0,
        })
    }

    /// A freshly set up channel with a zero free balance.
    pub fn setup_channel(
        network: &NetworkContext,
        multisig_address: Address,
        xpubs: &[ExtendedPublicKey],
        free_balance_timeout: u64,
    ) -> MachineResult<Self> {
        Self::new(multisig_address, xpubs)?.setup(network, free_balance_timeout)
    }

    /// Install the free balance at sequence number `num_installed_apps`.
    ///
    /// # Errors
    /// [`MachineError::AlreadySetUp`] if the channel already has apps.
    pub fn setup(&self, network: &NetworkContext, free_balance_timeout: u64) -> MachineResult<Self> {
        if self.free_balance.is_some() || self.num_installed_apps > 0 {
            return Err(MachineError::AlreadySetUp(self.multisig_address));
        }

        let (alice, bob) = self.owner_pair()?;
        let state = FreeBalanceState::zero(alice, bob);
        let free_balance = AppInstance {
            multisig_address: self.multisig_address,
            signing_keys: self.signing_keys_for(self.num_installed_apps)?,
            default_timeout: free_balance_timeout,
            app_interface: AppInterface {
                addr: network.eth_bucket,
                state_encoding: FREE_BALANCE_STATE_ENCODING.to_string(),
                action_encoding: None,
            },
            terms: Terms::eth(u128::MAX),
            is_virtual_app: false,
            app_seq_no: self.num_installed_apps,
            root_nonce_value: self.root_nonce_value,
            latest_state: state.encode()?,
            latest_nonce: 0,
            latest_timeout: free_balance_timeout,
        };

        Ok(Self {
            free_balance: Some(free_balance),
            num_installed_apps: self.num_installed_apps + 1,
            ..self.clone()
        })
    }

    // ========================================================================
    // Accessors
    // ========================================================================

    pub fn multisig_address(&self) -> Address {
        self.multisig_address
    }

    /// Owner addresses, sorted ascending.
    pub fn multisig_owners(&self) -> &[Address] {
        &self.multisig_owners
    }

    /// The two owners as `(alice, bob)`.
    ///
    /// # Errors
    /// [`MachineError::MalformedChannel`] if a stored channel lost an owner.
    pub fn owner_pair(&self) -> MachineResult<(Address, Address)> {
        match self.multisig_owners.as_slice() {
            [alice, bob] => Ok((*alice, *bob)),
            owners => Err(MachineError::MalformedChannel {
                multisig: self.multisig_address,
                owners: owners.len(),
            }),
        }
    }

    pub fn user_neutered_extended_keys(&self) -> &[ExtendedPublicKey] {
        &self.user_neutered_extended_keys
    }

    pub fn num_installed_apps(&self) -> u64 {
        self.num_installed_apps
    }

    pub fn root_nonce_value(&self) -> u64 {
        self.root_nonce_value
    }

    /// Sequence number the next installed app receives.
    pub fn next_app_seq_no(&self) -> u64 {
        self.num_installed_apps + 1
    }

    pub fn app_instances(&self) -> &BTreeMap<H256, AppInstance> {
        &self.app_instances
    }

    pub fn has_app_instance(&self, app_id: &H256) -> bool {
        self.app_instances.contains_key(app_id)
    }

    pub fn app_instance(&self, app_id: &H256) -> MachineResult<&AppInstance> {
        self.app_instances
            .get(app_id)
            .ok_or(MachineError::UnknownApp(*app_id))
    }

    pub fn has_free_balance(&self) -> bool {
        self.free_balance.is_some()
    }

    pub fn free_balance(&self) -> MachineResult<&AppInstance> {
        self.free_balance
            .as_ref()
            .ok_or(MachineError::FreeBalanceMissing(self.multisig_address))
    }

    pub fn free_balance_state(&self) -> MachineResult<FreeBalanceState> {
        FreeBalanceState::decode(&self.free_balance()?.latest_state)
    }

    pub fn eth_virtual_app_agreement_instances(
        &self,
    ) -> &BTreeMap<H256, EthVirtualAppAgreementInstance> {
        &self.eth_virtual_app_agreement_instances
    }

    /// The agreement backing the virtual app `target_id`.
    pub fn agreement_for(&self, target_id: &H256) -> MachineResult<&EthVirtualAppAgreementInstance> {
        self.eth_virtual_app_agreement_instances
            .get(target_id)
            .ok_or(MachineError::UnknownApp(*target_id))
    }

    /// Both owners' signing addresses at `index`, sorted.
    pub fn signing_keys_for(&self, index: u64) -> MachineResult<Vec<Address>> {
        Ok(xkeys_to_sorted_kth_addresses(
            &self.user_neutered_extended_keys,
            index,
        )?)
    }

    /// Whether the channel is owned by exactly these two xpubs.
    pub fn is_between(&self, a: &ExtendedPublicKey, b: &ExtendedPublicKey) -> bool {
        self.user_neutered_extended_keys.contains(a) && self.user_neutered_extended_keys.contains(b)
    }

    /// Split an amount owed to `owner` into `(alice, bob)` form.
    pub fn split_for_owner(&self, owner: &Address, amount: u128) -> MachineResult<(u128, u128)> {
        let (alice, bob) = self.owner_pair()?;
        if *owner == alice {
            Ok((amount, 0))
        } else if *owner == bob {
            Ok((0, amount))
        } else {
            Err(MachineError::NotAnOwner(*owner))
        }
    }

    /// Funds held by the multisig: free balance plus the caps of installed
    /// apps and the collateral of agreements.
    pub fn total_value(&self) -> MachineResult<u128> {
        let mut total = match &self.free_balance {
            Some(_) => self.free_balance_state()?.total()?,
            None => 0,
        };
        let locked = self
            .app_instances
            .values()
            .filter(|app| !app.is_virtual_app)
            .map(|app| app.terms.limit)
            .chain(
                self.eth_virtual_app_agreement_instances
                    .values()
                    .map(|agreement| agreement.capital_provided),
            );
        for amount in locked {
            total = total.checked_add(amount).ok_or(MachineError::BalanceOverflow)?;
        }
        Ok(total)
    }

    // ========================================================================
    // Transitions
    // ========================================================================

    fn with_free_balance<F>(&self, update: F) -> MachineResult<Self>
    where
        F: FnOnce(&FreeBalanceState) -> MachineResult<FreeBalanceState>,
    {
        let free_balance = self.free_balance()?;
        let state = update(&FreeBalanceState::decode(&free_balance.latest_state)?)?;
        Ok(Self {
            free_balance: Some(free_balance.set_state(state.encode()?, None)),
            ..self.clone()
        })
    }

    fn check_next_seq_no(&self, app_seq_no: u64) -> MachineResult<()> {
        let expected = self.next_app_seq_no();
        if app_seq_no != expected {
            return Err(MachineError::NestedAppSequenceConflict {
                expected,
                actual: app_seq_no,
            });
        }
        Ok(())
    }

    /// Credit the free balance, as after an on-chain deposit.
    pub fn increment_free_balance(&self, alice: u128, bob: u128) -> MachineResult<Self> {
        self.with_free_balance(|state| state.increment(alice, bob))
    }

    /// Install `app`, funding it from the free balance.
    ///
    /// The decrements together must equal the app's limit: whatever the app
    /// may pay out on uninstall is exactly what it took.
    ///
    /// # Errors
    /// - [`MachineError::NestedAppSequenceConflict`] unless `app` carries the
    ///   next sequence number
    /// - [`MachineError::InsufficientFunds`] if either owner cannot cover
    ///   their decrement
    /// - [`MachineError::CollateralMismatch`] if the decrements do not add up
    ///   to `app.terms.limit`
    pub fn install_app(
        &self,
        app: AppInstance,
        alice_decrement: u128,
        bob_decrement: u128,
    ) -> MachineResult<Self> {
        self.check_next_seq_no(app.app_seq_no)?;
        let next = self.with_free_balance(|state| state.decrement(alice_decrement, bob_decrement))?;
        let funded = alice_decrement
            .checked_add(bob_decrement)
            .ok_or(MachineError::BalanceOverflow)?;
        if funded != app.terms.limit {
            return Err(MachineError::CollateralMismatch {
                funded,
                limit: app.terms.limit,
            });
        }
        next.insert_app(app)
    }

    /// Install the balance-refund app recording an on-chain deposit.
    ///
    /// The deposit reached the multisig outside the free balance, so nothing
    /// is debited; the app's limit is the deposited amount and uninstalling
    /// it credits that amount to the depositor.
    ///
    /// # Errors
    /// [`MachineError::CollateralMismatch`] unless `app` is the network's
    /// balance-refund app.
    pub fn install_deposit(&self, network: &NetworkContext, app: AppInstance) -> MachineResult<Self> {
        self.check_next_seq_no(app.app_seq_no)?;
        if app.app_interface.addr != network.eth_balance_refund {
            return Err(MachineError::CollateralMismatch {
                funded: 0,
                limit: app.terms.limit,
            });
        }
        self.free_balance()?;
        self.insert_app(app)
    }

    fn insert_app(&self, app: AppInstance) -> MachineResult<Self> {
        let app_id = app.identity_hash()?;
        trace!(multisig = %self.multisig_address, app = %app_id, seq = app.app_seq_no, "install app");
        let mut next = self.clone();
        next.app_instances.insert(app_id, app);
        next.num_installed_apps += 1;
        Ok(next)
    }

    /// Remove an app, crediting the owners with its payout.
    ///
    /// # Errors
    /// - [`MachineError::UnknownApp`] if the app is not installed
    /// - [`MachineError::InvalidPayout`] if the payout exceeds the app's limit
    pub fn uninstall_app(
        &self,
        app_id: &H256,
        alice_increment: u128,
        bob_increment: u128,
    ) -> MachineResult<Self> {
        let app = self.app_instance(app_id)?;
        let payout = alice_increment
            .checked_add(bob_increment)
            .ok_or(MachineError::BalanceOverflow)?;
        if payout > app.terms.limit {
            return Err(MachineError::InvalidPayout {
                payout,
                limit: app.terms.limit,
            });
        }
        trace!(multisig = %self.multisig_address, app = %app_id, payout, "uninstall app");

        let mut next = self.with_free_balance(|state| state.increment(alice_increment, bob_increment))?;
        next.app_instances.remove(app_id);
        Ok(next)
    }

    /// Replace an app's state, advancing its nonce.
    pub fn set_state(&self, app_id: &H256, state: Vec<u8>, timeout: Option<u64>) -> MachineResult<Self> {
        let app = self.app_instance(app_id)?.set_state(state, timeout);
        let mut next = self.clone();
        next.app_instances.insert(*app_id, app);
        Ok(next)
    }

    /// Freeze an app at `nonce_expiry`.
    pub fn lock_app_instance(&self, app_id: &H256, nonce_expiry: u64) -> MachineResult<Self> {
        let app = self.app_instance(app_id)?.lock_state(nonce_expiry);
        let mut next = self.clone();
        next.app_instances.insert(*app_id, app);
        Ok(next)
    }

    /// Lock collateral for a virtual app in this leg.
    pub fn install_eth_virtual_app_agreement_instance(
        &self,
        agreement: EthVirtualAppAgreementInstance,
        alice_decrement: u128,
        bob_decrement: u128,
    ) -> MachineResult<Self> {
        self.check_next_seq_no(agreement.app_seq_no)?;
        let mut next = self.with_free_balance(|state| state.decrement(alice_decrement, bob_decrement))?;
        next.eth_virtual_app_agreement_instances
            .insert(agreement.target_app_identity_hash, agreement);
        next.num_installed_apps += 1;
        Ok(next)
    }

    /// Release the collateral backing `target_id`, crediting the payouts.
    ///
    /// # Errors
    /// - [`MachineError::UnknownApp`] if no agreement backs `target_id`
    /// - [`MachineError::InvalidPayout`] if the payout exceeds the collateral
    pub fn uninstall_eth_virtual_app_agreement_instance(
        &self,
        target_id: &H256,
        alice_increment: u128,
        bob_increment: u128,
    ) -> MachineResult<Self> {
        let agreement = self.agreement_for(target_id)?;
        let payout = alice_increment
            .checked_add(bob_increment)
            .ok_or(MachineError::BalanceOverflow)?;
        if payout > agreement.capital_provided {
            return Err(MachineError::InvalidPayout {
                payout,
                limit: agreement.capital_provided,
            });
        }
        let mut next = self.with_free_balance(|state| state.increment(alice_increment, bob_increment))?;
        next.eth_virtual_app_agreement_instances.remove(target_id);
        Ok(next)
    }

    /// Add a virtual app. No funds move in this channel.
    pub fn install_virtual_app(&self, app: AppInstance) -> MachineResult<Self> {
        self.check_next_seq_no(app.app_seq_no)?;
        let app_id = app.identity_hash()?;
        let mut next = self.clone();
        next.app_instances.insert(app_id, app);
        next.num_installed_apps += 1;
        Ok(next)
    }

    /// Drop a virtual app after its agreements settled.
    pub fn remove_virtual_app(&self, app_id: &H256) -> MachineResult<Self> {
        if !self.has_app_instance(app_id) {
            return Err(MachineError::UnknownApp(*app_id));
        }
        let mut next = self.clone();
        next.app_instances.remove(app_id);
        Ok(next)
    }
}
