//! A node's protocol runner.
//!
//! # Overview
//!
//! The runner owns everything a node needs around the executor:
//!
//! - channels are loaded from the [`Store`] when a run starts and written
//!   back as one batch when it succeeds, together with clearing the run's
//!   write-ahead log record,
//! - runs hold their lock keys for their whole duration, resumed runs
//!   included,
//! - inbound messages either start a run or go to the keyed [`Inbox`] where
//!   a suspended run picks them up,
//! - subscribers get a [`RunnerEvent`] for every finished run.
//!
//! ```text
//!   inbound ──▶ handle_message ──┬─ starts a run ─▶ locks ─▶ executor ─▶ store
//!                                └─ continuation ─▶ inbox ─▶ (waiting run)
//! ```
//!
//! Deposits are two nested runs under one `Deposit` lock: install a
//! balance-refund app, then uninstall it crediting the deposited amount.
//!
//! With a write-ahead log attached it must share the runner's store.

use std::sync::Arc;

use std::future::Future;

use sc_crypto::{Address, ExtendedPublicKey, H256};
use tokio::sync::{broadcast, mpsc};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, info, warn};

use crate::error::{MachineError, MachineResult};
use crate::executor::{InstructionExecutor, RunOutcome};
use crate::inbox::{Inbox, InboxKey};
use crate::lock::{LockManager, LockToken};
use crate::models::{StateChannel, StateChannelsMap};
use crate::protocol::withdraw::balance_refund_proposal;
use crate::protocol::{
    InstallParams, Protocol, ProtocolMessage, ProtocolParams, UninstallParams, WithdrawParams,
};
use crate::store::{channel_entries, load_channel, load_channels, Store};
use crate::wal::WalRecord;

/// Capacity of the event channel; slow subscribers miss older events.
const EVENT_CAPACITY: usize = 64;

/// Outcome of a run, broadcast to subscribers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunnerEvent {
    Completed {
        protocol: Protocol,
        /// Channels the run changed.
        channels: Vec<Address>,
    },
    Failed {
        protocol: Protocol,
        reason: String,
    },
}

/// Drives protocol runs for one node.
pub struct ProtocolRunner {
    executor: Arc<InstructionExecutor>,
    store: Arc<dyn Store>,
    locks: Arc<LockManager>,
    inbox: Arc<Inbox>,
    events: broadcast::Sender<RunnerEvent>,
}

impl ProtocolRunner {
    /// # Arguments
    /// * `inbox` - The queues the executor's transport receives from
    pub fn new(
        executor: Arc<InstructionExecutor>,
        store: Arc<dyn Store>,
        locks: Arc<LockManager>,
        inbox: Arc<Inbox>,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            executor,
            store,
            locks,
            inbox,
            events,
        }
    }

    pub fn extended_public_key(&self) -> ExtendedPublicKey {
        self.executor.extended_public_key()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RunnerEvent> {
        self.events.subscribe()
    }

    /// The stored channel at `multisig_address`.
    pub async fn channel(&self, multisig_address: &Address) -> MachineResult<Option<StateChannel>> {
        load_channel(self.store.as_ref(), multisig_address).await
    }

    /// Every stored channel.
    pub async fn channels(&self) -> MachineResult<StateChannelsMap> {
        load_channels(self.store.as_ref()).await
    }

    // ========================================================================
    // Runs
    // ========================================================================

    /// Start a run as initiator and wait for it to finish.
    ///
    /// # Returns
    /// The node's channels after the run
    pub async fn initiate(&self, params: ProtocolParams) -> MachineResult<StateChannelsMap> {
        self.run_initiator(params, None).await
    }

    async fn run_initiator(
        &self,
        params: ProtocolParams,
        parent: Option<&LockToken>,
    ) -> MachineResult<StateChannelsMap> {
        let protocol = params.protocol();
        let keys = self.lock_keys(&params).await?;
        let inbox_key = params.inbox_key()?;
        self.run_locked(protocol, &keys, parent, inbox_key, move |before| {
            self.executor.initiate_protocol(params, before)
        })
        .await
    }

    /// Handle a message from another node.
    ///
    /// A message that starts a run is run to completion before returning;
    /// anything else is queued for the run waiting on it.
    pub async fn handle_message(&self, message: ProtocolMessage) -> MachineResult<()> {
        if !message.starts_run() {
            return self.inbox.deliver(message);
        }
        let protocol = message.protocol;
        let keys = self.lock_keys(&message.params).await?;
        let inbox_key = message.params.inbox_key()?;
        self.run_locked(protocol, &keys, None, inbox_key, move |before| {
            self.executor.run_protocol_with_message(message, before)
        })
        .await
        .map(|_| ())
    }

    /// Feed every message from `inbound` to [`Self::handle_message`].
    ///
    /// Runs are spawned so that continuation messages keep flowing while
    /// they wait. The task ends when `inbound` closes and its runs finish;
    /// aborting it aborts the runs in flight.
    pub fn spawn_pump(self: Arc<Self>, mut inbound: mpsc::UnboundedReceiver<ProtocolMessage>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut runs = JoinSet::new();
            loop {
                tokio::select! {
                    message = inbound.recv() => {
                        let Some(message) = message else { break };
                        if !message.starts_run() {
                            if let Err(err) = self.inbox.deliver(message) {
                                warn!(error = %err, "dropping undeliverable message");
                            }
                            continue;
                        }
                        let runner = self.clone();
                        runs.spawn(async move {
                            let protocol = message.protocol;
                            if let Err(err) = runner.handle_message(message).await {
                                warn!(protocol = %protocol, error = %err, "inbound run failed");
                            }
                        });
                    }
                    Some(_) = runs.join_next(), if !runs.is_empty() => {}
                }
            }
            while runs.join_next().await.is_some() {}
            debug!("inbound channel closed, pump stopped");
        })
    }

    /// Finish runs left in the write-ahead log and persist their results.
    ///
    /// Each run takes the same locks it held before the restart.
    ///
    /// # Returns
    /// Number of runs resumed
    pub async fn resume(&self) -> MachineResult<usize> {
        let records = self.executor.pending_runs().await?;
        let count = records.len();
        for record in records {
            self.resume_run(record).await?;
        }
        if count > 0 {
            info!(runs = count, "resumed unfinished runs");
        }
        Ok(count)
    }

    async fn resume_run(&self, record: WalRecord) -> MachineResult<StateChannelsMap> {
        let protocol = record.message.protocol;
        let keys = self.lock_keys(&record.message.params).await?;
        let inbox_key = record.message.params.inbox_key()?;
        self.run_locked(protocol, &keys, None, inbox_key, move |_| {
            self.executor.resume_run(record)
        })
        .await
    }

    /// Run `run` under `keys`, persist what it changed and tell subscribers.
    ///
    /// `run` gets the channels as stored when the locks were taken. The
    /// run's inbox is emptied when it ends, whatever the outcome.
    async fn run_locked<F, Fut>(
        &self,
        protocol: Protocol,
        keys: &[String],
        parent: Option<&LockToken>,
        inbox_key: InboxKey,
        run: F,
    ) -> MachineResult<StateChannelsMap>
    where
        F: FnOnce(StateChannelsMap) -> Fut,
        Fut: Future<Output = MachineResult<RunOutcome>>,
    {
        let locked = move |_: LockToken| async move {
            let before = self.channels().await?;
            let result = run(before.clone()).await;
            self.inbox.drain(&inbox_key);
            let outcome = result?;
            let changed = self.persist(&before, &outcome).await?;
            Ok::<_, MachineError>((outcome.channels, changed))
        };
        let result = match parent {
            Some(parent) => {
                self.locks
                    .execute_nested(parent, protocol.name(), keys, locked)
                    .await
            }
            None => self.locks.execute_within_locks(protocol.name(), keys, locked).await,
        };
        self.publish(protocol, result)
    }

    // ========================================================================
    // Funds
    // ========================================================================

    /// Credit `amount` to the local node's free balance in `multisig_address`.
    ///
    /// The on-chain transfer is the caller's business; this records it by
    /// installing a balance-refund app that protects the deposit, then
    /// uninstalling it with the amount paid to the depositor.
    pub async fn deposit(&self, multisig_address: Address, amount: u128) -> MachineResult<StateChannelsMap> {
        let me = self.extended_public_key();
        let key = InboxKey::Multisig(multisig_address).to_string();
        self.locks
            .execute_within_locks("Deposit", &[key], move |token| async move {
                let channel = self.require_channel(&multisig_address).await?;
                let counterparty = counterparty_of(&channel, &me)?;
                let depositor = me.owner_address()?;

                let proposal = balance_refund_proposal(
                    self.executor.network(),
                    depositor,
                    multisig_address,
                    channel.total_value()?,
                    amount,
                    self.executor.config().free_balance_default_timeout,
                )?;
                let installed = self
                    .run_initiator(
                        ProtocolParams::Install(InstallParams {
                            initiating_xpub: me,
                            responding_xpub: counterparty,
                            multisig_address,
                            proposal,
                            alice_balance_decrement: 0,
                            bob_balance_decrement: 0,
                        }),
                        Some(&token),
                    )
                    .await?;

                let channel = installed
                    .get(&multisig_address)
                    .ok_or(MachineError::UnknownChannel(multisig_address))?;
                let refund = latest_app(channel)?;
                let (alice, bob) = channel.split_for_owner(&depositor, amount)?;
                info!(multisig = %multisig_address, amount, "deposit recorded, releasing refund app");
                self.run_initiator(
                    ProtocolParams::Uninstall(UninstallParams {
                        initiating_xpub: me,
                        responding_xpub: counterparty,
                        multisig_address,
                        app_identity_hash: refund,
                        alice_balance_increment: alice,
                        bob_balance_increment: bob,
                    }),
                    Some(&token),
                )
                .await
            })
            .await
    }

    /// Withdraw `amount` of the local node's free balance to `recipient`.
    pub async fn withdraw(
        &self,
        multisig_address: Address,
        recipient: Address,
        amount: u128,
    ) -> MachineResult<StateChannelsMap> {
        let me = self.extended_public_key();
        let channel = self.require_channel(&multisig_address).await?;
        let counterparty = counterparty_of(&channel, &me)?;
        self.initiate(ProtocolParams::Withdraw(WithdrawParams {
            initiating_xpub: me,
            responding_xpub: counterparty,
            multisig_address,
            recipient,
            amount,
        }))
        .await
    }

    // ========================================================================
    // Helpers
    // ========================================================================

    async fn lock_keys(&self, params: &ProtocolParams) -> MachineResult<Vec<String>> {
        let channels = self.channels().await?;
        params.lock_keys(&self.extended_public_key(), &channels)
    }

    async fn require_channel(&self, multisig_address: &Address) -> MachineResult<StateChannel> {
        self.channel(multisig_address)
            .await?
            .ok_or(MachineError::UnknownChannel(*multisig_address))
    }

    /// Write the channels that differ between `before` and the outcome,
    /// clearing the run's log record in the same batch.
    ///
    /// # Returns
    /// Addresses of the channels written
    async fn persist(&self, before: &StateChannelsMap, outcome: &RunOutcome) -> MachineResult<Vec<Address>> {
        let changed: Vec<&StateChannel> = outcome
            .channels
            .iter()
            .filter(|(address, channel)| before.get(*address) != Some(*channel))
            .map(|(_, channel)| channel)
            .collect();
        let addresses: Vec<Address> = changed.iter().map(|channel| channel.multisig_address()).collect();
        debug!(changed = changed.len(), "persisting channels");
        let entries = channel_entries(self.store.as_ref(), changed).await?;
        match (&outcome.log_key, self.executor.write_ahead_log()) {
            (Some(log_key), Some(wal)) => wal.clear_with(log_key, entries).await?,
            _ if !entries.is_empty() => self.store.set(entries).await?,
            _ => {}
        }
        Ok(addresses)
    }

    fn publish(
        &self,
        protocol: Protocol,
        result: MachineResult<(StateChannelsMap, Vec<Address>)>,
    ) -> MachineResult<StateChannelsMap> {
        let (event, result) = match result {
            Ok((channels, changed)) => (
                RunnerEvent::Completed {
                    protocol,
                    channels: changed,
                },
                Ok(channels),
            ),
            Err(err) => (
                RunnerEvent::Failed {
                    protocol,
                    reason: err.to_string(),
                },
                Err(err),
            ),
        };
        // no subscribers is fine
        let _ = self.events.send(event);
        result
    }
}

impl std::fmt::Debug for ProtocolRunner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProtocolRunner")
            .field("node", &self.extended_public_key())
            .field("executor", &self.executor)
            .finish()
    }
}

/// The owner of `channel` that is not `me`.
fn counterparty_of(channel: &StateChannel, me: &ExtendedPublicKey) -> MachineResult<ExtendedPublicKey> {
    let owners = channel.user_neutered_extended_keys();
    if !owners.contains(me) {
        return Err(MachineError::NotAnOwner(me.owner_address()?));
    }
    owners
        .iter()
        .find(|owner| *owner != me)
        .copied()
        .ok_or(MachineError::NotAnOwner(me.owner_address()?))
}

/// Identity hash of the most recently installed app.
fn latest_app(channel: &StateChannel) -> MachineResult<H256> {
    let seq = channel.num_installed_apps();
    let app = channel
        .app_instances()
        .values()
        .find(|app| app.app_seq_no == seq)
        .ok_or_else(|| MachineError::MissingCommitment(format!("no app installed at seq {seq}")))?;
    app.identity_hash()
}
