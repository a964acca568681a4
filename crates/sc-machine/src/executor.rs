//! The instruction executor.
//!
//! # Overview
//!
//! The executor walks a protocol flow step by step. `Compute` steps are pure
//! functions of the [`Context`]; their [`StepOutput`] is folded back into the
//! context before the next step runs. Every other step is an effect carried
//! out through the injected services:
//!
//! | Step | Service |
//! |------|---------|
//! | `Sign`, `SignAsIntermediary` | [`SigningService`] |
//! | `Send`, `Wait`, `SendAndWait` | [`IoTransport`] |
//! | `Commit` | [`CommitmentStore`] |
//!
//! Channel updates live in the context's copy of the channel map. The caller
//! only sees them once the whole run succeeded; an error at any step drops
//! the copy.
//!
//! With a [`WriteAheadLog`] attached, each effect is recorded as it happens.
//! A successful run leaves its record in place and names it in the
//! [`RunOutcome`]; the caller clears it when it persists the channels.
//! [`InstructionExecutor::resume_run`] replays a record: recorded signatures
//! and messages are reused and recorded sends are not repeated, then the run
//! continues live.
//!
//! A wait only accepts the next message of its own run. Messages tagged
//! with another run id, and repeats of earlier steps, are dropped.

use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;

use sc_crypto::{Address, ExtendedPublicKey, H256, Signature};
use tracing::{debug, info, warn};

use crate::config::{MachineConfig, NetworkContext};
use crate::error::{MachineError, MachineResult};
use crate::ethereum::EthereumCommitment;
use crate::models::{StateChannel, StateChannelsMap};
use crate::opcode::Opcode;
use crate::protocol::{Protocol, ProtocolMessage, ProtocolParams, ProtocolStep, Role};
use crate::services::{AppLogic, CommitmentStore, IoTransport, SigningService};
use crate::wal::{WalRecord, WriteAheadLog};

// ============================================================================
// Commitment slots
// ============================================================================

/// Which key signs a commitment locally, and over which digest.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotSigner {
    /// Sign [`EthereumCommitment::hash_to_sign`] with the child key at `key_index`.
    Local { key_index: u64 },
    /// Sign [`EthereumCommitment::hash_to_sign_as_intermediary`].
    Intermediary { key_index: u64 },
}

/// A commitment built during a run with the signatures collected for it.
#[derive(Debug, Clone)]
pub struct CommitmentSlot {
    pub commitment: Arc<dyn EthereumCommitment>,
    pub signer: SlotSigner,
    pub counter_signatures: Vec<Signature>,
    pub my_signature: Option<Signature>,
    pub required_signatures: usize,
}

impl CommitmentSlot {
    /// A two-signer commitment the local node signs with `key_index`.
    pub fn local(commitment: impl EthereumCommitment + 'static, key_index: u64) -> Self {
        Self {
            commitment: Arc::new(commitment),
            signer: SlotSigner::Local { key_index },
            counter_signatures: Vec::new(),
            my_signature: None,
            required_signatures: 2,
        }
    }

    /// A commitment the local node co-signs as intermediary.
    pub fn intermediary(commitment: impl EthereumCommitment + 'static, key_index: u64) -> Self {
        Self {
            commitment: Arc::new(commitment),
            signer: SlotSigner::Intermediary { key_index },
            counter_signatures: Vec::new(),
            my_signature: None,
            required_signatures: 3,
        }
    }

    pub fn with_required_signatures(mut self, required: usize) -> Self {
        self.required_signatures = required;
        self
    }

    /// Attach an already validated counter-signature.
    pub fn with_counter_signature(mut self, signature: Signature) -> Self {
        self.counter_signatures.push(signature);
        self
    }

    pub fn key_index(&self) -> u64 {
        match self.signer {
            SlotSigner::Local { key_index } | SlotSigner::Intermediary { key_index } => key_index,
        }
    }

    /// The digest the local node signs.
    pub fn digest(&self) -> MachineResult<H256> {
        match self.signer {
            SlotSigner::Local { .. } => Ok(self.commitment.hash_to_sign()),
            SlotSigner::Intermediary { .. } => {
                self.commitment.hash_to_sign_as_intermediary().ok_or_else(|| {
                    MachineError::MissingCommitment(format!(
                        "{} has no intermediary digest",
                        self.commitment.kind()
                    ))
                })
            }
        }
    }

    /// Every signature collected so far, local one included.
    pub fn signatures(&self) -> Vec<Signature> {
        self.counter_signatures
            .iter()
            .copied()
            .chain(self.my_signature)
            .collect()
    }
}

// ============================================================================
// Step output and context
// ============================================================================

/// What a compute step adds to the context.
#[derive(Debug, Default)]
pub struct StepOutput {
    pub commitments: Vec<CommitmentSlot>,
    /// Validated counter-signatures for slots built by earlier steps.
    pub counter_signatures: Vec<(usize, Signature)>,
    pub channel_updates: Vec<StateChannel>,
    pub outbox: Vec<ProtocolMessage>,
}

impl StepOutput {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_commitment(mut self, slot: CommitmentSlot) -> Self {
        self.commitments.push(slot);
        self
    }

    pub fn with_counter_signature(mut self, slot: usize, signature: Signature) -> Self {
        self.counter_signatures.push((slot, signature));
        self
    }

    pub fn with_channel(mut self, channel: StateChannel) -> Self {
        self.channel_updates.push(channel);
        self
    }

    pub fn with_message(mut self, message: ProtocolMessage) -> Self {
        self.outbox.push(message);
        self
    }

    /// Append everything from `other`.
    pub fn merge(mut self, other: StepOutput) -> Self {
        self.commitments.extend(other.commitments);
        self.counter_signatures.extend(other.counter_signatures);
        self.channel_updates.extend(other.channel_updates);
        self.outbox.extend(other.outbox);
        self
    }
}

/// Everything a run has built so far.
pub struct Context {
    pub network: NetworkContext,
    pub config: MachineConfig,
    pub role: Role,
    /// The message that started the run.
    pub message: ProtocolMessage,
    pub my_xpub: ExtendedPublicKey,
    /// The run's private copy of the channel map.
    pub state_channels: StateChannelsMap,
    pub commitments: Vec<CommitmentSlot>,
    /// The message received by the latest wait.
    pub inbox: Vec<ProtocolMessage>,
    pub outbox: Vec<ProtocolMessage>,
    pub app_logic: Option<Arc<dyn AppLogic>>,
}

impl Context {
    pub fn protocol(&self) -> Protocol {
        self.message.protocol
    }

    pub fn params(&self) -> &ProtocolParams {
        &self.message.params
    }

    pub fn channel(&self, multisig_address: &Address) -> MachineResult<&StateChannel> {
        self.state_channels
            .get(multisig_address)
            .ok_or(MachineError::UnknownChannel(*multisig_address))
    }

    pub fn slot(&self, index: usize) -> MachineResult<&CommitmentSlot> {
        self.commitments
            .get(index)
            .ok_or_else(|| MachineError::MissingCommitment(format!("slot {index}")))
    }

    /// The local signature on slot `index`.
    pub fn my_signature(&self, index: usize) -> MachineResult<Signature> {
        self.slot(index)?
            .my_signature
            .ok_or_else(|| MachineError::MissingSignature(format!("local signature on slot {index}")))
    }

    /// The single message received by the latest wait.
    pub fn received(&self) -> MachineResult<&ProtocolMessage> {
        match self.inbox.as_slice() {
            [message] => Ok(message),
            other => Err(MachineError::violation(
                self.protocol(),
                format!("expected one received message, have {}", other.len()),
            )),
        }
    }

    /// The other party of a two-party run.
    pub fn counterparty_xpub(&self) -> &ExtendedPublicKey {
        let params = self.params();
        if *params.initiating_xpub() == self.my_xpub {
            params.responding_xpub()
        } else {
            params.initiating_xpub()
        }
    }

    /// Fold a compute step's output into the context.
    pub fn apply(&mut self, output: StepOutput) -> MachineResult<()> {
        self.commitments.extend(output.commitments);
        for (index, signature) in output.counter_signatures {
            let slot = self
                .commitments
                .get_mut(index)
                .ok_or_else(|| MachineError::MissingCommitment(format!("slot {index}")))?;
            if slot.my_signature == Some(signature) {
                return Err(MachineError::DuplicateSignature);
            }
            slot.counter_signatures.push(signature);
        }
        for channel in output.channel_updates {
            self.state_channels.insert(channel.multisig_address(), channel);
        }
        self.outbox.extend(output.outbox);
        Ok(())
    }
}

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Context")
            .field("protocol", &self.protocol())
            .field("role", &self.role)
            .field("seq", &self.message.seq)
            .field("channels", &self.state_channels.len())
            .field("commitments", &self.commitments.len())
            .field("outbox", &self.outbox.len())
            .finish()
    }
}

// ============================================================================
// Replay
// ============================================================================

/// Effects recorded before a restart, consumed in order while replaying.
#[derive(Debug, Default)]
struct Replay {
    signatures: VecDeque<Signature>,
    received: VecDeque<ProtocolMessage>,
    sends_to_skip: usize,
}

impl Replay {
    fn from_record(record: &WalRecord) -> Self {
        Self {
            signatures: record.signatures.iter().copied().collect(),
            received: record.received.iter().cloned().collect(),
            sends_to_skip: record.sends_completed,
        }
    }
}

// ============================================================================
// Executor
// ============================================================================

/// Result of a successful run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunOutcome {
    /// The channel map after the run, for the caller to persist.
    pub channels: StateChannelsMap,
    /// Write-ahead log key of the run, left for the caller to clear with
    /// [`WriteAheadLog::clear_with`].
    pub log_key: Option<String>,
}

/// Runs protocol flows against the injected services.
pub struct InstructionExecutor {
    network: NetworkContext,
    config: MachineConfig,
    signer: Arc<dyn SigningService>,
    io: Arc<dyn IoTransport>,
    commitments: Arc<dyn CommitmentStore>,
    app_logic: Option<Arc<dyn AppLogic>>,
    wal: Option<WriteAheadLog>,
}

impl InstructionExecutor {
    pub fn new(
        network: NetworkContext,
        signer: Arc<dyn SigningService>,
        io: Arc<dyn IoTransport>,
        commitments: Arc<dyn CommitmentStore>,
    ) -> Self {
        Self {
            network,
            config: MachineConfig::default(),
            signer,
            io,
            commitments,
            app_logic: None,
            wal: None,
        }
    }

    pub fn with_config(mut self, config: MachineConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_app_logic(mut self, app_logic: Arc<dyn AppLogic>) -> Self {
        self.app_logic = Some(app_logic);
        self
    }

    pub fn with_write_ahead_log(mut self, wal: WriteAheadLog) -> Self {
        self.wal = Some(wal);
        self
    }

    pub fn write_ahead_log(&self) -> Option<&WriteAheadLog> {
        self.wal.as_ref()
    }

    pub fn network(&self) -> &NetworkContext {
        &self.network
    }

    pub fn config(&self) -> &MachineConfig {
        &self.config
    }

    pub fn extended_public_key(&self) -> ExtendedPublicKey {
        self.signer.extended_public_key()
    }

    /// Start a run as initiator.
    ///
    /// # Arguments
    /// * `params` - The run's parameters; the local node must be the initiator
    /// * `channels` - The node's current channels, left untouched
    ///
    /// # Returns
    /// The channel map after the run and the run's log key
    pub async fn initiate_protocol(
        &self,
        params: ProtocolParams,
        channels: StateChannelsMap,
    ) -> MachineResult<RunOutcome> {
        let me = self.signer.extended_public_key();
        let protocol = params.protocol();
        if *params.initiating_xpub() != me {
            return Err(MachineError::violation(protocol, "local node is not the initiator"));
        }
        let to = params
            .intermediary_xpub()
            .copied()
            .unwrap_or(*params.responding_xpub());
        let message = ProtocolMessage::starting(params, me, to);
        self.execute(Role::Initiator, message, channels, None).await
    }

    /// Join a run started by a message from another node.
    ///
    /// # Errors
    /// [`MachineError::ProtocolViolation`] if `message` does not start a run
    /// or is addressed to another node.
    pub async fn run_protocol_with_message(
        &self,
        message: ProtocolMessage,
        channels: StateChannelsMap,
    ) -> MachineResult<RunOutcome> {
        let protocol = message.protocol;
        let role = protocol.role_started_by(message.seq).ok_or_else(|| {
            MachineError::violation(protocol, format!("seq {} does not start a run", message.seq))
        })?;
        if message.to_xpub != self.signer.extended_public_key() {
            return Err(MachineError::violation(protocol, "message addressed to another node"));
        }
        if message.params.protocol() != protocol {
            return Err(MachineError::violation(protocol, "parameters of another protocol"));
        }
        self.execute(role, message, channels, None).await
    }

    /// Runs recorded in the write-ahead log, in log order.
    pub async fn pending_runs(&self) -> MachineResult<Vec<WalRecord>> {
        match &self.wal {
            Some(wal) => Ok(wal.read_log().await?.into_values().collect()),
            None => Ok(Vec::new()),
        }
    }

    /// Finish the run recorded in `record`.
    ///
    /// Replaying a run that already finished signs and sends nothing and
    /// yields the same channels again.
    pub async fn resume_run(&self, record: WalRecord) -> MachineResult<RunOutcome> {
        info!(
            protocol = %record.message.protocol,
            role = ?record.role,
            pointer = record.instruction_pointer,
            "resuming protocol run"
        );
        let channels = record.state_channels.clone();
        self.execute(record.role, record.message.clone(), channels, Some(record))
            .await
    }

    async fn execute(
        &self,
        role: Role,
        message: ProtocolMessage,
        channels: StateChannelsMap,
        resume: Option<WalRecord>,
    ) -> MachineResult<RunOutcome> {
        let protocol = message.protocol;
        let steps = protocol
            .flow(role)
            .ok_or_else(|| MachineError::violation(protocol, format!("no {role:?} flow")))?;

        let mut record = match resume {
            Some(record) => record,
            None => WalRecord::new(role, message.clone(), channels.clone()),
        };
        let mut replay = Replay::from_record(&record);
        let mut ctx = Context {
            network: self.network.clone(),
            config: self.config.clone(),
            role,
            message,
            my_xpub: self.signer.extended_public_key(),
            state_channels: channels,
            commitments: Vec::new(),
            inbox: Vec::new(),
            outbox: Vec::new(),
            app_logic: self.app_logic.clone(),
        };

        debug!(protocol = %protocol, role = ?role, steps = steps.len(), "protocol run started");
        let result = self
            .run_steps(steps, &mut ctx, &mut record, &mut replay)
            .await;

        match result {
            Ok(()) => {
                info!(
                    protocol = %protocol,
                    role = ?role,
                    opcode = %Opcode::StateTransitionCommit,
                    channels = ctx.state_channels.len(),
                    "protocol run complete"
                );
                let log_key = match &self.wal {
                    Some(_) => Some(record.key()?),
                    None => None,
                };
                Ok(RunOutcome {
                    channels: ctx.state_channels,
                    log_key,
                })
            }
            Err(err) => {
                warn!(protocol = %protocol, role = ?role, error = %err, "protocol run aborted");
                if let Some(wal) = &self.wal {
                    if let Err(clear_err) = wal.clear(&record).await {
                        warn!(protocol = %protocol, error = %clear_err, "failed to clear write-ahead log");
                    }
                }
                Err(err)
            }
        }
    }

    async fn run_steps(
        &self,
        steps: &[ProtocolStep],
        ctx: &mut Context,
        record: &mut WalRecord,
        replay: &mut Replay,
    ) -> MachineResult<()> {
        for (pointer, step) in steps.iter().enumerate() {
            debug!(protocol = %ctx.protocol(), role = ?ctx.role, pointer, step = ?step, "step");
            match step {
                ProtocolStep::Compute(compute) => {
                    let output = compute(ctx)?;
                    ctx.apply(output)?;
                }
                ProtocolStep::Sign => self.sign(ctx, false, record, replay).await?,
                ProtocolStep::SignAsIntermediary => self.sign(ctx, true, record, replay).await?,
                ProtocolStep::Send => self.send(ctx, record, replay).await?,
                ProtocolStep::Wait { seq } => self.wait(ctx, *seq, record, replay).await?,
                ProtocolStep::SendAndWait { seq } => {
                    self.send(ctx, record, replay).await?;
                    self.wait(ctx, *seq, record, replay).await?;
                }
                ProtocolStep::Commit => self.commit(ctx).await?,
            }
            if let Some(opcode) = step.opcode().filter(Opcode::is_logged) {
                record.instruction_pointer = pointer + 1;
                record.last_opcode = Some(opcode);
                self.checkpoint(record).await?;
            }
        }
        Ok(())
    }

    async fn checkpoint(&self, record: &WalRecord) -> MachineResult<()> {
        match &self.wal {
            Some(wal) => wal.write(record).await,
            None => Ok(()),
        }
    }

    // ========================================================================
    // Effects
    // ========================================================================

    async fn sign(
        &self,
        ctx: &mut Context,
        as_intermediary: bool,
        record: &mut WalRecord,
        replay: &mut Replay,
    ) -> MachineResult<()> {
        for index in 0..ctx.commitments.len() {
            let slot = &ctx.commitments[index];
            let wanted = matches!(
                (slot.signer, as_intermediary),
                (SlotSigner::Local { .. }, false) | (SlotSigner::Intermediary { .. }, true)
            );
            if !wanted || slot.my_signature.is_some() {
                continue;
            }
            let digest = slot.digest()?;
            let signature = match replay.signatures.pop_front() {
                Some(signature) => signature,
                None => {
                    let signature = self.signer.sign(&digest, slot.key_index()).await?;
                    record.signatures.push(signature);
                    signature
                }
            };
            debug!(
                kind = %slot.commitment.kind(),
                digest = %digest,
                key_index = slot.key_index(),
                "signed commitment"
            );
            ctx.commitments[index].my_signature = Some(signature);
        }
        Ok(())
    }

    async fn send(&self, ctx: &mut Context, record: &mut WalRecord, replay: &mut Replay) -> MachineResult<()> {
        if ctx.outbox.is_empty() {
            return Err(MachineError::violation(ctx.protocol(), "nothing to send"));
        }
        for message in std::mem::take(&mut ctx.outbox) {
            if replay.sends_to_skip > 0 {
                replay.sends_to_skip -= 1;
                debug!(seq = message.seq, "send already recorded, skipping");
                continue;
            }
            debug!(protocol = %message.protocol, seq = message.seq, "sending");
            let to = message.to_xpub;
            self.io.send(&to, message).await?;
            record.sends_completed += 1;
            self.checkpoint(record).await?;
        }
        Ok(())
    }

    async fn wait(
        &self,
        ctx: &mut Context,
        seq: u32,
        record: &mut WalRecord,
        replay: &mut Replay,
    ) -> MachineResult<()> {
        let message = match replay.received.pop_front() {
            Some(message) => message,
            None => {
                let message = self.receive_in_run(ctx, seq).await?;
                record.received.push(message.clone());
                message
            }
        };
        debug!(protocol = %message.protocol, seq, "received");
        ctx.inbox.clear();
        ctx.inbox.push(message);
        Ok(())
    }

    /// The message `seq` of the current run.
    ///
    /// Messages of other runs and repeats of steps already taken are
    /// dropped. Within the run, a later `seq` or changed parameters abort.
    async fn receive_in_run(&self, ctx: &Context, seq: u32) -> MachineResult<ProtocolMessage> {
        let key = ctx.params().inbox_key()?;
        loop {
            let message = self.io.receive(&key).await?;
            if message.run_id != ctx.message.run_id {
                debug!(
                    protocol = %message.protocol,
                    run_id = %message.run_id,
                    seq = message.seq,
                    "dropping message of another run"
                );
                continue;
            }
            if !message.same_run(&ctx.message) {
                return Err(MachineError::violation(ctx.protocol(), "parameters changed mid-run"));
            }
            if message.seq < seq {
                debug!(
                    protocol = %message.protocol,
                    seq = message.seq,
                    expected = seq,
                    "dropping repeated message"
                );
                continue;
            }
            if message.seq > seq {
                return Err(MachineError::violation(
                    ctx.protocol(),
                    format!("expected seq {seq}, received {}", message.seq),
                ));
            }
            return Ok(message);
        }
    }

    async fn commit(&self, ctx: &mut Context) -> MachineResult<()> {
        for slot in &ctx.commitments {
            let signatures = slot.signatures();
            if signatures.len() < slot.required_signatures {
                return Err(MachineError::MissingSignature(format!(
                    "{} has {} of {} signatures",
                    slot.commitment.kind(),
                    signatures.len(),
                    slot.required_signatures
                )));
            }
            let transaction = slot.commitment.transaction(&signatures)?;
            let hash = slot.commitment.hash_to_sign();
            self.commitments
                .store_commitment(ctx.protocol(), slot.commitment.kind(), hash, transaction)
                .await?;
            info!(
                protocol = %ctx.protocol(),
                kind = %slot.commitment.kind(),
                hash = %hash,
                opcode = %Opcode::WriteCommitment,
                "commitment stored"
            );
        }
        Ok(())
    }
}

impl fmt::Debug for InstructionExecutor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InstructionExecutor")
            .field("network", &self.network)
            .field("config", &self.config)
            .field("wal", &self.wal.is_some())
            .finish()
    }
}
