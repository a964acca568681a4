//! Multi-node harness over the in-memory network.

#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use sc_abi::{encode, AbiReader, Token};
use sc_crypto::{random_address, Address, ExtendedPrivateKey, ExtendedPublicKey};
use sc_machine::models::{AppInterface, Terms};
use sc_machine::protocol::{Protocol, ProtocolMessage, ProtocolParams, SetupParams};
use sc_machine::{
    AppInstance, AppLogic, AppProposal, InMemoryCommitmentStore, InMemoryLockService, InMemoryNetwork,
    InMemoryStore, InMemoryTransport, InstructionExecutor, LocalSigner, LockManager, MachineConfig,
    MachineError, MachineResult, NetworkContext, ProtocolRunner, RunnerEvent, StateChannel, Store,
    WriteAheadLog,
};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;

/// How long a test waits for a counterparty to finish its side of a run.
pub const SETTLE_TIMEOUT: Duration = Duration::from_secs(5);

// ============================================================================
// App logic
// ============================================================================

/// A counter app: state `uint256 counter`, action `uint256 increment`.
pub struct CounterApp;

impl AppLogic for CounterApp {
    fn apply_action(&self, app: &AppInstance, action: &[u8]) -> MachineResult<Vec<u8>> {
        let counter = AbiReader::new(&app.latest_state).read_uint()?;
        let increment = AbiReader::new(action).read_uint()?;
        let next = counter.checked_add(increment).ok_or(MachineError::BalanceOverflow)?;
        Ok(encode(&[Token::Uint(next)])?)
    }
}

pub fn counter_state(value: u128) -> Vec<u8> {
    encode(&[Token::Uint(value)]).unwrap()
}

pub fn read_counter(state: &[u8]) -> u128 {
    AbiReader::new(state).read_uint().unwrap()
}

pub fn counter_proposal(limit: u128) -> AppProposal {
    AppProposal {
        app_interface: AppInterface {
            addr: Address([0x42; 20]),
            state_encoding: "tuple(uint256 counter)".to_string(),
            action_encoding: Some("tuple(uint256 increment)".to_string()),
        },
        terms: Terms::eth(limit),
        default_timeout: 100,
        initial_state: counter_state(0),
    }
}

// ============================================================================
// Stores
// ============================================================================

/// An in-memory store whose next batch writing a channel fails.
#[derive(Default)]
pub struct FlakyStore {
    inner: InMemoryStore,
    fail_channel_write: AtomicBool,
}

impl FlakyStore {
    pub fn failing_next_channel_write() -> Self {
        Self {
            inner: InMemoryStore::new(),
            fail_channel_write: AtomicBool::new(true),
        }
    }
}

#[async_trait]
impl Store for FlakyStore {
    async fn get(&self, key: &str) -> MachineResult<Option<Vec<u8>>> {
        self.inner.get(key).await
    }

    async fn set(&self, entries: Vec<(String, Vec<u8>)>) -> MachineResult<()> {
        let writes_channel = entries.iter().any(|(key, _)| key.starts_with("channel/"));
        if writes_channel && self.fail_channel_write.swap(false, Ordering::SeqCst) {
            return Err(MachineError::Store("injected write failure".into()));
        }
        self.inner.set(entries).await
    }
}

// ============================================================================
// Nodes
// ============================================================================

pub struct Node {
    pub key: ExtendedPrivateKey,
    pub xpub: ExtendedPublicKey,
    pub runner: Arc<ProtocolRunner>,
    pub transport: Arc<InMemoryTransport>,
    pub commitments: InMemoryCommitmentStore,
    pub store: Arc<dyn Store>,
    inbound: Option<mpsc::UnboundedReceiver<ProtocolMessage>>,
    pump: Option<JoinHandle<()>>,
}

impl Node {
    /// A connected node that is not yet processing inbound messages.
    pub async fn connect(
        network: &InMemoryNetwork,
        key: ExtendedPrivateKey,
        store: Arc<dyn Store>,
        with_wal: bool,
    ) -> Self {
        let xpub = key.neuter();
        let (transport, inbound) = network.connect(xpub).await;
        let commitments = InMemoryCommitmentStore::new();
        let config = MachineConfig::default().with_lock_retry_backoff_ms(5);

        let mut executor = InstructionExecutor::new(
            NetworkContext::deterministic(),
            Arc::new(LocalSigner::new(key.clone())),
            transport.clone(),
            Arc::new(commitments.clone()),
        )
        .with_config(config.clone())
        .with_app_logic(Arc::new(CounterApp));
        if with_wal {
            executor = executor.with_write_ahead_log(WriteAheadLog::new(store.clone(), xpub.to_string()));
        }

        let runner = Arc::new(ProtocolRunner::new(
            Arc::new(executor),
            store.clone(),
            Arc::new(LockManager::new(Arc::new(InMemoryLockService::new()), config)),
            transport.inbox(),
        ));
        Self {
            key,
            xpub,
            runner,
            transport,
            commitments,
            store,
            inbound: Some(inbound),
            pump: None,
        }
    }

    /// A fresh node already processing inbound messages.
    pub async fn spawn(network: &InMemoryNetwork) -> Self {
        let mut node = Self::connect(
            network,
            ExtendedPrivateKey::generate(),
            Arc::new(InMemoryStore::new()),
            false,
        )
        .await;
        node.start();
        node
    }

    pub fn start(&mut self) {
        if let Some(inbound) = self.inbound.take() {
            self.pump = Some(self.runner.clone().spawn_pump(inbound));
        }
    }

    pub fn events(&self) -> broadcast::Receiver<RunnerEvent> {
        self.runner.subscribe()
    }

    pub async fn channel(&self, multisig: &Address) -> StateChannel {
        self.runner
            .channel(multisig)
            .await
            .unwrap()
            .expect("channel stored")
    }

    pub async fn free_balance_of(&self, multisig: &Address, owner: &ExtendedPublicKey) -> u128 {
        self.channel(multisig)
            .await
            .free_balance_state()
            .unwrap()
            .balance_of(&owner.owner_address().unwrap())
            .unwrap()
    }
}

impl Drop for Node {
    fn drop(&mut self) {
        if let Some(pump) = self.pump.take() {
            pump.abort();
        }
    }
}

// ============================================================================
// Runs
// ============================================================================

/// Wait until `events` reports `protocol` finished.
pub async fn settled(events: &mut broadcast::Receiver<RunnerEvent>, protocol: Protocol) {
    let wait = async {
        loop {
            match events.recv().await.expect("event channel open") {
                RunnerEvent::Completed { protocol: done, .. } if done == protocol => return,
                RunnerEvent::Failed { protocol: failed, reason } if failed == protocol => {
                    panic!("{protocol} failed on the counterparty: {reason}")
                }
                _ => {}
            }
        }
    };
    tokio::time::timeout(SETTLE_TIMEOUT, wait)
        .await
        .unwrap_or_else(|_| panic!("{protocol} did not settle"));
}

/// Run `params` from `initiator` and wait for every other party to finish.
pub async fn run(initiator: &Node, others: &[&Node], params: ProtocolParams) {
    let protocol = params.protocol();
    let mut events: Vec<_> = others.iter().map(|node| node.events()).collect();
    tokio::time::timeout(SETTLE_TIMEOUT, initiator.runner.initiate(params))
        .await
        .unwrap_or_else(|_| panic!("{protocol} timed out"))
        .unwrap_or_else(|err| panic!("{protocol} failed: {err}"));
    for events in &mut events {
        settled(events, protocol).await;
    }
}

/// Set up a channel between `a` and `b`.
pub async fn setup(a: &Node, b: &Node) -> Address {
    let multisig = random_address();
    run(
        a,
        &[b],
        ProtocolParams::Setup(SetupParams {
            initiating_xpub: a.xpub,
            responding_xpub: b.xpub,
            multisig_address: multisig,
        }),
    )
    .await;
    multisig
}

/// Deposit `amount` from `depositor` into the channel with `counterparty`.
pub async fn deposit(depositor: &Node, counterparty: &Node, multisig: Address, amount: u128) {
    let mut events = counterparty.events();
    tokio::time::timeout(SETTLE_TIMEOUT, depositor.runner.deposit(multisig, amount))
        .await
        .expect("deposit timed out")
        .expect("deposit failed");
    settled(&mut events, Protocol::Install).await;
    settled(&mut events, Protocol::Uninstall).await;
}

/// Split `(a_amount, b_amount)` into `(alice, bob)` form for `channel`.
pub fn alice_bob(channel: &StateChannel, a: &Node, a_amount: u128, b_amount: u128) -> (u128, u128) {
    let a_owner = a.xpub.owner_address().unwrap();
    if channel.multisig_owners()[0] == a_owner {
        (a_amount, b_amount)
    } else {
        (b_amount, a_amount)
    }
}

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}
