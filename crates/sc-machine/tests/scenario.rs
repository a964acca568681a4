//! Two-party channel lifecycle over the in-memory network.

mod common;

use common::*;
use sc_crypto::{random_address, sort_addresses, Address, ExtendedPrivateKey, H256};
use sc_machine::ethereum::CommitmentKind;
use sc_machine::protocol::{
    InstallParams, ProtocolParams, TakeActionParams, UninstallParams, UpdateParams,
};
use sc_machine::{
    InMemoryNetwork, InboxKey, MachineError, Protocol, ProtocolMessage, RunnerEvent, StateChannel,
};

/// The app installed most recently in `channel`.
fn latest_app(channel: &StateChannel) -> H256 {
    let seq = channel.num_installed_apps();
    channel
        .app_instances()
        .iter()
        .find(|(_, app)| app.app_seq_no == seq)
        .map(|(id, _)| *id)
        .expect("installed app")
}

async fn install_counter(a: &Node, b: &Node, multisig: Address, a_stake: u128, b_stake: u128) -> H256 {
    let channel = a.channel(&multisig).await;
    let (alice, bob) = alice_bob(&channel, a, a_stake, b_stake);
    run(
        a,
        &[b],
        ProtocolParams::Install(InstallParams {
            initiating_xpub: a.xpub,
            responding_xpub: b.xpub,
            multisig_address: multisig,
            proposal: counter_proposal(a_stake + b_stake),
            alice_balance_decrement: alice,
            bob_balance_decrement: bob,
        }),
    )
    .await;
    latest_app(&a.channel(&multisig).await)
}

// ============================================================================
// Setup and deposit
// ============================================================================

#[tokio::test]
async fn test_setup_creates_matching_channels() {
    init_tracing();
    let network = InMemoryNetwork::new();
    let a = Node::spawn(&network).await;
    let b = Node::spawn(&network).await;

    let multisig = setup(&a, &b).await;
    let on_a = a.channel(&multisig).await;
    let on_b = b.channel(&multisig).await;
    assert_eq!(on_a, on_b);

    let mut owners = vec![a.xpub.owner_address().unwrap(), b.xpub.owner_address().unwrap()];
    sort_addresses(&mut owners);
    assert_eq!(on_a.multisig_owners(), owners.as_slice());
    assert_eq!(on_a.free_balance_state().unwrap().total().unwrap(), 0);
    assert_eq!(on_a.num_installed_apps(), 1);

    assert_eq!(a.commitments.of_kind(CommitmentKind::Setup).await.len(), 1);
    assert_eq!(b.commitments.of_kind(CommitmentKind::Setup).await.len(), 1);
}

#[tokio::test]
async fn test_deposit_credits_depositor() {
    let network = InMemoryNetwork::new();
    let a = Node::spawn(&network).await;
    let b = Node::spawn(&network).await;
    let multisig = setup(&a, &b).await;

    deposit(&a, &b, multisig, 10).await;

    for node in [&a, &b] {
        assert_eq!(node.free_balance_of(&multisig, &a.xpub).await, 10);
        assert_eq!(node.free_balance_of(&multisig, &b.xpub).await, 0);
        let channel = node.channel(&multisig).await;
        assert!(channel.app_instances().is_empty());
        assert_eq!(channel.num_installed_apps(), 2);
    }
    assert_eq!(a.channel(&multisig).await, b.channel(&multisig).await);
}

// ============================================================================
// Apps
// ============================================================================

#[tokio::test]
async fn test_app_lifecycle() {
    init_tracing();
    let network = InMemoryNetwork::new();
    let a = Node::spawn(&network).await;
    let b = Node::spawn(&network).await;
    let multisig = setup(&a, &b).await;
    deposit(&a, &b, multisig, 10).await;
    deposit(&b, &a, multisig, 5).await;

    // install funded 3 by a and 1 by b
    let app_id = install_counter(&a, &b, multisig, 3, 1).await;
    for node in [&a, &b] {
        let channel = node.channel(&multisig).await;
        assert!(channel.app_instances().contains_key(&app_id));
        assert_eq!(channel.free_balance_state().unwrap().total().unwrap(), 11);
        assert_eq!(channel.total_value().unwrap(), 15);
    }
    assert_eq!(a.free_balance_of(&multisig, &a.xpub).await, 7);
    assert_eq!(b.free_balance_of(&multisig, &b.xpub).await, 4);

    // update to an explicit state
    run(
        &a,
        &[&b],
        ProtocolParams::Update(UpdateParams {
            initiating_xpub: a.xpub,
            responding_xpub: b.xpub,
            multisig_address: multisig,
            app_identity_hash: app_id,
            new_state: counter_state(5),
        }),
    )
    .await;

    // b advances it by an action
    run(
        &b,
        &[&a],
        ProtocolParams::TakeAction(TakeActionParams {
            initiating_xpub: b.xpub,
            responding_xpub: a.xpub,
            multisig_address: multisig,
            app_identity_hash: app_id,
            action: counter_state(2),
        }),
    )
    .await;
    for node in [&a, &b] {
        let app = node.channel(&multisig).await.app_instance(&app_id).unwrap().clone();
        assert_eq!(read_counter(&app.latest_state), 7);
        assert_eq!(app.latest_nonce, 2);
    }
    assert_eq!(a.commitments.of_kind(CommitmentKind::SetState).await.len(), 2);

    // uninstall paying everything to b
    let channel = a.channel(&multisig).await;
    let (alice, bob) = alice_bob(&channel, &a, 0, 4);
    run(
        &a,
        &[&b],
        ProtocolParams::Uninstall(UninstallParams {
            initiating_xpub: a.xpub,
            responding_xpub: b.xpub,
            multisig_address: multisig,
            app_identity_hash: app_id,
            alice_balance_increment: alice,
            bob_balance_increment: bob,
        }),
    )
    .await;
    for node in [&a, &b] {
        let channel = node.channel(&multisig).await;
        assert!(!channel.app_instances().contains_key(&app_id));
        assert_eq!(channel.free_balance_state().unwrap().total().unwrap(), 15);
    }
    assert_eq!(a.free_balance_of(&multisig, &a.xpub).await, 7);
    assert_eq!(a.free_balance_of(&multisig, &b.xpub).await, 8);
}

#[tokio::test]
async fn test_overdrawn_install_changes_nothing() {
    let network = InMemoryNetwork::new();
    let a = Node::spawn(&network).await;
    let b = Node::spawn(&network).await;
    let multisig = setup(&a, &b).await;
    deposit(&a, &b, multisig, 2).await;
    let before = a.channel(&multisig).await;
    let sent = a.transport.sent();

    let (alice, bob) = alice_bob(&before, &a, 3, 0);
    let err = a
        .runner
        .initiate(ProtocolParams::Install(InstallParams {
            initiating_xpub: a.xpub,
            responding_xpub: b.xpub,
            multisig_address: multisig,
            proposal: counter_proposal(3),
            alice_balance_decrement: alice,
            bob_balance_decrement: bob,
        }))
        .await
        .unwrap_err();
    assert!(matches!(err, MachineError::InsufficientFunds { .. }));
    assert_eq!(a.channel(&multisig).await, before);
    assert_eq!(a.transport.sent(), sent);
}

#[tokio::test]
async fn test_unfunded_install_cannot_mint_value() {
    let network = InMemoryNetwork::new();
    let a = Node::spawn(&network).await;
    let b = Node::spawn(&network).await;
    let multisig = setup(&a, &b).await;
    deposit(&a, &b, multisig, 10).await;
    let before = a.channel(&multisig).await;
    let sent = a.transport.sent();

    // an app that may pay out 100 while nothing backs it
    let err = a
        .runner
        .initiate(ProtocolParams::Install(InstallParams {
            initiating_xpub: a.xpub,
            responding_xpub: b.xpub,
            multisig_address: multisig,
            proposal: counter_proposal(100),
            alice_balance_decrement: 0,
            bob_balance_decrement: 0,
        }))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        MachineError::CollateralMismatch { funded: 0, limit: 100 }
    ));
    assert_eq!(a.transport.sent(), sent);
    for node in [&a, &b] {
        let channel = node.channel(&multisig).await;
        assert_eq!(channel, before);
        assert_eq!(channel.total_value().unwrap(), 10);
    }
}

#[tokio::test]
async fn test_forged_install_signature_rejected_before_signing() {
    let network = InMemoryNetwork::new();
    let a = Node::spawn(&network).await;
    let b = Node::spawn(&network).await;
    let multisig = setup(&a, &b).await;
    deposit(&a, &b, multisig, 10).await;
    let before = b.channel(&multisig).await;
    let sent = b.transport.sent();
    let installs = b.commitments.of_kind(CommitmentKind::Install).await.len();

    let (alice, bob) = alice_bob(&before, &a, 2, 0);
    let params = ProtocolParams::Install(InstallParams {
        initiating_xpub: a.xpub,
        responding_xpub: b.xpub,
        multisig_address: multisig,
        proposal: counter_proposal(2),
        alice_balance_decrement: alice,
        bob_balance_decrement: bob,
    });
    let forger = ExtendedPrivateKey::generate().kth_keypair(0).unwrap();
    let forged = ProtocolMessage::starting(params, a.xpub, b.xpub)
        .forward(a.xpub, b.xpub, 1)
        .with_signatures(Some(forger.sign_digest(&H256([7; 32]))), None, None);

    let err = b.runner.handle_message(forged).await.unwrap_err();
    assert!(matches!(err, MachineError::InvalidSignature { .. }));
    assert_eq!(b.transport.sent(), sent);
    assert_eq!(b.commitments.of_kind(CommitmentKind::Install).await.len(), installs);
    assert_eq!(b.channel(&multisig).await, before);
    assert_eq!(a.channel(&multisig).await, before);
}

#[tokio::test]
async fn test_stale_reply_does_not_disturb_later_runs() {
    let network = InMemoryNetwork::new();
    let a = Node::spawn(&network).await;
    let b = Node::spawn(&network).await;
    let multisig = setup(&a, &b).await;
    deposit(&a, &b, multisig, 10).await;

    let channel = a.channel(&multisig).await;
    let installs = a.commitments.of_kind(CommitmentKind::Install).await.len();
    let (alice, bob) = alice_bob(&channel, &a, 1, 0);
    let params = ProtocolParams::Install(InstallParams {
        initiating_xpub: a.xpub,
        responding_xpub: b.xpub,
        multisig_address: multisig,
        proposal: counter_proposal(1),
        alice_balance_decrement: alice,
        bob_balance_decrement: bob,
    });

    // a reply left over from a run that never completed here
    let stale = ProtocolMessage::starting(params.clone(), a.xpub, b.xpub).forward(b.xpub, a.xpub, 2);
    a.runner.handle_message(stale).await.unwrap();
    let key = InboxKey::Multisig(multisig);
    assert_eq!(a.transport.inbox().pending(&key), 1);

    run(&a, &[&b], params.clone()).await;
    assert_eq!(a.transport.inbox().pending(&key), 0);
    run(&a, &[&b], params).await;

    let channel = a.channel(&multisig).await;
    assert_eq!(channel, b.channel(&multisig).await);
    assert_eq!(channel.app_instances().len(), 2);
    assert_eq!(channel.total_value().unwrap(), 10);
    assert_eq!(a.free_balance_of(&multisig, &a.xpub).await, 8);
    assert_eq!(a.commitments.of_kind(CommitmentKind::Install).await.len(), installs + 2);
}

#[tokio::test]
async fn test_completed_event_names_changed_channels_only() {
    let network = InMemoryNetwork::new();
    let a = Node::spawn(&network).await;
    let b = Node::spawn(&network).await;
    let c = Node::spawn(&network).await;
    let with_b = setup(&a, &b).await;
    let with_c = setup(&a, &c).await;
    deposit(&a, &b, with_b, 5).await;

    let mut events = a.events();
    install_counter(&a, &b, with_b, 1, 0).await;
    assert_eq!(
        events.recv().await.unwrap(),
        RunnerEvent::Completed {
            protocol: Protocol::Install,
            channels: vec![with_b],
        }
    );
    assert!(a.channel(&with_c).await.app_instances().is_empty());
}

#[tokio::test]
async fn test_uninstall_payout_over_limit_rejected() {
    let network = InMemoryNetwork::new();
    let a = Node::spawn(&network).await;
    let b = Node::spawn(&network).await;
    let multisig = setup(&a, &b).await;
    deposit(&a, &b, multisig, 10).await;
    let app_id = install_counter(&a, &b, multisig, 2, 0).await;

    let channel = a.channel(&multisig).await;
    let (alice, bob) = alice_bob(&channel, &a, 3, 0);
    let err = a
        .runner
        .initiate(ProtocolParams::Uninstall(UninstallParams {
            initiating_xpub: a.xpub,
            responding_xpub: b.xpub,
            multisig_address: multisig,
            app_identity_hash: app_id,
            alice_balance_increment: alice,
            bob_balance_increment: bob,
        }))
        .await
        .unwrap_err();
    assert!(matches!(err, MachineError::InvalidPayout { payout: 3, limit: 2 }));
    assert!(a.channel(&multisig).await.app_instances().contains_key(&app_id));
}

// ============================================================================
// Withdraw
// ============================================================================

#[tokio::test]
async fn test_withdraw_moves_funds_out() {
    let network = InMemoryNetwork::new();
    let a = Node::spawn(&network).await;
    let b = Node::spawn(&network).await;
    let multisig = setup(&a, &b).await;
    deposit(&a, &b, multisig, 10).await;

    let mut events = b.events();
    let recipient = random_address();
    a.runner.withdraw(multisig, recipient, 4).await.unwrap();
    settled(&mut events, Protocol::Withdraw).await;

    for node in [&a, &b] {
        assert_eq!(node.free_balance_of(&multisig, &a.xpub).await, 6);
        let channel = node.channel(&multisig).await;
        assert!(channel.app_instances().is_empty());
        assert_eq!(channel.total_value().unwrap(), 6);

        let withdrawals = node.commitments.of_kind(CommitmentKind::WithdrawEth).await;
        assert_eq!(withdrawals.len(), 1);
        assert_eq!(withdrawals[0].transaction.to, multisig);
    }
    assert_eq!(a.channel(&multisig).await, b.channel(&multisig).await);
}

#[tokio::test]
async fn test_withdraw_more_than_balance_fails() {
    let network = InMemoryNetwork::new();
    let a = Node::spawn(&network).await;
    let b = Node::spawn(&network).await;
    let multisig = setup(&a, &b).await;
    deposit(&a, &b, multisig, 1).await;

    let err = a.runner.withdraw(multisig, random_address(), 2).await.unwrap_err();
    assert!(matches!(err, MachineError::InsufficientFunds { .. }));
    assert_eq!(a.free_balance_of(&multisig, &a.xpub).await, 1);
}
