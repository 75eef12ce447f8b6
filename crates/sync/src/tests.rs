//! End-to-end scenarios driving a [`Synchronizer`] against scripted
//! collaborators.

use std::time::{Duration, Instant};

use assert_matches::assert_matches;
use pretty_assertions::assert_eq;
use veil_client_types::{
    Address, CompleteAddress, Field, Note, PartialAddress, MAX_NOTE_HASHES_PER_TX,
};

use crate::test_utils::{test_account, test_slot, TestChain, TestHarness, TestInterpreter};
use crate::{SyncConfig, SyncError, SyncEvent, SyncStatus, Synchronizer};

fn fast_config(block_batch_size: usize) -> SyncConfig {
    SyncConfig {
        block_batch_size,
        retry_interval: Duration::from_millis(10),
        instance: None,
    }
}

async fn wait_for_status(
    synchronizer: &Synchronizer,
    what: &str,
    predicate: impl Fn(&SyncStatus) -> bool,
) -> SyncStatus {
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        let status = synchronizer.get_sync_status().await.unwrap();
        if predicate(&status) {
            return status;
        }
        assert!(Instant::now() < deadline, "timed out waiting for {what}, last status {status:?}");
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

#[tokio::test]
async fn linear_sync_discovers_all_notes() {
    let harness = TestHarness::new();
    let (owner, _) = test_account(&harness, 1);
    let contract = Address::from_u64(10);
    harness.interpreter.register_contract(contract);

    let mut chain = TestChain::new();
    for i in 0..3 {
        chain.add_note_block(owner, contract, &Note::new(vec![Field::from_u64(100 + i)]));
    }
    chain.publish(&harness.node);

    let (synchronizer, _queue) = harness.synchronizer(fast_config(1));
    synchronizer.add_account(owner, harness.key_store.clone(), 1);
    synchronizer.start().await.unwrap();

    let status = wait_for_status(&synchronizer, "full account sync", |status| {
        status.blocks == 3 && status.notes.get(&owner.to_string()) == Some(&3)
    })
    .await;
    assert_eq!(status.notes.len(), 1);

    let mut stored = harness.db.notes();
    stored.sort_by_key(|note| note.leaf_index);
    assert_eq!(stored.len(), 3);
    // One note per block, each in its block's first leaf slot.
    for (index, note) in stored.iter().enumerate() {
        assert_eq!(note.leaf_index, index as u64 * MAX_NOTE_HASHES_PER_TX);
        assert_eq!(note.public_key, owner);
    }

    synchronizer.stop().await;
}

#[tokio::test]
async fn late_registered_account_catches_up_and_is_promoted() {
    let harness = TestHarness::new();
    let (owner, _) = test_account(&harness, 1);
    let contract = Address::from_u64(10);
    harness.interpreter.register_contract(contract);

    let mut chain = TestChain::new();
    for i in 0..12 {
        chain.add_note_block(owner, contract, &Note::new(vec![Field::from_u64(100 + i)]));
    }
    chain.publish(&harness.node);

    let account_address = Address::from_u64(900);
    harness.db.register_address(CompleteAddress {
        address: account_address,
        public_key: owner,
        partial_address: PartialAddress(Field::from_u64(1)),
    });

    let (synchronizer, _queue) = harness.synchronizer(fast_config(5));
    synchronizer.start().await.unwrap();
    // The global cursor jumps to the tip during the initial sync.
    assert!(synchronizer.is_global_state_synchronized().await.unwrap());

    let mut events = synchronizer.subscribe_events();
    synchronizer.add_account(owner, harness.key_store.clone(), 3);

    wait_for_status(&synchronizer, "catch-up", |status| {
        status.notes.get(&owner.to_string()) == Some(&12)
    })
    .await;

    // Exactly one caught-up event, for this account.
    let event = tokio::time::timeout(Duration::from_secs(5), events.recv())
        .await
        .expect("caught-up event should fire")
        .unwrap();
    let SyncEvent::NoteProcessorCaughtUp { public_key, stats, .. } = event;
    assert_eq!(public_key, owner);
    // Blocks 3..=12 carry one note each.
    assert_eq!(stats.decrypted, 10);
    assert_matches!(
        tokio::time::timeout(Duration::from_millis(100), events.recv()).await,
        Err(_),
        "no second caught-up event expected"
    );

    assert_eq!(harness.db.notes().len(), 10);
    assert!(synchronizer.is_account_state_synchronized(account_address).await.unwrap());

    synchronizer.stop().await;
}

#[tokio::test]
async fn deferred_note_is_decoded_once_the_contract_registers() {
    let harness = TestHarness::new();
    let (owner, _) = test_account(&harness, 1);
    let contract = Address::from_u64(10);
    // Contract unknown at scan time.

    let mut chain = TestChain::new();
    let note = Note::new(vec![Field::from_u64(42)]);
    chain.add_note_block(owner, contract, &note);
    chain.publish(&harness.node);

    let (synchronizer, _queue) = harness.synchronizer(fast_config(1));
    let mut events = synchronizer.subscribe_events();
    synchronizer.add_account(owner, harness.key_store.clone(), 1);
    synchronizer.start().await.unwrap();

    // Wait until the account is promoted; the note is parked as deferred.
    tokio::time::timeout(Duration::from_secs(5), events.recv())
        .await
        .expect("caught-up event should fire")
        .unwrap();
    assert_eq!(harness.db.notes(), vec![]);
    assert_eq!(harness.db.deferred_notes().len(), 1);

    harness.interpreter.register_contract(contract);
    synchronizer.reprocess_deferred_notes_for_contract(contract).await.unwrap();

    assert_eq!(harness.db.deferred_notes(), vec![]);
    let stored = harness.db.notes();
    assert_eq!(stored.len(), 1);
    assert_eq!(stored[0].note, note);
    assert_eq!(stored[0].contract_address, contract);

    synchronizer.stop().await;
}

#[tokio::test]
async fn deferred_note_nullified_before_reprocessing_is_scrubbed() {
    let harness = TestHarness::new();
    let (owner, _) = test_account(&harness, 1);
    let contract = Address::from_u64(10);

    let mut chain = TestChain::new();
    let note = Note::new(vec![Field::from_u64(42)]);
    chain.add_note_block(owner, contract, &note);
    chain.publish(&harness.node);

    let (synchronizer, _queue) = harness.synchronizer(fast_config(1));
    let mut events = synchronizer.subscribe_events();
    synchronizer.add_account(owner, harness.key_store.clone(), 1);
    synchronizer.start().await.unwrap();
    tokio::time::timeout(Duration::from_secs(5), events.recv())
        .await
        .expect("caught-up event should fire")
        .unwrap();
    assert_eq!(harness.db.deferred_notes().len(), 1);

    // The note is spent on chain while still deferred locally.
    harness
        .node
        .add_nullifier_leaf(TestInterpreter::nullifier_for(contract, test_slot(), &note));

    harness.interpreter.register_contract(contract);
    synchronizer.reprocess_deferred_notes_for_contract(contract).await.unwrap();

    // Decoded, inserted, and immediately removed by the nullifier scan.
    assert_eq!(harness.db.deferred_notes(), vec![]);
    assert_eq!(harness.db.notes(), vec![]);

    synchronizer.stop().await;
}

#[tokio::test]
async fn transient_node_failure_is_retried_without_double_processing() {
    let harness = TestHarness::new();
    let (owner, _) = test_account(&harness, 1);
    let contract = Address::from_u64(10);
    harness.interpreter.register_contract(contract);

    let mut chain = TestChain::new();
    for i in 0..3 {
        chain.add_note_block(owner, contract, &Note::new(vec![Field::from_u64(100 + i)]));
    }
    chain.publish(&harness.node);
    harness.node.fail_next_get_logs(1);

    let (synchronizer, _queue) = harness.synchronizer(fast_config(1));
    synchronizer.add_account(owner, harness.key_store.clone(), 1);
    synchronizer.start().await.unwrap();

    wait_for_status(&synchronizer, "sync after transient failure", |status| {
        status.notes.get(&owner.to_string()) == Some(&3)
    })
    .await;

    // Every block processed exactly once.
    let stored = harness.db.notes();
    assert_eq!(stored.len(), 3);
    let mut leaf_indices: Vec<u64> = stored.iter().map(|note| note.leaf_index).collect();
    leaf_indices.sort_unstable();
    leaf_indices.dedup();
    assert_eq!(leaf_indices.len(), 3);

    synchronizer.stop().await;
}

#[tokio::test]
async fn short_block_response_is_truncated_and_resumed() {
    let harness = TestHarness::new();
    let (owner, _) = test_account(&harness, 1);
    let contract = Address::from_u64(10);
    harness.interpreter.register_contract(contract);

    let mut chain = TestChain::new();
    for i in 0..5 {
        chain.add_note_block(owner, contract, &Note::new(vec![Field::from_u64(100 + i)]));
    }
    for (block, logs) in chain.blocks_from(1).into_iter().take(3) {
        harness.node.push_block(block, logs);
    }

    let (synchronizer, _queue) = harness.synchronizer(fast_config(5));
    synchronizer.add_account(owner, harness.key_store.clone(), 1);
    synchronizer.start().await.unwrap();
    wait_for_status(&synchronizer, "initial three blocks", |status| {
        status.notes.get(&owner.to_string()) == Some(&3)
    })
    .await;

    // Two more blocks appear, but the node serves logs for both while only
    // serving one block: the batch must be truncated to the served prefix.
    harness.node.set_max_served_block(Some(4));
    for (block, logs) in chain.blocks_from(4) {
        harness.node.push_block(block, logs);
    }

    wait_for_status(&synchronizer, "truncated batch", |status| {
        status.blocks == 4 && status.notes.get(&owner.to_string()) == Some(&4)
    })
    .await;
    assert_eq!(harness.db.notes().len(), 4);

    // Once the node serves the remainder, the next tick picks it up fresh.
    harness.node.set_max_served_block(None);
    wait_for_status(&synchronizer, "resumed batch", |status| {
        status.blocks == 5 && status.notes.get(&owner.to_string()) == Some(&5)
    })
    .await;

    let stored = harness.db.notes();
    assert_eq!(stored.len(), 5);
    let mut leaf_indices: Vec<u64> = stored.iter().map(|note| note.leaf_index).collect();
    leaf_indices.sort_unstable();
    leaf_indices.dedup();
    assert_eq!(leaf_indices.len(), 5, "no block was processed twice");

    synchronizer.stop().await;
}

#[tokio::test]
async fn start_is_idempotent() {
    let harness = TestHarness::new();
    let mut chain = TestChain::new();
    chain.add_empty_block();
    chain.publish(&harness.node);

    let (synchronizer, _queue) = harness.synchronizer(fast_config(1));
    synchronizer.start().await.unwrap();
    synchronizer.start().await.unwrap();

    // The initial header sync ran exactly once.
    assert_eq!(harness.node.header_calls(), 1);
    assert!(synchronizer.is_global_state_synchronized().await.unwrap());

    synchronizer.stop().await;
}

#[tokio::test]
async fn add_account_is_idempotent() {
    let harness = TestHarness::new();
    let (owner, _) = test_account(&harness, 1);
    let mut chain = TestChain::new();
    chain.add_empty_block();
    chain.publish(&harness.node);

    let (synchronizer, _queue) = harness.synchronizer(fast_config(1));
    synchronizer.add_account(owner, harness.key_store.clone(), 1);
    synchronizer.add_account(owner, harness.key_store.clone(), 1);

    let status = synchronizer.get_sync_status().await.unwrap();
    assert_eq!(status.notes.len(), 1);
}

#[tokio::test]
async fn account_state_queries_reject_unknown_and_recipient_only_accounts() {
    let harness = TestHarness::new();
    let (owner, _) = test_account(&harness, 1);
    let (synchronizer, _queue) = harness.synchronizer(fast_config(1));

    let unknown = Address::from_u64(404);
    assert_matches!(
        synchronizer.is_account_state_synchronized(unknown).await,
        Err(SyncError::UnregisteredAccount(address)) if address == unknown
    );

    // Known address, but only as a recipient: no processor is registered.
    let recipient = Address::from_u64(901);
    harness.db.register_address(CompleteAddress {
        address: recipient,
        public_key: owner,
        partial_address: PartialAddress(Field::from_u64(2)),
    });
    assert_matches!(
        synchronizer.is_account_state_synchronized(recipient).await,
        Err(SyncError::RecipientOnlyAccount(address)) if address == recipient
    );
}
