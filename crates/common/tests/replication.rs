//! Integration tests for replica reconciliation: fast-forward, Merkle
//! diff, full rebuild, and ordering guarantees.

mod common;

use ::common::crypto::Hash32;
use ::common::log::UpdatePayload;
use ::common::sync::{self, Outcome, SyncError};
use ::common::vault::{Vault, ROOT_FOLDER_ID};

use crate::common::LocalSyncClient;

#[tokio::test]
async fn fast_forward_applies_single_update() {
    let master = common::master().await;
    let replica = common::replica(&master).await;
    let client = LocalSyncClient::for_master(&master);

    let src = common::plain_file(&master.dir, "a.bin", 2048);
    master
        .app
        .add_file(&src, "a.bin", ROOT_FOLDER_ID)
        .await
        .unwrap();

    let signed = common::signed_update(&master, 1).await;
    let outcome = sync::process_update(&replica.state, &client, &signed)
        .await
        .unwrap();

    // Applied with one blob to fetch.
    let downloads = match outcome {
        Outcome::Applied { downloads } => downloads,
        other => panic!("expected applied outcome, got {other:?}"),
    };
    assert_eq!(downloads.len(), 1);

    let update = signed.update().unwrap();
    assert_eq!(replica.state.db.current_update_id().await.unwrap(), 1);
    assert_eq!(replica.state.db.data_hash().await.unwrap(), update.data_hash);
    assert_eq!(
        replica.state.merkle.lock().await.root_hash(),
        update.data_hash
    );
    let (count, _) = replica.state.db.storage_stats().await.unwrap();
    assert_eq!(count, 1);

    // Now fetch the blob and verify it checks out.
    sync::download_file(&replica.state, &client, downloads[0])
        .await
        .unwrap();
    let value_hash = downloads[0].value_hash;
    assert!(replica.state.objects.exists(&value_hash));
    replica.state.objects.validate_or_remove(&value_hash).unwrap();
    assert_eq!(
        replica.state.db.download_progress(&value_hash).await.unwrap(),
        downloads[0].size
    );
}

#[tokio::test]
async fn stale_updates_are_dropped() {
    let master = common::master().await;
    let replica = common::replica(&master).await;
    let client = LocalSyncClient::for_master(&master);

    let src = common::plain_file(&master.dir, "a.bin", 100);
    master
        .app
        .add_file(&src, "a.bin", ROOT_FOLDER_ID)
        .await
        .unwrap();

    let signed = common::signed_update(&master, 1).await;
    sync::process_update(&replica.state, &client, &signed)
        .await
        .unwrap();

    // The same update again is stale and changes nothing.
    let root = replica.state.db.data_hash().await.unwrap();
    let outcome = sync::process_update(&replica.state, &client, &signed)
        .await
        .unwrap();
    assert!(matches!(outcome, Outcome::Stale));
    assert_eq!(replica.state.db.current_update_id().await.unwrap(), 1);
    assert_eq!(replica.state.db.data_hash().await.unwrap(), root);
}

#[tokio::test]
async fn tampered_update_is_rejected() {
    let master = common::master().await;
    let replica = common::replica(&master).await;
    let client = LocalSyncClient::for_master(&master);

    master.app.create_folder("docs", ROOT_FOLDER_ID).await.unwrap();
    let mut signed = common::signed_update(&master, 1).await;
    signed.update[0] ^= 0x01;

    let result = sync::process_update(&replica.state, &client, &signed).await;
    assert!(matches!(result, Err(SyncError::Update(_))));
    assert_eq!(replica.state.db.current_update_id().await.unwrap(), 0);
}

#[tokio::test]
async fn merkle_diff_catches_up_after_offline_gap() {
    let master = common::master().await;
    let replica = common::replica(&master).await;
    let client = LocalSyncClient::for_master(&master);

    // The replica missed five folder creations and only sees the sixth
    // update; its prev_data_hash cannot match.
    for i in 0..6 {
        master
            .app
            .create_folder(&format!("folder-{i}"), ROOT_FOLDER_ID)
            .await
            .unwrap();
    }

    let signed = common::signed_update(&master, 6).await;
    let outcome = sync::process_update(&replica.state, &client, &signed)
        .await
        .unwrap();
    // Folders carry no blobs.
    assert!(matches!(outcome, Outcome::Applied { downloads } if downloads.is_empty()));

    let update = signed.update().unwrap();
    assert_eq!(replica.state.db.current_update_id().await.unwrap(), 6);
    assert_eq!(
        replica.state.merkle.lock().await.root_hash(),
        update.data_hash
    );
    let (count, _) = replica.state.db.storage_stats().await.unwrap();
    assert_eq!(count, 6);
}

#[tokio::test]
async fn rebuild_adopts_master_bucket_count() {
    let master = common::master().await;
    let replica = common::replica(&master).await;
    let client = LocalSyncClient::for_master(&master);

    // Enough entries to force the master's tree past one bucket; the empty
    // replica still has a single bucket, so reconciliation must rebuild.
    for i in 0..25 {
        master
            .app
            .create_folder(&format!("folder-{i}"), ROOT_FOLDER_ID)
            .await
            .unwrap();
    }

    let signed = common::signed_update(&master, 25).await;
    let update = signed.update().unwrap();
    assert!(update.num_buckets > 1, "master tree should have grown");

    sync::process_update(&replica.state, &client, &signed)
        .await
        .unwrap();

    let tree = replica.state.merkle.lock().await;
    assert_eq!(tree.num_buckets() as u32, update.num_buckets);
    assert_eq!(tree.root_hash(), update.data_hash);
    drop(tree);

    let (count, _) = replica.state.db.storage_stats().await.unwrap();
    assert_eq!(count, 25);
}

#[tokio::test]
async fn diff_converges_after_master_deletes() {
    let master = common::master().await;
    let replica = common::replica(&master).await;
    let client = LocalSyncClient::for_master(&master);

    for i in 0..4 {
        master
            .app
            .create_folder(&format!("folder-{i}"), ROOT_FOLDER_ID)
            .await
            .unwrap();
    }
    // Catch the replica up fully, one update at a time.
    for id in 1..=4 {
        let signed = common::signed_update(&master, id).await;
        sync::process_update(&replica.state, &client, &signed)
            .await
            .unwrap();
    }

    // Now the master deletes two folders while the replica is offline;
    // the replica sees only the final update and must drop stale rows.
    master.app.delete_folder(3).await.unwrap();
    master.app.delete_folder(4).await.unwrap();

    let signed = common::signed_update(&master, 6).await;
    sync::process_update(&replica.state, &client, &signed)
        .await
        .unwrap();

    let update = signed.update().unwrap();
    assert_eq!(
        replica.state.merkle.lock().await.root_hash(),
        update.data_hash
    );
    let (count, _) = replica.state.db.storage_stats().await.unwrap();
    assert_eq!(count, 2);
}

#[tokio::test]
async fn peer_update_fast_forward_does_no_blob_io() {
    let master = common::master().await;
    let replica = common::replica(&master).await;
    let client = LocalSyncClient::for_master(&master);

    // Mirror the master's current peer set (the bound state a replica
    // would have), then apply a peer-only update.
    let peers = master.app.db().all_peers().await.unwrap();
    replica.state.db.replace_all_peers(&peers).await.unwrap();

    master
        .app
        .authorize_peer("z-test-peer-id", Vec::new())
        .await
        .unwrap();

    let signed = common::signed_update(&master, 1).await;
    let update = signed.update().unwrap();
    assert!(matches!(update.payload, UpdatePayload::Peer(_)));
    assert_eq!(update.data_hash, update.prev_data_hash);

    let outcome = sync::process_update(&replica.state, &client, &signed)
        .await
        .unwrap();
    assert!(matches!(outcome, Outcome::Applied { downloads } if downloads.is_empty()));

    // The replica's peer set now matches the update.
    assert_eq!(
        replica.state.db.peer_list_hash().await.unwrap(),
        update.peer_list_hash
    );
    let ids = replica.state.db.all_peer_ids().await.unwrap();
    assert!(ids.contains(&"z-test-peer-id".to_string()));
    // And no data was touched.
    assert_eq!(replica.state.db.data_hash().await.unwrap(), Hash32::ZERO);
}

#[tokio::test]
async fn diverged_peer_set_falls_back_to_full_list_sync() {
    let master = common::master().await;
    let replica = common::replica(&master).await;
    let client = LocalSyncClient::for_master(&master);

    // Two peer updates while the replica was offline: it receives only the
    // second, whose prev hash doesn't match the replica's state, so the
    // fast-forward cannot apply and the whole list is fetched instead.
    master
        .app
        .authorize_peer("peer-one", Vec::new())
        .await
        .unwrap();
    master
        .app
        .authorize_peer("peer-two", Vec::new())
        .await
        .unwrap();

    let signed = common::signed_update(&master, 2).await;
    sync::process_update(&replica.state, &client, &signed)
        .await
        .unwrap();

    let update = signed.update().unwrap();
    assert_eq!(
        replica.state.db.peer_list_hash().await.unwrap(),
        update.peer_list_hash
    );
    // The replica's table now mirrors the master's exactly.
    assert_eq!(
        replica.state.db.all_peer_ids().await.unwrap(),
        master.app.db().all_peer_ids().await.unwrap()
    );
}

#[tokio::test]
async fn second_device_with_mnemonic_can_decrypt_synced_files() {
    let master = common::master().await;
    let replica = common::replica(&master).await;
    let client = LocalSyncClient::for_master(&master);

    let src = common::plain_file(&master.dir, "secret.bin", 50_000);
    master
        .app
        .add_file(&src, "secret.bin", ROOT_FOLDER_ID)
        .await
        .unwrap();

    let signed = common::signed_update(&master, 1).await;
    let outcome = sync::process_update(&replica.state, &client, &signed)
        .await
        .unwrap();
    let downloads = match outcome {
        Outcome::Applied { downloads } => downloads,
        other => panic!("expected applied outcome, got {other:?}"),
    };
    for download in &downloads {
        sync::download_file(&replica.state, &client, *download)
            .await
            .unwrap();
    }

    // Unlocking the replica's store with the vault mnemonic makes the
    // synced ciphertext readable.
    let content_key = ::common::crypto::derive_content_key(&master.mnemonic).unwrap();
    let vault = Vault::load(
        replica.state.db.clone(),
        replica.state.objects.clone(),
        content_key,
    )
    .await
    .unwrap();
    vault.backfill_folder_tags().await.unwrap();

    let dest = master.dir.path().join("replica-export.bin");
    vault
        .export_file("secret.bin", ROOT_FOLDER_ID, &dest)
        .await
        .unwrap();
    assert_eq!(std::fs::read(&src).unwrap(), std::fs::read(&dest).unwrap());
}
