//! End-to-end client scenarios against the in-memory server.

use chrono::{Duration as ChronoDuration, Utc};
use std::sync::Arc;
use std::time::Duration;

use teamvault_common::{Error, EventKind, Permission, TeamId, TeamRole, UserId};
use teamvault_crypto::{unwrap_key, IdentityKeys, KdfParams, VaultKey};
use teamvault_storage::{MemoryBackend, NewBlob, SessionToken, StreamItem, VaultBackend};
use teamvault_sync::StreamState;
use teamvault_vault::{ClientConfig, Entry, Snapshot, SnapshotCodec, VaultClient};

struct Member {
    id: UserId,
    token: SessionToken,
    client: Arc<VaultClient>,
}

fn config() -> ClientConfig {
    ClientConfig::default()
        .with_kdf_params(KdfParams {
            iterations: 1,
            memory_size: 64,
            parallelism: 1,
            hash_length: 32,
        })
        .with_auto_lock(None)
}

async fn member(backend: &Arc<MemoryBackend>, name: &str) -> Member {
    let id = UserId::new(name).unwrap();
    backend.register_user(&id).await.unwrap();
    let token = backend.login(&id).await.unwrap();
    let client = Arc::new(VaultClient::new(backend.clone(), config()));
    client
        .enroll(id.clone(), token.clone(), "CorrectHorse1")
        .await
        .unwrap();
    Member { id, token, client }
}

/// Alice owns team `ops` with one shared entry; Bob is an active editor.
async fn team_of_two(backend: &Arc<MemoryBackend>) -> (Member, Member, TeamId) {
    let alice = member(backend, "alice").await;
    let bob = member(backend, "bob").await;
    let team = TeamId::new("ops").unwrap();

    alice.client.create_team(&team).await.unwrap();
    alice
        .client
        .invite_member(&team, &bob.id, TeamRole::Editor)
        .await
        .unwrap();
    let entry = Entry::new("db", "root", "s3cret", alice.id.clone()).with_team(team.clone());
    alice.client.upsert_entry(entry).await.unwrap();
    assert!(alice.client.flush_saves().await.is_empty());

    bob.client.accept_invitation(&team).await.unwrap();
    (alice, bob, team)
}

#[tokio::test]
async fn test_unlock_with_correct_and_wrong_passphrase() {
    let backend = Arc::new(MemoryBackend::new());
    let alice = member(&backend, "alice").await;
    alice.client.lock().await;

    let report = alice
        .client
        .unlock(alice.id.clone(), alice.token.clone(), "CorrectHorse1")
        .await
        .unwrap();
    assert!(report.is_clean());
    alice.client.lock().await;

    let wrong = alice
        .client
        .unlock(alice.id.clone(), alice.token.clone(), "wrong-pass")
        .await
        .unwrap_err();
    assert!(matches!(wrong, Error::Credential));
    assert!(!alice.client.is_unlocked().await);

    // A user without any identity gets the very same answer.
    let nobody = UserId::new("nobody").unwrap();
    backend.register_user(&nobody).await.unwrap();
    let token = backend.login(&nobody).await.unwrap();
    let missing = VaultClient::new(backend.clone(), config())
        .unlock(nobody, token, "wrong-pass")
        .await
        .unwrap_err();
    assert_eq!(wrong.to_string(), missing.to_string());
}

#[tokio::test]
async fn test_key_wrapped_for_alice_does_not_open_for_bob() {
    let backend = Arc::new(MemoryBackend::new());
    let alice = member(&backend, "alice").await;

    let listed = backend.list_accessible_vaults(&alice.token).await.unwrap();
    let bob = IdentityKeys::generate();
    let result = unwrap_key(
        &bob.enc_public_key(),
        bob.enc_secret_key(),
        &listed[0].wrapped_key_for_caller,
    );
    assert!(matches!(result, Err(Error::KeyMismatch(_))));
}

#[tokio::test]
async fn test_revoked_member_keeps_local_view_until_refresh() {
    let backend = Arc::new(MemoryBackend::new());
    let (alice, bob, team) = team_of_two(&backend).await;

    let before = bob.client.view().await.unwrap();
    assert_eq!(before.entries.len(), 1);
    assert_eq!(before.entries[0].item.team_id, Some(team.clone()));

    alice.client.revoke_member(&team, &bob.id).await.unwrap();

    // Already-decrypted entries stay visible.
    assert_eq!(bob.client.view().await.unwrap().entries.len(), 1);

    bob.client.refresh().await.unwrap();
    assert!(bob.client.view().await.unwrap().entries.is_empty());
    let writing = Entry::new("x", "u", "p", bob.id.clone()).with_team(team);
    assert!(matches!(
        bob.client.upsert_entry(writing).await,
        Err(Error::NotFound(_))
    ));
}

#[tokio::test]
async fn test_team_copy_wins_over_newer_personal_copy() {
    let backend = Arc::new(MemoryBackend::new());
    let (alice, bob, team) = team_of_two(&backend).await;

    let team_entry = alice.client.view().await.unwrap().entries[0].item.clone();
    let mut personal_copy = team_entry.clone();
    personal_copy.team_id = None;
    personal_copy.title = "my private edit".to_string();
    personal_copy.created_at = Utc::now() + ChronoDuration::days(1);
    personal_copy.updated_at = personal_copy.created_at;
    bob.client.upsert_entry(personal_copy).await.unwrap();
    assert!(bob.client.flush_saves().await.is_empty());

    for _ in 0..2 {
        let view = bob.client.view().await.unwrap();
        assert_eq!(view.entries.len(), 1);
        let merged = &view.entries[0];
        assert!(merged.from_team);
        assert_eq!(merged.item.title, "db");
        assert_eq!(merged.item.team_id, Some(team.clone()));
    }
}

#[tokio::test]
async fn test_member_remove_event_reaches_members_only() {
    let backend = Arc::new(MemoryBackend::new());
    let (alice, bob, team) = team_of_two(&backend).await;
    let carol = member(&backend, "carol").await;

    let mut owner_stream = backend.subscribe(&alice.token).await.unwrap();
    let mut outsider_stream = backend.subscribe(&carol.token).await.unwrap();

    alice.client.revoke_member(&team, &bob.id).await.unwrap();
    backend.broker().heartbeat();

    match owner_stream.next().await {
        Some(StreamItem::Event(event)) => {
            assert_eq!(event.kind, EventKind::TeamMemberRemove);
            assert_eq!(event.team_id, Some(team));
            assert_eq!(event.member_id, Some(bob.id));
        }
        other => panic!("owner missed the event: {:?}", other),
    }
    // The heartbeat is the first thing the outsider sees.
    assert!(matches!(
        outsider_stream.next().await,
        Some(StreamItem::Heartbeat(_))
    ));
}

#[tokio::test]
async fn test_removing_a_member_rotates_the_team_key() {
    let backend = Arc::new(MemoryBackend::new());
    let (alice, bob, team) = team_of_two(&backend).await;

    let rotated = alice.client.remove_member(&team, &bob.id).await.unwrap();
    assert_eq!(rotated.epoch, 1);

    // Alice keeps working on the new epoch.
    let entry = Entry::new("api", "svc", "t0ken", alice.id.clone()).with_team(team.clone());
    alice.client.upsert_entry(entry).await.unwrap();
    assert!(alice.client.flush_saves().await.is_empty());
    let report = alice.client.refresh().await.unwrap();
    assert!(report.is_clean());
    assert_eq!(alice.client.view().await.unwrap().entries.len(), 2);

    // A new member joins at the current epoch and reads everything.
    let carol = member(&backend, "carol").await;
    alice
        .client
        .invite_member(&team, &carol.id, TeamRole::Viewer)
        .await
        .unwrap();
    let report = carol.client.accept_invitation(&team).await.unwrap();
    assert!(report.is_clean());
    assert_eq!(carol.client.view().await.unwrap().entries.len(), 2);

    bob.client.refresh().await.unwrap();
    assert!(bob.client.view().await.unwrap().entries.is_empty());
}

#[tokio::test]
async fn test_save_under_a_retired_key_is_rejected() {
    let backend = Arc::new(MemoryBackend::new());
    let (alice, bob, team) = team_of_two(&backend).await;

    alice.client.rotate_team_key(&team).await.unwrap();

    // Bob has not refreshed and still writes with the epoch 0 key.
    let stale = Entry::new("stale", "bob", "pw", bob.id.clone()).with_team(team.clone());
    bob.client.upsert_entry(stale.clone()).await.unwrap();
    let failures = bob.client.flush_saves().await;
    assert_eq!(failures.len(), 1);
    assert!(matches!(failures[0].error, Error::Conflict(_)));

    let report = alice.client.refresh().await.unwrap();
    assert!(report.is_clean());
    let view = alice.client.view().await.unwrap();
    assert_eq!(view.entries.len(), 1);
    assert_eq!(view.entries[0].item.title, "db");

    // The failed flush reloaded bob onto the new epoch; writing again works.
    assert!(bob.client.view().await.unwrap().entry(&stale.id).is_none());
    bob.client.upsert_entry(stale.clone()).await.unwrap();
    assert!(bob.client.flush_saves().await.is_empty());
    alice.client.refresh().await.unwrap();
    assert!(alice.client.view().await.unwrap().entry(&stale.id).is_some());
}

#[tokio::test]
async fn test_invite_with_a_stale_team_key_retries_at_the_new_epoch() {
    let backend = Arc::new(MemoryBackend::new());
    let alice = member(&backend, "alice").await;
    let bob = member(&backend, "bob").await;
    let carol = member(&backend, "carol").await;
    let team = TeamId::new("ops").unwrap();

    alice.client.create_team(&team).await.unwrap();
    alice
        .client
        .invite_member(&team, &bob.id, TeamRole::Admin)
        .await
        .unwrap();
    bob.client.accept_invitation(&team).await.unwrap();
    let entry = Entry::new("db", "root", "s3cret", alice.id.clone()).with_team(team.clone());
    alice.client.upsert_entry(entry).await.unwrap();
    assert!(alice.client.flush_saves().await.is_empty());

    let rotated = alice.client.rotate_team_key(&team).await.unwrap();

    // Bob still holds the epoch 0 key when he invites carol.
    bob.client
        .invite_member(&team, &carol.id, TeamRole::Viewer)
        .await
        .unwrap();
    let report = carol.client.accept_invitation(&team).await.unwrap();
    assert!(report.is_clean());
    let view = carol.client.view().await.unwrap();
    assert_eq!(view.entries.len(), 1);
    assert_eq!(view.entries[0].item.title, "db");

    let listed = backend.list_accessible_vaults(&carol.token).await.unwrap();
    let team_vault = listed.iter().find(|v| v.team_id.as_ref() == Some(&team)).unwrap();
    assert_eq!(team_vault.key_epoch, rotated.epoch);
}

#[tokio::test]
async fn test_share_with_a_stale_key_retries_at_the_new_epoch() {
    let backend = Arc::new(MemoryBackend::new());
    let (alice, bob, team) = team_of_two(&backend).await;
    let carol = member(&backend, "carol").await;
    let team_vault = alice
        .client
        .view()
        .await
        .unwrap()
        .entries[0]
        .source
        .clone();

    // A second owner-side client rotates behind alice's back.
    let other = VaultClient::new(backend.clone(), config());
    other
        .unlock(alice.id.clone(), alice.token.clone(), "CorrectHorse1")
        .await
        .unwrap();
    other.rotate_team_key(&team).await.unwrap();

    alice
        .client
        .share_with_user(&team_vault, &carol.id, Permission::Read)
        .await
        .unwrap();
    let report = carol.client.refresh().await.unwrap();
    assert!(report.is_clean());
    assert_eq!(carol.client.view().await.unwrap().entries.len(), 1);

    bob.client.refresh().await.unwrap();
    assert_eq!(bob.client.view().await.unwrap().entries.len(), 1);
}

#[tokio::test]
async fn test_corrupt_snapshot_skips_only_that_vault() {
    let backend = Arc::new(MemoryBackend::new());
    let (alice, bob, team) = team_of_two(&backend).await;
    let own = Entry::new("bank", "bob", "pin", bob.id.clone());
    bob.client.upsert_entry(own).await.unwrap();
    assert!(bob.client.flush_saves().await.is_empty());

    let team_vault = backend
        .list_accessible_vaults(&alice.token)
        .await
        .unwrap()
        .into_iter()
        .find(|v| v.team_id.as_ref() == Some(&team))
        .unwrap()
        .id;
    // Well-formed, but sealed under a key nobody holds.
    let garbage =
        SnapshotCodec::seal_for(&team_vault, 0, &VaultKey::generate(), &Snapshot::default()).unwrap();
    backend
        .upload_blob(&alice.token, &team_vault, NewBlob::new(garbage, 0))
        .await
        .unwrap();

    let report = bob.client.refresh().await.unwrap();
    assert_eq!(report.corrupt, vec![team_vault]);
    let view = bob.client.view().await.unwrap();
    assert_eq!(view.entries.len(), 1);
    assert_eq!(view.entries[0].item.title, "bank");
}

#[tokio::test]
async fn test_read_only_share_rejects_writes() {
    let backend = Arc::new(MemoryBackend::new());
    let alice = member(&backend, "alice").await;
    let bob = member(&backend, "bob").await;

    let entry = Entry::new("wifi", "guest", "pw", alice.id.clone());
    let personal = alice.client.upsert_entry(entry.clone()).await.unwrap();
    assert!(alice.client.flush_saves().await.is_empty());
    alice
        .client
        .share_with_user(&personal, &bob.id, Permission::Read)
        .await
        .unwrap();

    bob.client.refresh().await.unwrap();
    let view = bob.client.view().await.unwrap();
    assert_eq!(view.entry(&entry.id).unwrap().source, personal);
    assert!(matches!(
        bob.client.delete_entry(&entry.id).await,
        Err(Error::NotFound(_))
    ));
}

#[tokio::test]
async fn test_live_sync_pulls_teammates_edits() {
    let backend = Arc::new(MemoryBackend::new());
    let (alice, bob, team) = team_of_two(&backend).await;

    let stream = bob.client.start_live_sync().await.unwrap();
    stream.wait_for(|s| *s == StreamState::Streaming).await;

    let entry = Entry::new("vpn", "ops", "pw", alice.id.clone()).with_team(team);
    alice.client.upsert_entry(entry.clone()).await.unwrap();
    assert!(alice.client.flush_saves().await.is_empty());

    let seen = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            if bob.client.view().await.unwrap().entry(&entry.id).is_some() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await;
    assert!(seen.is_ok(), "bob never saw alice's edit");

    stream.close();
    stream.join().await.unwrap();
}
