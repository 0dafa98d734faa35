use super::*;
use chrono::{Duration, TimeZone};

fn message(id: &str, channel: &str, sender: &str, at: DateTime<Utc>) -> Message {
    Message {
        id: MessageId::from(id),
        channel_id: ChannelId::from(channel),
        sender: Sender {
            id: UserId::from(sender),
            name: Some(sender.to_string()),
        },
        text: Some(format!("hello from {sender}")),
        image_url: None,
        created_at: at,
    }
}

fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap()
}

async fn storage() -> Storage {
    Storage::new("sqlite::memory:").await.expect("db")
}

#[tokio::test]
async fn insert_is_idempotent_by_id() {
    let storage = storage().await;
    let msg = message("m1", "c1", "alice", t0());

    assert!(storage.insert_message(&msg).await.expect("first insert"));
    assert!(!storage.insert_message(&msg).await.expect("second insert"));

    let all = storage
        .messages_after(&ChannelId::from("c1"), t0() - Duration::days(1))
        .await
        .expect("delta");
    assert_eq!(all.len(), 1);
}

#[tokio::test]
async fn delta_query_is_strictly_greater_and_ascending() {
    let storage = storage().await;
    for i in 0..5 {
        let msg = message(
            &format!("m{i}"),
            "c1",
            "alice",
            t0() + Duration::seconds(i),
        );
        storage.insert_message(&msg).await.expect("insert");
    }

    let delta = storage
        .messages_after(&ChannelId::from("c1"), t0() + Duration::seconds(1))
        .await
        .expect("delta");

    let ids: Vec<&str> = delta.iter().map(|m| m.id.as_str()).collect();
    assert_eq!(ids, vec!["m2", "m3", "m4"]);
    assert!(delta.windows(2).all(|w| w[0].created_at <= w[1].created_at));
}

#[tokio::test]
async fn delta_query_is_scoped_to_channel() {
    let storage = storage().await;
    storage
        .insert_message(&message("m1", "c1", "alice", t0()))
        .await
        .expect("insert");
    storage
        .insert_message(&message("m2", "c2", "alice", t0()))
        .await
        .expect("insert");

    let delta = storage
        .messages_after(&ChannelId::from("c2"), t0() - Duration::days(1))
        .await
        .expect("delta");
    assert_eq!(delta.len(), 1);
    assert_eq!(delta[0].id.as_str(), "m2");
}

#[tokio::test]
async fn notification_targets_exclude_sender_and_muted() {
    let storage = storage().await;
    let channel = ChannelId::from("c1");
    let alice = UserId::from("alice");
    let bob = UserId::from("bob");
    let carol = UserId::from("carol");

    for user in [&alice, &bob, &carol] {
        storage.subscribe(user, &channel).await.expect("subscribe");
    }
    storage
        .register_push_endpoint(&alice, "tok-alice")
        .await
        .expect("endpoint");
    storage
        .register_push_endpoint(&bob, "tok-bob-1")
        .await
        .expect("endpoint");
    storage
        .register_push_endpoint(&bob, "tok-bob-2")
        .await
        .expect("endpoint");
    storage
        .register_push_endpoint(&carol, "tok-carol")
        .await
        .expect("endpoint");
    storage
        .set_muted(&carol, &channel, true)
        .await
        .expect("mute");

    let targets = storage
        .notification_targets(&channel, &alice)
        .await
        .expect("targets");

    let tokens: Vec<&str> = targets.iter().map(|t| t.token.as_str()).collect();
    assert_eq!(tokens, vec!["tok-bob-1", "tok-bob-2"]);
}

#[tokio::test]
async fn unmute_restores_notification_targets() {
    let storage = storage().await;
    let channel = ChannelId::from("c1");
    let bob = UserId::from("bob");

    storage.subscribe(&bob, &channel).await.expect("subscribe");
    storage
        .register_push_endpoint(&bob, "tok-bob")
        .await
        .expect("endpoint");
    storage.set_muted(&bob, &channel, true).await.expect("mute");
    assert!(storage.is_muted(&bob, &channel).await.expect("is_muted"));

    storage
        .set_muted(&bob, &channel, false)
        .await
        .expect("unmute");

    let targets = storage
        .notification_targets(&channel, &UserId::from("alice"))
        .await
        .expect("targets");
    assert_eq!(targets.len(), 1);
    assert_eq!(targets[0].user_id, bob);
}

#[tokio::test]
async fn unregister_push_endpoint_removes_only_that_token() {
    let storage = storage().await;
    let channel = ChannelId::from("c1");
    let bob = UserId::from("bob");

    storage.subscribe(&bob, &channel).await.expect("subscribe");
    storage
        .register_push_endpoint(&bob, "tok-phone")
        .await
        .expect("endpoint");
    storage
        .register_push_endpoint(&bob, "tok-tablet")
        .await
        .expect("endpoint");

    assert!(storage
        .unregister_push_endpoint(&bob, "tok-phone")
        .await
        .expect("unregister"));

    let targets = storage
        .notification_targets(&channel, &UserId::from("alice"))
        .await
        .expect("targets");
    assert_eq!(targets.len(), 1);
    assert_eq!(targets[0].token, "tok-tablet");
}

#[test]
fn normalizes_plain_file_path_to_sqlite_url() {
    assert_eq!(
        normalize_database_url("./data/test.db"),
        "sqlite://./data/test.db"
    );
    assert_eq!(
        normalize_database_url("sqlite:data/test.db"),
        "sqlite://data/test.db"
    );
}

#[test]
fn leaves_memory_and_full_urls_alone() {
    assert_eq!(normalize_database_url("sqlite::memory:"), "sqlite::memory:");
    assert_eq!(
        normalize_database_url("sqlite:///var/db/app.db"),
        "sqlite:///var/db/app.db"
    );
}

#[tokio::test]
async fn opens_a_plain_file_path_and_creates_parent_dirs() {
    let dir = std::env::temp_dir().join(format!("storage-test-{}", std::process::id()));
    let db_path = dir.join("nested/server.db");
    let storage = Storage::new(db_path.to_str().expect("utf8 path"))
        .await
        .expect("open via plain path");
    storage.health_check().await.expect("ping");
    drop(storage);
    std::fs::remove_dir_all(&dir).expect("cleanup");
}

#[tokio::test]
async fn upsert_channel_creates_then_renames() {
    let storage = storage().await;
    let channel = ChannelId::from("c1");

    storage
        .upsert_channel(&channel, "general")
        .await
        .expect("create");
    storage
        .upsert_channel(&channel, "general-chat")
        .await
        .expect("rename");

    let summary = storage.channel(&channel).await.expect("get").expect("some");
    assert_eq!(summary.description, "general-chat");
}
