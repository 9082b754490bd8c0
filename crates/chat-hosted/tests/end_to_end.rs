//! Two sync runtimes talking through the hosted adapter over in-memory
//! tables, plus live-backend checks that run only with `--ignored`.

use std::{sync::Arc, time::Duration};

use chat_core::{
    ConversationPhase, ConversationView, DeliveryStatus, EngineConfig, EventStream, MediaUpload,
    RemotePort, RetryPolicy, SessionContext, SyncCommand, SyncEvent, SyncRuntimeHandle,
    spawn_runtime,
};
use chat_hosted::{
    AccessToken, Accounts, HostedBackend, HostedClient, HostedConfig, MemoryAuthApi,
    MemoryTables, Registration, SessionManager,
};
use chat_platform::{InMemoryCredentialStore, ScopedCredentialStore};
use tokio::time::timeout;

struct World {
    tables: Arc<MemoryTables>,
    backend: Arc<HostedBackend<MemoryTables, MemoryTables>>,
    alice: String,
    bob: String,
    chat_id: String,
}

fn avatar() -> MediaUpload {
    MediaUpload {
        file_name: "avatar.png".into(),
        content_type: "image/png".into(),
        bytes: vec![0x89, 0x50, 0x4e, 0x47],
    }
}

async fn world() -> World {
    let tables = Arc::new(MemoryTables::default());
    let sessions = Arc::new(SessionManager::new(
        Arc::new(MemoryAuthApi::new()),
        ScopedCredentialStore::new(InMemoryCredentialStore::default(), "chat-e2e"),
        AccessToken::default(),
    ));
    let accounts = Accounts::new(tables.clone(), sessions, "avatars");

    let mut ids = Vec::new();
    for name in ["alice", "bob"] {
        let row = accounts
            .register(&Registration {
                username: name.to_owned(),
                email: format!("{name}@example.org"),
                password: "secret-pass".to_owned(),
                avatar: Some(avatar()),
            })
            .await
            .expect("register");
        ids.push(row.id);
    }
    let (alice, bob) = (ids[0].clone(), ids[1].clone());
    let chat_id = accounts
        .start_conversation(&alice, &bob)
        .await
        .expect("start conversation");

    World {
        backend: Arc::new(HostedBackend::new(tables.clone(), tables.clone(), "avatars")),
        tables,
        alice,
        bob,
        chat_id,
    }
}

fn fast_config() -> EngineConfig {
    EngineConfig {
        retry_policy: RetryPolicy::new(Duration::from_millis(1), Duration::from_millis(5)),
        ..EngineConfig::default()
    }
}

fn start(world: &World, user: &str) -> (SyncRuntimeHandle, EventStream) {
    let port: Arc<dyn RemotePort> = world.backend.clone();
    let handle = spawn_runtime(port, SessionContext::new(user), fast_config());
    let events = handle.subscribe();
    (handle, events)
}

async fn wait_for<T>(events: &mut EventStream, mut pick: impl FnMut(SyncEvent) -> Option<T>) -> T {
    timeout(Duration::from_secs(3), async {
        loop {
            let event = events.next().await.expect("event stream open");
            if let Some(found) = pick(event) {
                return found;
            }
        }
    })
    .await
    .expect("expected event in time")
}

async fn open(handle: &SyncRuntimeHandle, events: &mut EventStream, chat_id: &str) -> ConversationView {
    handle
        .send(SyncCommand::OpenConversation {
            conversation_id: chat_id.to_owned(),
        })
        .await
        .expect("open enqueued");
    wait_for(events, |event| match event {
        SyncEvent::ConversationUpdated(view) if view.phase == ConversationPhase::Live => Some(view),
        _ => None,
    })
    .await
}

async fn say(handle: &SyncRuntimeHandle, text: &str) {
    handle
        .send(SyncCommand::SendMessage {
            text: text.to_owned(),
            image: None,
        })
        .await
        .expect("send enqueued");
}

#[tokio::test]
async fn message_reaches_peer_view_and_list() {
    let world = world().await;
    let (alice, mut alice_events) = start(&world, &world.alice);
    let (bob, mut bob_events) = start(&world, &world.bob);

    let view = open(&alice, &mut alice_events, &world.chat_id).await;
    assert_eq!(view.peer.map(|peer| peer.username).as_deref(), Some("bob"));
    open(&bob, &mut bob_events, &world.chat_id).await;

    say(&alice, "hello bob").await;
    let ack = wait_for(&mut alice_events, |event| match event {
        SyncEvent::SendAck(ack) => Some(ack),
        _ => None,
    })
    .await;
    assert!(ack.delivered);

    let received = wait_for(&mut bob_events, |event| match event {
        SyncEvent::ConversationUpdated(view) if !view.messages.is_empty() => Some(view),
        _ => None,
    })
    .await;
    assert_eq!(received.messages[0].text, "hello bob");
    assert!(!received.messages[0].is_own);
    assert_eq!(received.messages[0].status, DeliveryStatus::Confirmed);

    let rows = wait_for(&mut bob_events, |event| match event {
        SyncEvent::ListUpdated { rows } if rows.iter().any(|row| row.last_message_text == "hello bob") => {
            Some(rows)
        }
        _ => None,
    })
    .await;
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].peer.username, "alice");

    alice.send(SyncCommand::Teardown).await.expect("teardown");
    bob.send(SyncCommand::Teardown).await.expect("teardown");
}

#[tokio::test]
async fn concurrent_sends_converge_in_both_copies() {
    let world = world().await;
    let (alice, mut alice_events) = start(&world, &world.alice);
    let (bob, mut bob_events) = start(&world, &world.bob);
    open(&alice, &mut alice_events, &world.chat_id).await;
    open(&bob, &mut bob_events, &world.chat_id).await;

    world.tables.inject_conflicts(1);
    say(&alice, "from alice").await;
    say(&bob, "from bob").await;

    for events in [&mut alice_events, &mut bob_events] {
        wait_for(events, |event| match event {
            SyncEvent::ConversationUpdated(view)
                if view.messages.len() == 2
                    && view
                        .messages
                        .iter()
                        .all(|message| message.status == DeliveryStatus::Confirmed) =>
            {
                Some(())
            }
            _ => None,
        })
        .await;
    }

    let own = world
        .backend
        .fetch_conversation(&world.chat_id, &world.alice)
        .await
        .expect("alice copy");
    let peer = world
        .backend
        .fetch_conversation(&world.chat_id, &world.bob)
        .await
        .expect("bob copy");
    let mut own_texts: Vec<_> = own.messages.iter().map(|m| m.text.clone()).collect();
    let mut peer_texts: Vec<_> = peer.messages.iter().map(|m| m.text.clone()).collect();
    own_texts.sort();
    peer_texts.sort();
    assert_eq!(own_texts, vec!["from alice", "from bob"]);
    assert_eq!(own_texts, peer_texts);
}

#[tokio::test]
async fn blocking_disables_sending_for_both_sides() {
    let world = world().await;
    let (alice, mut alice_events) = start(&world, &world.alice);
    let (bob, mut bob_events) = start(&world, &world.bob);
    open(&alice, &mut alice_events, &world.chat_id).await;

    alice
        .send(SyncCommand::SetBlocked { blocked: true })
        .await
        .expect("block enqueued");
    wait_for(&mut alice_events, |event| match event {
        SyncEvent::ConversationUpdated(view) if view.block.peer_blocked => Some(()),
        _ => None,
    })
    .await;

    let view = open(&bob, &mut bob_events, &world.chat_id).await;
    assert!(view.block.viewer_blocked);
    assert!(!view.can_send);
    assert_eq!(view.peer.map(|peer| peer.username).as_deref(), Some("User"));

    say(&bob, "are you there?").await;
    let err = wait_for(&mut bob_events, |event| match event {
        SyncEvent::Error(err) => Some(err),
        _ => None,
    })
    .await;
    assert_eq!(err.code, "blocked");
    let copy = world
        .backend
        .fetch_conversation(&world.chat_id, &world.alice)
        .await
        .expect("alice copy");
    assert!(copy.messages.is_empty());
}

fn live_config() -> Option<HostedConfig> {
    HostedConfig::from_env().ok()
}

#[tokio::test]
#[ignore = "requires CHAT_BACKEND_URL, CHAT_BACKEND_ANON_KEY, CHAT_TEST_EMAIL and CHAT_TEST_PASSWORD"]
async fn live_sign_in_and_list() {
    let Some(config) = live_config() else {
        return;
    };
    let (Ok(email), Ok(password)) = (
        std::env::var("CHAT_TEST_EMAIL"),
        std::env::var("CHAT_TEST_PASSWORD"),
    ) else {
        return;
    };

    let client = HostedClient::new(
        config,
        ScopedCredentialStore::new(InMemoryCredentialStore::default(), "chat-live"),
    )
    .expect("client");
    let session = client
        .sessions
        .sign_in_with_password(&email, &password)
        .await
        .expect("sign in");
    client
        .backend
        .fetch_conversation_list(&session.user_id)
        .await
        .expect("conversation list");
    client.sessions.sign_out().await.expect("sign out");
}
