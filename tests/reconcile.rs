use std::collections::BTreeSet;
use std::sync::Arc;

use chat_relay::model::{Attachment, Message, MessagePart, Role};
use chat_relay::title::PLACEHOLDER_TITLE;
use chat_relay::{ChatError, Database, Reconciler};
use serde_json::json;
use tempfile::TempDir;

fn open(dir: &TempDir) -> Arc<Database> {
    let db = Database::open(&dir.path().join("chat.db")).unwrap();
    db.initialize().unwrap();
    Arc::new(db)
}

fn msg(id: &str, role: Role, text: &str) -> Message {
    Message::new(id, role, text)
}

fn conversation() -> Vec<Message> {
    vec![
        msg("a", Role::User, "What is a borrow checker?"),
        msg("b", Role::Assistant, "It enforces aliasing rules."),
        msg("c", Role::User, "Show an example"),
    ]
}

fn ids(messages: &[Message]) -> BTreeSet<String> {
    messages.iter().map(|m| m.id.clone()).collect()
}

#[tokio::test]
async fn second_identical_reconcile_writes_nothing() {
    let dir = TempDir::new().unwrap();
    let db = open(&dir);
    let reconciler = Reconciler::new(db.clone());

    let first = reconciler
        .reconcile("chat_1", "alice", conversation())
        .await
        .unwrap();
    assert!(first.chat_created);
    assert_eq!(first.plan.inserts.len(), 3);

    let before = db.get_chat("chat_1", "alice").unwrap().unwrap();
    let second = reconciler
        .reconcile("chat_1", "alice", conversation())
        .await
        .unwrap();
    assert_eq!(second.plan.write_count(), 0);
    assert!(!second.changed());

    let after = db.get_chat("chat_1", "alice").unwrap().unwrap();
    assert_eq!(before.updated_at, after.updated_at);
    assert_eq!(before.title, after.title);
}

#[tokio::test]
async fn persisted_ids_equal_incoming_ids() {
    let dir = TempDir::new().unwrap();
    let db = open(&dir);
    let reconciler = Reconciler::new(db.clone());

    let rounds = vec![
        conversation(),
        vec![
            msg("a", Role::User, "What is a borrow checker?"),
            msg("d", Role::Assistant, "Regenerated answer"),
        ],
        vec![msg("e", Role::User, "Start over")],
        vec![
            msg("e", Role::User, "Start over"),
            msg("f", Role::Assistant, "Sure"),
            msg("g", Role::User, "Thanks"),
        ],
    ];

    for incoming in rounds {
        reconciler
            .reconcile("chat_1", "alice", incoming.clone())
            .await
            .unwrap();
        let stored = db.load_messages("chat_1", "alice").unwrap();
        assert_eq!(ids(&stored), ids(&incoming));
    }
}

#[tokio::test]
async fn surviving_messages_match_incoming_fields() {
    let dir = TempDir::new().unwrap();
    let db = open(&dir);
    let reconciler = Reconciler::new(db.clone());
    reconciler
        .reconcile("chat_1", "alice", conversation())
        .await
        .unwrap();

    let mut edited = conversation();
    edited[1] = msg("b", Role::Assistant, "It enforces aliasing and lifetimes.").with_parts(vec![
        MessagePart::StepStart,
        MessagePart::Text {
            text: "It enforces aliasing and lifetimes.".into(),
        },
    ]);
    edited[1].annotations = vec![json!({ "aiModel": "echo" })];
    edited[2].attachments = vec![Attachment {
        name: Some("diagram.png".into()),
        content_type: Some("image/png".into()),
        url: "https://cdn.example/diagram.png".into(),
    }];

    let report = reconciler
        .reconcile("chat_1", "alice", edited.clone())
        .await
        .unwrap();
    assert_eq!(report.plan.updates.len(), 2);
    assert!(report.plan.inserts.is_empty() && report.plan.deletes.is_empty());

    let stored = db.load_messages("chat_1", "alice").unwrap();
    for (stored, expected) in stored.iter().zip(&edited) {
        assert_eq!(stored.id, expected.id);
        assert_eq!(stored.content, expected.content);
        assert_eq!(stored.parts, expected.parts);
        assert_eq!(stored.annotations, expected.annotations);
        assert_eq!(stored.attachments, expected.attachments);
    }
}

#[tokio::test]
async fn removing_a_message_deletes_exactly_it() {
    let dir = TempDir::new().unwrap();
    let db = open(&dir);
    let reconciler = Reconciler::new(db.clone());
    reconciler
        .reconcile("chat_1", "alice", conversation())
        .await
        .unwrap();

    let mut incoming = conversation();
    incoming.remove(1);
    let report = reconciler
        .reconcile("chat_1", "alice", incoming)
        .await
        .unwrap();

    assert_eq!(report.plan.deletes, vec!["b".to_string()]);
    assert!(report.plan.updates.is_empty());
    let stored = db.load_messages("chat_1", "alice").unwrap();
    assert_eq!(stored.len(), 2);
    assert_eq!(stored[0].canonical_text(), "What is a borrow checker?");
    assert_eq!(stored[1].canonical_text(), "Show an example");
}

#[tokio::test]
async fn title_follows_first_user_message() {
    let dir = TempDir::new().unwrap();
    let db = open(&dir);
    let reconciler = Reconciler::new(db.clone());

    reconciler
        .reconcile(
            "chat_1",
            "alice",
            vec![
                msg("s", Role::Assistant, "Welcome!"),
                msg("u", Role::User, "Hello world, this is a long message"),
            ],
        )
        .await
        .unwrap();
    let chat = db.get_chat("chat_1", "alice").unwrap().unwrap();
    assert_eq!(chat.title, "Hello world, this is a long me...");

    reconciler
        .reconcile("chat_2", "alice", vec![msg("s2", Role::Assistant, "Hi")])
        .await
        .unwrap();
    let chat = db.get_chat("chat_2", "alice").unwrap().unwrap();
    assert_eq!(chat.title, PLACEHOLDER_TITLE);
}

#[tokio::test]
async fn other_users_chats_are_untouchable() {
    let dir = TempDir::new().unwrap();
    let db = open(&dir);
    let reconciler = Reconciler::new(db.clone());
    reconciler
        .reconcile("chat_1", "alice", conversation())
        .await
        .unwrap();

    let err = reconciler
        .reconcile("chat_1", "mallory", vec![msg("x", Role::User, "overwrite")])
        .await
        .unwrap_err();
    assert!(matches!(err, ChatError::NotFound(_)));

    assert!(db.load_messages("chat_1", "mallory").unwrap().is_empty());
    assert!(db.get_chat("chat_1", "mallory").unwrap().is_none());
    assert_eq!(db.load_messages("chat_1", "alice").unwrap().len(), 3);
}

#[tokio::test]
async fn state_survives_reopening_the_database() {
    let dir = TempDir::new().unwrap();
    {
        let db = open(&dir);
        Reconciler::new(db)
            .reconcile("chat_1", "alice", conversation())
            .await
            .unwrap();
    }

    let db = open(&dir);
    let report = Reconciler::new(db)
        .reconcile("chat_1", "alice", conversation())
        .await
        .unwrap();
    assert_eq!(report.plan.write_count(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_reconciles_leave_one_complete_list() {
    let dir = TempDir::new().unwrap();
    let db = open(&dir);
    let reconciler = Reconciler::new(db.clone());
    reconciler
        .reconcile("chat_1", "alice", conversation())
        .await
        .unwrap();

    let left = vec![
        msg("a", Role::User, "What is a borrow checker?"),
        msg("l", Role::Assistant, "left answer"),
    ];
    let right = vec![
        msg("a", Role::User, "What is a borrow checker?"),
        msg("r1", Role::Assistant, "right answer"),
        msg("r2", Role::User, "and more"),
    ];

    let (l, r) = tokio::join!(
        reconciler.reconcile("chat_1", "alice", left.clone()),
        reconciler.reconcile("chat_1", "alice", right.clone()),
    );
    l.unwrap();
    r.unwrap();

    let stored = ids(&db.load_messages("chat_1", "alice").unwrap());
    assert!(stored == ids(&left) || stored == ids(&right));
}

#[tokio::test]
async fn failed_reconcile_rolls_back() {
    let dir = TempDir::new().unwrap();
    let db = open(&dir);
    let reconciler = Reconciler::new(db.clone());
    reconciler
        .reconcile("chat_bob", "bob", vec![msg("taken", Role::User, "bob's message")])
        .await
        .unwrap();
    reconciler
        .reconcile("chat_1", "alice", conversation())
        .await
        .unwrap();

    // The deletes apply first; the insert then collides with bob's message id.
    let incoming = vec![
        msg("a", Role::User, "What is a borrow checker?"),
        msg("taken", Role::Assistant, "collides"),
    ];
    let err = reconciler
        .reconcile("chat_1", "alice", incoming)
        .await
        .unwrap_err();
    assert!(matches!(err, ChatError::Store(_)));

    let stored = db.load_messages("chat_1", "alice").unwrap();
    assert_eq!(ids(&stored), ids(&conversation()));
}

#[tokio::test]
async fn an_id_cannot_change_role() {
    let dir = TempDir::new().unwrap();
    let db = open(&dir);
    let reconciler = Reconciler::new(db.clone());

    reconciler
        .reconcile(
            "chat_1",
            "alice",
            vec![msg("u1", Role::User, "question"), msg("a1", Role::Assistant, "model answer")],
        )
        .await
        .unwrap();

    let err = reconciler
        .reconcile(
            "chat_1",
            "alice",
            vec![msg("u1", Role::User, "question"), msg("a1", Role::User, "forged by client")],
        )
        .await
        .unwrap_err();
    assert!(matches!(err, ChatError::Validation(_)));

    let stored = db.load_messages("chat_1", "alice").unwrap();
    assert_eq!(stored[1].role, Role::Assistant);
    assert_eq!(stored[1].canonical_text(), "model answer");
}
