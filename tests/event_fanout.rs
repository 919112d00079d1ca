//! Event fan-out between skills over the shared bus.

use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use serial_test::serial;
use skillet::config::Config;
use skillet::runtime;
use skillet::skills::MethodArgs;

fn test_config(dir: &Path) -> Arc<Config> {
    Arc::new(Config {
        data_folder: dir.join("data"),
        skills_dir: dir.join("skills"),
        api_token: None,
        daemon_addr: "127.0.0.1:0".into(),
    })
}

fn write_plain_skill(skills_dir: &Path, name: &str) {
    let dir = skills_dir.join(name);
    std::fs::create_dir_all(&dir).unwrap();
    std::fs::write(
        dir.join("skill.json"),
        format!(
            r#"{{"name":"{name}","version":"0.1.0","entry_point":"{name}:main","requires_db":false}}"#
        ),
    )
    .unwrap();
}

#[test]
#[serial]
fn note_created_reaches_subscriber_exactly_once() {
    let tmp = tempfile::tempdir().unwrap();
    let config = test_config(tmp.path());
    write_plain_skill(&config.skills_dir, "issues");
    write_plain_skill(&config.skills_dir, "cache");

    let ctx = runtime::boot(config).unwrap();

    let seen = Arc::new(Mutex::new(Vec::new()));
    let other_topics = Arc::new(AtomicUsize::new(0));

    let issues = ctx.restricted_for("issues");
    let s = seen.clone();
    issues
        .subscribe(
            "note_created",
            Arc::new(move |payload| {
                s.lock().unwrap().push(payload.clone());
                Ok(())
            }),
        )
        .unwrap();

    // cache subscribes to a different topic and must observe nothing.
    let cache = ctx.restricted_for("cache");
    let o = other_topics.clone();
    cache
        .subscribe(
            "note_removed",
            Arc::new(move |_| {
                o.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }),
        )
        .unwrap();

    let added = ctx
        .invoke(
            "notes",
            "add",
            &serde_json::from_value(serde_json::json!({"args": ["fan out"]})).unwrap(),
        )
        .unwrap();
    let id = added["id"].as_i64().unwrap();

    let events = seen.lock().unwrap();
    assert_eq!(events.len(), 1, "subscriber sees the event exactly once");
    assert_eq!(events[0]["id"].as_i64().unwrap(), id);
    assert_eq!(other_topics.load(Ordering::SeqCst), 0);

    runtime::teardown();
}

#[test]
#[serial]
fn removal_event_only_fires_when_a_row_was_deleted() {
    let tmp = tempfile::tempdir().unwrap();
    let config = test_config(tmp.path());
    write_plain_skill(&config.skills_dir, "issues");

    let ctx = runtime::boot(config).unwrap();
    let removed_events = Arc::new(AtomicUsize::new(0));

    let issues = ctx.restricted_for("issues");
    let r = removed_events.clone();
    issues
        .subscribe(
            "note_removed",
            Arc::new(move |_| {
                r.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }),
        )
        .unwrap();

    let added = ctx
        .invoke(
            "notes",
            "add",
            &serde_json::from_value(serde_json::json!({"args": ["to be removed"]})).unwrap(),
        )
        .unwrap();
    let id = added["id"].as_i64().unwrap();

    let removed = ctx
        .invoke(
            "notes",
            "remove",
            &serde_json::from_value(serde_json::json!({"args": [id]})).unwrap(),
        )
        .unwrap();
    assert_eq!(removed["removed"], true);
    assert_eq!(removed_events.load(Ordering::SeqCst), 1);

    // Removing again deletes nothing and publishes nothing.
    let removed = ctx
        .invoke(
            "notes",
            "remove",
            &serde_json::from_value(serde_json::json!({"args": [id]})).unwrap(),
        )
        .unwrap();
    assert_eq!(removed["removed"], false);
    assert_eq!(removed_events.load(Ordering::SeqCst), 1);

    runtime::teardown();
}

#[test]
#[serial]
fn failing_subscriber_does_not_break_the_publisher() {
    let tmp = tempfile::tempdir().unwrap();
    let config = test_config(tmp.path());
    write_plain_skill(&config.skills_dir, "issues");
    write_plain_skill(&config.skills_dir, "cache");

    let ctx = runtime::boot(config).unwrap();

    ctx.restricted_for("issues")
        .subscribe("note_created", Arc::new(|_| anyhow::bail!("boom")))
        .unwrap();
    let healthy = Arc::new(AtomicUsize::new(0));
    let h = healthy.clone();
    ctx.restricted_for("cache")
        .subscribe(
            "note_created",
            Arc::new(move |_| {
                h.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }),
        )
        .unwrap();

    // The publish inside notes.add must succeed despite the bad handler.
    let _ = ctx
        .invoke(
            "notes",
            "add",
            &serde_json::from_value(serde_json::json!({"args": ["resilient"]})).unwrap(),
        )
        .unwrap();
    assert_eq!(healthy.load(Ordering::SeqCst), 1);

    runtime::teardown();
}

#[test]
#[serial]
fn method_args_default_is_accepted() {
    let tmp = tempfile::tempdir().unwrap();
    let config = test_config(tmp.path());
    let ctx = runtime::boot(config).unwrap();

    // list with no args falls back to the default limit.
    let listed = ctx.invoke("notes", "list", &MethodArgs::default()).unwrap();
    assert!(listed.as_array().unwrap().is_empty());

    runtime::teardown();
}
