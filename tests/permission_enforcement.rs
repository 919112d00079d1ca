//! Capability enforcement through the restricted context.

use std::path::Path;
use std::sync::Arc;

use serial_test::serial;
use skillet::config::Config;
use skillet::errors::FrameworkError;
use skillet::permissions::Capability;
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
fn default_skill_cannot_write_but_can_read() {
    let tmp = tempfile::tempdir().unwrap();
    let config = test_config(tmp.path());
    write_plain_skill(&config.skills_dir, "plain");

    let ctx = runtime::boot(config).unwrap();
    let restricted = ctx.restricted_for("plain");
    let store = restricted.store();

    // Write-class statement against the notes table is denied...
    let err = store
        .execute("INSERT INTO notes (body, tags, created_at) VALUES ('x', '[]', 'now')", &[])
        .unwrap_err();
    match err {
        FrameworkError::PermissionDenied { skill, capability } => {
            assert_eq!(skill, "plain");
            assert_eq!(capability, Capability::StoreWrite);
        }
        other => panic!("expected permission denial, got {other:?}"),
    }

    // ...with zero side effects...
    let count = store
        .query("SELECT COUNT(*) AS n FROM notes", &[])
        .unwrap();
    assert_eq!(count[0]["n"], 0);

    // ...while reads pass.
    let rows = store.query("SELECT 1 AS one", &[]).unwrap();
    assert_eq!(rows[0]["one"], 1);

    runtime::teardown();
}

#[test]
#[serial]
fn publish_needs_grant_subscribe_does_not() {
    let tmp = tempfile::tempdir().unwrap();
    let config = test_config(tmp.path());
    write_plain_skill(&config.skills_dir, "plain");

    let ctx = runtime::boot(config).unwrap();
    let restricted = ctx.restricted_for("plain");

    assert!(matches!(
        restricted
            .publish("plain_happened", &serde_json::json!({}))
            .unwrap_err(),
        FrameworkError::PermissionDenied {
            capability: Capability::EventPublish,
            ..
        }
    ));
    restricted
        .subscribe("note_created", Arc::new(|_| Ok(())))
        .unwrap();

    runtime::teardown();
}

#[test]
#[serial]
fn write_listed_skill_writes_and_publishes() {
    let tmp = tempfile::tempdir().unwrap();
    let config = test_config(tmp.path());

    let ctx = runtime::boot(config).unwrap();
    // notes is on the framework write list.
    let result = ctx
        .invoke("notes", "add", &args_json(serde_json::json!({"args": ["hello"]})))
        .unwrap();
    assert!(result["id"].as_i64().unwrap() >= 1);

    runtime::teardown();
}

#[test]
#[serial]
fn sneaky_write_behind_comment_is_still_denied() {
    let tmp = tempfile::tempdir().unwrap();
    let config = test_config(tmp.path());
    write_plain_skill(&config.skills_dir, "plain");

    let ctx = runtime::boot(config).unwrap();
    let store = ctx.restricted_for("plain").store();
    assert!(store
        .execute("/* SELECT */ DELETE FROM notes", &[])
        .is_err());
    assert!(store.execute("PRAGMA synchronous = OFF", &[]).is_err());

    runtime::teardown();
}

#[test]
#[serial]
fn callee_runs_under_its_own_grants() {
    let tmp = tempfile::tempdir().unwrap();
    let config = test_config(tmp.path());
    write_plain_skill(&config.skills_dir, "plain");

    let ctx = runtime::boot(config).unwrap();
    let restricted = ctx.restricted_for("plain");

    // plain cannot write, but it may call notes.add, which writes under
    // the notes grants.
    let result = restricted
        .call_skill(
            "notes",
            "add",
            &args_json(serde_json::json!({"args": ["via call_skill"]})),
        )
        .unwrap();
    assert!(result["id"].as_i64().is_some());

    // Unknown callee is a not-found, not a denial.
    assert!(matches!(
        restricted
            .call_skill("ghost", "anything", &MethodArgs::default())
            .unwrap_err(),
        FrameworkError::SkillNotFound(_)
    ));

    runtime::teardown();
}

fn args_json(v: serde_json::Value) -> MethodArgs {
    serde_json::from_value(v).unwrap()
}
