//! Migration checksum guard across real reboots.

use std::path::Path;
use std::sync::Arc;

use serial_test::serial;
use skillet::config::Config;
use skillet::errors::FrameworkError;
use skillet::runtime;
use skillet::store::migrate;

fn test_config(dir: &Path) -> Arc<Config> {
    Arc::new(Config {
        data_folder: dir.join("data"),
        skills_dir: dir.join("skills"),
        api_token: None,
        daemon_addr: "127.0.0.1:0".into(),
    })
}

fn write_skill_with_migration(skills_dir: &Path, name: &str, sql: &str) -> std::path::PathBuf {
    let dir = skills_dir.join(name);
    std::fs::create_dir_all(dir.join("migrations")).unwrap();
    std::fs::write(
        dir.join("skill.json"),
        format!(
            r#"{{"name":"{name}","version":"1.0.0","migrations_dir":"migrations","entry_point":"{name}:main"}}"#
        ),
    )
    .unwrap();
    let path = dir.join("migrations").join("1_init.sql");
    std::fs::write(&path, sql).unwrap();
    path
}

#[test]
#[serial]
fn editing_an_applied_migration_fails_the_next_boot() {
    let tmp = tempfile::tempdir().unwrap();
    let config = test_config(tmp.path());
    let migration = write_skill_with_migration(
        &config.skills_dir,
        "ledgered",
        "CREATE TABLE IF NOT EXISTS ledgered (id INTEGER PRIMARY KEY);",
    );

    runtime::boot(config.clone()).unwrap();
    runtime::teardown();

    // Corrupt the applied file.
    std::fs::write(
        &migration,
        "CREATE TABLE IF NOT EXISTS ledgered (id INTEGER PRIMARY KEY, sneaky TEXT);",
    )
    .unwrap();

    let err = runtime::boot(config).unwrap_err();
    match &err {
        FrameworkError::MigrationChecksumMismatch { skill, version, .. } => {
            assert_eq!(skill, "ledgered");
            assert_eq!(*version, 1);
        }
        other => panic!("expected checksum mismatch, got {other:?}"),
    }
    assert_eq!(err.exit_code(), 4);
    runtime::teardown();
}

#[test]
#[serial]
fn new_migrations_apply_on_reboot_without_touching_old_rows() {
    let tmp = tempfile::tempdir().unwrap();
    let config = test_config(tmp.path());
    write_skill_with_migration(
        &config.skills_dir,
        "grower",
        "CREATE TABLE IF NOT EXISTS grower (id INTEGER PRIMARY KEY);",
    );

    let ctx = runtime::boot(config.clone()).unwrap();
    let first = migrate::applied_for(&ctx.engine, "grower").unwrap();
    assert_eq!(first.len(), 1);
    runtime::teardown();

    // Ship a second migration.
    std::fs::write(
        config
            .skills_dir
            .join("grower")
            .join("migrations")
            .join("2_add-column.sql"),
        "ALTER TABLE grower ADD COLUMN label TEXT;",
    )
    .unwrap();

    let ctx = runtime::boot(config).unwrap();
    let rows = migrate::applied_for(&ctx.engine, "grower").unwrap();
    assert_eq!(rows.len(), 2);
    assert_eq!(rows[0].sha256, first[0].sha256, "old row untouched");
    assert_eq!(rows[1].version, 2);

    // The new column exists.
    ctx.engine
        .query_json("SELECT label FROM grower LIMIT 0", &[])
        .unwrap();
    runtime::teardown();
}

#[test]
#[serial]
fn failed_migration_aborts_boot_and_applies_nothing() {
    let tmp = tempfile::tempdir().unwrap();
    let config = test_config(tmp.path());
    write_skill_with_migration(&config.skills_dir, "broken", "THIS IS NOT SQL;");

    let err = runtime::boot(config.clone()).unwrap_err();
    assert!(matches!(
        err,
        FrameworkError::MigrationApplyFailed { .. }
    ));
    assert_eq!(err.exit_code(), 4);
    runtime::teardown();

    // Fixing the file lets the next boot succeed: nothing was recorded.
    std::fs::write(
        config
            .skills_dir
            .join("broken")
            .join("migrations")
            .join("1_init.sql"),
        "CREATE TABLE IF NOT EXISTS broken (id INTEGER PRIMARY KEY);",
    )
    .unwrap();
    let ctx = runtime::boot(config).unwrap();
    assert_eq!(migrate::applied_for(&ctx.engine, "broken").unwrap().len(), 1);
    runtime::teardown();
}
