//! End-to-end tests for the ldbm-import binary.
//!
//! Each test imports into a fresh db directory and inspects the resulting
//! SQLite files directly.

use std::path::{Path, PathBuf};

use assert_cmd::Command;
use predicates::prelude::*;
use rusqlite::Connection;
use tempfile::{TempDir, tempdir};

const TREE: &str = "\
dn: dc=example,dc=com
objectClass: top
objectClass: domain
dc: example

dn: ou=people,dc=example,dc=com
objectClass: top
objectClass: organizationalUnit
ou: people

dn: cn=Alice,ou=people,dc=example,dc=com
objectClass: top
objectClass: person
cn: Alice
sn: Liddell

dn: cn=Bob,ou=people,dc=example,dc=com
objectClass: top
objectClass: person
cn: Bob
sn: Builder
";

fn ldbm_import() -> Command {
    #[allow(deprecated)]
    Command::cargo_bin("ldbm-import").unwrap()
}

/// Command preconfigured for a db directory, with the spinner off.
fn cmd_in(db_dir: &Path) -> Command {
    let mut cmd = ldbm_import();
    cmd.arg("--db-dir")
        .arg(db_dir)
        .arg("--no-progress")
        .arg("--no-color")
        .env_remove("LDBM_IMPORT_CONFIG")
        .env_remove("LDBM_IMPORT_LOG")
        .env_remove("RUST_LOG");
    cmd
}

fn write_ldif(dir: &TempDir, name: &str, content: &str) -> PathBuf {
    let path = dir.path().join(name);
    std::fs::write(&path, content).unwrap();
    path
}

fn instance_file(db_dir: &Path, name: &str) -> PathBuf {
    db_dir.join("userRoot").join(format!("{}.db", name))
}

fn entry_count(db_dir: &Path) -> i64 {
    let conn = Connection::open(instance_file(db_dir, "id2entry")).unwrap();
    conn.query_row("SELECT COUNT(*) FROM id2entry", [], |row| row.get(0))
        .unwrap()
}

fn ids_for(db_dir: &Path, index: &str, key: &str) -> Vec<i64> {
    let conn = Connection::open(instance_file(db_dir, index)).unwrap();
    let mut stmt = conn
        .prepare("SELECT id FROM idl WHERE key = ?1 ORDER BY id")
        .unwrap();
    stmt.query_map([key], |row| row.get(0))
        .unwrap()
        .map(|r| r.unwrap())
        .collect()
}

fn import_tree(tmp: &TempDir, db_dir: &Path) {
    let ldif = write_ldif(tmp, "tree.ldif", TREE);
    cmd_in(db_dir).arg("import").arg(&ldif).assert().success();
}

#[test]
fn test_help() {
    ldbm_import()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("import"))
        .stdout(predicate::str::contains("reindex"))
        .stdout(predicate::str::contains("upgrade-dn"));
}

#[test]
fn test_version() {
    ldbm_import()
        .arg("--version")
        .assert()
        .success()
        .stdout(predicate::str::contains("ldbm-import"));
}

#[test]
fn test_completions_bash() {
    ldbm_import()
        .args(["completions", "bash"])
        .assert()
        .success()
        .stdout(predicate::str::contains("ldbm-import"));
}

#[test]
fn test_import_requires_ldif() {
    ldbm_import().arg("import").assert().failure();
}

#[test]
fn test_import_builds_store_and_indexes() {
    let tmp = tempdir().unwrap();
    let db_dir = tmp.path().join("db");
    let ldif = write_ldif(&tmp, "tree.ldif", TREE);

    cmd_in(&db_dir)
        .arg("import")
        .arg(&ldif)
        .assert()
        .success()
        .stderr(predicate::str::contains("Import complete. Processed 4 entries"));

    assert_eq!(entry_count(&db_dir), 4);
    assert_eq!(ids_for(&db_dir, "parentid", "=1"), vec![2]);
    assert_eq!(ids_for(&db_dir, "parentid", "=2"), vec![3, 4]);
    assert_eq!(ids_for(&db_dir, "cn", "=alice"), vec![3]);
    assert_eq!(ids_for(&db_dir, "objectclass", "=person"), vec![3, 4]);

    let below_suffix = ids_for(&db_dir, "ancestorid", "=1");
    assert!(below_suffix.contains(&3) && below_suffix.contains(&4));

    // The lock is released once the job ends
    assert!(!db_dir.join("userRoot.lock").exists());
}

#[test]
fn test_online_import_builds_the_same_store() {
    let tmp = tempdir().unwrap();
    let db_dir = tmp.path().join("db");
    let ldif = write_ldif(&tmp, "tree.ldif", TREE);

    cmd_in(&db_dir)
        .args(["import", "--online"])
        .arg(&ldif)
        .assert()
        .success()
        .stderr(predicate::str::contains("Import complete. Processed 4 entries"));

    assert_eq!(entry_count(&db_dir), 4);
    assert_eq!(ids_for(&db_dir, "parentid", "=2"), vec![3, 4]);
    assert_eq!(ids_for(&db_dir, "cn", "=bob"), vec![4]);
    assert!(!db_dir.join("userRoot.lock").exists());
}

#[test]
fn test_online_import_reads_stdin() {
    let tmp = tempdir().unwrap();
    let db_dir = tmp.path().join("db");

    cmd_in(&db_dir)
        .args(["import", "--online", "-"])
        .write_stdin(TREE)
        .assert()
        .success();

    assert_eq!(entry_count(&db_dir), 4);
}

#[test]
fn test_import_skips_duplicate_dn() {
    let tmp = tempdir().unwrap();
    let db_dir = tmp.path().join("db");
    let dup = format!(
        "{}\ndn: cn=Alice,ou=people,dc=example,dc=com\nobjectClass: top\nobjectClass: person\ncn: Alice\nsn: Again\n",
        TREE
    );
    let ldif = write_ldif(&tmp, "dup.ldif", &dup);

    cmd_in(&db_dir)
        .arg("import")
        .arg(&ldif)
        .assert()
        .success()
        .stderr(predicate::str::contains(
            "Processed 4 entries (1 bad entries were skipped)",
        ));

    assert_eq!(entry_count(&db_dir), 4);
}

#[test]
fn test_import_foreign_suffix_is_reported() {
    let tmp = tempdir().unwrap();
    let db_dir = tmp.path().join("db");
    let mixed = format!(
        "{}\ndn: cn=Eve,dc=other,dc=org\nobjectClass: top\nobjectClass: person\ncn: Eve\nsn: Elsewhere\n",
        TREE
    );
    let ldif = write_ldif(&tmp, "mixed.ldif", &mixed);

    cmd_in(&db_dir)
        .arg("import")
        .arg(&ldif)
        .assert()
        .success()
        .stderr(predicate::str::contains(
            "Processed 4 entries (1 entries were skipped because they don't belong to this database)",
        ));

    assert_eq!(entry_count(&db_dir), 4);
}

#[test]
fn test_import_excluded_subtree_is_filtered_silently() {
    let tmp = tempdir().unwrap();
    let db_dir = tmp.path().join("db");
    let ldif = write_ldif(&tmp, "tree.ldif", TREE);

    cmd_in(&db_dir)
        .arg("import")
        .arg(&ldif)
        .args(["--exclude-suffix", "cn=Bob,ou=people,dc=example,dc=com"])
        .assert()
        .success()
        .stderr(predicate::str::contains("Import complete. Processed 3 entries in"));

    assert_eq!(entry_count(&db_dir), 3);
    assert!(ids_for(&db_dir, "cn", "=bob").is_empty());
}

#[test]
fn test_import_missing_file_fails() {
    let tmp = tempdir().unwrap();
    let db_dir = tmp.path().join("db");

    cmd_in(&db_dir)
        .arg("import")
        .arg(tmp.path().join("absent.ldif"))
        .assert()
        .code(1)
        .stderr(predicate::str::contains("error"));
}

#[test]
fn test_busy_instance_is_refused() {
    let tmp = tempdir().unwrap();
    let db_dir = tmp.path().join("db");
    std::fs::create_dir_all(&db_dir).unwrap();
    std::fs::write(db_dir.join("userRoot.lock"), "").unwrap();
    let ldif = write_ldif(&tmp, "tree.ldif", TREE);

    cmd_in(&db_dir)
        .arg("import")
        .arg(&ldif)
        .assert()
        .code(1)
        .stderr(predicate::str::contains("busy"));
}

#[test]
fn test_reindex_without_store_fails() {
    let tmp = tempdir().unwrap();
    let db_dir = tmp.path().join("db");

    cmd_in(&db_dir).arg("reindex").assert().code(1);
}

#[test]
fn test_reindex_rebuilds_indexes() {
    let tmp = tempdir().unwrap();
    let db_dir = tmp.path().join("db");
    import_tree(&tmp, &db_dir);

    cmd_in(&db_dir)
        .args(["reindex", "--attr", "cn"])
        .assert()
        .success()
        .stderr(predicate::str::contains("Reindexing complete"));

    assert_eq!(ids_for(&db_dir, "cn", "=bob"), vec![4]);
    assert_eq!(entry_count(&db_dir), 4);
}

#[test]
fn test_quiet_suppresses_summary() {
    let tmp = tempdir().unwrap();
    let db_dir = tmp.path().join("db");
    let ldif = write_ldif(&tmp, "tree.ldif", TREE);

    cmd_in(&db_dir)
        .arg("-q")
        .arg("import")
        .arg(&ldif)
        .assert()
        .success()
        .stderr(predicate::str::contains("Import complete").not());
}

#[test]
fn test_upgrade_dn_dry_run_reports_legacy_values() {
    let tmp = tempdir().unwrap();
    let db_dir = tmp.path().join("db");
    let legacy = format!(
        "{}\ndn: cn=staff,dc=example,dc=com\nobjectClass: top\nobjectClass: groupOfNames\ncn: staff\nmember: cn=Smith\\2C John,ou=people,dc=example,dc=com\n",
        TREE
    );
    let ldif = write_ldif(&tmp, "legacy.ldif", &legacy);
    cmd_in(&db_dir).arg("import").arg(&ldif).assert().success();

    cmd_in(&db_dir)
        .args(["upgrade-dn", "--dry-run"])
        .assert()
        .code(2)
        .stderr(predicate::str::contains("RFC 4514"));
}

#[test]
fn test_upgrade_dn_dry_run_clean_store() {
    let tmp = tempdir().unwrap();
    let db_dir = tmp.path().join("db");
    import_tree(&tmp, &db_dir);

    cmd_in(&db_dir)
        .args(["upgrade-dn", "--dry-run"])
        .assert()
        .success();
}

#[test]
fn test_config_file_changes_instance() {
    let tmp = tempdir().unwrap();
    let db_dir = tmp.path().join("db");
    let config = tmp.path().join("backend.json");
    std::fs::write(
        &config,
        r#"{ "instance": "acme", "suffixes": ["o=acme"] }"#,
    )
    .unwrap();
    let ldif = write_ldif(
        &tmp,
        "acme.ldif",
        "dn: o=acme\nobjectClass: top\nobjectClass: organization\no: acme\n",
    );

    cmd_in(&db_dir)
        .arg("--config")
        .arg(&config)
        .arg("import")
        .arg(&ldif)
        .assert()
        .success();

    assert!(db_dir.join("acme").join("id2entry.db").exists());
}

#[test]
fn test_bad_config_file_fails() {
    let tmp = tempdir().unwrap();
    let db_dir = tmp.path().join("db");
    let config = tmp.path().join("backend.json");
    std::fs::write(&config, "{ not json").unwrap();

    cmd_in(&db_dir)
        .arg("--config")
        .arg(&config)
        .arg("reindex")
        .assert()
        .code(1)
        .stderr(predicate::str::contains("failed to load configuration"));
}
