/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

//! Multi-site replication tests: each `CrrDb` plays one site, changes are
//! pulled from one feed and merged into another, and the sites must
//! converge.

use crsqlite::{
    apply_changes, as_crr, begin_alter, changes_since, commit_alter, unpack_pk, ChangeRecord,
    CrrDb, Error,
};
use rusqlite::types::Value;

fn new_site() -> CrrDb {
    let _ = env_logger::try_init();
    CrrDb::open_in_memory().expect("should open a memory db")
}

fn new_site_with(schema: &str) -> CrrDb {
    let db = new_site();
    db.conn().execute_batch(schema).expect("schema should apply");
    db
}

/// Pull every change `to` has not seen from `from`'s feed and merge it.
fn pull(from: &CrrDb, to: &CrrDb, since: i64) -> i64 {
    let changes = changes_since(from, since, &[to.site_id()]).expect("should read changes");
    apply_changes(to, from.site_id(), &changes).expect("should merge changes")
}

/// Full contents of a table, ordered, for convergence comparisons.
fn snapshot(db: &CrrDb, table: &str) -> Vec<Vec<Value>> {
    let mut stmt = db
        .conn()
        .prepare(&format!("SELECT * FROM \"{}\" ORDER BY 1", table))
        .unwrap();
    let n = stmt.column_count();
    let rows = stmt
        .query_map([], |row| {
            (0..n).map(|i| row.get::<_, Value>(i)).collect::<Result<Vec<_>, _>>()
        })
        .unwrap();
    rows.map(|r| r.unwrap()).collect()
}

fn count(db: &CrrDb, sql: &str) -> i64 {
    db.conn().query_row(sql, [], |r| r.get(0)).unwrap()
}

#[test]
fn test_composite_pk_round_trip() {
    // S1: one insert into a composite-pk table yields exactly one change
    // record with the expected metadata.
    let a = new_site_with("CREATE TABLE foo (a, b, c, PRIMARY KEY (a, b))");
    as_crr(&a, "foo").unwrap();
    a.conn().execute("INSERT INTO foo VALUES (4, 5, 6)", []).unwrap();

    let changes = changes_since(&a, 0, &[]).unwrap();
    assert_eq!(changes.len(), 1);
    let change = &changes[0];
    assert_eq!(change.table, "foo");
    assert_eq!(
        unpack_pk(&change.pk).unwrap(),
        vec![Value::Integer(4), Value::Integer(5)]
    );
    assert_eq!(change.cid, "c");
    assert_eq!(change.val, Value::Integer(6));
    assert_eq!(change.col_version, 1);
    assert_eq!(change.db_version, 1);
    assert_eq!(change.site_id, None);
    assert_eq!(change.cl, 1);
    assert_eq!(change.seq, 0);
}

#[test]
fn test_lamport_advance_on_merge() {
    // S2: a site that merges up to version N writes its next change above N.
    const SCHEMA: &str = "CREATE TABLE foo (a PRIMARY KEY, b, c)";
    let a = new_site_with(SCHEMA);
    let b = new_site_with(SCHEMA);
    as_crr(&a, "foo").unwrap();
    as_crr(&b, "foo").unwrap();

    a.conn().execute("INSERT INTO foo VALUES (1, 1, 1)", []).unwrap();
    for v in 2..=4 {
        a.conn()
            .execute("UPDATE foo SET b = ? WHERE a = 1", rusqlite::params![v])
            .unwrap();
    }
    assert_eq!(a.db_version().unwrap(), 4);

    pull(&a, &b, 0);
    assert_eq!(b.db_version().unwrap(), 4);

    b.conn()
        .execute("UPDATE foo SET c = 33 WHERE a = 1", [])
        .unwrap();
    assert!(b.db_version().unwrap() >= 5);

    pull(&b, &a, 0);
    let c: i64 = a
        .conn()
        .query_row("SELECT c FROM foo WHERE a = 1", [], |r| r.get(0))
        .unwrap();
    assert_eq!(c, 33);
}

#[test]
fn test_identical_histories_merge_as_noop() {
    // S3: two sites that made byte-identical histories; merging one into
    // the other must not move the target's db_version.
    const SCHEMA: &str = "CREATE TABLE foo (a PRIMARY KEY, b)";
    let a = new_site_with(SCHEMA);
    let b = new_site_with(SCHEMA);
    as_crr(&a, "foo").unwrap();
    as_crr(&b, "foo").unwrap();

    for db in [&a, &b] {
        db.conn().execute("INSERT INTO foo VALUES (1, 'one')", []).unwrap();
        db.conn()
            .execute("UPDATE foo SET b = 'two' WHERE a = 1", [])
            .unwrap();
        db.conn().execute("INSERT INTO foo VALUES (2, 'x')", []).unwrap();
        db.conn()
            .execute("UPDATE foo SET b = 'y' WHERE a = 2", [])
            .unwrap();
    }
    assert_eq!(a.db_version().unwrap(), 4);
    assert_eq!(b.db_version().unwrap(), 4);

    pull(&a, &b, 0);
    assert_eq!(b.db_version().unwrap(), 4);
    assert_eq!(snapshot(&a, "foo"), snapshot(&b, "foo"));
}

#[test]
fn test_schema_change_retention() {
    // S4: after dropping one column and adding another, the feed carries
    // the new column for the existing row and nothing for the old one.
    let a = new_site_with("CREATE TABLE foo (a PRIMARY KEY, b)");
    as_crr(&a, "foo").unwrap();
    a.conn().execute("INSERT INTO foo VALUES (1, 2)", []).unwrap();

    begin_alter(&a, "foo").unwrap();
    a.conn()
        .execute_batch(
            "ALTER TABLE foo DROP COLUMN b;
             ALTER TABLE foo ADD COLUMN c;",
        )
        .unwrap();
    commit_alter(&a, "foo").unwrap();

    let changes = changes_since(&a, 0, &[]).unwrap();
    assert_eq!(changes.len(), 1);
    assert_eq!(changes[0].cid, "c");
    assert_eq!(changes[0].val, Value::Null);
    assert_eq!(unpack_pk(&changes[0].pk).unwrap(), vec![Value::Integer(1)]);
}

#[test]
fn test_concurrent_writes_resolved_by_site_id() {
    // S5: same cell, identical versions, different values; the site whose
    // id compares greater wins everywhere.
    const SCHEMA: &str = "CREATE TABLE foo (a PRIMARY KEY, v)";
    let x = new_site_with(SCHEMA);
    let y = new_site_with(SCHEMA);
    as_crr(&x, "foo").unwrap();
    as_crr(&y, "foo").unwrap();

    x.conn()
        .execute("INSERT INTO foo VALUES (1, 'from-x')", [])
        .unwrap();
    y.conn()
        .execute("INSERT INTO foo VALUES (1, 'from-y')", [])
        .unwrap();

    pull(&x, &y, 0);
    pull(&y, &x, 0);

    let expected = if x.site_id() > y.site_id() {
        "from-x"
    } else {
        "from-y"
    };
    for db in [&x, &y] {
        let v: String = db
            .conn()
            .query_row("SELECT v FROM foo WHERE a = 1", [], |r| r.get(0))
            .unwrap();
        assert_eq!(v, expected);
    }
}

#[test]
fn test_local_changes_filter() {
    // S6: locally authored changes have NULL site_id in the feed.
    let a = new_site_with("CREATE TABLE foo (a PRIMARY KEY, b)");
    as_crr(&a, "foo").unwrap();
    a.conn().execute("INSERT INTO foo VALUES (1, 'x')", []).unwrap();
    a.conn().execute("INSERT INTO foo VALUES (2, 'y')", []).unwrap();

    assert_eq!(
        count(&a, "SELECT count(*) FROM crsql_changes WHERE site_id IS NULL"),
        2
    );
    assert_eq!(
        count(&a, "SELECT count(*) FROM crsql_changes WHERE site_id IS NOT NULL"),
        0
    );
}

#[test]
fn test_replay_into_fresh_site_converges() {
    // A mixed local history replayed into a fresh site reproduces the
    // exact row set and column values.
    const SCHEMA: &str = "
        CREATE TABLE item (id PRIMARY KEY, name, qty);
        CREATE TABLE tag (name PRIMARY KEY);
    ";
    let a = new_site_with(SCHEMA);
    as_crr(&a, "item").unwrap();
    as_crr(&a, "tag").unwrap();

    a.conn()
        .execute_batch(
            "INSERT INTO item VALUES (1, 'bolt', 10);
             INSERT INTO item VALUES (2, 'nut', 20);
             UPDATE item SET qty = 11 WHERE id = 1;
             DELETE FROM item WHERE id = 2;
             INSERT INTO item VALUES (3, 'washer', NULL);
             INSERT INTO tag VALUES ('blue');
             INSERT INTO tag VALUES ('steel');
             DELETE FROM tag WHERE name = 'blue';",
        )
        .unwrap();

    let b = new_site_with(SCHEMA);
    as_crr(&b, "item").unwrap();
    as_crr(&b, "tag").unwrap();
    pull(&a, &b, 0);

    assert_eq!(snapshot(&a, "item"), snapshot(&b, "item"));
    assert_eq!(snapshot(&a, "tag"), snapshot(&b, "tag"));
    assert_eq!(snapshot(&b, "tag"), vec![vec![Value::Text("steel".into())]]);
}

#[test]
fn test_merge_is_idempotent() {
    const SCHEMA: &str = "CREATE TABLE foo (a PRIMARY KEY, b)";
    let a = new_site_with(SCHEMA);
    let b = new_site_with(SCHEMA);
    as_crr(&a, "foo").unwrap();
    as_crr(&b, "foo").unwrap();

    a.conn().execute("INSERT INTO foo VALUES (1, 'x')", []).unwrap();
    a.conn().execute("DELETE FROM foo WHERE a = 1", []).unwrap();
    a.conn().execute("INSERT INTO foo VALUES (1, 'y')", []).unwrap();

    let changes = changes_since(&a, 0, &[]).unwrap();
    apply_changes(&b, a.site_id(), &changes).unwrap();
    let rows_after_once = snapshot(&b, "foo");
    let clock_after_once: Vec<(String, i64, i64)> = {
        let mut stmt = b
            .conn()
            .prepare(
                "SELECT __crsql_col_name, __crsql_col_version, __crsql_db_version
                 FROM foo__crsql_clock ORDER BY __crsql_col_name",
            )
            .unwrap();
        let rows = stmt
            .query_map([], |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)))
            .unwrap();
        rows.map(|r| r.unwrap()).collect()
    };

    // Applying the identical batch again changes nothing.
    let won = apply_changes(&b, a.site_id(), &changes).unwrap();
    assert_eq!(won, 0);
    assert_eq!(snapshot(&b, "foo"), rows_after_once);
    let clock_after_twice: Vec<(String, i64, i64)> = {
        let mut stmt = b
            .conn()
            .prepare(
                "SELECT __crsql_col_name, __crsql_col_version, __crsql_db_version
                 FROM foo__crsql_clock ORDER BY __crsql_col_name",
            )
            .unwrap();
        let rows = stmt
            .query_map([], |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)))
            .unwrap();
        rows.map(|r| r.unwrap()).collect()
    };
    assert_eq!(clock_after_once, clock_after_twice);
}

#[test]
fn test_merge_is_commutative_for_disjoint_streams() {
    const SCHEMA: &str = "CREATE TABLE foo (a PRIMARY KEY, b)";
    let a = new_site_with(SCHEMA);
    let b = new_site_with(SCHEMA);
    as_crr(&a, "foo").unwrap();
    as_crr(&b, "foo").unwrap();

    a.conn().execute("INSERT INTO foo VALUES (1, 'a1')", []).unwrap();
    a.conn().execute("INSERT INTO foo VALUES (2, 'a2')", []).unwrap();
    b.conn().execute("INSERT INTO foo VALUES (3, 'b1')", []).unwrap();
    b.conn().execute("INSERT INTO foo VALUES (4, 'b2')", []).unwrap();

    let from_a = changes_since(&a, 0, &[]).unwrap();
    let from_b = changes_since(&b, 0, &[]).unwrap();

    let ab = new_site_with(SCHEMA);
    as_crr(&ab, "foo").unwrap();
    apply_changes(&ab, a.site_id(), &from_a).unwrap();
    apply_changes(&ab, b.site_id(), &from_b).unwrap();

    let ba = new_site_with(SCHEMA);
    as_crr(&ba, "foo").unwrap();
    apply_changes(&ba, b.site_id(), &from_b).unwrap();
    apply_changes(&ba, a.site_id(), &from_a).unwrap();

    assert_eq!(snapshot(&ab, "foo"), snapshot(&ba, "foo"));
    assert_eq!(snapshot(&ab, "foo").len(), 4);
}

#[test]
fn test_db_version_strictly_increases_across_transactions() {
    let a = new_site_with("CREATE TABLE foo (a PRIMARY KEY, b)");
    as_crr(&a, "foo").unwrap();
    let mut last = a.db_version().unwrap();
    for i in 0..5 {
        a.conn()
            .execute("INSERT INTO foo VALUES (?, 'v')", rusqlite::params![i])
            .unwrap();
        let now = a.db_version().unwrap();
        assert!(now > last, "{} should exceed {}", now, last);
        last = now;
    }
}

#[test]
fn test_stale_revival_is_dropped() {
    // A tombstone with a higher causal length beats any change from the
    // row's earlier life, regardless of arrival order.
    const SCHEMA: &str = "CREATE TABLE foo (a PRIMARY KEY, b)";
    let a = new_site_with(SCHEMA);
    let b = new_site_with(SCHEMA);
    as_crr(&a, "foo").unwrap();
    as_crr(&b, "foo").unwrap();

    a.conn().execute("INSERT INTO foo VALUES (1, 'alive')", []).unwrap();
    let first_life = changes_since(&a, 0, &[]).unwrap();

    a.conn().execute("DELETE FROM foo WHERE a = 1", []).unwrap();
    let with_delete = changes_since(&a, 0, &[]).unwrap();

    // B sees the delete first; the older insert must not revive the row.
    apply_changes(&b, a.site_id(), &with_delete).unwrap();
    assert_eq!(count(&b, "SELECT count(*) FROM foo"), 0);
    apply_changes(&b, a.site_id(), &first_life).unwrap();
    assert_eq!(count(&b, "SELECT count(*) FROM foo"), 0);
}

#[test]
fn test_causal_length_gaps_are_tolerated() {
    // A site may first hear of a row several lifecycles in: the causal
    // length jumps by more than one and must be accepted as-is.
    const SCHEMA: &str = "CREATE TABLE foo (a PRIMARY KEY, b)";
    let a = new_site_with(SCHEMA);
    let b = new_site_with(SCHEMA);
    as_crr(&a, "foo").unwrap();
    as_crr(&b, "foo").unwrap();

    a.conn().execute("INSERT INTO foo VALUES (1, 'first')", []).unwrap();
    let first_life = changes_since(&a, 0, &[]).unwrap();

    // Two full lifecycles before B hears anything; A's feed now carries
    // only a tombstone at causal length 4.
    a.conn().execute("DELETE FROM foo WHERE a = 1", []).unwrap();
    a.conn().execute("INSERT INTO foo VALUES (1, 'second')", []).unwrap();
    a.conn().execute("DELETE FROM foo WHERE a = 1", []).unwrap();
    let feed = changes_since(&a, 0, &[]).unwrap();
    assert_eq!(feed.len(), 1);
    assert_eq!(feed[0].cl, 4);

    // B jumps straight from 0 to 4.
    pull(&a, &b, 0);
    assert_eq!(count(&b, "SELECT count(*) FROM foo"), 0);

    // Records from the row's first life are stale on arrival.
    assert_eq!(apply_changes(&b, a.site_id(), &first_life).unwrap(), 0);
    assert_eq!(count(&b, "SELECT count(*) FROM foo"), 0);

    // A third life crosses the next gap and revives the row on B.
    a.conn().execute("INSERT INTO foo VALUES (1, 'third')", []).unwrap();
    pull(&a, &b, 0);
    let v: String = b
        .conn()
        .query_row("SELECT b FROM foo WHERE a = 1", [], |r| r.get(0))
        .unwrap();
    assert_eq!(v, "third");
    assert_eq!(snapshot(&a, "foo"), snapshot(&b, "foo"));

    // A brand-new site jumps 0 -> 5 onto the living row directly.
    let c = new_site_with(SCHEMA);
    as_crr(&c, "foo").unwrap();
    pull(&a, &c, 0);
    assert_eq!(snapshot(&a, "foo"), snapshot(&c, "foo"));
}

#[test]
fn test_delete_and_recreate_replicates() {
    const SCHEMA: &str = "CREATE TABLE foo (a PRIMARY KEY, b)";
    let a = new_site_with(SCHEMA);
    let b = new_site_with(SCHEMA);
    as_crr(&a, "foo").unwrap();
    as_crr(&b, "foo").unwrap();

    a.conn().execute("INSERT INTO foo VALUES (1, 'first')", []).unwrap();
    pull(&a, &b, 0);
    assert_eq!(count(&b, "SELECT count(*) FROM foo"), 1);

    a.conn().execute("DELETE FROM foo WHERE a = 1", []).unwrap();
    a.conn().execute("INSERT INTO foo VALUES (1, 'second')", []).unwrap();
    pull(&a, &b, 0);

    let v: String = b
        .conn()
        .query_row("SELECT b FROM foo WHERE a = 1", [], |r| r.get(0))
        .unwrap();
    assert_eq!(v, "second");
    assert_eq!(snapshot(&a, "foo"), snapshot(&b, "foo"));
}

#[test]
fn test_pk_only_table_replicates() {
    const SCHEMA: &str = "CREATE TABLE tag (name PRIMARY KEY)";
    let a = new_site_with(SCHEMA);
    let b = new_site_with(SCHEMA);
    as_crr(&a, "tag").unwrap();
    as_crr(&b, "tag").unwrap();

    a.conn().execute("INSERT INTO tag VALUES ('blue')", []).unwrap();
    a.conn().execute("INSERT INTO tag VALUES ('red')", []).unwrap();
    a.conn().execute("DELETE FROM tag WHERE name = 'red'", []).unwrap();
    pull(&a, &b, 0);

    assert_eq!(snapshot(&b, "tag"), vec![vec![Value::Text("blue".into())]]);
}

#[test]
fn test_peer_tracker_records_merged_source() {
    const SCHEMA: &str = "CREATE TABLE foo (a PRIMARY KEY, b)";
    let a = new_site_with(SCHEMA);
    let b = new_site_with(SCHEMA);
    as_crr(&a, "foo").unwrap();
    as_crr(&b, "foo").unwrap();

    a.conn().execute("INSERT INTO foo VALUES (1, 'x')", []).unwrap();
    a.conn().execute("INSERT INTO foo VALUES (2, 'y')", []).unwrap();
    pull(&a, &b, 0);

    let (site, version): (Vec<u8>, i64) = b
        .conn()
        .query_row(
            "SELECT site_id, version FROM crsql_tracked_peers",
            [],
            |r| Ok((r.get(0)?, r.get(1)?)),
        )
        .unwrap();
    assert_eq!(site, a.site_id());
    assert_eq!(version, 2);

    // Re-merging older data never lowers the stored clock.
    let old = changes_since(&a, 0, &[]).unwrap();
    let first_only: Vec<ChangeRecord> = old
        .iter()
        .filter(|c| c.db_version == 1)
        .cloned()
        .collect();
    apply_changes(&b, a.site_id(), &first_only).unwrap();
    let version: i64 = b
        .conn()
        .query_row("SELECT version FROM crsql_tracked_peers", [], |r| r.get(0))
        .unwrap();
    assert_eq!(version, 2);
}

#[test]
fn test_rows_impacted_counts_only_wins() {
    const SCHEMA: &str = "CREATE TABLE foo (a PRIMARY KEY, b)";
    let a = new_site_with(SCHEMA);
    let b = new_site_with(SCHEMA);
    as_crr(&a, "foo").unwrap();
    as_crr(&b, "foo").unwrap();

    a.conn().execute("INSERT INTO foo VALUES (1, 'x')", []).unwrap();
    let changes = changes_since(&a, 0, &[]).unwrap();

    assert_eq!(apply_changes(&b, a.site_id(), &changes).unwrap(), 1);
    // Identical metadata loses the tiebreak, so nothing is impacted.
    assert_eq!(apply_changes(&b, a.site_id(), &changes).unwrap(), 0);
}

#[test]
fn test_merge_errors() {
    let b = new_site_with("CREATE TABLE known (a PRIMARY KEY, b)");
    as_crr(&b, "known").unwrap();

    let source = [1u8; 16];
    let mut change = ChangeRecord {
        table: "missing".to_string(),
        pk: b"1".to_vec(),
        cid: "b".to_string(),
        val: Value::Integer(1),
        col_version: 1,
        db_version: 1,
        site_id: None,
        cl: 1,
        seq: 0,
    };
    assert!(matches!(
        apply_changes(&b, &source, std::slice::from_ref(&change)),
        Err(Error::UnknownTable(_))
    ));

    change.table = "known".to_string();
    change.pk = b"not a token".to_vec();
    assert!(matches!(
        apply_changes(&b, &source, std::slice::from_ref(&change)),
        Err(Error::Malformed(_))
    ));

    // A failed batch leaves no partial state behind.
    assert_eq!(count(&b, "SELECT count(*) FROM known"), 0);
}

#[test]
fn test_changes_view_ordering() {
    let a = new_site_with("CREATE TABLE foo (a PRIMARY KEY, b, c)");
    as_crr(&a, "foo").unwrap();
    a.conn()
        .execute_batch(
            "BEGIN;
             INSERT INTO foo VALUES (1, 'x', 'y');
             INSERT INTO foo VALUES (2, 'p', 'q');
             COMMIT;",
        )
        .unwrap();
    a.conn()
        .execute("UPDATE foo SET b = 'z' WHERE a = 1", [])
        .unwrap();

    let changes = changes_since(&a, 0, &[]).unwrap();
    let order: Vec<(i64, i64)> = changes.iter().map(|c| (c.db_version, c.seq)).collect();
    let mut sorted = order.clone();
    sorted.sort_unstable();
    assert_eq!(order, sorted);
    // One transaction, strictly increasing seq from 0.
    assert_eq!(
        changes
            .iter()
            .filter(|c| c.db_version == 1)
            .map(|c| c.seq)
            .collect::<Vec<_>>(),
        vec![0, 1, 2, 3]
    );
}
