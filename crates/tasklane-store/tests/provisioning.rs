use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;

use rusqlite::Transaction;
use tasklane_store::{
    Database, IsolationLevel, ProvisionError, Provisioner, SqliteUserRepository, StoreError,
    StoreResult, UserRepository,
};
use tasklane_types::{Identity, User, UserDto};
use tempfile::TempDir;

fn identity(email: &str) -> Identity {
    Identity {
        sub: "auth0|first-visit".to_string(),
        email: email.to_string(),
        sign_in_name: "first".to_string(),
    }
}

fn user_rows(db: &Database) -> i64 {
    let conn = db.connect().expect("connect");
    conn.query_row("SELECT COUNT(*) FROM users", [], |row| row.get(0))
        .expect("count")
}

fn race(provisioner: &Provisioner, callers: usize) -> Vec<Result<UserDto, ProvisionError>> {
    let barrier = Arc::new(Barrier::new(callers));
    let handles: Vec<_> = (0..callers)
        .map(|_| {
            let provisioner = provisioner.clone();
            let barrier = barrier.clone();
            thread::spawn(move || {
                barrier.wait();
                provisioner.provision_with_retry(&identity("first@example.com"))
            })
        })
        .collect();
    handles
        .into_iter()
        .map(|handle| handle.join().expect("thread"))
        .collect()
}

#[test]
fn concurrent_first_requests_create_exactly_one_user() {
    let dir = TempDir::new().expect("tempdir");
    let db = Database::open(dir.path().join("tasks.db")).expect("open");
    let provisioner = Provisioner::new(db.clone(), IsolationLevel::Serializable).expect("provisioner");

    let results = race(&provisioner, 8);
    let dtos: Vec<UserDto> = results
        .into_iter()
        .map(|result| result.expect("serialized provisioning succeeds"))
        .collect();

    assert_eq!(user_rows(&db), 1);
    assert!(dtos.windows(2).all(|pair| pair[0] == pair[1]));
    assert_eq!(dtos[0].id, "auth0|first-visit");
}

#[test]
fn repeatable_read_races_never_duplicate() {
    let dir = TempDir::new().expect("tempdir");
    let db = Database::open(dir.path().join("tasks.db")).expect("open");
    let provisioner =
        Provisioner::new(db.clone(), IsolationLevel::RepeatableRead).expect("provisioner");

    let results = race(&provisioner, 8);
    let mut dtos = Vec::new();
    for result in results {
        match result {
            Ok(dto) => dtos.push(dto),
            Err(err) => assert!(err.is_conflict(), "unexpected error: {err}"),
        }
    }

    assert_eq!(user_rows(&db), 1);
    assert!(!dtos.is_empty());
    assert!(dtos.windows(2).all(|pair| pair[0] == pair[1]));

    // Once the race settles every caller sees the same record.
    let settled = provisioner
        .provision_with_retry(&identity("first@example.com"))
        .expect("settled");
    assert_eq!(settled, dtos[0]);
}

#[test]
fn later_visits_keep_the_original_record() {
    let dir = TempDir::new().expect("tempdir");
    let db = Database::open(dir.path().join("tasks.db")).expect("open");
    let provisioner = Provisioner::new(db.clone(), IsolationLevel::default()).expect("provisioner");

    let first = provisioner
        .find_or_create(&identity("first@example.com"))
        .expect("create");
    let again = provisioner
        .find_or_create(&identity("changed@example.com"))
        .expect("find");

    assert_eq!(again, first);
    assert_eq!(again.created_time, first.created_time);
    assert_eq!(user_rows(&db), 1);
}

#[test]
fn read_committed_is_refused_up_front() {
    let dir = TempDir::new().expect("tempdir");
    let db = Database::open(dir.path().join("tasks.db")).expect("open");
    let err = Provisioner::new(db, IsolationLevel::ReadCommitted).err().expect("refused");
    assert!(matches!(
        err,
        ProvisionError::IsolationTooWeak {
            requested: IsolationLevel::ReadCommitted,
            required: IsolationLevel::RepeatableRead,
        }
    ));
}

/// Fails the first `conflicts` upserts the way a lost write race does.
struct ConflictingUsers {
    inner: SqliteUserRepository,
    conflicts: usize,
    upserts: AtomicUsize,
}

impl ConflictingUsers {
    fn new(conflicts: usize) -> Self {
        Self {
            inner: SqliteUserRepository,
            conflicts,
            upserts: AtomicUsize::new(0),
        }
    }
}

impl UserRepository for ConflictingUsers {
    fn find_by_id(&self, tx: &Transaction<'_>, id: &str) -> StoreResult<Option<User>> {
        self.inner.find_by_id(tx, id)
    }

    fn upsert(&self, tx: &Transaction<'_>, user: &User) -> StoreResult<()> {
        let attempt = self.upserts.fetch_add(1, Ordering::SeqCst);
        if attempt < self.conflicts {
            return Err(StoreError::Conflict("database is locked".to_string()));
        }
        self.inner.upsert(tx, user)
    }
}

#[test]
fn a_single_conflict_is_retried() {
    let dir = TempDir::new().expect("tempdir");
    let db = Database::open(dir.path().join("tasks.db")).expect("open");
    let users = Arc::new(ConflictingUsers::new(1));
    let provisioner =
        Provisioner::with_repository(db.clone(), users.clone(), IsolationLevel::Serializable)
            .expect("provisioner");

    let dto = provisioner
        .provision_with_retry(&identity("first@example.com"))
        .expect("second attempt wins");
    assert_eq!(dto.email, "first@example.com");
    assert_eq!(users.upserts.load(Ordering::SeqCst), 2);
    assert_eq!(user_rows(&db), 1);
}

#[test]
fn a_second_conflict_is_surfaced() {
    let dir = TempDir::new().expect("tempdir");
    let db = Database::open(dir.path().join("tasks.db")).expect("open");
    let users = Arc::new(ConflictingUsers::new(2));
    let provisioner =
        Provisioner::with_repository(db.clone(), users.clone(), IsolationLevel::Serializable)
            .expect("provisioner");

    let err = provisioner
        .provision_with_retry(&identity("first@example.com"))
        .unwrap_err();
    assert!(err.is_conflict());
    assert_eq!(users.upserts.load(Ordering::SeqCst), 2);
    assert_eq!(user_rows(&db), 0);
}
