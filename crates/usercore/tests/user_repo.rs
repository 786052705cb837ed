use chrono::{DateTime, Duration, TimeZone, Utc};
use rusqlite::Connection;
use usercore::db::migrations::latest_version;
use usercore::db::open_db_in_memory;
use usercore::{
    ContextError, Cursor, HealthCheck, NewUser, RepoError, RequestContext, SqliteUserRepository,
    User, UserFilter, UserId, UserLookup, UserRepository,
};

fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 3, 1, 9, 0, 0).unwrap()
}

fn draft(name: &str, email: &str, at: DateTime<Utc>) -> NewUser {
    NewUser::new(name, email, at).unwrap()
}

fn seed(repo: &SqliteUserRepository<'_>, count: usize) -> Vec<User> {
    let ctx = RequestContext::new();
    (0..count)
        .map(|index| {
            let user = draft(
                &format!("User {index}"),
                &format!("user{index}@example.com"),
                t0() + Duration::minutes(index as i64),
            );
            repo.create(&ctx, &user).unwrap()
        })
        .collect()
}

fn ids(users: &[User]) -> Vec<UserId> {
    users.iter().map(User::id).collect()
}

#[test]
fn create_assigns_id_and_roundtrips_all_fields() {
    let conn = open_db_in_memory().unwrap();
    let repo = SqliteUserRepository::try_new(&conn).unwrap();
    let ctx = RequestContext::new();

    let created = repo
        .create(&ctx, &draft("Ada", "ada@example.com", t0()))
        .unwrap();
    assert_eq!(created.version(), 1);
    assert!(!created.id().as_uuid().is_nil());

    let loaded = repo.get_by_id(&ctx, created.id()).unwrap();
    assert_eq!(loaded, created);
}

#[test]
fn create_rejects_duplicate_active_email_without_touching_draft() {
    let conn = open_db_in_memory().unwrap();
    let repo = SqliteUserRepository::try_new(&conn).unwrap();
    let ctx = RequestContext::new();

    repo.create(&ctx, &draft("Ada", "ada@example.com", t0()))
        .unwrap();
    let second = draft("Other Ada", " ADA@example.com", t0());
    let before = second.clone();

    let err = repo.create(&ctx, &second).unwrap_err();
    assert!(matches!(err, RepoError::DuplicateEmail(ref email) if email == "ada@example.com"));
    assert_eq!(second, before);
    assert_eq!(repo.count(&ctx, &UserFilter::default()).unwrap(), 1);
}

#[test]
fn create_allows_email_of_soft_deleted_user() {
    let conn = open_db_in_memory().unwrap();
    let repo = SqliteUserRepository::try_new(&conn).unwrap();
    let ctx = RequestContext::new();

    let mut first = repo
        .create(&ctx, &draft("Ada", "ada@example.com", t0()))
        .unwrap();
    first.delete(t0() + Duration::seconds(1)).unwrap();
    repo.update(&ctx, &mut first).unwrap();

    let second = repo
        .create(&ctx, &draft("New Ada", "ada@example.com", t0()))
        .unwrap();
    assert_ne!(second.id(), first.id());
    assert_eq!(repo.get_by_email(&ctx, "ada@example.com").unwrap().id(), second.id());
}

#[test]
fn update_is_conditional_on_version() {
    let conn = open_db_in_memory().unwrap();
    let repo = SqliteUserRepository::try_new(&conn).unwrap();
    let ctx = RequestContext::new();

    let created = repo
        .create(&ctx, &draft("Ada", "ada@example.com", t0()))
        .unwrap();
    let mut winner = repo.get_by_id(&ctx, created.id()).unwrap();
    let mut stale = repo.get_by_id(&ctx, created.id()).unwrap();

    winner
        .change_name("Ada King", t0() + Duration::seconds(1))
        .unwrap();
    repo.update(&ctx, &mut winner).unwrap();
    assert_eq!(winner.version(), 2);

    stale
        .change_name("Ada Byron", t0() + Duration::seconds(2))
        .unwrap();
    let err = repo.update(&ctx, &mut stale).unwrap_err();
    assert!(matches!(
        err,
        RepoError::VersionConflict { id, version: 1 } if id == created.id()
    ));
    assert_eq!(stale.version(), 1);

    let stored = repo.get_by_id(&ctx, created.id()).unwrap();
    assert_eq!(stored.name(), "Ada King");
    assert_eq!(stored.version(), 2);
    assert_eq!(stored.updated_at(), t0() + Duration::seconds(1));
    assert_eq!(stored.created_at(), t0());
}

#[test]
fn update_of_unknown_id_reports_version_conflict() {
    let conn = open_db_in_memory().unwrap();
    let repo = SqliteUserRepository::try_new(&conn).unwrap();
    let ctx = RequestContext::new();

    let mut ghost = draft("Ghost", "ghost@example.com", t0()).assign_id(UserId::generate());
    let err = repo.update(&ctx, &mut ghost).unwrap_err();
    assert!(matches!(err, RepoError::VersionConflict { version: 1, .. }));
}

#[test]
fn update_to_taken_email_is_duplicate() {
    let conn = open_db_in_memory().unwrap();
    let repo = SqliteUserRepository::try_new(&conn).unwrap();
    let ctx = RequestContext::new();

    repo.create(&ctx, &draft("Ada", "ada@example.com", t0()))
        .unwrap();
    let mut grace = repo
        .create(&ctx, &draft("Grace", "grace@example.com", t0()))
        .unwrap();

    grace
        .change_email("ada@example.com", t0() + Duration::seconds(1))
        .unwrap();
    let err = repo.update(&ctx, &mut grace).unwrap_err();
    assert!(matches!(err, RepoError::DuplicateEmail(_)));
    assert_eq!(grace.version(), 1);
}

#[test]
fn get_by_id_returns_deleted_but_get_by_email_hides_them() {
    let conn = open_db_in_memory().unwrap();
    let repo = SqliteUserRepository::try_new(&conn).unwrap();
    let ctx = RequestContext::new();

    let mut user = repo
        .create(&ctx, &draft("Ada", "ada@example.com", t0()))
        .unwrap();
    assert_eq!(
        repo.get_by_email(&ctx, "  ADA@Example.com").unwrap().id(),
        user.id()
    );

    let deleted_at = t0() + Duration::seconds(30);
    user.delete(deleted_at).unwrap();
    repo.update(&ctx, &mut user).unwrap();

    let loaded = repo.get_by_id(&ctx, user.id()).unwrap();
    assert_eq!(loaded.deleted_at(), Some(deleted_at));
    assert_eq!(loaded.version(), 2);

    let err = repo.get_by_email(&ctx, "ada@example.com").unwrap_err();
    assert!(matches!(
        err,
        RepoError::NotFound(UserLookup::Email(ref email)) if email == "ada@example.com"
    ));
}

#[test]
fn get_by_id_missing_reports_not_found() {
    let conn = open_db_in_memory().unwrap();
    let repo = SqliteUserRepository::try_new(&conn).unwrap();
    let id = UserId::generate();

    let err = repo.get_by_id(&RequestContext::new(), id).unwrap_err();
    assert!(matches!(err, RepoError::NotFound(UserLookup::Id(missing)) if missing == id));
}

#[test]
fn list_walks_pages_in_ascending_id_order() {
    let conn = open_db_in_memory().unwrap();
    let repo = SqliteUserRepository::try_new(&conn).unwrap();
    let ctx = RequestContext::new();
    let mut expected = ids(&seed(&repo, 5));
    expected.sort();

    let filter = UserFilter::default();
    let first = repo.list(&ctx, &filter, None, 2).unwrap();
    assert_eq!(ids(&first.users), expected[0..2]);
    let cursor = first.next_cursor.unwrap();
    assert_eq!(cursor.after_id, expected[1]);

    let second = repo.list(&ctx, &filter, Some(&cursor), 2).unwrap();
    assert_eq!(ids(&second.users), expected[2..4]);
    let cursor = second.next_cursor.unwrap();

    let third = repo.list(&ctx, &filter, Some(&cursor), 2).unwrap();
    assert_eq!(ids(&third.users), expected[4..5]);
    assert!(third.next_cursor.is_none());
}

#[test]
fn list_exact_multiple_of_limit_ends_with_empty_page() {
    let conn = open_db_in_memory().unwrap();
    let repo = SqliteUserRepository::try_new(&conn).unwrap();
    let ctx = RequestContext::new();
    seed(&repo, 4);

    let filter = UserFilter::default();
    let first = repo.list(&ctx, &filter, None, 2).unwrap();
    let second = repo
        .list(&ctx, &filter, first.next_cursor.as_ref(), 2)
        .unwrap();
    assert_eq!(second.users.len(), 2);

    let last = repo
        .list(&ctx, &filter, second.next_cursor.as_ref(), 2)
        .unwrap();
    assert!(last.users.is_empty());
    assert!(last.next_cursor.is_none());
}

#[test]
fn list_rejects_zero_limit_and_clamps_large_limit() {
    let conn = open_db_in_memory().unwrap();
    let repo = SqliteUserRepository::try_new(&conn).unwrap();
    let ctx = RequestContext::new();
    seed(&repo, 3);

    let err = repo.list(&ctx, &UserFilter::default(), None, 0).unwrap_err();
    assert!(matches!(err, RepoError::InvalidLimit));

    let page = repo
        .list(&ctx, &UserFilter::default(), None, 50_000)
        .unwrap();
    assert_eq!(page.users.len(), 3);
    assert!(page.next_cursor.is_none());
}

#[test]
fn list_and_count_apply_filters_together() {
    let conn = open_db_in_memory().unwrap();
    let repo = SqliteUserRepository::try_new(&conn).unwrap();
    let ctx = RequestContext::new();
    let users = seed(&repo, 4);

    let mut deleted = users[3].clone();
    deleted.delete(t0() + Duration::hours(1)).unwrap();
    repo.update(&ctx, &mut deleted).unwrap();

    let active = UserFilter::default();
    assert_eq!(repo.count(&ctx, &active).unwrap(), 3);
    let everyone = UserFilter {
        include_deleted: true,
        ..UserFilter::default()
    };
    assert_eq!(repo.count(&ctx, &everyone).unwrap(), 4);
    assert_eq!(repo.list(&ctx, &everyone, None, 10).unwrap().users.len(), 4);

    let by_email = UserFilter {
        email: Some(" USER2@example.com".to_string()),
        ..UserFilter::default()
    };
    let page = repo.list(&ctx, &by_email, None, 10).unwrap();
    assert_eq!(ids(&page.users), vec![users[2].id()]);
    assert_eq!(repo.count(&ctx, &by_email).unwrap(), 1);

    // Bounds are exclusive: user0 sits exactly on created_after.
    let window = UserFilter {
        include_deleted: true,
        created_after: Some(users[0].created_at()),
        created_before: Some(users[3].created_at()),
        ..UserFilter::default()
    };
    let page = repo.list(&ctx, &window, None, 10).unwrap();
    assert_eq!(ids(&page.users), vec![users[1].id(), users[2].id()]);
    assert_eq!(repo.count(&ctx, &window).unwrap(), 2);
}

#[test]
fn created_bounds_outside_four_digit_years_compare_chronologically() {
    let conn = open_db_in_memory().unwrap();
    let repo = SqliteUserRepository::try_new(&conn).unwrap();
    let ctx = RequestContext::new();
    seed(&repo, 1);

    let far_future = Utc.with_ymd_and_hms(10000, 1, 1, 0, 0, 0).unwrap();
    let far_past = Utc.with_ymd_and_hms(-1, 1, 1, 0, 0, 0).unwrap();
    let count_with = |created_after, created_before| {
        let filter = UserFilter {
            created_after,
            created_before,
            ..UserFilter::default()
        };
        repo.count(&ctx, &filter).unwrap()
    };

    assert_eq!(count_with(None, Some(far_future)), 1);
    assert_eq!(count_with(None, Some(DateTime::<Utc>::MAX_UTC)), 1);
    assert_eq!(count_with(Some(far_future), None), 0);
    assert_eq!(count_with(Some(far_past), None), 1);
    assert_eq!(count_with(Some(DateTime::<Utc>::MIN_UTC), None), 1);
    assert_eq!(count_with(None, Some(far_past)), 0);
    assert_eq!(count_with(Some(far_past), Some(far_future)), 1);
}

#[test]
fn cursor_serializes_as_after_id() {
    let id = UserId::generate();
    let cursor = Cursor { after_id: id };
    let json = serde_json::to_value(cursor).unwrap();
    assert_eq!(json["after_id"], id.to_string());

    let decoded: Cursor = serde_json::from_value(json).unwrap();
    assert_eq!(decoded, cursor);
}

#[test]
fn cancelled_context_fails_before_touching_storage() {
    let conn = open_db_in_memory().unwrap();
    let repo = SqliteUserRepository::try_new(&conn).unwrap();
    let ctx = RequestContext::new();
    ctx.cancel();

    let err = repo
        .create(&ctx, &draft("Ada", "ada@example.com", t0()))
        .unwrap_err();
    assert!(matches!(err, RepoError::Cancelled(ContextError::Cancelled)));
    assert!(matches!(
        repo.ping(&ctx),
        Err(RepoError::Cancelled(ContextError::Cancelled))
    ));

    let live = RequestContext::new();
    assert_eq!(repo.count(&live, &UserFilter::default()).unwrap(), 0);
}

#[test]
fn expired_deadline_fails_fast() {
    let conn = open_db_in_memory().unwrap();
    let repo = SqliteUserRepository::try_new(&conn).unwrap();
    let ctx = RequestContext::with_timeout(std::time::Duration::ZERO);

    let err = repo.count(&ctx, &UserFilter::default()).unwrap_err();
    assert!(matches!(
        err,
        RepoError::Cancelled(ContextError::DeadlineExceeded)
    ));
}

#[test]
fn ping_succeeds_on_ready_connection() {
    let conn = open_db_in_memory().unwrap();
    let repo = SqliteUserRepository::try_new(&conn).unwrap();
    repo.ping(&RequestContext::new()).unwrap();
}

#[test]
fn repository_rejects_uninitialized_connection() {
    let conn = Connection::open_in_memory().unwrap();

    let result = SqliteUserRepository::try_new(&conn);
    match result {
        Err(RepoError::UninitializedConnection {
            expected_version,
            actual_version: 0,
        }) => assert_eq!(expected_version, latest_version()),
        Err(other) => panic!("unexpected error: {other}"),
        Ok(_) => panic!("expected uninitialized connection error"),
    }
}

#[test]
fn repository_rejects_connection_without_users_table() {
    let conn = Connection::open_in_memory().unwrap();
    conn.execute_batch(&format!("PRAGMA user_version = {};", latest_version()))
        .unwrap();

    let result = SqliteUserRepository::try_new(&conn);
    assert!(matches!(
        result,
        Err(RepoError::MissingRequiredTable("users"))
    ));
}

#[test]
fn read_paths_reject_corrupted_rows() {
    let conn = open_db_in_memory().unwrap();
    conn.execute(
        "INSERT INTO users (id, name, email, version, created_at, updated_at, deleted_at)
         VALUES ('not-a-uuid', 'Broken', 'broken@example.com', 1,
                 '2026-03-01T09:00:00.000000000Z', '2026-03-01T09:00:00.000000000Z', NULL);",
        [],
    )
    .unwrap();
    let repo = SqliteUserRepository::try_new(&conn).unwrap();
    let ctx = RequestContext::new();

    let err = repo.get_by_email(&ctx, "broken@example.com").unwrap_err();
    assert!(matches!(err, RepoError::InvalidData(ref message) if message.contains("users.id")));
    assert!(matches!(
        repo.list(&ctx, &UserFilter::default(), None, 10),
        Err(RepoError::InvalidData(_))
    ));
}
