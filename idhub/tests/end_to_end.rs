use chrono::{Duration, TimeZone, Utc};
use idhub::config::PasswordConfig;
use idhub::prelude::*;

async fn state() -> AppState {
    let config = Config {
        password: PasswordConfig {
            memory_cost_kib: 1024,
            time_cost: 1,
            parallelism: 1,
            min_length: 8,
        },
        ..Config::default()
    };
    AppState::builder()
        .config(config)
        .without_tracing()
        .build()
        .await
        .expect("in-memory state builds")
}

#[tokio::test]
async fn user_lifecycle_with_role_grant() {
    let state = state().await;
    let identity = state.identity();

    let user = identity
        .create_user(NewUser::new("alice01", "s3cret-pass", UserType::P2p))
        .await
        .unwrap();
    let user_id = user.id().unwrap();
    assert_eq!(user.get_str("status"), Some("ACTIVE"));
    assert_eq!(user.get_i64("privilege"), Some(9));
    assert_eq!(user.get_i64("deleted"), Some(0));

    let role = identity.create_role("admin", None).await.unwrap();
    identity.grant_role(user_id, "admin").await.unwrap();

    let grants = identity
        .repositories()
        .user_roles
        .list(&ListQuery::new(FilterSpec::new().with("user_id", user_id)))
        .await
        .unwrap();
    assert_eq!(grants.len(), 1);
    assert_eq!(grants[0].get_i64("role_id"), role.id());

    let listed = identity
        .list_users(&ListQuery::new(FilterSpec::new().with("username", "alice01")))
        .await
        .unwrap();
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].id(), Some(user_id));

    let profile = identity.get_user(user_id).await.unwrap();
    assert_eq!(profile.roles, ["admin"]);

    identity.delete_user(user_id).await.unwrap();
    assert!(matches!(
        identity.get_user(user_id).await,
        Err(Error::NotFound(_))
    ));

    let deleted = identity
        .repositories()
        .users
        .find_one(&FilterSpec::new().with("id", user_id), DeletedMode::Only)
        .await
        .unwrap();
    assert_eq!(deleted.get_i64("deleted"), Some(user_id));
    assert!(deleted.get_timestamp("deleted_at").is_some());
}

#[tokio::test]
async fn session_round_trip() {
    let state = state().await;
    let identity = state.identity();

    identity
        .create_user(NewUser::new("bank_07", "s3cret-pass", UserType::Bank))
        .await
        .unwrap();
    let outcome = identity.login("bank_07", "s3cret-pass").await.unwrap();

    let payload = identity.check(&outcome.token).await.unwrap();
    assert_eq!(payload.username, "bank_07");
    assert_eq!(payload.user_type, "bank");
    assert!(payload.roles.is_empty());

    identity.logout(&outcome.token).await.unwrap();
    let err = identity.check(&outcome.token).await.unwrap_err();
    assert!(matches!(err, Error::Expired));
    assert_eq!(err.code(), 1006);
}

#[tokio::test]
async fn keyset_pages_cover_every_user_once() {
    let state = state().await;
    let identity = state.identity();

    for name in ["user_a", "user_b", "user_c", "user_d", "user_e"] {
        identity
            .create_user(NewUser::new(name, "s3cret-pass", UserType::P2p))
            .await
            .unwrap();
    }

    let mut seen = Vec::new();
    let mut marker = None;
    loop {
        let mut query = ListQuery::default()
            .with_sort(["username"], ["desc"])
            .with_limit(2);
        if let Some(id) = marker {
            query = query.with_marker(Marker::Id(id));
        }
        let page = identity.list_users(&query).await.unwrap();
        if page.is_empty() {
            break;
        }
        marker = page.last().and_then(|row| row.id());
        seen.extend(page.iter().filter_map(|row| row.get_str("username").map(str::to_string)));
    }

    assert_eq!(seen, ["user_e", "user_d", "user_c", "user_b", "user_a"]);
    assert_eq!(identity.count_users(&FilterSpec::new()).await.unwrap(), 5);
}

/// Page through users one at a time, echoing each last row back as JSON
async fn walk_users(identity: &IdentityService, keys: [&str; 2], dirs: [&str; 2]) -> Vec<String> {
    let mut seen = Vec::new();
    let mut marker: Option<Record> = None;
    loop {
        let mut query = ListQuery::default().with_sort(keys, dirs).with_limit(2);
        if let Some(row) = marker.take() {
            query = query.with_marker(Marker::Row(row));
        }
        let page = identity.list_users(&query).await.unwrap();
        let Some(last) = page.last() else {
            return seen;
        };
        let wire = serde_json::to_string(last).unwrap();
        marker = Some(serde_json::from_str(&wire).unwrap());
        seen.extend(page.iter().filter_map(|row| row.get_str("username").map(str::to_string)));
        assert!(seen.len() <= 10, "paging did not terminate: {:?}", seen);
    }
}

#[tokio::test]
async fn wire_markers_page_over_timestamps_and_nulls() {
    let state = state().await;
    let identity = state.identity();

    let base = Utc.with_ymd_and_hms(2024, 3, 1, 8, 30, 0).unwrap();
    let mut ids = Vec::new();
    for name in ["user_a", "user_b", "user_c", "user_d", "user_e"] {
        let user = identity
            .create_user(NewUser::new(name, "s3cret-pass", UserType::P2p))
            .await
            .unwrap();
        ids.push(user.id().unwrap());
    }
    // user_d logged in first, then user_b; the rest never did
    for (index, millis) in [(3, 250), (1, 1_750)] {
        identity
            .repositories()
            .users
            .update(
                ids[index],
                Record::new().with("last_login_time", base + Duration::milliseconds(millis)),
            )
            .await
            .unwrap();
    }

    assert_eq!(
        walk_users(identity, ["last_login_time", "id"], ["asc", "asc"]).await,
        ["user_d", "user_b", "user_a", "user_c", "user_e"]
    );
    assert_eq!(
        walk_users(identity, ["last_login_time", "id"], ["desc", "asc"]).await,
        ["user_a", "user_c", "user_e", "user_b", "user_d"]
    );
    assert_eq!(
        walk_users(identity, ["created_at", "id"], ["desc", "desc"]).await,
        ["user_e", "user_d", "user_c", "user_b", "user_a"]
    );
}

#[tokio::test]
async fn hard_delete_of_referenced_role_is_refused() {
    let state = state().await;
    let identity = state.identity();

    let user_id = identity
        .create_user(NewUser::new("alice01", "s3cret-pass", UserType::P2p))
        .await
        .unwrap()
        .id()
        .unwrap();
    let role_id = identity.create_role("auditor", None).await.unwrap().id().unwrap();
    identity.grant_role(user_id, "auditor").await.unwrap();

    let err = identity
        .repositories()
        .roles
        .delete(role_id, false)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ReferenceFailure);
}
