#![cfg(feature = "sqlite")]

mod common;

use std::sync::Arc;

use common::{PlainVerifier, SECRET, StaticUsers};
use portcullis::{
    JwtConfig, LoginOutcome, Namespace, Portcullis, SqliteAttemptRepository, SqlitePool,
    ThrottleConfig,
};

async fn build(pool: SqlitePool) -> Portcullis<SqliteAttemptRepository> {
    Portcullis::builder()
        .with_sqlite_pool(pool)
        .with_jwt(JwtConfig::new_hs256(SECRET.to_vec()))
        .with_password_verifier(Arc::new(PlainVerifier))
        .with_throttle_config(ThrottleConfig::default().with_max_attempts_before_lock(3))
        .apply_migrations(true)
        .build(StaticUsers::plain(&[("alice", "correct horse")]))
        .await
        .expect("Failed to build Portcullis")
}

#[tokio::test]
async fn test_sqlite_login_flow() {
    let pool = SqlitePool::connect("sqlite::memory:").await.unwrap();
    let portcullis = build(pool).await;

    let outcome = portcullis
        .attempt_login("alice", "correct horse", "203.0.113.1")
        .await;
    assert!(outcome.is_accepted());

    for i in 0..3 {
        let outcome = portcullis
            .attempt_login("alice", "guess", &format!("203.0.113.{i}"))
            .await;
        assert!(matches!(outcome, LoginOutcome::RejectedInvalid { .. }));
    }

    let outcome = portcullis
        .attempt_login("alice", "correct horse", "203.0.113.50")
        .await;
    assert!(matches!(
        outcome,
        LoginOutcome::RejectedLocked {
            scope: Namespace::Username,
            ..
        }
    ));
}

#[tokio::test]
async fn test_instances_share_state_through_storage() {
    let pool = SqlitePool::connect("sqlite::memory:").await.unwrap();
    let first = build(pool.clone()).await;
    let second = build(pool).await;

    // Alternate instances, as a load balancer would
    for (i, instance) in [&first, &second, &first].into_iter().enumerate() {
        instance
            .attempt_login("alice", "guess", &format!("198.51.100.{i}"))
            .await;
    }

    assert!(second.check_username("alice").await.unwrap().locked);

    assert!(first.unlock(Namespace::Username, "alice").await.unwrap());
    let outcome = second
        .attempt_login("alice", "correct horse", "198.51.100.9")
        .await;
    assert!(outcome.is_accepted());
}

#[tokio::test]
async fn test_sweep_against_sqlite() {
    let pool = SqlitePool::connect("sqlite::memory:").await.unwrap();
    let portcullis = build(pool).await;

    portcullis
        .attempt_login("nobody", "guess", "192.0.2.77")
        .await;
    // Recent failures are kept
    assert_eq!(portcullis.sweep().await.unwrap(), 0);
    assert_eq!(
        portcullis.check_ip("192.0.2.77").await.unwrap().failure_count,
        1
    );
}
