//! Tests for the janitor singleton state.

use hydra_db::queries::janitor;
use hydra_test_utils::create_test_pool;

#[tokio::test]
async fn default_state_is_idle_with_spec_defaults() {
    let pool = create_test_pool().await;

    let state = janitor::get_state(&pool).await.unwrap();
    assert!(!state.running);
    assert!(!state.stop_requested);
    assert_eq!(state.interval_minutes, 15);
    assert_eq!(state.max_age_minutes, 180);
    assert_eq!(state.total_cleaned, 0);

    pool.close().await;
}

#[tokio::test]
async fn arm_refuses_when_already_running() {
    let pool = create_test_pool().await;

    assert!(janitor::arm(&pool, 5, 60).await.unwrap());
    let state = janitor::get_state(&pool).await.unwrap();
    assert!(state.running);
    assert_eq!(state.interval_minutes, 5);
    assert_eq!(state.max_age_minutes, 60);

    // Second arm is rejected and keeps the original schedule.
    assert!(!janitor::arm(&pool, 1, 1).await.unwrap());
    let state = janitor::get_state(&pool).await.unwrap();
    assert_eq!(state.interval_minutes, 5);

    pool.close().await;
}

#[tokio::test]
async fn stop_and_sweep_bookkeeping() {
    let pool = create_test_pool().await;

    janitor::arm(&pool, 15, 180).await.unwrap();
    janitor::record_sweep(&pool, 3).await.unwrap();
    janitor::record_sweep(&pool, 2).await.unwrap();
    janitor::request_stop(&pool).await.unwrap();

    let state = janitor::get_state(&pool).await.unwrap();
    assert_eq!(state.total_cleaned, 5);
    assert!(state.last_cleanup_at.is_some());
    assert!(state.stop_requested);

    janitor::mark_stopped(&pool).await.unwrap();
    let state = janitor::get_state(&pool).await.unwrap();
    assert!(!state.running);
    assert!(!state.stop_requested);

    // Re-arming after a stop works again.
    assert!(janitor::arm(&pool, 10, 120).await.unwrap());

    pool.close().await;
}
