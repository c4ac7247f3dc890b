//! Two sessions contending for the same general-admission tickets.

#![allow(clippy::unwrap_used)]

use boxoffice_core::{ReservationError, ReservationKey, SessionId};
use boxoffice_runtime::reservation::{ReservationBook, ReservationConfig};
use std::time::Duration;
use tokio::time::advance;

fn book() -> ReservationBook {
    ReservationBook::new(
        ReservationConfig::builder()
            .lock_duration(Duration::from_secs(300))
            .sweep_interval(Duration::from_secs(60))
            .build(),
    )
}

#[tokio::test(start_paused = true)]
async fn second_session_gets_tickets_after_first_releases() {
    let book = book();
    let s1 = book.session(SessionId::new());
    let s2 = book.session(SessionId::new());

    assert!(s1.acquire("evt-42", "GA", 4));
    assert!(!s2.acquire("evt-42", "GA", 2));

    assert!(s1.release("evt-42", "GA"));
    assert!(s2.acquire("evt-42", "GA", 2));

    assert_eq!(s2.quantity("evt-42", "GA"), Some(2));
    assert!(!s1.holds("evt-42", "GA"));
    book.shutdown();
}

#[tokio::test(start_paused = true)]
async fn refused_session_learns_when_the_hold_lapses() {
    let book = book();
    let s1 = book.session(SessionId::new());
    let s2 = book.session(SessionId::new());
    s1.try_acquire("evt-42", "GA", 4).unwrap();

    advance(Duration::from_secs(100)).await;
    let err = s2.try_acquire("evt-42", "GA", 2).unwrap_err();

    assert_eq!(
        err,
        ReservationError::Conflict {
            key: ReservationKey::new("evt-42", "GA"),
            expires_in: Duration::from_secs(200),
        }
    );
    book.shutdown();
}

#[tokio::test(start_paused = true)]
async fn only_the_owner_can_release_or_extend() {
    let book = book();
    let s1 = book.session(SessionId::new());
    let s2 = book.session(SessionId::new());
    assert!(s1.acquire("evt-42", "GA", 4));

    assert!(!s2.release("evt-42", "GA"));
    assert!(!s2.extend("evt-42", "GA"));
    assert_eq!(s2.release_all(), 0);

    assert!(s1.holds("evt-42", "GA"));
    book.shutdown();
}

#[tokio::test(start_paused = true)]
async fn sweeper_purges_abandoned_holds() {
    let book = book();
    let s1 = book.session(SessionId::new());
    assert!(s1.acquire("evt-42", "GA", 4));
    assert!(s1.acquire("evt-42", "VIP", 1));
    assert!(book.is_sweeping());

    // The first sweep after expiry removes both entries
    advance(Duration::from_secs(301)).await;
    advance(Duration::from_secs(60)).await;
    tokio::task::yield_now().await;

    assert!(book.is_empty());
    assert!(s1.held_by_session().is_empty());
    book.shutdown();
    assert!(!book.is_sweeping());
}

#[tokio::test(start_paused = true)]
async fn leaving_checkout_drops_every_hold_of_the_session() {
    let book = book();
    let s1 = book.session(SessionId::new());
    let s2 = book.session(SessionId::new());
    assert!(s1.acquire("evt-42", "GA", 4));
    assert!(s1.acquire("evt-7", "VIP", 2));
    assert!(s2.acquire("evt-9", "GA", 1));

    assert_eq!(s1.release_all(), 2);

    assert_eq!(book.len(), 1);
    assert!(s2.holds("evt-9", "GA"));
    assert!(s2.acquire("evt-42", "GA", 2));
    book.shutdown();
}
