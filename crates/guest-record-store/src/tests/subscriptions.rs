use super::harness;
use realtime_transport::{layout, Transport, Value};
use serde_json::json;

#[tokio::test]
async fn missing_guest_list_arrives_empty() {
    let h = harness();
    let mut feed = h.store.subscribe_guests("s1");
    assert_eq!(feed.recv().await, Some(Vec::new()));

    h.seed_session(1);
    let guests = feed.latest().unwrap();
    assert_eq!(guests.len(), 2);
    assert_eq!(guests[1].id, "b");
}

#[tokio::test]
async fn feed_normalises_sparse_lists_like_fetch() {
    let h = harness();
    h.backend.seed(
        &layout::session("s1"),
        json!({"label": "Mon", "guests": {"0": {"id": "a"}, "12": {"id": "b"}}}),
    );

    let mut feed = h.store.subscribe_session("s1");
    let live = feed.recv().await.unwrap().unwrap();
    let fetched = h.store.fetch_session("s1").await.unwrap().unwrap();
    assert_eq!(live, fetched);
    assert_eq!(
        live.guests.iter().map(|g| g.id.as_str()).collect::<Vec<_>>(),
        ["a", "b"]
    );
}

#[tokio::test]
async fn index_is_sorted_by_recency() {
    let h = harness();
    h.backend.seed(
        &layout::session("older"),
        json!({"label": "Sun", "lastModified": 10}),
    );
    h.backend.seed(
        &layout::session("newer"),
        json!({"label": "Mon", "lastModified": 20, "guests": [{"id": "a"}]}),
    );

    let mut feed = h.store.subscribe_index();
    let index = feed.recv().await.unwrap();
    assert_eq!(index[0].id, "newer");
    assert_eq!(index[0].guest_count, 1);
    assert_eq!(index[1].id, "older");

    assert_eq!(h.store.list_sessions().await.unwrap(), index);
}

#[tokio::test]
async fn patches_do_not_disturb_live_subscribers() {
    let h = harness();
    h.seed_session(1);
    let mut dashboard = h.store.subscribe_guests("s1");
    let mut sidebar = h.store.subscribe_guests("s1");
    dashboard.latest();
    sidebar.latest();

    h.store.set_room_status("s1", "a", "clean", "hk").await.unwrap();

    assert_eq!(h.transport.listener_count(), 2);
    assert!(dashboard.is_active() && sidebar.is_active());
    let seen = dashboard.latest().unwrap();
    assert_eq!(seen[0].room_status.as_deref(), Some("clean"));
    assert!(sidebar.latest().is_some());
}

#[tokio::test]
async fn dropping_one_feed_keeps_the_other() {
    let h = harness();
    h.seed_session(1);
    let dashboard = h.store.subscribe_guests("s1");
    let mut sidebar = h.store.subscribe_guests("s1");
    sidebar.latest();

    drop(dashboard);
    h.transport
        .set(&layout::guest_field("s1", 1, "notes"), Value::from("late"))
        .await
        .unwrap();

    assert_eq!(h.transport.listener_count(), 1);
    let guests = sidebar.latest().unwrap();
    assert_eq!(guests[1].notes.as_deref(), Some("late"));
}
