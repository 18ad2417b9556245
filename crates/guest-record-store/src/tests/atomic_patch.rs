use super::harness;
use crate::Delivery;
use realtime_transport::{layout, Transport, TransportStats, Value};
use serde_json::json;
use sync_client::{PatchOutcome, SyncError};

// ============================================================================
// One single-shot read per patch
// ============================================================================

fn assert_single_read(before: TransportStats, after: TransportStats) {
    assert_eq!(after.get_once - before.get_once, 1, "exactly one get_once");
    assert_eq!(after.update - before.update, 1, "exactly one update");
    assert_eq!(after.listen, before.listen, "no listener registered");
    assert_eq!(after.unlisten, before.unlisten);
    assert_eq!(after.off_path, before.off_path);
    assert_eq!(after.set, before.set, "never rewrites the list");
}

#[tokio::test]
async fn every_patch_reads_once_and_never_listens() {
    let h = harness();
    h.seed_session(1);
    let store = &h.store;

    let before = h.transport.stats();
    store.set_room_status("s1", "a", "clean", "hk-ana").await.unwrap();
    assert_single_read(before, h.transport.stats());

    let before = h.transport.stats();
    store.set_maintenance_status("s1", "a", "fixed", "eng-bo").await.unwrap();
    assert_single_read(before, h.transport.stats());

    let before = h.transport.stats();
    store.set_guest_status("s1", "b", "arrived", "desk").await.unwrap();
    assert_single_read(before, h.transport.stats());

    let before = h.transport.stats();
    store
        .append_delivery("s1", "a", &Delivery::new("d1", "Flowers"))
        .await
        .unwrap();
    assert_single_read(before, h.transport.stats());

    let before = h.transport.stats();
    store.set_delivery_flag("s1", "a", "d1", true, "desk").await.unwrap();
    assert_single_read(before, h.transport.stats());

    let before = h.transport.stats();
    store.append_courtesy_note("s1", "b", "Called at 6pm", "desk").await.unwrap();
    assert_single_read(before, h.transport.stats());

    let before = h.transport.stats();
    store
        .update_guest_fields("s1", "b", [("notes", Value::from("Quiet room"))])
        .await
        .unwrap();
    assert_single_read(before, h.transport.stats());
}

// ============================================================================
// Position resolution
// ============================================================================

#[tokio::test]
async fn patch_follows_guest_after_concurrent_reorder() {
    let h = harness();
    h.seed_session(1);

    // The caller last saw [a, b]; another device inserts a guest at the front.
    let tablet = h.other_device("frontdesk-tablet");
    tablet
        .set(
            &layout::session_guests("s1"),
            Value::from(json!([
                {"id": "c", "name": "Cara"},
                {"id": "a", "name": "Ada", "room": "101"},
                {"id": "b", "name": "Brian", "room": "102"}
            ])),
        )
        .await
        .unwrap();

    let outcome = h.store.set_room_status("s1", "b", "clean", "hk").await.unwrap();
    assert_eq!(outcome, PatchOutcome::Applied { index: 2, fields: 3 });

    let guests = h.guests();
    assert_eq!(guests[2]["id"], json!("b"));
    assert_eq!(guests[2]["roomStatus"], json!("clean"));
    assert!(guests[0].get("roomStatus").is_none());
    assert!(guests[1].get("roomStatus").is_none());
}

#[tokio::test]
async fn patch_resolves_keys_in_sparse_lists() {
    let h = harness();
    h.backend.seed(
        &layout::session_guests("s1"),
        json!({"0": {"id": "a"}, "9": {"id": "b"}}),
    );

    let outcome = h
        .store
        .update_guest_fields("s1", "b", [("room", Value::from("204"))])
        .await
        .unwrap();
    assert_eq!(outcome, PatchOutcome::Applied { index: 9, fields: 1 });
    assert_eq!(
        h.backend.snapshot(&layout::guest_field("s1", 9, "room")),
        Some(json!("204"))
    );
}

#[tokio::test]
async fn patch_leaves_concurrent_changes_to_other_fields() {
    let h = harness();
    h.seed_session(1);
    let tablet = h.other_device("frontdesk-tablet");
    tablet
        .set(&layout::guest_field("s1", 0, "notes"), Value::from("VIP"))
        .await
        .unwrap();

    h.store.set_room_status("s1", "a", "clean", "hk").await.unwrap();

    let guests = h.guests();
    assert_eq!(guests[0]["notes"], json!("VIP"));
    assert_eq!(guests[0]["roomStatus"], json!("clean"));
    assert_eq!(guests[0]["lastStatusUpdatedBy"], json!("hk"));
    let modified = h
        .backend
        .snapshot(&layout::session_last_modified("s1"))
        .and_then(|v| v.as_i64())
        .unwrap();
    assert!(modified > 1);
}

#[tokio::test]
async fn missing_guest_is_not_found() {
    let h = harness();
    h.seed_session(1);
    let before = h.transport.stats();

    let err = h
        .store
        .set_guest_status("s1", "zz", "arrived", "desk")
        .await
        .unwrap_err();
    assert!(matches!(err, SyncError::NotFound(ref m) if m.contains("zz")));
    assert_eq!(h.transport.stats().update, before.update);
}

#[tokio::test]
async fn absent_values_are_written_as_deletions() {
    let h = harness();
    h.seed_session(1);
    h.store
        .update_guest_fields("s1", "a", [("room", Value::Absent), ("name", Value::from("Ada L."))])
        .await
        .unwrap();

    let guests = h.guests();
    assert!(guests[0].get("room").is_none());
    assert_eq!(guests[0]["name"], json!("Ada L."));
}

// ============================================================================
// Same-field races are last-write-wins
// ============================================================================

#[tokio::test]
async fn concurrent_same_field_patches_race_without_merge() {
    let h = harness();
    h.seed_session(1);
    let tablet_client = sync_client::SyncClient::new(h.other_device("frontdesk-tablet"));
    let tablet = crate::GuestRecordStore::new(tablet_client);

    let (first, second) = tokio::join!(
        h.store.set_room_status("s1", "a", "clean", "hk-ana"),
        tablet.set_room_status("s1", "a", "dirty", "hk-bo"),
    );
    assert!(first.unwrap().is_applied());
    assert!(second.unwrap().is_applied());

    // Whichever write landed last owns every field it wrote; the other is lost.
    let guests = h.guests();
    let guest = &guests[0];
    let status = guest["roomStatus"].as_str().unwrap();
    let by = guest["lastStatusUpdatedBy"].as_str().unwrap();
    assert!(matches!((status, by), ("clean", "hk-ana") | ("dirty", "hk-bo")));

    h.store.set_room_status("s1", "a", "inspected", "hk-ana").await.unwrap();
    tablet.set_room_status("s1", "a", "dirty", "hk-bo").await.unwrap();
    assert_eq!(h.guests()[0]["roomStatus"], json!("dirty"));
}

// ============================================================================
// Sub-lists
// ============================================================================

#[tokio::test]
async fn deliveries_append_and_flag_by_id() {
    let h = harness();
    h.seed_session(1);
    let store = &h.store;

    store
        .append_delivery("s1", "a", &Delivery::new("d1", "Flowers"))
        .await
        .unwrap();
    store
        .append_delivery("s1", "a", &Delivery::new("d2", "Wine"))
        .await
        .unwrap();
    store.set_delivery_flag("s1", "a", "d2", true, "porter").await.unwrap();

    let guests = h.guests();
    let deliveries = &guests[0]["deliveries"];
    assert_eq!(deliveries[0]["item"], json!("Flowers"));
    assert_eq!(deliveries[1]["delivered"], json!(true));
    assert_eq!(deliveries[1]["deliveredBy"], json!("porter"));
    assert!(deliveries[1]["deliveredAt"].is_i64());

    store.set_delivery_flag("s1", "a", "d2", false, "porter").await.unwrap();
    let guests = h.guests();
    let deliveries = &guests[0]["deliveries"];
    assert_eq!(deliveries[1]["delivered"], json!(false));
    assert!(deliveries[1].get("deliveredBy").is_none());

    let err = store
        .set_delivery_flag("s1", "a", "nope", true, "porter")
        .await
        .unwrap_err();
    assert!(matches!(err, SyncError::NotFound(_)));
}

#[tokio::test]
async fn courtesy_notes_append_after_last_entry() {
    let h = harness();
    h.seed_session(1);

    h.store.append_courtesy_note("s1", "b", "Welcome call", "desk").await.unwrap();
    h.store.append_courtesy_note("s1", "b", "Follow-up", "desk").await.unwrap();

    let session = h.store.fetch_session("s1").await.unwrap().unwrap();
    let notes: Vec<_> = session
        .guest("b")
        .unwrap()
        .courtesy_calls
        .iter()
        .map(|c| c.note.as_str())
        .collect();
    assert_eq!(notes, ["Welcome call", "Follow-up"]);
}
