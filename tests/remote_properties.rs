//! Property access through a client proxy.

mod common;

use common::{start, start_enabled, STAGE_ID};
use remote_daq::error::{ErrorKind, RemoteError};
use serde_json::{json, Value};
use std::collections::BTreeMap;

#[tokio::test]
async fn test_read_default_and_write_back() {
    let harness = start_enabled().await;
    let stage = harness.proxy();

    assert_eq!(stage.read_property("speed").await.unwrap(), json!(5.0));
    stage.write_property("speed", json!(7.5)).await.unwrap();
    assert_eq!(stage.get::<f64>("speed").await.unwrap(), 7.5);
}

#[tokio::test]
async fn test_out_of_bounds_write_crops_or_rejects() {
    let harness = start_enabled().await;
    let stage = harness.proxy();

    // position crops to its upper bound
    stage.write_property("position", json!(250.0)).await.unwrap();
    assert_eq!(stage.read_property("position").await.unwrap(), json!(100.0));

    // speed rejects and keeps the previous value
    stage.set("speed", 3.0).await.unwrap();
    let err = stage.write_property("speed", json!(99.0)).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Validation);
    assert_eq!(stage.get::<f64>("speed").await.unwrap(), 3.0);
}

#[tokio::test]
async fn test_type_mismatch_is_validation_error() {
    let harness = start_enabled().await;
    let err = harness
        .proxy()
        .write_property("label", json!(42))
        .await
        .unwrap_err();
    assert!(matches!(err, RemoteError::Validation(_)));
}

#[tokio::test]
async fn test_readonly_and_constant_properties() {
    let harness = start();
    let stage = harness.proxy();

    let err = stage.write_property("status", json!("busy")).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Access);
    assert_eq!(stage.read_property("status").await.unwrap(), json!("idle"));

    assert_eq!(stage.read_property("serial").await.unwrap(), Value::Null);
    stage.write_property("serial", json!("SN-0042")).await.unwrap();
    let err = stage.write_property("serial", json!("SN-9999")).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Access);
    assert_eq!(stage.read_property("serial").await.unwrap(), json!("SN-0042"));
}

#[tokio::test]
async fn test_state_gated_write_then_allowed() {
    let harness = start();
    let stage = harness.proxy();

    let err = stage.write_property("position", json!(10.0)).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::State);
    assert_eq!(harness.thing.current_state().as_deref(), Some("DISABLED"));

    stage.invoke_action("enable", Value::Null).await.unwrap();
    stage.write_property("position", json!(10.0)).await.unwrap();
    assert_eq!(stage.read_property("position").await.unwrap(), json!(10.0));

    // the state itself is not a writable property
    let err = stage.write_property("state", json!("DISABLED")).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Access);
    assert_eq!(stage.read_property("state").await.unwrap(), json!("IDLE"));
}

#[tokio::test]
async fn test_batch_write_is_atomic() {
    let harness = start_enabled().await;
    let stage = harness.proxy();

    let mut values = BTreeMap::new();
    values.insert("position".to_string(), json!(20.0));
    values.insert("speed".to_string(), json!(42.0));
    values.insert("label".to_string(), json!("calibrated"));

    let err = stage.write_multiple_properties(values).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Validation);
    assert!(err.message().contains("1 of 3"), "{}", err);

    let current = stage
        .read_multiple_properties(&["position", "speed", "label"])
        .await
        .unwrap();
    assert_eq!(current["position"], json!(0.0));
    assert_eq!(current["speed"], json!(5.0));
    assert_eq!(current["label"], json!(""));
}

#[tokio::test]
async fn test_batch_write_applies_all() {
    let harness = start_enabled().await;
    let stage = harness.proxy();

    let values = BTreeMap::from([
        ("position".to_string(), json!(33.0)),
        ("label".to_string(), json!("ready")),
    ]);
    stage.write_multiple_properties(values).await.unwrap();
    assert_eq!(harness.thing.read_property("position").unwrap(), json!(33.0));
    assert_eq!(harness.thing.read_property("label").unwrap(), json!("ready"));
}

#[tokio::test]
async fn test_unknown_thing_and_property() {
    let harness = start();

    let err = harness
        .connection
        .proxy("no-such-thing")
        .read_property("position")
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);

    let err = harness.proxy().read_property("colour").await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);
}

#[tokio::test]
async fn test_description_precheck_rejects_foreign_names() {
    let harness = start();
    let stage = harness.proxy();

    let description = stage.load_description().await.unwrap();
    assert_eq!(description.id, STAGE_ID);
    assert!(description.has_property("position"));
    assert_eq!(description.resolve_event("moved"), Some("moved_event"));

    let before = harness.connection.pending_count();
    let err = stage.read_property("colour").await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);
    assert!(err.message().contains("colour"));
    assert_eq!(harness.connection.pending_count(), before);

    // with foreign attributes allowed the request goes out and the server answers
    let err = stage
        .clone()
        .with_foreign_attributes(true)
        .invoke_action("levitate", Value::Null)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);
}
