use decety::images::ImageStore;
use decety::storage::DecetyStore;
use decety::types::ImageVariant;

/// Assert that an object exists at the given key.
pub async fn assert_object_exists(store: &DecetyStore, key: &str) {
    assert!(
        store.exists(key).await.expect("exists check failed"),
        "expected object at key '{key}' to exist"
    );
}

/// Assert that an object does NOT exist at the given key.
pub async fn assert_object_not_exists(store: &DecetyStore, key: &str) {
    assert!(
        !store.exists(key).await.expect("exists check failed"),
        "expected object at key '{key}' to NOT exist"
    );
}

/// Assert that every rendition of an image is stored.
pub async fn assert_image_stored(store: &DecetyStore, image_id: &str) {
    for variant in ImageVariant::ALL {
        assert_object_exists(store, &ImageStore::object_key(image_id, variant)).await;
    }
}

/// Assert that no rendition of an image is left behind.
pub async fn assert_image_purged(store: &DecetyStore, image_id: &str) {
    for variant in ImageVariant::ALL {
        assert_object_not_exists(store, &ImageStore::object_key(image_id, variant)).await;
    }
}

/// Assert the JSON envelope carries the given wire error and no result.
pub fn assert_envelope_error(body: &serde_json::Value, code: &str) {
    assert_eq!(body["error"], code, "unexpected envelope: {body}");
    assert!(body.get("result").is_none(), "error envelope carried a result: {body}");
}
