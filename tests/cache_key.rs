use relevance_sim::cache::{DiffCacheKey, ALGORITHM_VERSION};

#[test]
fn diff_cache_key_is_stable_and_sensitive_to_inputs() {
    let key1 = DiffCacheKey::new(Some("run_a"), "run_b");
    let key2 = DiffCacheKey::new(Some("run_a"), "run_b");
    assert_eq!(key1.key_hash, key2.key_hash);
    assert_eq!(key1.algorithm_version, ALGORITHM_VERSION);

    let key3 = DiffCacheKey::new(Some("run_a"), "run_c");
    assert_ne!(key1.key_hash, key3.key_hash);
}

#[test]
fn diff_cache_key_depends_on_direction() {
    let ab = DiffCacheKey::new(Some("a"), "b");
    let ba = DiffCacheKey::new(Some("b"), "a");
    assert_ne!(ab.key_hash, ba.key_hash);
}

#[test]
fn diff_cache_key_changes_with_algorithm_version() {
    let current = DiffCacheKey::new(Some("a"), "b");
    let older = DiffCacheKey::with_version(Some("a"), "b", "diffsim-v0");
    assert_ne!(current.key_hash, older.key_hash);
}

#[test]
fn empty_baseline_never_collides_with_a_named_submission() {
    let baseline = DiffCacheKey::new(None, "b");
    let named_none = DiffCacheKey::new(Some("none"), "b");
    let named_empty = DiffCacheKey::new(Some(""), "b");
    assert_ne!(baseline.key_hash, named_none.key_hash);
    assert_ne!(baseline.key_hash, named_empty.key_hash);
    assert_eq!(baseline.before_name, None);
}
