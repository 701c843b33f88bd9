mod common;

use chrono::Utc;
use common::{date, full_series, range, scenes_for_slots, test_settings, ScriptedProvider};
use mapflow_core::cache::{
    CacheEntry, CacheKey, CacheLookup, FeatureCache, Origin, PointFeatures,
};
use mapflow_core::fetch::{FetchAdapter, FetchStatus, PointResponse, Scene};
use mapflow_core::object_store::ObjectStore;
use mapflow_core::shape::TimestepQuality;
use mapflow_core::types::{Label, LabeledPoint, PointId};

fn point(lat: f64, lon: f64) -> LabeledPoint {
    LabeledPoint {
        id: PointId::derive(lat, lon, "", 4),
        latitude: lat,
        longitude: lon,
        observation_date: date(2021, 1, 15),
        label: Label::Class("maize".to_string()),
        source_dataset: "survey".to_string(),
        row: 1,
    }
}

fn entry(key: &CacheKey, point: &LabeledPoint, status: FetchStatus, scenes: Vec<Scene>) -> CacheEntry {
    CacheEntry {
        cache_key: key.clone(),
        point_id: point.id.clone(),
        date_range: range(),
        provider_version: "v1".to_string(),
        bands: common::bands(),
        status,
        observed_slots: 0,
        scenes,
        fetched_at: Utc::now(),
    }
}

#[tokio::test]
async fn second_lookup_is_served_without_the_provider() {
    let dir = tempfile::tempdir().unwrap();
    let settings = test_settings(dir.path());
    let store = ObjectStore::open(dir.path()).unwrap();
    let cache = FeatureCache::new(store, &settings);
    let provider = ScriptedProvider::complete();
    let adapter = FetchAdapter::new(&provider, &settings);
    let target = point(1.0, 2.0);

    let first = cache.get_or_fetch(&target, &range(), &adapter).await.unwrap();
    let second = cache.get_or_fetch(&target, &range(), &adapter).await.unwrap();

    assert_eq!(provider.calls(), 1);
    match (first, second) {
        (
            PointFeatures::Ready { vector: fresh, origin: Origin::Provider },
            PointFeatures::Ready { vector: cached, origin: Origin::Cache },
        ) => {
            assert_eq!(fresh, cached);
            assert_eq!(cached.shape(), (2, 10));
            assert_eq!(cached.count(TimestepQuality::Observed), 10);
        }
        other => panic!("unexpected features {other:?}"),
    }
}

#[tokio::test]
async fn concurrent_commits_leave_one_object() {
    let dir = tempfile::tempdir().unwrap();
    let settings = test_settings(dir.path());
    let store = ObjectStore::open(dir.path()).unwrap();
    let cache = FeatureCache::new(store.clone(), &settings);
    let target = point(1.0, 2.0);
    let key = cache.key_for(&target.id, &range());

    let first = entry(&key, &target, FetchStatus::Complete, full_series());
    let mut second = first.clone();
    second.scenes = scenes_for_slots(&[0, 1, 2, 3, 4, 5, 6, 7, 8, 9]);
    second.fetched_at = Utc::now() + chrono::Duration::seconds(5);

    let (a, b) = tokio::join!(cache.commit(first), cache.commit(second));
    let (a, b) = (a.unwrap(), b.unwrap());

    assert_eq!(a, b);
    assert_eq!(store.list_prefix(ObjectStore::CACHE_PREFIX).unwrap().len(), 1);
}

#[tokio::test]
async fn separate_handles_agree_on_the_first_commit() {
    let dir = tempfile::tempdir().unwrap();
    let settings = test_settings(dir.path());
    let left = FeatureCache::new(ObjectStore::open(dir.path()).unwrap(), &settings);
    let right = FeatureCache::new(ObjectStore::open(dir.path()).unwrap(), &settings);
    let target = point(3.0, 4.0);
    let key = left.key_for(&target.id, &range());

    let winner = left
        .commit(entry(&key, &target, FetchStatus::Complete, full_series()))
        .await
        .unwrap();
    let loser = entry(&key, &target, FetchStatus::Complete, scenes_for_slots(&[0]));
    let seen = right.commit(loser).await.unwrap();

    assert_eq!(seen, winner);
}

#[tokio::test]
async fn partial_entries_are_never_overwritten() {
    let dir = tempfile::tempdir().unwrap();
    let settings = test_settings(dir.path());
    let store = ObjectStore::open(dir.path()).unwrap();
    let cache = FeatureCache::new(store.clone(), &settings);
    let target = point(5.0, 6.0);
    let key = cache.key_for(&target.id, &range());

    let original = cache
        .commit(entry(&key, &target, FetchStatus::Partial, scenes_for_slots(&[0, 1, 2, 3, 4, 5, 6])))
        .await
        .unwrap();
    let replayed = cache
        .commit(entry(&key, &target, FetchStatus::Partial, scenes_for_slots(&[0, 1, 2, 3, 4, 5, 6, 7])))
        .await
        .unwrap();

    assert_eq!(replayed, original);
    assert!(matches!(cache.lookup(&key).unwrap(), CacheLookup::Partial(found) if found == original));
    assert!(!cache.needs_fetch(&cache.lookup(&key).unwrap()));
}

#[tokio::test]
async fn partial_retry_fills_the_complete_slot() {
    let dir = tempfile::tempdir().unwrap();
    let mut settings = test_settings(dir.path());
    settings.cache.retry_partial = true;
    let store = ObjectStore::open(dir.path()).unwrap();
    let cache = FeatureCache::new(store.clone(), &settings);
    let target = point(7.0, 8.0);
    let key = cache.key_for(&target.id, &range());

    cache
        .commit(entry(&key, &target, FetchStatus::Partial, scenes_for_slots(&[0, 1, 2, 3, 4, 5, 6, 7])))
        .await
        .unwrap();
    assert!(cache.needs_fetch(&cache.lookup(&key).unwrap()));

    let provider = ScriptedProvider::complete();
    let adapter = FetchAdapter::new(&provider, &settings);
    let features = cache.get_or_fetch(&target, &range(), &adapter).await.unwrap();

    assert_eq!(provider.calls(), 1);
    assert!(matches!(
        features,
        PointFeatures::Ready { ref vector, .. } if vector.status == FetchStatus::Complete
    ));
    assert!(store.exists(&key.partial_key()).unwrap());
    assert!(store.exists(&key.complete_key()).unwrap());
    assert!(matches!(cache.lookup(&key).unwrap(), CacheLookup::Complete(_)));
}

#[tokio::test]
async fn failed_partial_retry_falls_back_to_the_stale_entry() {
    let dir = tempfile::tempdir().unwrap();
    let mut settings = test_settings(dir.path());
    settings.cache.retry_partial = true;
    let cache = FeatureCache::new(ObjectStore::open(dir.path()).unwrap(), &settings);
    let target = point(7.5, 8.5);
    let key = cache.key_for(&target.id, &range());

    cache
        .commit(entry(&key, &target, FetchStatus::Partial, scenes_for_slots(&[0, 1, 2, 3, 4, 5, 6, 7])))
        .await
        .unwrap();

    let provider = ScriptedProvider::new(|_| PointResponse::Unavailable("busy".to_string()));
    let adapter = FetchAdapter::new(&provider, &settings);
    let features = cache.get_or_fetch(&target, &range(), &adapter).await.unwrap();

    assert!(matches!(
        features,
        PointFeatures::Ready { origin: Origin::Cache, ref vector } if vector.status == FetchStatus::Partial
    ));
}

#[tokio::test]
async fn failed_fetches_are_not_cached() {
    let dir = tempfile::tempdir().unwrap();
    let settings = test_settings(dir.path());
    let store = ObjectStore::open(dir.path()).unwrap();
    let cache = FeatureCache::new(store.clone(), &settings);
    let provider = ScriptedProvider::new(|_| PointResponse::Rejected("ocean".to_string()));
    let adapter = FetchAdapter::new(&provider, &settings);

    let features = cache.get_or_fetch(&point(0.5, 0.5), &range(), &adapter).await.unwrap();

    assert!(matches!(features, PointFeatures::Failed { ref error, .. } if error.is_permanent()));
    assert!(store.list_prefix(ObjectStore::CACHE_PREFIX).unwrap().is_empty());
}

#[test]
fn keys_change_with_provider_version_and_bands() {
    let id = PointId::from("abc");
    let v1 = CacheKey::derive(&id, &range(), "v1", &common::bands());
    let v2 = CacheKey::derive(&id, &range(), "v2", &common::bands());
    let other_bands = CacheKey::derive(&id, &range(), "v1", &["B4".to_string()]);

    assert_eq!(v1, CacheKey::derive(&id, &range(), "v1", &common::bands()));
    assert_ne!(v1, v2);
    assert_ne!(v1, other_bands);
    assert_eq!(CacheKey::parse(v1.as_str()), Some(v1.clone()));
    assert_eq!(CacheKey::parse("not-a-key"), None);
    assert!(v1.complete_key().starts_with(&format!("cache/{}/", &v1.as_str()[..2])));
    assert!(v1.partial_key().ends_with(".partial.json"));
}

#[test]
fn provider_version_override_moves_every_key() {
    let dir = tempfile::tempdir().unwrap();
    let settings = test_settings(dir.path());
    let store = ObjectStore::open(dir.path()).unwrap();
    let current = FeatureCache::new(store.clone(), &settings);
    let bumped = FeatureCache::with_provider_version(store, &settings, "v2");
    let id = PointId::from("abc");

    assert_eq!(bumped.provider_version(), "v2");
    assert_ne!(current.key_for(&id, &range()), bumped.key_for(&id, &range()));
}
