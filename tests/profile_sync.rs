mod common;

use common::harness;
use kapsule::hypervisor::{build_profile, ProfileSyncResult, BASE_PROFILE_NAME};
use kapsule::HypervisorError;

const HASH_KEY: &str = "user.kapsule.profile-hash";

#[tokio::test]
async fn test_profile_is_created_then_left_alone() {
    let h = harness();

    assert_eq!(h.service.ensure_profile().await.unwrap(), ProfileSyncResult::Created);
    let stored = h.hv.state().profiles[BASE_PROFILE_NAME].clone();
    assert_eq!(stored, build_profile().unwrap());
    assert_eq!(stored.config["security.privileged"], "true");

    assert_eq!(h.service.ensure_profile().await.unwrap(), ProfileSyncResult::Unchanged);
    assert!(!h.hv.calls().iter().any(|c| c.starts_with("update_profile")));
}

#[tokio::test]
async fn test_stale_hash_triggers_update() {
    let h = harness();
    let mut stale = build_profile().unwrap();
    stale.config.insert(HASH_KEY.to_string(), "0000000000000000".to_string());
    stale.config.remove("security.nesting");
    h.hv.state().profiles.insert(BASE_PROFILE_NAME.to_string(), stale);

    assert_eq!(h.service.ensure_profile().await.unwrap(), ProfileSyncResult::Updated);
    assert_eq!(h.hv.state().profiles[BASE_PROFILE_NAME], build_profile().unwrap());
    assert_eq!(h.service.ensure_profile().await.unwrap(), ProfileSyncResult::Unchanged);
}

#[tokio::test]
async fn test_missing_hash_counts_as_outdated() {
    let h = harness();
    let mut old = build_profile().unwrap();
    old.config.remove(HASH_KEY);
    h.hv.state().profiles.insert(BASE_PROFILE_NAME.to_string(), old);

    assert_eq!(h.service.ensure_profile().await.unwrap(), ProfileSyncResult::Updated);
}

#[tokio::test]
async fn test_hypervisor_failure_carries_context() {
    let h = harness();
    h.hv.fail_on("profile_exists", HypervisorError::new("connection refused"));

    let err = h.service.ensure_profile().await.unwrap_err();
    assert_eq!(err.to_string(), "Failed to query profiles: connection refused");
}
