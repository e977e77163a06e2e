use kapsule::options::{apply_assignment, create_schema_json, parse_options, CREATE_SCHEMA};
use kapsule::{ContainerOptions, OptionValidationError};
use serde_json::{json, Map, Value};

fn raw(v: Value) -> Map<String, Value> {
    v.as_object().cloned().unwrap()
}

#[test]
fn test_empty_input_yields_schema_defaults() {
    let opts = parse_options(&Map::new()).unwrap();
    assert_eq!(opts, ContainerOptions::default());
    assert!(!opts.session_mode());
    assert!(!opts.dbus_mux());
    assert!(opts.host_rootfs());
    assert!(opts.mount_home());
    assert!(opts.custom_mounts().is_empty());
    assert!(opts.gpu());
    assert!(opts.nvidia_drivers());
}

#[test]
fn test_unknown_keys_are_all_named() {
    let err = parse_options(&raw(json!({"zeta": 1, "alpha": true, "gpu": false}))).unwrap_err();
    assert_eq!(
        err,
        OptionValidationError::UnknownOptions(vec!["alpha".to_string(), "zeta".to_string()])
    );
    assert_eq!(err.to_string(), "Unknown options: alpha, zeta");
}

#[test]
fn test_wrong_types_are_rejected() {
    let err = parse_options(&raw(json!({"gpu": "yes"}))).unwrap_err();
    assert_eq!(err.to_string(), "Option 'gpu' must be boolean, got string");

    let err = parse_options(&raw(json!({"custom_mounts": "/srv"}))).unwrap_err();
    assert_eq!(err.to_string(), "Option 'custom_mounts' must be array, got string");

    let err = parse_options(&raw(json!({"custom_mounts": ["/srv", 3]}))).unwrap_err();
    assert_eq!(err.to_string(), "custom_mounts[1] must be a string, got number");
}

#[test]
fn test_dbus_mux_implies_session_mode() {
    let opts = parse_options(&raw(json!({"dbus_mux": true}))).unwrap();
    assert!(opts.dbus_mux());
    assert!(opts.session_mode());

    let opts = parse_options(&raw(json!({"dbus_mux": true, "session_mode": false}))).unwrap();
    assert!(opts.session_mode());
}

#[test]
fn test_dbus_mux_needs_host_rootfs() {
    let err = parse_options(&raw(json!({"dbus_mux": true, "host_rootfs": false}))).unwrap_err();
    assert_eq!(err, OptionValidationError::MuxRequiresHostRootfs);
}

#[test]
fn test_nvidia_drivers_need_gpu() {
    let err = parse_options(&raw(json!({"gpu": false}))).unwrap_err();
    assert_eq!(err.to_string(), "nvidia_drivers requires gpu to be enabled");

    let opts = parse_options(&raw(json!({"gpu": false, "nvidia_drivers": false}))).unwrap();
    assert!(!opts.gpu());
}

#[test]
fn test_assignments_coerce_by_schema_type() {
    let mut m = Map::new();
    apply_assignment(&mut m, "gpu=no").unwrap();
    apply_assignment(&mut m, "nvidia_drivers=0").unwrap();
    apply_assignment(&mut m, "custom_mounts=/srv/a").unwrap();
    apply_assignment(&mut m, "custom_mounts=/srv/b").unwrap();
    assert_eq!(
        Value::Object(m.clone()),
        json!({"gpu": false, "nvidia_drivers": false, "custom_mounts": ["/srv/a", "/srv/b"]})
    );
    let opts = parse_options(&m).unwrap();
    assert_eq!(opts.custom_mounts(), ["/srv/a", "/srv/b"]);

    assert!(matches!(
        apply_assignment(&mut m, "gpu=maybe"),
        Err(OptionValidationError::InvalidValue { .. })
    ));
    assert!(matches!(
        apply_assignment(&mut m, "gpu"),
        Err(OptionValidationError::InvalidAssignment(_))
    ));
    assert!(matches!(
        apply_assignment(&mut m, "bogus=1"),
        Err(OptionValidationError::UnknownOptions(_))
    ));
}

#[test]
fn test_schema_document_lists_every_option() {
    let doc: Value = serde_json::from_str(&create_schema_json().unwrap()).unwrap();
    let keys: Vec<String> = doc["sections"]
        .as_array()
        .unwrap()
        .iter()
        .flat_map(|s| s["options"].as_array().unwrap().iter())
        .map(|o| o["key"].as_str().unwrap().to_string())
        .collect();
    let expected: Vec<String> = CREATE_SCHEMA.options().map(|o| o.key.to_string()).collect();
    assert_eq!(keys, expected);
    assert_eq!(
        keys,
        vec![
            "session_mode",
            "dbus_mux",
            "host_rootfs",
            "mount_home",
            "custom_mounts",
            "gpu",
            "nvidia_drivers"
        ]
    );
}
