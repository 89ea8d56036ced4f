//! Registry cache: identity per key, per-device isolation, concurrent first access.

mod common;

use std::sync::{Arc, Barrier};

use common::*;
use xattn::{DataType, DeviceOrdinal, DispatchConfig, DispatchError, SmVersion};

#[test]
fn test_same_key_same_instance() {
    let driver = driver(8, 0);
    let cache = cache(&driver, DispatchConfig::default());
    let a = cache.get_registry(DataType::Fp16, SmVersion::SM_80).unwrap();
    let b = cache.get_registry(DataType::Fp16, SmVersion::SM_80).unwrap();
    assert!(Arc::ptr_eq(&a, &b));
    assert_eq!(cache.registry_count(), 1);
    assert_eq!(driver.load_count(), 3);
}

#[test]
fn test_distinct_keys_distinct_instances() {
    let driver = driver(8, 0);
    let cache = cache(&driver, DispatchConfig::default());
    let fp16_80 = cache.get_registry(DataType::Fp16, SmVersion::SM_80).unwrap();
    let bf16_80 = cache.get_registry(DataType::Bf16, SmVersion::SM_80).unwrap();
    let fp16_90 = cache.get_registry(DataType::Fp16, SmVersion::SM_90).unwrap();
    assert!(!Arc::ptr_eq(&fp16_80, &bf16_80));
    assert!(!Arc::ptr_eq(&fp16_80, &fp16_90));
    assert!(bf16_80.is_empty());
    assert_eq!(fp16_90.len(), 2);
    assert_eq!(cache.registry_count(), 3);
}

#[test]
fn test_devices_are_isolated() {
    let driver = driver(8, 0);
    let cache = cache(&driver, DispatchConfig::default());
    let on_0 = cache.get_registry(DataType::Fp16, SmVersion::SM_80).unwrap();
    driver.set_current_device(DeviceOrdinal(1));
    let on_1 = cache.get_registry(DataType::Fp16, SmVersion::SM_80).unwrap();
    assert!(!Arc::ptr_eq(&on_0, &on_1));
    // Same kernels, separately loaded handles.
    let mut keys_0: Vec<_> = on_0.function_map().keys().copied().collect();
    let mut keys_1: Vec<_> = on_1.function_map().keys().copied().collect();
    keys_0.sort();
    keys_1.sort();
    assert_eq!(keys_0, keys_1);
    assert_eq!(driver.load_count(), 6);

    let again = cache.get_registry_on(DeviceOrdinal(0), DataType::Fp16, SmVersion::SM_80).unwrap();
    assert!(Arc::ptr_eq(&on_0, &again));
    assert_eq!(cache.registry_count(), 2);
}

#[test]
fn test_concurrent_first_access_builds_once() {
    let driver = driver(8, 0);
    let cache = cache(&driver, DispatchConfig::default());
    let threads = 8;
    let barrier = Arc::new(Barrier::new(threads));

    let handles: Vec<_> = (0..threads)
        .map(|_| {
            let cache = cache.clone();
            let barrier = barrier.clone();
            std::thread::spawn(move || {
                barrier.wait();
                cache.get_registry(DataType::Fp16, SmVersion::SM_80).unwrap()
            })
        })
        .collect();
    let registries: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();

    assert!(registries.windows(2).all(|w| Arc::ptr_eq(&w[0], &w[1])));
    assert_eq!(cache.registry_count(), 1);
    // Three images, each loaded by exactly one registry construction.
    assert_eq!(driver.load_count(), 3);
}

#[test]
fn test_failed_load_is_not_cached() {
    let driver = driver(8, 0);
    driver.fail_symbol("mha_fp16_hd128_beam4");
    let cache = cache(&driver, DispatchConfig::default());

    let err = cache.get_registry(DataType::Fp16, SmVersion::SM_80).unwrap_err();
    assert!(matches!(err, DispatchError::Driver(_)));
    assert_eq!(cache.registry_count(), 0);

    driver.clear_failures();
    let registry = cache.get_registry(DataType::Fp16, SmVersion::SM_80).unwrap();
    assert_eq!(registry.len(), 7);
    assert_eq!(cache.registry_count(), 1);
}
