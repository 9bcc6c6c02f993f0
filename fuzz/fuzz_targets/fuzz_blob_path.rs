//! Fuzz target: blob path normalization and unique naming.
//!
//! Accepted paths never contain `..` segments or a leading slash, and a
//! unique name keeps the directory and extension of its input.

#![no_main]

use keel_store::blob::{content_type_for, normalize_path, unique_name};
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let Ok(raw) = std::str::from_utf8(data) else {
        return;
    };
    let Ok(path) = normalize_path(raw) else {
        return;
    };
    assert!(!path.starts_with('/'), "normalized path must be relative: {path:?}");
    assert!(
        !path.split('/').any(|segment| segment == ".."),
        "normalized path must not escape: {path:?}"
    );

    let unique = unique_name(&path);
    assert_ne!(unique, path);
    if let Some((dir, _)) = path.rsplit_once('/') {
        assert!(unique.starts_with(&format!("{dir}/")), "directory lost: {unique:?}");
    }
    assert_eq!(content_type_for(&unique), content_type_for(&path), "extension lost: {unique:?}");
});
