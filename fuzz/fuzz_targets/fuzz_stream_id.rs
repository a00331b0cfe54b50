// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Fuzz target for stream ID ordering.
//!
//! Ordering must never panic and must stay antisymmetric, since the worker
//! uses it to advance its pending-entry cursor.

#![no_main]

use libfuzzer_sys::fuzz_target;
use std::cmp::Ordering;
use tenant_cache::stream::compare_stream_ids;

fuzz_target!(|data: (&str, &str)| {
    let (a, b) = data;

    let ab = compare_stream_ids(a, b);
    let ba = compare_stream_ids(b, a);

    match ab {
        Ordering::Less => assert_ne!(ba, Ordering::Less),
        Ordering::Greater => assert_ne!(ba, Ordering::Greater),
        Ordering::Equal => {}
    }

    assert_eq!(compare_stream_ids(a, a), Ordering::Equal);
});
