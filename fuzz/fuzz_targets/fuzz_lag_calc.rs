// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Fuzz target for consumer lag calculation.

#![no_main]

use libfuzzer_sys::fuzz_target;
use tenant_cache::stream::{calculate_lag_ms, parse_stream_id_timestamp};

fuzz_target!(|data: (&str, &str)| {
    let (delivered, latest) = data;

    let _ = parse_stream_id_timestamp(delivered);
    if let (Some(lag), Some(a), Some(b)) = (
        calculate_lag_ms(delivered, latest),
        parse_stream_id_timestamp(delivered),
        parse_stream_id_timestamp(latest),
    ) {
        assert_eq!(lag, b.saturating_sub(a));
    }
});
