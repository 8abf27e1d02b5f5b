//! Fuzz target for WAL position parsing.
//!
//! Positions arrive as text from peer queries. Parsing must never panic,
//! and anything it accepts must print back to an equal position.

#![no_main]

use libfuzzer_sys::fuzz_target;
use pg_replication_agent::Lsn;

fuzz_target!(|data: (&str, u64)| {
    let (text, raw) = data;

    if let Ok(lsn) = text.parse::<Lsn>() {
        let printed = lsn.to_string();
        assert_eq!(printed.parse::<Lsn>().ok(), Some(lsn));
    }

    // Every position we print is one we can read.
    let printed = Lsn(raw).to_string();
    assert_eq!(printed.parse::<Lsn>().ok(), Some(Lsn(raw)));
});
