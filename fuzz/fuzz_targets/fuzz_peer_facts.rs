//! Fuzz target for peer bag parsing.
//!
//! Peer bags are written by other agents, possibly older or broken ones.
//! Parsing never panics, and a parsed bag survives being published again.

#![no_main]

use libfuzzer_sys::fuzz_target;
use pg_replication_agent::relation::WireBag;
use pg_replication_agent::PeerFacts;

fuzz_target!(|entries: Vec<(String, String)>| {
    let bag: WireBag = entries.into_iter().collect();
    let facts = PeerFacts::from_wire(&bag);

    assert_ne!(facts.port, Some(0));
    assert_eq!(PeerFacts::from_wire(&facts.to_wire()), facts);
});
