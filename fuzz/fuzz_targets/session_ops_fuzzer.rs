//! Fuzz target for whole sessions in the simulated world
//!
//! Applies arbitrary operation sequences (intents, link drops, refused dials,
//! clock steps) to a world of four sessions and checks the standard
//! invariants after every step. Violations panic inside `SimWorld::apply`.

#![no_main]

use arbitrary::Arbitrary;
use evsync_client::Identity;
use evsync_harness::{InvariantRegistry, Operation, SimWorld};
use libfuzzer_sys::fuzz_target;

#[derive(Debug, Arbitrary)]
struct Scenario {
    seed: u64,
    ops: Vec<Operation>,
}

fuzz_target!(|scenario: Scenario| {
    let identities = vec![
        Identity::staff("advisor"),
        Identity::user("customer-a"),
        Identity::user("customer-b"),
        Identity::guest("guest-1"),
    ];
    let mut world =
        SimWorld::new(scenario.seed, identities).with_invariants(InvariantRegistry::standard());

    for op in scenario.ops.iter().take(256) {
        let _ = world.apply(op);
    }

    InvariantRegistry::standard().assert_all(&world.snapshot(), "end of scenario");
});
