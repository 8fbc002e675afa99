//! Comprehensive property-based tests for pre-commit hook
//!
//! Core properties:
//! 1. Registry exactness: snapshot plus delivered deltas equal the visits made
//! 2. Batched and direct rewrites count the same as executing the original
//! 3. Wire output never carries zero counts
//! 4. Class filter full-match semantics

mod utils;

use linescope::filter::ClassFilter;
use linescope::planner::DispatchMode;
use linescope::registry::{DeltaListener, ListenerError, Registry, SourceCounts};
use linescope::vm::Value;
use linescope::wire::coverage_json;
use proptest::prelude::*;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

proptest! {
    #![proptest_config(ProptestConfig::with_cases(100))]

    #[test]
    fn prop_snapshot_plus_deltas_equals_visits(
        ops in prop::collection::vec((0usize..8, 0u64..5, any::<bool>()), 1..200),
        join_at in 0usize..200,
    ) {
        // Property: however visits, updates and a listener join interleave,
        // nothing is lost or counted twice
        let registry = Registry::new();
        let lines: Vec<_> = (0..8u32).map(|l| registry.register_line("p.java", l + 1)).collect();
        let mut expected = [0u64; 8];

        let delivered = Arc::new(Mutex::new(0u64));
        let sink = delivered.clone();
        let listener: Arc<dyn DeltaListener> =
            Arc::new(move |delta: &SourceCounts| -> Result<(), ListenerError> {
                *sink.lock().unwrap() += delta["p.java"].values().sum::<u64>();
                Ok(())
            });

        let mut snapshot_total = None;
        for (step, (line, count, update)) in ops.iter().enumerate() {
            if step == join_at {
                let snapshot = registry.current_snapshot(listener.clone());
                snapshot_total = Some(snapshot["p.java"].values().sum::<u64>());
            }
            registry.add_visits(lines[*line], *count);
            expected[*line] += count;
            if *update {
                registry.update_listeners(&mut SourceCounts::new());
            }
        }
        registry.update_listeners(&mut SourceCounts::new());

        let total: u64 = expected.iter().sum();
        let accumulated = registry.accumulated();
        for (slot, count) in expected.iter().enumerate() {
            prop_assert_eq!(accumulated["p.java"][&(slot as u32 + 1)], *count);
        }
        if let Some(snapshot_total) = snapshot_total {
            prop_assert_eq!(snapshot_total + *delivered.lock().unwrap(), total);
        }
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(50))]

    #[test]
    fn prop_loop_counts_match_iterations(n in 0i32..40, static_calls in any::<bool>()) {
        // Property: sum(n) visits the loop header n+1 times and the body n times
        let mode = if static_calls { DispatchMode::Static } else { DispatchMode::Dynamic };
        let (registry, mut machine) = utils::instrumented_machine(mode);
        machine.invoke(utils::CLASS, "sum", vec![Value::Int(n)]).unwrap();
        machine.invoke(utils::CLASS, "countdown", vec![Value::Int(n)]).unwrap();

        let counts = utils::line_counts(&registry);
        let n = n as u64;
        prop_assert_eq!(counts.get(&12).copied(), Some(n + 1));
        prop_assert_eq!(counts.get(&13).copied().unwrap_or(0), n);
        prop_assert_eq!(counts.get(&18).copied(), Some(n + 1));
        prop_assert_eq!(counts.get(&20).copied().unwrap_or(0), n);
    }

    #[test]
    fn prop_exception_after_iterations_keeps_counts(n in 0i32..30) {
        // Property: a batched method that throws still reports every visit
        let (registry, mut machine) = utils::instrumented_machine(DispatchMode::Auto);
        prop_assert!(machine.invoke(utils::CLASS, "explode", vec![Value::Int(n)]).is_err());

        let counts = utils::line_counts(&registry);
        let n = n as u64;
        prop_assert_eq!(counts.get(&31).copied(), Some(1));
        prop_assert_eq!(counts.get(&33).copied(), Some(n + 1));
        prop_assert_eq!(counts.get(&34).copied().unwrap_or(0), n);
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(100))]

    #[test]
    fn prop_wire_output_has_no_zero_counts(
        entries in prop::collection::vec(("[a-c]/[A-C]\\.java", 1u32..50, 0u64..3), 0..40),
    ) {
        // Property: every emitted count is positive and every emitted source
        // has at least one line
        let mut counts = SourceCounts::new();
        for (path, line, count) in &entries {
            counts.entry(path.clone()).or_insert_with(BTreeMap::new).insert(*line, *count);
        }
        let json = coverage_json(&counts);
        for (_, lines) in json.as_object().unwrap() {
            let lines = lines.as_object().unwrap();
            prop_assert!(!lines.is_empty());
            for (line, count) in lines {
                prop_assert!(line.parse::<u32>().is_ok());
                prop_assert!(count.as_u64().unwrap() > 0);
            }
        }
    }

    #[test]
    fn prop_class_pattern_is_full_match(name in "[a-z]{1,6}/[A-Z][a-z]{0,6}") {
        // Property: a pattern equal to the name matches, any extension of it does not
        let filter = ClassFilter::none().include_pattern(&regex::escape(&name)).unwrap();
        prop_assert!(filter.should_instrument(&name));
        let extended = format!("{name}x");
        prop_assert!(!filter.should_instrument(&extended));
    }
}
