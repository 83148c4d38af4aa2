//! Property tests for the operation algebra.

use proptest::prelude::*;
use serde_json::{json, Value};

use easygrid_core::Fields;
use easygrid_ops::{AtomicEdit, Operation, Path};

const KEYS: [&str; 4] = ["fldA", "fldB", "fldC", "fldD"];

fn fields_strategy() -> impl Strategy<Value = Fields> {
    proptest::collection::vec(proptest::option::of(-100i64..100), 4).prop_map(|values| {
        let mut fields = Fields::new();
        for (key, value) in KEYS.iter().zip(values) {
            if let Some(v) = value {
                fields.insert((*key).to_string(), json!(v));
            }
        }
        fields
    })
}

/// Builds an applicable operation against `fields`: per key, optionally a
/// set/clear edit whose old value matches the current state.
fn op_for(fields: &Fields, choices: &[Option<Option<i64>>]) -> Operation {
    let mut op = Operation::new();
    for (key, choice) in KEYS.iter().zip(choices) {
        if let Some(new) = choice {
            let old = fields.get(*key).cloned().unwrap_or(Value::Null);
            let new = new.map(|v| json!(v)).unwrap_or(Value::Null);
            if old == new {
                continue;
            }
            op.push(AtomicEdit::set_field(key, old, new));
        }
    }
    op
}

fn choice_strategy() -> impl Strategy<Value = Vec<Option<Option<i64>>>> {
    proptest::collection::vec(proptest::option::of(proptest::option::of(-100i64..100)), 4)
}

proptest! {
    #[test]
    fn apply_then_invert_restores(fields in fields_strategy(), choices in choice_strategy()) {
        let op = op_for(&fields, &choices);
        let changed = op.apply_to_data(&fields).unwrap();
        let restored = op.invert().unwrap().apply_to_data(&changed).unwrap();
        prop_assert_eq!(restored, fields);
    }

    #[test]
    fn compose_matches_sequential_apply(
        fields in fields_strategy(),
        first in choice_strategy(),
        second in choice_strategy(),
    ) {
        let a = op_for(&fields, &first);
        let mid = a.apply_to_data(&fields).unwrap();
        let b = op_for(&mid, &second);

        let sequential = b.apply_to_data(&mid).unwrap();
        let composed = a.compose(&b).apply_to_data(&fields).unwrap();
        prop_assert_eq!(sequential, composed);
    }

    #[test]
    fn numeric_add_is_additive(start in -100i64..100, x in -50i64..50, y in -50i64..50) {
        let mut fields = Fields::new();
        fields.insert("fldA".into(), json!(start));

        let a = Operation::from_edits(vec![AtomicEdit::number_add(Path::field("fldA"), x as f64)]);
        let b = Operation::from_edits(vec![AtomicEdit::number_add(Path::field("fldA"), y as f64)]);

        let sequential = b.apply_to_data(&a.apply_to_data(&fields).unwrap()).unwrap();
        let composed = a.compose(&b).apply_to_data(&fields).unwrap();
        prop_assert_eq!(sequential, composed);
    }
}
