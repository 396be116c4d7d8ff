// Store/heap consistency property tests.
//
// Model: HashMap<key, Expiry> of what should be live.
// Operations: set_permanent, set_temporary, set_expiry (future, past and
// permanent), make_permanent, remove, pop_due at an advancing clock.
// After every step:
//  - Store::assert_consistent() scans the whole heap: each slot's entry
//    agrees on its heap_pos, only temporary entries are tracked, parents
//    never expire after children, and the root is the minimum expiry.
//  - len() and every key's expiry match the model.
use super::engine::{Expiry, Store};
use proptest::prelude::*;
use std::collections::HashMap;
use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug, Clone)]
enum Op {
    SetPermanent(u8),
    SetTemporary(u8, u16),
    SetExpiry(u8, u16),
    SetExpiryPast(u8),
    SetExpiryPermanent(u8),
    MakePermanent(u8),
    Remove(u8),
    Advance(u16),
}

fn op() -> impl Strategy<Value = Op> {
    let key = 0u8..16;
    prop_oneof![
        key.clone().prop_map(Op::SetPermanent),
        (key.clone(), 1u16..1000).prop_map(|(k, ms)| Op::SetTemporary(k, ms)),
        (key.clone(), 1u16..1000).prop_map(|(k, ms)| Op::SetExpiry(k, ms)),
        key.clone().prop_map(Op::SetExpiryPast),
        key.clone().prop_map(Op::SetExpiryPermanent),
        key.clone().prop_map(Op::MakePermanent),
        key.prop_map(Op::Remove),
        (0u16..300).prop_map(Op::Advance),
    ]
}

proptest! {
    #[test]
    fn prop_store_heap_consistent(ops in proptest::collection::vec(op(), 1..200)) {
        let base = Instant::now();
        let mut now = base;
        let mut store: Store<u8, u32> = Store::new();
        let mut model: HashMap<u8, Expiry> = HashMap::new();
        let at = |now: Instant, ms: u16| Expiry::At(now + Duration::from_millis(ms as u64));

        for (step, op) in ops.into_iter().enumerate() {
            let value = step as u32;
            match op {
                Op::SetPermanent(k) => {
                    store.set_permanent(k, value);
                    model.insert(k, Expiry::Permanent);
                }
                Op::SetTemporary(k, ms) => {
                    let _ = store.set_temporary(k, value, at(now, ms));
                    model.insert(k, at(now, ms));
                }
                Op::SetExpiry(k, ms) => {
                    let (live, _) = store.set_expiry(&k, at(now, ms), now);
                    prop_assert_eq!(live, model.contains_key(&k));
                    if let Some(e) = model.get_mut(&k) {
                        *e = at(now, ms);
                    }
                }
                Op::SetExpiryPast(k) => {
                    let (live, _) = store.set_expiry(&k, Expiry::At(now), now);
                    prop_assert!(!live);
                    model.remove(&k);
                }
                Op::SetExpiryPermanent(k) => {
                    let (live, _) = store.set_expiry(&k, Expiry::Permanent, now);
                    prop_assert_eq!(live, model.contains_key(&k));
                    if let Some(e) = model.get_mut(&k) {
                        *e = Expiry::Permanent;
                    }
                }
                Op::MakePermanent(k) => {
                    let found = store.make_permanent(&k);
                    prop_assert_eq!(found, model.contains_key(&k));
                    if let Some(e) = model.get_mut(&k) {
                        *e = Expiry::Permanent;
                    }
                }
                Op::Remove(k) => {
                    prop_assert_eq!(store.remove(&k), model.remove(&k).is_some());
                }
                Op::Advance(ms) => {
                    now += Duration::from_millis(ms as u64);
                    let due = store.pop_due(now);
                    let mut expected: Vec<(Expiry, u8)> = model
                        .iter()
                        .filter(|(_, e)| e.is_due(now))
                        .map(|(k, e)| (*e, *k))
                        .collect();
                    expected.sort();
                    prop_assert_eq!(due.len(), expected.len());
                    // Popped in non-decreasing expiry order.
                    let popped: Vec<Expiry> = due.iter().map(|(k, _)| model[k]).collect();
                    prop_assert!(popped.windows(2).all(|w| w[0] <= w[1]));
                    for (k, _) in &due {
                        model.remove(k);
                    }
                }
            }

            store.assert_consistent();
            prop_assert_eq!(store.len(), model.len());
            for (k, e) in &model {
                prop_assert_eq!(store.get(k).map(|(_, exp)| exp), Some(*e));
            }
        }
    }
}
