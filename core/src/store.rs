//! Parameter store: one independently locked slot per declared parameter.
//!
//! The receive loop writes bounds and values as frames arrive; renderers and
//! the operator side read snapshots concurrently. A `set_conf` batch is applied
//! key by key, so a reader may observe part of a batch.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::error::{BridgeError, Result};
use crate::types::parameter::{Bound, ParamName, ParamValue, Parameter};


/// Point-in-time copy of every parameter, handed to collaborators.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoreSnapshot {
    pub params: BTreeMap<ParamName, Parameter>,
}


impl StoreSnapshot {
    pub fn get(&self, name: ParamName) -> Option<&Parameter> {
        self.params.get(&name)
    }

    pub fn value(&self, name: ParamName) -> Option<&ParamValue> {
        self.params.get(&name).and_then(|p| p.value.as_ref())
    }
}


pub struct ParameterStore {
    slots: [Mutex<Parameter>; ParamName::COUNT],
    ready_announced: AtomicBool,
}


impl Default for ParameterStore {
    fn default() -> Self {
        ParameterStore::new()
    }
}


impl ParameterStore {
    pub fn new() -> ParameterStore {
        ParameterStore {
            slots: std::array::from_fn(|i| Mutex::new(Parameter::new(ParamName::ALL[i]))),
            ready_announced: AtomicBool::new(false),
        }
    }

    fn slot(&self, name: ParamName) -> &Mutex<Parameter> {
        &self.slots[name as usize]
    }

    /// Copy of a parameter by wire name.
    pub fn get(&self, name: &str) -> Result<Parameter> {
        let name = ParamName::parse(name)?;
        Ok(self.param(name))
    }

    pub fn param(&self, name: ParamName) -> Parameter {
        self.slot(name).lock().clone()
    }

    pub fn set_min(&self, name: &str, raw: &str) -> Result<()> {
        self.set_bound(name, Bound::Min, raw)
    }

    pub fn set_max(&self, name: &str, raw: &str) -> Result<()> {
        self.set_bound(name, Bound::Max, raw)
    }

    pub fn set_default(&self, name: &str, raw: &str) -> Result<()> {
        self.set_bound(name, Bound::Default, raw)
    }

    /// Parse `raw` as the parameter's declared type and store it as a bound.
    /// On failure the previous bound is left in place.
    pub fn set_bound(&self, name: &str, bound: Bound, raw: &str) -> Result<()> {
        let (name, value) = parse_raw(name, raw)?;
        *self.slot(name).lock().bound_mut(bound) = Some(value);
        Ok(())
    }

    /// Parse `raw` as the parameter's declared type and store it as the
    /// current value.
    pub fn set_value(&self, name: &str, raw: &str) -> Result<()> {
        let (name, value) = parse_raw(name, raw)?;
        self.slot(name).lock().value = Some(value);
        Ok(())
    }

    /// Record an already-typed value, e.g. a local operator edit.
    pub fn update_value(&self, name: ParamName, value: ParamValue) {
        self.slot(name).lock().value = Some(value);
    }

    pub fn set_options(&self, name: ParamName, options: BTreeMap<u32, String>) {
        self.slot(name).lock().options = options;
    }

    /// True iff every declared parameter has min, max and default set.
    pub fn is_ready(&self) -> bool {
        self.slots.iter().all(|slot| slot.lock().is_configured())
    }

    /// Returns a snapshot the first time the store is observed ready, and
    /// `None` on every later call until `reset`.
    pub fn take_ready_announcement(&self) -> Option<StoreSnapshot> {
        if !self.is_ready() {
            return None;
        }
        self.ready_announced
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| self.snapshot())
    }

    pub fn ready_announced(&self) -> bool {
        self.ready_announced.load(Ordering::Acquire)
    }

    /// Clear every value and bound (options tables are kept) and re-arm the
    /// readiness announcement.
    pub fn reset(&self) {
        for slot in &self.slots {
            let mut p = slot.lock();
            p.value = None;
            p.value_min = None;
            p.value_max = None;
            p.value_default = None;
        }
        self.ready_announced.store(false, Ordering::Release);
    }

    pub fn snapshot(&self) -> StoreSnapshot {
        let params = ParamName::ALL
            .iter()
            .map(|&name| (name, self.param(name)))
            .collect();
        StoreSnapshot { params }
    }
}


fn parse_raw(name: &str, raw: &str) -> Result<(ParamName, ParamValue)> {
    let name = ParamName::parse(name)?;
    let value = name.kind().parse(raw).ok_or_else(|| BridgeError::InvalidValue {
        name: name.to_string(),
        raw: raw.to_string(),
    })?;
    Ok((name, value))
}


#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn configure_all(store: &ParameterStore) {
        for name in ParamName::ALL {
            store.set_min(name.as_str(), "1").unwrap();
            store.set_max(name.as_str(), "3").unwrap();
            store.set_default(name.as_str(), "2").unwrap();
        }
    }

    #[test]
    fn starts_empty_with_every_name() {
        let store = ParameterStore::new();
        let snap = store.snapshot();
        assert_eq!(snap.params.len(), ParamName::ALL.len());
        assert!(snap.params.values().all(|p| p.value.is_none() && !p.is_configured()));
        assert!(!store.is_ready());
    }

    #[test]
    fn get_unknown_name_fails() {
        let store = ParameterStore::new();
        assert!(matches!(
            store.get("pressure"),
            Err(BridgeError::UnknownParameter(_))
        ));
    }

    #[test]
    fn set_value_parses_declared_type() {
        let store = ParameterStore::new();
        store.set_value("fio2", "45.0").unwrap();
        store.set_value("brpm", "12.0").unwrap();
        assert_eq!(store.get("fio2").unwrap().value, Some(ParamValue::Float(45.0)));
        assert_eq!(store.get("brpm").unwrap().value, Some(ParamValue::Int(12)));
    }

    #[test]
    fn failed_parse_keeps_previous_value() {
        let store = ParameterStore::new();
        store.set_max("peep", "20").unwrap();
        let err = store.set_max("peep", "twenty").unwrap_err();
        assert!(matches!(err, BridgeError::InvalidValue { .. }));
        assert_eq!(store.get("peep").unwrap().value_max, Some(ParamValue::Int(20)));
    }

    #[test]
    fn two_of_three_bounds_never_ready() {
        let store = ParameterStore::new();
        for name in ParamName::ALL {
            store.set_min(name.as_str(), "1").unwrap();
            store.set_max(name.as_str(), "3").unwrap();
        }
        assert!(!store.is_ready());
        assert!(store.take_ready_announcement().is_none());

        for name in ParamName::ALL {
            store.set_default(name.as_str(), "2").unwrap();
        }
        assert!(store.is_ready());
    }

    #[test]
    fn one_missing_parameter_blocks_readiness() {
        let store = ParameterStore::new();
        configure_all(&store);
        store.reset();
        for name in ParamName::ALL.iter().filter(|n| **n != ParamName::Tf) {
            store.set_min(name.as_str(), "1").unwrap();
            store.set_max(name.as_str(), "3").unwrap();
            store.set_default(name.as_str(), "2").unwrap();
        }
        assert!(!store.is_ready());
    }

    #[test]
    fn ready_announcement_is_one_shot() {
        let store = ParameterStore::new();
        configure_all(&store);
        let snap = store.take_ready_announcement().expect("first announcement");
        assert!(snap.params.values().all(|p| p.is_configured()));
        assert!(store.take_ready_announcement().is_none());
        store.set_default("fio2", "21").unwrap();
        assert!(store.take_ready_announcement().is_none());
    }

    #[test]
    fn reset_rearms_announcement_and_keeps_options() {
        let store = ParameterStore::new();
        configure_all(&store);
        assert!(store.take_ready_announcement().is_some());

        store.reset();
        assert!(!store.is_ready());
        assert!(!store.ready_announced());
        assert_eq!(store.param(ParamName::Ier).options.len(), 5);

        configure_all(&store);
        assert!(store.take_ready_announcement().is_some());
    }

    #[test]
    fn snapshot_serializes_by_wire_name() {
        let store = ParameterStore::new();
        store.set_value("fio2", "30").unwrap();
        let json = serde_json::to_string(&store.snapshot()).unwrap();
        assert!(json.contains("\"fio2\""));
        assert!(json.contains("\"ier_i\""));
    }

    #[test]
    fn concurrent_writers_and_readers() {
        let store = Arc::new(ParameterStore::new());
        let writer = {
            let store = Arc::clone(&store);
            std::thread::spawn(move || {
                for i in 0..200 {
                    store.set_value("brpm", &i.to_string()).unwrap();
                }
            })
        };
        for _ in 0..200 {
            let _ = store.snapshot();
        }
        writer.join().unwrap();
        assert_eq!(store.param(ParamName::Brpm).value, Some(ParamValue::Int(199)));
    }
}
