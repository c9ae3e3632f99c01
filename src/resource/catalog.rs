//! Authoritative catalog of known slot types.

use std::collections::BTreeMap;

use crate::types::{Error, Result};

use super::slot::{SlotKind, SlotName, SlotType};

/// The list of slot names the cluster understands, with their unit kinds.
/// Ledger rows reference this catalog; unknown names are rejected up front.
#[derive(Debug, Clone, Default)]
pub struct SlotTypeCatalog {
    types: BTreeMap<SlotName, SlotKind>,
}

impl SlotTypeCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Catalog pre-seeded with the intrinsic slots every agent reports.
    pub fn with_defaults() -> Self {
        let mut catalog = Self::new();
        catalog.register(SlotType::new(SlotName::System("cpu".into()), SlotKind::Count));
        catalog.register(SlotType::new(SlotName::System("mem".into()), SlotKind::Bytes));
        catalog
    }

    /// Insert or replace a slot type.
    pub fn register(&mut self, slot_type: SlotType) {
        self.types.insert(slot_type.name, slot_type.kind);
    }

    pub fn contains(&self, name: &SlotName) -> bool {
        self.types.contains_key(name)
    }

    pub fn kind_of(&self, name: &SlotName) -> Option<SlotKind> {
        self.types.get(name).copied()
    }

    /// All known slot types, ordered by name.
    pub fn all_slot_types(&self) -> Vec<SlotType> {
        self.types
            .iter()
            .map(|(name, kind)| SlotType::new(name.clone(), *kind))
            .collect()
    }

    pub fn get_slot_type(&self, name: &SlotName) -> Result<SlotType> {
        self.types
            .get(name)
            .map(|kind| SlotType::new(name.clone(), *kind))
            .ok_or_else(|| Error::slot_type_not_found(name.to_string()))
    }

    /// Reject any slot name absent from the catalog.
    pub fn validate_names<'a>(&self, names: impl Iterator<Item = &'a SlotName>) -> Result<()> {
        for name in names {
            if !self.contains(name) {
                return Err(Error::slot_type_not_found(name.to_string()));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_cover_cpu_and_mem() {
        let catalog = SlotTypeCatalog::with_defaults();
        assert_eq!(
            catalog.kind_of(&"cpu".parse().unwrap()),
            Some(SlotKind::Count)
        );
        assert_eq!(
            catalog.kind_of(&"mem".parse().unwrap()),
            Some(SlotKind::Bytes)
        );
    }

    #[test]
    fn unknown_name_raises_slot_type_not_found() {
        let catalog = SlotTypeCatalog::with_defaults();
        let err = catalog
            .get_slot_type(&"cuda.shares".parse().unwrap())
            .unwrap_err();
        assert!(matches!(err, Error::SlotTypeNotFound(_)));
    }

    #[test]
    fn registered_types_are_listed_in_order() {
        let mut catalog = SlotTypeCatalog::with_defaults();
        catalog.register(SlotType::new("cuda.shares".parse().unwrap(), SlotKind::Count));
        let names: Vec<String> = catalog
            .all_slot_types()
            .iter()
            .map(|t| t.name.to_string())
            .collect();
        assert_eq!(names, vec!["cpu", "cuda.shares", "mem"]);
    }
}
