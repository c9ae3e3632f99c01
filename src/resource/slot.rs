//! Resource slot names and quantity maps.
//!
//! A slot is a named dimension of capacity (`cpu`, `mem`, `cuda.shares`,
//! `cuda.device:mig-10g`). Quantities are exact decimals; maps auto-fill
//! missing keys with zero on comparison and arithmetic.

use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;
use std::ops::{Add, AddAssign, Sub, SubAssign};
use std::str::FromStr;

use rust_decimal::Decimal;
use serde::de::{self, Deserializer, MapAccess, Visitor};
use serde::ser::{SerializeMap, Serializer};
use serde::{Deserialize, Serialize};

use crate::types::{Error, Result};

/// Unit kind of a slot: discrete count or byte size.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SlotKind {
    Count,
    Bytes,
}

/// A parsed slot name: `device[.major[:minor]]`.
///
/// A name containing a dot refers to an accelerator resource
/// (`cuda.shares`, `cuda.device:mig-10g`); anything else is a system
/// resource (`cpu`, `mem`).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum SlotName {
    System(String),
    Accelerator {
        device: String,
        major: String,
        minor: Option<String>,
    },
}

impl SlotName {
    /// The device component (`cpu`, `cuda`, `rocm`, ...).
    pub fn device(&self) -> &str {
        match self {
            SlotName::System(device) => device,
            SlotName::Accelerator { device, .. } => device,
        }
    }

    pub fn is_accelerator(&self) -> bool {
        matches!(self, SlotName::Accelerator { .. })
    }

    fn parts(&self) -> (&str, Option<&str>, Option<&str>) {
        match self {
            SlotName::System(device) => (device, None, None),
            SlotName::Accelerator {
                device,
                major,
                minor,
            } => (device, Some(major.as_str()), minor.as_deref()),
        }
    }
}

fn valid_component(s: &str) -> bool {
    !s.is_empty()
        && s.chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-'))
}

impl FromStr for SlotName {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.split_once('.') {
            None => {
                if !valid_component(s) {
                    return Err(Error::validation(format!("invalid slot name: {s:?}")));
                }
                Ok(SlotName::System(s.to_string()))
            }
            Some((device, rest)) => {
                let (major, minor) = match rest.split_once(':') {
                    None => (rest, None),
                    Some((major, minor)) => (major, Some(minor)),
                };
                if !valid_component(device)
                    || !valid_component(major)
                    || !minor.map_or(true, valid_component)
                {
                    return Err(Error::validation(format!("invalid slot name: {s:?}")));
                }
                Ok(SlotName::Accelerator {
                    device: device.to_string(),
                    major: major.to_string(),
                    minor: minor.map(str::to_string),
                })
            }
        }
    }
}

impl fmt::Display for SlotName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SlotName::System(device) => write!(f, "{device}"),
            SlotName::Accelerator {
                device,
                major,
                minor: None,
            } => write!(f, "{device}.{major}"),
            SlotName::Accelerator {
                device,
                major,
                minor: Some(minor),
            } => write!(f, "{device}.{major}:{minor}"),
        }
    }
}

// Ordered by canonical string form so map iteration matches serialized order.
impl Ord for SlotName {
    fn cmp(&self, other: &Self) -> Ordering {
        self.parts().cmp(&other.parts())
    }
}

impl PartialOrd for SlotName {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Serialize for SlotName {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for SlotName {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(de::Error::custom)
    }
}

/// A named slot with its unit kind, as listed in the slot-type catalog.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SlotType {
    pub name: SlotName,
    pub kind: SlotKind,
}

impl SlotType {
    pub fn new(name: SlotName, kind: SlotKind) -> Self {
        Self { name, kind }
    }
}

/// A mapping of slot names to decimal quantities.
///
/// Missing keys read as zero; equality, arithmetic, and containment checks
/// operate over the union of both key sets. Serialized as a map of raw
/// decimal strings.
#[derive(Debug, Clone, Default)]
pub struct ResourceSlot(BTreeMap<SlotName, Decimal>);

// Zero-filled equality: an explicit zero entry equals an absent key.
impl PartialEq for ResourceSlot {
    fn eq(&self, other: &Self) -> bool {
        self.union_names(other)
            .all(|name| self.get(name) == other.get(name))
    }
}

impl Eq for ResourceSlot {}

impl ResourceSlot {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse `(name, quantity)` string pairs into a slot map.
    pub fn from_pairs<'a, I>(pairs: I) -> Result<Self>
    where
        I: IntoIterator<Item = (&'a str, &'a str)>,
    {
        let mut out = BTreeMap::new();
        for (name, quantity) in pairs {
            let name: SlotName = name.parse()?;
            let quantity = Decimal::from_str(quantity)
                .map_err(|e| Error::validation(format!("invalid quantity for {name}: {e}")))?;
            out.insert(name, quantity);
        }
        Ok(Self(out))
    }

    /// The quantity for `name`, zero when absent.
    pub fn get(&self, name: &SlotName) -> Decimal {
        self.0.get(name).copied().unwrap_or(Decimal::ZERO)
    }

    pub fn insert(&mut self, name: SlotName, quantity: Decimal) {
        self.0.insert(name, quantity);
    }

    pub fn iter(&self) -> impl Iterator<Item = (&SlotName, &Decimal)> {
        self.0.iter()
    }

    pub fn names(&self) -> impl Iterator<Item = &SlotName> {
        self.0.keys()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Whether every quantity is zero (missing keys count as zero).
    pub fn is_zero(&self) -> bool {
        self.0.values().all(|q| q.is_zero())
    }

    fn union_names<'a>(&'a self, other: &'a Self) -> impl Iterator<Item = &'a SlotName> {
        let mut names: Vec<&SlotName> = self.0.keys().chain(other.0.keys()).collect();
        names.sort();
        names.dedup();
        names.into_iter()
    }

    /// Subset check: `self[s] <= other[s]` for every slot in either map.
    pub fn eq_contained(&self, other: &Self) -> bool {
        self.union_names(other)
            .all(|name| self.get(name) <= other.get(name))
    }

    /// Superset check: `self[s] >= other[s]` for every slot in either map.
    pub fn eq_contains(&self, other: &Self) -> bool {
        other.eq_contained(self)
    }

    /// Scale every quantity by `factor` (used for resource-seconds).
    pub fn scaled(&self, factor: Decimal) -> Self {
        Self(
            self.0
                .iter()
                .map(|(name, q)| (name.clone(), q * factor))
                .collect(),
        )
    }

    /// Render quantities for humans, formatting byte-kind slots with binary
    /// units. Unknown slot names fall back to the raw decimal.
    pub fn to_humanized(&self, catalog: &super::SlotTypeCatalog) -> BTreeMap<String, String> {
        self.0
            .iter()
            .map(|(name, q)| {
                let rendered = match catalog.kind_of(name) {
                    Some(SlotKind::Bytes) => format_binary_size(*q),
                    _ => q.normalize().to_string(),
                };
                (name.to_string(), rendered)
            })
            .collect()
    }
}

impl FromIterator<(SlotName, Decimal)> for ResourceSlot {
    fn from_iter<T: IntoIterator<Item = (SlotName, Decimal)>>(iter: T) -> Self {
        Self(iter.into_iter().collect())
    }
}

impl Add for ResourceSlot {
    type Output = ResourceSlot;

    fn add(mut self, rhs: ResourceSlot) -> ResourceSlot {
        self += rhs;
        self
    }
}

impl AddAssign for ResourceSlot {
    fn add_assign(&mut self, rhs: ResourceSlot) {
        for (name, q) in rhs.0 {
            *self.0.entry(name).or_insert(Decimal::ZERO) += q;
        }
    }
}

impl Sub for ResourceSlot {
    type Output = ResourceSlot;

    fn sub(mut self, rhs: ResourceSlot) -> ResourceSlot {
        self -= rhs;
        self
    }
}

impl SubAssign for ResourceSlot {
    fn sub_assign(&mut self, rhs: ResourceSlot) {
        for (name, q) in rhs.0 {
            *self.0.entry(name).or_insert(Decimal::ZERO) -= q;
        }
    }
}

impl Serialize for ResourceSlot {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.0.len()))?;
        for (name, q) in &self.0 {
            map.serialize_entry(&name.to_string(), &q.to_string())?;
        }
        map.end()
    }
}

impl<'de> Deserialize<'de> for ResourceSlot {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        struct SlotVisitor;

        impl<'de> Visitor<'de> for SlotVisitor {
            type Value = ResourceSlot;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a map of slot names to decimal strings")
            }

            fn visit_map<A: MapAccess<'de>>(
                self,
                mut access: A,
            ) -> std::result::Result<Self::Value, A::Error> {
                let mut out = BTreeMap::new();
                while let Some((name, quantity)) = access.next_entry::<String, String>()? {
                    let name: SlotName = name.parse().map_err(de::Error::custom)?;
                    let quantity = Decimal::from_str(&quantity).map_err(de::Error::custom)?;
                    out.insert(name, quantity);
                }
                Ok(ResourceSlot(out))
            }
        }

        deserializer.deserialize_map(SlotVisitor)
    }
}

const BINARY_UNITS: [&str; 5] = ["KiB", "MiB", "GiB", "TiB", "PiB"];

/// Format a byte quantity with binary units, keeping at most two decimals.
pub fn format_binary_size(quantity: Decimal) -> String {
    let kilo = Decimal::from(1024u32);
    if quantity.abs() < kilo {
        return quantity.normalize().to_string();
    }
    let mut value = quantity;
    let mut unit = "";
    for candidate in BINARY_UNITS {
        value /= kilo;
        unit = candidate;
        if value.abs() < kilo {
            break;
        }
    }
    format!("{} {unit}", value.round_dp(2).normalize())
}
