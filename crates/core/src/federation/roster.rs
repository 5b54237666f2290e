//! Membership of a single federation execution.
//!
//! The roster is the only place that decides who is joined. Every other component
//! (sync points, time management, ownership) is told about joins and departures by the
//! coordinator and never keeps its own notion of membership.

use std::{
    collections::{BTreeMap, BTreeSet},
    fmt::Display,
};

use serde::{Deserialize, Serialize};

/// Identifier assigned to a federate when it joins a federation.
///
/// Handles start at 1 and are never reused within a federation execution, so a lower
/// handle always belongs to a federate that joined earlier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FederateHandle(u32);

impl FederateHandle {
    pub const fn new(raw: u32) -> Self {
        Self(raw)
    }

    pub const fn as_u32(&self) -> u32 {
        self.0
    }
}

impl Display for FederateHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// What the rest of the federation knows about a joined federate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FederateInfo {
    pub handle: FederateHandle,
    pub name: String,
    pub federate_type: String,
}

#[derive(Debug, thiserror::Error, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RosterError {
    #[error("federate name `{0}` is already in use")]
    NameInUse(String),
    #[error("federate {0} is not joined")]
    NotJoined(FederateHandle),
}

/// Joined federates of one federation, keyed by handle.
#[derive(Debug)]
pub struct FederationRoster {
    next_handle: u32,
    federates: BTreeMap<FederateHandle, FederateInfo>,
}

impl Default for FederationRoster {
    fn default() -> Self {
        Self::new()
    }
}

impl FederationRoster {
    pub fn new() -> Self {
        Self {
            next_handle: 1,
            federates: BTreeMap::new(),
        }
    }

    /// Admits a federate and assigns it the next handle.
    pub fn join(
        &mut self,
        name: impl Into<String>,
        federate_type: impl Into<String>,
    ) -> Result<FederateInfo, RosterError> {
        let name = name.into();
        if self.federates.values().any(|f| f.name == name) {
            return Err(RosterError::NameInUse(name));
        }
        let handle = FederateHandle(self.next_handle);
        self.next_handle += 1;
        let info = FederateInfo {
            handle,
            name,
            federate_type: federate_type.into(),
        };
        self.federates.insert(handle, info.clone());
        Ok(info)
    }

    pub fn leave(&mut self, handle: FederateHandle) -> Result<FederateInfo, RosterError> {
        self.federates
            .remove(&handle)
            .ok_or(RosterError::NotJoined(handle))
    }

    pub fn contains(&self, handle: FederateHandle) -> bool {
        self.federates.contains_key(&handle)
    }

    pub fn get(&self, handle: FederateHandle) -> Option<&FederateInfo> {
        self.federates.get(&handle)
    }

    /// Snapshot of the live handle set.
    pub fn handles(&self) -> BTreeSet<FederateHandle> {
        self.federates.keys().copied().collect()
    }

    pub fn members(&self) -> impl Iterator<Item = &FederateInfo> {
        self.federates.values()
    }

    pub fn len(&self) -> usize {
        self.federates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.federates.is_empty()
    }
}
