//! Conservative time management.
//!
//! # Model
//!
//! Every joined federate has a [`TimeStatus`]. A *regulating* federate constrains how far
//! others may advance: it promises not to send anything time-stamped earlier than its
//! `lbts` (requested time plus lookahead). A *constrained* federate may only be granted an
//! advance to a time the regulating federates can no longer undercut.
//!
//! ```text
//!              request_advance            grant_advance           grant_delivered
//!   None ──────────────────────▶ Requested ───────────▶ Provisional ───────────▶ None
//!        (Available for the ≥ variant)
//! ```
//!
//! Enabling regulation or constraint is two-phase: the switch sits in `Pending` until the
//! federate confirms it has seen the enable notice. Pending switches never count towards
//! the federation's lower bound.

use std::{collections::BTreeMap, fmt::Display, ops::Add};

use ordered_float::OrderedFloat;
use serde::{Deserialize, Serialize};

use crate::federation::roster::FederateHandle;

/// A point on the federation's logical time axis.
///
/// Totally ordered. [`LogicalTime::INFINITY`] stands for "unbounded".
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct LogicalTime(OrderedFloat<f64>);

impl LogicalTime {
    pub const ZERO: Self = Self(OrderedFloat(0.0));
    pub const INFINITY: Self = Self(OrderedFloat(f64::INFINITY));

    pub const fn new(value: f64) -> Self {
        Self(OrderedFloat(value))
    }

    pub fn as_f64(&self) -> f64 {
        self.0.into_inner()
    }

    pub fn is_finite(&self) -> bool {
        self.0.is_finite()
    }
}

impl From<f64> for LogicalTime {
    fn from(value: f64) -> Self {
        Self::new(value)
    }
}

impl Add for LogicalTime {
    type Output = Self;

    fn add(self, rhs: Self) -> Self::Output {
        Self(self.0 + rhs.0)
    }
}

impl Display for LogicalTime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum TriState {
    #[default]
    Off,
    Pending,
    On,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum Advancing {
    #[default]
    None,
    /// Standard request; granted only once the bound is strictly past the target.
    Requested,
    /// Granted but the federate has not confirmed delivery yet.
    Provisional,
    /// "Available" request; the bound may equal the target.
    Available,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AdvanceKind {
    Standard,
    Available,
}

/// Regulation or constraint, used when confirming a two-phase enable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TimeSwitch {
    Regulation,
    Constrained,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeStatus {
    pub regulating: TriState,
    pub constrained: TriState,
    pub advancing: Advancing,
    pub current_time: LogicalTime,
    pub requested_time: LogicalTime,
    pub lookahead: LogicalTime,
    pub lbts: LogicalTime,
    pub asynchronous_delivery: bool,
}

impl Default for TimeStatus {
    fn default() -> Self {
        Self {
            regulating: TriState::Off,
            constrained: TriState::Off,
            advancing: Advancing::None,
            current_time: LogicalTime::ZERO,
            requested_time: LogicalTime::ZERO,
            lookahead: LogicalTime::ZERO,
            lbts: LogicalTime::ZERO,
            asynchronous_delivery: false,
        }
    }
}

impl TimeStatus {
    fn recompute_lbts(&mut self) {
        self.lbts = self.requested_time + self.lookahead;
    }

    /// Whether an outstanding request may be granted given the lower bound of everyone
    /// else.
    pub fn can_advance(&self, bound: LogicalTime) -> bool {
        let strict = match self.advancing {
            Advancing::None | Advancing::Provisional => return false,
            Advancing::Requested => true,
            Advancing::Available => false,
        };
        if self.constrained != TriState::On {
            return true;
        }
        if strict {
            self.requested_time < bound
        } else {
            self.requested_time <= bound
        }
    }

    fn is_regulating(&self) -> bool {
        self.regulating == TriState::On
    }

    fn is_advancing(&self) -> bool {
        self.advancing != Advancing::None
    }
}

#[derive(Debug, thiserror::Error, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TimeError {
    #[error("federate {0} has no time status")]
    FederateNotKnown(FederateHandle),
    #[error("time regulation is already enabled")]
    RegulationAlreadyEnabled,
    #[error("time regulation is not enabled")]
    RegulationNotEnabled,
    #[error("time constrained is already enabled")]
    ConstrainedAlreadyEnabled,
    #[error("time constrained is not enabled")]
    ConstrainedNotEnabled,
    #[error("an enable request is still pending")]
    EnablePending,
    #[error("a time advance is already in progress")]
    TimeAdvanceAlreadyInProgress,
    #[error("no time advance grant is outstanding")]
    NoGrantOutstanding,
    #[error("invalid time {requested}, current time is {current}")]
    InvalidTime {
        requested: LogicalTime,
        current: LogicalTime,
    },
    #[error("invalid lookahead {0}")]
    InvalidLookahead(LogicalTime),
}

#[derive(Debug, Default)]
pub struct TimeManager {
    statuses: BTreeMap<FederateHandle, TimeStatus>,
}

impl TimeManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn status(&self, federate: FederateHandle) -> Option<&TimeStatus> {
        self.statuses.get(&federate)
    }

    fn status_mut(&mut self, federate: FederateHandle) -> Result<&mut TimeStatus, TimeError> {
        self.statuses
            .get_mut(&federate)
            .ok_or(TimeError::FederateNotKnown(federate))
    }

    pub fn joined_federation(&mut self, federate: FederateHandle) {
        self.statuses.entry(federate).or_default();
    }

    pub fn resigned_federation(&mut self, federate: FederateHandle) -> Option<TimeStatus> {
        self.statuses.remove(&federate)
    }

    /// Starts enabling regulation and returns the time the federate is placed at.
    ///
    /// A new regulator is moved up to the lowest current time among the existing
    /// regulators so it cannot undercut what they were already granted.
    pub fn enable_regulation(
        &mut self,
        federate: FederateHandle,
        lookahead: LogicalTime,
    ) -> Result<LogicalTime, TimeError> {
        validate_lookahead(lookahead)?;
        let floor = self
            .statuses
            .iter()
            .filter(|(h, s)| **h != federate && s.is_regulating())
            .map(|(_, s)| s.current_time)
            .min();
        let status = self.status_mut(federate)?;
        match status.regulating {
            TriState::On => return Err(TimeError::RegulationAlreadyEnabled),
            TriState::Pending => return Err(TimeError::EnablePending),
            TriState::Off => {}
        }
        if status.is_advancing() {
            return Err(TimeError::TimeAdvanceAlreadyInProgress);
        }
        if let Some(floor) = floor {
            status.current_time = status.current_time.max(floor);
        }
        status.requested_time = status.current_time;
        status.lookahead = lookahead;
        status.recompute_lbts();
        status.regulating = TriState::Pending;
        Ok(status.current_time)
    }

    pub fn disable_regulation(&mut self, federate: FederateHandle) -> Result<(), TimeError> {
        let status = self.status_mut(federate)?;
        if status.regulating == TriState::Off {
            return Err(TimeError::RegulationNotEnabled);
        }
        status.regulating = TriState::Off;
        Ok(())
    }

    /// Starts enabling constraint and returns the federate's current time.
    pub fn enable_constrained(&mut self, federate: FederateHandle) -> Result<LogicalTime, TimeError> {
        let status = self.status_mut(federate)?;
        match status.constrained {
            TriState::On => return Err(TimeError::ConstrainedAlreadyEnabled),
            TriState::Pending => return Err(TimeError::EnablePending),
            TriState::Off => {}
        }
        if status.is_advancing() {
            return Err(TimeError::TimeAdvanceAlreadyInProgress);
        }
        status.constrained = TriState::Pending;
        Ok(status.current_time)
    }

    pub fn disable_constrained(&mut self, federate: FederateHandle) -> Result<(), TimeError> {
        let status = self.status_mut(federate)?;
        if status.constrained == TriState::Off {
            return Err(TimeError::ConstrainedNotEnabled);
        }
        status.constrained = TriState::Off;
        Ok(())
    }

    /// Second phase of an enable: the federate has seen the enable notice.
    pub fn enable_delivered(
        &mut self,
        federate: FederateHandle,
        switch: TimeSwitch,
    ) -> Result<(), TimeError> {
        let status = self.status_mut(federate)?;
        let state = match switch {
            TimeSwitch::Regulation => &mut status.regulating,
            TimeSwitch::Constrained => &mut status.constrained,
        };
        match state {
            TriState::Pending => {
                *state = TriState::On;
                Ok(())
            }
            TriState::On => Ok(()),
            TriState::Off => match switch {
                TimeSwitch::Regulation => Err(TimeError::RegulationNotEnabled),
                TimeSwitch::Constrained => Err(TimeError::ConstrainedNotEnabled),
            },
        }
    }

    pub fn modify_lookahead(
        &mut self,
        federate: FederateHandle,
        lookahead: LogicalTime,
    ) -> Result<(), TimeError> {
        validate_lookahead(lookahead)?;
        let status = self.status_mut(federate)?;
        if status.regulating == TriState::Off {
            return Err(TimeError::RegulationNotEnabled);
        }
        status.lookahead = lookahead;
        status.recompute_lbts();
        Ok(())
    }

    pub fn set_asynchronous_delivery(
        &mut self,
        federate: FederateHandle,
        enabled: bool,
    ) -> Result<(), TimeError> {
        self.status_mut(federate)?.asynchronous_delivery = enabled;
        Ok(())
    }

    pub fn request_advance(
        &mut self,
        federate: FederateHandle,
        target: LogicalTime,
        kind: AdvanceKind,
    ) -> Result<(), TimeError> {
        let status = self.status_mut(federate)?;
        if status.is_advancing() {
            return Err(TimeError::TimeAdvanceAlreadyInProgress);
        }
        if status.regulating == TriState::Pending || status.constrained == TriState::Pending {
            return Err(TimeError::EnablePending);
        }
        let valid = match kind {
            AdvanceKind::Standard => target > status.current_time,
            AdvanceKind::Available => target >= status.current_time,
        };
        if !valid || !target.is_finite() {
            return Err(TimeError::InvalidTime {
                requested: target,
                current: status.current_time,
            });
        }
        status.requested_time = target;
        status.recompute_lbts();
        status.advancing = match kind {
            AdvanceKind::Standard => Advancing::Requested,
            AdvanceKind::Available => Advancing::Available,
        };
        Ok(())
    }

    pub fn can_advance(&self, federate: FederateHandle) -> bool {
        self.statuses
            .get(&federate)
            .is_some_and(|s| s.can_advance(self.lower_bound_for(federate)))
    }

    /// Moves the federate to its requested time. The grant stays provisional until
    /// delivery is confirmed.
    pub fn grant_advance(&mut self, federate: FederateHandle) -> Result<LogicalTime, TimeError> {
        let status = self.status_mut(federate)?;
        if !matches!(status.advancing, Advancing::Requested | Advancing::Available) {
            return Err(TimeError::NoGrantOutstanding);
        }
        status.current_time = status.requested_time;
        status.recompute_lbts();
        status.advancing = Advancing::Provisional;
        Ok(status.current_time)
    }

    pub fn grant_delivered(&mut self, federate: FederateHandle) -> Result<(), TimeError> {
        let status = self.status_mut(federate)?;
        if status.advancing != Advancing::Provisional {
            return Err(TimeError::NoGrantOutstanding);
        }
        status.advancing = Advancing::None;
        Ok(())
    }

    /// Minimum `lbts` over regulating federates, or infinity when nobody regulates.
    pub fn compute_federation_lower_bound(&self) -> LogicalTime {
        self.lower_bound_excluding(None)
    }

    /// Lower bound as seen by `federate`: its own regulation does not hold it back.
    pub fn lower_bound_for(&self, federate: FederateHandle) -> LogicalTime {
        self.lower_bound_excluding(Some(federate))
    }

    fn lower_bound_excluding(&self, excluded: Option<FederateHandle>) -> LogicalTime {
        self.statuses
            .iter()
            .filter(|(h, s)| Some(**h) != excluded && s.is_regulating())
            .map(|(_, s)| s.lbts)
            .min()
            .unwrap_or(LogicalTime::INFINITY)
    }

    /// Federates with an outstanding request that may be granted right now.
    pub fn grantable(&self) -> Vec<FederateHandle> {
        self.statuses
            .keys()
            .copied()
            .filter(|h| self.can_advance(*h))
            .collect()
    }
}

fn validate_lookahead(lookahead: LogicalTime) -> Result<(), TimeError> {
    if lookahead < LogicalTime::ZERO || !lookahead.is_finite() {
        return Err(TimeError::InvalidLookahead(lookahead));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn h(raw: u32) -> FederateHandle {
        FederateHandle::new(raw)
    }

    fn t(value: f64) -> LogicalTime {
        LogicalTime::new(value)
    }

    fn regulating(time: &mut TimeManager, federate: FederateHandle, lookahead: f64) {
        time.joined_federation(federate);
        time.enable_regulation(federate, t(lookahead)).unwrap();
        time.enable_delivered(federate, TimeSwitch::Regulation).unwrap();
    }

    fn constrained(time: &mut TimeManager, federate: FederateHandle) {
        time.joined_federation(federate);
        time.enable_constrained(federate).unwrap();
        time.enable_delivered(federate, TimeSwitch::Constrained).unwrap();
    }

    fn advance(time: &mut TimeManager, federate: FederateHandle, to: f64) {
        time.request_advance(federate, t(to), AdvanceKind::Standard)
            .unwrap();
        time.grant_advance(federate).unwrap();
        time.grant_delivered(federate).unwrap();
    }

    #[test]
    fn lower_bound_is_infinite_without_regulators() {
        let mut time = TimeManager::new();
        constrained(&mut time, h(1));
        assert_eq!(time.compute_federation_lower_bound(), LogicalTime::INFINITY);
    }

    #[test]
    fn constrained_federate_waits_for_regulator() {
        let mut time = TimeManager::new();
        regulating(&mut time, h(1), 2.0);
        constrained(&mut time, h(2));

        time.request_advance(h(1), t(10.0), AdvanceKind::Standard)
            .unwrap();
        assert!(time.can_advance(h(1)));
        assert_eq!(time.compute_federation_lower_bound(), t(12.0));

        time.request_advance(h(2), t(11.0), AdvanceKind::Standard)
            .unwrap();
        assert!(time.can_advance(h(2)));
        time.grant_advance(h(2)).unwrap();
        time.grant_delivered(h(2)).unwrap();

        time.request_advance(h(2), t(13.0), AdvanceKind::Standard)
            .unwrap();
        assert!(!time.can_advance(h(2)));
        assert_eq!(time.grantable(), vec![h(1)]);

        time.grant_advance(h(1)).unwrap();
        time.grant_delivered(h(1)).unwrap();
        time.request_advance(h(1), t(12.0), AdvanceKind::Standard)
            .unwrap();
        assert!(time.can_advance(h(2)));
    }

    #[test]
    fn available_request_accepts_equal_bound() {
        let mut time = TimeManager::new();
        regulating(&mut time, h(1), 0.0);
        constrained(&mut time, h(2));
        advance(&mut time, h(1), 5.0);

        time.request_advance(h(2), t(5.0), AdvanceKind::Standard)
            .unwrap();
        assert!(!time.can_advance(h(2)));

        let mut time = TimeManager::new();
        regulating(&mut time, h(1), 0.0);
        constrained(&mut time, h(2));
        advance(&mut time, h(1), 5.0);
        time.request_advance(h(2), t(5.0), AdvanceKind::Available)
            .unwrap();
        assert!(time.can_advance(h(2)));
    }

    #[test]
    fn request_validation() {
        let mut time = TimeManager::new();
        time.joined_federation(h(1));
        advance(&mut time, h(1), 4.0);
        assert_eq!(
            time.request_advance(h(1), t(4.0), AdvanceKind::Standard),
            Err(TimeError::InvalidTime {
                requested: t(4.0),
                current: t(4.0)
            })
        );
        time.request_advance(h(1), t(4.0), AdvanceKind::Available)
            .unwrap();
        assert_eq!(
            time.request_advance(h(1), t(6.0), AdvanceKind::Standard),
            Err(TimeError::TimeAdvanceAlreadyInProgress)
        );
    }

    #[test]
    fn provisional_grant_blocks_further_grants() {
        let mut time = TimeManager::new();
        time.joined_federation(h(1));
        time.request_advance(h(1), t(1.0), AdvanceKind::Standard)
            .unwrap();
        time.grant_advance(h(1)).unwrap();
        assert!(!time.can_advance(h(1)));
        assert_eq!(time.grant_advance(h(1)), Err(TimeError::NoGrantOutstanding));
        time.grant_delivered(h(1)).unwrap();
        assert_eq!(time.status(h(1)).unwrap().advancing, Advancing::None);
    }

    #[test]
    fn pending_regulator_does_not_bound_others() {
        let mut time = TimeManager::new();
        time.joined_federation(h(1));
        time.enable_regulation(h(1), t(1.0)).unwrap();
        assert_eq!(time.compute_federation_lower_bound(), LogicalTime::INFINITY);
        assert_eq!(
            time.enable_regulation(h(1), t(1.0)),
            Err(TimeError::EnablePending)
        );
        time.enable_delivered(h(1), TimeSwitch::Regulation).unwrap();
        assert_eq!(time.compute_federation_lower_bound(), t(1.0));
    }

    #[test]
    fn new_regulator_starts_at_lowest_existing_regulator_time() {
        let mut time = TimeManager::new();
        regulating(&mut time, h(1), 1.0);
        regulating(&mut time, h(2), 1.0);
        advance(&mut time, h(1), 8.0);
        advance(&mut time, h(2), 6.0);

        time.joined_federation(h(3));
        assert_eq!(time.enable_regulation(h(3), t(0.5)).unwrap(), t(6.0));
        time.enable_delivered(h(3), TimeSwitch::Regulation).unwrap();
        assert_eq!(time.compute_federation_lower_bound(), t(6.5));
    }

    #[test]
    fn own_regulation_is_excluded_from_own_bound() {
        let mut time = TimeManager::new();
        regulating(&mut time, h(1), 1.0);
        constrained(&mut time, h(1));
        regulating(&mut time, h(2), 3.0);

        assert_eq!(time.lower_bound_for(h(1)), t(3.0));
        assert_eq!(time.lower_bound_for(h(2)), t(1.0));
        time.request_advance(h(1), t(2.0), AdvanceKind::Standard)
            .unwrap();
        assert!(time.can_advance(h(1)));
    }

    #[test]
    fn departure_releases_bound() {
        let mut time = TimeManager::new();
        regulating(&mut time, h(1), 1.0);
        constrained(&mut time, h(2));
        time.request_advance(h(2), t(50.0), AdvanceKind::Standard)
            .unwrap();
        assert!(time.grantable().is_empty());
        time.resigned_federation(h(1));
        assert_eq!(time.grantable(), vec![h(2)]);
    }

    #[test]
    fn lookahead_changes_move_the_bound() {
        let mut time = TimeManager::new();
        regulating(&mut time, h(1), 1.0);
        assert_eq!(
            time.modify_lookahead(h(1), t(-1.0)),
            Err(TimeError::InvalidLookahead(t(-1.0)))
        );
        time.modify_lookahead(h(1), t(4.0)).unwrap();
        assert_eq!(time.compute_federation_lower_bound(), t(4.0));
        time.disable_regulation(h(1)).unwrap();
        assert_eq!(time.compute_federation_lower_bound(), LogicalTime::INFINITY);
    }
}
