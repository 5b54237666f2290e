//! Federate-side stub.
//!
//! [`RtiClient`] is what a simulation links against: it turns calls into requests, matches
//! replies by correlation id and hands notices to the application. Alongside, it keeps a
//! [`FederateView`], the reduced picture of the federation this federate can derive from
//! what the RTI told it.

use std::collections::{BTreeMap, BTreeSet};

use crate::{
    federation::{
        object_model::{ObjectClassHandle, ObjectHandle},
        roster::{FederateHandle, FederateInfo},
    },
    message::{Notice, Reply},
    operations::{sync_point::SyncPointManager, time::LogicalTime},
};

pub mod client;

pub use client::RtiClient;

/// Time flags as last reported by the RTI.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LocalTime {
    pub regulating: bool,
    pub constrained: bool,
    pub current_time: LogicalTime,
    /// A grant has been requested and not delivered yet.
    pub advancing: bool,
}

#[derive(Debug, Clone, Default)]
pub struct FederateView {
    handle: Option<FederateHandle>,
    members: BTreeMap<FederateHandle, FederateInfo>,
    sync_points: SyncPointManager,
    time: LocalTime,
    discovered: BTreeMap<ObjectHandle, ObjectClassHandle>,
}

impl FederateView {
    pub fn handle(&self) -> Option<FederateHandle> {
        self.handle
    }

    pub fn members(&self) -> impl Iterator<Item = &FederateInfo> {
        self.members.values()
    }

    pub fn member_handles(&self) -> BTreeSet<FederateHandle> {
        self.members.keys().copied().collect()
    }

    /// Local mirror of the federation's sync points.
    pub fn sync_points(&self) -> &SyncPointManager {
        &self.sync_points
    }

    pub fn time(&self) -> LocalTime {
        self.time
    }

    pub fn discovered(&self) -> &BTreeMap<ObjectHandle, ObjectClassHandle> {
        &self.discovered
    }

    pub(crate) fn apply_reply(&mut self, reply: &Reply) {
        if let Reply::Joined { handle, members } = reply {
            *self = Self::default();
            self.handle = Some(*handle);
            self.members = members.iter().map(|m| (m.handle, m.clone())).collect();
        }
    }

    pub(crate) fn apply_notice(&mut self, notice: &Notice) {
        match notice {
            Notice::FederateJoined { federate } => {
                self.members.insert(federate.handle, federate.clone());
            }
            Notice::FederateResigned { federate } => {
                self.members.remove(federate);
                let live = self.member_handles();
                self.sync_points.roster_leave(*federate, &live);
            }
            Notice::SyncRegistrationIntent { label, federate } => {
                let applied = if self.sync_points.contains(label) {
                    self.sync_points
                        .requested_registration(label, *federate, None)
                        .map(|_| ())
                } else {
                    self.sync_points
                        .register_pending(label, *federate)
                        .map(|_| ())
                };
                if let Err(err) = applied {
                    tracing::warn!(%label, %federate, %err, "Ignoring registration intent");
                }
            }
            Notice::AnnounceSyncPoint {
                label,
                registrant,
                tag,
                scope,
            } => {
                self.sync_points
                    .record_announcement(label, *registrant, tag.clone(), scope.clone());
            }
            Notice::FederationSynchronized { label } => {
                self.sync_points.mark_synchronized(label);
            }
            Notice::TimeRegulationEnabled { time } => {
                self.time.regulating = true;
                self.time.current_time = *time;
            }
            Notice::TimeConstrainedEnabled { time } => {
                self.time.constrained = true;
                self.time.current_time = *time;
            }
            Notice::TimeAdvanceGrant { time } => {
                self.time.current_time = *time;
                self.time.advancing = false;
            }
            Notice::DiscoverObject { object, class } => {
                self.discovered.insert(*object, *class);
            }
            Notice::RequestDivestiture { .. }
            | Notice::DivestitureRequestWithdrawn { .. }
            | Notice::OwnershipAcquired { .. }
            | Notice::AttributesUnavailable { .. }
            | Notice::AcquisitionFailed { .. } => {}
        }
    }

    pub(crate) fn achieved(&mut self, label: &str) {
        let Some(local) = self.handle else {
            return;
        };
        if let Err(err) = self.sync_points.mark_achieved(label, local) {
            tracing::debug!(%label, %err, "Achievement not mirrored");
        }
    }

    pub(crate) fn advance_requested(&mut self) {
        self.time.advancing = true;
    }

    pub(crate) fn advance_withdrawn(&mut self) {
        self.time.advancing = false;
    }

    pub(crate) fn regulation_disabled(&mut self) {
        self.time.regulating = false;
    }

    pub(crate) fn constrained_disabled(&mut self) {
        self.time.constrained = false;
    }

    pub(crate) fn resigned(&mut self) {
        *self = Self::default();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::operations::sync_point::{SyncPointStatus, SyncScope};

    fn info(raw: u32) -> FederateInfo {
        FederateInfo {
            handle: FederateHandle::new(raw),
            name: format!("fed-{raw}"),
            federate_type: "sim".into(),
        }
    }

    fn intent(label: &str, raw: u32) -> Notice {
        Notice::SyncRegistrationIntent {
            label: label.into(),
            federate: FederateHandle::new(raw),
        }
    }

    #[test]
    fn mirror_agrees_on_lowest_registrant() {
        let mut view = FederateView::default();
        view.apply_reply(&Reply::Joined {
            handle: FederateHandle::new(5),
            members: vec![info(3), info(5)],
        });
        view.apply_notice(&intent("sync1", 5));
        view.apply_notice(&intent("sync1", 3));

        let point = view.sync_points().get("sync1").unwrap();
        assert_eq!(point.registrant(), FederateHandle::new(3));
        assert!(point.status().is_unannounced());

        let scope = SyncScope::from_handles([FederateHandle::new(3), FederateHandle::new(5)]);
        view.apply_notice(&Notice::AnnounceSyncPoint {
            label: "sync1".into(),
            registrant: FederateHandle::new(3),
            tag: vec![],
            scope: scope.clone(),
        });
        let point = view.sync_points().get("sync1").unwrap();
        assert_eq!(point.status(), SyncPointStatus::Announced);
        assert_eq!(point.scope(), &scope);

        view.achieved("sync1");
        assert_eq!(
            view.sync_points().get("sync1").unwrap().status(),
            SyncPointStatus::Achieved
        );
        view.apply_notice(&Notice::FederationSynchronized {
            label: "sync1".into(),
        });
        assert!(!view.sync_points().contains("sync1"));
    }

    #[test]
    fn synchronization_retires_an_unannounced_intent() {
        let mut view = FederateView::default();
        view.apply_reply(&Reply::Joined {
            handle: FederateHandle::new(1),
            members: vec![info(1), info(2)],
        });
        view.apply_notice(&intent("r", 2));
        assert!(view.sync_points().contains("r"));

        view.apply_notice(&Notice::FederationSynchronized { label: "r".into() });
        assert!(!view.sync_points().contains("r"));
    }

    #[test]
    fn roster_follows_join_and_resign_notices() {
        let mut view = FederateView::default();
        view.apply_reply(&Reply::Joined {
            handle: FederateHandle::new(1),
            members: vec![info(1)],
        });
        view.apply_notice(&Notice::FederateJoined { federate: info(2) });
        assert_eq!(view.member_handles().len(), 2);

        view.apply_notice(&intent("p", 2));
        view.apply_notice(&Notice::FederateResigned {
            federate: FederateHandle::new(2),
        });
        assert_eq!(view.member_handles(), BTreeSet::from([FederateHandle::new(1)]));
        assert!(!view.sync_points().contains("p"));
    }

    #[test]
    fn time_flags_follow_notices() {
        let mut view = FederateView::default();
        view.apply_notice(&Notice::TimeRegulationEnabled {
            time: LogicalTime::new(4.0),
        });
        view.advance_requested();
        assert!(view.time().advancing);
        view.apply_notice(&Notice::TimeAdvanceGrant {
            time: LogicalTime::new(6.0),
        });
        assert_eq!(
            view.time(),
            LocalTime {
                regulating: true,
                constrained: false,
                current_time: LogicalTime::new(6.0),
                advancing: false,
            }
        );
    }
}
