//! Attribute ownership of registered object instances.
//!
//! Every attribute of an object instance has exactly one [`Owner`] at any time. A federate
//! acquires attributes by asking the federation: free attributes (unowned or held by the
//! RTI itself) transfer immediately, while attributes held by another federate require
//! that owner to divest them first.
//!
//! # Contention
//!
//! At most one acquisition may be pending per attribute. When a second federate asks for
//! an attribute that already has a pending acquisition, the lower federate handle wins and
//! the other requester is told it lost the race to that handle. The owner is asked only once
//! per pending acquisition; whoever is the pending requester when the owner answers gets
//! the attribute.
//!
//! # Failure
//!
//! An owner that does not answer within the divestiture timeout loses nothing: the
//! acquisition fails for the requester and the owner's request is withdrawn.
//!
//! All validation happens before any state changes, so a rejected request leaves the
//! ownership table untouched.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use crate::{
    federation::{
        object_model::{AttributeHandle, ObjectClassHandle, ObjectHandle, ObjectModelView},
        roster::FederateHandle,
    },
    message::CorrelationId,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Owner {
    Unowned,
    OwnedByRti,
    Federate(FederateHandle),
}

impl Owner {
    fn is_free(&self) -> bool {
        matches!(self, Self::Unowned | Self::OwnedByRti)
    }
}

#[derive(Debug, Clone)]
struct PendingAcquisition {
    requester: FederateHandle,
    /// Identifies the divestiture request sent to the owner.
    correlation: CorrelationId,
    deadline: Instant,
}

#[derive(Debug, Clone)]
struct AttributeRecord {
    owner: Owner,
    pending: Option<PendingAcquisition>,
}

#[derive(Debug, Clone)]
pub struct ObjectInstance {
    handle: ObjectHandle,
    class: ObjectClassHandle,
    attributes: BTreeMap<AttributeHandle, AttributeRecord>,
    known_by: BTreeSet<FederateHandle>,
}

impl ObjectInstance {
    pub fn handle(&self) -> ObjectHandle {
        self.handle
    }

    pub fn class(&self) -> ObjectClassHandle {
        self.class
    }

    pub fn is_known_by(&self, federate: FederateHandle) -> bool {
        self.known_by.contains(&federate)
    }

    pub fn owner(&self, attribute: AttributeHandle) -> Option<Owner> {
        self.attributes.get(&attribute).map(|r| r.owner)
    }
}

/// Request sent to an owner asking it to give up some attributes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DivestitureRequest {
    pub owner: FederateHandle,
    pub correlation: CorrelationId,
    pub object: ObjectHandle,
    pub attributes: BTreeSet<AttributeHandle>,
}

#[derive(Debug, Default, PartialEq, Eq)]
pub struct AcquireOutcome {
    /// Transferred to the requester right away.
    pub acquired: BTreeSet<AttributeHandle>,
    /// Reported unavailable to the requester.
    pub unavailable: BTreeSet<AttributeHandle>,
    /// New divestiture requests, one per owner.
    pub divestiture_requests: Vec<DivestitureRequest>,
    /// Earlier requesters that lost their pending acquisition to this one.
    pub displaced: BTreeMap<FederateHandle, BTreeSet<AttributeHandle>>,
    /// Attributes already pending for a lower handle, keyed by that handle.
    pub lost: BTreeMap<FederateHandle, BTreeSet<AttributeHandle>>,
}

/// Attributes that changed hands, grouped by their new owner.
pub type Transfers = BTreeMap<FederateHandle, BTreeSet<AttributeHandle>>;

#[derive(Debug, PartialEq, Eq)]
pub struct ExpiredAcquisition {
    pub requester: FederateHandle,
    pub request: DivestitureRequest,
}

#[derive(Debug, Default, PartialEq, Eq)]
pub struct OwnershipLeaveOutcome {
    /// Attributes of the departed owner handed to their pending acquirers.
    pub transferred: Vec<(ObjectHandle, Transfers)>,
    /// Divestiture requests withdrawn because the requester left.
    pub withdrawn: Vec<DivestitureRequest>,
}

#[derive(Debug, thiserror::Error, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum OwnershipError {
    #[error("object {0} is not known")]
    ObjectNotKnown(ObjectHandle),
    #[error("object class {0} is not published")]
    ObjectClassNotPublished(ObjectClassHandle),
    #[error("attribute {0} is not defined")]
    AttributeNotDefined(AttributeHandle),
    #[error("attribute {0} is not published")]
    AttributeNotPublished(AttributeHandle),
    #[error("federate already owns attributes {0:?}")]
    FederateOwnsAttributes(BTreeSet<AttributeHandle>),
    #[error("federate does not own attributes {0:?}")]
    AttributeNotOwned(BTreeSet<AttributeHandle>),
    #[error("no acquisition pending for attributes {0:?}")]
    AcquisitionNotPending(BTreeSet<AttributeHandle>),
    #[error("object {0} is already registered")]
    ObjectAlreadyRegistered(ObjectHandle),
}

#[derive(Debug, Default)]
pub struct OwnershipManager {
    objects: HashMap<ObjectHandle, ObjectInstance>,
}

impl OwnershipManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn object(&self, object: ObjectHandle) -> Option<&ObjectInstance> {
        self.objects.get(&object)
    }

    pub fn objects(&self) -> impl Iterator<Item = &ObjectInstance> {
        self.objects.values()
    }

    /// Registers a new instance of `class`.
    ///
    /// Attributes the registrant publishes start out owned by it; the rest are unowned.
    /// Without a registrant the instance belongs to the RTI.
    pub fn register_object(
        &mut self,
        object: ObjectHandle,
        class: ObjectClassHandle,
        attributes: impl IntoIterator<Item = AttributeHandle>,
        registrant: Option<(FederateHandle, &BTreeSet<AttributeHandle>)>,
    ) -> Result<&ObjectInstance, OwnershipError> {
        if self.objects.contains_key(&object) {
            return Err(OwnershipError::ObjectAlreadyRegistered(object));
        }
        let attributes = attributes
            .into_iter()
            .map(|attribute| {
                let owner = match registrant {
                    None => Owner::OwnedByRti,
                    Some((federate, published)) if published.contains(&attribute) => {
                        Owner::Federate(federate)
                    }
                    Some(_) => Owner::Unowned,
                };
                (
                    attribute,
                    AttributeRecord {
                        owner,
                        pending: None,
                    },
                )
            })
            .collect();
        let known_by = registrant.map(|(f, _)| f).into_iter().collect();
        let instance = ObjectInstance {
            handle: object,
            class,
            attributes,
            known_by,
        };
        Ok(self.objects.entry(object).or_insert(instance))
    }

    /// Records that `federate` now knows the instance. Returns `false` if it already did.
    pub fn discover(
        &mut self,
        object: ObjectHandle,
        federate: FederateHandle,
    ) -> Result<bool, OwnershipError> {
        let instance = self
            .objects
            .get_mut(&object)
            .ok_or(OwnershipError::ObjectNotKnown(object))?;
        Ok(instance.known_by.insert(federate))
    }

    pub fn query_owner(
        &self,
        object: ObjectHandle,
        attribute: AttributeHandle,
    ) -> Result<Owner, OwnershipError> {
        let instance = self
            .objects
            .get(&object)
            .ok_or(OwnershipError::ObjectNotKnown(object))?;
        instance
            .owner(attribute)
            .ok_or(OwnershipError::AttributeNotDefined(attribute))
    }

    /// Handles an ownership acquisition request.
    ///
    /// With `if_available` set, attributes held by another federate are reported
    /// unavailable instead of triggering a divestiture request.
    pub fn acquire(
        &mut self,
        requester: FederateHandle,
        object: ObjectHandle,
        attributes: &BTreeSet<AttributeHandle>,
        if_available: bool,
        model: &impl ObjectModelView,
        deadline: Instant,
    ) -> Result<AcquireOutcome, OwnershipError> {
        let instance = self
            .objects
            .get_mut(&object)
            .ok_or(OwnershipError::ObjectNotKnown(object))?;
        if !instance.known_by.contains(&requester) {
            return Err(OwnershipError::ObjectNotKnown(object));
        }
        validate_acquisition(instance, requester, attributes, model)?;

        let mut outcome = AcquireOutcome::default();
        let mut to_request: BTreeMap<FederateHandle, BTreeSet<AttributeHandle>> = BTreeMap::new();
        for attribute in attributes {
            let Some(record) = instance.attributes.get_mut(attribute) else {
                continue;
            };
            match record.owner {
                owner if owner.is_free() => {
                    if let Some(previous) = record.pending.take() {
                        outcome
                            .displaced
                            .entry(previous.requester)
                            .or_default()
                            .insert(*attribute);
                    }
                    record.owner = Owner::Federate(requester);
                    outcome.acquired.insert(*attribute);
                }
                _ if if_available => {
                    outcome.unavailable.insert(*attribute);
                }
                Owner::Federate(owner) => match &mut record.pending {
                    Some(pending) if pending.requester == requester => {}
                    Some(pending) if pending.requester < requester => {
                        outcome
                            .lost
                            .entry(pending.requester)
                            .or_default()
                            .insert(*attribute);
                    }
                    Some(pending) => {
                        outcome
                            .displaced
                            .entry(pending.requester)
                            .or_default()
                            .insert(*attribute);
                        pending.requester = requester;
                    }
                    None => {
                        to_request.entry(owner).or_default().insert(*attribute);
                    }
                },
                Owner::Unowned | Owner::OwnedByRti => {}
            }
        }

        for (owner, attributes) in to_request {
            let correlation = CorrelationId::new();
            for attribute in &attributes {
                if let Some(record) = instance.attributes.get_mut(attribute) {
                    record.pending = Some(PendingAcquisition {
                        requester,
                        correlation,
                        deadline,
                    });
                }
            }
            outcome.divestiture_requests.push(DivestitureRequest {
                owner,
                correlation,
                object,
                attributes,
            });
        }
        Ok(outcome)
    }

    /// Moves attributes owned by `owner` to `new_owner`.
    pub fn complete_divestiture(
        &mut self,
        owner: FederateHandle,
        object: ObjectHandle,
        attributes: &BTreeSet<AttributeHandle>,
        new_owner: Owner,
    ) -> Result<(), OwnershipError> {
        let instance = self
            .objects
            .get_mut(&object)
            .ok_or(OwnershipError::ObjectNotKnown(object))?;
        check_owned(instance, owner, attributes)?;
        for attribute in attributes {
            if let Some(record) = instance.attributes.get_mut(attribute) {
                record.owner = new_owner;
                record.pending = None;
            }
        }
        Ok(())
    }

    /// The owner's answer to the divestiture request identified by `correlation`.
    ///
    /// Attributes whose acquisition is no longer pending under that request stay with the
    /// owner. The rest go to whoever is the pending requester now.
    pub fn release_response(
        &mut self,
        owner: FederateHandle,
        object: ObjectHandle,
        attributes: &BTreeSet<AttributeHandle>,
        correlation: CorrelationId,
    ) -> Result<Transfers, OwnershipError> {
        let instance = self
            .objects
            .get(&object)
            .ok_or(OwnershipError::ObjectNotKnown(object))?;
        check_owned(instance, owner, attributes)?;
        let mut transfers = Transfers::new();
        for attribute in attributes {
            let pending = instance
                .attributes
                .get(attribute)
                .and_then(|r| r.pending.as_ref())
                .filter(|p| p.correlation == correlation);
            if let Some(pending) = pending {
                transfers
                    .entry(pending.requester)
                    .or_default()
                    .insert(*attribute);
            }
        }
        for (new_owner, attributes) in &transfers {
            self.complete_divestiture(owner, object, attributes, Owner::Federate(*new_owner))?;
        }
        Ok(transfers)
    }

    /// Gives up attributes without waiting for anyone to ask.
    ///
    /// Attributes with a pending acquisition go to that requester; the rest become
    /// unowned.
    pub fn unconditional_divest(
        &mut self,
        owner: FederateHandle,
        object: ObjectHandle,
        attributes: &BTreeSet<AttributeHandle>,
    ) -> Result<Transfers, OwnershipError> {
        let instance = self
            .objects
            .get_mut(&object)
            .ok_or(OwnershipError::ObjectNotKnown(object))?;
        check_owned(instance, owner, attributes)?;
        let mut transfers = Transfers::new();
        for attribute in attributes {
            let Some(record) = instance.attributes.get_mut(attribute) else {
                continue;
            };
            record.owner = match record.pending.take() {
                Some(pending) => {
                    transfers
                        .entry(pending.requester)
                        .or_default()
                        .insert(*attribute);
                    Owner::Federate(pending.requester)
                }
                None => Owner::Unowned,
            };
        }
        Ok(transfers)
    }

    /// Withdraws the pending acquisitions `requester` has on `attributes`.
    pub fn cancel_acquisition(
        &mut self,
        requester: FederateHandle,
        object: ObjectHandle,
        attributes: &BTreeSet<AttributeHandle>,
    ) -> Result<Vec<DivestitureRequest>, OwnershipError> {
        let instance = self
            .objects
            .get_mut(&object)
            .ok_or(OwnershipError::ObjectNotKnown(object))?;
        let not_pending: BTreeSet<_> = attributes
            .iter()
            .filter(|a| {
                instance
                    .attributes
                    .get(a)
                    .and_then(|r| r.pending.as_ref())
                    .map_or(true, |p| p.requester != requester)
            })
            .copied()
            .collect();
        if !not_pending.is_empty() {
            return Err(OwnershipError::AcquisitionNotPending(not_pending));
        }
        let mut withdrawn: BTreeMap<(FederateHandle, CorrelationId), BTreeSet<AttributeHandle>> =
            BTreeMap::new();
        for attribute in attributes {
            let Some(record) = instance.attributes.get_mut(attribute) else {
                continue;
            };
            if let (Some(pending), Owner::Federate(owner)) = (record.pending.take(), record.owner) {
                withdrawn
                    .entry((owner, pending.correlation))
                    .or_default()
                    .insert(*attribute);
            }
        }
        Ok(withdrawn
            .into_iter()
            .map(|((owner, correlation), attributes)| DivestitureRequest {
                owner,
                correlation,
                object,
                attributes,
            })
            .collect())
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.objects
            .values()
            .flat_map(|o| o.attributes.values())
            .filter_map(|r| r.pending.as_ref().map(|p| p.deadline))
            .min()
    }

    /// Fails every pending acquisition whose owner has not answered by `now`.
    pub fn expire_acquisitions(&mut self, now: Instant) -> Vec<ExpiredAcquisition> {
        let mut expired: BTreeMap<
            (ObjectHandle, FederateHandle, FederateHandle, CorrelationId),
            BTreeSet<AttributeHandle>,
        > = BTreeMap::new();
        for instance in self.objects.values_mut() {
            for (attribute, record) in instance.attributes.iter_mut() {
                let due = record.pending.as_ref().is_some_and(|p| p.deadline <= now);
                if !due {
                    continue;
                }
                if let (Some(pending), Owner::Federate(owner)) =
                    (record.pending.take(), record.owner)
                {
                    expired
                        .entry((instance.handle, pending.requester, owner, pending.correlation))
                        .or_default()
                        .insert(*attribute);
                }
            }
        }
        expired
            .into_iter()
            .map(
                |((object, requester, owner, correlation), attributes)| ExpiredAcquisition {
                    requester,
                    request: DivestitureRequest {
                        owner,
                        correlation,
                        object,
                        attributes,
                    },
                },
            )
            .collect()
    }

    /// Applies a federate's departure.
    ///
    /// Its attributes go to their pending acquirer if there is one, otherwise they become
    /// unowned. Acquisitions it was waiting on are withdrawn.
    pub fn roster_leave(&mut self, federate: FederateHandle) -> OwnershipLeaveOutcome {
        let mut outcome = OwnershipLeaveOutcome::default();
        let mut handles: Vec<_> = self.objects.keys().copied().collect();
        handles.sort();
        for handle in handles {
            let Some(instance) = self.objects.get_mut(&handle) else {
                continue;
            };
            instance.known_by.remove(&federate);
            let mut transfers = Transfers::new();
            let mut withdrawn: BTreeMap<(FederateHandle, CorrelationId), BTreeSet<AttributeHandle>> =
                BTreeMap::new();
            for (attribute, record) in instance.attributes.iter_mut() {
                if record.owner == Owner::Federate(federate) {
                    record.owner = match record.pending.take() {
                        Some(pending) => {
                            transfers
                                .entry(pending.requester)
                                .or_default()
                                .insert(*attribute);
                            Owner::Federate(pending.requester)
                        }
                        None => Owner::Unowned,
                    };
                } else if record
                    .pending
                    .as_ref()
                    .is_some_and(|p| p.requester == federate)
                {
                    if let (Some(pending), Owner::Federate(owner)) =
                        (record.pending.take(), record.owner)
                    {
                        withdrawn
                            .entry((owner, pending.correlation))
                            .or_default()
                            .insert(*attribute);
                    }
                }
            }
            if !transfers.is_empty() {
                outcome.transferred.push((handle, transfers));
            }
            outcome
                .withdrawn
                .extend(
                    withdrawn
                        .into_iter()
                        .map(|((owner, correlation), attributes)| DivestitureRequest {
                            owner,
                            correlation,
                            object: handle,
                            attributes,
                        }),
                );
        }
        outcome
    }
}

fn validate_acquisition(
    instance: &ObjectInstance,
    requester: FederateHandle,
    attributes: &BTreeSet<AttributeHandle>,
    model: &impl ObjectModelView,
) -> Result<(), OwnershipError> {
    if !model.is_class_published(requester, instance.class) {
        return Err(OwnershipError::ObjectClassNotPublished(instance.class));
    }
    for attribute in attributes {
        if !model.is_attribute_defined(instance.class, *attribute)
            || !instance.attributes.contains_key(attribute)
        {
            return Err(OwnershipError::AttributeNotDefined(*attribute));
        }
    }
    let already_owned: BTreeSet<_> = attributes
        .iter()
        .filter(|a| instance.owner(**a) == Some(Owner::Federate(requester)))
        .copied()
        .collect();
    if !already_owned.is_empty() {
        return Err(OwnershipError::FederateOwnsAttributes(already_owned));
    }
    for attribute in attributes {
        if !model.is_published(requester, instance.class, *attribute) {
            return Err(OwnershipError::AttributeNotPublished(*attribute));
        }
    }
    Ok(())
}

fn check_owned(
    instance: &ObjectInstance,
    owner: FederateHandle,
    attributes: &BTreeSet<AttributeHandle>,
) -> Result<(), OwnershipError> {
    let not_owned: BTreeSet<_> = attributes
        .iter()
        .filter(|a| instance.owner(**a) != Some(Owner::Federate(owner)))
        .copied()
        .collect();
    if not_owned.is_empty() {
        Ok(())
    } else {
        Err(OwnershipError::AttributeNotOwned(not_owned))
    }
}
