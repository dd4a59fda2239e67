//! Allocation manager implementation
//!
//! # Locking model
//!
//! Ownership of each target lives in its own slot, guarded by its own
//! mutex; the set of slots is fixed when the manager is built. A group is
//! granted by locking the slots of all its targets in ID order, checking
//! them and writing them while every guard is held, so a group is always
//! granted or denied as a whole and two requests can never deadlock on
//! each other's targets.
//!
//! The FIFO queue has a separate mutex. When both are needed the queue is
//! locked first, then slots (in ID order), then the allocation's inner
//! state. Nothing here ever awaits or calls a driver while holding any of
//! these locks.
//!
//! A target is busy only while an active allocation owns it. Queued
//! allocations reserve nothing; they are granted as soon as their whole
//! group is free, in arrival order.

use std::collections::{BTreeSet, HashMap, VecDeque};
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::{Mutex, MutexGuard};
use tokio::sync::broadcast;

use tb_core::time::{current_time_millis, deadline_passed, idle_expired};
use tb_core::{AllocationId, BrokerError, Principal, TargetId};

use super::{
    AcquireOutcome, AllocationEvent, AllocationInfo, AllocationState, ExpiryPolicy, TargetGroup,
};
use crate::registry::TargetRegistry;

/// Ownership record of one target
#[derive(Debug, Default)]
struct Slot {
    owner: Option<AllocationId>,
}

pub(super) struct AllocationInner {
    pub(super) state: AllocationState,
    pub(super) guests: BTreeSet<String>,
    pub(super) last_activity: u64,
}

/// A reservation of a group of targets
pub(super) struct Allocation {
    pub(super) id: AllocationId,
    pub(super) owner: String,
    pub(super) group: TargetGroup,
    /// Every target of the group, sorted and deduplicated
    pub(super) targets: Vec<TargetId>,
    pub(super) created_at: u64,
    pub(super) expiry: ExpiryPolicy,
    pub(super) inner: Mutex<AllocationInner>,
}

impl Allocation {
    fn state(&self) -> AllocationState {
        self.inner.lock().state
    }

    /// Owner or guest
    fn may_control(&self, name: &str) -> bool {
        self.owner == name || self.inner.lock().guests.contains(name)
    }

    fn touch(&self) {
        self.inner.lock().last_activity = current_time_millis();
    }

    fn is_expired(&self, now: u64) -> bool {
        match self.expiry {
            ExpiryPolicy::Never => false,
            ExpiryPolicy::Endtime { at } => deadline_passed(at, now),
            ExpiryPolicy::Idle { timeout } => {
                idle_expired(self.inner.lock().last_activity, timeout, now)
            }
        }
    }

    fn info(&self, queue_position: Option<usize>) -> AllocationInfo {
        let inner = self.inner.lock();
        AllocationInfo {
            id: self.id,
            owner: self.owner.clone(),
            state: inner.state,
            queue_position,
            group: self.group.clone(),
            guests: inner.guests.clone(),
            created_at: self.created_at,
            last_activity: inner.last_activity,
            expiry: self.expiry,
        }
    }
}

/// Outcome of trying to promote one queued allocation
enum Promotion {
    Granted,
    Blocked,
    /// Released while queued; drop it from the queue
    Gone,
}

/// Arbitrates target ownership among principals
pub struct AllocationManager {
    registry: Arc<TargetRegistry>,
    /// One slot per registered target; the key set never changes
    slots: HashMap<TargetId, Mutex<Slot>>,
    /// Live (queued or active) allocations
    pub(super) allocations: DashMap<AllocationId, Arc<Allocation>>,
    /// Queued allocation IDs in arrival order
    queue: Mutex<VecDeque<AllocationId>>,
    events: broadcast::Sender<AllocationEvent>,
}

impl AllocationManager {
    /// Create a manager with one ownership slot per registered target
    pub fn new(registry: Arc<TargetRegistry>) -> Self {
        let slots = registry
            .ids()
            .map(|id| (id.clone(), Mutex::new(Slot::default())))
            .collect();
        let (events, _) = broadcast::channel(256);
        Self {
            registry,
            slots,
            allocations: DashMap::new(),
            queue: Mutex::new(VecDeque::new()),
            events,
        }
    }

    /// Subscribe to allocation lifecycle events
    pub fn subscribe(&self) -> broadcast::Receiver<AllocationEvent> {
        self.events.subscribe()
    }

    fn emit(&self, event: AllocationEvent) {
        // No subscribers is fine
        let _ = self.events.send(event);
    }

    /// Lock the slots of `targets`, which must be sorted
    fn lock_slots(&self, targets: &[TargetId]) -> Result<Vec<MutexGuard<'_, Slot>>, BrokerError> {
        targets
            .iter()
            .map(|id| {
                self.slots
                    .get(id)
                    .map(|slot| slot.lock())
                    .ok_or_else(|| BrokerError::NotFound(format!("target {}", id)))
            })
            .collect()
    }

    pub(super) fn entry(&self, id: AllocationId) -> Result<Arc<Allocation>, BrokerError> {
        self.allocations
            .get(&id)
            .map(|r| Arc::clone(&r))
            .ok_or_else(|| BrokerError::NotFound(format!("allocation {}", id)))
    }

    /// Reserve a group of targets for `principal`
    ///
    /// Grants the whole group at once or nothing. When any target is busy
    /// the request fails with `Busy`, or, with `queue` set, is admitted to
    /// the FIFO queue and promoted later without further calls.
    pub fn acquire(
        &self,
        principal: &Principal,
        group: TargetGroup,
        queue: bool,
        expiry: ExpiryPolicy,
    ) -> Result<AcquireOutcome, BrokerError> {
        if group.is_empty() {
            return Err(BrokerError::InvalidInput("empty target group".into()));
        }
        if let Some((alias, _)) = group.iter().find(|(_, targets)| targets.is_empty()) {
            return Err(BrokerError::InvalidInput(format!(
                "group alias '{}' names no targets",
                alias
            )));
        }

        let targets: Vec<TargetId> = group
            .values()
            .flatten()
            .cloned()
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();
        for id in &targets {
            if !self.registry.get(id)?.is_enabled() {
                return Err(BrokerError::NotEnabled(format!("target {} is disabled", id)));
            }
        }

        let now = current_time_millis();
        let id = AllocationId::generate();
        let allocation = Arc::new(Allocation {
            id,
            owner: principal.name.clone(),
            group,
            targets,
            created_at: now,
            expiry,
            inner: Mutex::new(AllocationInner {
                state: AllocationState::Queued,
                guests: BTreeSet::new(),
                last_activity: now,
            }),
        });

        let blocked = {
            let mut slots = self.lock_slots(&allocation.targets)?;
            let blocked: Vec<(TargetId, AllocationId)> = allocation
                .targets
                .iter()
                .zip(slots.iter())
                .filter_map(|(target, slot)| slot.owner.map(|owner| (target.clone(), owner)))
                .collect();

            if blocked.is_empty() {
                for slot in slots.iter_mut() {
                    slot.owner = Some(id);
                }
                allocation.inner.lock().state = AllocationState::Active;
                self.allocations.insert(id, Arc::clone(&allocation));
                drop(slots);

                tracing::info!(
                    allocation = %id,
                    owner = %principal,
                    targets = ?allocation.targets,
                    "Allocation granted"
                );
                self.emit(AllocationEvent::Granted {
                    id,
                    owner: principal.name.clone(),
                });
                return Ok(AcquireOutcome::Granted(id));
            }

            if queue {
                // Visible to promotion before the slots are unlocked
                self.allocations.insert(id, Arc::clone(&allocation));
            }
            blocked
        };

        if !queue {
            return Err(BrokerError::Busy(self.describe_blocked(&blocked)));
        }

        let position = {
            let mut queue = self.queue.lock();
            queue.push_back(id);
            queue.len()
        };
        tracing::info!(
            allocation = %id,
            owner = %principal,
            position,
            "Allocation queued"
        );
        self.emit(AllocationEvent::Queued { id, position });

        // The holders may have released between unlocking the slots and
        // joining the queue; nobody else would promote us then.
        self.promote_waiting();
        if allocation.state() == AllocationState::Active {
            return Ok(AcquireOutcome::Granted(id));
        }
        Ok(AcquireOutcome::Queued {
            id,
            position: self.queue_position(id).unwrap_or(position),
        })
    }

    fn describe_blocked(&self, blocked: &[(TargetId, AllocationId)]) -> String {
        let parts: Vec<String> = blocked
            .iter()
            .map(|(target, owner)| match self.allocations.get(owner) {
                Some(holder) => format!("{} (held by {})", target, holder.owner),
                // Released after we looked; the caller may simply retry
                None => format!("{} (held by allocation {})", target, owner),
            })
            .collect();
        format!("targets busy: {}", parts.join(", "))
    }

    /// Release an allocation
    ///
    /// Only the owner may release, or an admin passing `force`. Releasing
    /// an active allocation immediately promotes whatever queued
    /// allocations can now be satisfied.
    pub fn release(
        &self,
        id: AllocationId,
        principal: &Principal,
        force: bool,
    ) -> Result<(), BrokerError> {
        let allocation = self.entry(id)?;
        if allocation.owner != principal.name && !(principal.admin && force) {
            return Err(BrokerError::Unauthorized(format!(
                "{} does not own allocation {}",
                principal, id
            )));
        }

        let was_active = self.finish(&allocation)?;
        let forced = allocation.owner != principal.name;
        tracing::info!(allocation = %id, by = %principal, forced, "Allocation released");
        self.emit(AllocationEvent::Released { id, forced });

        if was_active {
            self.promote_waiting();
        }
        Ok(())
    }

    /// Force-release an allocation whose expiry policy has run out
    pub(super) fn expire(&self, id: AllocationId) -> Result<(), BrokerError> {
        let allocation = self.entry(id)?;
        let was_active = self.finish(&allocation)?;
        tracing::info!(allocation = %id, owner = %allocation.owner, "Allocation expired");
        self.emit(AllocationEvent::Expired { id });

        if was_active {
            self.promote_waiting();
        }
        Ok(())
    }

    /// Move an allocation to `Released`, returning whether it was active
    fn finish(&self, allocation: &Allocation) -> Result<bool, BrokerError> {
        let was_active = match allocation.state() {
            AllocationState::Released => {
                return Err(BrokerError::Conflict(format!(
                    "allocation {} is already released",
                    allocation.id
                )))
            }
            AllocationState::Queued => {
                // Promotion may win the race; then release it as active
                !self.release_queued(allocation)?
            }
            AllocationState::Active => true,
        };
        if was_active {
            self.release_active(allocation)?;
        }
        self.allocations.remove(&allocation.id);
        Ok(was_active)
    }

    /// Returns `false` if the allocation was promoted in the meantime
    fn release_queued(&self, allocation: &Allocation) -> Result<bool, BrokerError> {
        // Promotion runs under the queue lock, so holding it settles the race
        let mut queue = self.queue.lock();
        let mut inner = allocation.inner.lock();
        match inner.state {
            AllocationState::Queued => {
                inner.state = AllocationState::Released;
                queue.retain(|queued| *queued != allocation.id);
                Ok(true)
            }
            AllocationState::Active => Ok(false),
            AllocationState::Released => Err(BrokerError::Conflict(format!(
                "allocation {} is already released",
                allocation.id
            ))),
        }
    }

    fn release_active(&self, allocation: &Allocation) -> Result<(), BrokerError> {
        let mut slots = self.lock_slots(&allocation.targets)?;
        let mut inner = allocation.inner.lock();
        if inner.state == AllocationState::Released {
            return Err(BrokerError::Conflict(format!(
                "allocation {} is already released",
                allocation.id
            )));
        }

        // Check every slot before touching any of them
        for (target, slot) in allocation.targets.iter().zip(slots.iter()) {
            if slot.owner != Some(allocation.id) {
                tracing::error!(
                    allocation = %allocation.id,
                    target = %target,
                    recorded_owner = ?slot.owner,
                    "Ownership map disagrees with active allocation"
                );
                return Err(BrokerError::InvariantViolation(format!(
                    "target {} is not owned by active allocation {}",
                    target, allocation.id
                )));
            }
        }
        for slot in slots.iter_mut() {
            slot.owner = None;
        }
        inner.state = AllocationState::Released;
        Ok(())
    }

    /// Grant every queued allocation whose whole group is now free, in
    /// arrival order; blocked entries keep their place without holding
    /// back the ones behind them.
    fn promote_waiting(&self) {
        let mut promoted = Vec::new();
        {
            let mut queue = self.queue.lock();
            queue.retain(|id| {
                let Some(allocation) = self.allocations.get(id).map(|r| Arc::clone(&r)) else {
                    return false;
                };
                match self.try_promote(&allocation) {
                    Promotion::Granted => {
                        promoted.push(*id);
                        false
                    }
                    Promotion::Blocked => true,
                    Promotion::Gone => false,
                }
            });
        }

        for id in promoted {
            tracing::info!(allocation = %id, "Queued allocation promoted");
            self.emit(AllocationEvent::Promoted { id });
        }
    }

    fn try_promote(&self, allocation: &Allocation) -> Promotion {
        let Ok(mut slots) = self.lock_slots(&allocation.targets) else {
            return Promotion::Gone;
        };
        if slots.iter().any(|slot| slot.owner.is_some()) {
            return Promotion::Blocked;
        }

        let mut inner = allocation.inner.lock();
        if inner.state != AllocationState::Queued {
            return Promotion::Gone;
        }
        for slot in slots.iter_mut() {
            slot.owner = Some(allocation.id);
        }
        inner.state = AllocationState::Active;
        inner.last_activity = current_time_millis();
        Promotion::Granted
    }

    fn queue_position(&self, id: AllocationId) -> Option<usize> {
        self.queue
            .lock()
            .iter()
            .position(|queued| *queued == id)
            .map(|index| index + 1)
    }

    /// Describe one allocation
    pub fn get(&self, id: AllocationId) -> Result<AllocationInfo, BrokerError> {
        let allocation = self.entry(id)?;
        Ok(allocation.info(self.queue_position(id)))
    }

    /// Describe every live allocation, oldest first
    pub fn list(&self) -> Vec<AllocationInfo> {
        let entries: Vec<Arc<Allocation>> =
            self.allocations.iter().map(|r| Arc::clone(&r)).collect();
        let queue: Vec<AllocationId> = self.queue.lock().iter().copied().collect();

        let mut infos: Vec<AllocationInfo> = entries
            .iter()
            .map(|a| a.info(queue.iter().position(|q| *q == a.id).map(|i| i + 1)))
            .collect();
        infos.sort_by_key(|info| info.created_at);
        infos
    }

    /// Refresh an allocation's idle timer
    pub fn keepalive(&self, id: AllocationId, principal: &Principal) -> Result<(), BrokerError> {
        let allocation = self.entry(id)?;
        if !allocation.may_control(&principal.name) {
            return Err(BrokerError::Unauthorized(format!(
                "{} is not a member of allocation {}",
                principal, id
            )));
        }
        allocation.touch();
        Ok(())
    }

    /// Active allocation currently owning `target`, if any
    pub fn owner_of(&self, target: &TargetId) -> Result<Option<AllocationId>, BrokerError> {
        self.registry.get(target)?;
        Ok(self.slots.get(target).and_then(|slot| slot.lock().owner))
    }

    /// Verify `principal` controls `target` through an active allocation
    ///
    /// Counts as activity on that allocation.
    pub fn check_access(
        &self,
        target: &TargetId,
        principal: &Principal,
    ) -> Result<AllocationId, BrokerError> {
        let Some(id) = self.owner_of(target)? else {
            return Err(BrokerError::Unauthorized(format!(
                "target {} is not allocated",
                target
            )));
        };
        match self.allocations.get(&id).map(|r| Arc::clone(&r)) {
            Some(allocation) if allocation.may_control(&principal.name) => {
                allocation.touch();
                Ok(id)
            }
            _ => Err(BrokerError::Unauthorized(format!(
                "{} has no allocation over target {}",
                principal, target
            ))),
        }
    }

    /// Allocations whose expiry policy has run out at `now`
    pub fn expired(&self, now: u64) -> Vec<AllocationId> {
        self.allocations
            .iter()
            .filter(|r| r.is_expired(now))
            .map(|r| *r.key())
            .collect()
    }

    /// Number of live allocations
    pub fn len(&self) -> usize {
        self.allocations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.allocations.is_empty()
    }

    /// Number of allocations waiting in the queue
    pub fn queued(&self) -> usize {
        self.queue.lock().len()
    }
}
