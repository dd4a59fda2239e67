//! Guest management
//!
//! Guests may use an allocation's targets but cannot release it or manage
//! its guest list.

use std::collections::BTreeSet;

use tb_core::{AllocationId, BrokerError, Principal};

use super::manager::{Allocation, AllocationInner};
use super::{AllocationManager, AllocationState};

fn managed_by(allocation: &Allocation, principal: &Principal) -> Result<(), BrokerError> {
    if allocation.owner == principal.name || principal.admin {
        Ok(())
    } else {
        Err(BrokerError::Unauthorized(format!(
            "{} may not manage guests of allocation {}",
            principal, allocation.id
        )))
    }
}

fn live(allocation: &Allocation, inner: &AllocationInner) -> Result<(), BrokerError> {
    if inner.state == AllocationState::Released {
        return Err(BrokerError::Conflict(format!(
            "allocation {} is already released",
            allocation.id
        )));
    }
    Ok(())
}

impl AllocationManager {
    /// Grant `user` access to the allocation's targets
    ///
    /// Adding an existing guest is a no-op.
    pub fn guest_add(
        &self,
        id: AllocationId,
        principal: &Principal,
        user: &str,
    ) -> Result<(), BrokerError> {
        let user = user.trim();
        if user.is_empty() {
            return Err(BrokerError::InvalidInput("empty guest name".into()));
        }

        let allocation = self.entry(id)?;
        managed_by(&allocation, principal)?;
        if allocation.owner == user {
            return Err(BrokerError::InvalidInput(format!(
                "{} already owns allocation {}",
                user, id
            )));
        }

        let mut inner = allocation.inner.lock();
        live(&allocation, &inner)?;
        if inner.guests.insert(user.to_string()) {
            tracing::info!(allocation = %id, guest = user, by = %principal, "Guest added");
        }
        Ok(())
    }

    /// Revoke a guest's access
    pub fn guest_remove(
        &self,
        id: AllocationId,
        principal: &Principal,
        user: &str,
    ) -> Result<(), BrokerError> {
        let allocation = self.entry(id)?;
        managed_by(&allocation, principal)?;

        let mut inner = allocation.inner.lock();
        live(&allocation, &inner)?;
        if !inner.guests.remove(user) {
            return Err(BrokerError::NotFound(format!(
                "{} is not a guest of allocation {}",
                user, id
            )));
        }
        tracing::info!(allocation = %id, guest = user, by = %principal, "Guest removed");
        Ok(())
    }

    /// Current guests; visible to the owner, guests and admins
    pub fn guests(
        &self,
        id: AllocationId,
        principal: &Principal,
    ) -> Result<BTreeSet<String>, BrokerError> {
        let allocation = self.entry(id)?;
        let inner = allocation.inner.lock();
        let member = allocation.owner == principal.name || inner.guests.contains(&principal.name);
        if !member && !principal.admin {
            return Err(BrokerError::Unauthorized(format!(
                "{} is not a member of allocation {}",
                principal, id
            )));
        }
        Ok(inner.guests.clone())
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;
    use std::sync::Arc;

    use tb_core::{ErrorKind, Principal, TargetId};

    use crate::allocation::{AllocationManager, ExpiryPolicy, TargetGroup};
    use crate::registry::tests::qemu_target;
    use crate::registry::TargetRegistry;

    fn setup() -> (AllocationManager, tb_core::AllocationId) {
        let registry = Arc::new(TargetRegistry::new(vec![qemu_target("a")]));
        let mgr = AllocationManager::new(registry);
        let mut group = TargetGroup::new();
        group.insert("dut".into(), BTreeSet::from([TargetId::new("a")]));
        let id = mgr
            .acquire(&Principal::user("alice"), group, false, ExpiryPolicy::Never)
            .unwrap()
            .id();
        (mgr, id)
    }

    #[test]
    fn test_guest_gets_access() {
        let (mgr, id) = setup();
        let alice = Principal::user("alice");
        let bob = Principal::user("bob");
        let target = TargetId::new("a");

        assert!(mgr.check_access(&target, &bob).is_err());
        mgr.guest_add(id, &alice, "bob").unwrap();
        assert_eq!(mgr.check_access(&target, &bob).unwrap(), id);
        assert!(mgr.guests(id, &bob).unwrap().contains("bob"));

        mgr.guest_remove(id, &alice, "bob").unwrap();
        assert_eq!(
            mgr.check_access(&target, &bob).unwrap_err().kind(),
            ErrorKind::Unauthorized
        );
    }

    #[test]
    fn test_guest_add_idempotent() {
        let (mgr, id) = setup();
        let alice = Principal::user("alice");
        mgr.guest_add(id, &alice, "bob").unwrap();
        mgr.guest_add(id, &alice, "bob").unwrap();
        assert_eq!(mgr.guests(id, &alice).unwrap().len(), 1);
    }

    #[test]
    fn test_guest_cannot_manage_or_release() {
        let (mgr, id) = setup();
        let alice = Principal::user("alice");
        let bob = Principal::user("bob");
        mgr.guest_add(id, &alice, "bob").unwrap();

        assert_eq!(
            mgr.guest_add(id, &bob, "carol").unwrap_err().kind(),
            ErrorKind::Unauthorized
        );
        assert_eq!(
            mgr.release(id, &bob, false).unwrap_err().kind(),
            ErrorKind::Unauthorized
        );
    }

    #[test]
    fn test_owner_cannot_be_guest() {
        let (mgr, id) = setup();
        let err = mgr
            .guest_add(id, &Principal::user("alice"), "alice")
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidInput);
    }

    #[test]
    fn test_remove_unknown_guest() {
        let (mgr, id) = setup();
        let err = mgr
            .guest_remove(id, &Principal::user("alice"), "nobody")
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    #[test]
    fn test_admin_manages_guests() {
        let (mgr, id) = setup();
        mgr.guest_add(id, &Principal::admin("root"), "bob").unwrap();
        assert!(mgr
            .guests(id, &Principal::user("alice"))
            .unwrap()
            .contains("bob"));
    }
}
