// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 relaymq.dev

//! Distributed-transaction identity and branch membership.

use dashmap::DashMap;

use crate::transport::TransactionId;

/// External identifier for one branch of a distributed transaction.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Xid {
    pub format_id: u32,
    pub global_id: Vec<u8>,
    pub branch_qualifier: Vec<u8>,
}

impl Xid {
    pub fn new(format_id: u32, global_id: Vec<u8>, branch_qualifier: Vec<u8>) -> Self {
        Self {
            format_id,
            global_id,
            branch_qualifier,
        }
    }
}

impl std::fmt::Display for Xid {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "xid:{:x}:", self.format_id)?;
        for b in &self.global_id {
            write!(f, "{b:02x}")?;
        }
        f.write_str(":")?;
        for b in &self.branch_qualifier {
            write!(f, "{b:02x}")?;
        }
        Ok(())
    }
}

/// Transaction-manager flags carried on XA start/end/commit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct XaFlags(pub u32);

impl XaFlags {
    pub const NONE: XaFlags = XaFlags(0);
    /// Joining a branch another resource already started.
    pub const JOIN: XaFlags = XaFlags(0x0020_0000);
    /// Resuming a suspended branch.
    pub const RESUME: XaFlags = XaFlags(0x0800_0000);
    /// Ending with failure; the branch becomes rollback-only.
    pub const FAIL: XaFlags = XaFlags(0x2000_0000);
    /// Ending normally.
    pub const SUCCESS: XaFlags = XaFlags(0x0400_0000);
    /// Suspending the branch.
    pub const SUSPEND: XaFlags = XaFlags(0x0200_0000);
    /// One-phase commit (no separate prepare).
    pub const ONE_PHASE: XaFlags = XaFlags(0x4000_0000);

    pub fn contains(self, other: XaFlags) -> bool {
        self.0 & other.0 == other.0
    }
}

#[derive(Debug)]
struct Branch {
    transaction_id: TransactionId,
    /// Resource instances enlisted in this branch.
    members: Vec<u64>,
    complete: bool,
}

/// Tracks which resource instances belong to which distributed branch, so a
/// late-registering resource joins the existing branch instead of starting
/// a duplicate one. Owned by the connection; registered branches outlive
/// individual sessions.
#[derive(Debug, Default)]
pub struct XaRegistry {
    branches: DashMap<Xid, Branch>,
}

impl XaRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Enlist `resource_id` under `xid`. Returns true when this call
    /// created the branch (the caller must start it on the broker); false
    /// means the branch exists and the caller joins it.
    pub fn enlist(&self, xid: &Xid, resource_id: u64) -> bool {
        let mut created = false;
        let mut branch = self.branches.entry(xid.clone()).or_insert_with(|| {
            created = true;
            Branch {
                transaction_id: -1,
                members: Vec::new(),
                complete: false,
            }
        });
        if !branch.members.contains(&resource_id) {
            branch.members.push(resource_id);
        }
        created
    }

    /// Record the broker-assigned id for a branch started on the wire.
    pub fn bind_transaction(&self, xid: &Xid, transaction_id: TransactionId) {
        if let Some(mut branch) = self.branches.get_mut(xid) {
            branch.transaction_id = transaction_id;
        }
    }

    /// Broker-assigned id for the branch, if started.
    pub fn transaction_for(&self, xid: &Xid) -> Option<TransactionId> {
        self.branches
            .get(xid)
            .map(|b| b.transaction_id)
            .filter(|id| *id >= 0)
    }

    /// All resources in the branch have ended their work.
    pub fn mark_complete(&self, xid: &Xid) {
        if let Some(mut branch) = self.branches.get_mut(xid) {
            branch.complete = true;
        }
    }

    pub fn is_complete(&self, xid: &Xid) -> bool {
        self.branches.get(xid).map(|b| b.complete).unwrap_or(false)
    }

    /// Drop the branch after commit/rollback settles it.
    pub fn remove(&self, xid: &Xid) {
        self.branches.remove(xid);
    }

    pub fn member_count(&self, xid: &Xid) -> usize {
        self.branches.get(xid).map(|b| b.members.len()).unwrap_or(0)
    }
}
