use crate::types::now_secs;
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum MemberRole {
    Admin,
    Member,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum MemberStatus {
    Invited,
    Active,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Member {
    pub role: MemberRole,
    pub status: MemberStatus,
}

/// One structured membership/metadata operation within a revision.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "camelCase")]
pub enum GroupDelta {
    AddMember { member: String, role: MemberRole },
    RemoveMember { member: String },
    ChangeRole { member: String, role: MemberRole },
    PromoteInvited { member: String },
    RotateKey,
    SetTitle { title: String },
    SetAvatar { avatar: Option<String> },
}

/// Membership and metadata of one group at one revision.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GroupState {
    pub id: String,
    pub revision: u64,
    pub title: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub avatar: Option<String>,
    pub members: BTreeMap<String, Member>,
    pub key_generation: u32,
    pub created_at: u64,
    /// Proposer of the currently stored revision; the same-revision
    /// tie-break compares against this.
    pub last_proposer: String,
}

impl GroupState {
    /// Empty state a creating update is applied onto. The creator enters as
    /// an active admin so the first delta batch passes the admin gate.
    pub fn genesis(id: impl Into<String>, creator: &str) -> Self {
        let mut members = BTreeMap::new();
        members.insert(
            creator.to_string(),
            Member {
                role: MemberRole::Admin,
                status: MemberStatus::Active,
            },
        );
        Self {
            id: id.into(),
            revision: 0,
            title: String::new(),
            avatar: None,
            members,
            key_generation: 0,
            created_at: now_secs(),
            last_proposer: creator.to_string(),
        }
    }

    pub fn is_admin(&self, member: &str) -> bool {
        matches!(
            self.members.get(member),
            Some(Member {
                role: MemberRole::Admin,
                ..
            })
        )
    }

    pub fn admin_count(&self) -> usize {
        self.members
            .values()
            .filter(|m| m.role == MemberRole::Admin)
            .count()
    }

    /// Apply one delta in place. Errors leave `self` partially modified;
    /// callers apply batches on a clone and persist only on full success.
    pub fn apply_delta(&mut self, delta: &GroupDelta) -> Result<()> {
        match delta {
            GroupDelta::AddMember { member, role } => {
                if self.members.contains_key(member) {
                    return Err(Error::InvalidFlow(format!(
                        "{} is already a group member",
                        member
                    )));
                }
                self.members.insert(
                    member.clone(),
                    Member {
                        role: *role,
                        status: MemberStatus::Invited,
                    },
                );
            }
            GroupDelta::RemoveMember { member } => {
                let removed = self.members.remove(member);
                if removed.is_none() {
                    return Err(Error::InvalidFlow(format!("{} is not a member", member)));
                }
                if self.admin_count() == 0 {
                    return Err(Error::InvalidFlow(
                        "cannot remove the last admin".to_string(),
                    ));
                }
            }
            GroupDelta::ChangeRole { member, role } => {
                let entry = self
                    .members
                    .get_mut(member)
                    .ok_or_else(|| Error::InvalidFlow(format!("{} is not a member", member)))?;
                let was_admin = entry.role == MemberRole::Admin;
                entry.role = *role;
                if was_admin && *role != MemberRole::Admin && self.admin_count() == 0 {
                    return Err(Error::InvalidFlow(
                        "cannot demote the last admin".to_string(),
                    ));
                }
            }
            GroupDelta::PromoteInvited { member } => {
                let entry = self
                    .members
                    .get_mut(member)
                    .ok_or_else(|| Error::InvalidFlow(format!("{} is not a member", member)))?;
                entry.status = MemberStatus::Active;
            }
            GroupDelta::RotateKey => {
                self.key_generation += 1;
            }
            GroupDelta::SetTitle { title } => {
                self.title = title.clone();
            }
            GroupDelta::SetAvatar { avatar } => {
                self.avatar = avatar.clone();
            }
        }
        Ok(())
    }
}
