use serde::{Deserialize, Serialize};
use tracing::info;

use super::{public, visible_related, IdentityService};
use crate::error::{Error, Result};
use crate::query::{FilterSpec, ListQuery};
use crate::value::Record;

/// Fields accepted when creating a group
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewGroup {
    pub groupname: String,
    #[serde(rename = "type")]
    pub group_type: String,
    #[serde(default)]
    pub description: Option<String>,
}

impl NewGroup {
    pub fn new(groupname: impl Into<String>, group_type: impl Into<String>) -> Self {
        Self {
            groupname: groupname.into(),
            group_type: group_type.into(),
            description: None,
        }
    }

    #[must_use]
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupUpdate {
    #[serde(default, rename = "type")]
    pub group_type: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
}

impl GroupUpdate {
    fn into_record(self) -> Record {
        let mut row = Record::new();
        for (column, value) in [
            ("type", self.group_type),
            ("status", self.status),
            ("description", self.description),
        ] {
            if let Some(value) = value {
                row.set(column, value);
            }
        }
        row
    }
}

impl IdentityService {
    pub async fn create_group(&self, group: NewGroup) -> Result<Record> {
        if group.groupname.trim().is_empty() {
            return Err(Error::InvalidInput("groupname is required".to_string()));
        }
        let mut row = Record::new()
            .with("groupname", group.groupname)
            .with("type", group.group_type);
        if let Some(description) = group.description {
            row.set("description", description);
        }
        self.repos.groups.create(row).await
    }

    pub async fn get_group(&self, id: i64) -> Result<Record> {
        self.repos.groups.get(id).await
    }

    pub async fn list_groups(&self, query: &ListQuery) -> Result<Vec<Record>> {
        self.repos.groups.list(query).await
    }

    pub async fn update_group(&self, id: i64, update: GroupUpdate) -> Result<Record> {
        let changes = update.into_record();
        if changes.is_empty() {
            return Err(Error::InvalidInput("nothing to update".to_string()));
        }
        self.repos.groups.update(id, changes).await
    }

    pub async fn delete_group(&self, id: i64) -> Result<()> {
        self.repos.groups.delete(id, true).await?;
        Ok(())
    }

    pub async fn add_group_member(&self, group_id: i64, user_id: i64) -> Result<Record> {
        self.repos.groups.get(group_id).await?;
        self.repos.users.get(user_id).await?;

        let member = self
            .repos
            .group_users
            .create(
                Record::new()
                    .with("group_id", group_id)
                    .with("user_id", user_id),
            )
            .await?;
        info!(group_id, user_id, "Group member added");
        Ok(member)
    }

    pub async fn remove_group_member(&self, group_id: i64, user_id: i64) -> Result<()> {
        self.repos
            .group_users
            .delete(
                FilterSpec::new()
                    .with("group_id", group_id)
                    .with("user_id", user_id),
                false,
            )
            .await?;
        info!(group_id, user_id, "Group member removed");
        Ok(())
    }

    /// Visible members of a group in join order, without password hashes
    pub async fn group_members(&self, group_id: i64) -> Result<Vec<Record>> {
        self.repos.groups.get(group_id).await?;
        let rows = self
            .repos
            .group_users
            .list(
                &ListQuery::new(FilterSpec::new().with("group_id", group_id))
                    .with_sort(["id"], ["asc"])
                    .with_eager("user"),
            )
            .await?;

        Ok(rows
            .iter()
            .filter_map(|row| visible_related(row, "user"))
            .cloned()
            .map(public)
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::testing::{alice, service};
    use crate::identity::{NewUser, UserType};
    use crate::query::DeletedMode;

    #[tokio::test]
    async fn test_group_crud() {
        let svc = service();
        let group = svc
            .create_group(NewGroup::new("tellers", "branch").with_description("front desk"))
            .await
            .unwrap();
        let id = group.id().unwrap();
        assert_eq!(group.get_str("status"), Some("ACTIVE"));
        assert_eq!(group.get_str("type"), Some("branch"));

        let updated = svc
            .update_group(
                id,
                GroupUpdate {
                    status: Some("LOCKED".into()),
                    ..GroupUpdate::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(updated.get_str("status"), Some("LOCKED"));
        assert_eq!(updated.get_str("description"), Some("front desk"));

        assert!(matches!(
            svc.create_group(NewGroup::new("tellers", "branch")).await,
            Err(Error::AlreadyExists(_))
        ));

        svc.delete_group(id).await.unwrap();
        assert!(matches!(svc.get_group(id).await, Err(Error::NotFound(_))));
        // the name is free again once the old group is gone
        svc.create_group(NewGroup::new("tellers", "branch")).await.unwrap();
    }

    #[tokio::test]
    async fn test_group_membership() {
        let svc = service();
        let group_id = svc
            .create_group(NewGroup::new("tellers", "branch"))
            .await
            .unwrap()
            .id()
            .unwrap();
        let alice_id = svc.create_user(alice()).await.unwrap().id().unwrap();
        let bob_id = svc
            .create_user(NewUser::new("bob_02", "s3cret-pass", UserType::Bank))
            .await
            .unwrap()
            .id()
            .unwrap();

        svc.add_group_member(group_id, alice_id).await.unwrap();
        svc.add_group_member(group_id, bob_id).await.unwrap();
        assert!(matches!(
            svc.add_group_member(group_id, alice_id).await,
            Err(Error::AlreadyExists(_))
        ));

        let members = svc.group_members(group_id).await.unwrap();
        let names: Vec<_> = members.iter().filter_map(|m| m.get_str("username")).collect();
        assert_eq!(names, ["alice01", "bob_02"]);
        assert!(members.iter().all(|m| !m.contains("password")));

        svc.delete_user(bob_id).await.unwrap();
        assert_eq!(svc.group_members(group_id).await.unwrap().len(), 1);

        svc.remove_group_member(group_id, alice_id).await.unwrap();
        assert!(svc.group_members(group_id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_member_can_rejoin_after_removal() {
        let svc = service();
        let group_id = svc
            .create_group(NewGroup::new("tellers", "branch"))
            .await
            .unwrap()
            .id()
            .unwrap();
        let alice_id = svc.create_user(alice()).await.unwrap().id().unwrap();

        svc.add_group_member(group_id, alice_id).await.unwrap();
        svc.remove_group_member(group_id, alice_id).await.unwrap();
        svc.add_group_member(group_id, alice_id).await.unwrap();
        svc.remove_group_member(group_id, alice_id).await.unwrap();
        assert!(matches!(
            svc.remove_group_member(group_id, alice_id).await,
            Err(Error::NotFound(_))
        ));

        let rows = svc
            .repositories()
            .group_users
            .list(
                &ListQuery::new(FilterSpec::new().with("group_id", group_id))
                    .with_deleted(DeletedMode::Yes),
            )
            .await
            .unwrap();
        assert!(rows.is_empty());
    }

    #[tokio::test]
    async fn test_membership_requires_existing_rows() {
        let svc = service();
        let user_id = svc.create_user(alice()).await.unwrap().id().unwrap();
        assert!(matches!(
            svc.add_group_member(42, user_id).await,
            Err(Error::NotFound(_))
        ));
        assert!(matches!(svc.group_members(42).await, Err(Error::NotFound(_))));
    }
}
