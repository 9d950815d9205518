use tracing::info;

use super::{visible_related, IdentityService};
use crate::error::{Error, Result};
use crate::query::{FilterSpec, ListQuery};
use crate::value::Record;

impl IdentityService {
    pub async fn create_role(&self, name: &str, description: Option<&str>) -> Result<Record> {
        if name.trim().is_empty() {
            return Err(Error::InvalidInput("role name is required".to_string()));
        }
        let mut row = Record::new().with("name", name);
        if let Some(description) = description {
            row.set("description", description);
        }
        self.repos.roles.create(row).await
    }

    pub async fn get_role(&self, id: i64) -> Result<Record> {
        self.repos.roles.get(id).await
    }

    pub async fn get_role_by_name(&self, name: &str) -> Result<Record> {
        self.repos
            .roles
            .get_by_exact_filter(&FilterSpec::new().with("name", name))
            .await
    }

    pub async fn list_roles(&self, query: &ListQuery) -> Result<Vec<Record>> {
        self.repos.roles.list(query).await
    }

    pub async fn update_role(&self, id: i64, description: &str) -> Result<Record> {
        self.repos
            .roles
            .update(id, Record::new().with("description", description))
            .await
    }

    /// Soft-delete a role; existing grants stay until revoked
    pub async fn delete_role(&self, id: i64) -> Result<()> {
        self.repos.roles.delete(id, true).await?;
        Ok(())
    }

    /// Grant a role by name; fails with [`Error::NotFound`] for an unknown
    /// user or role and [`Error::AlreadyExists`] for a repeated grant
    pub async fn grant_role(&self, user_id: i64, role_name: &str) -> Result<Record> {
        let user = self.repos.users.get(user_id).await?;
        let role = self.get_role_by_name(role_name).await?;

        let grant = self
            .repos
            .user_roles
            .create(
                Record::new()
                    .with("user_id", user_id)
                    .with("role_id", role.id().unwrap_or_default()),
            )
            .await?;
        info!(
            user_id,
            username = user.get_str("username").unwrap_or_default(),
            role = role_name,
            "Role granted"
        );
        Ok(grant)
    }

    pub async fn revoke_role(&self, user_id: i64, role_name: &str) -> Result<()> {
        let role = self.get_role_by_name(role_name).await?;
        self.repos
            .user_roles
            .delete(
                FilterSpec::new()
                    .with("user_id", user_id)
                    .with("role_id", role.id().unwrap_or_default()),
                false,
            )
            .await?;
        info!(user_id, role = role_name, "Role revoked");
        Ok(())
    }

    /// Names of the visible roles granted to a user, oldest grant first
    pub async fn user_role_names(&self, user_id: i64) -> Result<Vec<String>> {
        let grants = self
            .repos
            .user_roles
            .list(
                &ListQuery::new(FilterSpec::new().with("user_id", user_id))
                    .with_sort(["id"], ["asc"])
                    .with_eager("role"),
            )
            .await?;

        Ok(grants
            .iter()
            .filter_map(|grant| visible_related(grant, "role"))
            .filter_map(|role| role.get_str("name").map(str::to_string))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use crate::error::Error;
    use crate::identity::testing::{alice, service};
    use crate::query::{DeletedMode, FilterSpec, ListQuery};

    #[tokio::test]
    async fn test_grant_list_revoke() {
        let svc = service();
        let id = svc.create_user(alice()).await.unwrap().id().unwrap();
        svc.create_role("admin", Some("full access")).await.unwrap();
        svc.create_role("auditor", None).await.unwrap();

        svc.grant_role(id, "admin").await.unwrap();
        svc.grant_role(id, "auditor").await.unwrap();
        assert_eq!(svc.user_role_names(id).await.unwrap(), ["admin", "auditor"]);

        assert!(matches!(
            svc.grant_role(id, "admin").await,
            Err(Error::AlreadyExists(_))
        ));

        svc.revoke_role(id, "admin").await.unwrap();
        assert_eq!(svc.user_role_names(id).await.unwrap(), ["auditor"]);
        assert!(matches!(
            svc.revoke_role(id, "admin").await,
            Err(Error::NotFound(_))
        ));

        // granting again after a revoke reuses the freed unique slot
        svc.grant_role(id, "admin").await.unwrap();
    }

    #[tokio::test]
    async fn test_grant_unknown_role_or_user() {
        let svc = service();
        let id = svc.create_user(alice()).await.unwrap().id().unwrap();
        assert!(matches!(
            svc.grant_role(id, "ghost").await,
            Err(Error::NotFound(_))
        ));
        svc.create_role("admin", None).await.unwrap();
        assert!(matches!(
            svc.grant_role(999, "admin").await,
            Err(Error::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_deleted_role_drops_from_names() {
        let svc = service();
        let id = svc.create_user(alice()).await.unwrap().id().unwrap();
        let role = svc.create_role("admin", None).await.unwrap();
        svc.grant_role(id, "admin").await.unwrap();

        svc.delete_role(role.id().unwrap()).await.unwrap();
        assert!(svc.user_role_names(id).await.unwrap().is_empty());
        assert!(svc.get_user(id).await.unwrap().roles.is_empty());
    }

    #[tokio::test]
    async fn test_revoke_leaves_no_grant_behind() {
        let svc = service();
        let id = svc.create_user(alice()).await.unwrap().id().unwrap();
        let role_id = svc.create_role("admin", None).await.unwrap().id().unwrap();

        for _ in 0..3 {
            svc.grant_role(id, "admin").await.unwrap();
            svc.revoke_role(id, "admin").await.unwrap();
        }

        let grants = svc
            .repositories()
            .user_roles
            .list(&ListQuery::new(FilterSpec::new().with("user_id", id)).with_deleted(DeletedMode::Yes))
            .await
            .unwrap();
        assert!(grants.is_empty());

        // nothing references the role any more
        svc.repositories().roles.delete(role_id, false).await.unwrap();
    }
}
