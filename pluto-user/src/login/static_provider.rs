use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;

use crate::config::{read_config, UserEntry, UserList};
use crate::login::{verify_password, AuthError, LoginProvider, UserDescriptor};

/// Flat-file authenticator: the user list is loaded once at boot. The same
/// file also seeds provisioning on workers and storage, so both sides agree
/// on user ids.
pub struct StaticLoginProvider {
    users: HashMap<String, Arc<UserEntry>>,
}

impl StaticLoginProvider {
    pub fn new(user_list_path: PathBuf) -> anyhow::Result<Self> {
        let ulist: UserList = read_config(user_list_path)?;
        tracing::info!("{} users loaded", ulist.len());
        Ok(Self {
            users: ulist
                .into_iter()
                .map(|(username, entry)| (username, Arc::new(entry)))
                .collect(),
        })
    }
}

#[async_trait]
impl LoginProvider for StaticLoginProvider {
    async fn login(&self, username: &str, password: &str) -> Result<UserDescriptor, AuthError> {
        tracing::debug!(user = %username, "login");
        let entry = self.users.get(username).ok_or(AuthError::Failed)?;

        match verify_password(password, &entry.password) {
            Ok(true) => Ok(UserDescriptor {
                username: username.to_string(),
                user_id: entry.user_id,
            }),
            Ok(false) => Err(AuthError::Failed),
            Err(e) => Err(AuthError::Internal(e.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::login::hash_password;
    use std::io::Write;

    #[tokio::test]
    async fn verifies_against_the_user_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "[user6]\npassword = \"{}\"\nuser_id = 6",
            hash_password("password6").unwrap()
        )
        .unwrap();

        let provider = StaticLoginProvider::new(file.path().to_path_buf()).unwrap();

        let who = provider.login("user6", "password6").await.unwrap();
        assert_eq!(who.username, "user6");
        assert_eq!(who.user_id, 6);

        assert!(matches!(
            provider.login("user6", "wrong").await,
            Err(AuthError::Failed)
        ));
        assert!(matches!(
            provider.login("nobody", "password6").await,
            Err(AuthError::Failed)
        ));
    }
}
