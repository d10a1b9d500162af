//! Initial account setup
//!
//! A fresh device may still carry a factory password for the account the
//! request connects with. Before any configuration is applied, the declared
//! password is set either over REST (caller knows the current password) or
//! over a key-authenticated shell (caller only has a key).

use serde_json::Value;
use tracing::{debug, info};

use crate::declaration::{declared_password, find_user, find_user_mut};
use crate::device::{ConnectionInfo, DeviceError, DeviceProvider, ShellRunner};

const ROOT_USER: &str = "root";

/// REST reset: caller gave a username and password, and the declaration sets
/// a different password for that user
pub fn needs_password_reset(conn: &ConnectionInfo, declaration: &Value) -> bool {
    let (Some(username), Some(password)) = (conn.username.as_deref(), conn.password.as_deref()) else {
        return false;
    };
    declared_password(declaration, username).is_some_and(|declared| declared != password)
}

/// Shell reset: caller gave a key and no password, and the declaration sets a
/// password for that user
pub fn needs_ssh_password_reset(conn: &ConnectionInfo, declaration: &Value) -> bool {
    if conn.ssh_key_path.is_none() || conn.password.is_some() {
        return false;
    }
    conn.username
        .as_deref()
        .is_some_and(|username| declared_password(declaration, username).is_some())
}

pub struct AccountSetup<'a> {
    provider: &'a dyn DeviceProvider,
    shell: &'a dyn ShellRunner,
}

impl<'a> AccountSetup<'a> {
    pub fn new(provider: &'a dyn DeviceProvider, shell: &'a dyn ShellRunner) -> Self {
        Self { provider, shell }
    }

    /// Rotate the primary account password if needed
    ///
    /// Returns the connection info to use from here on. The declaration's
    /// root `oldPassword` may be repaired in place.
    pub async fn run(&self, conn: ConnectionInfo, declaration: &mut Value) -> Result<ConnectionInfo, DeviceError> {
        debug!(host = %conn.host, username = ?conn.username, "AccountSetup::run: called");

        if needs_password_reset(&conn, declaration) {
            return self.rest_reset(conn, declaration).await;
        }
        if needs_ssh_password_reset(&conn, declaration) {
            return self.shell_reset(conn, declaration).await;
        }

        debug!("AccountSetup::run: no password reset needed");
        Ok(conn)
    }

    async fn rest_reset(&self, conn: ConnectionInfo, declaration: &mut Value) -> Result<ConnectionInfo, DeviceError> {
        let (username, new_password) = target_credentials(&conn, declaration)?;
        info!(%username, "Resetting account password over REST");

        let device = self.provider.connect(&conn).await?;
        device.set_password(&username, &new_password).await?;

        let conn = ConnectionInfo {
            password: Some(new_password.clone()),
            ..conn
        };
        self.repair_root_old_password(&conn, declaration, &new_password).await?;
        Ok(conn)
    }

    async fn shell_reset(&self, conn: ConnectionInfo, declaration: &mut Value) -> Result<ConnectionInfo, DeviceError> {
        let (username, new_password) = target_credentials(&conn, declaration)?;
        info!(%username, "Resetting account password over shell");

        self.shell.set_password(&conn, &username, &new_password).await?;

        let conn = ConnectionInfo {
            password: Some(new_password.clone()),
            ..conn
        };
        self.repair_root_old_password(&conn, declaration, &new_password).await?;
        Ok(conn)
    }

    /// Point root `oldPassword` at the new primary password when that is what root uses
    ///
    /// Probed with a root password change from and to the new password. A
    /// mismatch leaves the declaration alone; any other failure aborts setup.
    async fn repair_root_old_password(
        &self,
        conn: &ConnectionInfo,
        declaration: &mut Value,
        new_password: &str,
    ) -> Result<(), DeviceError> {
        if root_old_password(declaration).is_none() {
            return Ok(());
        }
        let device = self.provider.connect(conn).await?;
        match device.change_root_password(new_password, new_password).await {
            Ok(()) => {
                info!("Root password matches the new account password, repairing oldPassword");
                set_root_old_password(declaration, new_password);
                Ok(())
            }
            Err(DeviceError::CredentialMismatch) => {
                debug!("repair_root_old_password: root oldPassword left as declared");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }
}

fn target_credentials(conn: &ConnectionInfo, declaration: &Value) -> Result<(String, String), DeviceError> {
    let username = conn
        .username
        .clone()
        .ok_or_else(|| DeviceError::Shell("no target username".to_string()))?;
    let password = declared_password(declaration, &username)
        .ok_or_else(|| DeviceError::Shell(format!("no password declared for {}", username)))?;
    Ok((username, password))
}

fn root_old_password(declaration: &Value) -> Option<&str> {
    find_user(declaration, ROOT_USER)?.get("oldPassword")?.as_str()
}

fn set_root_old_password(declaration: &mut Value, password: &str) {
    if let Some(Value::Object(root)) = find_user_mut(declaration, ROOT_USER) {
        root.insert("oldPassword".to_string(), Value::String(password.to_string()));
    }
}
