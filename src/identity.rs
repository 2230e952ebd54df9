use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::diagnostics::Diagnostics;
use crate::error::ErrorKind;
use crate::remote::RemoteStore;
use crate::storage::{keys, SafeStorage};

const LOCAL_PREFIX: &str = "local-";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Identity {
    Remote { user_id: String },
    Local { fallback_id: String },
}

impl Identity {
    pub fn local() -> Self {
        Identity::Local {
            fallback_id: format!("{LOCAL_PREFIX}{}", Uuid::new_v4()),
        }
    }

    pub fn id(&self) -> &str {
        match self {
            Identity::Remote { user_id } => user_id,
            Identity::Local { fallback_id } => fallback_id,
        }
    }

    pub fn remote_user_id(&self) -> Option<&str> {
        match self {
            Identity::Remote { user_id } => Some(user_id),
            Identity::Local { .. } => None,
        }
    }

    fn from_stored(id: String) -> Self {
        if id.starts_with(LOCAL_PREFIX) {
            Identity::Local { fallback_id: id }
        } else {
            Identity::Remote { user_id: id }
        }
    }
}

/// Resolves the identity for this load. Order: honour a pending "just reset"
/// skip, reuse a stored remote identity, sign in anonymously, reuse a stored
/// local identity, mint a new local one.
pub async fn bootstrap(
    storage: &SafeStorage,
    remote: Option<&dyn RemoteStore>,
    diagnostics: &Diagnostics,
) -> Identity {
    if storage.read_flag(keys::JUST_RESET).unwrap_or(false) {
        if let Err(error) = storage.remove(keys::JUST_RESET) {
            diagnostics.record(
                ErrorKind::LocalStorageFailed,
                "failed to clear the reset marker",
                Some(error.to_string()),
            );
        }
        tracing::info!("skipping silent sign-in after reset");
        return Identity::local();
    }

    let reuse = storage.read_flag(keys::AUTO_IDENTITY).unwrap_or(false);
    let stored = storage
        .read_string(keys::IDENTITY)
        .ok()
        .flatten()
        .filter(|id| !id.trim().is_empty())
        .map(Identity::from_stored);

    if reuse {
        if let Some(identity @ Identity::Remote { .. }) = &stored {
            tracing::debug!(id = identity.id(), "reusing stored identity");
            return identity.clone();
        }
    }

    if let Some(remote) = remote {
        match remote.sign_in_anonymously().await {
            Ok(session) => {
                let identity = Identity::Remote {
                    user_id: session.user_id,
                };
                remember(storage, &identity, diagnostics);
                return identity;
            }
            Err(error) => {
                diagnostics.record(
                    ErrorKind::RemoteSyncFailed,
                    "anonymous sign-in failed; playing offline",
                    Some(error.to_string()),
                );
            }
        }
    }

    match stored {
        Some(identity @ Identity::Local { .. }) => identity,
        _ => {
            let identity = Identity::local();
            remember(storage, &identity, diagnostics);
            identity
        }
    }
}

fn remember(storage: &SafeStorage, identity: &Identity, diagnostics: &Diagnostics) {
    let result = storage
        .write_string(keys::IDENTITY, identity.id())
        .and_then(|_| storage.write_flag(keys::AUTO_IDENTITY, true));
    if let Err(error) = result {
        diagnostics.record(
            ErrorKind::LocalStorageFailed,
            "identity not saved on this device",
            Some(error.to_string()),
        );
    }
}

pub fn forget(storage: &SafeStorage) -> Result<(), crate::storage::StorageError> {
    let results = [
        storage.remove(keys::IDENTITY),
        storage.remove(keys::AUTO_IDENTITY),
        storage.write_flag(keys::JUST_RESET, true),
    ];
    results.into_iter().collect::<Result<Vec<_>, _>>().map(|_| ())
}
