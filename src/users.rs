use std::{collections::HashMap, path::Path};

use anyhow::Context;
use russh::keys::PublicKey;
use serde::Deserialize;

// On-disk shape of a users file entry. The key, when present, is a single
// authorized-keys-format line.
#[derive(Debug, Deserialize)]
struct RawUser {
    #[serde(default)]
    password: Option<String>,
    #[serde(default)]
    key: Option<String>,
}

#[derive(Debug)]
struct User {
    password: Option<String>,
    key: Option<PublicKey>,
}

// Table of authorized users, loaded once at startup. Both predicates are
// side-effect-free; no lockout or throttling happens at this layer.
#[derive(Debug)]
pub(crate) struct UserStore {
    users: HashMap<String, User>,
}

impl UserStore {
    pub(crate) fn load(path: &Path) -> anyhow::Result<Self> {
        let data = std::fs::read_to_string(path)
            .with_context(|| format!("Error reading users file {}", path.display()))?;
        let raw: HashMap<String, RawUser> =
            serde_json::from_str(&data).with_context(|| "Error parsing users file")?;
        let users = raw
            .into_iter()
            .map(|(username, user)| {
                let key = match user.key {
                    Some(ref line) => Some(
                        PublicKey::from_openssh(line)
                            .with_context(|| format!("Invalid public key for user {username}"))?,
                    ),
                    None => None,
                };
                Ok((
                    username,
                    User {
                        password: user.password,
                        key,
                    },
                ))
            })
            .collect::<anyhow::Result<_>>()?;
        Ok(UserStore { users })
    }

    // TODO: support hashed passwords in the users file
    pub(crate) fn password_matches(&self, username: &str, password: &str) -> bool {
        self.users
            .get(username)
            .and_then(|user| user.password.as_deref())
            .is_some_and(|stored| stored == password)
    }

    pub(crate) fn key_matches(&self, username: &str, offered: &PublicKey) -> bool {
        self.users
            .get(username)
            .and_then(|user| user.key.as_ref())
            .is_some_and(|stored| stored.key_data() == offered.key_data())
    }
}
