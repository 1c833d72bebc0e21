//! Content-derived channel identity.
//!
//! A key is the lowercase hex SHA-256 of a canonical pre-image:
//!
//! - `direct-message:<ids>` for unnamed channels
//! - `text-channel:<name>:<ids>` for named channels
//! - `text-channel:<name>:<owner>:<ids>` when an owner is folded in
//!
//! where `<ids>` is the sorted, deduplicated member set joined by `,`.

use std::collections::BTreeSet;

use sha2::{Digest, Sha256};

use accord_types::{AccountId, ChannelKey};

use crate::error::{Error, Result};

pub fn derive_channel_key<'a, I>(
    member_ids: I,
    name: Option<&str>,
    owner_id: Option<&AccountId>,
) -> Result<ChannelKey>
where
    I: IntoIterator<Item = &'a AccountId>,
{
    let members: BTreeSet<&str> = member_ids.into_iter().map(|id| id.as_str()).collect();
    if members.is_empty() {
        return Err(Error::Validation("a channel needs at least one member".into()));
    }
    if members.iter().any(|id| id.trim().is_empty()) {
        return Err(Error::Validation("member ids must not be blank".into()));
    }

    let joined = members.into_iter().collect::<Vec<_>>().join(",");
    let pre_image = match (name, owner_id) {
        (None, None) => format!("direct-message:{}", joined),
        (Some(name), None) => format!("text-channel:{}:{}", name, joined),
        (Some(name), Some(owner)) => format!("text-channel:{}:{}:{}", name, owner, joined),
        (None, Some(_)) => {
            return Err(Error::Validation("an owner can only be keyed with a name".into()));
        }
    };

    Ok(ChannelKey::from_hex(hex::encode(Sha256::digest(pre_image.as_bytes()))))
}

/// Key of the direct-message channel between two distinct accounts.
pub fn derive_direct_message_key(a: &AccountId, b: &AccountId) -> Result<ChannelKey> {
    if a == b {
        return Err(Error::Validation("a direct message needs two distinct accounts".into()));
    }
    derive_channel_key([a, b], None, None)
}
