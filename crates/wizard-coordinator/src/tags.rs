// Copyright (C) 2025 The Wizard Pipeline Authors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! `@name` mentions in comments.

use std::collections::BTreeSet;

use tracing::{debug, warn};

use crate::catalog::InstanceKind;
use crate::error::Result;
use crate::events::Events;

/// Mention addressing every project member.
pub const TAG_ALL: &str = "all";

/// Names mentioned in `comment`, in order of first appearance, without duplicates.
pub fn mentions(comment: &str) -> Vec<String> {
    let mut seen = BTreeSet::new();
    comment
        .split_whitespace()
        .filter_map(|word| word.strip_prefix('@'))
        .map(|name| name.replace('@', ""))
        .filter(|name| !name.is_empty())
        .filter(|name| seen.insert(name.clone()))
        .collect()
}

/// Write one `tag` event per mentioned project member (and one for `@all`).
///
/// Returns the names that were tagged. A mention of an unknown user or of
/// someone outside the project is ignored.
pub async fn analyse_comment(
    events: &Events,
    comment: &str,
    kind: InstanceKind,
    id: i64,
) -> Result<Vec<String>> {
    let names = mentions(comment);
    if names.is_empty() {
        return Ok(Vec::new());
    }

    let catalog = events.catalog();
    let users = catalog.users().await?;
    let members = catalog.project_settings().await?.users_ids;

    let mut tagged = Vec::new();
    for name in names {
        let member = users
            .iter()
            .find(|u| u.user_name == name)
            .map(|u| members.contains(&u.id));
        match member {
            Some(true) => {}
            Some(false) => {
                debug!(user = %name, "Mentioned user is not a project member");
                continue;
            }
            None if name == TAG_ALL => {}
            None => {
                debug!(user = %name, "Mention does not name a user");
                continue;
            }
        }
        match events.add_tag_event(kind, id, comment, &name).await {
            Ok(_) => tagged.push(name),
            Err(e) => warn!(user = %name, error = %e, "Failed to write tag event"),
        }
    }
    Ok(tagged)
}
