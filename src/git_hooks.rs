//! Input of the git `pre-receive`/`post-receive` hooks.
//!
//! git feeds one line per updated ref on stdin:
//!
//! ```text
//! <old-value> SP <new-value> SP <ref-name> LF
//! ```

use serde::Serialize;

use crate::errors::{LifecycleError, Result};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RefUpdate {
    pub old: String,
    pub new: String,
    pub name: String,
}

impl RefUpdate {
    pub fn is_create(&self) -> bool {
        is_zero(&self.old)
    }

    pub fn is_delete(&self) -> bool {
        is_zero(&self.new)
    }

    /// True if this update moves `refs/heads/<branch>`.
    pub fn updates_branch(&self, branch: &str) -> bool {
        self.name
            .strip_prefix("refs/heads/")
            .is_some_and(|b| b == branch)
    }
}

/// The all-zero id git uses for a missing ref, in either hash format.
fn is_zero(value: &str) -> bool {
    is_object_id(value) && value.bytes().all(|b| b == b'0')
}

fn is_object_id(value: &str) -> bool {
    // sha1 or sha256 repositories
    matches!(value.len(), 40 | 64) && value.bytes().all(|b| b.is_ascii_hexdigit())
}

/// Parse hook stdin. Blank lines are ignored; anything else that is not
/// `<old> <new> <ref>` is an error naming the 1-based line.
pub fn parse_ref_updates(input: &str) -> Result<Vec<RefUpdate>> {
    let mut updates = Vec::new();
    for (idx, raw) in input.lines().enumerate() {
        let line = raw.trim();
        if line.is_empty() {
            continue;
        }
        let invalid = || LifecycleError::InvalidRefUpdate {
            line: idx + 1,
            content: raw.to_string(),
        };

        let mut fields = line.split_whitespace();
        let (Some(old), Some(new), Some(name), None) =
            (fields.next(), fields.next(), fields.next(), fields.next())
        else {
            return Err(invalid());
        };
        if !is_object_id(old) || !is_object_id(new) {
            return Err(invalid());
        }

        updates.push(RefUpdate {
            old: old.to_string(),
            new: new.to_string(),
            name: name.to_string(),
        });
    }
    Ok(updates)
}
