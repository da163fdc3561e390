//! Nickname → identity resolution.
//!
//! An [`AliasResolver`] owns the in-memory view of every [`Identity`] and
//! its nicknames. It is constructed explicitly (from the store at startup,
//! or empty in tests) and passed by reference to whoever needs it; there
//! is no global instance.
//!
//! Invariant: a lowercased nickname maps to at most one identity. Every
//! mutating operation checks it before touching state, so a rejected
//! operation leaves the resolver unchanged.
//!
//! Resolution order for a free-text token:
//!
//! 1. nickname (exact, case-insensitive)
//! 2. display name (exact, case-insensitive)
//! 3. identity id (exact, case-insensitive)
//! 4. unique partial display-name match (tokens of 3+ characters)
//!
//! Anything else is [`RecallError::NotFound`] carrying edit-distance
//! suggestions, so callers ask for clarification instead of guessing.

use std::collections::{BTreeMap, HashMap};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use serde::Serialize;

use crate::error::{RecallError, Result};
use crate::models::Identity;

/// Max edit distance for a suggestion.
const MAX_SUGGESTION_DISTANCE: usize = 2;

#[derive(Default)]
struct AliasState {
    identities: BTreeMap<String, Identity>,
    /// lowercased nickname → identity id
    nicknames: HashMap<String, String>,
}

/// Outcome of a bulk [`AliasResolver::seed`].
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SeedReport {
    pub added: usize,
    pub unchanged: usize,
    pub conflicts: Vec<String>,
    /// Identities that had to be created as placeholders.
    pub created: Vec<String>,
}

/// Injectable alias resolver.
#[derive(Default)]
pub struct AliasResolver {
    state: RwLock<AliasState>,
}

fn normalize_nickname(nickname: &str) -> String {
    nickname.trim().trim_start_matches('@').trim().to_lowercase()
}

impl AliasResolver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a resolver from stored identities.
    ///
    /// Fails with [`RecallError::Conflict`] if two identities claim the same
    /// nickname.
    pub fn from_identities(identities: impl IntoIterator<Item = Identity>) -> Result<Self> {
        let mut state = AliasState::default();
        for identity in identities {
            for nick in &identity.nicknames {
                let key = normalize_nickname(nick);
                if let Some(owner) = state.nicknames.get(&key) {
                    if owner != &identity.identity_id {
                        return Err(RecallError::Conflict {
                            nickname: key,
                            bound_to: owner.clone(),
                        });
                    }
                }
                state.nicknames.insert(key, identity.identity_id.clone());
            }
            state
                .identities
                .insert(identity.identity_id.clone(), identity);
        }
        Ok(Self {
            state: RwLock::new(state),
        })
    }

    fn read(&self) -> RwLockReadGuard<'_, AliasState> {
        self.state.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, AliasState> {
        self.state.write().unwrap_or_else(|e| e.into_inner())
    }

    /// Register a sender seen in the export, or refresh its display name.
    ///
    /// Returns the identity when something changed and needs persisting.
    pub fn observe_sender(&self, identity_id: &str, display_name: &str) -> Option<Identity> {
        let mut state = self.write();
        match state.identities.get_mut(identity_id) {
            Some(existing) => {
                if existing.display_name == display_name || display_name.trim().is_empty() {
                    None
                } else {
                    existing.display_name = display_name.to_string();
                    Some(existing.clone())
                }
            }
            None => {
                let name = if display_name.trim().is_empty() {
                    identity_id
                } else {
                    display_name
                };
                let identity = Identity::new(identity_id, name);
                state
                    .identities
                    .insert(identity_id.to_string(), identity.clone());
                Some(identity)
            }
        }
    }

    pub fn identity(&self, identity_id: &str) -> Option<Identity> {
        self.read().identities.get(identity_id).cloned()
    }

    pub fn identities(&self) -> Vec<Identity> {
        self.read().identities.values().cloned().collect()
    }

    /// Display name for attribution; falls back to the id.
    pub fn display_name(&self, identity_id: &str) -> String {
        self.read()
            .identities
            .get(identity_id)
            .map(|i| i.display_name.clone())
            .unwrap_or_else(|| identity_id.to_string())
    }

    /// Exact lookup (steps 1–3). Inactive identities never match.
    pub fn lookup_exact(&self, token: &str) -> Option<String> {
        let key = normalize_nickname(token);
        if key.is_empty() {
            return None;
        }
        let state = self.read();
        let active = |id: &str| state.identities.get(id).map(|i| i.active).unwrap_or(false);

        if let Some(id) = state.nicknames.get(&key) {
            if active(id) {
                return Some(id.clone());
            }
        }
        state
            .identities
            .values()
            .filter(|i| i.active)
            .find(|i| i.display_name.to_lowercase() == key)
            .or_else(|| {
                state
                    .identities
                    .values()
                    .filter(|i| i.active)
                    .find(|i| i.identity_id.to_lowercase() == key)
            })
            .map(|i| i.identity_id.clone())
    }

    /// Match an inflected form of a nickname ("гуся", "гусем" for "гусь").
    ///
    /// The nickname must be 4+ characters; its last character is dropped to
    /// form a stem, the token must start with the stem and be at most two
    /// characters longer than the nickname. Only a unique match counts.
    pub fn lookup_inflected(&self, token: &str) -> Option<String> {
        let key = normalize_nickname(token);
        let key_len = key.chars().count();
        if key_len < 3 {
            return None;
        }
        let state = self.read();
        let mut found: Option<&String> = None;
        for (nick, owner) in &state.nicknames {
            let nick_len = nick.chars().count();
            if nick_len < 4 || key_len > nick_len + 2 {
                continue;
            }
            let stem: String = nick.chars().take(nick_len - 1).collect();
            if !key.starts_with(&stem) {
                continue;
            }
            if !state.identities.get(owner).map(|i| i.active).unwrap_or(false) {
                continue;
            }
            match found {
                Some(prev) if prev != owner => return None,
                _ => found = Some(owner),
            }
        }
        found.cloned()
    }

    /// Resolve a free-text name token to an identity id.
    pub fn resolve(&self, token: &str) -> Result<String> {
        if let Some(id) = self.lookup_exact(token) {
            return Ok(id);
        }

        let key = normalize_nickname(token);
        if key.chars().count() >= 3 {
            let state = self.read();
            let partial: Vec<&Identity> = state
                .identities
                .values()
                .filter(|i| i.active && i.display_name.to_lowercase().contains(&key))
                .collect();
            if partial.len() == 1 {
                return Ok(partial[0].identity_id.clone());
            }
        }

        Err(RecallError::NotFound {
            what: "identity",
            key: token.trim().to_string(),
            suggestions: self.suggest(token),
        })
    }

    /// Bind `nickname` to `identity_id`.
    ///
    /// Binding a nickname that already points at the same identity is a
    /// no-op. Returns the updated identity for persistence.
    pub fn add_alias(&self, identity_id: &str, nickname: &str) -> Result<Identity> {
        let key = normalize_nickname(nickname);
        if key.is_empty() {
            return Err(RecallError::MalformedInput("empty nickname".into()));
        }

        let mut state = self.write();
        if !state.identities.contains_key(identity_id) {
            return Err(RecallError::not_found("identity", identity_id));
        }
        if let Some(owner) = state.nicknames.get(&key) {
            if owner != identity_id {
                return Err(RecallError::Conflict {
                    nickname: key,
                    bound_to: owner.clone(),
                });
            }
        }

        state.nicknames.insert(key.clone(), identity_id.to_string());
        let identity = state
            .identities
            .get_mut(identity_id)
            .ok_or_else(|| RecallError::not_found("identity", identity_id))?;
        identity.nicknames.insert(key);
        Ok(identity.clone())
    }

    /// Unbind `nickname`. Returns the identity it was removed from.
    pub fn remove_alias(&self, nickname: &str) -> Result<Identity> {
        let key = normalize_nickname(nickname);
        let mut state = self.write();
        let owner = state
            .nicknames
            .remove(&key)
            .ok_or_else(|| RecallError::not_found("nickname", key.clone()))?;
        let identity = state
            .identities
            .get_mut(&owner)
            .ok_or_else(|| RecallError::not_found("identity", owner.clone()))?;
        identity.nicknames.remove(&key);
        Ok(identity.clone())
    }

    /// Current nickname → identity id mapping, sorted by nickname.
    pub fn list_aliases(&self) -> BTreeMap<String, String> {
        self.read()
            .nicknames
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    /// Bulk-add predefined aliases.
    ///
    /// Already-bound pairs are counted as unchanged. Conflicts are reported
    /// and skipped; they never abort the rest of the seed. Unknown identities
    /// are created with their id as display name.
    pub fn seed<'a, I, N>(&self, entries: I) -> (SeedReport, Vec<Identity>)
    where
        I: IntoIterator<Item = (&'a str, N)>,
        N: IntoIterator<Item = &'a str>,
    {
        let mut report = SeedReport::default();
        let mut touched: BTreeMap<String, Identity> = BTreeMap::new();

        for (identity_id, nicknames) in entries {
            if self.identity(identity_id).is_none() {
                if let Some(created) = self.observe_sender(identity_id, identity_id) {
                    report.created.push(identity_id.to_string());
                    touched.insert(identity_id.to_string(), created);
                }
            }
            for nickname in nicknames {
                let key = normalize_nickname(nickname);
                let already = self.read().nicknames.get(&key).cloned();
                match already {
                    Some(owner) if owner == identity_id => report.unchanged += 1,
                    _ => match self.add_alias(identity_id, nickname) {
                        Ok(identity) => {
                            report.added += 1;
                            touched.insert(identity_id.to_string(), identity);
                        }
                        Err(e) => report.conflicts.push(e.to_string()),
                    },
                }
            }
        }

        (report, touched.into_values().collect())
    }

    /// Mark an identity inactive. Its quotes keep their attribution.
    pub fn deactivate(&self, identity_id: &str) -> Result<Identity> {
        let mut state = self.write();
        let identity = state
            .identities
            .get_mut(identity_id)
            .ok_or_else(|| RecallError::not_found("identity", identity_id))?;
        identity.active = false;
        Ok(identity.clone())
    }

    /// Close matches for `token` among nicknames and display names.
    pub fn suggest(&self, token: &str) -> Vec<String> {
        let key = normalize_nickname(token);
        if key.is_empty() {
            return Vec::new();
        }
        let limit = if key.chars().count() <= 4 {
            1
        } else {
            MAX_SUGGESTION_DISTANCE
        };

        let state = self.read();
        let mut scored: Vec<(usize, String)> = state
            .nicknames
            .keys()
            .cloned()
            .chain(
                state
                    .identities
                    .values()
                    .filter(|i| i.active)
                    .map(|i| i.display_name.clone()),
            )
            .filter_map(|candidate| {
                let d = levenshtein(&key, &candidate.to_lowercase());
                (d <= limit).then_some((d, candidate))
            })
            .collect();
        scored.sort();
        scored.dedup_by(|a, b| a.1 == b.1);
        scored.into_iter().take(3).map(|(_, c)| c).collect()
    }
}

/// Character-level Levenshtein distance.
pub fn levenshtein(a: &str, b: &str) -> usize {
    let a: Vec<char> = a.chars().collect();
    let b: Vec<char> = b.chars().collect();
    let mut prev: Vec<usize> = (0..=b.len()).collect();
    let mut cur = vec![0; b.len() + 1];
    for (i, ca) in a.iter().enumerate() {
        cur[0] = i + 1;
        for (j, cb) in b.iter().enumerate() {
            let cost = usize::from(ca != cb);
            cur[j + 1] = (prev[j] + cost).min(prev[j + 1] + 1).min(cur[j] + 1);
        }
        std::mem::swap(&mut prev, &mut cur);
    }
    prev[b.len()]
}
