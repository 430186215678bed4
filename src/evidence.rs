//! Evidence assembly.
//!
//! Turns caller input into a bounded list of `(EvidenceId, value)` entries
//! for one search. Keys resolve through the open handle:
//!
//! - `accept-language` (any case) → accept-language category
//! - `clientside` (any case) → client-side properties category
//! - anything else → header-name lookup
//!
//! Keys the engine cannot resolve are dropped. Once the list holds
//! [`MAX_EVIDENCE`] entries, further input is dropped as well.
//!
//! Every entry owns a copy of its value. The list lives for exactly one
//! query and its buffers are freed when it goes out of scope, on the
//! success path and on every error path alike.

use serde::{Deserialize, Serialize};

use crate::engine::{AtlasHandle, EvidenceId};

/// Maximum number of evidence entries per query.
pub const MAX_EVIDENCE: usize = 26;

/// Header name used for the user-agent string.
pub const USER_AGENT_HEADER: &str = "user-agent";
/// Special key for the accept-language category.
pub const ACCEPT_LANGUAGE_KEY: &str = "accept-language";
/// Special key for client-side (client hint) properties.
pub const CLIENT_SIDE_KEY: &str = "clientside";

/// One resolved piece of evidence.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EvidenceEntry {
    /// Identifier resolved by the engine.
    pub id: EvidenceId,
    /// Owned evidence value.
    pub value: String,
}

impl EvidenceEntry {
    /// Create an entry.
    pub fn new(id: EvidenceId, value: impl Into<String>) -> Self {
        Self {
            id,
            value: value.into(),
        }
    }
}

/// Caller input for a property query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EvidenceInput {
    /// A user-agent string with optional secondary strings.
    ///
    /// `accept_language` is only consulted when `client_props` is present.
    UserAgent {
        /// User-agent header value.
        user_agent: String,
        /// Client-side properties string.
        client_props: Option<String>,
        /// Accept-Language header value.
        accept_language: Option<String>,
    },
    /// Arbitrary header-like key/value pairs, in caller order.
    Headers(Vec<(String, String)>),
}

impl EvidenceInput {
    /// Input carrying only a user-agent string.
    pub fn user_agent(user_agent: impl Into<String>) -> Self {
        Self::UserAgent {
            user_agent: user_agent.into(),
            client_props: None,
            accept_language: None,
        }
    }

    /// Input built from header pairs.
    pub fn headers<I, K, V>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        Self::Headers(pairs.into_iter().map(|(k, v)| (k.into(), v.into())).collect())
    }

    /// Attach client-side properties to a user-agent input.
    pub fn with_client_props(mut self, props: impl Into<String>) -> Self {
        if let Self::UserAgent { client_props, .. } = &mut self {
            *client_props = Some(props.into());
        }
        self
    }

    /// Attach an accept-language value to a user-agent input.
    pub fn with_accept_language(mut self, language: impl Into<String>) -> Self {
        if let Self::UserAgent { accept_language, .. } = &mut self {
            *accept_language = Some(language.into());
        }
        self
    }
}

/// Capacity-bounded evidence for one query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EvidenceList {
    entries: Vec<EvidenceEntry>,
    capacity: usize,
    dropped: usize,
}

impl EvidenceList {
    /// Empty list with the default capacity.
    pub fn new() -> Self {
        Self::with_capacity(MAX_EVIDENCE)
    }

    /// Empty list holding at most `capacity` entries.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            entries: Vec::with_capacity(capacity),
            capacity,
            dropped: 0,
        }
    }

    /// Append an entry. Returns `false` and drops it when full.
    pub fn push(&mut self, entry: EvidenceEntry) -> bool {
        if self.is_full() {
            self.dropped += 1;
            return false;
        }
        self.entries.push(entry);
        true
    }

    /// Entries in insertion order.
    pub fn as_slice(&self) -> &[EvidenceEntry] {
        &self.entries
    }

    /// Iterate over entries.
    pub fn iter(&self) -> std::slice::Iter<'_, EvidenceEntry> {
        self.entries.iter()
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the list is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Whether the list reached its capacity.
    pub fn is_full(&self) -> bool {
        self.entries.len() >= self.capacity
    }

    /// Maximum number of entries.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Entries refused because the list was full.
    pub fn dropped(&self) -> usize {
        self.dropped
    }
}

impl Default for EvidenceList {
    fn default() -> Self {
        Self::new()
    }
}

/// Resolve a caller key to an evidence identifier.
pub fn resolve_key<H: AtlasHandle + ?Sized>(handle: &H, key: &str) -> Option<EvidenceId> {
    if key.eq_ignore_ascii_case(ACCEPT_LANGUAGE_KEY) {
        handle.accept_language_evidence_id()
    } else if key.eq_ignore_ascii_case(CLIENT_SIDE_KEY) {
        handle.client_props_evidence_id()
    } else {
        handle.header_evidence_id(key)
    }
}

/// Build the evidence list for a query with the default capacity.
pub fn build_evidence<H: AtlasHandle + ?Sized>(handle: &H, input: &EvidenceInput) -> EvidenceList {
    build_evidence_with_capacity(handle, input, MAX_EVIDENCE)
}

/// Build the evidence list for a query.
pub fn build_evidence_with_capacity<H: AtlasHandle + ?Sized>(
    handle: &H,
    input: &EvidenceInput,
    capacity: usize,
) -> EvidenceList {
    let mut list = EvidenceList::with_capacity(capacity);

    match input {
        EvidenceInput::UserAgent {
            user_agent,
            client_props,
            accept_language,
        } => {
            push_resolved(&mut list, handle.header_evidence_id(USER_AGENT_HEADER), user_agent);
            if let Some(props) = client_props {
                push_resolved(&mut list, handle.client_props_evidence_id(), props);
                if let Some(language) = accept_language {
                    push_resolved(&mut list, handle.accept_language_evidence_id(), language);
                }
            }
        }
        EvidenceInput::Headers(pairs) => {
            for (index, (key, value)) in pairs.iter().enumerate() {
                if list.is_full() {
                    tracing::debug!(
                        capacity = list.capacity(),
                        dropped = pairs.len() - index,
                        "evidence list full, remaining keys dropped"
                    );
                    break;
                }
                match resolve_key(handle, key) {
                    Some(id) => {
                        list.push(EvidenceEntry::new(id, value.as_str()));
                    }
                    None => tracing::trace!(key = %key, "evidence key not supported, skipped"),
                }
            }
        }
    }

    list
}

fn push_resolved(list: &mut EvidenceList, id: Option<EvidenceId>, value: &str) {
    match id {
        Some(id) => {
            list.push(EvidenceEntry::new(id, value));
        }
        None => tracing::trace!("evidence category not supported, skipped"),
    }
}
