//! Pluggable user message codec.
//!
//! The transport core never knows what a game's messages look like. A
//! `Protocol` implementation owns the mapping between a stable integer tag
//! (carried on the wire in [`crate::frame::DataBody::message_tag`]) and the
//! application's typed message values, plus how to encode/decode a payload
//! for a given tag. See spec section 9's discussion of tagged-variant message
//! families.

use std::collections::HashMap;

/// Encodes and decodes one application's message family.
///
/// `M` is the decoded message type the application works with — typically an
/// enum with one variant per message kind. The transport core is generic over
/// `Protocol` and never constructs or inspects `M` itself.
pub trait Protocol: Send + Sync + 'static {
    /// The decoded message type this protocol produces.
    type Message: Send + Sync;

    /// The stable tag for a message value, used to route it through the dispatcher
    /// and to select the `Data` packet's `message_tag` field on send.
    fn tag_of(&self, message: &Self::Message) -> u16;

    /// Encode a message value to its wire payload.
    fn encode(&self, message: &Self::Message) -> Vec<u8>;

    /// Decode a wire payload for the given tag back into a message value.
    ///
    /// # Errors
    ///
    /// Returns a description of the failure if `payload` does not decode
    /// cleanly for `tag`.
    fn decode(&self, tag: u16, payload: &[u8]) -> Result<Self::Message, String>;
}

/// Assigns stable tags to named message types deterministically, by sorting
/// names lexicographically — the ordering spec section 9 calls out so two
/// builds of the same protocol always agree on tag assignment without an
/// explicit registry file.
#[derive(Debug, Default)]
pub struct TagRegistry {
    tags_by_name: HashMap<String, u16>,
    names_by_tag: HashMap<u16, String>,
}

impl TagRegistry {
    /// Build a registry from message type names, assigning tags `0..names.len()`
    /// in sorted order.
    #[must_use]
    pub fn from_names(names: impl IntoIterator<Item = impl Into<String>>) -> Self {
        let mut sorted: Vec<String> = names.into_iter().map(Into::into).collect();
        sorted.sort();
        sorted.dedup();

        let mut tags_by_name = HashMap::with_capacity(sorted.len());
        let mut names_by_tag = HashMap::with_capacity(sorted.len());
        for (tag, name) in sorted.into_iter().enumerate() {
            let tag = tag as u16;
            names_by_tag.insert(tag, name.clone());
            tags_by_name.insert(name, tag);
        }
        Self {
            tags_by_name,
            names_by_tag,
        }
    }

    /// Look up the tag for a message type name.
    #[must_use]
    pub fn tag_of(&self, name: &str) -> Option<u16> {
        self.tags_by_name.get(name).copied()
    }

    /// Look up the message type name for a tag.
    #[must_use]
    pub fn name_of(&self, tag: u16) -> Option<&str> {
        self.names_by_tag.get(&tag).map(String::as_str)
    }
}
