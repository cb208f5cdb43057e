//! Core data models used throughout Atlas Relay.
//!
//! These types represent the conversations, messages, and citations that flow
//! through the streaming relay pipeline, plus the file-mapping snapshot used
//! for citation link resolution.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Who authored a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }

    pub fn parse(s: &str) -> Option<Role> {
        match s {
            "user" => Some(Role::User),
            "assistant" => Some(Role::Assistant),
            _ => None,
        }
    }
}

/// A source citation attached to an assistant message.
///
/// Ids are 1-based and densely assigned in first-seen order within one
/// message. The title is the only key the upstream service guarantees;
/// `source_uri` is filled in by the resolver when the title matches a
/// file-mapping entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Citation {
    pub id: u32,
    pub source_title: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source_uri: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
}

/// A persisted chat message.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: String,
    pub conversation_id: String,
    pub role: Role,
    pub content: String,
    pub citations: Vec<Citation>,
    /// Unix epoch seconds.
    pub created_at: i64,
}

/// A conversation owned by one identity.
///
/// The title is `None` until the first turn completes and the automatic
/// title generation step fills it in; users may rename it afterward.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Conversation {
    pub id: String,
    pub owner: String,
    pub title: Option<String>,
    pub created_at: i64,
    pub updated_at: i64,
}

/// One entry of the file-mapping document produced by the sync tooling.
///
/// The mapping document is a single JSON object keyed by canonical source
/// path (`"Folder/Report.pdf"`), with values in this shape.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MappingEntry {
    pub file_name: String,
    pub source_path: String,
    pub share_point_url: String,
}

/// The full file mapping, treated as an immutable snapshot per TTL window.
pub type FileMapping = HashMap<String, MappingEntry>;
