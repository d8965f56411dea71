// Wire messages exchanged between repos
//
// All of these travel as JSON with a "type" tag.

use crate::clock::Clock;
use crate::keys::{DiscoveryId, DocId};
use serde::{Deserialize, Serialize};

/// Replication channel: which feeds a peer is willing to share
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ReplicationMsg {
    DiscoveryIds {
        #[serde(rename = "discoveryIds")]
        discovery_ids: Vec<DiscoveryId>,
    },
}

/// Repo channel messages
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum RepoMsg {
    CursorMessage(CursorMessage),
    DocumentMessage(DocumentMessage),
}

/// A peer's cursors and clocks for a set of documents
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CursorMessage {
    pub cursors: Vec<DocCursor>,
    pub clocks: Vec<DocClock>,
}

impl CursorMessage {
    pub fn is_empty(&self) -> bool {
        self.cursors.is_empty() && self.clocks.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocCursor {
    #[serde(rename = "docId")]
    pub doc_id: DocId,
    pub cursor: Clock,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocClock {
    #[serde(rename = "docId")]
    pub doc_id: DocId,
    pub clock: Clock,
}

/// Ephemeral application message about one document. Not persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocumentMessage {
    pub id: DocId,
    pub contents: serde_json::Value,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::KeyPair;
    use serde_json::json;

    #[test]
    fn test_cursor_message_shape() {
        let doc: DocId = KeyPair::generate().feed_id().into();
        let actor = doc.root_actor();
        let msg = RepoMsg::CursorMessage(CursorMessage {
            cursors: vec![DocCursor {
                doc_id: doc,
                cursor: [(actor, crate::clock::INFINITY)].into_iter().collect(),
            }],
            clocks: vec![DocClock {
                doc_id: doc,
                clock: [(actor, 3)].into_iter().collect(),
            }],
        });

        let value = serde_json::to_value(&msg).unwrap();
        assert_eq!(value["type"], "CursorMessage");
        assert_eq!(value["cursors"][0]["docId"], doc.to_string());
        assert_eq!(value["clocks"][0]["clock"][actor.to_string()], 3);

        let back: RepoMsg = serde_json::from_value(value).unwrap();
        assert_eq!(back, msg);
    }

    #[test]
    fn test_document_message_shape() {
        let doc: DocId = KeyPair::generate().feed_id().into();
        let msg = RepoMsg::DocumentMessage(DocumentMessage {
            id: doc,
            contents: json!({"cursor": 4}),
        });
        let value = serde_json::to_value(&msg).unwrap();
        assert_eq!(
            value,
            json!({"type": "DocumentMessage", "id": doc.to_string(), "contents": {"cursor": 4}})
        );
    }

    #[test]
    fn test_discovery_ids_shape() {
        let did = KeyPair::generate().feed_id().discovery_id();
        let value = serde_json::to_value(ReplicationMsg::DiscoveryIds {
            discovery_ids: vec![did],
        })
        .unwrap();
        assert_eq!(value["type"], "DiscoveryIds");
        assert_eq!(value["discoveryIds"][0], did.to_string());
    }
}
