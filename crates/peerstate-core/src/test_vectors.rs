//! Test vectors for cross-implementation validation
//!
//! These vectors MUST be reproduced exactly by any other implementation
//! that talks to peerstate nodes.

use crate::canonical::canonical_bytes;
use crate::crypto::*;
use crate::types::*;
use serde::Serialize;

/// Test vector output format (JSON serializable)
#[derive(Serialize)]
pub struct TestVector {
    pub name: String,
    pub description: String,
    pub inputs: serde_json::Value,
    pub canonical_bytes_hex: String,
    pub hash_hex: String,
}

/// Generate all test vectors as JSON
pub fn generate_test_vectors() -> Vec<TestVector> {
    vec![
        content_hash_vector(),
        empty_block_vector(),
        state_sign_bytes_vector(),
        state_message_encoding_vector(),
    ]
}

fn content_hash_vector() -> TestVector {
    let bytes = b"peerstate block alpha";
    TestVector {
        name: "content_hash".into(),
        description: "ContentHash = BLAKE3(\"block\" || bytes)".into(),
        inputs: serde_json::json!({ "bytes_hex": hex::encode(bytes) }),
        canonical_bytes_hex: hex::encode(bytes),
        hash_hex: hex::encode(content_hash(bytes).0),
    }
}

fn empty_block_vector() -> TestVector {
    TestVector {
        name: "content_hash_empty".into(),
        description: "ContentHash of the empty block".into(),
        inputs: serde_json::json!({ "bytes_hex": "" }),
        canonical_bytes_hex: String::new(),
        hash_hex: hex::encode(content_hash(&[]).0),
    }
}

fn state_sign_bytes_vector() -> TestVector {
    let sender = NodeAddress([0x11; 32]);
    let root = ContentHash([0x22; 32]);
    let sequence = 7;
    let bytes = state_sign_bytes(&sender, sequence, &root);

    TestVector {
        name: "state_sign_bytes".into(),
        description: "\"state-msg\" || sender || sequence_le || root_hash".into(),
        inputs: serde_json::json!({
            "sender": sender.to_string(),
            "sequence": sequence,
            "root_hash": root.to_string(),
        }),
        canonical_bytes_hex: hex::encode(&bytes),
        hash_hex: hex::encode(blake3::hash(&bytes).as_bytes()),
    }
}

fn state_message_encoding_vector() -> TestVector {
    let msg = StateMessage {
        sender: NodeAddress([0x11; 32]),
        sequence: 300,
        root_hash: ContentHash([0x22; 32]),
        signature: vec![0x33; 64],
    };
    let bytes = canonical_bytes(&msg).unwrap();

    TestVector {
        name: "state_message_encoding".into(),
        description: "postcard(StateMessage)".into(),
        inputs: serde_json::json!({
            "sender": msg.sender.to_string(),
            "sequence": msg.sequence,
            "root_hash": msg.root_hash.to_string(),
            "signature_hex": hex::encode(&msg.signature),
        }),
        canonical_bytes_hex: hex::encode(&bytes),
        hash_hex: hex::encode(blake3::hash(&bytes).as_bytes()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_vectors_are_stable() {
        let first = serde_json::to_string(&generate_test_vectors()).unwrap();
        let second = serde_json::to_string(&generate_test_vectors()).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_sign_bytes_layout() {
        let vector = state_sign_bytes_vector();
        // 9 domain bytes + 32 sender + 8 sequence + 32 root
        assert_eq!(vector.canonical_bytes_hex.len(), (9 + 32 + 8 + 32) * 2);
        assert!(vector.canonical_bytes_hex.starts_with(&hex::encode(b"state-msg")));
    }

    #[test]
    fn test_message_encoding_uses_varint_sequence() {
        let vector = state_message_encoding_vector();
        let bytes = hex::decode(&vector.canonical_bytes_hex).unwrap();
        // 32 sender bytes, then varint(300) = [0xac, 0x02]
        assert_eq!(&bytes[32..34], &[0xac, 0x02]);
    }
}
