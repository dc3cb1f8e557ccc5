//! Task Model Tests
//!
//! ## Test Scopes
//! - **Drafts**: Builder defaults and stamping a draft into an immutable task.
//! - **Payload**: Typed accessors on the schema-less payload.
//! - **Wire Format**: Envelope round-trips, including empty and large binary attachments.

#[cfg(test)]
mod tests {
    use crate::task::codec::{
        CodecError, WIRE_VERSION, decode_envelope, decode_task, encode_envelope, encode_task,
    };
    use crate::task::types::*;

    fn sample_task(binary: Option<Vec<u8>>) -> Task {
        let draft = TaskDraft::new("upsert-object")
            .object_type("cms.page")
            .field("id", "page-42")
            .field("revision", 7i64)
            .field("published", true)
            .field("weight", 0.25f64)
            .title("Update page /home")
            .group(TaskGroupId("group-1".to_string()))
            .created_at(1_700_000_000_000);

        let draft = match binary {
            Some(bytes) => draft.binary(bytes),
            None => draft,
        };

        draft.into_task(12, &NodeId::named("node-a"))
    }

    // ============================================================
    // TEST 1: Drafts
    // ============================================================

    #[test]
    fn test_draft_defaults_title_to_task_type() {
        let draft = TaskDraft::new("clear-cache");

        assert_eq!(draft.title, "clear-cache");
        assert!(draft.object_type.is_none());
        assert!(draft.payload.is_empty());
        assert!(draft.created_at > 0);
    }

    #[test]
    fn test_into_task_stamps_id_and_local_source() {
        let task = TaskDraft::new("clear-cache").into_task(5, &NodeId::named("node-a"));

        assert_eq!(task.id, 5);
        assert_eq!(task.source_node, NodeId::named("node-a"));
    }

    #[test]
    fn test_into_task_keeps_explicit_source() {
        let task = TaskDraft::new("clear-cache")
            .source(NodeId::named("origin"))
            .into_task(1, &NodeId::named("relay"));

        assert_eq!(task.source_node, NodeId::named("origin"));
    }

    #[test]
    fn test_draft_from_task_preserves_provenance() {
        let task = sample_task(Some(vec![1, 2, 3]));
        let draft = TaskDraft::from(&task);

        let replayed = draft.into_task(99, &NodeId::named("other"));
        assert_eq!(replayed.id, 99);
        assert_eq!(replayed.source_node, task.source_node);
        assert_eq!(replayed.payload, task.payload);
        assert_eq!(replayed.binary_payload, task.binary_payload);
        assert_eq!(replayed.group, task.group);
    }

    #[test]
    fn test_group_ids_are_unique() {
        assert_ne!(TaskGroupId::new(), TaskGroupId::new());
        let group = TaskGroup::new("release-1", "Spring release");
        assert_eq!(group.code_name, "release-1");
    }

    // ============================================================
    // TEST 2: Payload accessors
    // ============================================================

    #[test]
    fn test_payload_typed_accessors() {
        let payload = TaskPayload::new()
            .with("name", "home")
            .with("count", 3i64)
            .with("flag", false);

        assert_eq!(payload.text("name"), Some("home"));
        assert_eq!(payload.int("count"), Some(3));
        assert_eq!(payload.bool("flag"), Some(false));
        // Wrong type is not coerced
        assert_eq!(payload.text("count"), None);
        assert_eq!(payload.len(), 3);
    }

    #[test]
    fn test_payload_json_shape_is_stable() {
        let payload = TaskPayload::new().with("b", "x").with("a", 1i64);
        let json = serde_json::to_string(&payload).unwrap();

        // Sorted by field name
        assert_eq!(json, r#"{"fields":{"a":{"Int":1},"b":{"Text":"x"}}}"#);
    }

    // ============================================================
    // TEST 3: Wire format
    // ============================================================

    #[test]
    fn test_envelope_round_trip_without_attachment() {
        let envelope = TaskEnvelope {
            log: "webfarm".to_string(),
            task: sample_task(None),
        };

        let bytes = encode_envelope(&envelope).unwrap();
        assert_eq!(bytes[0], WIRE_VERSION);

        let restored = decode_envelope(&bytes).unwrap();
        assert_eq!(restored, envelope);
    }

    #[test]
    fn test_envelope_round_trip_with_empty_attachment() {
        let envelope = TaskEnvelope {
            log: "staging:prod".to_string(),
            task: sample_task(Some(Vec::new())),
        };

        let restored = decode_envelope(&encode_envelope(&envelope).unwrap()).unwrap();

        assert_eq!(restored, envelope);
        assert_eq!(restored.task.binary_payload, Some(Vec::new()));
    }

    #[test]
    fn test_envelope_round_trip_with_large_attachment() {
        // 2 MiB of non-uniform bytes
        let attachment: Vec<u8> = (0..2 * 1024 * 1024).map(|i| (i % 251) as u8).collect();
        let envelope = TaskEnvelope {
            log: "staging:prod".to_string(),
            task: sample_task(Some(attachment.clone())),
        };

        let bytes = encode_envelope(&envelope).unwrap();
        let restored = decode_envelope(&bytes).unwrap();

        assert_eq!(restored, envelope);
        assert_eq!(restored.task.binary_payload.as_deref(), Some(attachment.as_slice()));
        // Re-encoding yields the same bytes
        assert_eq!(encode_envelope(&restored).unwrap(), bytes);
    }

    #[test]
    fn test_nested_payload_round_trip() {
        let mut inner = std::collections::BTreeMap::new();
        inner.insert("culture".to_string(), FieldValue::from("en-US"));
        let mut task = sample_task(None);
        task.payload.insert(
            "nested",
            FieldValue::List(vec![FieldValue::Map(inner), FieldValue::Null]),
        );
        task.payload.insert("raw", vec![0u8, 255, 7]);

        let restored = decode_task(&encode_task(&task).unwrap()).unwrap();
        assert_eq!(restored, task);
    }

    #[test]
    fn test_decode_rejects_unknown_version() {
        let envelope = TaskEnvelope {
            log: "webfarm".to_string(),
            task: sample_task(None),
        };
        let mut bytes = encode_envelope(&envelope).unwrap();
        bytes[0] = 42;

        match decode_envelope(&bytes) {
            Err(CodecError::UnsupportedVersion(42)) => {}
            other => panic!("Expected version error, got {:?}", other),
        }
    }

    #[test]
    fn test_decode_rejects_empty_and_truncated_frames() {
        assert!(matches!(decode_envelope(&[]), Err(CodecError::Empty)));

        let envelope = TaskEnvelope {
            log: "webfarm".to_string(),
            task: sample_task(None),
        };
        let bytes = encode_envelope(&envelope).unwrap();
        let truncated = &bytes[..bytes.len() / 2];

        assert!(matches!(
            decode_envelope(truncated),
            Err(CodecError::Malformed(_))
        ));
    }
}
