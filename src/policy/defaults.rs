//! Stock logging policies every node runs.

use super::registry::{ChangeContext, ChangeKind, LoggingPolicyRegistry};
use crate::task::types::{FieldValue, LogName, TaskDraft};

use std::collections::HashSet;

/// Log drained towards the other web-farm nodes.
pub const WEBFARM_LOG: &str = "webfarm";

/// Prefix of the per-server staging logs.
pub const STAGING_LOG_PREFIX: &str = "staging:";

pub fn staging_log_name(server: &str) -> LogName {
    format!("{}{}", STAGING_LOG_PREFIX, server)
}

pub fn invalidate_object_draft(context: &ChangeContext) -> TaskDraft {
    TaskDraft::new("invalidate-object")
        .object_type(context.object_type.clone())
        .field("object_type", context.object_type.as_str())
        .field("object_id", context.object_id.as_str())
        .field("kind", context.kind.as_str())
        .title(format!(
            "Invalidate {} '{}'",
            context.object_type, context.object_id
        ))
}

pub fn staging_draft(context: &ChangeContext) -> TaskDraft {
    match context.kind {
        ChangeKind::Delete => TaskDraft::new("delete-object")
            .object_type(context.object_type.clone())
            .field("object_id", context.object_id.as_str())
            .title(format!(
                "Delete {} '{}'",
                context.object_type, context.object_id
            )),
        ChangeKind::Create | ChangeKind::Update => {
            let mut draft = TaskDraft::new("upsert-object")
                .object_type(context.object_type.clone())
                .field("object_id", context.object_id.as_str())
                .field("fields", FieldValue::Map(context.fields.fields.clone()))
                .title(format!(
                    "Update {} '{}'",
                    context.object_type, context.object_id
                ));
            if let Some(binary) = &context.binary {
                draft = draft.binary(binary.clone());
            }
            draft
        }
    }
}

/// Registers the web-farm invalidation policy and one staging policy per server.
///
/// Only changes whose object type is listed in `staged_object_types` are staged.
pub fn register_default_policies(
    registry: &LoggingPolicyRegistry,
    staging_servers: &[String],
    staged_object_types: &[String],
) {
    registry.register(
        "webfarm-invalidate",
        WEBFARM_LOG,
        |_| true,
        |context| Ok(vec![invalidate_object_draft(context)]),
    );

    let staged: HashSet<String> = staged_object_types.iter().cloned().collect();
    for server in staging_servers {
        let staged = staged.clone();
        registry.register(
            &format!("staging-{}", server),
            staging_log_name(server),
            move |context| staged.contains(&context.object_type),
            |context| Ok(vec![staging_draft(context)]),
        );
    }
}
