//! IAM policy document edits
//!
//! Read-modify-write helpers shared by the project/secret policy bindings
//! and the bucket grants. Policies are edited structurally so unrelated
//! roles and members survive untouched, and the etag returned by the get
//! call rides along into the set call for optimistic concurrency.

use serde_json::{json, Value};

/// True when `member` already holds `role` in the policy.
pub(super) fn has_member(policy: &Value, role: &str, member: &str) -> bool {
    policy
        .get("bindings")
        .and_then(Value::as_array)
        .is_some_and(|bindings| {
            bindings.iter().any(|b| {
                b.get("role").and_then(Value::as_str) == Some(role)
                    && b.get("members")
                        .and_then(Value::as_array)
                        .is_some_and(|m| m.iter().any(|v| v.as_str() == Some(member)))
            })
        })
}

/// Add `member` to `role`, preserving everything else in the document.
pub(super) fn with_member(policy: Value, role: &str, member: &str) -> Value {
    let mut root = match policy {
        Value::Object(map) => map,
        _ => serde_json::Map::new(),
    };
    let mut bindings = match root.remove("bindings") {
        Some(Value::Array(list)) => list,
        _ => Vec::new(),
    };

    let mut inserted = false;
    for binding in bindings.iter_mut() {
        if binding.get("role").and_then(Value::as_str) == Some(role) {
            match binding.get_mut("members").and_then(Value::as_array_mut) {
                Some(members) => members.push(Value::String(member.to_string())),
                None => binding["members"] = json!([member]),
            }
            inserted = true;
            break;
        }
    }
    if !inserted {
        bindings.push(json!({ "role": role, "members": [member] }));
    }

    root.insert("bindings".to_string(), Value::Array(bindings));
    Value::Object(root)
}

/// Remove `member` from `role`, dropping the binding if it empties.
pub(super) fn without_member(mut policy: Value, role: &str, member: &str) -> Value {
    if let Some(bindings) = policy.get_mut("bindings").and_then(Value::as_array_mut) {
        for binding in bindings.iter_mut() {
            if binding.get("role").and_then(Value::as_str) == Some(role) {
                if let Some(members) = binding.get_mut("members").and_then(Value::as_array_mut) {
                    members.retain(|m| m.as_str() != Some(member));
                }
            }
        }
        bindings.retain(|b| {
            b.get("members")
                .and_then(Value::as_array)
                .is_some_and(|m| !m.is_empty())
        });
    }
    policy
}

#[cfg(test)]
mod tests {
    use super::*;

    const MEMBER: &str = "serviceAccount:runner@p.iam.gserviceaccount.com";
    const ROLE: &str = "roles/cloudsql.client";

    #[test]
    fn grant_and_revoke_roundtrip() {
        let policy = json!({ "etag": "abc", "bindings": [] });

        assert!(!has_member(&policy, ROLE, MEMBER));
        let granted = with_member(policy, ROLE, MEMBER);
        assert!(has_member(&granted, ROLE, MEMBER));
        // The etag survives the edit
        assert_eq!(granted["etag"].as_str(), Some("abc"));

        let revoked = without_member(granted, ROLE, MEMBER);
        assert!(!has_member(&revoked, ROLE, MEMBER));
        assert!(revoked["bindings"].as_array().unwrap().is_empty());
    }

    #[test]
    fn regranting_reuses_the_role_binding() {
        let granted = with_member(json!({}), ROLE, MEMBER);
        let granted_twice = with_member(granted.clone(), ROLE, MEMBER);
        assert_eq!(
            granted_twice["bindings"].as_array().unwrap().len(),
            granted["bindings"].as_array().unwrap().len()
        );
    }

    #[test]
    fn revoking_preserves_other_members() {
        let other = "serviceAccount:b@p.iam.gserviceaccount.com";
        let policy = json!({
            "bindings": [{ "role": ROLE, "members": [MEMBER, other] }]
        });
        let revoked = without_member(policy, ROLE, MEMBER);
        assert!(has_member(&revoked, ROLE, other));
        assert!(!has_member(&revoked, ROLE, MEMBER));
    }

    #[test]
    fn unrelated_roles_survive_edits() {
        let policy = json!({
            "bindings": [{ "role": "roles/viewer", "members": ["user:someone@example.com"] }]
        });
        let granted = with_member(policy, ROLE, MEMBER);
        assert!(has_member(&granted, "roles/viewer", "user:someone@example.com"));
        let revoked = without_member(granted, ROLE, MEMBER);
        assert!(has_member(&revoked, "roles/viewer", "user:someone@example.com"));
    }
}
